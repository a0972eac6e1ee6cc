use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Replica coordinates as they appear in schedule commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaDesc {
    pub store_uuid: String,
    pub shard_id: u64,
    pub replica_id: u64,
    pub epoch: u64,
}

impl std::fmt::Display for ReplicaDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.store_uuid, self.shard_id, self.replica_id, self.epoch
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleCommand {
    AddReplica {
        target: String,
        replica: ReplicaDesc,
        initial_members: BTreeMap<u64, String>,
    },
    StartReplica {
        target: String,
        replica: ReplicaDesc,
        initial_members: BTreeMap<u64, String>,
    },
    RemoveReplica {
        target: String,
        replica: ReplicaDesc,
    },
    StopReplica {
        target: String,
        replica: ReplicaDesc,
    },
    KillZombie {
        target: String,
        replica: ReplicaDesc,
    },
    ShutdownStore {
        target: String,
    },
}

impl ScheduleCommand {
    pub fn target(&self) -> &str {
        match self {
            ScheduleCommand::AddReplica { target, .. }
            | ScheduleCommand::StartReplica { target, .. }
            | ScheduleCommand::RemoveReplica { target, .. }
            | ScheduleCommand::StopReplica { target, .. }
            | ScheduleCommand::KillZombie { target, .. }
            | ScheduleCommand::ShutdownStore { target } => target,
        }
    }
}

impl std::fmt::Display for ScheduleCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduleCommand::AddReplica {
                target,
                replica,
                initial_members,
            } => write!(f, "dn/add {target} {replica} {initial_members:?}"),
            ScheduleCommand::StartReplica {
                target,
                replica,
                initial_members,
            } => write!(f, "dn/start {target} {replica} {initial_members:?}"),
            ScheduleCommand::RemoveReplica { target, replica } => {
                write!(f, "dn/remove {target} {replica}")
            }
            ScheduleCommand::StopReplica { target, replica } => {
                write!(f, "dn/stop {target} {replica}")
            }
            ScheduleCommand::KillZombie { target, replica } => {
                write!(f, "dn/kill-zombie {target} {replica}")
            }
            ScheduleCommand::ShutdownStore { target } => write!(f, "store/shutdown {target}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnShardDesc {
    pub shard_id: u64,
    pub replica_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CnHeartbeat {
    pub uuid: String,
    pub service_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnHeartbeat {
    pub uuid: String,
    pub service_address: String,
    pub shards: Vec<DnShardDesc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogShardInfo {
    pub shard_id: u64,
    pub replicas: BTreeMap<u64, String>,
    pub epoch: u64,
    pub leader_id: u64,
    pub term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogHeartbeat {
    pub uuid: String,
    pub raft_address: String,
    pub service_address: String,
    pub gossip_address: String,
    pub shards: Vec<LogShardInfo>,
}

#[derive(Debug, Clone, Default)]
struct CnStoreState {
    tick: u64,
    #[allow(dead_code)]
    service_address: String,
}

#[derive(Debug, Clone, Default)]
struct DnStoreState {
    tick: u64,
    service_address: String,
    shards: Vec<DnShardDesc>,
}

#[derive(Debug, Clone, Default)]
struct LogStoreState {
    tick: u64,
    #[allow(dead_code)]
    raft_address: String,
    #[allow(dead_code)]
    service_address: String,
    #[allow(dead_code)]
    gossip_address: String,
    #[allow(dead_code)]
    replica_count: usize,
}

#[derive(Debug, Default)]
struct HaKeeperState {
    tick: u64,
    cn_stores: HashMap<String, CnStoreState>,
    dn_stores: HashMap<String, DnStoreState>,
    log_stores: HashMap<String, LogStoreState>,
    shards: HashMap<u64, LogShardInfo>,
    queue: HashMap<String, Vec<ScheduleCommand>>,
    expected: BTreeMap<u64, usize>,
    next_replica_id: u64,
}

/// The scheduler state machine hosted on the distinguished log shard.
/// Heartbeats refresh per-store ticks and reconcile replica sets; the
/// tick-driven policy loop enqueues add/remove/shutdown commands that are
/// drained by the next heartbeat from each target store.
pub struct HaKeeper {
    state: Mutex<HaKeeperState>,
    expiry_ticks: u64,
}

impl HaKeeper {
    pub fn new(expiry_ticks: u64) -> Self {
        Self {
            state: Mutex::new(HaKeeperState {
                next_replica_id: 1,
                ..Default::default()
            }),
            expiry_ticks: expiry_ticks.max(2),
        }
    }

    /// Declare that `shard_id` should run with `replicas` live replicas.
    pub fn set_expected_shard(&self, shard_id: u64, replicas: usize) {
        self.state.lock().expected.insert(shard_id, replicas);
    }

    fn drain(state: &mut HaKeeperState, uuid: &str) -> Vec<ScheduleCommand> {
        state.queue.remove(uuid).unwrap_or_default()
    }

    fn enqueue(state: &mut HaKeeperState, cmd: ScheduleCommand) {
        let bucket = state.queue.entry(cmd.target().to_string()).or_default();
        // The queue stays idempotent: re-deriving the same command on a
        // later tick must not double it up.
        if !bucket.contains(&cmd) {
            info!(command = %cmd, "hakeeper enqueue");
            bucket.push(cmd);
        }
    }

    pub fn cn_heartbeat(&self, hb: CnHeartbeat) -> Vec<ScheduleCommand> {
        let mut state = self.state.lock();
        let tick = state.tick;
        state.cn_stores.insert(
            hb.uuid.clone(),
            CnStoreState {
                tick,
                service_address: hb.service_address,
            },
        );
        Self::drain(&mut state, &hb.uuid)
    }

    pub fn dn_heartbeat(&self, hb: DnHeartbeat) -> Vec<ScheduleCommand> {
        let mut state = self.state.lock();
        let tick = state.tick;
        state.dn_stores.insert(
            hb.uuid.clone(),
            DnStoreState {
                tick,
                service_address: hb.service_address,
                shards: hb.shards.clone(),
            },
        );
        // Reconcile observed replicas into the shard map.
        for shard in &hb.shards {
            let info = state
                .shards
                .entry(shard.shard_id)
                .or_insert_with(|| LogShardInfo {
                    shard_id: shard.shard_id,
                    replicas: BTreeMap::new(),
                    epoch: 1,
                    leader_id: 0,
                    term: 0,
                });
            info.replicas
                .insert(shard.replica_id, hb.uuid.clone());
        }
        Self::drain(&mut state, &hb.uuid)
    }

    pub fn log_heartbeat(&self, hb: LogHeartbeat) -> Vec<ScheduleCommand> {
        let mut state = self.state.lock();
        let tick = state.tick;
        state.log_stores.insert(
            hb.uuid.clone(),
            LogStoreState {
                tick,
                raft_address: hb.raft_address,
                service_address: hb.service_address,
                gossip_address: hb.gossip_address,
                replica_count: hb.shards.iter().map(|s| s.replicas.len()).sum(),
            },
        );
        for reported in hb.shards {
            match state.shards.get_mut(&reported.shard_id) {
                Some(current) => {
                    let shrinks = reported.epoch == current.epoch
                        && reported.replicas.len() < current.replicas.len()
                        && reported
                            .replicas
                            .keys()
                            .all(|id| current.replicas.contains_key(id));
                    if shrinks {
                        // Losing replicas without an epoch bump means two
                        // conflicting membership histories; state is gone.
                        panic!(
                            "shard {} replica set shrank without epoch bump ({} -> {})",
                            reported.shard_id,
                            current.replicas.len(),
                            reported.replicas.len()
                        );
                    }
                    if reported.epoch >= current.epoch {
                        *current = reported;
                    }
                }
                None => {
                    state.shards.insert(reported.shard_id, reported);
                }
            }
        }
        Self::drain(&mut state, &hb.uuid)
    }

    /// Best-known view of one shard, answerable from any store's gossip.
    pub fn shard_info(&self, shard_id: u64) -> Option<LogShardInfo> {
        self.state.lock().shards.get(&shard_id).cloned()
    }

    /// Advance the logical clock one tick and run the placement policy.
    pub fn tick(&self) {
        let mut state = self.state.lock();
        state.tick += 1;
        let now = state.tick;
        let expiry = self.expiry_ticks;

        // Expire stores that stopped heartbeating.
        let dead_dns: Vec<String> = state
            .dn_stores
            .iter()
            .filter(|(_, s)| now.saturating_sub(s.tick) >= expiry)
            .map(|(uuid, _)| uuid.clone())
            .collect();
        for uuid in dead_dns {
            let store = state.dn_stores.remove(&uuid).expect("present");
            warn!(store = %uuid, "hakeeper expiring dn store");
            for shard in &store.shards {
                if let Some(info) = state.shards.get_mut(&shard.shard_id) {
                    info.replicas.remove(&shard.replica_id);
                    info.epoch += 1;
                }
                let replica = ReplicaDesc {
                    store_uuid: uuid.clone(),
                    shard_id: shard.shard_id,
                    replica_id: shard.replica_id,
                    epoch: state
                        .shards
                        .get(&shard.shard_id)
                        .map(|i| i.epoch)
                        .unwrap_or(1),
                };
                Self::enqueue(
                    &mut state,
                    ScheduleCommand::RemoveReplica {
                        target: uuid.clone(),
                        replica,
                    },
                );
            }
            Self::enqueue(
                &mut state,
                ScheduleCommand::ShutdownStore {
                    target: uuid.clone(),
                },
            );
        }

        let dead_logs: Vec<String> = state
            .log_stores
            .iter()
            .filter(|(_, s)| now.saturating_sub(s.tick) >= expiry)
            .map(|(uuid, _)| uuid.clone())
            .collect();
        for uuid in dead_logs {
            state.log_stores.remove(&uuid);
            warn!(store = %uuid, "hakeeper expiring log store");
            Self::enqueue(
                &mut state,
                ScheduleCommand::ShutdownStore {
                    target: uuid.clone(),
                },
            );
        }

        // Backfill under-replicated shards onto the least-loaded live store.
        let expected: Vec<(u64, usize)> =
            state.expected.iter().map(|(k, v)| (*k, *v)).collect();
        for (shard_id, desired) in expected {
            let live = state
                .shards
                .get(&shard_id)
                .map(|info| info.replicas.len())
                .unwrap_or(0);
            if live >= desired {
                continue;
            }
            let holders: Vec<String> = state
                .shards
                .get(&shard_id)
                .map(|info| info.replicas.values().cloned().collect())
                .unwrap_or_default();
            let candidate = state
                .dn_stores
                .iter()
                .filter(|(uuid, _)| !holders.contains(uuid))
                .min_by_key(|(_, s)| s.shards.len())
                .map(|(uuid, s)| (uuid.clone(), s.service_address.clone()));
            let Some((target, _address)) = candidate else {
                continue;
            };
            let (epoch, mut members) = state
                .shards
                .get(&shard_id)
                .map(|info| (info.epoch, info.replicas.clone()))
                .unwrap_or((1, BTreeMap::new()));
            let replica_id = state.next_replica_id;
            state.next_replica_id += 1;
            members.insert(replica_id, target.clone());
            Self::enqueue(
                &mut state,
                ScheduleCommand::AddReplica {
                    target: target.clone(),
                    replica: ReplicaDesc {
                        store_uuid: target,
                        shard_id,
                        replica_id,
                        epoch,
                    },
                    initial_members: members,
                },
            );
        }
    }

    pub fn current_tick(&self) -> u64 {
        self.state.lock().tick
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{
        DnHeartbeat, DnShardDesc, HaKeeper, LogHeartbeat, LogShardInfo, ScheduleCommand,
    };

    fn dn_hb(uuid: &str, shards: Vec<DnShardDesc>) -> DnHeartbeat {
        DnHeartbeat {
            uuid: uuid.to_string(),
            service_address: format!("{uuid}:7100"),
            shards,
        }
    }

    #[test]
    fn heartbeat_refreshes_tick_and_drains_only_own_commands() {
        let keeper = HaKeeper::new(3);
        keeper.set_expected_shard(1, 1);

        assert!(keeper.dn_heartbeat(dn_hb("dn-a", vec![])).is_empty());
        keeper.tick();

        // Policy wants a replica of shard 1 somewhere; only dn-a exists.
        let cmds = keeper.dn_heartbeat(dn_hb("dn-a", vec![]));
        assert_eq!(cmds.len(), 1);
        match &cmds[0] {
            ScheduleCommand::AddReplica { target, replica, .. } => {
                assert_eq!(target, "dn-a");
                assert_eq!(replica.shard_id, 1);
            }
            other => panic!("unexpected command: {other}"),
        }

        // Drained: the same heartbeat again returns nothing new.
        assert!(keeper.dn_heartbeat(dn_hb("dn-a", vec![])).is_empty());
    }

    #[test]
    fn expired_store_gets_remove_and_shutdown() {
        let keeper = HaKeeper::new(2);
        keeper.dn_heartbeat(dn_hb(
            "dn-a",
            vec![DnShardDesc {
                shard_id: 1,
                replica_id: 11,
            }],
        ));
        keeper.dn_heartbeat(dn_hb("dn-b", vec![]));

        keeper.tick();
        keeper.dn_heartbeat(dn_hb("dn-b", vec![]));
        keeper.tick();
        keeper.tick();

        // dn-a never heartbeated again; its queue now carries the
        // teardown sequence, preserved across the missed rounds.
        let state = keeper.state.lock();
        let cmds = state.queue.get("dn-a").expect("queued teardown");
        assert!(matches!(cmds[0], ScheduleCommand::RemoveReplica { .. }));
        assert!(matches!(
            cmds.last().expect("last"),
            ScheduleCommand::ShutdownStore { .. }
        ));
    }

    #[test]
    fn policy_is_idempotent_across_ticks() {
        let keeper = HaKeeper::new(10);
        keeper.set_expected_shard(5, 1);
        keeper.dn_heartbeat(dn_hb("dn-a", vec![]));
        keeper.tick();
        keeper.tick();
        keeper.tick();

        let cmds = keeper.dn_heartbeat(dn_hb("dn-a", vec![]));
        let adds = cmds
            .iter()
            .filter(|c| matches!(c, ScheduleCommand::AddReplica { .. }))
            .count();
        assert_eq!(adds, 1);
    }

    #[test]
    fn replica_reconciliation_tracks_reported_shards() {
        let keeper = HaKeeper::new(10);
        keeper.dn_heartbeat(dn_hb(
            "dn-a",
            vec![DnShardDesc {
                shard_id: 2,
                replica_id: 21,
            }],
        ));
        let info = keeper.shard_info(2).expect("shard info");
        assert_eq!(info.replicas.get(&21).map(String::as_str), Some("dn-a"));
    }

    #[test]
    #[should_panic(expected = "without epoch bump")]
    fn duplicate_shrink_panics() {
        let keeper = HaKeeper::new(10);
        let mut replicas = BTreeMap::new();
        replicas.insert(1u64, "log-a".to_string());
        replicas.insert(2u64, "log-b".to_string());
        keeper.log_heartbeat(LogHeartbeat {
            uuid: "log-a".into(),
            raft_address: "log-a:7000".into(),
            service_address: "log-a:7001".into(),
            gossip_address: "log-a:7002".into(),
            shards: vec![LogShardInfo {
                shard_id: 3,
                replicas: replicas.clone(),
                epoch: 4,
                leader_id: 1,
                term: 9,
            }],
        });

        replicas.remove(&2);
        keeper.log_heartbeat(LogHeartbeat {
            uuid: "log-a".into(),
            raft_address: "log-a:7000".into(),
            service_address: "log-a:7001".into(),
            gossip_address: "log-a:7002".into(),
            shards: vec![LogShardInfo {
                shard_id: 3,
                replicas,
                epoch: 4,
                leader_id: 1,
                term: 9,
            }],
        });
    }
}
