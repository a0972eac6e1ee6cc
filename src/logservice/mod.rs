pub mod client;
pub mod record;

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::error::StoreError;
use crate::hakeeper::{
    CnHeartbeat, DnHeartbeat, HaKeeper, LogHeartbeat, ScheduleCommand,
};
use crate::logservice::record::{
    Frame, FrameReadError, FrameReader, FrameWriter, LogRecord, RecordType, FRAME_RECORD,
    FRAME_TRUNCATE,
};

/// The distinguished shard carrying cluster membership and scheduling.
pub const HAKEEPER_SHARD_ID: u64 = 0;

struct ShardInner {
    records: Vec<LogRecord>,
    next_lsn: u64,
    truncated: u64,
    lease_dn: Option<u64>,
    writer: FrameWriter<File>,
}

/// One replicated log shard: a totally-ordered record stream with a
/// single fencing mechanism, the last `LeaseUpdate` record. Records are
/// framed to an append-only segment file and rebuilt on open; torn tails
/// are tolerated, corruption in the prefix is not.
pub struct LogShard {
    pub shard_id: u64,
    inner: Mutex<ShardInner>,
}

impl LogShard {
    pub fn open(dir: &Path, shard_id: u64) -> Result<Arc<Self>, StoreError> {
        std::fs::create_dir_all(dir)?;
        let path = shard_path(dir, shard_id);
        let mut records: Vec<LogRecord> = Vec::new();
        let mut next_lsn = 1u64;
        let mut truncated = 0u64;
        let mut lease_dn = None;

        if path.exists() {
            let mut reader = FrameReader::new(BufReader::new(File::open(&path)?));
            loop {
                match reader.next_frame() {
                    Ok(Some(Frame { frame_type, body })) => match frame_type {
                        FRAME_RECORD => {
                            let record = LogRecord::decode(&body)?;
                            if record.rec_type == RecordType::LeaseUpdate {
                                lease_dn = Some(record.dn_id);
                            }
                            next_lsn = record.lsn + 1;
                            records.push(record);
                        }
                        FRAME_TRUNCATE => {
                            let body: [u8; 8] = body.as_slice().try_into().map_err(|_| {
                                StoreError::Decode("bad truncate frame".into())
                            })?;
                            truncated = u64::from_be_bytes(body);
                            records.retain(|r| r.lsn > truncated);
                        }
                        other => {
                            return Err(StoreError::Decode(format!(
                                "unknown frame type {other}"
                            )));
                        }
                    },
                    Ok(None) => break,
                    Err(FrameReadError::Truncation) => {
                        warn!(shard_id, "torn tail in log segment, dropping");
                        break;
                    }
                    Err(FrameReadError::Corruption) => {
                        return Err(StoreError::Internal(format!(
                            "shard {shard_id} log segment corrupt"
                        )));
                    }
                    Err(FrameReadError::Io(e)) => {
                        return Err(StoreError::Io(std::io::Error::other(e)));
                    }
                }
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!(
            shard_id,
            records = records.len(),
            truncated,
            "opened log shard"
        );
        Ok(Arc::new(Self {
            shard_id,
            inner: Mutex::new(ShardInner {
                records,
                next_lsn,
                truncated,
                lease_dn,
                writer: FrameWriter::new(file),
            }),
        }))
    }

    fn persist(inner: &mut ShardInner, record: &LogRecord) -> Result<(), StoreError> {
        inner.writer.append(FRAME_RECORD, &record.encode())?;
        inner.writer.flush()?;
        inner.writer.get_mut().sync_data()?;
        Ok(())
    }

    /// Acquire the append lease for `dn_id`. The lease change is itself a
    /// log record, so every reader observes fencing in stream order.
    pub fn connect(&self, dn_id: u64) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        let mut record = LogRecord::lease_update(dn_id);
        record.lsn = inner.next_lsn;
        Self::persist(&mut inner, &record)?;
        inner.next_lsn += 1;
        inner.lease_dn = Some(dn_id);
        let lsn = record.lsn;
        inner.records.push(record);
        info!(shard_id = self.shard_id, dn_id, lsn, "lease update");
        Ok(lsn)
    }

    /// Read-only attach: no lease movement.
    pub fn connect_ro(&self) -> Result<(), StoreError> {
        Ok(())
    }

    pub fn append(&self, dn_id: u64, payload: Vec<u8>) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        match inner.lease_dn {
            Some(holder) if holder == dn_id => {}
            holder => {
                return Err(StoreError::NotLeaseHolder {
                    shard_id: self.shard_id,
                    holder: holder.unwrap_or(0),
                    requester: dn_id,
                });
            }
        }
        let mut record = LogRecord::user(dn_id, payload);
        record.lsn = inner.next_lsn;
        Self::persist(&mut inner, &record)?;
        inner.next_lsn += 1;
        let lsn = record.lsn;
        inner.records.push(record);
        Ok(lsn)
    }

    /// Contiguous records from `from_lsn` (clamped above the truncation
    /// point), bounded by `max_bytes` of record payloads, always at least
    /// one record when any is available.
    pub fn read(&self, from_lsn: u64, max_bytes: usize) -> Vec<LogRecord> {
        let inner = self.inner.lock();
        let start = from_lsn.max(inner.truncated + 1);
        let mut out = Vec::new();
        let mut budget = 0usize;
        for record in inner.records.iter().filter(|r| r.lsn >= start) {
            budget += record.encoded_len();
            if !out.is_empty() && budget > max_bytes {
                break;
            }
            out.push(record.clone());
        }
        out
    }

    pub fn truncate(&self, up_to_lsn: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if up_to_lsn <= inner.truncated {
            return Err(StoreError::LsnAlreadyTruncated {
                shard_id: self.shard_id,
                lsn: up_to_lsn,
                truncated: inner.truncated,
            });
        }
        if up_to_lsn >= inner.next_lsn {
            return Err(StoreError::InvalidRequest(format!(
                "truncate {up_to_lsn} beyond last lsn {}",
                inner.next_lsn - 1
            )));
        }
        inner
            .writer
            .append(FRAME_TRUNCATE, &up_to_lsn.to_be_bytes())?;
        inner.writer.flush()?;
        inner.writer.get_mut().sync_data()?;
        inner.truncated = up_to_lsn;
        inner.records.retain(|r| r.lsn > up_to_lsn);
        info!(shard_id = self.shard_id, up_to_lsn, "truncated log shard");
        Ok(())
    }

    pub fn truncated_lsn(&self) -> u64 {
        self.inner.lock().truncated
    }

    pub fn last_lsn(&self) -> u64 {
        self.inner.lock().next_lsn - 1
    }

    pub fn lease_holder(&self) -> Option<u64> {
        self.inner.lock().lease_dn
    }
}

fn shard_path(dir: &Path, shard_id: u64) -> PathBuf {
    dir.join(format!("shard-{shard_id:05}.wal"))
}

/// Node-local face of the replicated log: a set of shards plus, when this
/// node hosts the distinguished shard, the HAKeeper state machine and the
/// timestamp-reservation counter.
pub struct LogService {
    data_dir: PathBuf,
    shards: RwLock<HashMap<u64, Arc<LogShard>>>,
    tso: AtomicU64,
    hakeeper: RwLock<Option<Arc<HaKeeper>>>,
}

impl LogService {
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Arc<Self>, StoreError> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;
        Ok(Arc::new(Self {
            data_dir,
            shards: RwLock::new(HashMap::new()),
            tso: AtomicU64::new(1),
            hakeeper: RwLock::new(None),
        }))
    }

    pub fn shard(&self, shard_id: u64) -> Result<Arc<LogShard>, StoreError> {
        if let Some(shard) = self.shards.read().get(&shard_id) {
            return Ok(Arc::clone(shard));
        }
        let opened = LogShard::open(&self.data_dir, shard_id)?;
        let mut shards = self.shards.write();
        Ok(Arc::clone(
            shards.entry(shard_id).or_insert(opened),
        ))
    }

    pub fn attach_hakeeper(&self, hakeeper: Arc<HaKeeper>) {
        *self.hakeeper.write() = Some(hakeeper);
    }

    /// Whether this node hosts the HAKeeper replica.
    pub fn check_hakeeper(&self) -> bool {
        self.hakeeper.read().is_some()
    }

    pub fn hakeeper(&self) -> Option<Arc<HaKeeper>> {
        self.hakeeper.read().clone()
    }

    /// Reserve `count` timestamps from the HAKeeper shard; returns the
    /// first of the reserved range.
    pub fn tso_update(&self, count: u64) -> Result<u64, StoreError> {
        if !self.check_hakeeper() {
            return Err(StoreError::InvalidRequest(
                "node does not host the hakeeper shard".into(),
            ));
        }
        Ok(self.tso.fetch_add(count.max(1), Ordering::AcqRel))
    }

    fn require_hakeeper(&self) -> Result<Arc<HaKeeper>, StoreError> {
        self.hakeeper().ok_or_else(|| {
            StoreError::InvalidRequest("node does not host the hakeeper shard".into())
        })
    }

    pub fn log_heartbeat(&self, hb: LogHeartbeat) -> Result<Vec<ScheduleCommand>, StoreError> {
        Ok(self.require_hakeeper()?.log_heartbeat(hb))
    }

    pub fn dn_heartbeat(&self, hb: DnHeartbeat) -> Result<Vec<ScheduleCommand>, StoreError> {
        Ok(self.require_hakeeper()?.dn_heartbeat(hb))
    }

    pub fn cn_heartbeat(&self, hb: CnHeartbeat) -> Result<Vec<ScheduleCommand>, StoreError> {
        Ok(self.require_hakeeper()?.cn_heartbeat(hb))
    }
}
