use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Hybrid-logical timestamp: wall-clock nanoseconds plus a logical
/// counter disambiguating events within one nanosecond. Ordering is
/// lexicographic, so the derived `Ord` matches the wire ordering.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp {
    pub physical: u64,
    pub logical: u32,
}

/// Sentinel end timestamp of an in-flight MVCC node.
pub const UNCOMMIT_TS: Timestamp = Timestamp::MAX;

impl Timestamp {
    pub const MIN: Timestamp = Timestamp {
        physical: 0,
        logical: 0,
    };
    pub const MAX: Timestamp = Timestamp {
        physical: u64::MAX,
        logical: u32::MAX,
    };

    pub const ENCODED_LEN: usize = 12;

    pub fn new(physical: u64, logical: u32) -> Self {
        Self { physical, logical }
    }

    pub fn is_uncommitted(&self) -> bool {
        *self == UNCOMMIT_TS
    }

    /// Smallest timestamp strictly greater than `self`.
    pub fn next(&self) -> Timestamp {
        match self.logical.checked_add(1) {
            Some(logical) => Timestamp {
                physical: self.physical,
                logical,
            },
            None => Timestamp {
                physical: self.physical + 1,
                logical: 0,
            },
        }
    }

    /// Largest timestamp strictly less than `self`.
    pub fn prev(&self) -> Timestamp {
        match self.logical.checked_sub(1) {
            Some(logical) => Timestamp {
                physical: self.physical,
                logical,
            },
            None => Timestamp {
                physical: self.physical.saturating_sub(1),
                logical: u32::MAX,
            },
        }
    }

    /// Big-endian 12-byte encoding; byte order preserves `Ord`.
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[..8].copy_from_slice(&self.physical.to_be_bytes());
        out[8..].copy_from_slice(&self.logical.to_be_bytes());
        out
    }

    pub fn from_bytes(buf: &[u8; Self::ENCODED_LEN]) -> Timestamp {
        let mut phys = [0u8; 8];
        let mut logical = [0u8; 4];
        phys.copy_from_slice(&buf[..8]);
        logical.copy_from_slice(&buf[8..]);
        Timestamp {
            physical: u64::from_be_bytes(phys),
            logical: u32::from_be_bytes(logical),
        }
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_uncommitted() {
            write!(f, "uncommitted")
        } else {
            write!(f, "{}.{}", self.physical, self.logical)
        }
    }
}

fn wall_clock_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Hybrid logical clock: monotonic under concurrent callers, advanced on
/// every observed remote timestamp, clamped when the wall clock jumps
/// backwards.
#[derive(Debug, Default)]
pub struct HybridClock {
    last: Mutex<Timestamp>,
}

impl HybridClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> Timestamp {
        let wall = wall_clock_nanos();
        let mut last = self.last.lock();
        let issued = if wall > last.physical {
            Timestamp::new(wall, 0)
        } else {
            last.next()
        };
        *last = issued;
        issued
    }

    /// Adopt a remote timestamp: the next local timestamp is strictly
    /// greater than both the local history and `remote`.
    pub fn update(&self, remote: Timestamp) -> Timestamp {
        let wall = wall_clock_nanos();
        let mut last = self.last.lock();
        let floor = if remote > *last { remote } else { *last };
        let issued = if wall > floor.physical {
            Timestamp::new(wall, 0)
        } else {
            floor.next()
        };
        *last = issued;
        issued
    }

    pub fn peek(&self) -> Timestamp {
        *self.last.lock()
    }

    /// Block until the wall clock has passed `ts.physical`. Called before a
    /// commit timestamp is handed back to a client so external observers
    /// cannot see it before real time reaches it.
    pub async fn sleep_until(&self, ts: Timestamp) {
        loop {
            let wall = wall_clock_nanos();
            if wall > ts.physical {
                return;
            }
            let gap = ts.physical - wall;
            tokio::time::sleep(Duration::from_nanos(gap.max(100_000))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{HybridClock, Timestamp, UNCOMMIT_TS};

    #[test]
    fn ordering_is_lexicographic() {
        let a = Timestamp::new(5, 9);
        let b = Timestamp::new(6, 0);
        let c = Timestamp::new(6, 1);
        assert!(a < b && b < c);
        assert!(UNCOMMIT_TS > c);
    }

    #[test]
    fn next_prev_round_trip() {
        let ts = Timestamp::new(100, 7);
        assert_eq!(ts.next().prev(), ts);
        assert_eq!(ts.prev().next(), ts);

        let carry = Timestamp::new(100, u32::MAX);
        assert_eq!(carry.next(), Timestamp::new(101, 0));
        assert_eq!(carry.next().prev(), carry);
    }

    #[test]
    fn byte_encoding_preserves_order() {
        let samples = [
            Timestamp::MIN,
            Timestamp::new(1, 0),
            Timestamp::new(1, 1),
            Timestamp::new(2, 0),
            Timestamp::new(u64::MAX, 0),
            Timestamp::MAX,
        ];
        for pair in samples.windows(2) {
            assert!(pair[0].to_bytes() < pair[1].to_bytes());
        }
        for ts in samples {
            assert_eq!(Timestamp::from_bytes(&ts.to_bytes()), ts);
        }
    }

    #[test]
    fn clock_is_strictly_monotonic() {
        let clock = HybridClock::new();
        let mut last = clock.now();
        for _ in 0..10_000 {
            let ts = clock.now();
            assert!(ts > last);
            last = ts;
        }
    }

    #[test]
    fn clock_monotonic_across_threads() {
        use std::sync::Arc;

        let clock = Arc::new(HybridClock::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let clock = Arc::clone(&clock);
                std::thread::spawn(move || {
                    let mut last = clock.now();
                    for _ in 0..5_000 {
                        let ts = clock.now();
                        assert!(ts > last);
                        last = ts;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("clock thread");
        }
    }

    #[test]
    fn update_adopts_remote_time() {
        let clock = HybridClock::new();
        let local = clock.now();
        let remote = Timestamp::new(local.physical + 1_000_000_000_000, 3);
        let adopted = clock.update(remote);
        assert!(adopted > remote);
        assert!(clock.now() > adopted);
    }

    #[test]
    fn update_with_stale_remote_keeps_monotonicity() {
        let clock = HybridClock::new();
        let before = clock.now();
        let adopted = clock.update(Timestamp::MIN);
        assert!(adopted > before);
    }
}
