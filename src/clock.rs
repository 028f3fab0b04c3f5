//! Wall-clock time source for publish timestamps.
//!
//! Until the first network sync the clock only knows time since boot and says
//! so. After a sync it extrapolates from the last sync point with the
//! monotonic clock and never hands out a value lower than one it already
//! issued, so a re-sync that steps time backwards is absorbed rather than
//! visible to consumers.

use serde::Serialize;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Timestamp {
    /// Milliseconds since the Unix epoch.
    Synchronized { epoch_ms: u64 },
    /// No sync yet; milliseconds since the gateway started.
    Unsynchronized { since_boot_ms: u64 },
}

impl Timestamp {
    pub fn millis(&self) -> u64 {
        match *self {
            Timestamp::Synchronized { epoch_ms } => epoch_ms,
            Timestamp::Unsynchronized { since_boot_ms } => since_boot_ms,
        }
    }

    pub fn is_synchronized(&self) -> bool {
        matches!(self, Timestamp::Synchronized { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct SyncPoint {
    epoch_ms: u64,
    at: Instant,
}

#[derive(Debug)]
pub struct Clock {
    boot: Instant,
    sync: Option<SyncPoint>,
    last_issued_ms: u64,
    backward_tolerance_ms: u64,
    sync_count: u32,
}

impl Clock {
    pub fn new(backward_tolerance_ms: u64) -> Self {
        Self {
            boot: Instant::now(),
            sync: None,
            last_issued_ms: 0,
            backward_tolerance_ms,
            sync_count: 0,
        }
    }

    pub fn is_synchronized(&self) -> bool {
        self.sync.is_some()
    }

    pub fn sync_count(&self) -> u32 {
        self.sync_count
    }

    pub fn now(&mut self) -> Timestamp {
        self.now_at(Instant::now())
    }

    pub fn now_at(&mut self, at: Instant) -> Timestamp {
        match self.sync {
            Some(point) => {
                let estimate = extrapolate(point, at);
                let epoch_ms = estimate.max(self.last_issued_ms);
                self.last_issued_ms = epoch_ms;
                Timestamp::Synchronized { epoch_ms }
            }
            None => Timestamp::Unsynchronized {
                since_boot_ms: millis_between(self.boot, at),
            },
        }
    }

    pub fn mark_synced(&mut self, epoch_ms: u64) {
        self.mark_synced_at(epoch_ms, Instant::now());
    }

    /// Record that the wall clock read `epoch_ms` at instant `at`.
    pub fn mark_synced_at(&mut self, epoch_ms: u64, at: Instant) {
        match self.sync {
            None => info!("Time synchronized: {} ms since epoch", epoch_ms),
            Some(point) => {
                let estimate = extrapolate(point, at);
                if epoch_ms.saturating_add(self.backward_tolerance_ms) < estimate {
                    warn!(
                        "Time re-sync stepped back {} ms; timestamps hold until it catches up",
                        estimate - epoch_ms
                    );
                } else if epoch_ms < estimate {
                    debug!("Time re-sync stepped back {} ms", estimate - epoch_ms);
                } else {
                    debug!("Time re-sync stepped forward {} ms", epoch_ms - estimate);
                }
            }
        }

        self.sync = Some(SyncPoint { epoch_ms, at });
        self.sync_count += 1;
    }
}

fn extrapolate(point: SyncPoint, at: Instant) -> u64 {
    point.epoch_ms.saturating_add(millis_between(point.at, at))
}

fn millis_between(earlier: Instant, later: Instant) -> u64 {
    later.saturating_duration_since(earlier).as_millis() as u64
}

/// Host wall clock in milliseconds, for deployments where the OS already
/// keeps time in sync.
pub fn system_epoch_ms() -> Option<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_unsynchronized_before_first_sync() {
        let mut clock = Clock::new(1000);
        assert!(!clock.is_synchronized());
        assert!(!clock.now().is_synchronized());
    }

    #[test]
    fn test_extrapolates_from_sync_point() {
        let mut clock = Clock::new(1000);
        let t0 = Instant::now();
        clock.mark_synced_at(1_700_000_000_000, t0);

        assert_eq!(
            clock.now_at(t0),
            Timestamp::Synchronized {
                epoch_ms: 1_700_000_000_000
            }
        );
        assert_eq!(
            clock.now_at(t0 + Duration::from_millis(250)).millis(),
            1_700_000_000_250
        );
    }

    #[test]
    fn test_backward_resync_never_decreases_output() {
        let mut clock = Clock::new(1000);
        let t0 = Instant::now();
        clock.mark_synced_at(10_000, t0);
        assert_eq!(clock.now_at(t0 + Duration::from_millis(500)).millis(), 10_500);

        // Re-sync says it is actually earlier than what we already handed out.
        clock.mark_synced_at(9_000, t0 + Duration::from_millis(500));
        assert_eq!(clock.now_at(t0 + Duration::from_millis(600)).millis(), 10_500);
        assert_eq!(clock.now_at(t0 + Duration::from_millis(2_000)).millis(), 10_500);
        assert_eq!(clock.now_at(t0 + Duration::from_millis(2_100)).millis(), 10_600);
        assert_eq!(clock.sync_count(), 2);
    }

    #[test]
    fn test_huge_backward_tolerance_does_not_overflow() {
        let mut clock = Clock::new(u64::MAX);
        let t0 = Instant::now();
        clock.mark_synced_at(u64::MAX - 10, t0);
        clock.mark_synced_at(u64::MAX - 20, t0);
        assert_eq!(clock.sync_count(), 2);
    }
}
