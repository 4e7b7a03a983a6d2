//! Point-in-time memory counters.
//!
//! A [`Snapshot`] is taken inside the trap's finalizer hook so that it sits as
//! close as possible to the collection cycle that released the hook.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MonitorError;
use crate::runtime::{HeapStats, RuntimeStats};

/// Memory counters captured at one instant.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Bytes allocated and still in use.
    pub alloc_bytes: u64,
    /// Number of live allocated objects.
    pub heap_objects: u64,
    /// Completed collection cycles at capture time.
    pub gc_cycle: u32,
    /// Wall-clock capture time.
    pub taken_at: DateTime<Utc>,

    /// Active heap pages held by the allocator.
    pub heap_alloc_bytes: u64,
    /// Cumulative bytes allocated since start, never decreases.
    pub total_alloc_bytes: u64,
    /// Cumulative allocation calls.
    pub mallocs: u64,
    /// Memory obtained from the OS.
    pub sys_bytes: u64,
    /// When the last collection cycle finished.
    pub last_gc: DateTime<Utc>,
}

impl Snapshot {
    /// Builds a snapshot from raw runtime counters.
    pub fn from_stats(stats: &RuntimeStats, taken_at: DateTime<Utc>) -> Self {
        Self {
            alloc_bytes: stats.alloc_bytes,
            heap_objects: stats.heap_objects,
            gc_cycle: stats.gc_cycle,
            taken_at,
            heap_alloc_bytes: stats.heap_alloc_bytes,
            total_alloc_bytes: stats.total_alloc_bytes,
            mallocs: stats.mallocs,
            sys_bytes: stats.sys_bytes,
            last_gc: stats.last_gc,
        }
    }

    /// Time between the last collection and this capture.
    pub fn time_since_gc(&self) -> TimeDelta {
        self.taken_at - self.last_gc
    }
}

/// Reads the runtime's counters and stamps them with the current time.
pub fn capture_snapshot(source: &dyn HeapStats) -> Result<Snapshot, MonitorError> {
    let stats = source.read_stats()?;
    Ok(Snapshot::from_stats(&stats, Utc::now()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct FixedStats(RuntimeStats);

    impl HeapStats for FixedStats {
        fn read_stats(&self) -> Result<RuntimeStats, MonitorError> {
            Ok(self.0)
        }
    }

    struct BrokenStats;

    impl HeapStats for BrokenStats {
        fn read_stats(&self) -> Result<RuntimeStats, MonitorError> {
            Err(MonitorError::Stats("epoch refresh failed".to_string()))
        }
    }

    fn stats() -> RuntimeStats {
        RuntimeStats {
            alloc_bytes: 4096,
            heap_alloc_bytes: 8192,
            sys_bytes: 65536,
            heap_objects: 12,
            total_alloc_bytes: 100_000,
            mallocs: 340,
            gc_cycle: 7,
            last_gc: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn test_from_stats_copies_counters() {
        let taken_at = Utc.timestamp_opt(1_700_000_002, 0).unwrap();
        let snapshot = Snapshot::from_stats(&stats(), taken_at);

        assert_eq!(snapshot.alloc_bytes, 4096);
        assert_eq!(snapshot.heap_alloc_bytes, 8192);
        assert_eq!(snapshot.sys_bytes, 65536);
        assert_eq!(snapshot.heap_objects, 12);
        assert_eq!(snapshot.total_alloc_bytes, 100_000);
        assert_eq!(snapshot.mallocs, 340);
        assert_eq!(snapshot.gc_cycle, 7);
        assert_eq!(snapshot.taken_at, taken_at);
        assert_eq!(snapshot.time_since_gc(), TimeDelta::seconds(2));
    }

    #[test]
    fn test_capture_snapshot_reads_source() {
        let snapshot = capture_snapshot(&FixedStats(stats())).unwrap();
        assert_eq!(snapshot.gc_cycle, 7);
        assert!(snapshot.taken_at >= snapshot.last_gc);
    }

    #[test]
    fn test_capture_snapshot_propagates_failure() {
        let err = capture_snapshot(&BrokenStats).unwrap_err();
        assert!(matches!(err, MonitorError::Stats(_)));
    }
}
