//! Growth deltas and leak classification over the snapshot history.
//!
//! Classification policy, evaluated in order once at least two samples span
//! at least [`ClassifierConfig::min_elapsed`]:
//!
//! | reason           | condition                                                        |
//! |------------------|------------------------------------------------------------------|
//! | `leak-suspected` | growth > 0, rate ≥ `leak_threshold_per_hour`, collections ≥ `min_collections` |
//! | `stable`         | \|rate\| ≤ `stable_tolerance_per_hour`                           |
//! | `shrinking`      | rate < −`stable_tolerance_per_hour`                              |
//! | `growing`        | otherwise                                                        |
//!
//! Fewer than two samples, or a window shorter than `min_elapsed`, yields
//! `insufficient-data` with a zero rate.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::history::HistoryRing;
use crate::snapshot::Snapshot;

const NANOS_PER_HOUR: f64 = 3_600_000_000_000.0;

/// Counter deltas between two snapshots. Negative values mean shrinkage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Change {
    pub alloc_bytes: i64,
    pub heap_objects: i64,
}

/// Two snapshots and the change between them.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Diff {
    pub before: Snapshot,
    pub after: Snapshot,
    pub change: Change,
}

/// Computes `after - before` for every counter.
pub fn diff(before: &Snapshot, after: &Snapshot) -> Diff {
    Diff {
        before: *before,
        after: *after,
        change: Change {
            alloc_bytes: after.alloc_bytes.wrapping_sub(before.alloc_bytes) as i64,
            heap_objects: after.heap_objects.wrapping_sub(before.heap_objects) as i64,
        },
    }
}

/// Why a window was classified the way it was.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LeakReason {
    InsufficientData,
    Stable,
    Growing,
    Shrinking,
    LeakSuspected,
}

impl LeakReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeakReason::InsufficientData => "insufficient-data",
            LeakReason::Stable => "stable",
            LeakReason::Growing => "growing",
            LeakReason::Shrinking => "shrinking",
            LeakReason::LeakSuspected => "leak-suspected",
        }
    }
}

impl std::fmt::Display for LeakReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Growth summary over the retained history window.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct LeakReport {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Collection cycles between the oldest and newest sample.
    pub collections: u32,
    /// Net change in live bytes across the window.
    pub growth: i64,
    pub growth_per_hour: f64,
    pub reason: LeakReason,
}

impl LeakReport {
    fn insufficient(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end,
            collections: 0,
            growth: 0,
            growth_per_hour: 0.0,
            reason: LeakReason::InsufficientData,
        }
    }

    pub fn window(&self) -> TimeDelta {
        self.end - self.start
    }
}

/// Thresholds for [`classify`].
#[derive(Clone, Debug, PartialEq)]
pub struct ClassifierConfig {
    /// Hourly growth at or above which a leak is suspected.
    pub leak_threshold_per_hour: f64,
    /// Collections the window must span before a leak can be suspected.
    pub min_collections: u32,
    /// Hourly rates within this distance of zero count as stable.
    pub stable_tolerance_per_hour: f64,
    /// Windows shorter than this are not extrapolated to an hourly rate.
    pub min_elapsed: Duration,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            leak_threshold_per_hour: 10.0 * 1024.0 * 1024.0,
            min_collections: 10,
            stable_tolerance_per_hour: 64.0 * 1024.0,
            min_elapsed: Duration::from_secs(1),
        }
    }
}

/// Classifies the growth between the oldest and newest retained snapshot.
pub fn classify(history: &HistoryRing<Snapshot>, config: &ClassifierConfig) -> LeakReport {
    let (Some(oldest), Some(newest)) = (history.oldest(), history.newest()) else {
        // Default is the UNIX epoch.
        return LeakReport::insufficient(DateTime::default(), DateTime::default());
    };
    if history.len() < 2 {
        return LeakReport::insufficient(oldest.taken_at, newest.taken_at);
    }

    let growth = diff(oldest, newest).change.alloc_bytes;
    let collections = newest.gc_cycle.saturating_sub(oldest.gc_cycle);
    let elapsed = newest.taken_at - oldest.taken_at;

    let mut report = LeakReport {
        start: oldest.taken_at,
        end: newest.taken_at,
        collections,
        growth,
        growth_per_hour: 0.0,
        reason: LeakReason::InsufficientData,
    };

    let below_floor = match TimeDelta::from_std(config.min_elapsed) {
        Ok(floor) => elapsed < floor,
        Err(_) => true,
    };
    // `None` only for windows of roughly 292 years or more.
    let Some(nanos) = elapsed.num_nanoseconds().filter(|n| *n > 0) else {
        return report;
    };
    if below_floor {
        return report;
    }

    report.growth_per_hour = growth as f64 * NANOS_PER_HOUR / nanos as f64;
    report.reason = reason_for(growth, report.growth_per_hour, collections, config);
    report
}

fn reason_for(
    growth: i64,
    per_hour: f64,
    collections: u32,
    config: &ClassifierConfig,
) -> LeakReason {
    if growth > 0
        && per_hour >= config.leak_threshold_per_hour
        && collections >= config.min_collections
    {
        LeakReason::LeakSuspected
    } else if per_hour.abs() <= config.stable_tolerance_per_hour {
        LeakReason::Stable
    } else if per_hour < -config.stable_tolerance_per_hour {
        LeakReason::Shrinking
    } else {
        LeakReason::Growing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn snap(alloc_bytes: u64, gc_cycle: u32, secs: i64) -> Snapshot {
        Snapshot {
            alloc_bytes,
            heap_objects: alloc_bytes / 10,
            gc_cycle,
            taken_at: at(secs),
            heap_alloc_bytes: alloc_bytes,
            total_alloc_bytes: alloc_bytes,
            mallocs: 0,
            sys_bytes: 0,
            last_gc: at(secs),
        }
    }

    fn ring(samples: &[Snapshot]) -> HistoryRing<Snapshot> {
        let mut ring = HistoryRing::new(samples.len().max(1));
        for s in samples {
            ring.push(*s);
        }
        ring
    }

    fn config(threshold: f64, min_collections: u32) -> ClassifierConfig {
        ClassifierConfig {
            leak_threshold_per_hour: threshold,
            min_collections,
            stable_tolerance_per_hour: 1000.0,
            min_elapsed: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_diff_preserves_negative_delta() {
        let d = diff(&snap(400, 3, 2), &snap(50, 4, 3));
        assert_eq!(d.change.alloc_bytes, -350);
        assert_eq!(d.change.heap_objects, 5 - 40);
        assert_eq!(d.before.alloc_bytes, 400);
        assert_eq!(d.after.alloc_bytes, 50);
    }

    #[test]
    fn test_diff_positive_delta() {
        let d = diff(&snap(100, 1, 0), &snap(150, 2, 1));
        assert_eq!(d.change.alloc_bytes, 50);
    }

    #[test]
    fn test_classify_empty_and_single_sample() {
        let cfg = ClassifierConfig::default();

        let empty = classify(&HistoryRing::new(3), &cfg);
        assert_eq!(empty.reason, LeakReason::InsufficientData);
        assert_eq!(empty.growth, 0);
        assert_eq!(empty.growth_per_hour, 0.0);
        assert_eq!(empty.collections, 0);

        let single = classify(&ring(&[snap(100, 1, 0)]), &cfg);
        assert_eq!(single.reason, LeakReason::InsufficientData);
        assert_eq!(single.growth, 0);
        assert_eq!(single.start, at(0));
        assert_eq!(single.end, at(0));
    }

    #[test]
    fn test_classify_concrete_window_leak_suspected() {
        let history = ring(&[snap(100, 1, 0), snap(150, 2, 1), snap(400, 3, 2)]);
        let report = classify(&history, &config(540_000.0, 2));

        assert_eq!(report.growth, 300);
        assert_eq!(report.collections, 2);
        assert!((report.growth_per_hour - 540_000.0).abs() < 1e-6);
        assert_eq!(report.reason, LeakReason::LeakSuspected);
        assert_eq!(report.window(), TimeDelta::seconds(2));
    }

    #[test]
    fn test_classify_concrete_window_growing_below_threshold() {
        let history = ring(&[snap(100, 1, 0), snap(150, 2, 1), snap(400, 3, 2)]);
        let report = classify(&history, &config(540_001.0, 2));
        assert_eq!(report.reason, LeakReason::Growing);
    }

    #[test]
    fn test_classify_requires_min_collections() {
        let history = ring(&[snap(100, 1, 0), snap(150, 2, 1), snap(400, 3, 2)]);
        let report = classify(&history, &config(1.0, 5));
        assert_eq!(report.reason, LeakReason::Growing);
    }

    #[test]
    fn test_classify_after_eviction() {
        let mut history = ring(&[snap(100, 1, 0), snap(150, 2, 1), snap(400, 3, 2)]);
        history.push(snap(50, 4, 3));

        let values: Vec<u64> = history.iter().map(|s| s.alloc_bytes).collect();
        assert_eq!(values, vec![150, 400, 50]);

        let report = classify(&history, &config(540_000.0, 2));
        assert_eq!(report.growth, -100);
        assert_eq!(report.collections, 2);
        assert_eq!(report.reason, LeakReason::Shrinking);
    }

    #[test]
    fn test_classify_stable_within_tolerance() {
        // +10 bytes over an hour.
        let history = ring(&[snap(1000, 1, 0), snap(1010, 50, 3600)]);
        let report = classify(&history, &config(1_000_000.0, 2));
        assert_eq!(report.reason, LeakReason::Stable);
        assert!((report.growth_per_hour - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_classify_below_elapsed_floor() {
        let mut a = snap(100, 1, 0);
        let mut b = snap(900, 2, 0);
        a.taken_at = at(0);
        b.taken_at = at(0) + TimeDelta::milliseconds(300);

        let report = classify(&ring(&[a, b]), &config(1.0, 1));
        assert_eq!(report.reason, LeakReason::InsufficientData);
        assert_eq!(report.growth_per_hour, 0.0);
        assert_eq!(report.growth, 800);
    }

    #[test]
    fn test_classify_clamps_collections_on_cycle_regression() {
        let history = ring(&[snap(100, 9, 0), snap(100, 3, 10)]);
        let report = classify(&history, &ClassifierConfig::default());
        assert_eq!(report.collections, 0);
        assert_eq!(report.reason, LeakReason::Stable);
    }

    #[test]
    fn test_classify_monotonic_growth_matches_rate() {
        let samples: Vec<Snapshot> = (0..10)
            .map(|i| snap(1_000 + i as u64 * 4_096, i as u32 + 1, i * 30))
            .collect();
        let report = classify(&ring(&samples), &ClassifierConfig::default());

        let hours = (9.0 * 30.0) / 3600.0;
        let expected = (9.0 * 4096.0) / hours;
        assert!(report.growth > 0);
        assert!((report.growth_per_hour - expected).abs() < 1e-6);
    }

    #[test]
    fn test_classify_keeps_sub_millisecond_precision() {
        let start = snap(0, 1, 0);
        let end = Snapshot {
            alloc_bytes: 3_600,
            gc_cycle: 2,
            taken_at: at(0) + TimeDelta::nanoseconds(1_999_999_000),
            ..start
        };

        // True rate is 3600 B / 1.999999 s = ~6_480_003 B/h, just under the threshold.
        let report = classify(&ring(&[start, end]), &config(6_481_000.0, 1));
        let expected = 3_600.0 * 3_600.0 / 1.999_999;
        assert!((report.growth_per_hour - expected).abs() < 1e-3);
        assert_eq!(report.reason, LeakReason::Growing);
    }

    #[test]
    fn test_classify_rate_exactly_at_threshold_over_fractional_window() {
        let start = snap(0, 1, 0);
        let end = Snapshot {
            alloc_bytes: 3_600,
            gc_cycle: 2,
            taken_at: at(1) + TimeDelta::milliseconds(500),
            ..start
        };

        let report = classify(&ring(&[start, end]), &config(8_640_000.0, 1));
        assert_eq!(report.growth_per_hour, 8_640_000.0);
        assert_eq!(report.reason, LeakReason::LeakSuspected);
    }

    #[test]
    fn test_classify_sub_millisecond_window_without_floor() {
        let start = snap(0, 1, 0);
        let end = Snapshot {
            alloc_bytes: 1,
            gc_cycle: 2,
            taken_at: at(0) + TimeDelta::microseconds(500),
            ..start
        };
        let cfg = ClassifierConfig {
            min_elapsed: Duration::ZERO,
            ..config(f64::MAX, 1)
        };

        let report = classify(&ring(&[start, end]), &cfg);
        assert_eq!(report.growth_per_hour, 7_200_000.0);
        assert_eq!(report.reason, LeakReason::Growing);
    }

    #[test]
    fn test_classify_window_exactly_at_elapsed_floor() {
        let history = ring(&[snap(100, 1, 0), snap(400, 2, 1)]);
        let report = classify(&history, &config(f64::MAX, 1));

        assert_eq!(report.window(), TimeDelta::seconds(1));
        assert_eq!(report.growth_per_hour, 1_080_000.0);
        assert_eq!(report.reason, LeakReason::Growing);
    }

    #[test]
    fn test_reason_strings() {
        assert_eq!(LeakReason::InsufficientData.to_string(), "insufficient-data");
        assert_eq!(LeakReason::LeakSuspected.as_str(), "leak-suspected");
        assert_eq!(LeakReason::Shrinking.as_str(), "shrinking");
    }
}
