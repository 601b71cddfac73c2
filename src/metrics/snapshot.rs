//! Per-interval aggregate of everything reported for one timestamp.

use super::{Distribution, StatKey};
use crate::protocol::{StatCount, StatDist, StatValue, Stats};
use serde::Serialize;
use std::collections::BTreeMap;

/// Snapshot for one survey timestamp.
///
/// Only the aggregator mutates a snapshot. Once emitted it is shared with the
/// sinks behind an `Arc` and never changes again.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TimestampedStats {
    timestamp: i64,
    counters: BTreeMap<StatKey, f64>,
    dists: BTreeMap<StatKey, Distribution>,
    empty: bool,
}

impl TimestampedStats {
    pub fn new(timestamp: i64) -> Self {
        TimestampedStats {
            timestamp,
            counters: BTreeMap::new(),
            dists: BTreeMap::new(),
            empty: true,
        }
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn is_empty(&self) -> bool {
        self.empty
    }

    pub fn counters(&self) -> &BTreeMap<StatKey, f64> {
        &self.counters
    }

    pub fn dists(&self) -> &BTreeMap<StatKey, Distribution> {
        &self.dists
    }

    pub fn counter(&self, key: &str) -> Option<f64> {
        self.counters.get(key).copied()
    }

    pub fn dist(&self, key: &str) -> Option<&Distribution> {
        self.dists.get(key)
    }

    pub fn add_count(&mut self, s: &StatCount) {
        self.empty = false;
        *self.counters.entry(StatKey::from(s.name.as_str())).or_insert(0.0) += s.count;
    }

    pub fn add_value(&mut self, s: &StatValue) {
        self.empty = false;
        match self.dists.get_mut(s.name.as_str()) {
            Some(d) => d.add_entry(s.value),
            None => {
                self.dists
                    .insert(StatKey::from(s.name.as_str()), Distribution::from_value(s.value));
            }
        }
    }

    /// Merge a pre-aggregated distribution. Returns `false` if the 5-tuple does
    /// not describe a valid distribution, in which case nothing changes.
    pub fn add_dist(&mut self, s: &StatDist) -> bool {
        let Some(dist) = Distribution::from_array(s.dist) else {
            return false;
        };
        self.empty = false;
        match self.dists.get_mut(s.name.as_str()) {
            Some(d) => d.merge(&dist),
            None => {
                self.dists.insert(StatKey::from(s.name.as_str()), dist);
            }
        }
        true
    }

    /// Fold a whole `Stats` body in. Returns the number of rejected
    /// distributions.
    pub fn merge(&mut self, stats: &Stats) -> usize {
        for v in &stats.values {
            self.add_value(v);
        }
        for c in &stats.counts {
            self.add_count(c);
        }
        stats.dists.iter().filter(|d| !self.add_dist(d)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_snapshot_is_empty() {
        let s = TimestampedStats::new(1000);
        assert!(s.is_empty());
        assert_eq!(s.timestamp(), 1000);
        assert!(s.counters().is_empty());
        assert!(s.dists().is_empty());
    }

    #[test]
    fn test_counts_sum() {
        let mut s = TimestampedStats::new(1000);
        s.add_count(&StatCount::new("foo", 1.0));
        s.add_count(&StatCount::new("foo", 2.0));
        s.add_count(&StatCount::new("bar", 0.5));

        assert!(!s.is_empty());
        assert_eq!(s.counter("foo"), Some(3.0));
        assert_eq!(s.counter("bar"), Some(0.5));
    }

    #[test]
    fn test_values_build_distribution() {
        let mut s = TimestampedStats::new(1000);
        s.add_value(&StatValue::new("latency", 10.0));
        s.add_value(&StatValue::new("latency", 30.0));

        let d = s.dist("latency").unwrap();
        assert_eq!(d.count(), 2.0);
        assert_eq!(d.mean(), 20.0);
        assert_eq!(d.min(), 10.0);
        assert_eq!(d.max(), 30.0);
    }

    #[test]
    fn test_dists_merge_with_values() {
        let mut s = TimestampedStats::new(1000);
        s.add_value(&StatValue::new("latency", 1.0));
        assert!(s.add_dist(&StatDist::new("latency", [2.0, 3.0, 5.0, 8.0, 34.0])));

        let d = s.dist("latency").unwrap();
        assert_eq!(d.to_array(), [3.0, 1.0, 5.0, 9.0, 35.0]);
    }

    #[test]
    fn test_invalid_dist_rejected_and_keeps_empty() {
        let mut s = TimestampedStats::new(1000);
        assert!(!s.add_dist(&StatDist::new("latency", [0.0, 0.0, 0.0, 0.0, 0.0])));
        assert!(s.is_empty());
        assert!(s.dist("latency").is_none());
    }

    #[test]
    fn test_merge_stats_body() {
        let mut s = TimestampedStats::new(1000);
        let stats = Stats {
            timestamp: 1000,
            values: vec![StatValue::new("v", 4.0)],
            counts: vec![StatCount::new("c", 2.0)],
            dists: vec![
                StatDist::new("d", [1.0, 1.0, 1.0, 1.0, 1.0]),
                StatDist::new("bad", [0.0, 1.0, 1.0, 1.0, 1.0]),
            ],
        };

        assert_eq!(s.merge(&stats), 1);
        assert_eq!(s.counter("c"), Some(2.0));
        assert_eq!(s.dist("v").unwrap().count(), 1.0);
        assert_eq!(s.dist("d").unwrap().count(), 1.0);
        assert!(s.dist("bad").is_none());
    }
}
