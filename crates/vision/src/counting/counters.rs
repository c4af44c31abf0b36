use std::collections::{BTreeMap, HashSet};

use ml_core::TrafficClass;

/// Per-class cumulative counts with at-most-once counting per track id.
#[derive(Debug)]
pub struct CumulativeCounters {
    counts: BTreeMap<TrafficClass, u64>,
    counted_ids: HashSet<i64>,
}

impl Default for CumulativeCounters {
    fn default() -> Self {
        Self {
            counts: TrafficClass::ALL.iter().map(|&class| (class, 0)).collect(),
            counted_ids: HashSet::new(),
        }
    }
}

impl CumulativeCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a crossing for `track_id`. Returns `false` when the track was
    /// already counted in this epoch.
    pub fn register_crossing(&mut self, track_id: i64, class: TrafficClass) -> bool {
        if !self.counted_ids.insert(track_id) {
            return false;
        }
        *self.counts.entry(class).or_insert(0) += 1;
        true
    }

    pub fn count(&self, class: TrafficClass) -> u64 {
        self.counts.get(&class).copied().unwrap_or(0)
    }

    pub fn total_for(&self, classes: &[TrafficClass]) -> u64 {
        classes.iter().map(|&class| self.count(class)).sum()
    }

    pub fn is_counted(&self, track_id: i64) -> bool {
        self.counted_ids.contains(&track_id)
    }

    pub fn counted_len(&self) -> usize {
        self.counted_ids.len()
    }

    /// Counts for every recognized class, zero entries included.
    pub fn snapshot(&self) -> BTreeMap<TrafficClass, u64> {
        self.counts.clone()
    }

    /// Zero every class and forget counted ids. Callers clear the track
    /// history in the same critical section.
    pub fn reset(&mut self) {
        for count in self.counts.values_mut() {
            *count = 0;
        }
        self.counted_ids.clear();
    }
}
