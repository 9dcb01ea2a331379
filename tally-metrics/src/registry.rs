use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::aggregate::{Aggregate, SharedAggregate, SharedCounter};
use crate::protocol::MetricTags;
use crate::report::MeasurementSetReport;
use crate::tagged::TaggedMeasurementSet;

type EntryMap<T> = RwLock<HashMap<String, Arc<T>>>;

/// Looks up `key`, creating a default entry if it does not exist yet.
///
/// The common case of an existing entry only takes the shared lock.
fn get_or_insert<T: Default>(map: &EntryMap<T>, key: &str) -> Arc<T> {
    if let Some(entry) = map.read().get(key) {
        return Arc::clone(entry);
    }

    let mut guard = map.write();
    // Another thread may have inserted the entry between releasing the read lock and acquiring
    // the write lock.
    let entry = guard
        .entry_ref(key)
        .or_insert_with(|| Arc::new(T::default()));
    Arc::clone(entry)
}

/// A concurrent registry of counters and aggregates keyed by encoded measurement keys.
///
/// Entries are created on first use and live as long as the set. [`drain`](Self::drain) resets
/// their values but keeps the entries, so repeated recording never re-allocates. Each entry has its
/// own lock, so updates to different keys do not contend beyond a brief shared lock on the map.
///
/// Keys are plain strings. Use [`key::encode`](crate::key::encode) or a
/// [`TaggedMeasurementSet`] to attach tags.
///
/// # Example
///
/// ```
/// use tally_metrics::MeasurementSet;
///
/// let set = MeasurementSet::new();
/// set.incr("requests");
/// set.update_value("latency", 12.0);
/// set.update_value("latency", 20.0);
///
/// let report = set.drain();
/// assert_eq!(report.counts["requests"], 1);
/// assert_eq!(report.aggregates["latency"].max, 20.0);
/// assert!(set.drain().is_empty());
/// ```
#[derive(Debug, Default)]
pub struct MeasurementSet {
    counters: EntryMap<SharedCounter>,
    aggregates: EntryMap<SharedAggregate>,
}

impl MeasurementSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the counter for `key`, creating it if necessary.
    pub fn counter(&self, key: &str) -> Arc<SharedCounter> {
        get_or_insert(&self.counters, key)
    }

    /// Returns the aggregate for `key`, creating it if necessary.
    pub fn aggregate(&self, key: &str) -> Arc<SharedAggregate> {
        get_or_insert(&self.aggregates, key)
    }

    /// Increments the counter for `key` by one.
    pub fn incr(&self, key: &str) {
        self.counter(key).incr();
    }

    /// Adds `delta` to the counter for `key`.
    pub fn add(&self, key: &str, delta: i64) {
        self.counter(key).add(delta);
    }

    /// Records a single observation into the aggregate for `key`.
    pub fn update_value(&self, key: &str, value: f64) {
        self.aggregate(key).update_value(value);
    }

    /// Merges a pre-aggregated value into the aggregate for `key`.
    pub fn update_aggregate(&self, key: &str, other: &Aggregate) {
        self.aggregate(key).merge(other);
    }

    /// Folds all entries of a report into this set, creating missing keys.
    pub fn merge(&self, report: &MeasurementSetReport) {
        for (key, value) in &report.counts {
            self.add(key, *value);
        }
        for (key, aggregate) in &report.aggregates {
            self.update_aggregate(key, aggregate);
        }
    }

    /// Snapshots all non-zero entries and resets them.
    ///
    /// Zero counters and empty aggregates are left out of the report. Recording that races with a
    /// drain lands either in this report or in the next one, never in both and never lost.
    pub fn drain(&self) -> MeasurementSetReport {
        let mut report = MeasurementSetReport::new();

        {
            let counters = self.counters.write();
            for (key, counter) in counters.iter() {
                let value = counter.reset_and_get();
                if value != 0 {
                    report.counts.insert(key.clone(), value);
                }
            }
        }

        {
            let aggregates = self.aggregates.write();
            for (key, aggregate) in aggregates.iter() {
                let value = aggregate.reset_and_get();
                if !value.is_empty() {
                    report.aggregates.insert(key.clone(), value);
                }
            }
        }

        report
    }

    /// Returns a view that adds `tags` to every key it records.
    pub fn tagged(self: &Arc<Self>, tags: MetricTags) -> TaggedMeasurementSet {
        TaggedMeasurementSet::new(Arc::clone(self), tags)
    }

    /// Returns the number of registered counter and aggregate entries.
    pub fn len(&self) -> usize {
        self.counters.read().len() + self.aggregates.read().len()
    }

    /// Returns `true` if nothing has been recorded since creation.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
