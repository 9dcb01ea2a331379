use std::sync::Arc;

use crate::aggregate::{Aggregate, SharedAggregate, SharedCounter};
use crate::key;
use crate::protocol::MetricTags;
use crate::registry::MeasurementSet;
use crate::report::MeasurementSetReport;

/// A view on a [`MeasurementSet`] that attaches a fixed set of tags to every key.
///
/// The view holds no measurements itself. Every call rewrites the key and delegates to the
/// underlying set, so recording through several views with different tags feeds the same
/// registry.
///
/// Keys passed in may already carry encoded tags. Those are combined with the pinned tags, and on
/// conflict the key's own tag wins.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use tally_metrics::{MeasurementSet, MetricTags, key};
///
/// let set = Arc::new(MeasurementSet::new());
/// let mut tags = MetricTags::new();
/// tags.insert("service".to_owned(), "api".to_owned());
///
/// let view = set.tagged(tags.clone());
/// view.incr("requests");
///
/// let report = set.drain();
/// assert_eq!(report.counts[&key::encode("requests", Some(&tags))], 1);
/// ```
#[derive(Clone, Debug)]
pub struct TaggedMeasurementSet {
    set: Arc<MeasurementSet>,
    tags: MetricTags,
}

impl TaggedMeasurementSet {
    /// Creates a view on `set` with the given tags.
    pub fn new(set: Arc<MeasurementSet>, tags: MetricTags) -> Self {
        Self { set, tags }
    }

    /// Returns the pinned tags.
    pub fn tags(&self) -> &MetricTags {
        &self.tags
    }

    /// Replaces the pinned tags.
    pub fn set_tags(&mut self, tags: MetricTags) {
        self.tags = tags;
    }

    /// Returns a new view with one more pinned tag, sharing the same set.
    pub fn with_tag(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut tags = self.tags.clone();
        tags.insert(key.into(), value.into());
        Self::new(Arc::clone(&self.set), tags)
    }

    /// Returns the underlying set.
    pub fn set(&self) -> &Arc<MeasurementSet> {
        &self.set
    }

    /// Rewrites a plain or encoded key to include the pinned tags.
    pub fn key(&self, key: &str) -> String {
        if self.tags.is_empty() {
            return key.to_owned();
        }

        let (name, own_tags) = key::decode(key);
        match own_tags {
            Some(own_tags) => {
                let mut tags = self.tags.clone();
                tags.extend(own_tags);
                key::encode(name, Some(&tags))
            }
            None => key::encode(name, Some(&self.tags)),
        }
    }

    /// See [`MeasurementSet::counter`].
    pub fn counter(&self, key: &str) -> Arc<SharedCounter> {
        self.set.counter(&self.key(key))
    }

    /// See [`MeasurementSet::aggregate`].
    pub fn aggregate(&self, key: &str) -> Arc<SharedAggregate> {
        self.set.aggregate(&self.key(key))
    }

    /// See [`MeasurementSet::incr`].
    pub fn incr(&self, key: &str) {
        self.set.incr(&self.key(key));
    }

    /// See [`MeasurementSet::add`].
    pub fn add(&self, key: &str, delta: i64) {
        self.set.add(&self.key(key), delta);
    }

    /// See [`MeasurementSet::update_value`].
    pub fn update_value(&self, key: &str, value: f64) {
        self.set.update_value(&self.key(key), value);
    }

    /// See [`MeasurementSet::update_aggregate`].
    pub fn update_aggregate(&self, key: &str, other: &Aggregate) {
        self.set.update_aggregate(&self.key(key), other);
    }

    /// Folds a report into the underlying set, adding the pinned tags to every key.
    pub fn merge(&self, report: &MeasurementSetReport) {
        for (key, value) in &report.counts {
            self.add(key, *value);
        }
        for (key, aggregate) in &report.aggregates {
            self.update_aggregate(key, aggregate);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> MetricTags {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn test_key_plain() {
        let set = Arc::new(MeasurementSet::new());
        let view = set.tagged(tags(&[("env", "prod")]));
        assert_eq!(view.key("hits"), "hits\0env\0prod");
    }

    #[test]
    fn test_key_combines_encoded_tags() {
        let set = Arc::new(MeasurementSet::new());
        let view = set.tagged(tags(&[("env", "prod"), ("zone", "a")]));

        let own = key::encode("hits", Some(&tags(&[("route", "/"), ("zone", "b")])));
        let combined = view.key(&own);

        let (name, decoded) = key::decode(&combined);
        assert_eq!(name, "hits");
        assert_eq!(
            decoded,
            Some(tags(&[("env", "prod"), ("route", "/"), ("zone", "b")]))
        );
    }

    #[test]
    fn test_shares_storage() {
        let set = Arc::new(MeasurementSet::new());
        let view = set.tagged(tags(&[("env", "prod")]));
        let other = view.with_tag("host", "a");

        view.incr("hits");
        view.add("hits", 2);
        other.update_value("latency", 4.0);
        set.incr("hits");

        let report = set.drain();
        assert_eq!(report.counts["hits"], 1);
        assert_eq!(report.counts["hits\0env\0prod"], 3);
        assert_eq!(report.aggregates["latency\0env\0prod\0host\0a"].count, 1);
    }

    #[test]
    fn test_set_tags_and_merge() {
        let set = Arc::new(MeasurementSet::new());
        let mut view = set.tagged(MetricTags::new());
        assert_eq!(view.key("hits"), "hits");

        view.set_tags(tags(&[("region", "eu")]));
        assert_eq!(view.tags(), &tags(&[("region", "eu")]));

        let mut report = MeasurementSetReport::new();
        report.counts.insert("hits".to_owned(), 4);
        report
            .aggregates
            .insert("cpu".to_owned(), Aggregate::single(0.5));
        view.merge(&report);

        let drained = set.drain();
        assert_eq!(drained.counts["hits\0region\0eu"], 4);
        assert_eq!(drained.aggregates["cpu\0region\0eu"], Aggregate::single(0.5));
    }
}
