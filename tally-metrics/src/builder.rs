use std::time::Duration;

use tally_common::UnixTimestamp;

use crate::config::ReporterConfig;
use crate::key;
use crate::protocol::{Measurement, MeasurementsBatch, MetricTags, Summary, sanitize_name};
use crate::report::MeasurementSetReport;

/// Name of the counter reporting the number of measurements in a flush.
pub const MEASUREMENT_COUNT: &str = "tally.measurements";

/// Converts [`MeasurementSetReport`]s into size-bounded [`MeasurementsBatch`]es.
///
/// Counters come first, then aggregates, each in key order. Names are sanitized and prefixed.
/// Global tags are added to each measurement unless it already has a tag with the same key.
#[derive(Clone, Debug)]
pub struct BatchBuilder {
    prefix: String,
    global_tags: MetricTags,
    max_batch_size: usize,
    period: Duration,
    count_measurements: bool,
}

impl BatchBuilder {
    /// Creates a builder.
    ///
    /// A `max_batch_size` of zero is treated as one.
    pub fn new(
        prefix: impl Into<String>,
        global_tags: MetricTags,
        max_batch_size: usize,
        period: Duration,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            global_tags,
            max_batch_size: max_batch_size.max(1),
            period,
            count_measurements: false,
        }
    }

    /// Adds a [`MEASUREMENT_COUNT`] counter to every non-empty build.
    pub fn with_measurement_count(mut self, enabled: bool) -> Self {
        self.count_measurements = enabled;
        self
    }

    /// Creates a builder from the reporter configuration, resolving the host name tag.
    pub fn from_config(config: &ReporterConfig) -> Self {
        Self::new(
            config.prefix.clone(),
            config.resolved_global_tags(),
            config.max_batch_size,
            config.period,
        )
        .with_measurement_count(config.count_measurements)
    }

    /// Returns the global tags applied to every measurement.
    pub fn global_tags(&self) -> &MetricTags {
        &self.global_tags
    }

    fn measurement(&self, key: &str, value: impl FnOnce(String) -> Measurement) -> Measurement {
        let (name, tags) = key::decode(key);
        let name = format!("{}{}", self.prefix, sanitize_name(name));

        let mut tags = tags.unwrap_or_default();
        for (k, v) in &self.global_tags {
            tags.entry(k.clone()).or_insert_with(|| v.clone());
        }

        value(name).with_tags(tags)
    }

    /// Builds batches stamped with `time` from a report.
    ///
    /// Returns no batches for an empty report. Measurements that cannot be encoded are logged and
    /// skipped.
    pub fn build(
        &self,
        report: &MeasurementSetReport,
        time: UnixTimestamp,
    ) -> Vec<MeasurementsBatch> {
        let counts = report
            .counts
            .iter()
            .filter(|(_, value)| **value != 0)
            .map(|(key, value)| {
                self.measurement(key, |name| Measurement::scalar(name, *value as f64))
            });

        let aggregates = report
            .aggregates
            .iter()
            .filter(|(_, aggregate)| !aggregate.is_empty())
            .map(|(key, aggregate)| {
                self.measurement(key, |name| {
                    Measurement::summary(name, Summary::from_aggregate(aggregate))
                })
            });

        let total = report.counts.values().filter(|value| **value != 0).count()
            + report.aggregates.values().filter(|a| !a.is_empty()).count();
        let own_count = (self.count_measurements && total > 0).then(|| {
            self.measurement(MEASUREMENT_COUNT, |name| {
                Measurement::scalar(name, (total + 1) as f64)
            })
        });

        self.split(counts.chain(own_count).chain(aggregates), time)
    }

    /// Packs measurements into batches of at most the maximum batch size, preserving order.
    pub fn split<I>(&self, measurements: I, time: UnixTimestamp) -> Vec<MeasurementsBatch>
    where
        I: IntoIterator<Item = Measurement>,
    {
        let mut batches = Vec::new();
        let mut current = self.empty_batch(time);

        for measurement in measurements {
            if let Err(error) = measurement.validate() {
                tally_log::warn!(
                    error = &error as &dyn std::error::Error,
                    "dropping measurement that cannot be encoded"
                );
                continue;
            }

            if current.len() >= self.max_batch_size {
                let full = std::mem::replace(&mut current, self.empty_batch(time));
                batches.push(full);
            }

            current.measurements.push(measurement);
        }

        if !current.is_empty() {
            batches.push(current);
        }

        batches
    }

    fn empty_batch(&self, time: UnixTimestamp) -> MeasurementsBatch {
        let mut batch = MeasurementsBatch::new(time);
        batch.period = self.period.as_secs();
        batch
    }
}
