use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::MetricTags;

/// Name of the global tag carrying the host name.
pub const HOSTNAME_TAG: &str = "hostname";

/// An error returned when a configuration has an invalid value.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// A field has a value outside of its valid range.
    #[error("invalid value for `{field}`: {reason}")]
    Invalid {
        /// Name of the field.
        field: &'static str,
        /// Why the value is invalid.
        reason: &'static str,
    },
}

fn ensure(valid: bool, field: &'static str, reason: &'static str) -> Result<(), ConfigError> {
    if valid {
        Ok(())
    } else {
        Err(ConfigError::Invalid { field, reason })
    }
}

/// Returns the name of this host, or `"na"` if it cannot be determined.
pub fn hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "na".to_owned())
}

/// Parameters for the [`Reporter`](crate::Reporter).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ReporterConfig {
    /// Interval between flushes.
    ///
    /// Flushes are aligned to wall-clock multiples of this period since the UNIX epoch, so
    /// independent processes flush at the same instants. Defaults to `60s`.
    #[serde(with = "humantime_serde")]
    pub period: Duration,

    /// Prefix prepended to every measurement name, for example `"myapp."`.
    pub prefix: String,

    /// Tags added to every measurement that does not define the same tag itself.
    pub global_tags: MetricTags,

    /// Adds a `hostname` global tag with the name of this host.
    ///
    /// An explicit `hostname` entry in `global_tags` takes precedence. Defaults to `true`.
    pub hostname_tag: bool,

    /// Maximum number of delivery attempts per batch and sink, including the first one.
    ///
    /// Defaults to `3`.
    pub max_post_retries: u32,

    /// Maximum number of measurements per batch. Defaults to `1000`.
    pub max_batch_size: usize,

    /// Number of batches that can wait for delivery per sink.
    ///
    /// Batches beyond this are dropped with an error log. Defaults to `100`.
    pub queue_size: usize,

    /// Drains and delivers remaining measurements when the reporter is closed.
    ///
    /// Defaults to `true`.
    pub flush_on_shutdown: bool,

    /// Maximum time [`Reporter::close`](crate::Reporter::close) waits for pending deliveries.
    ///
    /// Defaults to `5s`.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Adds a [`MEASUREMENT_COUNT`](crate::MEASUREMENT_COUNT) counter to every flush with the
    /// number of measurements it contains, itself included. Defaults to `false`.
    pub count_measurements: bool,
}

impl ReporterConfig {
    /// Checks that all values are within their valid ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure(!self.period.is_zero(), "period", "must be positive")?;
        ensure(self.max_post_retries >= 1, "max_post_retries", "must be at least 1")?;
        ensure(self.max_batch_size >= 1, "max_batch_size", "must be at least 1")?;
        ensure(self.queue_size >= 1, "queue_size", "must be at least 1")?;
        Ok(())
    }

    /// Returns the global tags including the host name tag if enabled.
    pub fn resolved_global_tags(&self) -> MetricTags {
        let mut tags = self.global_tags.clone();
        if self.hostname_tag && !tags.contains_key(HOSTNAME_TAG) {
            tags.insert(HOSTNAME_TAG.to_owned(), hostname());
        }
        tags
    }
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(60),
            prefix: String::new(),
            global_tags: MetricTags::new(),
            hostname_tag: true,
            max_post_retries: 3,
            max_batch_size: 1000,
            queue_size: 100,
            flush_on_shutdown: true,
            shutdown_timeout: Duration::from_secs(5),
            count_measurements: false,
        }
    }
}

/// Parameters for the [`BatchPersister`](crate::BatchPersister).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchPersisterConfig {
    /// Number of measurements that triggers a batch. Defaults to `1000`.
    pub max_batch_size: usize,

    /// Interval after which pending measurements are flushed regardless of their number.
    ///
    /// Defaults to `2s`.
    #[serde(with = "humantime_serde")]
    pub push_interval: Duration,

    /// Number of consecutive delivery errors after which the pipeline stops. Defaults to `5`.
    pub error_limit: usize,

    /// Capacity of the queues between pipeline stages. Defaults to `100`.
    pub queue_size: usize,

    /// Tags attached to every batch.
    pub global_tags: Option<MetricTags>,
}

impl BatchPersisterConfig {
    /// Checks that all values are within their valid ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure(self.max_batch_size >= 1, "max_batch_size", "must be at least 1")?;
        ensure(!self.push_interval.is_zero(), "push_interval", "must be positive")?;
        ensure(self.error_limit >= 1, "error_limit", "must be at least 1")?;
        ensure(self.queue_size >= 1, "queue_size", "must be at least 1")?;
        Ok(())
    }
}

impl Default for BatchPersisterConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1000,
            push_interval: Duration::from_secs(2),
            error_limit: 5,
            queue_size: 100,
            global_tags: None,
        }
    }
}

/// Parameters for the [`RuntimeRecorder`](crate::RuntimeRecorder).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Records process statistics when enabled, see
    /// [`RuntimeRecorder::spawn_if_enabled`](crate::RuntimeRecorder::spawn_if_enabled).
    ///
    /// Defaults to `false`.
    pub enabled: bool,

    /// Interval between samples. Defaults to `10s`.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl RuntimeConfig {
    /// Checks that all values are within their valid ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure(!self.interval.is_zero(), "interval", "must be positive")
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(10),
        }
    }
}
