use async_trait::async_trait;

use crate::protocol::{MeasurementValue, MeasurementsBatch};

/// An error returned by a [`DeliverySink`] when a batch could not be delivered.
///
/// All variants are treated as transient by the callers: the [`Reporter`](crate::Reporter)
/// retries up to its attempt limit, the [`BatchPersister`](crate::BatchPersister) counts them
/// toward its error limit.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// The batch could not be serialized.
    #[error("could not encode batch")]
    Encode(#[from] serde_json::Error),
    /// The receiver refused the batch.
    #[error("batch rejected: {0}")]
    Rejected(String),
    /// The receiver could not be reached.
    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

/// Destination for [`MeasurementsBatch`]es.
///
/// Implementations must be safe to call repeatedly with the same batch, since failed deliveries
/// are retried. The batch is borrowed and must not be retained beyond the call.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    /// A short name used in logs.
    fn name(&self) -> &str;

    /// Delivers one batch.
    async fn deliver(&self, batch: &MeasurementsBatch) -> Result<(), DeliveryError>;
}

/// A sink that writes batches to the log instead of sending them anywhere.
///
/// Every batch is logged at `info`, every measurement at `debug`.
#[derive(Clone, Debug)]
pub struct LogSink {
    name: String,
}

impl LogSink {
    /// Creates a log sink with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new("log")
    }
}

#[async_trait]
impl DeliverySink for LogSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, batch: &MeasurementsBatch) -> Result<(), DeliveryError> {
        tally_log::info!(
            sink = %self.name,
            batch.time = batch.time.as_secs(),
            batch.period = batch.period,
            batch.size = batch.len(),
            "delivering batch"
        );

        for measurement in &batch.measurements {
            match &measurement.value {
                MeasurementValue::Scalar { value } => tally_log::debug!(
                    sink = %self.name,
                    name = %measurement.name,
                    tags = ?measurement.tags,
                    value,
                    "measurement"
                ),
                MeasurementValue::Summary(summary) => tally_log::debug!(
                    sink = %self.name,
                    name = %measurement.name,
                    tags = ?measurement.tags,
                    summary = ?summary,
                    "measurement"
                ),
            }
        }

        Ok(())
    }
}
