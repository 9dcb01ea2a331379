use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::protocol::MeasurementsBatch;
use crate::sink::{DeliveryError, DeliverySink};

/// Records every batch it receives.
#[derive(Clone, Debug, Default)]
pub struct CollectingSink {
    batches: Arc<Mutex<Vec<MeasurementsBatch>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<MeasurementsBatch> {
        self.batches.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.batches.lock().len()
    }
}

#[async_trait]
impl DeliverySink for CollectingSink {
    fn name(&self) -> &str {
        "collecting"
    }

    async fn deliver(&self, batch: &MeasurementsBatch) -> Result<(), DeliveryError> {
        self.batches.lock().push(batch.clone());
        Ok(())
    }
}

/// Fails the first `failures` deliveries, then records batches like [`CollectingSink`].
///
/// With `usize::MAX` failures it never succeeds.
#[derive(Clone, Debug)]
pub struct FlakySink {
    failures: usize,
    attempts: Arc<AtomicUsize>,
    inner: CollectingSink,
}

impl FlakySink {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            attempts: Arc::new(AtomicUsize::new(0)),
            inner: CollectingSink::new(),
        }
    }

    pub fn failing() -> Self {
        Self::new(usize::MAX)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<MeasurementsBatch> {
        self.inner.batches()
    }
}

#[async_trait]
impl DeliverySink for FlakySink {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn deliver(&self, batch: &MeasurementsBatch) -> Result<(), DeliveryError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(DeliveryError::Unavailable(format!("attempt {attempt} failed")));
        }
        self.inner.deliver(batch).await
    }
}

/// Never completes a delivery.
#[derive(Clone, Debug, Default)]
pub struct StuckSink {
    attempts: Arc<AtomicUsize>,
}

impl StuckSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeliverySink for StuckSink {
    fn name(&self) -> &str {
        "stuck"
    }

    async fn deliver(&self, _batch: &MeasurementsBatch) -> Result<(), DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}
