//! Batched persistence of pre-built measurements with a circuit breaker.
//!
//! The [`BatchPersister`] runs three stages connected by bounded queues:
//!
//!  1. **Batching** collects submitted measurements and cuts them into batches of the maximum
//!     size. Whatever is left over is flushed when the push interval elapses.
//!  2. **Persisting** hands each batch to the sink once and reports the outcome. It waits for the
//!     error manager's verdict before delivering the next batch.
//!  3. **Error management** counts consecutive failures. Once the error limit is reached it trips
//!     the breaker, which stops all stages immediately. A trip also cuts short a graceful stop.
//!
//! A tripped persister does not recover. Create a new one to resume delivery.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tally_common::UnixTimestamp;
use tally_log::LogError;
use tally_system::{Shutdown, ShutdownHandle, ShutdownSignal};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::{BatchPersisterConfig, ConfigError};
use crate::protocol::{Measurement, MeasurementsBatch, MetricTags};
use crate::sink::{DeliveryError, DeliverySink};

/// An error returned when submitting measurements to a [`PersisterHandle`].
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The persister was stopped or its breaker tripped.
    #[error("batch persister has stopped")]
    Stopped,
    /// The submission queue is full.
    #[error("batch persister queue is full")]
    Full,
}

/// Counters describing the progress of a running [`BatchPersister`].
#[derive(Debug, Default)]
pub struct PersisterStats {
    batches_persisted: AtomicU64,
    batches_failed: AtomicU64,
    errors_recorded: AtomicU64,
    measurements_dropped: AtomicU64,
    tripped: AtomicBool,
    batching_stopped: AtomicBool,
    persisting_stopped: AtomicBool,
    error_manager_stopped: AtomicBool,
}

impl PersisterStats {
    /// Number of batches the sink accepted.
    pub fn batches_persisted(&self) -> u64 {
        self.batches_persisted.load(Ordering::Relaxed)
    }

    /// Number of batches the sink rejected.
    pub fn batches_failed(&self) -> u64 {
        self.batches_failed.load(Ordering::Relaxed)
    }

    /// Number of failures counted by the error manager.
    pub fn errors_recorded(&self) -> u64 {
        self.errors_recorded.load(Ordering::Relaxed)
    }

    /// Number of measurements dropped because they could not be encoded or the persister stopped
    /// immediately.
    pub fn measurements_dropped(&self) -> u64 {
        self.measurements_dropped.load(Ordering::Relaxed)
    }

    /// Returns `true` if the error limit was reached.
    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    /// Returns `true` once the batching stage has exited.
    pub fn batching_stopped(&self) -> bool {
        self.batching_stopped.load(Ordering::Acquire)
    }

    /// Returns `true` once the persisting stage has exited.
    pub fn persisting_stopped(&self) -> bool {
        self.persisting_stopped.load(Ordering::Acquire)
    }

    /// Returns `true` once the error management stage has exited.
    pub fn error_manager_stopped(&self) -> bool {
        self.error_manager_stopped.load(Ordering::Acquire)
    }
}

/// Pipeline that batches raw [`Measurement`]s and persists them to a sink.
///
/// See the [module documentation](self) for the stages.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use tally_metrics::{BatchPersister, BatchPersisterConfig, LogSink, Measurement};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let persister =
///     BatchPersister::new(BatchPersisterConfig::default(), Arc::new(LogSink::default())).unwrap();
/// let mut handle = persister.start();
///
/// handle.submit(vec![Measurement::scalar("queue.depth", 12.0)]).await.unwrap();
///
/// // Flushes the pending measurement as a final batch.
/// handle.stop().await;
/// assert_eq!(handle.stats().batches_persisted(), 1);
/// # });
/// ```
pub struct BatchPersister {
    config: BatchPersisterConfig,
    sink: Arc<dyn DeliverySink>,
}

impl BatchPersister {
    /// Creates a persister delivering to `sink`.
    pub fn new(
        config: BatchPersisterConfig,
        sink: Arc<dyn DeliverySink>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config, sink })
    }

    /// Spawns the pipeline stages and returns a handle to feed them.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> PersisterHandle {
        let queue_size = self.config.queue_size;
        let (prep_tx, prep_rx) = mpsc::channel(queue_size);
        let (batch_tx, batch_rx) = mpsc::channel(queue_size);
        let (outcome_tx, outcome_rx) = mpsc::channel(1);

        let signal = ShutdownSignal::new();
        let stats = Arc::new(PersisterStats::default());

        let batching = Batching {
            max_batch_size: self.config.max_batch_size,
            global_tags: self.config.global_tags,
            pending: Vec::new(),
            batch_tx,
            stats: Arc::clone(&stats),
        };
        let persisting = Persisting {
            sink: self.sink,
            outcome_tx,
            stats: Arc::clone(&stats),
        };
        let error_manager = ErrorManager {
            error_limit: self.config.error_limit,
            consecutive: 0,
            signal: signal.clone(),
            stats: Arc::clone(&stats),
        };

        let first_tick = Instant::now() + self.config.push_interval;
        let tasks = vec![
            tokio::spawn(batching.run(
                prep_rx,
                first_tick,
                self.config.push_interval,
                signal.handle(),
            )),
            tokio::spawn(persisting.run(batch_rx, signal.handle())),
            tokio::spawn(error_manager.run(outcome_rx, signal.handle())),
        ];

        PersisterHandle {
            tx: prep_tx,
            signal,
            stats,
            tasks,
        }
    }
}

/// Stage that cuts incoming measurements into batches.
struct Batching {
    max_batch_size: usize,
    global_tags: Option<MetricTags>,
    pending: Vec<Measurement>,
    batch_tx: mpsc::Sender<MeasurementsBatch>,
    stats: Arc<PersisterStats>,
}

impl Batching {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<Vec<Measurement>>,
        first_tick: Instant,
        push_interval: std::time::Duration,
        mut shutdown: ShutdownHandle,
    ) {
        let mut ticker = tokio::time::interval_at(first_tick, push_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tally_log::debug!("batching started");

        loop {
            tokio::select! {
                biased;

                shutdown = shutdown.notified() => {
                    if shutdown.is_graceful() {
                        rx.close();
                        while let Some(measurements) = rx.recv().await {
                            self.accept(measurements);
                        }
                        self.push_full().await;
                        self.push_remainder().await;
                    } else if !self.pending.is_empty() {
                        tally_log::warn!(
                            measurements = self.pending.len(),
                            "dropping pending measurements on immediate stop"
                        );
                        self.stats
                            .measurements_dropped
                            .fetch_add(self.pending.len() as u64, Ordering::Relaxed);
                    }
                    break;
                }
                _ = ticker.tick() => {
                    self.push_full().await;
                    self.push_remainder().await;
                }
                Some(measurements) = rx.recv() => {
                    self.accept(measurements);
                    self.push_full().await;
                }
            }
        }

        self.stats.batching_stopped.store(true, Ordering::Release);
        tally_log::debug!("batching stopped");
    }

    fn accept(&mut self, measurements: Vec<Measurement>) {
        for measurement in measurements {
            match measurement.validate() {
                Ok(()) => self.pending.push(measurement),
                Err(error) => {
                    tally_log::warn!(
                        error = &error as &dyn std::error::Error,
                        "dropping measurement that cannot be encoded"
                    );
                    self.stats
                        .measurements_dropped
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Emits batches of exactly the maximum size while enough measurements are pending.
    async fn push_full(&mut self) {
        while self.pending.len() >= self.max_batch_size {
            let rest = self.pending.split_off(self.max_batch_size);
            let full = std::mem::replace(&mut self.pending, rest);
            self.push(full).await;
        }
    }

    /// Emits everything that is pending as one batch.
    async fn push_remainder(&mut self) {
        if !self.pending.is_empty() {
            let remainder = std::mem::take(&mut self.pending);
            self.push(remainder).await;
        }
    }

    async fn push(&mut self, measurements: Vec<Measurement>) {
        let mut batch = MeasurementsBatch::new(UnixTimestamp::now());
        batch.tags = self.global_tags.clone();
        batch.measurements = measurements;

        tally_log::trace!(batch.size = batch.len(), "batch ready");
        if let Err(mpsc::error::SendError(batch)) = self.batch_tx.send(batch).await {
            self.stats
                .measurements_dropped
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
        }
    }
}

/// The result of one delivery, answered by the error manager.
struct Outcome {
    result: Result<(), DeliveryError>,
    /// Receives `true` if persisting may continue.
    verdict: oneshot::Sender<bool>,
}

/// Stage that delivers batches to the sink.
struct Persisting {
    sink: Arc<dyn DeliverySink>,
    outcome_tx: mpsc::Sender<Outcome>,
    stats: Arc<PersisterStats>,
}

impl Persisting {
    async fn run(self, mut rx: mpsc::Receiver<MeasurementsBatch>, mut shutdown: ShutdownHandle) {
        tally_log::debug!(sink = self.sink.name(), "persisting started");

        loop {
            tokio::select! {
                biased;

                shutdown = shutdown.notified() => {
                    if shutdown.is_graceful() {
                        // The batching stage closes the queue after its final flush.
                        while let Some(batch) = rx.recv().await {
                            if !self.persist(&batch).await {
                                break;
                            }
                        }
                    }
                    break;
                }
                Some(batch) = rx.recv() => {
                    if !self.persist(&batch).await {
                        break;
                    }
                }
            }
        }

        self.stats.persisting_stopped.store(true, Ordering::Release);
        tally_log::debug!(sink = self.sink.name(), "persisting stopped");
    }

    /// Delivers one batch and waits for the verdict. Returns `false` once the breaker tripped.
    async fn persist(&self, batch: &MeasurementsBatch) -> bool {
        if self.stats.is_tripped() {
            return false;
        }

        let result = self.sink.deliver(batch).await;

        match &result {
            Ok(()) => {
                self.stats.batches_persisted.fetch_add(1, Ordering::Relaxed);
                tally_log::trace!(
                    sink = self.sink.name(),
                    batch.size = batch.len(),
                    "batch persisted"
                );
            }
            Err(error) => {
                self.stats.batches_failed.fetch_add(1, Ordering::Relaxed);
                tally_log::warn!(
                    sink = self.sink.name(),
                    batch.size = batch.len(),
                    error = error as &dyn std::error::Error,
                    "failed to persist batch"
                );
            }
        }

        let (verdict, verdict_rx) = oneshot::channel();
        if self.outcome_tx.send(Outcome { result, verdict }).await.is_err() {
            return false;
        }

        // A dropped verdict means the error manager stopped.
        verdict_rx.await.unwrap_or(false)
    }
}

/// Stage that counts consecutive persistence failures and trips the breaker.
struct ErrorManager {
    error_limit: usize,
    consecutive: usize,
    signal: ShutdownSignal,
    stats: Arc<PersisterStats>,
}

impl ErrorManager {
    async fn run(mut self, mut rx: mpsc::Receiver<Outcome>, mut shutdown: ShutdownHandle) {
        loop {
            tokio::select! {
                biased;

                Some(outcome) = rx.recv() => {
                    if self.record(outcome) {
                        break;
                    }
                }
                shutdown = shutdown.notified() => {
                    if shutdown.is_graceful() {
                        while let Some(outcome) = rx.recv().await {
                            if self.record(outcome) {
                                break;
                            }
                        }
                    }
                    break;
                }
            }
        }

        self.stats.error_manager_stopped.store(true, Ordering::Release);
        tally_log::debug!("error manager stopped");
    }

    /// Records one outcome and answers its verdict. Returns `true` if the breaker tripped.
    fn record(&mut self, outcome: Outcome) -> bool {
        let tripped = self.check(outcome.result);
        // Persisting may have stopped on an immediate shutdown.
        outcome.verdict.send(!tripped).ok();
        tripped
    }

    fn check(&mut self, result: Result<(), DeliveryError>) -> bool {
        if result.is_ok() {
            self.consecutive = 0;
            return false;
        }

        self.consecutive += 1;
        self.stats.errors_recorded.fetch_add(1, Ordering::Relaxed);

        if self.consecutive < self.error_limit {
            return false;
        }

        // Set before the verdict is sent, so persisting never delivers past the limit.
        self.stats.tripped.store(true, Ordering::Release);
        tally_log::error!(
            errors = self.consecutive,
            error_limit = self.error_limit,
            "persistence error limit reached, stopping batch persister"
        );
        self.signal.trigger(Shutdown::immediate());
        true
    }
}

/// Handle to a running [`BatchPersister`].
///
/// Dropping the handle stops the pipeline gracefully in the background.
pub struct PersisterHandle {
    tx: mpsc::Sender<Vec<Measurement>>,
    signal: ShutdownSignal,
    stats: Arc<PersisterStats>,
    tasks: Vec<JoinHandle<()>>,
}

impl PersisterHandle {
    /// Returns a sender feeding the batching stage directly.
    ///
    /// Sends fail once the batching stage has stopped.
    pub fn sender(&self) -> mpsc::Sender<Vec<Measurement>> {
        self.tx.clone()
    }

    /// Submits measurements, waiting for queue capacity.
    pub async fn submit(&self, measurements: Vec<Measurement>) -> Result<(), PipelineError> {
        if self.signal.is_triggered() {
            return Err(PipelineError::Stopped);
        }

        self.tx
            .send(measurements)
            .await
            .map_err(|_| PipelineError::Stopped)
    }

    /// Submits measurements without waiting.
    pub fn try_submit(&self, measurements: Vec<Measurement>) -> Result<(), PipelineError> {
        if self.signal.is_triggered() {
            return Err(PipelineError::Stopped);
        }

        self.tx.try_send(measurements).map_err(|error| match error {
            TrySendError::Full(_) => PipelineError::Full,
            TrySendError::Closed(_) => PipelineError::Stopped,
        })
    }

    /// Returns `true` if the error limit was reached.
    pub fn is_tripped(&self) -> bool {
        self.stats.is_tripped()
    }

    /// Returns the pipeline counters.
    pub fn stats(&self) -> &PersisterStats {
        &self.stats
    }

    /// Stops the pipeline gracefully and waits for all stages to exit.
    ///
    /// Pending measurements are flushed as a final batch and queued batches are persisted. If the
    /// breaker trips while draining, the remaining batches are dropped.
    pub async fn stop(&mut self) {
        self.signal.trigger(Shutdown::graceful(std::time::Duration::ZERO));
        self.join().await;
    }

    /// Waits for all stages to exit, for example after the breaker tripped.
    pub async fn join(&mut self) {
        for task in self.tasks.drain(..) {
            if let Err(error) = task.await {
                tally_log::error!("batch persister stage failed: {}", LogError(&error));
            }
        }
    }
}

impl Drop for PersisterHandle {
    fn drop(&mut self) {
        self.signal
            .trigger(Shutdown::graceful(std::time::Duration::ZERO));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::testutils::{CollectingSink, FlakySink};

    fn measurements(count: usize) -> Vec<Measurement> {
        (0..count)
            .map(|i| Measurement::scalar(format!("m{i}"), i as f64))
            .collect()
    }

    fn config(max_batch_size: usize, push_interval: Duration) -> BatchPersisterConfig {
        BatchPersisterConfig {
            max_batch_size,
            push_interval,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_splits_into_max_size_batches() {
        tally_test::setup();
        tokio::time::pause();

        let sink = CollectingSink::new();
        let persister =
            BatchPersister::new(config(1000, Duration::from_secs(2)), Arc::new(sink.clone()))
                .unwrap();
        let mut handle = persister.start();

        handle.submit(measurements(2500)).await.unwrap();

        // Two full batches go out right away, the remainder waits for the timer.
        assert!(tally_test::wait_until(Duration::from_secs(1), || sink.len() == 2).await);
        tokio::time::sleep(Duration::from_millis(2500)).await;

        let batches = sink.batches();
        let sizes: Vec<_> = batches.iter().map(MeasurementsBatch::len).collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);
        assert_eq!(batches[0].measurements[0].name, "m0");
        assert_eq!(batches[1].measurements[0].name, "m1000");
        assert_eq!(batches[2].measurements[499].name, "m2499");

        handle.stop().await;
        assert_eq!(handle.stats().batches_persisted(), 3);
    }

    #[tokio::test]
    async fn test_flushes_on_timer() {
        tally_test::setup();
        tokio::time::pause();

        let sink = CollectingSink::new();
        let persister =
            BatchPersister::new(config(1000, Duration::from_millis(100)), Arc::new(sink.clone()))
                .unwrap();
        let mut handle = persister.start();

        for measurement in measurements(5) {
            handle.submit(vec![measurement]).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.len(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 5);

        handle.stop().await;
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_global_tags_on_batch() {
        tokio::time::pause();

        let sink = CollectingSink::new();
        let mut tags = MetricTags::new();
        tags.insert("source".to_owned(), "importer".to_owned());
        let config = BatchPersisterConfig {
            global_tags: Some(tags.clone()),
            ..Default::default()
        };

        let mut handle = BatchPersister::new(config, Arc::new(sink.clone()))
            .unwrap()
            .start();
        handle.submit(measurements(1)).await.unwrap();
        handle.stop().await;

        assert_eq!(sink.batches()[0].tags, Some(tags));
    }

    #[tokio::test]
    async fn test_breaker_trips_at_error_limit() {
        tally_test::setup();
        tokio::time::pause();

        let sink = FlakySink::failing();
        let config = BatchPersisterConfig {
            max_batch_size: 1,
            error_limit: 5,
            ..Default::default()
        };
        let mut handle = BatchPersister::new(config, Arc::new(sink.clone()))
            .unwrap()
            .start();

        handle.submit(measurements(50)).await.unwrap();
        handle.join().await;

        let stats = handle.stats();
        assert!(handle.is_tripped());
        assert_eq!(stats.errors_recorded(), 5);
        assert!(stats.persisting_stopped());
        assert!(stats.error_manager_stopped());
        assert!(stats.batching_stopped());
        assert_eq!(sink.attempts(), 5);
        assert_eq!(stats.batches_failed(), 5);
        assert!(sink.delivered().is_empty());

        assert!(matches!(
            handle.submit(measurements(1)).await,
            Err(PipelineError::Stopped)
        ));
        assert!(matches!(
            handle.try_submit(measurements(1)),
            Err(PipelineError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_breaker_cuts_graceful_stop_short() {
        tally_test::setup();
        tokio::time::pause();

        let sink = FlakySink::failing();
        let config = BatchPersisterConfig {
            max_batch_size: 1,
            error_limit: 5,
            push_interval: Duration::from_secs(60),
            ..Default::default()
        };
        let mut handle = BatchPersister::new(config, Arc::new(sink.clone()))
            .unwrap()
            .start();

        handle.submit(measurements(50)).await.unwrap();
        handle.stop().await;

        let stats = handle.stats();
        assert!(stats.is_tripped());
        assert_eq!(stats.errors_recorded(), 5);
        assert_eq!(sink.attempts(), 5);
        assert!(stats.persisting_stopped());
        assert!(stats.error_manager_stopped());
        assert!(stats.batching_stopped());
    }

    #[tokio::test]
    async fn test_success_resets_error_count() {
        tally_test::setup();
        tokio::time::pause();

        // Fails twice, then succeeds for good.
        let sink = FlakySink::new(2);
        let config = BatchPersisterConfig {
            max_batch_size: 1,
            error_limit: 3,
            ..Default::default()
        };
        let mut handle = BatchPersister::new(config, Arc::new(sink.clone()))
            .unwrap()
            .start();

        handle.submit(measurements(6)).await.unwrap();
        handle.stop().await;

        let stats = handle.stats();
        assert!(!stats.is_tripped());
        assert_eq!(stats.errors_recorded(), 2);
        assert_eq!(stats.batches_failed(), 2);
        assert_eq!(stats.batches_persisted(), 4);
    }

    #[tokio::test]
    async fn test_stop_flushes_pending() {
        tokio::time::pause();

        let sink = CollectingSink::new();
        let mut handle = BatchPersister::new(
            config(1000, Duration::from_secs(60)),
            Arc::new(sink.clone()),
        )
        .unwrap()
        .start();

        handle.submit(measurements(3)).await.unwrap();
        handle.stop().await;

        assert_eq!(sink.len(), 1);
        assert_eq!(sink.batches()[0].len(), 3);
        assert!(handle.stats().batching_stopped());
        assert!(matches!(
            handle.submit(measurements(1)).await,
            Err(PipelineError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_drops_non_finite_measurements() {
        tally_test::setup();
        tokio::time::pause();

        let sink = CollectingSink::new();
        let mut handle = BatchPersister::new(
            config(1000, Duration::from_secs(60)),
            Arc::new(sink.clone()),
        )
        .unwrap()
        .start();

        handle
            .submit(vec![
                Measurement::scalar("ok", 1.0),
                Measurement::scalar("nan", f64::NAN),
            ])
            .await
            .unwrap();
        handle.stop().await;

        assert_eq!(handle.stats().measurements_dropped(), 1);
        assert_eq!(sink.batches()[0].measurements[0].name, "ok");
        assert_eq!(sink.batches()[0].len(), 1);
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = BatchPersisterConfig {
            error_limit: 0,
            ..Default::default()
        };
        assert!(BatchPersister::new(config, Arc::new(CollectingSink::new())).is_err());
    }
}
