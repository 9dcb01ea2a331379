//! Periodic delivery of a [`MeasurementSet`] to one or more sinks.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tally_common::{UnixTimestamp, next_boundary};
use tally_system::{Shutdown, ShutdownHandle, ShutdownSignal};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::builder::BatchBuilder;
use crate::config::{ConfigError, ReporterConfig};
use crate::protocol::MeasurementsBatch;
use crate::registry::MeasurementSet;
use crate::sink::DeliverySink;

/// The lifecycle state of a [`Reporter`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReporterState {
    /// Created but not started.
    Idle,
    /// Waiting for the next flush boundary.
    Running,
    /// Draining the measurement set and queueing batches.
    Draining,
    /// Closed. This state is final.
    Stopped,
}

/// An error returned when creating or starting a [`Reporter`].
#[derive(Debug, thiserror::Error)]
pub enum ReporterError {
    /// The configuration is invalid.
    #[error("invalid reporter configuration")]
    Config(#[from] ConfigError),
    /// No sinks were given.
    #[error("reporter requires at least one sink")]
    NoSinks,
    /// [`Reporter::start`] was called on a reporter that is not idle.
    #[error("reporter has already been started")]
    AlreadyStarted,
}

/// A bounded delivery queue feeding one sink's worker.
struct SinkQueue {
    name: String,
    tx: mpsc::Sender<Arc<MeasurementsBatch>>,
}

/// Drains the measurement set on aligned boundaries and fans batches out to the sink queues.
struct Scheduler {
    set: Arc<MeasurementSet>,
    builder: BatchBuilder,
    queues: Vec<SinkQueue>,
    period: Duration,
    flush_on_shutdown: bool,
    state: Arc<Mutex<ReporterState>>,
}

impl Scheduler {
    async fn run(self, mut shutdown: ShutdownHandle) {
        tally_log::info!(period = ?self.period, "reporter started");

        // Each boundary is flushed at most once, even if the timer fires early.
        let mut last_boundary = SystemTime::UNIX_EPOCH;

        loop {
            let now = SystemTime::now().max(last_boundary);
            let boundary = next_boundary(now, self.period);
            let delay = boundary.duration_since(now).unwrap_or_default();

            tokio::select! {
                biased;

                shutdown = shutdown.notified() => {
                    if shutdown.is_graceful() && self.flush_on_shutdown {
                        self.flush(boundary);
                    }
                    break;
                }
                () = tokio::time::sleep(delay) => {
                    self.flush(boundary);
                    last_boundary = boundary;
                }
            }
        }

        // Dropping the queues lets the workers finish what is queued and exit.
        drop(self.queues);
        tally_log::info!("reporter stopped");
    }

    fn flush(&self, boundary: SystemTime) {
        *self.state.lock() = ReporterState::Draining;

        let report = self.set.drain();
        if report.is_empty() {
            tally_log::trace!("nothing to report");
        } else {
            let time = UnixTimestamp::from_system(boundary);
            let batches = self.builder.build(&report, time);
            tally_log::debug!(
                batch.time = time.as_secs(),
                batch.count = batches.len(),
                report.entries = report.len(),
                "flushing measurements"
            );

            for batch in batches {
                self.enqueue(Arc::new(batch));
            }
        }

        let mut state = self.state.lock();
        if *state == ReporterState::Draining {
            *state = ReporterState::Running;
        }
    }

    fn enqueue(&self, batch: Arc<MeasurementsBatch>) {
        for queue in &self.queues {
            match queue.tx.try_send(Arc::clone(&batch)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => tally_log::error!(
                    sink = %queue.name,
                    batch.size = batch.len(),
                    "delivery queue is full, dropping batch"
                ),
                Err(TrySendError::Closed(_)) => tally_log::error!(
                    sink = %queue.name,
                    batch.size = batch.len(),
                    "delivery worker stopped, dropping batch"
                ),
            }
        }
    }
}

/// Delivers a batch, retrying immediately on failure until `max_attempts` is reached.
async fn deliver_with_retries(
    sink: &dyn DeliverySink,
    batch: &MeasurementsBatch,
    max_attempts: u32,
) {
    for attempt in 1..=max_attempts {
        let error = match sink.deliver(batch).await {
            Ok(()) => {
                tally_log::trace!(sink = sink.name(), batch.size = batch.len(), "batch delivered");
                return;
            }
            Err(error) => error,
        };

        if attempt < max_attempts {
            tally_log::warn!(
                sink = sink.name(),
                attempt,
                error = &error as &dyn std::error::Error,
                "failed to deliver batch, retrying"
            );
        } else {
            tally_log::error!(
                sink = sink.name(),
                attempt,
                batch.size = batch.len(),
                error = &error as &dyn std::error::Error,
                "failed to deliver batch, dropping it"
            );
        }
    }
}

/// Reads batches from one queue and hands them to its sink.
async fn run_worker(
    sink: Arc<dyn DeliverySink>,
    mut rx: mpsc::Receiver<Arc<MeasurementsBatch>>,
    mut shutdown: ShutdownHandle,
    max_attempts: u32,
) {
    tally_log::debug!(sink = sink.name(), "delivery worker started");

    loop {
        tokio::select! {
            biased;

            shutdown = shutdown.notified() => {
                if shutdown.is_graceful() {
                    // The scheduler closes the queue after its final flush.
                    while let Some(batch) = rx.recv().await {
                        deliver_with_retries(sink.as_ref(), &batch, max_attempts).await;
                    }
                }
                break;
            }
            Some(batch) = rx.recv() => {
                deliver_with_retries(sink.as_ref(), &batch, max_attempts).await;
            }
        }
    }

    tally_log::debug!(sink = sink.name(), "delivery worker stopped");
}

/// Periodically drains a [`MeasurementSet`] and delivers its contents to sinks.
///
/// Flushes happen on wall-clock boundaries that are multiples of the configured period since the
/// UNIX epoch. Every sink gets its own bounded queue and delivery worker and receives every batch.
/// A slow or failing sink never blocks recording: when its queue is full, batches for that sink are
/// dropped with an error log.
///
/// The reporter must be started from within a tokio runtime. Dropping it without calling
/// [`close`](Self::close) stops all tasks immediately and discards pending data.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use tally_metrics::{LogSink, MeasurementSet, Reporter, ReporterConfig};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let set = Arc::new(MeasurementSet::new());
/// let sinks: Vec<Arc<dyn tally_metrics::DeliverySink>> = vec![Arc::new(LogSink::default())];
/// let mut reporter = Reporter::new(ReporterConfig::default(), Arc::clone(&set), sinks).unwrap();
///
/// reporter.start().unwrap();
/// set.incr("requests");
///
/// // Delivers the pending counter before returning.
/// reporter.close().await;
/// # });
/// ```
pub struct Reporter {
    config: ReporterConfig,
    set: Arc<MeasurementSet>,
    sinks: Vec<Arc<dyn DeliverySink>>,
    state: Arc<Mutex<ReporterState>>,
    shutdown: ShutdownSignal,
    tasks: Vec<JoinHandle<()>>,
}

impl Reporter {
    /// Creates a reporter for `set` delivering to `sinks`.
    ///
    /// Fails if the configuration is invalid or no sink is given.
    pub fn new(
        config: ReporterConfig,
        set: Arc<MeasurementSet>,
        sinks: Vec<Arc<dyn DeliverySink>>,
    ) -> Result<Self, ReporterError> {
        config.validate()?;
        if sinks.is_empty() {
            return Err(ReporterError::NoSinks);
        }

        Ok(Self {
            config,
            set,
            sinks,
            state: Arc::new(Mutex::new(ReporterState::Idle)),
            shutdown: ShutdownSignal::new(),
            tasks: Vec::new(),
        })
    }

    /// Returns the measurement set this reporter drains.
    pub fn set(&self) -> &Arc<MeasurementSet> {
        &self.set
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> ReporterState {
        *self.state.lock()
    }

    /// Returns a handle that observes when this reporter shuts down.
    ///
    /// Background tasks feeding the measurement set, such as the
    /// [`RuntimeRecorder`](crate::RuntimeRecorder), can use it to stop together with the reporter.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.handle()
    }

    /// Spawns the delivery workers and the flush scheduler.
    pub fn start(&mut self) -> Result<(), ReporterError> {
        {
            let mut state = self.state.lock();
            if *state != ReporterState::Idle {
                return Err(ReporterError::AlreadyStarted);
            }
            *state = ReporterState::Running;
        }

        let mut queues = Vec::with_capacity(self.sinks.len());
        for sink in &self.sinks {
            let (tx, rx) = mpsc::channel(self.config.queue_size);
            queues.push(SinkQueue {
                name: sink.name().to_owned(),
                tx,
            });

            self.tasks.push(tokio::spawn(run_worker(
                Arc::clone(sink),
                rx,
                self.shutdown.handle(),
                self.config.max_post_retries,
            )));
        }

        let scheduler = Scheduler {
            set: Arc::clone(&self.set),
            builder: BatchBuilder::from_config(&self.config),
            queues,
            period: self.config.period,
            flush_on_shutdown: self.config.flush_on_shutdown,
            state: Arc::clone(&self.state),
        };
        self.tasks
            .push(tokio::spawn(scheduler.run(self.shutdown.handle())));

        Ok(())
    }

    /// Stops the reporter, delivering what is pending.
    ///
    /// Performs a final flush if `flush_on_shutdown` is set and waits for the workers to finish
    /// their queues for at most `shutdown_timeout`. Tasks still running after the timeout are
    /// aborted, so no delivery happens after this returns. Calling this more than once has no
    /// further effect.
    pub async fn close(&mut self) {
        match self.state() {
            ReporterState::Stopped => return,
            ReporterState::Idle => {
                *self.state.lock() = ReporterState::Stopped;
                return;
            }
            ReporterState::Running | ReporterState::Draining => {}
        }

        let timeout = self.config.shutdown_timeout;
        self.shutdown.trigger(Shutdown::graceful(timeout));

        let mut tasks = std::mem::take(&mut self.tasks);
        let joined =
            tokio::time::timeout(timeout, futures::future::join_all(tasks.iter_mut())).await;

        if joined.is_err() {
            tally_log::error!(
                timeout = ?timeout,
                "reporter did not shut down in time, aborting pending deliveries"
            );
        }

        tasks.retain(|task| !task.is_finished());
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            // Aborted tasks resolve with a cancellation error.
            task.await.ok();
        }

        *self.state.lock() = ReporterState::Stopped;
    }
}

impl Drop for Reporter {
    fn drop(&mut self) {
        self.shutdown.trigger(Shutdown::immediate());
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter")
            .field("config", &self.config)
            .field("sinks", &self.sinks.iter().map(|s| s.name()).collect::<Vec<_>>())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::testutils::{CollectingSink, FlakySink, StuckSink};

    fn config(period: Duration) -> ReporterConfig {
        ReporterConfig {
            period,
            hostname_tag: false,
            shutdown_timeout: Duration::from_secs(1),
            ..Default::default()
        }
    }

    fn reporter(config: ReporterConfig, sinks: Vec<Arc<dyn DeliverySink>>) -> Reporter {
        Reporter::new(config, Arc::new(MeasurementSet::new()), sinks).unwrap()
    }

    #[tokio::test]
    async fn test_flush_on_boundary() {
        tally_test::setup();
        tokio::time::pause();

        let sink = CollectingSink::new();
        let mut reporter = reporter(config(Duration::from_secs(1)), vec![Arc::new(sink.clone())]);
        reporter.set().add("hits", 3);
        reporter.set().update_value("latency", 5.0);

        reporter.start().unwrap();
        assert_eq!(reporter.state(), ReporterState::Running);

        // The first boundary is at most one period away. The second finds nothing to report.
        tokio::time::sleep(Duration::from_millis(2500)).await;

        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].period, 1);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[0].measurements[0].name, "hits");
        assert_eq!(batches[0].measurements[1].name, "latency");

        reporter.close().await;
        assert_eq!(reporter.state(), ReporterState::Stopped);
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_start_twice() {
        let mut reporter = reporter(
            config(Duration::from_secs(60)),
            vec![Arc::new(CollectingSink::new())],
        );

        reporter.start().unwrap();
        assert!(matches!(
            reporter.start(),
            Err(ReporterError::AlreadyStarted)
        ));

        reporter.close().await;
        assert!(matches!(
            reporter.start(),
            Err(ReporterError::AlreadyStarted)
        ));
    }

    #[test]
    fn test_new_rejects_invalid() {
        let set = Arc::new(MeasurementSet::new());

        let result = Reporter::new(config(Duration::from_secs(1)), Arc::clone(&set), vec![]);
        assert!(matches!(result, Err(ReporterError::NoSinks)));

        let invalid = ReporterConfig {
            max_batch_size: 0,
            ..Default::default()
        };
        let result = Reporter::new(invalid, set, vec![Arc::new(CollectingSink::new())]);
        assert!(matches!(result, Err(ReporterError::Config(_))));
    }

    #[tokio::test]
    async fn test_close_flushes_pending() {
        tally_test::setup();
        tokio::time::pause();

        let sink = CollectingSink::new();
        let mut reporter = reporter(config(Duration::from_secs(60)), vec![Arc::new(sink.clone())]);
        reporter.start().unwrap();
        reporter.set().incr("shutdown.hits");

        reporter.close().await;

        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].measurements[0].name, "shutdown.hits");
        assert_eq!(batches[0].time.as_secs() % 60, 0);

        // Closing again is a no-op.
        reporter.close().await;
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_close_without_final_flush() {
        tokio::time::pause();

        let sink = CollectingSink::new();
        let config = ReporterConfig {
            flush_on_shutdown: false,
            ..config(Duration::from_secs(60))
        };
        let mut reporter = reporter(config, vec![Arc::new(sink.clone())]);
        reporter.start().unwrap();
        reporter.set().incr("hits");

        reporter.close().await;
        assert_eq!(sink.len(), 0);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        tally_test::setup();
        tokio::time::pause();

        let sink = FlakySink::new(2);
        let mut reporter = reporter(config(Duration::from_secs(60)), vec![Arc::new(sink.clone())]);
        reporter.start().unwrap();
        reporter.set().incr("hits");
        reporter.close().await;

        assert_eq!(sink.attempts(), 3);
        assert_eq!(sink.delivered().len(), 1);
    }

    #[tokio::test]
    async fn test_retries_give_up() {
        tally_test::setup();
        tokio::time::pause();

        let sink = FlakySink::failing();
        let config = ReporterConfig {
            max_post_retries: 4,
            ..config(Duration::from_secs(60))
        };
        let mut reporter = reporter(config, vec![Arc::new(sink.clone())]);
        reporter.start().unwrap();
        reporter.set().incr("hits");
        reporter.close().await;

        assert_eq!(sink.attempts(), 4);
        assert!(sink.delivered().is_empty());
    }

    #[tokio::test]
    async fn test_fan_out_to_all_sinks() {
        tokio::time::pause();

        let first = CollectingSink::new();
        let second = CollectingSink::new();
        let config = ReporterConfig {
            max_batch_size: 2,
            ..config(Duration::from_secs(60))
        };
        let mut reporter = reporter(
            config,
            vec![Arc::new(first.clone()), Arc::new(second.clone())],
        );
        reporter.start().unwrap();
        for key in ["a", "b", "c", "d", "e"] {
            reporter.set().incr(key);
        }
        reporter.close().await;

        let sizes: Vec<_> = first.batches().iter().map(MeasurementsBatch::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(first.batches(), second.batches());
    }

    #[tokio::test]
    async fn test_prefix_and_global_tags() {
        tokio::time::pause();

        let sink = CollectingSink::new();
        let mut config = config(Duration::from_secs(60));
        config.prefix = "svc.".to_owned();
        config
            .global_tags
            .insert("region".to_owned(), "eu".to_owned());

        let mut reporter = reporter(config, vec![Arc::new(sink.clone())]);
        reporter.start().unwrap();
        reporter.set().incr("hits");
        reporter.close().await;

        let measurement = &sink.batches()[0].measurements[0];
        assert_eq!(measurement.name, "svc.hits");
        assert_eq!(measurement.tags["region"], "eu");
    }

    #[tokio::test]
    async fn test_full_queue_drops_batches() {
        tally_test::setup();
        tokio::time::pause();

        let stuck = StuckSink::new();
        let collecting = CollectingSink::new();
        let config = ReporterConfig {
            max_batch_size: 1,
            queue_size: 2,
            ..config(Duration::from_secs(1))
        };
        let mut reporter = reporter(
            config,
            vec![Arc::new(stuck.clone()), Arc::new(collecting.clone())],
        );
        let timeout = Duration::from_secs(5);

        // The stuck worker takes the first batch and never returns.
        reporter.set().incr("a");
        reporter.start().unwrap();
        assert!(tally_test::wait_until(timeout, || collecting.len() == 1).await);

        // The next two fill the stuck sink's queue.
        reporter.set().incr("b");
        reporter.set().incr("c");
        assert!(tally_test::wait_until(timeout, || collecting.len() == 3).await);

        // This one no longer fits for the stuck sink, but still reaches the other one.
        reporter.set().incr("d");
        assert!(tally_test::wait_until(timeout, || collecting.len() == 4).await);
        assert_eq!(stuck.attempts(), 1);

        // Close gives up on the stuck sink after the timeout.
        reporter.close().await;
        assert_eq!(reporter.state(), ReporterState::Stopped);
        assert_eq!(stuck.attempts(), 1);
    }
}
