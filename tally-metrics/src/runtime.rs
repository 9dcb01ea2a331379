use std::sync::Arc;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tally_system::ShutdownHandle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::RuntimeConfig;
use crate::registry::MeasurementSet;

/// Resident memory of this process in bytes.
pub const MEMORY_RSS: &str = "process.memory.rss";
/// Virtual memory of this process in bytes.
pub const MEMORY_VIRTUAL: &str = "process.memory.virtual";
/// CPU usage of this process in percent since the previous sample.
pub const CPU_USAGE: &str = "process.cpu.usage";
/// Number of threads of this process.
pub const THREADS: &str = "process.threads";

/// Samples statistics of the current process into a [`MeasurementSet`].
///
/// Every sample is recorded with [`MeasurementSet::update_value`], so a report contains the
/// minimum, maximum and last value observed during the flush period.
pub struct RuntimeRecorder {
    set: Arc<MeasurementSet>,
    config: RuntimeConfig,
    system: System,
    pid: Option<Pid>,
}

impl RuntimeRecorder {
    /// Creates a recorder for the current process.
    pub fn new(set: Arc<MeasurementSet>, config: RuntimeConfig) -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(error) => {
                tally_log::warn!(error, "cannot determine current process id");
                None
            }
        };

        Self {
            set,
            config,
            system: System::new(),
            pid,
        }
    }

    /// Takes one sample.
    ///
    /// Returns `false` if process statistics are unavailable on this platform.
    pub fn record(&mut self) -> bool {
        let Some(pid) = self.pid else {
            return false;
        };

        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::everything(),
        );

        let Some(process) = self.system.process(pid) else {
            return false;
        };

        self.set.update_value(MEMORY_RSS, process.memory() as f64);
        self.set
            .update_value(MEMORY_VIRTUAL, process.virtual_memory() as f64);
        self.set
            .update_value(CPU_USAGE, f64::from(process.cpu_usage()));

        if let Some(tasks) = process.tasks() {
            // The main thread is not listed as a task.
            self.set.update_value(THREADS, (tasks.len() + 1) as f64);
        }

        true
    }

    /// Starts sampling if `config.enabled` is set.
    ///
    /// Returns the task handle, or `None` when the recorder is disabled.
    pub fn spawn_if_enabled(
        set: Arc<MeasurementSet>,
        config: RuntimeConfig,
        shutdown: ShutdownHandle,
    ) -> Option<JoinHandle<()>> {
        if !config.enabled {
            tally_log::debug!("runtime recorder disabled");
            return None;
        }

        Some(Self::new(set, config).spawn(shutdown))
    }

    /// Samples on the configured interval until `shutdown` fires.
    ///
    /// The first sample is taken immediately. Must be called from within a tokio runtime.
    pub fn spawn(mut self, mut shutdown: ShutdownHandle) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            tally_log::debug!(interval = ?self.config.interval, "runtime recorder started");

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.notified() => break,
                    _ = ticker.tick() => {
                        if !self.record() {
                            tally_log::debug!("process statistics unavailable");
                            break;
                        }
                    }
                }
            }

            tally_log::debug!("runtime recorder stopped");
        })
    }
}

impl std::fmt::Debug for RuntimeRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeRecorder")
            .field("config", &self.config)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tally_system::{Shutdown, ShutdownSignal};

    use super::*;

    #[test]
    fn test_record_memory() {
        let set = Arc::new(MeasurementSet::new());
        let mut recorder = RuntimeRecorder::new(Arc::clone(&set), RuntimeConfig::default());

        if !recorder.record() {
            return;
        }

        let report = set.drain();
        assert_eq!(report.aggregates[MEMORY_RSS].count, 1);
        assert!(report.aggregates[MEMORY_RSS].last > 0.0);
        assert!(report.aggregates.contains_key(CPU_USAGE));
    }

    #[tokio::test]
    async fn test_spawn_if_enabled() {
        let set = Arc::new(MeasurementSet::new());
        let signal = ShutdownSignal::new();

        let disabled = RuntimeRecorder::spawn_if_enabled(
            Arc::clone(&set),
            RuntimeConfig::default(),
            signal.handle(),
        );
        assert!(disabled.is_none());

        let config = RuntimeConfig {
            enabled: true,
            ..Default::default()
        };
        let task = RuntimeRecorder::spawn_if_enabled(Arc::clone(&set), config, signal.handle());
        assert!(task.is_some());

        signal.trigger(Shutdown::immediate());
        assert!(
            tokio::time::timeout(Duration::from_secs(1), task.unwrap())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_spawn_stops_on_shutdown() {
        tally_test::setup();

        let set = Arc::new(MeasurementSet::new());
        let config = RuntimeConfig {
            enabled: true,
            interval: Duration::from_millis(10),
        };
        let signal = ShutdownSignal::new();
        let task = RuntimeRecorder::new(Arc::clone(&set), config).spawn(signal.handle());

        tokio::time::sleep(Duration::from_millis(50)).await;
        signal.trigger(Shutdown::immediate());

        assert!(tokio::time::timeout(Duration::from_secs(1), task).await.is_ok());
    }
}
