use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Shutdown request broadcast to all tasks observing a [`ShutdownSignal`].
///
/// A graceful shutdown carries a timeout within which tasks should finish in-flight work. An
/// immediate shutdown has no timeout and tasks should exit at the next opportunity, dropping what
/// they hold.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Shutdown {
    /// The timeout for a graceful shutdown, or `None` for an immediate stop.
    pub timeout: Option<Duration>,
}

impl Shutdown {
    /// Creates a graceful shutdown with the given timeout.
    pub fn graceful(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }

    /// Creates an immediate shutdown.
    pub fn immediate() -> Self {
        Self { timeout: None }
    }

    /// Returns `true` if in-flight work should be completed before exiting.
    pub fn is_graceful(&self) -> bool {
        self.timeout.is_some()
    }
}

/// The sending half of a shutdown broadcast.
///
/// The signal is triggered at most once. Later triggers are ignored, so the first requester decides
/// whether the shutdown is graceful or immediate. Clones share the same underlying channel.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use tally_system::{Shutdown, ShutdownSignal};
///
/// let signal = ShutdownSignal::new();
/// let handle = signal.handle();
///
/// assert!(signal.trigger(Shutdown::graceful(Duration::from_secs(1))));
/// assert!(!signal.trigger(Shutdown::immediate()));
/// assert_eq!(handle.get(), Some(Shutdown::graceful(Duration::from_secs(1))));
/// ```
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<Option<Shutdown>>>,
}

impl ShutdownSignal {
    /// Creates a new signal that has not been triggered.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Returns a new handle observing this signal.
    pub fn handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.tx.subscribe())
    }

    /// Triggers the shutdown.
    ///
    /// Returns `true` if this call triggered the signal and `false` if it had been triggered
    /// before.
    pub fn trigger(&self, shutdown: Shutdown) -> bool {
        let triggered = self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(shutdown);
            true
        });

        if triggered {
            tally_log::debug!(graceful = shutdown.is_graceful(), "shutdown triggered");
        }

        triggered
    }

    /// Returns `true` if the signal has been triggered.
    pub fn is_triggered(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half of a [`ShutdownSignal`].
#[derive(Clone, Debug)]
pub struct ShutdownHandle(watch::Receiver<Option<Shutdown>>);

impl ShutdownHandle {
    /// Waits for the shutdown signal and returns it.
    ///
    /// Returns immediately if the signal was triggered before. If every [`ShutdownSignal`] is
    /// dropped without being triggered, this never resolves.
    pub async fn notified(&mut self) -> Shutdown {
        let shutdown = match self.0.wait_for(Option::is_some).await {
            Ok(shutdown) => *shutdown,
            Err(_) => None,
        };

        match shutdown {
            Some(shutdown) => shutdown,
            None => std::future::pending().await,
        }
    }

    /// Returns the shutdown if it has been triggered.
    pub fn get(&self) -> Option<Shutdown> {
        *self.0.borrow()
    }
}
