//! Helpers for testing the tally crates.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output is
//!    captured by the test runner. All logs emitted with [`tally_log`] will show up for test
//!    failures or when run with `--nocapture`.
//!  - Timing-dependent async tests should pause the tokio clock with `tokio::time::pause()` and
//!    use [`wait_until`] instead of fixed sleeps where the exact instant does not matter.
//!
//! # Example
//!
//! ```no_run
//! #[test]
//! fn my_test() {
//!     tally_test::setup();
//!
//!     tally_log::debug!("hello, world!");
//! }
//! ```

use std::time::Duration;

/// Setup the test environment.
///
///  - Initializes logs: The logger captures all logs from the tally crates at trace level.
pub fn setup() {
    tally_log::init_test!();
}

/// Polls `condition` every millisecond until it holds or `timeout` elapses.
///
/// Returns `true` if the condition was met. With a paused tokio clock the timeout is virtual, so
/// this does not slow down tests.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    };

    tokio::time::timeout(timeout, poll).await.is_ok()
}
