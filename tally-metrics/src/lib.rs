//! Aggregation of application measurements and their batched delivery.
//!
//! Producers record into a shared [`MeasurementSet`]: counters through [`MeasurementSet::add`]
//! and running aggregates of count, sum, min, max and last value through
//! [`MeasurementSet::update_value`]. Measurements are identified by a name and an optional set of
//! tags, which are combined into a single string key by the [`key`] module.
//!
//! A [`Reporter`] drains the set at wall-clock aligned intervals, converts the resulting
//! [`MeasurementSetReport`] into [`MeasurementsBatch`]es and hands them to one or more
//! [`DeliverySink`]s with retries.
//!
//! For measurements that are produced ready-made, the [`BatchPersister`] batches them by size and
//! time, and stops delivering once the sink keeps failing.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use tally_metrics::{MeasurementSet, key};
//!
//! let set = Arc::new(MeasurementSet::new());
//! set.incr("requests");
//! set.update_value("latency", 12.5);
//!
//! let web = set.tagged([("host".to_owned(), "web-1".to_owned())].into());
//! web.incr("requests");
//!
//! let report = set.drain();
//! assert_eq!(report.counts["requests"], 1);
//! assert_eq!(report.counts[&key::encode_iter("requests", [("host", "web-1")])], 1);
//! assert_eq!(report.aggregates["latency"].max, 12.5);
//! ```

#![warn(missing_docs)]

mod aggregate;
mod builder;
mod config;
pub mod key;
mod pipeline;
mod protocol;
mod registry;
mod report;
mod reporter;
mod runtime;
mod sink;
mod tagged;

#[cfg(test)]
mod testutils;

pub use self::aggregate::*;
pub use self::builder::*;
pub use self::config::*;
pub use self::pipeline::*;
pub use self::protocol::*;
pub use self::registry::*;
pub use self::report::*;
pub use self::reporter::*;
pub use self::runtime::*;
pub use self::sink::*;
pub use self::tagged::*;
