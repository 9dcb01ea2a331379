//! Configuration for tally.
//!
//! A single [`Config`] groups the settings of all components and can be loaded from a YAML or JSON
//! file. Durations are written in human readable form, such as `"60s"` or `"100ms"`.

#![warn(missing_docs)]

mod config;

pub use self::config::*;
