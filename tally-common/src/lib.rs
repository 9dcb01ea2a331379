//! Common functionality shared by the tally crates.
#![warn(missing_docs)]

mod time;

pub use self::time::*;
