//! Foundational system components for tally's background tasks.
#![warn(missing_docs)]

mod shutdown;

pub use self::shutdown::*;
