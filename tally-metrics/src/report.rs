use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::aggregate::Aggregate;

/// A point-in-time copy of the non-zero entries of a [`MeasurementSet`](crate::MeasurementSet).
///
/// Entries are ordered by key, so anything built from a report is deterministic. Keys are encoded
/// with [`key::encode`](crate::key::encode).
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct MeasurementSetReport {
    /// Counter totals by key. Never contains zero.
    pub counts: BTreeMap<String, i64>,
    /// Aggregates by key. Never contains an empty aggregate.
    pub aggregates: BTreeMap<String, Aggregate>,
}

impl MeasurementSetReport {
    /// Creates an empty report.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the report has no entries.
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty() && self.aggregates.is_empty()
    }

    /// Returns the total number of counter and aggregate entries.
    pub fn len(&self) -> usize {
        self.counts.len() + self.aggregates.len()
    }
}
