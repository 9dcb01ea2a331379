use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Running count, sum, minimum, maximum and last value over a series of observations.
///
/// An empty aggregate has all fields set to zero. Its `min`, `max` and `last` are placeholders
/// and are replaced by the first observation instead of being compared against it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Aggregate {
    /// Number of observations.
    pub count: u64,
    /// Sum of all observations.
    pub sum: f64,
    /// Smallest observation.
    pub min: f64,
    /// Largest observation.
    pub max: f64,
    /// Most recent observation.
    pub last: f64,
}

impl Aggregate {
    /// Creates an aggregate holding a single observation.
    pub fn single(value: f64) -> Self {
        Self {
            count: 1,
            sum: value,
            min: value,
            max: value,
            last: value,
        }
    }

    /// Returns `true` if no values have been observed.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Folds one observation into this aggregate.
    pub fn update_value(&mut self, value: f64) {
        if self.is_empty() {
            *self = Self::single(value);
            return;
        }

        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.last = value;
    }

    /// Combines another aggregate into this one.
    ///
    /// Counts and sums add up, min and max widen, and `last` is taken from `other`. Merging an
    /// empty aggregate has no effect.
    pub fn merge(&mut self, other: &Self) {
        if other.is_empty() {
            return;
        }

        if self.is_empty() {
            *self = *other;
            return;
        }

        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.last = other.last;
    }

    /// Returns the arithmetic mean, or `None` if empty.
    pub fn avg(&self) -> Option<f64> {
        (!self.is_empty()).then(|| self.sum / self.count as f64)
    }
}

/// An [`Aggregate`] behind its own lock, shared between threads.
#[derive(Debug, Default)]
pub struct SharedAggregate(Mutex<Aggregate>);

impl SharedAggregate {
    /// Creates an empty shared aggregate.
    pub fn new() -> Self {
        Self::default()
    }

    /// See [`Aggregate::update_value`].
    pub fn update_value(&self, value: f64) {
        self.0.lock().update_value(value);
    }

    /// See [`Aggregate::merge`].
    pub fn merge(&self, other: &Aggregate) {
        self.0.lock().merge(other);
    }

    /// Returns a copy of the current state.
    pub fn get(&self) -> Aggregate {
        *self.0.lock()
    }

    /// Returns the current state and resets this aggregate to empty in one step.
    pub fn reset_and_get(&self) -> Aggregate {
        std::mem::take(&mut *self.0.lock())
    }
}

/// A signed sum that is updated without locking.
#[derive(Debug, Default)]
pub struct SharedCounter(AtomicI64);

impl SharedCounter {
    /// Creates a counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one.
    pub fn incr(&self) {
        self.add(1);
    }

    /// Adds `delta`, which may be negative.
    pub fn add(&self, delta: i64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    /// Returns the current value.
    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Returns the current value and resets the counter to zero in one step.
    pub fn reset_and_get(&self) -> i64 {
        self.0.swap(0, Ordering::AcqRel)
    }
}
