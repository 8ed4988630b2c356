use std::sync::atomic::{AtomicI64, Ordering};

use crate::key::MetricKey;
use crate::publisher::Publisher;

/// Counts instances of an event.
///
/// Each flush reports the sum of all increments since the previous flush and resets the counter.
/// A flush without increments reports nothing.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicI64,
}

impl Counter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Adds `delta` to the counter.
    ///
    /// Negative deltas are allowed but are not meaningful for most backends.
    #[inline]
    pub fn add(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    /// Reads and resets the accumulated delta, returning `None` if it is zero.
    pub(crate) fn take(&self) -> Option<i64> {
        match self.value.swap(0, Ordering::Relaxed) {
            0 => None,
            delta => Some(delta),
        }
    }

    pub(crate) fn publish(&self, key: &MetricKey, publisher: &mut dyn Publisher) {
        if let Some(delta) = self.take() {
            publisher.counter(key, delta);
        }
    }
}
