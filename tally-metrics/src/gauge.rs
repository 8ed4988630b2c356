use std::sync::atomic::{AtomicU64, Ordering};

use crate::key::MetricKey;
use crate::publisher::Publisher;

/// Bit pattern marking the absence of a value.
///
/// This is a NaN payload that `f64` arithmetic never produces. NaNs passed to [`Gauge::set`] are
/// rejected before they are stored, so no stored value can collide with it.
const UNSET: u64 = 0x7ff8_dead_beef_0001;

/// An `Option<f64>` that can be read and written atomically.
#[derive(Debug)]
struct AtomicOptionF64(AtomicU64);

impl AtomicOptionF64 {
    const fn none() -> Self {
        Self(AtomicU64::new(UNSET))
    }

    fn store(&self, value: Option<f64>) {
        let bits = match value {
            Some(value) if !value.is_nan() => value.to_bits(),
            _ => UNSET,
        };
        self.0.store(bits, Ordering::Relaxed);
    }

    fn load(&self) -> Option<f64> {
        match self.0.load(Ordering::Relaxed) {
            UNSET => None,
            bits => Some(f64::from_bits(bits)),
        }
    }
}

/// Stores the last reported value.
///
/// Unlike a [`Counter`](crate::Counter), the value persists across flushes: every flush reports the
/// current value until it is changed with [`set`](Self::set) or cleared with
/// [`unset`](Self::unset).
#[derive(Debug)]
pub struct Gauge {
    value: AtomicOptionF64,
}

impl Gauge {
    pub(crate) fn new() -> Self {
        Self {
            value: AtomicOptionF64::none(),
        }
    }

    /// Sets the value reported on every flush.
    ///
    /// Setting `NaN` has the same effect as [`unset`](Self::unset).
    #[inline]
    pub fn set(&self, value: f64) {
        self.value.store(Some(value));
    }

    /// Clears the value so that flushes report nothing.
    #[inline]
    pub fn unset(&self) {
        self.value.store(None);
    }

    /// Returns the current value.
    pub fn get(&self) -> Option<f64> {
        self.value.load()
    }

    pub(crate) fn publish(&self, key: &MetricKey, publisher: &mut dyn Publisher) {
        if let Some(value) = self.get() {
            publisher.gauge(key, value);
        }
    }
}
