//! Concurrent logarithmic quantile sketch.
//!
//! Observations are assigned to buckets growing by a factor of `1 + ε`, so every value is reported
//! with a relative error of at most [`RELATIVE_ERROR`]. The agent merges the reported values into
//! its own sketch, which rounds by a similar amount.

use std::borrow::Cow;
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::store::MetricStore;

/// The maximum relative error of a reported value.
pub const RELATIVE_ERROR: f64 = 0.03;

/// Bucket index assigned to zero.
///
/// The smallest positive subnormal lands in bucket `-25185`, so this index is only reachable by
/// zero.
const ZERO_INDEX: i16 = i16::MIN;

/// Range of bucket indices with precomputed string representations.
const LOOKUP_MIN: i16 = -512;
const LOOKUP_MAX: i16 = 512;

fn log_gamma() -> f64 {
    RELATIVE_ERROR.ln_1p()
}

/// A bucket of the sketch, identified by its index and sign.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Bucket {
    index: i16,
    positive: bool,
}

impl Bucket {
    /// Returns the bucket for a finite value, or `None` for infinities and NaN.
    pub fn for_value(value: f64) -> Option<Self> {
        if !value.is_finite() {
            return None;
        }

        // Negative zero shares the bucket of zero.
        let positive = value >= 0.0;
        let magnitude = value.abs();
        let index = if magnitude == 0.0 {
            ZERO_INDEX
        } else {
            // `as` saturates, and the range of finite values fits comfortably.
            (magnitude.ln() / log_gamma()).floor() as i16
        };

        Some(Self { index, positive })
    }

    /// The bucket index.
    pub fn index(&self) -> i16 {
        self.index
    }

    /// Returns `true` for buckets of non-negative values.
    pub fn is_positive(&self) -> bool {
        self.positive
    }

    /// Returns the representative value of this bucket.
    pub fn value(&self) -> f64 {
        let magnitude = match self.index {
            ZERO_INDEX => 0.0,
            index => (1.0 + RELATIVE_ERROR).powi(i32::from(index)),
        };

        if self.positive { magnitude } else { -magnitude }
    }

    /// Returns the representative value formatted with four significant digits.
    pub fn format(&self) -> Cow<'static, str> {
        if (LOOKUP_MIN..=LOOKUP_MAX).contains(&self.index) {
            let table = if self.positive {
                positive_table()
            } else {
                negative_table()
            };
            let offset = (self.index - LOOKUP_MIN) as usize;
            if let Some(formatted) = table.get(offset) {
                return Cow::Borrowed(formatted);
            }
        }

        Cow::Owned(format_significant(self.value()))
    }
}

fn build_table(positive: bool) -> Box<[String]> {
    (LOOKUP_MIN..=LOOKUP_MAX)
        .map(|index| format_significant(Bucket { index, positive }.value()))
        .collect()
}

fn positive_table() -> &'static [String] {
    static TABLE: OnceLock<Box<[String]>> = OnceLock::new();
    TABLE.get_or_init(|| build_table(true))
}

fn negative_table() -> &'static [String] {
    static TABLE: OnceLock<Box<[String]>> = OnceLock::new();
    TABLE.get_or_init(|| build_table(false))
}

fn trim_fraction(number: &str) -> &str {
    if number.contains('.') {
        number.trim_end_matches('0').trim_end_matches('.')
    } else {
        number
    }
}

/// Formats a value with four significant digits in the shortest of fixed or exponent notation.
///
/// Exponent notation is used for exponents below `-4` or above `3`, with at least two exponent
/// digits (`1.235e+05`). Trailing zeros are removed. The agent parses both notations.
pub fn format_significant(value: f64) -> String {
    if value == 0.0 {
        return "0".to_owned();
    }

    let scientific = format!("{value:.3e}");
    let Some((mantissa, exponent)) = scientific.split_once('e') else {
        return scientific;
    };
    let Ok(exponent) = exponent.parse::<i32>() else {
        return scientific;
    };

    if !(-4..4).contains(&exponent) {
        let sign = if exponent < 0 { '-' } else { '+' };
        return format!(
            "{}e{sign}{:02}",
            trim_fraction(mantissa),
            exponent.unsigned_abs()
        );
    }

    let decimals = (3 - exponent) as usize;
    trim_fraction(&format!("{value:.decimals$}")).to_owned()
}

/// A number of new observations in a single bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Observation {
    /// The bucket receiving the observations.
    pub bucket: Bucket,
    /// The number of observations since the previous flush. Never zero.
    pub count: u32,
}

#[derive(Debug, Default)]
struct Snapshot {
    positive: HashMap<i16, u32>,
    negative: HashMap<i16, u32>,
}

/// Accumulates observations into logarithmic buckets.
///
/// Observing takes no lock unless the value falls into a bucket that has never been used before.
/// Bucket counters are cumulative. [`new_observations`](Self::new_observations) reports the
/// difference to the counts seen by its previous call.
#[derive(Debug, Default)]
pub struct Sketch {
    positive: MetricStore<i16, AtomicU32>,
    negative: MetricStore<i16, AtomicU32>,
    previous: Mutex<Snapshot>,
}

impl Sketch {
    /// Creates an empty sketch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a single observation.
    ///
    /// Infinite and NaN values are ignored. Returns `true` if the value was recorded.
    pub fn observe(&self, value: f64) -> bool {
        let Some(bucket) = Bucket::for_value(value) else {
            return false;
        };

        let target = if bucket.positive {
            &self.positive
        } else {
            &self.negative
        };

        target
            .get_or_insert_with(&bucket.index, || AtomicU32::new(0))
            .fetch_add(1, Ordering::Relaxed);

        true
    }

    /// Returns all observations made since the previous call, ordered by value.
    ///
    /// The counts seen by this call become the baseline for the next call.
    pub fn new_observations(&self) -> Vec<Observation> {
        let mut previous = self.previous.lock();
        let previous = &mut *previous;

        let mut observations = Vec::new();
        for (store, baseline, positive) in [
            (&self.positive, &mut previous.positive, true),
            (&self.negative, &mut previous.negative, false),
        ] {
            store.for_each(|&index, counter| {
                let count = counter.load(Ordering::Relaxed);
                let last = baseline.insert(index, count).unwrap_or(0);
                let delta = count.wrapping_sub(last);
                if delta != 0 {
                    observations.push(Observation {
                        bucket: Bucket { index, positive },
                        count: delta,
                    });
                }
            });
        }

        observations.sort_unstable_by(|a, b| {
            a.bucket
                .value()
                .partial_cmp(&b.bucket.value())
                .unwrap_or(CmpOrdering::Equal)
        });

        observations
    }
}
