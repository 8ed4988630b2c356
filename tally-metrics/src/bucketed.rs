//! Helpers that section counters and gauges by ranges of observed values.
//!
//! Buckets are described by a sorted list of boundaries. With boundaries `[100, 200, 400]` there
//! are four buckets, each reported under a tag value describing its range:
//!
//! | tag value        | observed values      |
//! |------------------|----------------------|
//! | `lt_100`         | `v < 100`            |
//! | `gte_100_lt_200` | `100 <= v < 200`     |
//! | `gte_200_lt_400` | `200 <= v < 400`     |
//! | `gte_400`        | `400 <= v`           |
//!
//! By convention, the tag key of bucketed definitions is `bucket`. Boundaries that are not sorted
//! or contain duplicates are replaced by a single bucket with an empty tag value.

use std::sync::Arc;

use hashbrown::HashMap;

use crate::counter::Counter;
use crate::definition::{Definition, Resolved};
use crate::engine::Metrics;
use crate::gauge::Gauge;
use crate::key::MetricKey;

/// Returns `n` exponentially increasing boundaries: `start * base^i`.
pub fn exponential_buckets(start: f64, base: f64, n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| start * base.powi(i as i32))
        .collect()
}

/// Returns `n` linearly increasing boundaries: `start + step * i`.
pub fn linear_buckets(start: f64, step: f64, n: usize) -> Vec<f64> {
    (0..n).map(|i| start + step * i as f64).collect()
}

#[derive(Clone, Debug)]
struct Boundaries(Vec<f64>);

impl Boundaries {
    fn new(boundaries: &[f64]) -> Self {
        let valid = boundaries.windows(2).all(|pair| pair[0] < pair[1]);
        if valid {
            Self(boundaries.to_vec())
        } else {
            tally_log::warn!(?boundaries, "bucket boundaries must be sorted and unique");
            Self(Vec::new())
        }
    }

    fn names(&self) -> Vec<String> {
        let Some((first, last)) = self.0.first().zip(self.0.last()) else {
            return vec![String::new()];
        };

        let mut names = Vec::with_capacity(self.0.len() + 1);
        names.push(format!("lt_{first}"));
        for pair in self.0.windows(2) {
            names.push(format!("gte_{}_lt_{}", pair[0], pair[1]));
        }
        names.push(format!("gte_{last}"));
        names
    }

    fn index(&self, value: f64) -> usize {
        let index = self.0.partition_point(|&boundary| boundary < value);
        match self.0.get(index) {
            Some(&boundary) if boundary == value => index + 1,
            _ => index,
        }
    }
}

/// A counter sectioned into buckets by observed value.
///
/// Each call to [`observe`](Self::observe) adds one to the counter of the bucket the value falls
/// into.
#[derive(Debug)]
pub struct BucketedCounter {
    boundaries: Boundaries,
    counters: Vec<Arc<Counter>>,
}

impl BucketedCounter {
    /// Creates a bucketed counter. `definition` must have exactly one tag key.
    pub fn new(metrics: &Metrics, definition: &Definition<Counter>, boundaries: &[f64]) -> Self {
        let boundaries = Boundaries::new(boundaries);
        let counters = boundaries
            .names()
            .into_iter()
            .map(|name| metrics.counter(&definition.bind().value(name).resolve()))
            .collect();

        Self {
            boundaries,
            counters,
        }
    }

    /// Counts one occurrence of `value`.
    pub fn observe(&self, value: f64) {
        let index = self.boundaries.index(value);
        if let Some(counter) = self.counters.get(index) {
            counter.add(1);
        }
    }
}

/// A group of gauges reporting how many observations fell into each bucket.
///
/// Observations accumulate until [`emit`](Self::emit), which sets every gauge to the number of
/// observations in its bucket and starts over. This is typically driven by
/// [`Metrics::every_flush`] to report the shape of a collection, for example the number of
/// buffers per size range.
#[derive(Debug)]
pub struct BucketedGaugeGroup {
    boundaries: Boundaries,
    gauges: Vec<Arc<Gauge>>,
    pending: Vec<f64>,
}

impl BucketedGaugeGroup {
    /// Creates a bucketed gauge group. `definition` must have exactly one tag key.
    pub fn new(metrics: &Metrics, definition: &Definition<Gauge>, boundaries: &[f64]) -> Self {
        let boundaries = Boundaries::new(boundaries);
        let gauges: Vec<_> = boundaries
            .names()
            .into_iter()
            .map(|name| metrics.gauge(&definition.bind().value(name).resolve()))
            .collect();
        let pending = vec![0.0; gauges.len()];

        Self {
            boundaries,
            gauges,
            pending,
        }
    }

    /// Adds one to the bucket `value` falls into.
    pub fn observe(&mut self, value: f64) {
        let index = self.boundaries.index(value);
        if let Some(count) = self.pending.get_mut(index) {
            *count += 1.0;
        }
    }

    /// Sets the gauges to the observations since the last emit and resets them.
    pub fn emit(&mut self) {
        for (gauge, count) in self.gauges.iter().zip(&mut self.pending) {
            gauge.set(*count);
            *count = 0.0;
        }
    }
}

/// A group of gauges of one definition whose set of tag values changes over time.
///
/// Values passed to [`set`](Self::set) are applied on
/// [`emit_and_unset`](Self::emit_and_unset), which also unsets every gauge that was emitted
/// previously but not set since. This keeps gauges of vanished entities, such as closed
/// connections, from being reported forever.
#[derive(Debug, Default)]
pub struct GaugeGroup {
    current: HashMap<MetricKey, (Arc<Gauge>, f64)>,
    previous: HashMap<MetricKey, Arc<Gauge>>,
}

impl GaugeGroup {
    /// Creates an empty group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `value` for the gauge identified by `resolved`.
    ///
    /// Invalid keys are ignored.
    pub fn set(&mut self, metrics: &Metrics, resolved: &Resolved<Gauge>, value: f64) {
        let Some(key) = resolved.key() else {
            return;
        };

        match self.current.get_mut(key) {
            Some(entry) => entry.1 = value,
            None => {
                let gauge = metrics.gauge(resolved);
                self.current.insert(key.clone(), (gauge, value));
            }
        }
    }

    /// Sets all gauges recorded since the last call and unsets the ones that were not.
    pub fn emit_and_unset(&mut self) {
        for (key, gauge) in &self.previous {
            if !self.current.contains_key(key) {
                gauge.unset();
            }
        }

        self.previous.clear();
        for (key, (gauge, value)) in self.current.drain() {
            gauge.set(value);
            self.previous.insert(key, gauge);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crossbeam_channel::Receiver;

    use super::*;
    use crate::batcher::PacketBatcher;
    use crate::definition::{BAD_DEFINITIONS_METRIC, Registry};
    use crate::publisher::StatsdPublisher;
    use crate::unit::Unit;

    fn engine(registry: Registry) -> (Metrics, Receiver<Vec<u8>>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let publisher = StatsdPublisher::new(PacketBatcher::new(tx, 1400));
        let interval = Duration::from_secs(3600);
        let metrics = Metrics::with_publisher(interval, Arc::new(registry), publisher).unwrap();
        (metrics, rx)
    }

    /// Returns the lines sent so far in sorted order, without the anomaly gauges.
    fn sorted_lines(rx: &Receiver<Vec<u8>>) -> Vec<String> {
        let mut lines: Vec<String> = rx
            .try_iter()
            .flat_map(|frame| {
                String::from_utf8(frame)
                    .unwrap()
                    .lines()
                    .map(str::to_owned)
                    .collect::<Vec<_>>()
            })
            .filter(|line| !line.starts_with(BAD_DEFINITIONS_METRIC))
            .collect();
        lines.sort();
        lines
    }

    #[test]
    fn test_bucket_names() {
        let names = Boundaries::new(&[0.5, 1.0, 10.0]).names();
        assert_eq!(names, ["lt_0.5", "gte_0.5_lt_1", "gte_1_lt_10", "gte_10"]);
    }

    #[test]
    fn test_invalid_boundaries() {
        assert_eq!(Boundaries::new(&[10.0, 1.0]).names(), [""]);
        assert_eq!(Boundaries::new(&[1.0, 1.0]).names(), [""]);
        assert_eq!(Boundaries::new(&[]).names(), [""]);
        assert_eq!(Boundaries::new(&[10.0, 1.0]).index(5.0), 0);
    }

    #[test]
    fn test_bucket_index() {
        let boundaries = Boundaries::new(&[1.0, 10.0]);
        assert_eq!(boundaries.index(0.0), 0);
        assert_eq!(boundaries.index(1.0), 1);
        assert_eq!(boundaries.index(9.99), 1);
        assert_eq!(boundaries.index(10.0), 2);
        assert_eq!(boundaries.index(1e9), 2);
    }

    #[test]
    fn test_bucket_helpers() {
        assert_eq!(exponential_buckets(1.0, 10.0, 4), [1.0, 10.0, 100.0, 1000.0]);
        assert_eq!(linear_buckets(5.0, 5.0, 3), [5.0, 10.0, 15.0]);
        assert!(linear_buckets(0.0, 1.0, 0).is_empty());
    }

    #[test]
    fn test_bucketed_counter() {
        let registry = Registry::new();
        let def = registry
            .counter("request.size", "", Unit::Byte, &["bucket"])
            .unwrap();
        let (metrics, rx) = engine(registry);

        let counter = BucketedCounter::new(&metrics, &def, &exponential_buckets(1.0, 10.0, 4));
        let mut values = vec![0.0, 0.0, 1.0, 2.0, 9.0, 10.0, 11.0, 12.0, 99.0, 100.0, 101.0];
        values.extend([102.0, 103.0, 999.0]);
        values.extend((1000..=1005).map(f64::from));
        for value in values {
            counter.observe(value);
        }

        metrics.flush();

        similar_asserts::assert_eq!(
            sorted_lines(&rx),
            [
                "request.size:2|c|@1|#bucket:lt_1",
                "request.size:3|c|@1|#bucket:gte_1_lt_10",
                "request.size:4|c|@1|#bucket:gte_10_lt_100",
                "request.size:5|c|@1|#bucket:gte_100_lt_1000",
                "request.size:6|c|@1|#bucket:gte_1000",
            ]
        );
    }

    #[test]
    fn test_bucketed_gauge_group() {
        let registry = Registry::new();
        let def = registry
            .gauge("buffers", "", Unit::Buffer, &["bucket"])
            .unwrap();
        let (metrics, rx) = engine(registry);

        let mut group = BucketedGaugeGroup::new(&metrics, &def, &[1024.0]);
        group.observe(10.0);
        group.observe(2048.0);
        group.observe(4096.0);
        group.emit();
        metrics.flush();

        assert_eq!(
            sorted_lines(&rx),
            [
                "buffers:1|g|@1|#bucket:lt_1024",
                "buffers:2|g|@1|#bucket:gte_1024",
            ]
        );

        group.emit();
        metrics.flush();

        assert_eq!(
            sorted_lines(&rx),
            [
                "buffers:0|g|@1|#bucket:gte_1024",
                "buffers:0|g|@1|#bucket:lt_1024",
            ]
        );
    }

    #[test]
    fn test_gauge_group_unsets_missing() {
        let registry = Registry::new();
        let def = registry
            .gauge("connection.age", "", Unit::Second, &["peer"])
            .unwrap();
        let (metrics, rx) = engine(registry);

        let mut group = GaugeGroup::new();
        group.set(&metrics, &def.bind().value("a").resolve(), 1.0);
        group.set(&metrics, &def.bind().value("b").resolve(), 2.0);
        group.set(&metrics, &def.bind().value("b").resolve(), 3.0);
        group.emit_and_unset();
        metrics.flush();

        assert_eq!(
            sorted_lines(&rx),
            [
                "connection.age:1|g|@1|#peer:a",
                "connection.age:3|g|@1|#peer:b",
            ]
        );

        group.set(&metrics, &def.bind().value("b").resolve(), 4.0);
        group.emit_and_unset();
        metrics.flush();

        assert_eq!(sorted_lines(&rx), ["connection.age:4|g|@1|#peer:b"]);
    }
}
