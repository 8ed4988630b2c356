use std::fmt::{self, Write as _};

use cadence::prelude::*;
use cadence::{MetricBuilder, StatsdClient};

use crate::batcher::PacketBatcher;
use crate::key::MetricKey;
use crate::protocol::MetricType;
use crate::sketch::Observation;
use crate::transport::Transport;

/// Buckets with fewer new observations are sent as repeated values. Larger buckets are sent once
/// with a sample rate of `1/count`.
pub const PACK_LIMIT: u32 = 10;

/// Receives the state of every metric on flush.
///
/// The engine calls the metric methods once per metric with changes, followed by a single call to
/// [`flush`](Self::flush) at the end of each flush cycle. All calls happen on the flush thread.
pub trait Publisher: Send {
    /// Reports the sum of increments to a counter since the previous flush. Never zero.
    fn counter(&mut self, key: &MetricKey, delta: i64);

    /// Reports the current value of a gauge.
    fn gauge(&mut self, key: &MetricKey, value: f64);

    /// Reports new observations of a distribution, ordered by value.
    fn distribution(&mut self, key: &MetricKey, observations: &[Observation]);

    /// Reports the hashed members of a set observed since the previous flush.
    fn set(&mut self, key: &MetricKey, members: &[u32]);

    /// Completes a flush cycle.
    fn flush(&mut self) {}
}

impl<P: Publisher + ?Sized> Publisher for Box<P> {
    fn counter(&mut self, key: &MetricKey, delta: i64) {
        (**self).counter(key, delta)
    }

    fn gauge(&mut self, key: &MetricKey, value: f64) {
        (**self).gauge(key, value)
    }

    fn distribution(&mut self, key: &MetricKey, observations: &[Observation]) {
        (**self).distribution(key, observations)
    }

    fn set(&mut self, key: &MetricKey, members: &[u32]) {
        (**self).set(key, members)
    }

    fn flush(&mut self) {
        (**self).flush()
    }
}

/// Returns the number of bytes needed to render the tag section of `key`, including the leading
/// `|#`.
fn tags_len(key: &MetricKey) -> usize {
    let tags = key.tags();
    if tags.is_empty() {
        return 0;
    }

    let separators = tags.len() + 1;
    let content: usize = tags
        .iter()
        .map(|tag| match tag.key() {
            "" => tag.value().len(),
            key => key.len() + 1 + tag.value().len(),
        })
        .sum();

    separators + content
}

/// Writes metrics in the DogStatsD line format into a [`PacketBatcher`].
///
/// ```text
/// <name>:<value>[:<value>...]|<type>|@<sample_rate>[|#<tag>,<tag>...]
/// ```
///
/// See <https://docs.datadoghq.com/developers/dogstatsd/datagram_shell?tab=metrics>.
#[derive(Debug)]
pub struct StatsdPublisher<T> {
    batcher: PacketBatcher<T>,
    scratch: String,
}

impl<T: Transport> StatsdPublisher<T> {
    /// Creates a publisher writing into the given batcher.
    pub fn new(batcher: PacketBatcher<T>) -> Self {
        Self {
            batcher,
            scratch: String::new(),
        }
    }

    fn write_str(&mut self, s: &str) {
        self.batcher.write(s.as_bytes());
    }

    fn write_display(&mut self, value: impl fmt::Display) {
        self.scratch.clear();
        // Writing into a `String` cannot fail.
        let _ = write!(self.scratch, "{value}");
        self.batcher.write(self.scratch.as_bytes());
    }

    fn start_line(&mut self, key: &MetricKey) {
        self.write_str(key.name());
    }

    fn end_line(&mut self, key: &MetricKey, ty: MetricType, sample_rate: Option<f64>) {
        self.write_str("|");
        self.write_str(ty.as_str());
        self.write_str("|@");
        match sample_rate {
            Some(rate) => self.write_display(rate),
            None => self.write_str("1"),
        }

        for (index, tag) in key.tags().iter().enumerate() {
            self.write_str(if index == 0 { "|#" } else { "," });
            if !tag.key().is_empty() {
                self.write_str(tag.key());
                self.write_str(":");
            }
            self.write_str(tag.value());
        }

        self.batcher.write_line_break();
    }

    /// Returns a reference to the underlying batcher.
    pub fn batcher(&self) -> &PacketBatcher<T> {
        &self.batcher
    }
}

impl<T: Transport> Publisher for StatsdPublisher<T> {
    fn counter(&mut self, key: &MetricKey, delta: i64) {
        self.start_line(key);
        self.write_str(":");
        self.write_display(delta);
        self.end_line(key, MetricType::Counter, None);
    }

    fn gauge(&mut self, key: &MetricKey, value: f64) {
        if !value.is_finite() {
            tally_log::debug!(metric = key.name(), value, "skipping non-finite gauge value");
            return;
        }

        self.start_line(key);
        self.write_str(":");
        self.write_display(value);
        self.end_line(key, MetricType::Gauge, None);
    }

    fn distribution(&mut self, key: &MetricKey, observations: &[Observation]) {
        let overhead = key.name().len() + "|d|@1".len() + tags_len(key) + 1;
        let budget = self.batcher.max_size().saturating_sub(overhead);

        let mut line_values = 0;
        let mut line_len = 0;

        for observation in observations {
            let value = observation.bucket.format();

            if observation.count < PACK_LIMIT {
                let token_len = 1 + value.len();
                for _ in 0..observation.count {
                    if line_values > 0 && line_len + token_len > budget {
                        self.end_line(key, MetricType::Distribution, None);
                        line_values = 0;
                        line_len = 0;
                    }
                    if line_values == 0 {
                        self.start_line(key);
                    }
                    self.write_str(":");
                    self.write_str(&value);
                    line_values += 1;
                    line_len += token_len;
                }
            } else {
                if line_values > 0 {
                    self.end_line(key, MetricType::Distribution, None);
                    line_values = 0;
                    line_len = 0;
                }
                self.start_line(key);
                self.write_str(":");
                self.write_str(&value);
                let sample_rate = 1.0 / f64::from(observation.count);
                self.end_line(key, MetricType::Distribution, Some(sample_rate));
            }
        }

        if line_values > 0 {
            self.end_line(key, MetricType::Distribution, None);
        }
    }

    fn set(&mut self, key: &MetricKey, members: &[u32]) {
        for &member in members {
            self.start_line(key);
            self.write_str(":");
            self.write_display(member);
            self.end_line(key, MetricType::Set, None);
        }
    }

    fn flush(&mut self) {
        self.batcher.flush();
    }
}

fn send_metric<'m, M>(
    mut builder: MetricBuilder<'m, '_, M>,
    key: &'m MetricKey,
    sample_rate: Option<f64>,
) where
    M: cadence::Metric + From<String>,
{
    for tag in key.tags() {
        builder = match tag.key() {
            "" => builder.with_tag_value(tag.value()),
            name => builder.with_tag(name, tag.value()),
        };
    }

    if let Some(rate) = sample_rate {
        builder = builder.with_sampling_rate(rate);
    }

    if let Err(error) = builder.try_send() {
        tally_log::debug!(
            error = &error as &dyn std::error::Error,
            metric = key.name(),
            "failed to send metric through cadence"
        );
    }
}

/// Publishes through a [`cadence`] client.
///
/// Each metric is sent individually and batching is left to the client's sink. Distribution buckets
/// with fewer than [`PACK_LIMIT`] observations are sent once per observation.
impl Publisher for StatsdClient {
    fn counter(&mut self, key: &MetricKey, delta: i64) {
        send_metric(self.count_with_tags(key.name(), delta), key, None);
    }

    fn gauge(&mut self, key: &MetricKey, value: f64) {
        send_metric(self.gauge_with_tags(key.name(), value), key, None);
    }

    fn distribution(&mut self, key: &MetricKey, observations: &[Observation]) {
        for observation in observations {
            let value = observation.bucket.value();
            if observation.count < PACK_LIMIT {
                for _ in 0..observation.count {
                    send_metric(self.distribution_with_tags(key.name(), value), key, None);
                }
            } else {
                let sample_rate = 1.0 / f64::from(observation.count);
                let builder = self.distribution_with_tags(key.name(), value);
                send_metric(builder, key, Some(sample_rate));
            }
        }
    }

    fn set(&mut self, key: &MetricKey, members: &[u32]) {
        for &member in members {
            send_metric(self.set_with_tags(key.name(), i64::from(member)), key, None);
        }
    }
}
