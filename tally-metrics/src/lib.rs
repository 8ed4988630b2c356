//! Client-side metric aggregation for DogStatsD.
//!
//! Metrics are recorded in-process with little overhead and reported to a StatsD agent in batches
//! from a background thread. Counters report the sum of increments per flush interval, gauges
//! report their last value until unset, distributions report new observations compressed into a
//! logarithmic sketch, and sets report the distinct members observed per interval.
//!
//! ## Defining Metrics
//!
//! Every metric is declared once on a [`Registry`] with a name, a description, a [`Unit`] and the
//! keys of its tags. Registration validates the definition and fails for malformed names or tag
//! keys, which is meant to abort startup:
//!
//! ```
//! use tally_metrics::{Registry, Unit};
//!
//! let registry = Registry::new();
//! let latency = registry
//!     .distribution(
//!         "rpc.latency",
//!         "Time to respond to an RPC.",
//!         Unit::Millisecond,
//!         &["method"],
//!     )
//!     .expect("valid definition");
//! # let _ = latency;
//! ```
//!
//! ## Recording
//!
//! The [`Metrics`] engine hands out one instance per definition and combination of tag values.
//! Starting the engine seals the registry, so all definitions should be registered beforehand:
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use tally_metrics::{Metrics, PacketBatcher, Registry, StatsdPublisher, Unit};
//!
//! let registry = Arc::new(Registry::new());
//! let latency = registry
//!     .distribution("rpc.latency", "", Unit::Millisecond, &["method"])
//!     .unwrap();
//!
//! // Capture the datagrams in a channel instead of sending them over the network.
//! let (tx, rx) = crossbeam_channel::unbounded();
//! let publisher = StatsdPublisher::new(PacketBatcher::new(tx, 1400));
//! let metrics = Metrics::with_publisher(Duration::from_secs(2), registry, publisher).unwrap();
//!
//! let get = metrics.distribution(&latency.bind().value("get").resolve());
//! get.observe_duration(Duration::from_millis(1));
//! metrics.flush();
//!
//! let frame = String::from_utf8(rx.recv().unwrap()).unwrap();
//! assert!(frame.contains("rpc.latency:1|d|@1|#method:get\n"));
//! ```
//!
//! Definitions registered after the engine started, and tag bindings with the wrong number of
//! values, produce inert instances that record nothing. Such usage is reported under the gauge
//! `metrics.bad_metric_definitions`.
//!
//! ## Reporting
//!
//! [`Metrics::new`] sends to the address in [`MetricsConfig`], over UDP or a Unix datagram socket.
//! Datagrams never exceed the configured packet size and only contain complete lines. To report
//! through a different client, implement [`Publisher`] and start the engine with
//! [`Metrics::with_publisher`]. A [`cadence::StatsdClient`] can be used directly.
#![warn(missing_docs)]

mod batcher;
mod bucketed;
mod config;
mod counter;
mod definition;
mod distribution;
mod engine;
mod gauge;
mod key;
mod protocol;
mod publisher;
mod scheduler;
mod set;
mod sketch;
mod store;
mod transport;
mod unit;

pub use self::batcher::{DEFAULT_MAX_PACKET_SIZE, PacketBatcher};
pub use self::bucketed::{
    BucketedCounter, BucketedGaugeGroup, GaugeGroup, exponential_buckets, linear_buckets,
};
pub use self::config::{ConfigError, MetricsConfig};
pub use self::counter::Counter;
pub use self::definition::{
    Anomalies, BAD_DEFINITIONS_METRIC, BadDefinitionReason, Definition, DefinitionError,
    MAX_DESCRIPTION_LENGTH, Metadata, Registry, Resolved, TagBinder,
};
pub use self::distribution::Distribution;
pub use self::engine::{Metrics, MetricsError};
pub use self::gauge::Gauge;
pub use self::key::{MetricKey, Tag, TagValue, sanitize_tag};
pub use self::protocol::{MAX_NAME_LENGTH, MetricType, ParseMetricTypeError, hash_set_value};
pub use self::publisher::{PACK_LIMIT, Publisher, StatsdPublisher};
pub use self::scheduler::{DEFAULT_FLUSH_INTERVAL, FlushHook, FlushScheduler};
pub use self::set::Set;
pub use self::sketch::{Bucket, Observation, RELATIVE_ERROR, Sketch};
pub use self::store::MetricStore;
pub use self::transport::{Remote, Transport};
pub use self::unit::{ParseUnitError, Unit};
