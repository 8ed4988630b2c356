use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::batcher::PacketBatcher;
use crate::config::MetricsConfig;
use crate::counter::Counter;
use crate::definition::{BadDefinitionReason, Registry, Resolved};
use crate::distribution::Distribution;
use crate::gauge::Gauge;
use crate::key::MetricKey;
use crate::publisher::{Publisher, StatsdPublisher};
use crate::scheduler::{FlushHook, FlushScheduler};
use crate::set::Set;
use crate::store::MetricStore;
use crate::transport::Remote;

/// An error returned when starting the metrics engine.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// The StatsD address could not be resolved or connected.
    #[error("failed to connect to statsd at {host}")]
    Connect {
        /// The configured address.
        host: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
    /// The flush thread could not be started.
    #[error("failed to spawn the flush thread")]
    Spawn(#[source] io::Error),
}

#[derive(Default)]
struct Stores {
    counters: MetricStore<MetricKey, Counter>,
    gauges: MetricStore<MetricKey, Gauge>,
    distributions: MetricStore<MetricKey, Distribution>,
    sets: MetricStore<MetricKey, Set>,
}

impl Stores {
    fn publish(&self, publisher: &mut dyn Publisher) {
        self.gauges
            .for_each(|key, gauge| gauge.publish(key, publisher));
        self.counters
            .for_each(|key, counter| counter.publish(key, publisher));
        self.distributions
            .for_each(|key, distribution| distribution.publish(key, publisher));
        self.sets.for_each(|key, set| set.publish(key, publisher));
        publisher.flush();
    }
}

/// Instances handed out for invalid keys. They are never published.
struct Inert {
    counter: Arc<Counter>,
    gauge: Arc<Gauge>,
    distribution: Arc<Distribution>,
    set: Arc<Set>,
}

impl Inert {
    fn new() -> Self {
        Self {
            counter: Arc::new(Counter::new()),
            gauge: Arc::new(Gauge::new()),
            distribution: Arc::new(Distribution::inert()),
            set: Arc::new(Set::inert()),
        }
    }
}

/// The metrics engine.
///
/// Holds one instance per distinct metric key and publishes all of them from a background thread
/// at a fixed interval. Look up instances with [`counter`](Self::counter),
/// [`gauge`](Self::gauge), [`distribution`](Self::distribution) and [`set`](Self::set). Lookups are
/// relatively expensive compared to recording a value, so hot paths should keep the returned
/// handle:
///
/// ```no_run
/// use std::sync::Arc;
/// use tally_metrics::{Metrics, MetricsConfig, Registry, Unit};
///
/// let registry = Arc::new(Registry::new());
/// let responses = registry
///     .counter("rpc.responses", "Responses by status.", Unit::Response, &["status"])
///     .expect("valid definition");
///
/// let metrics = Metrics::new(&MetricsConfig::default(), registry)?;
/// let ok = metrics.counter(&responses.bind().value("ok").resolve());
/// ok.add(1);
/// # Ok::<(), tally_metrics::MetricsError>(())
/// ```
///
/// Creating the engine seals the registry.
pub struct Metrics {
    stores: Arc<Stores>,
    registry: Arc<Registry>,
    inert: Inert,
    scheduler: FlushScheduler,
}

impl Metrics {
    /// Starts an engine reporting to the StatsD server configured in `config`.
    pub fn new(config: &MetricsConfig, registry: Arc<Registry>) -> Result<Self, MetricsError> {
        let remote = Remote::connect(&config.host).map_err(|source| MetricsError::Connect {
            host: config.host.clone(),
            source,
        })?;

        tally_log::info!("reporting metrics to statsd at {}", config.host);

        let publisher = StatsdPublisher::new(PacketBatcher::new(remote, config.max_packet_size));
        Self::with_publisher(config.flush_interval(), registry, publisher)
    }

    /// Starts an engine reporting to a custom publisher.
    pub fn with_publisher<P>(
        flush_interval: Duration,
        registry: Arc<Registry>,
        mut publisher: P,
    ) -> Result<Self, MetricsError>
    where
        P: Publisher + 'static,
    {
        registry.seal();

        let stores = Arc::new(Stores::default());

        let anomaly_gauges: Vec<_> = BadDefinitionReason::ALL
            .into_iter()
            .filter_map(|reason| {
                let resolved = registry
                    .bad_definitions()
                    .bind()
                    .value(reason.as_str())
                    .resolve();
                let key = resolved.key()?;
                Some((reason, stores.gauges.get_or_insert_with(key, Gauge::new)))
            })
            .collect();

        let cycle_stores = Arc::clone(&stores);
        let anomalies = Arc::clone(registry.anomalies());
        let scheduler = FlushScheduler::spawn(flush_interval, move || {
            for (reason, gauge) in &anomaly_gauges {
                gauge.set(anomalies.get(*reason) as f64);
            }
            cycle_stores.publish(&mut publisher);
        })
        .map_err(MetricsError::Spawn)?;

        Ok(Self {
            stores,
            registry,
            inert: Inert::new(),
            scheduler,
        })
    }

    /// Returns the counter for the given key.
    ///
    /// The same key always yields the same counter. Invalid keys yield a counter that is never
    /// reported.
    pub fn counter(&self, resolved: &Resolved<Counter>) -> Arc<Counter> {
        match resolved.key() {
            Some(key) => self.stores.counters.get_or_insert_with(key, Counter::new),
            None => Arc::clone(&self.inert.counter),
        }
    }

    /// Returns the gauge for the given key.
    ///
    /// The same key always yields the same gauge. Invalid keys yield a gauge that is never
    /// reported.
    pub fn gauge(&self, resolved: &Resolved<Gauge>) -> Arc<Gauge> {
        match resolved.key() {
            Some(key) => self.stores.gauges.get_or_insert_with(key, Gauge::new),
            None => Arc::clone(&self.inert.gauge),
        }
    }

    /// Returns the distribution for the given key.
    pub fn distribution(&self, resolved: &Resolved<Distribution>) -> Arc<Distribution> {
        match resolved.key() {
            Some(key) => self.stores.distributions.get_or_insert_with(key, || {
                Distribution::new(resolved.unit(), Arc::clone(self.registry.anomalies()))
            }),
            None => Arc::clone(&self.inert.distribution),
        }
    }

    /// Returns the set for the given key.
    pub fn set(&self, resolved: &Resolved<Set>) -> Arc<Set> {
        match resolved.key() {
            Some(key) => self.stores.sets.get_or_insert_with(key, Set::new),
            None => Arc::clone(&self.inert.set),
        }
    }

    /// Calls `f` at the start of every flush, before any metric is published.
    ///
    /// Useful for gauges that are computed periodically. `f` runs on the flush thread and delays
    /// reporting, so it should be cheap.
    pub fn every_flush<F>(&self, f: F) -> FlushHook
    where
        F: FnMut() + Send + 'static,
    {
        self.scheduler.every_flush(f)
    }

    /// Publishes all pending metric data and blocks until it has been handed to the transport.
    pub fn flush(&self) {
        self.scheduler.flush();
    }

    /// Publishes pending data one last time and stops the flush thread.
    ///
    /// Metrics recorded afterwards are never reported. Dropping the engine closes it as well.
    pub fn close(&self) {
        self.scheduler.close();
    }

    /// The registry this engine was created with.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics")
            .field("counters", &self.stores.counters.len())
            .field("gauges", &self.stores.gauges.len())
            .field("distributions", &self.stores.distributions.len())
            .field("sets", &self.stores.sets.len())
            .field("scheduler", &self.scheduler)
            .finish()
    }
}
