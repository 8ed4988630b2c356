//! Metric definitions and tag binding.
//!
//! Every metric is registered once with a [`Registry`] when the process starts, which validates
//! its name, description and tag keys. The resulting [`Definition`] is bound to concrete tag
//! values at the point of recording:
//!
//! ```
//! use tally_metrics::{Registry, Unit};
//!
//! let registry = Registry::new();
//! let responses = registry
//!     .counter(
//!         "rpc.responses",
//!         "Counts responses to each RPC by method and status.",
//!         Unit::Response,
//!         &["method", "status"],
//!     )
//!     .expect("valid definition");
//!
//! let resolved = responses.bind().value("get_user").value(200).resolve();
//! assert!(resolved.is_valid());
//! ```

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::key::{MetricKey, Tag, TagValue};
use crate::protocol::{self, MetricType, RESERVED_TAG_KEYS};
use crate::unit::Unit;
use crate::{Counter, Distribution, Gauge, Set};

/// Maximum length of a metric description in bytes.
pub const MAX_DESCRIPTION_LENGTH: usize = 400;

/// Name of the gauge reporting invalid metric definitions.
pub const BAD_DEFINITIONS_METRIC: &str = "metrics.bad_metric_definitions";

/// An error returned when registering a malformed metric definition.
///
/// These errors indicate a programming error and are meant to abort startup.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum DefinitionError {
    /// The metric name does not match `^[a-z][a-zA-Z0-9_.]{0,199}$`.
    #[error("metric name {0:?} is invalid, see https://docs.datadoghq.com/metrics/custom_metrics/#naming-custom-metrics")]
    InvalidName(String),
    /// The description is longer than [`MAX_DESCRIPTION_LENGTH`] bytes.
    #[error("description of metric {name:?} has {len} bytes, at most 400 are allowed")]
    DescriptionTooLong {
        /// The metric name.
        name: String,
        /// The length of the rejected description.
        len: usize,
    },
    /// A tag key does not match `^(|[a-z][a-zA-Z0-9_./-]{0,199})$`.
    #[error("tag key {key:?} of metric {name:?} is invalid")]
    InvalidTagKey {
        /// The metric name.
        name: String,
        /// The rejected key.
        key: String,
    },
    /// A tag key is reserved by the agent.
    #[error("tag key {key:?} of metric {name:?} is reserved")]
    ReservedTagKey {
        /// The metric name.
        name: String,
        /// The rejected key.
        key: String,
    },
    /// A non-empty tag key appears more than once.
    #[error("tag key {key:?} appears more than once in metric {name:?}")]
    DuplicateTagKey {
        /// The metric name.
        name: String,
        /// The repeated key.
        key: String,
    },
    /// Another metric with the same name has already been registered.
    #[error("metric {0:?} is defined more than once")]
    DuplicateName(String),
}

/// Reasons for reporting a definition under [`BAD_DEFINITIONS_METRIC`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum BadDefinitionReason {
    /// The definition was registered after the registry was sealed.
    RegisteredAfterStart,
    /// Tag values were bound with a count different from the number of tag keys.
    TagCountMismatch,
    /// [`Distribution::observe_duration`] was called on a distribution without a time unit.
    ObserveDurationBadUnits,
}

impl BadDefinitionReason {
    /// All reasons, in reporting order.
    pub const ALL: [Self; 3] = [
        Self::RegisteredAfterStart,
        Self::TagCountMismatch,
        Self::ObserveDurationBadUnits,
    ];

    /// Returns the value of the `reason` tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RegisteredAfterStart => "registered_after_start",
            Self::TagCountMismatch => "tag_count_mismatch",
            Self::ObserveDurationBadUnits => "observe_duration_bad_units",
        }
    }
}

impl fmt::Display for BadDefinitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters of invalid definition usage, shared by a registry and its engine.
#[derive(Debug, Default)]
pub struct Anomalies {
    counts: [AtomicU64; BadDefinitionReason::ALL.len()],
}

impl Anomalies {
    pub(crate) fn record(&self, reason: BadDefinitionReason) {
        self.counts[reason as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of occurrences recorded for `reason`.
    pub fn get(&self, reason: BadDefinitionReason) -> u64 {
        self.counts[reason as usize].load(Ordering::Relaxed)
    }
}

/// Metadata describing a registered metric.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// The type of the metric.
    pub metric_type: MetricType,
    /// The metric name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// The unit of the values.
    pub unit: Unit,
    /// The ordered tag keys.
    pub keys: Vec<String>,
}

struct DefinitionInner {
    name: String,
    keys: Vec<String>,
    unit: Unit,
    valid: bool,
    anomalies: Arc<Anomalies>,
}

/// A registered metric of kind `M`.
///
/// Definitions are cheap to clone. Bind tag values with [`bind`](Self::bind) to obtain a
/// [`Resolved`] key that can be passed to the engine.
pub struct Definition<M> {
    inner: Arc<DefinitionInner>,
    _kind: PhantomData<fn() -> M>,
}

impl<M> Definition<M> {
    fn new(inner: DefinitionInner) -> Self {
        Self {
            inner: Arc::new(inner),
            _kind: PhantomData,
        }
    }

    /// The metric name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The unit of the metric.
    pub fn unit(&self) -> Unit {
        self.inner.unit
    }

    /// The ordered tag keys.
    pub fn tag_keys(&self) -> &[String] {
        &self.inner.keys
    }

    /// Returns `false` if the definition was registered too late to be recorded.
    pub fn is_valid(&self) -> bool {
        self.inner.valid
    }

    /// Starts binding tag values in the order of the tag keys.
    pub fn bind(&self) -> TagBinder<M> {
        TagBinder {
            definition: self.clone(),
            values: Vec::with_capacity(self.inner.keys.len()),
        }
    }

    /// Resolves a definition without tag values.
    ///
    /// This is only valid for definitions without tag keys.
    pub fn resolve(&self) -> Resolved<M> {
        self.bind().resolve()
    }
}

impl<M> Clone for Definition<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _kind: PhantomData,
        }
    }
}

impl<M> fmt::Debug for Definition<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Definition")
            .field("name", &self.inner.name)
            .field("keys", &self.inner.keys)
            .field("unit", &self.inner.unit)
            .field("valid", &self.inner.valid)
            .finish()
    }
}

/// Collects tag values for a [`Definition`].
///
/// Binders can be cloned to reuse a common prefix of values:
///
/// ```
/// # use tally_metrics::{Registry, Unit};
/// # let registry = Registry::new();
/// # let def = registry.counter("jobs", "", Unit::Job, &["queue", "outcome"]).unwrap();
/// let queue = def.bind().value("emails");
/// let ok = queue.clone().value("ok").resolve();
/// let failed = queue.value("failed").resolve();
/// assert_ne!(ok, failed);
/// ```
pub struct TagBinder<M> {
    definition: Definition<M>,
    values: Vec<String>,
}

impl<M> TagBinder<M> {
    /// Appends the value for the next tag key.
    pub fn value(mut self, value: impl TagValue) -> Self {
        self.values.push(value.tag_value().into_owned());
        self
    }

    /// Builds the metric key from the bound values.
    ///
    /// Returns an invalid key if the definition is invalid or the number of values does not match
    /// the number of tag keys. The engine hands out inert metrics for invalid keys.
    pub fn resolve(&self) -> Resolved<M> {
        let inner = &self.definition.inner;
        let unit = inner.unit;

        if !inner.valid {
            return Resolved::invalid(unit);
        }

        if self.values.len() != inner.keys.len() {
            inner.anomalies.record(BadDefinitionReason::TagCountMismatch);
            tally_log::debug!(
                metric = inner.name.as_str(),
                expected = inner.keys.len(),
                actual = self.values.len(),
                "tag value count does not match tag keys"
            );
            return Resolved::invalid(unit);
        }

        let tags = inner
            .keys
            .iter()
            .zip(&self.values)
            .map(|(key, value)| Tag::new(key, value))
            .collect();

        Resolved {
            key: Some(MetricKey::from_parts(inner.name.clone(), tags)),
            unit,
            _kind: PhantomData,
        }
    }
}

impl<M> Clone for TagBinder<M> {
    fn clone(&self) -> Self {
        Self {
            definition: self.definition.clone(),
            values: self.values.clone(),
        }
    }
}

impl<M> fmt::Debug for TagBinder<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagBinder")
            .field("name", &self.definition.inner.name)
            .field("values", &self.values)
            .finish()
    }
}

/// A fully bound metric key of kind `M`.
pub struct Resolved<M> {
    key: Option<MetricKey>,
    unit: Unit,
    _kind: PhantomData<fn() -> M>,
}

impl<M> Resolved<M> {
    fn invalid(unit: Unit) -> Self {
        Self {
            key: None,
            unit,
            _kind: PhantomData,
        }
    }

    /// The metric key, or `None` if the binding was invalid.
    pub fn key(&self) -> Option<&MetricKey> {
        self.key.as_ref()
    }

    /// Returns `true` if this key can be recorded.
    pub fn is_valid(&self) -> bool {
        self.key.is_some()
    }

    pub(crate) fn unit(&self) -> Unit {
        self.unit
    }
}

impl<M> Clone for Resolved<M> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            unit: self.unit,
            _kind: PhantomData,
        }
    }
}

impl<M> PartialEq for Resolved<M> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<M> fmt::Debug for Resolved<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.key {
            Some(ref key) => write!(f, "Resolved({key})"),
            None => f.write_str("Resolved(<invalid>)"),
        }
    }
}

fn validate(name: &str, description: &str, keys: &[&str]) -> Result<(), DefinitionError> {
    if !protocol::is_valid_name(name) {
        return Err(DefinitionError::InvalidName(name.to_owned()));
    }

    if description.len() > MAX_DESCRIPTION_LENGTH {
        return Err(DefinitionError::DescriptionTooLong {
            name: name.to_owned(),
            len: description.len(),
        });
    }

    let mut seen = BTreeSet::new();
    for &key in keys {
        let error = if RESERVED_TAG_KEYS.contains(&key) {
            DefinitionError::ReservedTagKey {
                name: name.to_owned(),
                key: key.to_owned(),
            }
        } else if !protocol::is_valid_tag_key(key) {
            DefinitionError::InvalidTagKey {
                name: name.to_owned(),
                key: key.to_owned(),
            }
        } else if !key.is_empty() && !seen.insert(key) {
            DefinitionError::DuplicateTagKey {
                name: name.to_owned(),
                key: key.to_owned(),
            }
        } else {
            continue;
        };

        return Err(error);
    }

    Ok(())
}

/// The set of metric definitions of a process.
///
/// Definitions are registered during startup. Creating an engine seals the registry, after which
/// new registrations still succeed but produce invalid definitions that record nothing. These are
/// counted and reported under [`BAD_DEFINITIONS_METRIC`] with `reason:registered_after_start`.
pub struct Registry {
    definitions: Mutex<BTreeMap<String, Metadata>>,
    sealed: AtomicBool,
    anomalies: Arc<Anomalies>,
    bad_definitions: Definition<Gauge>,
}

impl Registry {
    /// Creates a registry containing only the built-in definitions.
    pub fn new() -> Self {
        let anomalies = Arc::new(Anomalies::default());

        let bad_definitions = Definition::new(DefinitionInner {
            name: BAD_DEFINITIONS_METRIC.to_owned(),
            keys: vec!["reason".to_owned()],
            unit: Unit::Item,
            valid: true,
            anomalies: Arc::clone(&anomalies),
        });

        let mut definitions = BTreeMap::new();
        definitions.insert(
            BAD_DEFINITIONS_METRIC.to_owned(),
            Metadata {
                metric_type: MetricType::Gauge,
                name: BAD_DEFINITIONS_METRIC.to_owned(),
                description: "The number of invalid metric definitions or usages by reason. \
                    Metrics affected by these are not recorded."
                    .to_owned(),
                unit: Unit::Item,
                keys: vec!["reason".to_owned()],
            },
        );

        Self {
            definitions: Mutex::new(definitions),
            sealed: AtomicBool::new(false),
            anomalies,
            bad_definitions,
        }
    }

    /// Registers a counter.
    pub fn counter(
        &self,
        name: &str,
        description: &str,
        unit: Unit,
        keys: &[&str],
    ) -> Result<Definition<Counter>, DefinitionError> {
        self.register(MetricType::Counter, name, description, unit, keys)
    }

    /// Registers a gauge.
    pub fn gauge(
        &self,
        name: &str,
        description: &str,
        unit: Unit,
        keys: &[&str],
    ) -> Result<Definition<Gauge>, DefinitionError> {
        self.register(MetricType::Gauge, name, description, unit, keys)
    }

    /// Registers a distribution.
    pub fn distribution(
        &self,
        name: &str,
        description: &str,
        unit: Unit,
        keys: &[&str],
    ) -> Result<Definition<Distribution>, DefinitionError> {
        self.register(MetricType::Distribution, name, description, unit, keys)
    }

    /// Registers a set.
    pub fn set(
        &self,
        name: &str,
        description: &str,
        unit: Unit,
        keys: &[&str],
    ) -> Result<Definition<Set>, DefinitionError> {
        self.register(MetricType::Set, name, description, unit, keys)
    }

    fn register<M>(
        &self,
        metric_type: MetricType,
        name: &str,
        description: &str,
        unit: Unit,
        keys: &[&str],
    ) -> Result<Definition<M>, DefinitionError> {
        validate(name, description, keys)?;

        let keys: Vec<String> = keys.iter().map(|&key| key.to_owned()).collect();
        let mut definitions = self.definitions.lock();

        // Checked under the lock so that a concurrent seal either sees this definition or
        // invalidates it.
        let valid = !self.is_sealed();
        if valid {
            if definitions.contains_key(name) {
                return Err(DefinitionError::DuplicateName(name.to_owned()));
            }

            definitions.insert(
                name.to_owned(),
                Metadata {
                    metric_type,
                    name: name.to_owned(),
                    description: description.to_owned(),
                    unit,
                    keys: keys.clone(),
                },
            );
        } else {
            self.anomalies
                .record(BadDefinitionReason::RegisteredAfterStart);
            tally_log::warn!(metric = name, "metric registered after startup");
        }

        Ok(Definition::new(DefinitionInner {
            name: name.to_owned(),
            keys,
            unit,
            valid,
            anomalies: Arc::clone(&self.anomalies),
        }))
    }

    /// Seals the registry. Definitions registered afterwards are invalid.
    pub fn seal(&self) {
        let _definitions = self.definitions.lock();
        self.sealed.store(true, Ordering::Relaxed);
    }

    /// Returns `true` once [`seal`](Self::seal) has been called.
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Relaxed)
    }

    /// Returns the metadata of all valid definitions, keyed by name.
    pub fn definitions(&self) -> BTreeMap<String, Metadata> {
        self.definitions.lock().clone()
    }

    /// Serializes all definitions into pretty-printed JSON.
    pub fn dump_definitions(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&*self.definitions.lock())
    }

    /// The counters of invalid definition usage.
    pub fn anomalies(&self) -> &Arc<Anomalies> {
        &self.anomalies
    }

    pub(crate) fn bad_definitions(&self) -> &Definition<Gauge> {
        &self.bad_definitions
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("definitions", &self.definitions.lock().len())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_bind() {
        let registry = Registry::new();
        let def = registry
            .counter("rpc.responses", "Responses", Unit::Response, &["method", ""])
            .unwrap();

        let resolved = def.bind().value("Get User").value(true).resolve();
        let key = resolved.key().unwrap();

        assert_eq!(key.name(), "rpc.responses");
        assert_eq!(key.to_string(), "rpc.responses|#method:get_user,true");
    }

    #[test]
    fn test_prefix_binder_reuse() {
        let registry = Registry::new();
        let def = registry
            .gauge("queue.depth", "", Unit::Item, &["queue", "priority"])
            .unwrap();

        let prefix = def.bind().value("emails");
        let high = prefix.clone().value("high").resolve();
        let low = prefix.value("low").resolve();

        assert_eq!(high, def.bind().value("emails").value("high").resolve());
        assert_ne!(high, low);
    }

    #[test]
    fn test_tag_count_mismatch() {
        let registry = Registry::new();
        let def = registry
            .gauge("queue.depth", "", Unit::Item, &["queue"])
            .unwrap();

        assert!(!def.resolve().is_valid());
        assert!(!def.bind().value("a").value("b").resolve().is_valid());
        assert!(def.bind().value("a").resolve().is_valid());

        let mismatches = registry
            .anomalies()
            .get(BadDefinitionReason::TagCountMismatch);
        assert_eq!(mismatches, 2);
    }

    #[test]
    fn test_validation_errors() {
        let registry = Registry::new();

        assert_eq!(
            registry.counter("Bad", "", Unit::Unit, &[]).unwrap_err(),
            DefinitionError::InvalidName("Bad".to_owned())
        );
        assert!(matches!(
            registry.counter("ok", &"x".repeat(401), Unit::Unit, &[]),
            Err(DefinitionError::DescriptionTooLong { len: 401, .. })
        ));
        assert!(registry.counter("ok", &"x".repeat(400), Unit::Unit, &[]).is_ok());
        assert!(matches!(
            registry.counter("ok2", "", Unit::Unit, &["host"]),
            Err(DefinitionError::ReservedTagKey { .. })
        ));
        assert!(matches!(
            registry.counter("ok2", "", Unit::Unit, &["a:b"]),
            Err(DefinitionError::InvalidTagKey { .. })
        ));
        assert!(matches!(
            registry.counter("ok2", "", Unit::Unit, &["a", "a"]),
            Err(DefinitionError::DuplicateTagKey { .. })
        ));
        assert!(registry.counter("ok2", "", Unit::Unit, &["", ""]).is_ok());
        assert_eq!(
            registry.gauge("ok", "", Unit::Unit, &[]).unwrap_err(),
            DefinitionError::DuplicateName("ok".to_owned())
        );
    }

    #[test]
    fn test_registered_after_seal() {
        let registry = Registry::new();
        registry.seal();

        let def = registry.counter("late", "", Unit::Unit, &[]).unwrap();
        assert!(!def.is_valid());
        assert!(!def.resolve().is_valid());
        assert!(!registry.definitions().contains_key("late"));

        let late = registry
            .anomalies()
            .get(BadDefinitionReason::RegisteredAfterStart);
        assert_eq!(late, 1);
        // Invalid definitions are not counted again when bound.
        assert_eq!(
            registry
                .anomalies()
                .get(BadDefinitionReason::TagCountMismatch),
            0
        );
    }

    #[test]
    fn test_dump_definitions() {
        let registry = Registry::new();
        registry
            .distribution(
                "rpc.latency",
                "Latency of RPCs.",
                Unit::Millisecond,
                &["method"],
            )
            .unwrap();

        insta::assert_snapshot!(registry.dump_definitions().unwrap(), @r#"
        {
          "metrics.bad_metric_definitions": {
            "metricType": "g",
            "name": "metrics.bad_metric_definitions",
            "description": "The number of invalid metric definitions or usages by reason. Metrics affected by these are not recorded.",
            "unit": "item",
            "keys": [
              "reason"
            ]
          },
          "rpc.latency": {
            "metricType": "d",
            "name": "rpc.latency",
            "description": "Latency of RPCs.",
            "unit": "millisecond",
            "keys": [
              "method"
            ]
          }
        }
        "#);
    }
}
