use std::fmt;
use std::hash::Hasher as _;

use hash32::{FnvHasher, Hasher};

use crate::unit::impl_str_serde;

/// The type of a metric, determining how it is aggregated between flushes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum MetricType {
    /// Counts instances of an event.
    ///
    /// Each flush reports the sum of all increments since the previous flush.
    Counter,
    /// Stores the last reported value.
    ///
    /// The value is reported on every flush until it is changed or unset.
    Gauge,
    /// Builds a statistical distribution over values reported.
    ///
    /// Values are collected into logarithmic buckets with bounded relative error. Each flush
    /// reports the observations added since the previous flush.
    Distribution,
    /// Counts the number of unique reported values.
    Set,
}

impl MetricType {
    /// Return the shortcode for this metric type.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "c",
            MetricType::Gauge => "g",
            MetricType::Distribution => "d",
            MetricType::Set => "s",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MetricType {
    type Err = ParseMetricTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "c" => Self::Counter,
            "g" => Self::Gauge,
            "d" => Self::Distribution,
            "s" => Self::Set,
            _ => return Err(ParseMetricTypeError(())),
        })
    }
}

impl_str_serde!(MetricType, "a metric type shortcode");

/// An error returned when parsing an unknown [`MetricType`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[error("unknown metric type")]
pub struct ParseMetricTypeError(());

/// Hashes the given set value.
///
/// Sets only guarantee 32-bit accuracy, but arbitrary strings are allowed as members. Only the
/// hash is retained and sent to the agent.
pub fn hash_set_value(string: &str) -> u32 {
    let mut hasher = FnvHasher::default();
    hasher.write(string.as_bytes());
    hasher.finish32()
}

/// Maximum length of metric names and tag keys.
pub const MAX_NAME_LENGTH: usize = 200;

/// Tag keys reserved by the agent for unified service tagging.
///
/// See <https://docs.datadoghq.com/getting_started/tagging/#overview>.
pub(crate) const RESERVED_TAG_KEYS: &[&str] =
    &["host", "device", "source", "service", "env", "version"];

/// Validates a metric name.
///
/// Names start with a lowercase ASCII letter followed by at most 199 ASCII alphanumerics, `_` or
/// `.`. See <https://docs.datadoghq.com/metrics/custom_metrics/#naming-custom-metrics>.
pub(crate) fn is_valid_name(name: &str) -> bool {
    let mut iter = name.as_bytes().iter();
    if name.len() > MAX_NAME_LENGTH {
        return false;
    }
    if let Some(first_byte) = iter.next() {
        if first_byte.is_ascii_lowercase() {
            return iter.all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_'));
        }
    }
    false
}

/// Validates a tag key.
///
/// Like names, but `/` and `-` are allowed as well. `:` is not allowed since the first colon
/// separates key and value. The empty key is valid and renders the tag as its bare value.
pub(crate) fn is_valid_tag_key(key: &str) -> bool {
    if key.is_empty() {
        return true;
    }
    if key.len() > MAX_NAME_LENGTH {
        return false;
    }

    let mut iter = key.as_bytes().iter();
    match iter.next() {
        Some(first_byte) if first_byte.is_ascii_lowercase() => iter
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'/' | b'-')),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(is_valid_name("rpc.responses"));
        assert!(is_valid_name("a"));
        assert!(is_valid_name("cache_hitRate.p99"));
        assert!(is_valid_name(&"a".repeat(200)));

        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Rpc"));
        assert!(!is_valid_name("1rpc"));
        assert!(!is_valid_name("rpc-responses"));
        assert!(!is_valid_name("rpc/responses"));
        assert!(!is_valid_name(&"a".repeat(201)));
    }

    #[test]
    fn test_valid_tag_keys() {
        assert!(is_valid_tag_key(""));
        assert!(is_valid_tag_key("method"));
        assert!(is_valid_tag_key("http.status-code/class"));

        assert!(!is_valid_tag_key("Method"));
        assert!(!is_valid_tag_key("_method"));
        assert!(!is_valid_tag_key("method:name"));
        assert!(!is_valid_tag_key("mëthod"));
        assert!(!is_valid_tag_key(&"k".repeat(201)));
    }

    #[test]
    fn test_metric_type_roundtrip() {
        for ty in [
            MetricType::Counter,
            MetricType::Gauge,
            MetricType::Distribution,
            MetricType::Set,
        ] {
            assert_eq!(ty.as_str().parse::<MetricType>(), Ok(ty));
        }
        assert!("ms".parse::<MetricType>().is_err());
    }

    #[test]
    fn test_hash_set_value() {
        // FNV-1a of the empty input is the offset basis.
        assert_eq!(hash_set_value(""), 0x811c9dc5);
        assert_eq!(hash_set_value("e2e"), hash_set_value("e2e"));
        assert_ne!(hash_set_value("e2e"), hash_set_value("e2f"));
    }
}
