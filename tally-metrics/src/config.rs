use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::batcher::DEFAULT_MAX_PACKET_SIZE;
use crate::scheduler::DEFAULT_FLUSH_INTERVAL;

/// Indicates config related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to open or read the config file.
    #[error("could not open config file {}", .path.display())]
    CouldNotOpenFile {
        /// Path of the config file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
    /// The config file is not valid YAML or does not match the expected structure.
    #[error("could not parse yaml config file {}", .path.display())]
    BadYamlFile {
        /// Path of the config file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: serde_yaml::Error,
    },
    /// Inline config is not valid YAML or does not match the expected structure.
    #[error("could not parse yaml config")]
    BadYaml(#[source] serde_yaml::Error),
    /// A field has an invalid value.
    #[error("invalid config value for field {field}: {reason}")]
    InvalidValue {
        /// Name of the offending field.
        field: &'static str,
        /// What is wrong with the value.
        reason: &'static str,
    },
}

/// Controls where and how often metrics are reported.
///
/// All fields are optional in serialized form:
///
/// ```yaml
/// host: unixgram:///var/run/datadog/dsd.socket
/// flush_interval_ms: 2000
/// max_packet_size: 1400
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Address of the StatsD server.
    ///
    /// Either `host:port` for UDP, or a URL with scheme `udp://` or `unixgram://`.
    pub host: String,

    /// Interval between flushes in milliseconds.
    ///
    /// Should evenly divide the 10 second aggregation window of the agent.
    pub flush_interval_ms: u64,

    /// Maximum size of a single datagram in bytes.
    pub max_packet_size: usize,
}

impl MetricsConfig {
    /// Parses the config from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml).map_err(ConfigError::BadYaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the config from a YAML file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let contents = fs::read_to_string(path).map_err(|source| ConfigError::CouldNotOpenFile {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self =
            serde_yaml::from_str(&contents).map_err(|source| ConfigError::BadYamlFile {
                path: path.to_path_buf(),
                source,
            })?;

        config.validate()?;
        Ok(config)
    }

    /// The interval between flushes.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "host",
                reason: "must not be empty",
            });
        }

        if self.flush_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "flush_interval_ms",
                reason: "must be positive",
            });
        }

        if self.max_packet_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_packet_size",
                reason: "must be positive",
            });
        }

        Ok(())
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1:8125".to_owned(),
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL.as_millis() as u64,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = MetricsConfig::from_yaml("{}").unwrap();
        assert_eq!(config, MetricsConfig::default());
        assert_eq!(config.host, "127.0.0.1:8125");
        assert_eq!(config.flush_interval(), Duration::from_secs(2));
        assert_eq!(config.max_packet_size, 1400);
    }

    #[test]
    fn test_partial_override() {
        let config = MetricsConfig::from_yaml("host: unixgram:///tmp/dsd.socket").unwrap();
        assert_eq!(config.host, "unixgram:///tmp/dsd.socket");
        assert_eq!(config.flush_interval_ms, 2000);
    }

    #[test]
    fn test_invalid_values() {
        let error = MetricsConfig::from_yaml("flush_interval_ms: 0").unwrap_err();
        assert!(matches!(
            error,
            ConfigError::InvalidValue {
                field: "flush_interval_ms",
                ..
            }
        ));

        let error = MetricsConfig::from_yaml("max_packet_size: -1").unwrap_err();
        assert!(matches!(error, ConfigError::BadYaml(_)));
    }

    #[test]
    fn test_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "host: 10.0.0.1:8125\nmax_packet_size: 512").unwrap();

        let config = MetricsConfig::from_path(file.path()).unwrap();
        assert_eq!(config.host, "10.0.0.1:8125");
        assert_eq!(config.max_packet_size, 512);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.yml");

        let error = MetricsConfig::from_path(&path).unwrap_err();
        assert!(matches!(error, ConfigError::CouldNotOpenFile { .. }));
        assert!(error.to_string().contains("missing.yml"));
    }
}
