use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::definition::{Anomalies, BadDefinitionReason};
use crate::key::MetricKey;
use crate::publisher::Publisher;
use crate::sketch::Sketch;
use crate::unit::Unit;

/// Builds a statistical distribution over values reported.
///
/// Values are accumulated in a [`Sketch`]. Every flush reports the observations added since the
/// previous flush, each rounded to its bucket value.
#[derive(Debug)]
pub struct Distribution {
    sketch: Sketch,
    unit: Unit,
    /// Counters for invalid usage. `None` for inert distributions.
    anomalies: Option<Arc<Anomalies>>,
    bad_units: AtomicBool,
}

impl Distribution {
    pub(crate) fn new(unit: Unit, anomalies: Arc<Anomalies>) -> Self {
        Self {
            sketch: Sketch::new(),
            unit,
            anomalies: Some(anomalies),
            bad_units: AtomicBool::new(false),
        }
    }

    /// Creates a distribution that discards all observations.
    pub(crate) fn inert() -> Self {
        Self {
            sketch: Sketch::new(),
            unit: Unit::Unit,
            anomalies: None,
            bad_units: AtomicBool::new(false),
        }
    }

    /// Records a single value.
    ///
    /// Infinite and NaN values are dropped.
    #[inline]
    pub fn observe(&self, value: f64) {
        if self.anomalies.is_some() {
            self.sketch.observe(value);
        }
    }

    /// Records a duration converted into the unit of this distribution.
    ///
    /// This works for distributions defined in nanoseconds, microseconds, milliseconds, seconds,
    /// minutes or hours. For all other units, nothing is recorded and the distribution is reported
    /// once under `metrics.bad_metric_definitions` with `reason:observe_duration_bad_units`.
    pub fn observe_duration(&self, duration: Duration) {
        let Some(ref anomalies) = self.anomalies else {
            return;
        };

        match self.unit.convert_duration(duration) {
            Some(value) => self.observe(value),
            None => {
                if !self.bad_units.swap(true, Ordering::Relaxed) {
                    anomalies.record(BadDefinitionReason::ObserveDurationBadUnits);
                    tally_log::debug!(
                        unit = self.unit.as_str(),
                        "observe_duration called on a distribution without a time unit"
                    );
                }
            }
        }
    }

    /// The unit of this distribution.
    pub fn unit(&self) -> Unit {
        self.unit
    }

    #[cfg(test)]
    fn has_bad_units(&self) -> bool {
        self.bad_units.load(Ordering::Relaxed)
    }

    pub(crate) fn publish(&self, key: &MetricKey, publisher: &mut dyn Publisher) {
        let observations = self.sketch.new_observations();
        if !observations.is_empty() {
            publisher.distribution(key, &observations);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_duration_converts() {
        let distribution = Distribution::new(Unit::Millisecond, Arc::default());
        distribution.observe_duration(Duration::from_millis(250));

        let observations = distribution.sketch.new_observations();
        assert_eq!(observations.len(), 1);

        let value = observations[0].bucket.value();
        assert!((value - 250.0).abs() / 250.0 <= crate::sketch::RELATIVE_ERROR);
        assert!(!distribution.has_bad_units());
    }

    #[test]
    fn test_observe_duration_bad_units() {
        let anomalies = Arc::new(Anomalies::default());
        let distribution = Distribution::new(Unit::Byte, Arc::clone(&anomalies));
        distribution.observe_duration(Duration::from_secs(1));
        distribution.observe_duration(Duration::from_secs(2));

        assert!(distribution.sketch.new_observations().is_empty());
        assert!(distribution.has_bad_units());
        assert_eq!(anomalies.get(BadDefinitionReason::ObserveDurationBadUnits), 1);
    }

    #[test]
    fn test_inert_discards() {
        let distribution = Distribution::inert();
        distribution.observe(1.0);
        distribution.observe_duration(Duration::from_secs(1));

        assert!(distribution.sketch.new_observations().is_empty());
        assert!(!distribution.has_bad_units());
    }
}
