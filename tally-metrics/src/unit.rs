use std::fmt;
use std::time::Duration;

/// Implements `Serialize` via `Display` and `Deserialize` via `FromStr`.
macro_rules! impl_str_serde {
    ($type:ty, $expectation:expr) => {
        impl ::serde::ser::Serialize for $type {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: ::serde::ser::Serializer,
            {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> ::serde::de::Deserialize<'de> for $type {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: ::serde::de::Deserializer<'de>,
            {
                struct V;

                impl ::serde::de::Visitor<'_> for V {
                    type Value = $type;

                    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                        formatter.write_str($expectation)
                    }

                    fn visit_str<E>(self, value: &str) -> Result<$type, E>
                    where
                        E: ::serde::de::Error,
                    {
                        value.parse().map_err(|_| {
                            ::serde::de::Error::invalid_value(
                                ::serde::de::Unexpected::Str(value),
                                &self,
                            )
                        })
                    }
                }

                deserializer.deserialize_str(V)
            }
        }
    };
}

pub(crate) use impl_str_serde;

macro_rules! units {
    ($($(#[$group:meta])* $variant:ident => $name:literal,)*) => {
        /// The unit of a metric.
        ///
        /// The unit is only metadata. It is reported alongside the description when metric
        /// definitions are synchronized with the backend and selects the conversion applied by
        /// [`Distribution::observe_duration`](crate::Distribution::observe_duration). Values are
        /// sent as-is.
        ///
        /// This is the list of units accepted by Datadog, see
        /// <https://docs.datadoghq.com/metrics/units/#unit-list>.
        #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
        #[non_exhaustive]
        pub enum Unit {
            $($(#[$group])* #[doc = concat!("`", $name, "`")] $variant,)*
        }

        impl Unit {
            /// Returns the name of this unit as understood by the backend.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)*
                }
            }
        }

        impl std::str::FromStr for Unit {
            type Err = ParseUnitError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(match s {
                    $($name => Self::$variant,)*
                    _ => return Err(ParseUnitError(())),
                })
            }
        }
    };
}

units! {
    Bit => "bit",
    Byte => "byte",
    Kibibyte => "kibibyte",
    Mebibyte => "mebibyte",
    Gibibyte => "gibibyte",
    Tebibyte => "tebibyte",
    Pebibyte => "pebibyte",
    Exbibyte => "exbibyte",

    Nanosecond => "nanosecond",
    Microsecond => "microsecond",
    Millisecond => "millisecond",
    Second => "second",
    Minute => "minute",
    Hour => "hour",
    Day => "day",
    Week => "week",

    PercentNano => "percent_nano",
    Percent => "percent",
    Apdex => "apdex",
    Fraction => "fraction",

    Connection => "connection",
    Request => "request",
    Packet => "packet",
    Segment => "segment",
    Response => "response",
    Message => "message",
    Payload => "payload",
    Timeout => "timeout",
    Datagram => "datagram",
    Route => "route",
    Session => "session",
    Hop => "hop",

    Process => "process",
    Thread => "thread",
    Host => "host",
    Node => "node",
    Fault => "fault",
    Service => "service",
    Instance => "instance",
    Cpu => "cpu",

    File => "file",
    Inode => "inode",
    Sector => "sector",
    Block => "block",

    Buffer => "buffer",
    Error => "error",
    Read => "read",
    Write => "write",
    Occurrence => "occurrence",
    Event => "event",
    Time => "time",
    Unit => "unit",
    Operation => "operation",
    Item => "item",
    Task => "task",
    Worker => "worker",
    Resource => "resource",
    GarbageCollection => "garbage collection",
    Email => "email",
    Sample => "sample",
    Stage => "stage",
    Monitor => "monitor",
    Location => "location",
    Check => "check",
    Attempt => "attempt",
    Device => "device",
    Update => "update",
    Method => "method",
    Job => "job",
    Container => "container",
    Execution => "execution",
    Throttle => "throttle",
    Invocation => "invocation",
    User => "user",
    Success => "success",
    Build => "build",
    Prediction => "prediction",
    Exception => "exception",

    Table => "table",
    Index => "index",
    Lock => "lock",
    Transaction => "transaction",
    Query => "query",
    Row => "row",
    Key => "key",
    Command => "command",
    Offset => "offset",
    Record => "record",
    Object => "object",
    Cursor => "cursor",
    Assertion => "assertion",
    Scan => "scan",
    Document => "document",
    Shard => "shard",
    Flush => "flush",
    Merge => "merge",
    Refresh => "refresh",
    Fetch => "fetch",
    Column => "column",
    Commit => "commit",
    Wait => "wait",
    Ticket => "ticket",
    Question => "question",

    Hit => "hit",
    Miss => "miss",
    Eviction => "eviction",
    Get => "get",
    Set => "set",

    Dollar => "dollar",
    Cent => "cent",
    Microdollar => "microdollar",
    Euro => "euro",

    Page => "page",
    Split => "split",

    Hertz => "hertz",
    Kilohertz => "kilohertz",
    Megahertz => "megahertz",
    Gigahertz => "gigahertz",

    Entry => "entry",

    DecidegreeCelsius => "decidegree celsius",
    DegreeCelsius => "degree celsius",
    DegreeFahrenheit => "degree fahrenheit",

    Nanocore => "nanocore",
    Microcore => "microcore",
    Millicore => "millicore",
    Core => "core",
    Kilocore => "kilocore",
    Megacore => "megacore",
    Gigacore => "gigacore",
    Teracore => "teracore",
    Petacore => "petacore",
    Exacore => "exacore",

    Nanowatt => "nanowatt",
    Microwatt => "microwatt",
    Milliwatt => "milliwatt",
    Deciwatt => "deciwatt",
    Watt => "watt",
    Kilowatt => "kilowatt",
    Megawatt => "megawatt",
    Gigawatt => "gigawatt",
    Terrawatt => "terrawatt",

    Milliampere => "milliampere",
    Ampere => "ampere",

    Millivolt => "millivolt",
    Volt => "volt",

    Span => "span",

    Run => "run",
}

impl Unit {
    /// Converts a duration into this unit.
    ///
    /// Returns `None` for units that are not a fixed-length time unit. Days and weeks are excluded
    /// since their length is not fixed in wall-clock time.
    pub fn convert_duration(&self, duration: Duration) -> Option<f64> {
        let secs = duration.as_secs_f64();
        Some(match self {
            Self::Nanosecond => duration.as_nanos() as f64,
            Self::Microsecond => duration.as_nanos() as f64 / 1e3,
            Self::Millisecond => duration.as_nanos() as f64 / 1e6,
            Self::Second => secs,
            Self::Minute => secs / 60.0,
            Self::Hour => secs / 3600.0,
            _ => return None,
        })
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl_str_serde!(Unit, "a metric unit");

/// An error returned when parsing an unknown [`Unit`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[error("unknown metric unit")]
pub struct ParseUnitError(());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roundtrip() {
        for unit in [Unit::Byte, Unit::GarbageCollection, Unit::DegreeFahrenheit, Unit::Run] {
            assert_eq!(unit.as_str().parse::<Unit>(), Ok(unit));
        }
        assert_eq!("parsec".parse::<Unit>(), Err(ParseUnitError(())));
    }

    #[test]
    fn test_serde() {
        let json = serde_json::to_string(&Unit::PercentNano).unwrap();
        assert_eq!(json, r#""percent_nano""#);

        let unit: Unit = serde_json::from_str(r#""garbage collection""#).unwrap();
        assert_eq!(unit, Unit::GarbageCollection);

        assert!(serde_json::from_str::<Unit>(r#""furlong""#).is_err());
    }

    #[test]
    fn test_convert_duration() {
        let duration = Duration::from_millis(1500);

        assert_eq!(Unit::Nanosecond.convert_duration(duration), Some(1.5e9));
        assert_eq!(Unit::Microsecond.convert_duration(duration), Some(1.5e6));
        assert_eq!(Unit::Millisecond.convert_duration(duration), Some(1500.0));
        assert_eq!(Unit::Second.convert_duration(duration), Some(1.5));
        assert_eq!(
            Unit::Minute.convert_duration(Duration::from_secs(90)),
            Some(1.5)
        );
        assert_eq!(
            Unit::Hour.convert_duration(Duration::from_secs(5400)),
            Some(1.5)
        );
        assert_eq!(Unit::Day.convert_duration(duration), None);
        assert_eq!(Unit::Byte.convert_duration(duration), None);
    }
}
