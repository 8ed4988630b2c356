use std::borrow::Cow;
use std::fmt;

/// Returns `true` if the byte may appear in a tag key or value without rewriting.
///
/// See <https://docs.datadoghq.com/getting_started/tagging/#define-tags>. Uppercase letters are
/// considered invalid here since they have to be lowercased.
fn is_valid_tag_byte(byte: u8) -> bool {
    matches!(byte, b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-' | b':' | b'.' | b'/')
}

/// Lowercases ASCII letters and replaces every other character outside of `[a-z0-9_.:/-]` with an
/// underscore.
///
/// The agent performs the same conversion, but only after the line has been parsed. Since `,`,
/// `|`, `@` and newlines are delimiters in the wire format, unsanitized values would silently turn
/// into extra tags, sample rates or metrics, so the conversion has to happen before serialization.
///
/// Multi-byte characters are replaced by a single underscore each, so the result is never longer
/// than the input.
pub fn sanitize_tag(value: &str) -> Cow<'_, str> {
    if value.bytes().all(is_valid_tag_byte) {
        return Cow::Borrowed(value);
    }

    let sanitized = value
        .chars()
        .map(|c| match c {
            'A'..='Z' => c.to_ascii_lowercase(),
            c if c.is_ascii() && is_valid_tag_byte(c as u8) => c,
            _ => '_',
        })
        .collect();

    Cow::Owned(sanitized)
}

/// A value that can be bound to a tag key.
///
/// Values that produce the same string are considered the same tag value. String values are
/// sanitized, see [`sanitize_tag`].
pub trait TagValue {
    /// Returns the string representation of this value as it appears on the wire.
    fn tag_value(&self) -> Cow<'_, str>;
}

impl TagValue for str {
    fn tag_value(&self) -> Cow<'_, str> {
        sanitize_tag(self)
    }
}

impl TagValue for String {
    fn tag_value(&self) -> Cow<'_, str> {
        sanitize_tag(self)
    }
}

impl TagValue for Cow<'_, str> {
    fn tag_value(&self) -> Cow<'_, str> {
        sanitize_tag(self)
    }
}

impl TagValue for bool {
    fn tag_value(&self) -> Cow<'_, str> {
        Cow::Borrowed(if *self { "true" } else { "false" })
    }
}

impl<T: TagValue + ?Sized> TagValue for &T {
    fn tag_value(&self) -> Cow<'_, str> {
        (**self).tag_value()
    }
}

macro_rules! impl_integer_tag_value {
    ($($ty:ty),*) => {
        $(
            impl TagValue for $ty {
                fn tag_value(&self) -> Cow<'_, str> {
                    Cow::Owned(self.to_string())
                }
            }
        )*
    };
}

impl_integer_tag_value!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

/// A single `key:value` pair of a metric.
///
/// Tags with an empty key are rendered as the bare value.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Tag {
    key: String,
    value: String,
}

impl Tag {
    /// Creates a new tag, sanitizing both key and value.
    pub fn new(key: &str, value: &str) -> Self {
        Self {
            key: sanitize_tag(key).into_owned(),
            value: sanitize_tag(value).into_owned(),
        }
    }

    /// The tag key, possibly empty.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The tag value.
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.key.is_empty() {
            f.write_str(&self.value)
        } else {
            write!(f, "{}:{}", self.key, self.value)
        }
    }
}

/// The identity of a metric instance.
///
/// Two keys are equal if their names and their ordered tag sequences are equal. Keys are built once
/// when tag values are bound to a definition and never change afterwards.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct MetricKey {
    name: String,
    tags: Vec<Tag>,
}

impl MetricKey {
    /// Creates a key without tags.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: Vec::new(),
        }
    }

    /// Appends a tag.
    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.push(Tag::new(key, value));
        self
    }

    pub(crate) fn from_parts(name: String, tags: Vec<Tag>) -> Self {
        Self { name, tags }
    }

    /// The metric name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The ordered tags of this metric.
    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for (index, tag) in self.tags.iter().enumerate() {
            f.write_str(if index == 0 { "|#" } else { "," })?;
            tag.fmt(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_tag() {
        let check = |input: &str, expected: &str| {
            assert_eq!(sanitize_tag(input), expected, "sanitize_tag({input:?})");
        };

        check(
            "abcdefghijklmnopqrstuvwxyz0123456789-:./_",
            "abcdefghijklmnopqrstuvwxyz0123456789-:./_",
        );
        check(
            "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-:./",
            "abcdefghijklmnopqrstuvwxyz0123456789-:./",
        );
        check("abc?123", "abc_123");
        check(",", "_");
        check("|@", "__");
        // `ɱ̊` is two chars, each is replaced.
        check("2o4?uASfd$j⁛1℘aℵ]ɱ̊Mę14\nq", "2o4_uasfd_j_1_a____m_14_q");
    }

    #[test]
    fn test_sanitize_borrows_valid() {
        assert!(matches!(sanitize_tag("already_valid"), Cow::Borrowed(_)));
    }

    #[test]
    fn test_tag_values() {
        assert_eq!(true.tag_value(), "true");
        assert_eq!(404u16.tag_value(), "404");
        assert_eq!((-3i64).tag_value(), "-3");
        assert_eq!("GET /index".tag_value(), "get_/index");
        assert_eq!(String::from("Ok").tag_value(), "ok");
    }

    #[test]
    fn test_key_identity() {
        let a = MetricKey::new("rpc").with_tag("method", "get").with_tag("", "ok");
        let b = MetricKey::new("rpc").with_tag("method", "GET").with_tag("", "ok");
        let c = MetricKey::new("rpc").with_tag("", "ok").with_tag("method", "get");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string(), "rpc|#method:get,ok");
    }
}
