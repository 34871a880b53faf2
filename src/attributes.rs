use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use derive_more::From;
use serde::{Deserialize, Serialize};

/// Type alias for a map of attribute key to attribute value, describing the
/// subject a feature is evaluated for.
///
/// The context is caller-owned: the SDK reads it for the duration of a single
/// evaluation and never retains it.
///
/// # Examples
/// ```
/// # use featurekit::{Context, AttributeValue};
/// let context = [
///     ("userId".to_owned(), "user-123".into()),
///     ("age".to_owned(), 30.into()),
///     ("premium".to_owned(), true.into()),
/// ].into_iter().collect::<Context>();
/// ```
pub type Context = HashMap<String, AttributeValue>;

/// Enum representing possible values of a context attribute.
///
/// Conveniently implements `From` conversions for `String`, `&str`, `i64`,
/// `f64`, `bool`, and `DateTime<Utc>`.
#[derive(Debug, Serialize, Deserialize, PartialEq, PartialOrd, From, Clone)]
#[serde(untagged)]
pub enum AttributeValue {
    /// A boolean value.
    Boolean(bool),
    /// An integer value.
    Integer(i64),
    /// A double-precision floating point value.
    Double(f64),
    /// A string value.
    #[from(ignore)]
    String(String),
    /// A point in time.
    ///
    /// Note that in JSON-supplied contexts a date arrives as a string; the
    /// `Date` variant is only produced by callers constructing the context
    /// programmatically.
    Date(DateTime<Utc>),
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> AttributeValue {
        AttributeValue::String(value.to_owned())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> AttributeValue {
        AttributeValue::String(value)
    }
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view of the value. Integers widen to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Integer(i) => Some(*i as f64),
            AttributeValue::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Date view of the value. Strings are parsed as RFC 3339.
    pub fn as_date(&self) -> Option<DateTime<Utc>> {
        match self {
            AttributeValue::Date(d) => Some(*d),
            AttributeValue::String(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|d| d.with_timezone(&Utc)),
            _ => None,
        }
    }
}

/// Canonical string form used when assembling bucket keys: booleans render as
/// `true`/`false`, integers without a decimal point, doubles in shortest
/// round-trip decimal, dates as ISO-8601, strings as-is.
///
/// This rendering is part of the bucketing contract; changing it would
/// silently re-bucket users.
impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Boolean(b) => write!(f, "{}", b),
            AttributeValue::Integer(i) => write!(f, "{}", i),
            AttributeValue::Double(d) => write!(f, "{}", d),
            AttributeValue::String(s) => f.write_str(s),
            AttributeValue::Date(d) => {
                f.write_str(&d.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn canonical_strings() {
        assert_eq!(AttributeValue::from(true).to_string(), "true");
        assert_eq!(AttributeValue::from(false).to_string(), "false");
        assert_eq!(AttributeValue::from(42).to_string(), "42");
        assert_eq!(AttributeValue::from(1.25).to_string(), "1.25");
        assert_eq!(AttributeValue::from("nl").to_string(), "nl");

        let date = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(
            AttributeValue::Date(date).to_string(),
            "2024-01-02T03:04:05.000Z"
        );
    }

    #[test]
    fn numeric_view_widens_integers() {
        assert_eq!(AttributeValue::from(7).as_f64(), Some(7.0));
        assert_eq!(AttributeValue::from(7.5).as_f64(), Some(7.5));
        assert_eq!(AttributeValue::from("7").as_f64(), None);
    }

    #[test]
    fn date_view_parses_strings() {
        let value = AttributeValue::from("2024-05-01T00:00:00Z");
        assert!(value.as_date().is_some());
        assert_eq!(AttributeValue::from("not a date").as_date(), None);
    }
}
