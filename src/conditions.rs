//! Condition tree evaluation.
//!
//! Conditions target individual context attributes and compose through
//! `and`/`or`/`not`. Evaluation is pure: no mutation, no I/O.

use chrono::{DateTime, Utc};
use derive_more::From;
use regex::Regex;
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::{AttributeValue, Context};

/// A recursive condition tree: a leaf comparison, a boolean combinator over
/// child trees, or a plain list of trees (which is conjunctive).
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum Condition {
    And { and: Vec<Condition> },
    Or { or: Vec<Condition> },
    Not { not: Vec<Condition> },
    Plain(PlainCondition),
    Collection(Vec<Condition>),
}

/// Leaf condition: a check that the context `attribute` matches `value`
/// under the given `operator`.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PlainCondition {
    pub attribute: String,
    pub operator: Operator,
    pub value: ConditionValue,
}

/// The fixed operator vocabulary of the datafile format. Identifier
/// spellings are part of the wire contract shared with the other SDK
/// implementations.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    Equals,
    NotEquals,
    /// Attribute value is one of the listed strings.
    In,
    /// Attribute value is none of the listed strings. Absent attributes fail
    /// this condition, like every other.
    NotIn,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    /// Numeric comparisons. Both sides must be numeric.
    GreaterThan,
    GreaterThanOrEquals,
    LessThan,
    LessThanOrEquals,
    /// Semantic version comparisons. Both sides are parsed as semver and the
    /// condition fails on parse errors.
    SemverEquals,
    SemverNotEquals,
    SemverGreaterThan,
    SemverGreaterThanOrEquals,
    SemverLessThan,
    SemverLessThanOrEquals,
    /// Date comparisons against an RFC 3339 condition value.
    Before,
    After,
    /// Regex match. The condition value must be a valid regex string.
    Matches,
    NotMatches,
}

/// The right-hand side of a leaf condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, From)]
#[serde(untagged)]
pub enum ConditionValue {
    Boolean(bool),
    Integer(i64),
    Double(f64),
    #[from(ignore)]
    String(String),
    /// Only string arrays are supported, for the membership operators.
    Multiple(Vec<String>),
}

impl From<&str> for ConditionValue {
    fn from(value: &str) -> ConditionValue {
        ConditionValue::String(value.to_owned())
    }
}

impl From<String> for ConditionValue {
    fn from(value: String) -> ConditionValue {
        ConditionValue::String(value)
    }
}

impl ConditionValue {
    fn as_str(&self) -> Option<&str> {
        match self {
            ConditionValue::String(s) => Some(s),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            ConditionValue::Integer(i) => Some(*i as f64),
            ConditionValue::Double(d) => Some(*d),
            _ => None,
        }
    }

    fn as_date(&self) -> Option<DateTime<Utc>> {
        let s = self.as_str()?;
        DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|d| d.with_timezone(&Utc))
    }
}

impl Condition {
    /// Evaluate the tree against a context.
    ///
    /// An empty `and` is true, an empty `or` is false, and `not` negates the
    /// conjunction of its children.
    pub fn matches(&self, context: &Context) -> bool {
        match self {
            Condition::And { and } => and.iter().all(|c| c.matches(context)),
            Condition::Or { or } => or.iter().any(|c| c.matches(context)),
            Condition::Not { not } => !not.iter().all(|c| c.matches(context)),
            Condition::Collection(conditions) => conditions.iter().all(|c| c.matches(context)),
            Condition::Plain(condition) => condition.matches(context),
        }
    }
}

impl PlainCondition {
    fn matches(&self, context: &Context) -> bool {
        // A missing attribute fails the leaf regardless of operator.
        let Some(attribute) = context.get(&self.attribute) else {
            return false;
        };
        self.operator.eval(attribute, &self.value)
    }
}

impl Operator {
    /// Applying the operator to the values. Returns `false` if the operator
    /// cannot be applied or there's a misconfiguration.
    fn eval(&self, attribute: &AttributeValue, condition_value: &ConditionValue) -> bool {
        self.try_eval(attribute, condition_value).unwrap_or(false)
    }

    /// Try applying the operator, returning `None` when the value types
    /// don't fit it.
    fn try_eval(&self, attribute: &AttributeValue, condition_value: &ConditionValue) -> Option<bool> {
        match self {
            Self::Equals | Self::NotEquals => {
                let equals = values_are_equal(attribute, condition_value)?;
                Some(if *self == Self::Equals { equals } else { !equals })
            }

            Self::In | Self::NotIn => {
                let s = match attribute {
                    AttributeValue::String(s) => s.clone(),
                    AttributeValue::Integer(i) => i.to_string(),
                    AttributeValue::Double(d) => d.to_string(),
                    AttributeValue::Boolean(b) => b.to_string(),
                    AttributeValue::Date(_) => return None,
                };
                let values = match condition_value {
                    ConditionValue::Multiple(v) => v,
                    _ => return None,
                };
                let is_member = values.iter().any(|v| v == &s);
                Some(if *self == Self::In { is_member } else { !is_member })
            }

            Self::Contains | Self::NotContains => {
                let s = attribute.as_str()?;
                let needle = condition_value.as_str()?;
                let contains = s.contains(needle);
                Some(if *self == Self::Contains { contains } else { !contains })
            }

            Self::StartsWith => Some(attribute.as_str()?.starts_with(condition_value.as_str()?)),
            Self::EndsWith => Some(attribute.as_str()?.ends_with(condition_value.as_str()?)),

            Self::GreaterThan | Self::GreaterThanOrEquals | Self::LessThan
            | Self::LessThanOrEquals => {
                let attribute_value = attribute.as_f64()?;
                let condition_value = condition_value.as_f64()?;
                Some(match self {
                    Self::GreaterThan => attribute_value > condition_value,
                    Self::GreaterThanOrEquals => attribute_value >= condition_value,
                    Self::LessThan => attribute_value < condition_value,
                    Self::LessThanOrEquals => attribute_value <= condition_value,
                    _ => unreachable!(),
                })
            }

            Self::SemverEquals
            | Self::SemverNotEquals
            | Self::SemverGreaterThan
            | Self::SemverGreaterThanOrEquals
            | Self::SemverLessThan
            | Self::SemverLessThanOrEquals => {
                let attribute_version = Version::parse(attribute.as_str()?).ok()?;
                let condition_version = Version::parse(condition_value.as_str()?).ok()?;
                Some(match self {
                    Self::SemverEquals => attribute_version == condition_version,
                    Self::SemverNotEquals => attribute_version != condition_version,
                    Self::SemverGreaterThan => attribute_version > condition_version,
                    Self::SemverGreaterThanOrEquals => attribute_version >= condition_version,
                    Self::SemverLessThan => attribute_version < condition_version,
                    Self::SemverLessThanOrEquals => attribute_version <= condition_version,
                    _ => unreachable!(),
                })
            }

            Self::Before | Self::After => {
                let attribute_date = attribute.as_date()?;
                let condition_date = condition_value.as_date()?;
                Some(match self {
                    Self::Before => attribute_date < condition_date,
                    Self::After => attribute_date > condition_date,
                    _ => unreachable!(),
                })
            }

            Self::Matches | Self::NotMatches => {
                let s = attribute.as_str()?;
                let regex = Regex::new(condition_value.as_str()?).ok()?;
                let matches = regex.is_match(s);
                Some(if *self == Self::Matches { matches } else { !matches })
            }
        }
    }
}

/// Equality across the tagged families: strings, booleans, numbers (integers
/// widen to doubles), and dates (string side parsed as RFC 3339). Returns
/// `None` for incomparable pairs.
fn values_are_equal(attribute: &AttributeValue, condition_value: &ConditionValue) -> Option<bool> {
    match (attribute, condition_value) {
        (AttributeValue::String(a), ConditionValue::String(c)) => Some(a == c),
        (AttributeValue::Boolean(a), ConditionValue::Boolean(c)) => Some(a == c),
        (AttributeValue::Date(a), ConditionValue::String(_)) => {
            Some(Some(*a) == condition_value.as_date())
        }
        _ => {
            let a = attribute.as_f64()?;
            let c = condition_value.as_f64()?;
            Some(a == c)
        }
    }
}
