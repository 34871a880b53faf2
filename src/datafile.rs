//! Wire model for the datafile.
//!
//! The datafile is the declarative description of features, segments,
//! targeting and traffic allocation that the SDK evaluates. It is produced by
//! a build pipeline and treated as immutable once installed: refreshes
//! install a whole new [`DatafileContent`] rather than mutating the current
//! one.

use std::collections::HashMap;

use derive_more::From;
use serde::{Deserialize, Serialize};

use crate::conditions::Condition;
use crate::segments::GroupSegment;
use crate::{Error, Result};

/// A parsed datafile.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DatafileContent {
    /// Version of the datafile schema.
    pub schema_version: String,
    /// Opaque revision string. Used to detect content change on refresh.
    pub revision: String,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
    #[serde(default)]
    pub segments: Vec<Segment>,
    #[serde(default)]
    pub features: Vec<Feature>,
}

impl DatafileContent {
    /// The placeholder datafile installed before the first fetch completes.
    pub fn empty() -> DatafileContent {
        DatafileContent {
            schema_version: "1".to_owned(),
            revision: "unknown".to_owned(),
            attributes: Vec::new(),
            segments: Vec::new(),
            features: Vec::new(),
        }
    }

    /// Parse a datafile from its JSON representation.
    pub fn from_json(json: &str) -> Result<DatafileContent> {
        let datafile = serde_json::from_str(json).map_err(Error::from)?;
        Ok(datafile)
    }

    pub fn get_feature(&self, feature_key: &str) -> Option<&Feature> {
        self.features.iter().find(|f| f.key == feature_key)
    }

    pub fn get_segment(&self, segment_key: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.key == segment_key)
    }

    pub fn get_attribute(&self, attribute_key: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.key == attribute_key)
    }
}

impl Default for DatafileContent {
    fn default() -> DatafileContent {
        DatafileContent::empty()
    }
}

/// Declaration of a context attribute.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Attribute {
    pub key: String,
    #[serde(rename = "type")]
    pub kind: AttributeKind,
    /// Whether the attribute's value is included in the captured context of
    /// activation events.
    #[serde(default)]
    pub capture: bool,
}

/// Declared type of a context attribute.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AttributeKind {
    Boolean,
    String,
    Integer,
    Double,
    Date,
}

/// A named, reusable condition tree.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub key: String,
    pub conditions: Condition,
}

/// Which context attribute(s) a feature buckets its traffic by.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum BucketBy {
    /// Bucket by a single attribute.
    Single(String),
    /// Bucket by every listed attribute that is present, in order.
    And(Vec<String>),
    /// Bucket by the first listed attribute that is present; later ones are
    /// ignored even when present.
    Or {
        or: Vec<String>,
    },
}

/// A dependency on another feature: the plain form requires the named feature
/// to be enabled, the variation form additionally requires it to resolve to
/// the given variation.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum Required {
    Key(String),
    WithVariation { key: String, variation: String },
}

impl Required {
    pub fn key(&self) -> &str {
        match self {
            Required::Key(key) => key,
            Required::WithVariation { key, .. } => key,
        }
    }

    pub fn variation(&self) -> Option<&str> {
        match self {
            Required::Key(_) => None,
            Required::WithVariation { variation, .. } => Some(variation),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    pub key: String,
    /// Deprecated features still evaluate; each evaluation logs a warning.
    #[serde(default)]
    pub deprecated: bool,
    pub bucket_by: BucketBy,
    /// When non-empty, the feature participates in a mutually exclusive
    /// group: it is enabled only while the bucket value falls inside one of
    /// these ranges.
    #[serde(default)]
    pub ranges: Vec<Range>,
    #[serde(default)]
    pub required: Vec<Required>,
    #[serde(default)]
    pub variations: Vec<Variation>,
    #[serde(default)]
    pub variables_schema: Vec<VariableSchema>,
    #[serde(default)]
    pub traffic: Vec<Traffic>,
    #[serde(default)]
    pub force: Vec<Force>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Variation {
    /// The variation value returned to callers.
    pub value: String,
    #[serde(default)]
    pub variables: Vec<Variable>,
}

/// A variable's value within one variation, with optional targeted overrides.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub key: String,
    pub value: VariableValue,
    #[serde(default)]
    pub overrides: Vec<VariableOverride>,
}

/// Replaces a variable's value when its predicate matches. The predicate is
/// either a condition tree or a group-segment reference; the first matching
/// override wins.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VariableOverride {
    pub value: VariableValue,
    #[serde(default)]
    pub conditions: Option<Condition>,
    #[serde(default)]
    pub segments: Option<GroupSegment>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VariableSchema {
    pub key: String,
    #[serde(rename = "type")]
    pub kind: VariableKind,
    /// Value served when no other source resolves the variable.
    pub default_value: VariableValue,
}

/// Declared type of a variable.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum VariableKind {
    Boolean,
    String,
    Integer,
    Double,
    Array,
    Object,
    /// JSON encoded as a string.
    Json,
}

/// A variable value as it appears in the datafile and in evaluation results.
///
/// The value is a tagged union in memory but untagged on the wire; the
/// declared [`VariableKind`] disambiguates `String` from `Json` payloads.
#[derive(Debug, Serialize, Deserialize, PartialEq, From, Clone)]
#[serde(untagged)]
pub enum VariableValue {
    Boolean(bool),
    Integer(i64),
    Double(f64),
    #[from(ignore)]
    String(String),
    Array(Vec<String>),
    Object(serde_json::Map<String, serde_json::Value>),
}

impl From<String> for VariableValue {
    fn from(value: String) -> VariableValue {
        VariableValue::String(value)
    }
}

impl From<&str> for VariableValue {
    fn from(value: &str) -> VariableValue {
        VariableValue::String(value.to_owned())
    }
}

/// A targeted cohort inside a feature's rollout.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Traffic {
    pub key: String,
    #[serde(default)]
    pub segments: Option<GroupSegment>,
    #[serde(default)]
    pub conditions: Option<Condition>,
    /// Rollout cap in `[0, 100000]`. The rule applies when the bucket value
    /// is strictly below this cap (exclusive upper bound, unlike the
    /// half-open allocation ranges).
    pub percentage: u32,
    /// Overrides the computed enabled state for contexts matching this rule.
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Overrides the allocated variation for contexts matching this rule.
    #[serde(default)]
    pub variation: Option<String>,
    /// Per-variable overrides for contexts matching this rule.
    #[serde(default)]
    pub variables: HashMap<String, VariableValue>,
    #[serde(default)]
    pub allocation: Vec<Allocation>,
}

/// Maps a bucket range to a variation.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    pub variation: String,
    pub range: Range,
}

/// A half-open `[start, end)` interval over the bucket space `[0, 100000)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Range {
    pub start: u32,
    pub end: u32,
}

impl Range {
    pub(crate) fn contains(&self, v: u32) -> bool {
        self.start <= v && v < self.end
    }
}

/// A per-feature override that beats traffic and allocation when its
/// predicate matches. Entries are scanned in order; the first match wins.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Force {
    #[serde(default)]
    pub conditions: Option<Condition>,
    #[serde(default)]
    pub segments: Option<GroupSegment>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub variation: Option<String>,
    #[serde(default)]
    pub variables: HashMap<String, VariableValue>,
}

/// Caller-supplied override record for one feature, used for both sticky and
/// initial features. Sticky overrides beat every other source; initial
/// overrides only apply around instance readiness.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct OverrideFeature {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub variation: Option<String>,
    #[serde(default)]
    pub variables: HashMap<String, VariableValue>,
}

/// Per-feature-key override table.
pub type StickyFeatures = HashMap<String, OverrideFeature>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_datafile() {
        let datafile = DatafileContent::from_json(
            r#"
            {
              "schemaVersion": "1",
              "revision": "r42",
              "attributes": [
                { "key": "userId", "type": "string", "capture": true },
                { "key": "country", "type": "string" }
              ],
              "segments": [
                {
                  "key": "netherlands",
                  "conditions": { "attribute": "country", "operator": "equals", "value": "nl" }
                }
              ],
              "features": [
                {
                  "key": "checkout",
                  "bucketBy": "userId",
                  "variations": [
                    { "value": "control" },
                    {
                      "value": "treatment",
                      "variables": [
                        {
                          "key": "color",
                          "value": "red",
                          "overrides": [
                            { "value": "orange", "segments": "netherlands" }
                          ]
                        }
                      ]
                    }
                  ],
                  "variablesSchema": [
                    { "key": "color", "type": "string", "defaultValue": "blue" }
                  ],
                  "traffic": [
                    {
                      "key": "everyone",
                      "segments": "*",
                      "percentage": 100000,
                      "allocation": [
                        { "variation": "control", "range": { "start": 0, "end": 50000 } },
                        { "variation": "treatment", "range": { "start": 50000, "end": 100000 } }
                      ]
                    }
                  ],
                  "force": [
                    {
                      "conditions": { "attribute": "userId", "operator": "equals", "value": "qa" },
                      "enabled": false
                    }
                  ]
                }
              ]
            }
            "#,
        )
        .unwrap();

        assert_eq!(datafile.revision, "r42");
        assert!(datafile.get_segment("netherlands").is_some());
        assert!(datafile.get_attribute("userId").unwrap().capture);

        let feature = datafile.get_feature("checkout").unwrap();
        assert_eq!(feature.bucket_by, BucketBy::Single("userId".to_owned()));
        assert_eq!(feature.traffic[0].allocation.len(), 2);
        assert_eq!(
            feature.variables_schema[0].default_value,
            VariableValue::from("blue")
        );
    }

    #[test]
    fn parses_bucket_by_forms() {
        let single: BucketBy = serde_json::from_str(r#""userId""#).unwrap();
        assert_eq!(single, BucketBy::Single("userId".to_owned()));

        let and: BucketBy = serde_json::from_str(r#"["organizationId", "userId"]"#).unwrap();
        assert_eq!(
            and,
            BucketBy::And(vec!["organizationId".to_owned(), "userId".to_owned()])
        );

        let or: BucketBy = serde_json::from_str(r#"{ "or": ["userId", "deviceId"] }"#).unwrap();
        assert_eq!(
            or,
            BucketBy::Or {
                or: vec!["userId".to_owned(), "deviceId".to_owned()]
            }
        );
    }

    #[test]
    fn parses_required_forms() {
        let plain: Required = serde_json::from_str(r#""billing""#).unwrap();
        assert_eq!(plain.key(), "billing");
        assert_eq!(plain.variation(), None);

        let with_variation: Required =
            serde_json::from_str(r#"{ "key": "billing", "variation": "v2" }"#).unwrap();
        assert_eq!(with_variation.key(), "billing");
        assert_eq!(with_variation.variation(), Some("v2"));
    }

    #[test]
    fn parses_variable_value_shapes() {
        let values: Vec<VariableValue> = serde_json::from_str(
            r#"[true, 3, 3.5, "text", ["a", "b"], {"nested": {"k": 1}}]"#,
        )
        .unwrap();
        assert_eq!(values[0], VariableValue::Boolean(true));
        assert_eq!(values[1], VariableValue::Integer(3));
        assert_eq!(values[2], VariableValue::Double(3.5));
        assert_eq!(values[3], VariableValue::from("text"));
        assert_eq!(
            values[4],
            VariableValue::Array(vec!["a".to_owned(), "b".to_owned()])
        );
        assert!(matches!(values[5], VariableValue::Object(_)));
    }

    #[test]
    fn range_is_half_open() {
        let range = Range {
            start: 0,
            end: 50000,
        };
        assert!(range.contains(0));
        assert!(range.contains(49999));
        assert!(!range.contains(50000));
    }

    #[test]
    fn empty_datafile_has_unknown_revision() {
        let datafile = DatafileContent::empty();
        assert_eq!(datafile.revision, "unknown");
        assert!(datafile.features.is_empty());
    }
}
