//! Group-segment matching.
//!
//! Features and forces target contexts through *group segments*: references
//! to named segments, composable with `and`/`or`/`not`. The `"*"` wildcard
//! matches every context.

use serde::{Deserialize, Serialize};

use crate::datafile::DatafileContent;
use crate::Context;

/// The wildcard segment reference.
pub const ALL_SEGMENTS: &str = "*";

/// A reference to one or more named segments, optionally composed with
/// boolean combinators. A plain list is conjunctive.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum GroupSegment {
    Plain(String),
    And { and: Vec<GroupSegment> },
    Or { or: Vec<GroupSegment> },
    Not { not: Vec<GroupSegment> },
    Collection(Vec<GroupSegment>),
}

impl From<&str> for GroupSegment {
    fn from(value: &str) -> GroupSegment {
        GroupSegment::Plain(value.to_owned())
    }
}

impl GroupSegment {
    /// Return `true` if the context matches this segment reference under the
    /// given datafile.
    ///
    /// A reference to a segment key the datafile does not contain never
    /// matches.
    pub fn matches(&self, context: &Context, datafile: &DatafileContent) -> bool {
        match self {
            GroupSegment::Plain(key) => {
                if key == ALL_SEGMENTS {
                    return true;
                }
                match datafile.get_segment(key) {
                    Some(segment) => segment.conditions.matches(context),
                    None => {
                        log::warn!(target: "featurekit", segment_key = key.as_str(); "segment not found in datafile");
                        false
                    }
                }
            }
            GroupSegment::And { and } => and.iter().all(|g| g.matches(context, datafile)),
            GroupSegment::Or { or } => or.iter().any(|g| g.matches(context, datafile)),
            GroupSegment::Not { not } => !not.iter().all(|g| g.matches(context, datafile)),
            GroupSegment::Collection(group) => group.iter().all(|g| g.matches(context, datafile)),
        }
    }
}
