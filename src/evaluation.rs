//! The evaluation pipeline.
//!
//! Three entry points answer the three questions callers ask about a
//! feature: is it enabled ([`Evaluator::evaluate_flag`]), which variation
//! applies ([`Evaluator::evaluate_variation`]), and what a variable resolves
//! to ([`Evaluator::evaluate_variable`]). Each walks a fixed precedence
//! ladder (sticky, initial, forced, required, traffic, allocation, default)
//! and returns an [`Evaluation`] carrying a [`Reason`]; nothing in the
//! pipeline panics or performs I/O.

use std::borrow::Cow;

use serde::Serialize;

use crate::bucketing::{
    get_bucket_value, ConfigureBucketKey, ConfigureBucketValue, DEFAULT_BUCKET_KEY_SEPARATOR,
};
use crate::conditions::Condition;
use crate::datafile::{
    Allocation, DatafileContent, Feature, Force, StickyFeatures, Traffic, VariableValue,
};
use crate::segments::GroupSegment;
use crate::Context;

/// Hook applied to the caller's context once per evaluation, producing the
/// context used for bucketing and traffic matching. Must be pure.
pub type InterceptContext = dyn Fn(&Context) -> Context + Send + Sync;

/// Embedder-supplied hook functions.
#[derive(Default)]
pub struct Hooks {
    pub configure_bucket_key: Option<Box<ConfigureBucketKey>>,
    pub configure_bucket_value: Option<Box<ConfigureBucketValue>>,
    pub intercept_context: Option<Box<InterceptContext>>,
}

/// Why an evaluation came out the way it did, with the data specific to that
/// outcome. The serialized `reason` spellings are part of the wire contract.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Reason {
    /// The datafile does not contain the feature (or, for variables, the
    /// feature has no schema entry for the requested variable key).
    NotFound,
    /// The feature declares no variations.
    NoVariations,
    /// Variation/variable lookups short-circuit when the flag itself is off
    /// and no sticky, initial, or forced source answered first.
    Disabled,
    /// A required feature was not enabled, or resolved to the wrong
    /// variation.
    Required { required_key: String },
    /// The feature is part of a mutually exclusive group and the bucket
    /// value fell outside all of its ranges.
    OutOfRange { bucket_value: u32 },
    /// A force entry matched.
    Forced,
    /// Served from the caller-supplied initial override table.
    Initial,
    /// Served from the caller-supplied sticky override table.
    Sticky,
    /// A traffic rule decided directly (percentage pass, or an explicit
    /// rule-level variation/variable).
    Rule { bucket_value: u32, traffic_key: String },
    /// Decided by the bucket value landing in an allocation or feature
    /// range.
    Allocated { bucket_value: u32 },
    /// A rule-level or variation-level override replaced the computed value.
    Override { bucket_value: u32, traffic_key: String },
    /// Variable fell through to its schema default.
    Defaulted,
    /// Terminal no-match: the bucket value exceeded the matched rule's
    /// percentage, or nothing matched at all. Serialized as `error` for
    /// compatibility with the established reason vocabulary, even though no
    /// fault occurred.
    #[serde(rename = "error")]
    NoMatch { bucket_value: u32 },
}

/// The structured result of one decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation<T> {
    pub feature_key: String,
    pub value: T,
    #[serde(flatten)]
    pub reason: Reason,
}

/// Flag decision: `value` is the enabled state.
pub type FlagEvaluation = Evaluation<bool>;
/// Variation decision: `value` is the resolved variation value, if any.
pub type VariationEvaluation = Evaluation<Option<String>>;
/// Variable decision: `value` is the resolved variable value, if any.
pub type VariableEvaluation = Evaluation<Option<VariableValue>>;

/// Evaluates features against a single datafile snapshot.
///
/// The evaluator borrows everything it needs; construct one per evaluation
/// (or batch of evaluations) from the current datafile. The same (datafile
/// revision, feature, context) triple always yields the same decision.
pub struct Evaluator<'a> {
    datafile: &'a DatafileContent,
    sticky: Option<&'a StickyFeatures>,
    initial: Option<&'a StickyFeatures>,
    ready: bool,
    hooks: Option<&'a Hooks>,
    bucket_key_separator: &'a str,
}

impl<'a> Evaluator<'a> {
    pub fn new(datafile: &'a DatafileContent) -> Evaluator<'a> {
        Evaluator {
            datafile,
            sticky: None,
            initial: None,
            ready: true,
            hooks: None,
            bucket_key_separator: DEFAULT_BUCKET_KEY_SEPARATOR,
        }
    }

    pub fn with_sticky(mut self, sticky: Option<&'a StickyFeatures>) -> Evaluator<'a> {
        self.sticky = sticky;
        self
    }

    pub fn with_initial(mut self, initial: Option<&'a StickyFeatures>) -> Evaluator<'a> {
        self.initial = initial;
        self
    }

    pub fn with_ready(mut self, ready: bool) -> Evaluator<'a> {
        self.ready = ready;
        self
    }

    pub fn with_hooks(mut self, hooks: &'a Hooks) -> Evaluator<'a> {
        self.hooks = Some(hooks);
        self
    }

    pub fn with_bucket_key_separator(mut self, separator: &'a str) -> Evaluator<'a> {
        self.bucket_key_separator = separator;
        self
    }

    /// Decide whether a feature is enabled for the context.
    pub fn evaluate_flag(&self, feature_key: &str, context: &Context) -> FlagEvaluation {
        let evaluation = self.flag_evaluation(feature_key, context);
        log::debug!(target: "featurekit", feature_key, reason:? = evaluation.reason; "evaluated flag");
        evaluation
    }

    /// Decide which variation of a feature applies to the context.
    pub fn evaluate_variation(&self, feature_key: &str, context: &Context) -> VariationEvaluation {
        let evaluation = self.variation_evaluation(feature_key, context);
        log::debug!(target: "featurekit", feature_key, reason:? = evaluation.reason; "evaluated variation");
        evaluation
    }

    /// Resolve a feature's variable for the context.
    pub fn evaluate_variable(
        &self,
        feature_key: &str,
        variable_key: &str,
        context: &Context,
    ) -> VariableEvaluation {
        let evaluation = self.variable_evaluation(feature_key, variable_key, context);
        log::debug!(target: "featurekit", feature_key, variable_key, reason:? = evaluation.reason; "evaluated variable");
        evaluation
    }

    fn flag_evaluation(&self, feature_key: &str, context: &Context) -> FlagEvaluation {
        if let Some(enabled) = self.override_of(self.sticky, feature_key).and_then(|f| f.enabled) {
            return flag(feature_key, enabled, Reason::Sticky);
        }

        // Unlike variation and variable evaluation, the flag ladder consults
        // the initial table once the instance IS ready. Kept as-is for
        // parity with the sibling SDK implementations of the datafile
        // format; see DESIGN.md.
        if self.ready {
            if let Some(enabled) =
                self.override_of(self.initial, feature_key).and_then(|f| f.enabled)
            {
                return flag(feature_key, enabled, Reason::Initial);
            }
        }

        let Some(feature) = self.datafile.get_feature(feature_key) else {
            return flag(feature_key, false, Reason::NotFound);
        };

        if feature.deprecated {
            log::warn!(target: "featurekit", feature_key; "feature is deprecated");
        }

        let final_context = self.intercepted(context);

        // Forced lookups intentionally use the original context; only
        // bucketing and traffic matching see the intercepted one.
        if let Some(force) = get_matched_force(feature, context, self.datafile) {
            if let Some(enabled) = force.enabled {
                return flag(feature_key, enabled, Reason::Forced);
            }
        }

        for required in &feature.required {
            let required_key = required.key();

            let required_flag = self.flag_evaluation(required_key, context);
            if !required_flag.value {
                return flag(
                    feature_key,
                    false,
                    Reason::Required {
                        required_key: required_key.to_owned(),
                    },
                );
            }

            if let Some(expected_variation) = required.variation() {
                let resolved = self.variation_evaluation(required_key, context);
                if resolved.value.as_deref() != Some(expected_variation) {
                    return flag(
                        feature_key,
                        false,
                        Reason::Required {
                            required_key: required_key.to_owned(),
                        },
                    );
                }
            }
        }

        let bucket_value = self.bucket_value(feature, &final_context);
        let matched_traffic = get_matched_traffic(&feature.traffic, &final_context, self.datafile);

        if !feature.ranges.is_empty() {
            // Mutually exclusive group: the feature's own ranges decide.
            if feature.ranges.iter().any(|r| r.contains(bucket_value)) {
                let enabled = matched_traffic.and_then(|t| t.enabled).unwrap_or(true);
                return flag(feature_key, enabled, Reason::Allocated { bucket_value });
            }
            return flag(feature_key, false, Reason::OutOfRange { bucket_value });
        }

        if let Some(traffic) = matched_traffic {
            if let Some(enabled) = traffic.enabled {
                return flag(
                    feature_key,
                    enabled,
                    Reason::Override {
                        bucket_value,
                        traffic_key: traffic.key.clone(),
                    },
                );
            }

            // Exclusive upper bound, unlike the half-open allocation ranges.
            if bucket_value < traffic.percentage {
                return flag(
                    feature_key,
                    true,
                    Reason::Rule {
                        bucket_value,
                        traffic_key: traffic.key.clone(),
                    },
                );
            }
        }

        flag(feature_key, false, Reason::NoMatch { bucket_value })
    }

    fn variation_evaluation(&self, feature_key: &str, context: &Context) -> VariationEvaluation {
        // Sticky, initial, and forced sources answer the variation question
        // on their own, even when the flag side computes disabled; the
        // disabled gate applies only to the bucketing flow below.
        if let Some(sticky_variation) = self
            .override_of(self.sticky, feature_key)
            .and_then(|f| f.variation.clone())
        {
            return variation(feature_key, Some(sticky_variation), Reason::Sticky);
        }

        if !self.ready {
            if let Some(initial_variation) = self
                .override_of(self.initial, feature_key)
                .and_then(|f| f.variation.clone())
            {
                return variation(feature_key, Some(initial_variation), Reason::Initial);
            }
        }

        let Some(feature) = self.datafile.get_feature(feature_key) else {
            return variation(feature_key, None, Reason::NotFound);
        };

        if feature.variations.is_empty() {
            return variation(feature_key, None, Reason::NoVariations);
        }

        if let Some(force) = get_matched_force(feature, context, self.datafile) {
            if let Some(forced) = &force.variation {
                if let Some(found) = feature.variations.iter().find(|v| &v.value == forced) {
                    return variation(feature_key, Some(found.value.clone()), Reason::Forced);
                }
            }
        }

        let flag_evaluation = self.flag_evaluation(feature_key, context);
        if !flag_evaluation.value {
            return variation(feature_key, None, Reason::Disabled);
        }

        let final_context = self.intercepted(context);
        let bucket_value = self.bucket_value(feature, &final_context);

        if let Some(traffic) = get_matched_traffic(&feature.traffic, &final_context, self.datafile)
        {
            if let Some(rule_variation) = &traffic.variation {
                if let Some(found) = feature.variations.iter().find(|v| &v.value == rule_variation)
                {
                    return variation(
                        feature_key,
                        Some(found.value.clone()),
                        Reason::Rule {
                            bucket_value,
                            traffic_key: traffic.key.clone(),
                        },
                    );
                }
            }

            if let Some(allocation) = get_matched_allocation(traffic, bucket_value) {
                if let Some(found) = feature
                    .variations
                    .iter()
                    .find(|v| v.value == allocation.variation)
                {
                    return variation(
                        feature_key,
                        Some(found.value.clone()),
                        Reason::Allocated { bucket_value },
                    );
                }
            }
        }

        variation(feature_key, None, Reason::NoMatch { bucket_value })
    }

    fn variable_evaluation(
        &self,
        feature_key: &str,
        variable_key: &str,
        context: &Context,
    ) -> VariableEvaluation {
        // As with variations, the override sources are consulted before the
        // disabled gate so they stay reachable when the flag side is off.
        if let Some(sticky_value) = self
            .override_of(self.sticky, feature_key)
            .and_then(|f| f.variables.get(variable_key))
        {
            return variable(feature_key, Some(sticky_value.clone()), Reason::Sticky);
        }

        if !self.ready {
            if let Some(initial_value) = self
                .override_of(self.initial, feature_key)
                .and_then(|f| f.variables.get(variable_key))
            {
                return variable(feature_key, Some(initial_value.clone()), Reason::Initial);
            }
        }

        let Some(feature) = self.datafile.get_feature(feature_key) else {
            return variable(feature_key, None, Reason::NotFound);
        };

        let Some(schema) = feature
            .variables_schema
            .iter()
            .find(|s| s.key == variable_key)
        else {
            log::warn!(target: "featurekit", feature_key, variable_key; "variable schema not found");
            return variable(feature_key, None, Reason::NotFound);
        };

        if let Some(force) = get_matched_force(feature, context, self.datafile) {
            if let Some(forced_value) = force.variables.get(variable_key) {
                return variable(feature_key, Some(forced_value.clone()), Reason::Forced);
            }
        }

        let flag_evaluation = self.flag_evaluation(feature_key, context);
        if !flag_evaluation.value {
            return variable(feature_key, None, Reason::Disabled);
        }

        let final_context = self.intercepted(context);
        let bucket_value = self.bucket_value(feature, &final_context);

        if let Some(traffic) = get_matched_traffic(&feature.traffic, &final_context, self.datafile)
        {
            if let Some(rule_value) = traffic.variables.get(variable_key) {
                return variable(
                    feature_key,
                    Some(rule_value.clone()),
                    Reason::Rule {
                        bucket_value,
                        traffic_key: traffic.key.clone(),
                    },
                );
            }

            if let Some(allocation) = get_matched_allocation(traffic, bucket_value) {
                if let Some(matched_variation) = feature
                    .variations
                    .iter()
                    .find(|v| v.value == allocation.variation)
                {
                    if let Some(entry) = matched_variation
                        .variables
                        .iter()
                        .find(|v| v.key == variable_key)
                    {
                        for entry_override in &entry.overrides {
                            if predicate_matches(
                                entry_override.conditions.as_ref(),
                                entry_override.segments.as_ref(),
                                &final_context,
                                self.datafile,
                            ) {
                                return variable(
                                    feature_key,
                                    Some(entry_override.value.clone()),
                                    Reason::Override {
                                        bucket_value,
                                        traffic_key: traffic.key.clone(),
                                    },
                                );
                            }
                        }

                        return variable(
                            feature_key,
                            Some(entry.value.clone()),
                            Reason::Allocated { bucket_value },
                        );
                    }
                }
            }
        }

        variable(
            feature_key,
            Some(schema.default_value.clone()),
            Reason::Defaulted,
        )
    }

    fn override_of(
        &self,
        table: Option<&'a StickyFeatures>,
        feature_key: &str,
    ) -> Option<&'a crate::datafile::OverrideFeature> {
        table.and_then(|t| t.get(feature_key))
    }

    fn intercepted<'c>(&self, context: &'c Context) -> Cow<'c, Context> {
        match self.hooks.and_then(|h| h.intercept_context.as_deref()) {
            Some(intercept) => Cow::Owned(intercept(context)),
            None => Cow::Borrowed(context),
        }
    }

    fn bucket_value(&self, feature: &Feature, context: &Context) -> u32 {
        get_bucket_value(
            feature,
            context,
            self.bucket_key_separator,
            self.hooks.and_then(|h| h.configure_bucket_key.as_deref()),
            self.hooks.and_then(|h| h.configure_bucket_value.as_deref()),
        )
    }
}

fn flag(feature_key: &str, value: bool, reason: Reason) -> FlagEvaluation {
    Evaluation {
        feature_key: feature_key.to_owned(),
        value,
        reason,
    }
}

fn variation(feature_key: &str, value: Option<String>, reason: Reason) -> VariationEvaluation {
    Evaluation {
        feature_key: feature_key.to_owned(),
        value,
        reason,
    }
}

fn variable(feature_key: &str, value: Option<VariableValue>, reason: Reason) -> VariableEvaluation {
    Evaluation {
        feature_key: feature_key.to_owned(),
        value,
        reason,
    }
}

/// A rule or force predicate: conditions and group segments are tried in
/// that order, and either matching suffices.
fn predicate_matches(
    conditions: Option<&Condition>,
    segments: Option<&GroupSegment>,
    context: &Context,
    datafile: &DatafileContent,
) -> bool {
    if let Some(conditions) = conditions {
        if conditions.matches(context) {
            return true;
        }
    }
    if let Some(segments) = segments {
        if segments.matches(context, datafile) {
            return true;
        }
    }
    false
}

/// First traffic rule whose predicate matches, in declared order. A rule
/// with `percentage = 0` can still match; downstream logic interprets the
/// percentage.
pub(crate) fn get_matched_traffic<'d>(
    traffic: &'d [Traffic],
    context: &Context,
    datafile: &DatafileContent,
) -> Option<&'d Traffic> {
    traffic
        .iter()
        .find(|t| predicate_matches(t.conditions.as_ref(), t.segments.as_ref(), context, datafile))
}

/// First allocation whose range contains the bucket value, in declared
/// order.
pub(crate) fn get_matched_allocation(traffic: &Traffic, bucket_value: u32) -> Option<&Allocation> {
    traffic
        .allocation
        .iter()
        .find(|a| a.range.contains(bucket_value))
}

/// First force entry whose predicate matches, in declared order.
pub(crate) fn get_matched_force<'d>(
    feature: &'d Feature,
    context: &Context,
    datafile: &DatafileContent,
) -> Option<&'d Force> {
    feature
        .force
        .iter()
        .find(|f| predicate_matches(f.conditions.as_ref(), f.segments.as_ref(), context, datafile))
}
