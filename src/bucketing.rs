//! Deterministic bucketing.
//!
//! Every feature maps a context to a stable *bucket value* in
//! `[0, 100000)`. The bucket key is assembled from the context attributes
//! named by the feature's `bucketBy` policy plus the feature key, and hashed
//! with MurmurHash3 (32-bit, seed 1). This function is shared by every SDK
//! implementation of the datafile format; changing any part of it silently
//! reassigns every user.

use std::io::Cursor;

use crate::datafile::{BucketBy, Feature};
use crate::Context;

/// Upper bound (exclusive) of the bucket space.
pub const MAX_BUCKETED_NUMBER: u32 = 100_000;

/// Separator placed between bucket key segments unless configured otherwise.
pub const DEFAULT_BUCKET_KEY_SEPARATOR: &str = ".";

const BUCKET_HASH_SEED: u32 = 1;

/// Hook that replaces the assembled bucket key. Receives the feature key,
/// the context, and the joined key.
pub type ConfigureBucketKey = dyn Fn(&str, &Context, String) -> String + Send + Sync;

/// Hook that post-adjusts the computed bucket value. Receives the feature
/// key, the context, and the value.
pub type ConfigureBucketValue = dyn Fn(&str, &Context, u32) -> u32 + Send + Sync;

/// Hash a bucket key into `[0, MAX_BUCKETED_NUMBER)`.
pub fn get_bucketed_number(bucket_key: &str) -> u32 {
    let hash = murmur3::murmur3_32(&mut Cursor::new(bucket_key.as_bytes()), BUCKET_HASH_SEED)
        .expect("reading from an in-memory cursor cannot fail");
    ((hash as u64 * MAX_BUCKETED_NUMBER as u64) >> 32) as u32
}

/// Assemble the bucket key for a feature and context.
///
/// Attribute values render in their canonical string form and missing
/// attributes are skipped; the feature key is always the final segment.
pub fn get_bucket_key(
    feature: &Feature,
    context: &Context,
    separator: &str,
    configure: Option<&ConfigureBucketKey>,
) -> String {
    let mut segments: Vec<String> = Vec::new();

    match &feature.bucket_by {
        BucketBy::Single(key) => {
            if let Some(value) = context.get(key) {
                segments.push(value.to_string());
            }
        }
        BucketBy::And(keys) => {
            for key in keys {
                if let Some(value) = context.get(key) {
                    segments.push(value.to_string());
                }
            }
        }
        BucketBy::Or { or } => {
            // Only the first present attribute participates; later ones are
            // ignored even when present.
            if let Some(value) = or.iter().find_map(|key| context.get(key)) {
                segments.push(value.to_string());
            }
        }
    }

    segments.push(feature.key.clone());
    let bucket_key = segments.join(separator);

    match configure {
        Some(configure) => configure(&feature.key, context, bucket_key),
        None => bucket_key,
    }
}

/// Compute the bucket value for a feature and context.
pub fn get_bucket_value(
    feature: &Feature,
    context: &Context,
    separator: &str,
    configure_key: Option<&ConfigureBucketKey>,
    configure_value: Option<&ConfigureBucketValue>,
) -> u32 {
    let bucket_key = get_bucket_key(feature, context, separator, configure_key);
    let bucket_value = get_bucketed_number(&bucket_key);

    match configure_value {
        Some(configure) => configure(&feature.key, context, bucket_value),
        None => bucket_value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature(key: &str, bucket_by: BucketBy) -> Feature {
        Feature {
            key: key.to_owned(),
            deprecated: false,
            bucket_by,
            ranges: vec![],
            required: vec![],
            variations: vec![],
            variables_schema: vec![],
            traffic: vec![],
            force: vec![],
        }
    }

    fn context(entries: &[(&str, &str)]) -> Context {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), (*v).into()))
            .collect()
    }

    #[test]
    fn bucketed_number_stays_in_range() {
        let keys = [
            "",
            "foo",
            "user-123.foo",
            "a-long-bucket-key.with.many.segments.and-a-feature",
            "Ünïcödé.feature",
        ];
        for key in keys {
            assert!(get_bucketed_number(key) < MAX_BUCKETED_NUMBER, "key {key:?}");
        }
    }

    #[test]
    fn bucketed_number_is_deterministic() {
        assert_eq!(
            get_bucketed_number("user-123.foo"),
            get_bucketed_number("user-123.foo")
        );
    }

    #[test]
    fn single_bucket_by() {
        let feature = feature("foo", BucketBy::Single("userId".to_owned()));
        let key = get_bucket_key(&feature, &context(&[("userId", "user-123")]), ".", None);
        assert_eq!(key, "user-123.foo");
    }

    #[test]
    fn single_bucket_by_missing_attribute_leaves_feature_key() {
        let feature = feature("foo", BucketBy::Single("userId".to_owned()));
        let key = get_bucket_key(&feature, &context(&[]), ".", None);
        assert_eq!(key, "foo");
    }

    #[test]
    fn and_bucket_by_keeps_declared_order_and_skips_missing() {
        let feature = feature(
            "foo",
            BucketBy::And(vec![
                "organizationId".to_owned(),
                "userId".to_owned(),
                "deviceId".to_owned(),
            ]),
        );
        let key = get_bucket_key(
            &feature,
            &context(&[("userId", "user-123"), ("organizationId", "org-1")]),
            ".",
            None,
        );
        assert_eq!(key, "org-1.user-123.foo");
    }

    #[test]
    fn or_bucket_by_takes_first_present() {
        let feature = feature(
            "foo",
            BucketBy::Or {
                or: vec!["userId".to_owned(), "deviceId".to_owned()],
            },
        );

        let key = get_bucket_key(
            &feature,
            &context(&[("userId", "user-123"), ("deviceId", "device-9")]),
            ".",
            None,
        );
        assert_eq!(key, "user-123.foo");

        let key = get_bucket_key(&feature, &context(&[("deviceId", "device-9")]), ".", None);
        assert_eq!(key, "device-9.foo");
    }

    #[test]
    fn custom_separator() {
        let feature = feature("foo", BucketBy::Single("userId".to_owned()));
        let key = get_bucket_key(&feature, &context(&[("userId", "user-123")]), "/", None);
        assert_eq!(key, "user-123/foo");
    }

    #[test]
    fn configure_bucket_key_replaces_joined_key() {
        let feature = feature("foo", BucketBy::Single("userId".to_owned()));
        let configure: Box<ConfigureBucketKey> =
            Box::new(|feature_key, _context, bucket_key| format!("{bucket_key}.{feature_key}.v2"));
        let key = get_bucket_key(
            &feature,
            &context(&[("userId", "user-123")]),
            ".",
            Some(&*configure),
        );
        assert_eq!(key, "user-123.foo.foo.v2");
    }

    #[test]
    fn configure_bucket_value_post_adjusts() {
        let feature = feature("foo", BucketBy::Single("userId".to_owned()));
        let configure: Box<ConfigureBucketValue> = Box::new(|_, _, _| 42);
        let value = get_bucket_value(
            &feature,
            &context(&[("userId", "user-123")]),
            ".",
            None,
            Some(&*configure),
        );
        assert_eq!(value, 42);
    }

    #[test]
    fn bucket_value_matches_hash_of_assembled_key() {
        let feature = feature("foo", BucketBy::Single("userId".to_owned()));
        let ctx = context(&[("userId", "user-123")]);
        let value = get_bucket_value(&feature, &ctx, ".", None, None);
        assert_eq!(value, get_bucketed_number("user-123.foo"));
        // Second call yields the same value.
        assert_eq!(value, get_bucket_value(&feature, &ctx, ".", None, None));
    }

    #[test]
    fn canonical_rendering_of_non_string_attributes() {
        let feature = feature("foo", BucketBy::Single("tenantId".to_owned()));
        let ctx = [("tenantId".to_owned(), 42.into())].into_iter().collect();
        assert_eq!(get_bucket_key(&feature, &ctx, ".", None), "42.foo");
    }
}
