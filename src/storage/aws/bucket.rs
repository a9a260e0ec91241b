//! Bucket naming, tag matching, and S3 error-code classification

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::config::OperatorConfig;

/// S3 reports a missing bucket with either of these codes. HeadBucket is
/// documented to return "NoSuchBucket" but actually emits "NotFound".
pub fn is_not_found_code(code: &str) -> bool {
    matches!(code, "NoSuchBucket" | "NotFound")
}

/// The bucket name is taken by another account
pub fn is_conflict_not_owned(code: &str) -> bool {
    code == "BucketAlreadyExists"
}

/// The bucket already exists in this account; creation is a no-op
pub fn is_conflict_owned(code: &str) -> bool {
    code == "BucketAlreadyOwnedByYou"
}

/// Propose a bucket name: fixed prefix plus a random suffix
pub fn generate_bucket_name(prefix: &str) -> String {
    format!("{}{}", prefix, Uuid::new_v4())
}

/// The ownership tag set applied to every bucket we manage
pub fn build_tag_map(config: &OperatorConfig, infra_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            config.tag_backup_location.clone(),
            config.default_backup_location.clone(),
        ),
        (
            config.tag_infrastructure_name.clone(),
            infra_name.to_string(),
        ),
    ])
}

/// Look through the tag sets of all visible buckets and decide whether one
/// of them already belongs to this cluster. A bucket is ours iff it
/// carries both the backup-location tag and a matching
/// infrastructure-identity tag.
pub fn find_matching_bucket<'a>(
    tagged_buckets: &'a BTreeMap<String, BTreeMap<String, String>>,
    config: &OperatorConfig,
    infra_name: &str,
) -> Option<&'a str> {
    for (bucket, tags) in tagged_buckets {
        let matches_location = tags
            .get(&config.tag_backup_location)
            .is_some_and(|v| v == &config.default_backup_location);
        let matches_cluster = tags
            .get(&config.tag_infrastructure_name)
            .is_some_and(|v| v == infra_name);

        if matches_location && matches_cluster {
            return Some(bucket.as_str());
        }
    }
    None
}
