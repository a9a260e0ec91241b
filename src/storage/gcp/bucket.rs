//! GCS label handling and adoption matching
//!
//! GCS buckets carry label maps, not tag sets, and label keys/values are
//! restricted to lower-case `[a-z0-9-_]`. Every label is sanitized before
//! it is written or compared.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::config::OperatorConfig;
use crate::storage::gcp::client::GcsBucket;

/// Propose a bucket name: fixed prefix plus a random suffix
pub fn generate_bucket_name(prefix: &str) -> String {
    format!("{}{}", prefix, Uuid::new_v4())
}

/// Sanitize a value for use as a GCS bucket label key or value: lower-case
/// it and collapse every run of disallowed characters into a single `-`.
pub fn sanitize_bucket_label(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_disallowed_run = false;
    for c in input.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_' {
            out.push(c);
            in_disallowed_run = false;
        } else if !in_disallowed_run {
            out.push('-');
            in_disallowed_run = true;
        }
    }
    out
}

/// The ownership label map applied to every bucket we manage
pub fn build_label_map(config: &OperatorConfig, infra_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            sanitize_bucket_label(&config.tag_backup_location),
            sanitize_bucket_label(&config.default_backup_location),
        ),
        (
            sanitize_bucket_label(&config.tag_infrastructure_name),
            sanitize_bucket_label(infra_name),
        ),
    ])
}

/// Look through the labels of all project buckets and decide whether one
/// already belongs to this cluster. A bucket is ours iff it carries both
/// the backup-location label and a matching infrastructure-identity label.
pub fn find_backup_bucket<'a>(
    buckets: &'a [GcsBucket],
    config: &OperatorConfig,
    infra_name: &str,
) -> Option<&'a str> {
    let wanted = build_label_map(config, infra_name);
    buckets
        .iter()
        .find(|bucket| {
            wanted
                .iter()
                .all(|(key, value)| bucket.labels.get(key) == Some(value))
        })
        .map(|bucket| bucket.name.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    const INFRA: &str = "test-cluster-x7f2";

    #[test]
    fn test_sanitize_bucket_label() {
        assert_eq!(
            sanitize_bucket_label("velero.io/backup-location"),
            "velero-io-backup-location"
        );
        assert_eq!(
            sanitize_bucket_label("velero.io/infrastructureName"),
            "velero-io-infrastructurename"
        );
        assert_eq!(sanitize_bucket_label("Test_Cluster"), "test_cluster");
        // Runs of disallowed characters collapse into one dash
        assert_eq!(sanitize_bucket_label("a.//b"), "a-b");
    }

    #[test]
    fn test_build_label_map_is_sanitized() {
        let labels = build_label_map(&OperatorConfig::default(), INFRA);
        assert_eq!(
            labels.get("velero-io-backup-location").map(String::as_str),
            Some("default")
        );
        assert_eq!(
            labels
                .get("velero-io-infrastructurename")
                .map(String::as_str),
            Some(INFRA)
        );
    }

    #[test]
    fn test_find_backup_bucket() {
        let cfg = OperatorConfig::default();
        let buckets = vec![
            GcsBucket {
                name: "bucket1".into(),
                labels: BTreeMap::from([("random".to_string(), "label".to_string())]),
            },
            GcsBucket {
                name: "bucket2".into(),
                labels: build_label_map(&cfg, INFRA),
            },
        ];
        assert_eq!(find_backup_bucket(&buckets, &cfg, INFRA), Some("bucket2"));
    }

    #[test]
    fn test_find_backup_bucket_requires_both_labels() {
        let cfg = OperatorConfig::default();
        let buckets = vec![GcsBucket {
            name: "bucket1".into(),
            labels: BTreeMap::from([(
                "velero-io-infrastructurename".to_string(),
                INFRA.to_string(),
            )]),
        }];
        assert_eq!(find_backup_bucket(&buckets, &cfg, INFRA), None);
    }
}
