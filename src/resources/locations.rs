//! Desired backup and snapshot location records
//!
//! Both records carry the fixed name "default". Their provider string and
//! region config come from the resolved platform; the bucket comes from
//! the instance status written by the storage driver.

use std::collections::BTreeMap;

use crate::config::OperatorConfig;
use crate::crd::{
    BackupStorageLocation, BackupStorageLocationSpec, ObjectStorageLocation,
    VolumeSnapshotLocation, VolumeSnapshotLocationSpec,
};
use crate::platform::{PlatformStatus, PlatformType};

/// Provider-specific location settings. Only AWS needs an explicit
/// region; the other providers resolve it from their credential scope.
pub fn location_config(platform: &PlatformStatus) -> BTreeMap<String, String> {
    match platform.platform {
        PlatformType::Aws => platform
            .aws
            .as_ref()
            .map(|aws| BTreeMap::from([("region".to_string(), aws.region.clone())]))
            .unwrap_or_default(),
        PlatformType::Gcp | PlatformType::Azure => BTreeMap::new(),
    }
}

/// Desired BackupStorageLocation pointing at the provisioned bucket
pub fn backup_storage_location(
    namespace: &str,
    platform: &PlatformStatus,
    bucket: &str,
    config: &OperatorConfig,
) -> BackupStorageLocation {
    let mut location = BackupStorageLocation::new(
        &config.default_backup_location,
        BackupStorageLocationSpec {
            provider: platform.platform.provider().to_string(),
            object_storage: ObjectStorageLocation {
                bucket: bucket.to_string(),
                prefix: String::new(),
            },
            config: location_config(platform),
        },
    );
    location.metadata.namespace = Some(namespace.to_string());
    location
}

/// Desired VolumeSnapshotLocation for the platform
pub fn volume_snapshot_location(
    namespace: &str,
    platform: &PlatformStatus,
    config: &OperatorConfig,
) -> VolumeSnapshotLocation {
    let mut location = VolumeSnapshotLocation::new(
        &config.default_backup_location,
        VolumeSnapshotLocationSpec {
            provider: platform.platform.provider().to_string(),
            config: location_config(platform),
        },
    );
    location.metadata.namespace = Some(namespace.to_string());
    location
}

/// Location records compare by plain spec equality
pub fn bsl_specs_equal(observed: &BackupStorageLocation, desired: &BackupStorageLocation) -> bool {
    observed.spec == desired.spec
}

pub fn vsl_specs_equal(
    observed: &VolumeSnapshotLocation,
    desired: &VolumeSnapshotLocation,
) -> bool {
    observed.spec == desired.spec
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::AwsPlatformInfo;

    fn aws_platform() -> PlatformStatus {
        PlatformStatus {
            platform: PlatformType::Aws,
            infrastructure_name: "test-cluster-x7f2".into(),
            aws: Some(AwsPlatformInfo {
                region: "us-east-2".into(),
            }),
            gcp: None,
            azure: None,
        }
    }

    #[test]
    fn test_backup_storage_location_shape() {
        let cfg = OperatorConfig::default();
        let bsl = backup_storage_location("managed-backup", &aws_platform(), "managed-backups-1", &cfg);

        assert_eq!(bsl.metadata.name.as_deref(), Some("default"));
        assert_eq!(bsl.metadata.namespace.as_deref(), Some("managed-backup"));
        assert_eq!(bsl.spec.provider, "aws");
        assert_eq!(bsl.spec.object_storage.bucket, "managed-backups-1");
        assert_eq!(bsl.spec.config.get("region").map(String::as_str), Some("us-east-2"));
    }

    #[test]
    fn test_specs_equal_detects_bucket_drift() {
        let cfg = OperatorConfig::default();
        let a = backup_storage_location("managed-backup", &aws_platform(), "bucket-a", &cfg);
        let mut b = a.clone();
        assert!(bsl_specs_equal(&a, &b));

        b.spec.object_storage.bucket = "bucket-b".into();
        assert!(!bsl_specs_equal(&a, &b));
    }
}
