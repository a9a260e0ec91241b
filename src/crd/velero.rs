//! Velero location record types
//!
//! Foreign resource types owned by the Velero project: where backups are
//! written (BackupStorageLocation) and where volume snapshots are taken
//! (VolumeSnapshotLocation). The operator reconciles one of each, both
//! named "default".

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// BackupStorageLocation
// =============================================================================

/// Desired object-storage location for backups
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "velero.io",
    version = "v1",
    kind = "BackupStorageLocation",
    plural = "backupstoragelocations",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BackupStorageLocationSpec {
    /// Object-store provider plugin, e.g. "aws"
    pub provider: String,

    /// Bucket holding the backups
    pub object_storage: ObjectStorageLocation,

    /// Provider-specific settings, e.g. the region
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
}

/// Bucket coordinates within the object store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStorageLocation {
    pub bucket: String,

    /// Key prefix under which backup objects are written
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prefix: String,
}

// =============================================================================
// VolumeSnapshotLocation
// =============================================================================

/// Desired location for volume snapshots
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "velero.io",
    version = "v1",
    kind = "VolumeSnapshotLocation",
    plural = "volumesnapshotlocations",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotLocationSpec {
    /// Volume-snapshotter provider plugin, e.g. "aws"
    pub provider: String,

    /// Provider-specific settings, e.g. the region
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_spec_equality() {
        let a = BackupStorageLocationSpec {
            provider: "aws".into(),
            object_storage: ObjectStorageLocation {
                bucket: "managed-backups-1".into(),
                prefix: String::new(),
            },
            config: BTreeMap::from([("region".to_string(), "us-east-2".to_string())]),
        };
        let mut b = a.clone();
        assert_eq!(a, b);

        b.object_storage.bucket = "managed-backups-2".into();
        assert_ne!(a, b);
    }
}
