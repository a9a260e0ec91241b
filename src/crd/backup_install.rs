//! BackupInstall CRD
//!
//! The per-cluster instance describing desired and observed backup-storage
//! state. One BackupInstall exists per cluster; its storage status is
//! mutated exclusively by the storage drivers, and read by the dependent
//! resource reconciler.

use std::time::Duration;

use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::platform::PlatformType;

// =============================================================================
// BackupInstall CRD
// =============================================================================

/// BackupInstall requests a managed, hardened backup bucket for this
/// cluster and a Velero installation configured against it. The spec is
/// intentionally empty: everything is derived from the cluster platform.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "backups.managed.io",
    version = "v1alpha1",
    kind = "BackupInstall",
    plural = "backupinstalls",
    status = "BackupInstallStatus",
    printcolumn = r#"{"name": "Bucket", "type": "string", "jsonPath": ".status.aws.storageBucket.name"}"#,
    printcolumn = r#"{"name": "Provisioned", "type": "boolean", "jsonPath": ".status.aws.storageBucket.provisioned"}"#,
    printcolumn = r#"{"name": "Last Sync", "type": "date", "jsonPath": ".status.aws.storageBucket.lastSyncTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BackupInstallSpec {}

/// Observed state, exactly one per-provider block populated
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupInstallStatus {
    /// Status information specific to AWS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws: Option<AwsInstallStatus>,

    /// Status information specific to GCP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcp: Option<GcpInstallStatus>,

    /// Status information specific to Azure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzureInstallStatus>,
}

/// AWS bucket status
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AwsInstallStatus {
    #[serde(default)]
    pub storage_bucket: StorageBucket,
}

/// GCP bucket status
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GcpInstallStatus {
    #[serde(default)]
    pub storage_bucket: StorageBucket,
}

/// Azure status; the blob container lives under a storage account that
/// must exist first
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AzureInstallStatus {
    /// Name of the storage account holding the backup container
    #[serde(default)]
    pub storage_account: String,

    #[serde(default)]
    pub storage_bucket: StorageBucket,
}

/// Details of the storage bucket created to hold backups
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageBucket {
    /// Name of the bucket, empty until one is proposed or adopted
    #[serde(default)]
    pub name: String,

    /// True only once the bucket has passed full hardening
    #[serde(default)]
    pub provisioned: bool,

    /// Time of the last fully successful verification pass
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_sync_timestamp: Option<DateTime<Utc>>,
}

impl StorageBucket {
    /// The bucket-reconcile entry predicate. True when any of:
    /// - the name is empty
    /// - the bucket is not provisioned
    /// - the last sync timestamp is unset
    /// - the last sync is older than the reconcile period
    pub fn reconcile_required(&self, reconcile_period: Duration) -> bool {
        if self.name.is_empty() || !self.provisioned {
            return true;
        }
        match self.last_sync_timestamp {
            None => true,
            Some(ts) => {
                // A future timestamp (clock skew) reads as zero elapsed
                let elapsed = Utc::now().signed_duration_since(ts);
                elapsed
                    .to_std()
                    .map_or(false, |elapsed| elapsed > reconcile_period)
            }
        }
    }
}

// =============================================================================
// Implementations
// =============================================================================

impl BackupInstall {
    /// Populate the status block matching the resolved platform
    pub fn initialize_status(&mut self, platform: PlatformType) {
        let status = self.status.get_or_insert_with(Default::default);
        match platform {
            PlatformType::Aws => {
                status.aws.get_or_insert_with(Default::default);
            }
            PlatformType::Gcp => {
                status.gcp.get_or_insert_with(Default::default);
            }
            PlatformType::Azure => {
                status.azure.get_or_insert_with(Default::default);
            }
        }
    }

    /// The storage bucket block for the given platform, if initialized
    pub fn storage_bucket(&self, platform: PlatformType) -> Option<&StorageBucket> {
        let status = self.status.as_ref()?;
        match platform {
            PlatformType::Aws => status.aws.as_ref().map(|s| &s.storage_bucket),
            PlatformType::Gcp => status.gcp.as_ref().map(|s| &s.storage_bucket),
            PlatformType::Azure => status.azure.as_ref().map(|s| &s.storage_bucket),
        }
    }

    /// Mutable access to the bucket block, initializing it if needed
    pub fn storage_bucket_mut(&mut self, platform: PlatformType) -> &mut StorageBucket {
        let status = self.status.get_or_insert_with(Default::default);
        match platform {
            PlatformType::Aws => {
                &mut status.aws.get_or_insert_with(Default::default).storage_bucket
            }
            PlatformType::Gcp => {
                &mut status.gcp.get_or_insert_with(Default::default).storage_bucket
            }
            PlatformType::Azure => {
                &mut status
                    .azure
                    .get_or_insert_with(Default::default)
                    .storage_bucket
            }
        }
    }

    /// Whether the bucket machine must run this pass (see
    /// [`StorageBucket::reconcile_required`]). An uninitialized status
    /// block always requires reconciliation.
    pub fn bucket_reconcile_required(
        &self,
        platform: PlatformType,
        reconcile_period: Duration,
    ) -> bool {
        self.storage_bucket(platform)
            .map_or(true, |bucket| bucket.reconcile_required(reconcile_period))
    }

    /// Persist this instance's status through the status subresource.
    ///
    /// Stale-version conflicts are retried with exponential backoff; any
    /// other API failure is returned to the caller.
    pub async fn update_status(&self, client: Client) -> Result<()> {
        let namespace = self.namespace().ok_or_else(|| {
            Error::Internal(format!("instance {} has no namespace", self.name_any()))
        })?;
        let name = self.name_any();
        let api: Api<BackupInstall> = Api::namespaced(client, &namespace);
        let patch = json!({ "status": self.status });

        let policy = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(15)),
            ..Default::default()
        };

        backoff::future::retry(policy, || {
            let api = api.clone();
            let name = name.clone();
            let patch = patch.clone();
            async move {
                match api
                    .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                {
                    Ok(_) => Ok(()),
                    Err(kube::Error::Api(ae)) if ae.code == 409 => {
                        warn!(instance = %name, "Status update conflict, retrying");
                        Err(backoff::Error::transient(Error::Kube(kube::Error::Api(ae))))
                    }
                    Err(e) => Err(backoff::Error::permanent(Error::Kube(e))),
                }
            }
        })
        .await?;

        info!(instance = %name, "Status updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(60 * 60);

    fn bucket(name: &str, provisioned: bool, synced: Option<DateTime<Utc>>) -> StorageBucket {
        StorageBucket {
            name: name.to_string(),
            provisioned,
            last_sync_timestamp: synced,
        }
    }

    #[test]
    fn test_reconcile_required_when_name_empty() {
        assert!(bucket("", true, Some(Utc::now())).reconcile_required(HOUR));
    }

    #[test]
    fn test_reconcile_required_when_not_provisioned() {
        assert!(bucket("test-bucket", false, Some(Utc::now())).reconcile_required(HOUR));
    }

    #[test]
    fn test_reconcile_required_when_timestamp_is_epoch() {
        let epoch = DateTime::<Utc>::from_timestamp(0, 0).unwrap();
        assert!(bucket("test-bucket", true, Some(epoch)).reconcile_required(HOUR));
    }

    #[test]
    fn test_reconcile_required_when_timestamp_unset() {
        assert!(bucket("test-bucket", true, None).reconcile_required(HOUR));
    }

    #[test]
    fn test_reconcile_not_required_when_recently_synced() {
        let synced = Utc::now() - chrono::Duration::minutes(30);
        assert!(!bucket("test-bucket", true, Some(synced)).reconcile_required(HOUR));
    }

    #[test]
    fn test_initialize_status_populates_matching_block() {
        let mut instance = BackupInstall::new("cluster-backup", BackupInstallSpec::default());
        instance.initialize_status(PlatformType::Gcp);

        let status = instance.status.as_ref().unwrap();
        assert!(status.gcp.is_some());
        assert!(status.aws.is_none());
        assert!(status.azure.is_none());
    }

    #[test]
    fn test_storage_bucket_mut_initializes() {
        let mut instance = BackupInstall::new("cluster-backup", BackupInstallSpec::default());
        instance.storage_bucket_mut(PlatformType::Aws).name = "managed-backups-1".into();

        let bucket = instance.storage_bucket(PlatformType::Aws).unwrap();
        assert_eq!(bucket.name, "managed-backups-1");
        assert!(!bucket.provisioned);
    }

    #[test]
    fn test_uninitialized_status_requires_reconcile() {
        let instance = BackupInstall::new("cluster-backup", BackupInstallSpec::default());
        assert!(instance.bucket_reconcile_required(PlatformType::Aws, HOUR));
    }
}
