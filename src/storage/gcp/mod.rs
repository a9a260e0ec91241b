//! GCP storage driver
//!
//! Same lifecycle machine as the AWS driver, adjusted for GCS semantics:
//! ownership travels in sanitized label maps, uniform bucket-level access
//! is applied at creation time, and there is no separate public-access
//! block call. Hardening re-asserts labels and the expiry lifecycle rule.

pub mod bucket;
pub mod client;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use kube::Client;
use tracing::{error, info};

use crate::config::OperatorConfig;
use crate::crd::BackupInstall;
use crate::error::{Error, Result};
use crate::platform::{PlatformStatus, PlatformType};
use crate::storage::{KubeStatusWriter, StatusWriterRef, StorageDriver};

use bucket::{build_label_map, find_backup_bucket, generate_bucket_name};
use client::{GcsApiRef, GcsHttpClient};

/// Storage driver for GCS
pub struct GcpDriver {
    api: GcsApiRef,
    status: StatusWriterRef,
    config: Arc<OperatorConfig>,
    infra_name: String,
}

impl GcpDriver {
    /// Build a driver for the cluster's project and region, reading the
    /// operator's service-account credential secret.
    pub async fn new(
        client: Client,
        platform: &PlatformStatus,
        config: Arc<OperatorConfig>,
    ) -> Result<Self> {
        let gcp = platform.gcp()?;
        let api = GcsHttpClient::new(
            client.clone(),
            &config.namespace,
            &config.credentials_secret_name(),
            &gcp.region,
            &gcp.project_id,
        )
        .await?;

        Ok(Self {
            api: Arc::new(api),
            status: Arc::new(KubeStatusWriter::new(client)),
            config,
            infra_name: platform.infrastructure_name.clone(),
        })
    }

    #[cfg(test)]
    fn with_parts(
        api: GcsApiRef,
        status: StatusWriterRef,
        config: Arc<OperatorConfig>,
        infra_name: &str,
    ) -> Self {
        Self {
            api,
            status,
            config,
            infra_name: infra_name.to_string(),
        }
    }

    fn step_error(step: &'static str, bucket: &str, err: Error) -> Error {
        Error::BucketStep {
            step,
            bucket: bucket.to_string(),
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl StorageDriver for GcpDriver {
    fn platform_type(&self) -> PlatformType {
        PlatformType::Gcp
    }

    async fn create_storage(&self, instance: &mut BackupInstall) -> Result<()> {
        instance.initialize_status(PlatformType::Gcp);
        let bucket = instance
            .storage_bucket(PlatformType::Gcp)
            .cloned()
            .unwrap_or_default();

        // No bucket name selected yet
        if bucket.name.is_empty() {
            info!("No GCS bucket defined, searching for existing bucket to adopt");
            let buckets = self.api.list_buckets().await?;

            if let Some(existing) = find_backup_bucket(&buckets, &self.config, &self.infra_name) {
                info!(bucket = existing, "Recovered existing bucket");
                let existing = existing.to_string();
                let slot = instance.storage_bucket_mut(PlatformType::Gcp);
                slot.name = existing;
                slot.provisioned = true;
                return self.status.update_status(instance).await;
            }

            let proposed = generate_bucket_name(&self.config.bucket_prefix);
            if self.api.bucket_exists(&proposed).await? {
                return Err(Error::ProposedNameTaken(proposed));
            }

            info!(bucket = %proposed, "Setting proposed bucket name");
            let slot = instance.storage_bucket_mut(PlatformType::Gcp);
            slot.name = proposed;
            slot.provisioned = false;
            return self.status.update_status(instance).await;
        }

        let name = bucket.name.clone();
        let labels = build_label_map(&self.config, &self.infra_name);

        // Name committed but bucket not yet provisioned
        if !bucket.provisioned {
            info!(bucket = %name, "GCS bucket defined but not provisioned, creating");
            self.api
                .insert_bucket(&name, &labels)
                .await
                .map_err(|err| Self::step_error("creating", &name, err))?;
        }

        // Verification
        info!(bucket = %name, "Verifying GCS bucket exists");
        let exists = self
            .api
            .bucket_exists(&name)
            .await
            .map_err(|err| Self::step_error("verifying", &name, err))?;
        if !exists {
            error!(bucket = %name, "GCS bucket doesn't appear to exist");
            instance.storage_bucket_mut(PlatformType::Gcp).provisioned = false;
            return self.status.update_status(instance).await;
        }

        // Hardening, idempotent and repeated every pass
        info!(bucket = %name, "Enforcing GCS bucket labels");
        self.api
            .patch_labels(&name, &labels)
            .await
            .map_err(|err| Self::step_error("labeling", &name, err))?;

        info!(bucket = %name, "Enforcing GCS bucket lifecycle rules");
        self.api
            .patch_lifecycle(&name)
            .await
            .map_err(|err| Self::step_error("configuring lifecycle rules on", &name, err))?;

        let slot = instance.storage_bucket_mut(PlatformType::Gcp);
        slot.provisioned = true;
        slot.last_sync_timestamp = Some(Utc::now());
        self.status.update_status(instance).await
    }

    async fn storage_exists(&self, bucket_name: &str) -> Result<bool> {
        if bucket_name.is_empty() {
            return Ok(false);
        }
        self.api.bucket_exists(bucket_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::client::{GcsApi, GcsBucket};
    use super::*;
    use crate::crd::BackupInstallSpec;
    use crate::storage::StatusWriter;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    const INFRA: &str = "test-cluster-x7f2";

    #[derive(Default)]
    struct MockGcs {
        buckets: Mutex<Vec<GcsBucket>>,
        calls: Mutex<Vec<String>>,
    }

    impl MockGcs {
        fn with_bucket(self, name: &str, labels: BTreeMap<String, String>) -> Self {
            self.buckets.lock().unwrap().push(GcsBucket {
                name: name.to_string(),
                labels,
            });
            self
        }

        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }
    }

    #[async_trait]
    impl GcsApi for MockGcs {
        async fn insert_bucket(
            &self,
            name: &str,
            labels: &BTreeMap<String, String>,
        ) -> Result<()> {
            self.record("insert_bucket");
            self.buckets.lock().unwrap().push(GcsBucket {
                name: name.to_string(),
                labels: labels.clone(),
            });
            Ok(())
        }

        async fn bucket_exists(&self, name: &str) -> Result<bool> {
            self.record("bucket_exists");
            Ok(self.buckets.lock().unwrap().iter().any(|b| b.name == name))
        }

        async fn list_buckets(&self) -> Result<Vec<GcsBucket>> {
            self.record("list_buckets");
            Ok(self.buckets.lock().unwrap().clone())
        }

        async fn patch_labels(
            &self,
            name: &str,
            labels: &BTreeMap<String, String>,
        ) -> Result<()> {
            self.record("patch_labels");
            if let Some(bucket) = self
                .buckets
                .lock()
                .unwrap()
                .iter_mut()
                .find(|b| b.name == name)
            {
                bucket.labels = labels.clone();
            }
            Ok(())
        }

        async fn patch_lifecycle(&self, _name: &str) -> Result<()> {
            self.record("patch_lifecycle");
            Ok(())
        }
    }

    #[derive(Default)]
    struct NullStatusWriter;

    #[async_trait]
    impl StatusWriter for NullStatusWriter {
        async fn update_status(&self, _instance: &BackupInstall) -> Result<()> {
            Ok(())
        }
    }

    fn driver(api: Arc<MockGcs>) -> GcpDriver {
        GcpDriver::with_parts(
            api,
            Arc::new(NullStatusWriter),
            Arc::new(OperatorConfig::default()),
            INFRA,
        )
    }

    fn instance() -> BackupInstall {
        BackupInstall::new("cluster-backup", BackupInstallSpec::default())
    }

    #[tokio::test]
    async fn test_adopts_labeled_bucket() {
        let cfg = OperatorConfig::default();
        let api = Arc::new(
            MockGcs::default().with_bucket("existing", build_label_map(&cfg, INFRA)),
        );
        let mut inst = instance();

        driver(api.clone()).create_storage(&mut inst).await.unwrap();

        let bucket = inst.storage_bucket(PlatformType::Gcp).unwrap();
        assert_eq!(bucket.name, "existing");
        assert!(bucket.provisioned);
        assert!(!api
            .calls
            .lock()
            .unwrap()
            .contains(&"insert_bucket".to_string()));
    }

    #[tokio::test]
    async fn test_full_provisioning_applies_labels_and_lifecycle() {
        let api = Arc::new(MockGcs::default());
        let drv = driver(api.clone());
        let mut inst = instance();

        // Propose, then provision
        drv.create_storage(&mut inst).await.unwrap();
        drv.create_storage(&mut inst).await.unwrap();

        let bucket = inst.storage_bucket(PlatformType::Gcp).unwrap();
        assert!(bucket.provisioned);
        assert!(bucket.last_sync_timestamp.is_some());

        let calls = api.calls.lock().unwrap().clone();
        assert!(calls.contains(&"insert_bucket".to_string()));
        assert!(calls.contains(&"patch_labels".to_string()));
        assert!(calls.contains(&"patch_lifecycle".to_string()));
    }
}
