//! AWS storage driver
//!
//! Owns the S3 bucket lifecycle state machine: adopt-or-propose a bucket
//! name, create it, then verify and harden it on every pass. Each pass
//! performs at most one network-visible state transition and persists the
//! instance status before returning, so the next trigger resumes from
//! persisted state.

pub mod bucket;
pub mod client;

use std::collections::BTreeMap;
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

use bucket::{
    build_tag_map, find_matching_bucket, generate_bucket_name, is_conflict_not_owned,
    is_conflict_owned,
};
use client::{tag_bucket, AwsS3Client, S3ApiRef};

/// Storage driver for S3
pub struct AwsDriver {
    api: S3ApiRef,
    status: StatusWriterRef,
    config: Arc<OperatorConfig>,
    infra_name: String,
}

impl AwsDriver {
    /// Build a driver for the cluster's region, reading the operator's
    /// IAM credential secret.
    pub async fn new(
        client: Client,
        platform: &PlatformStatus,
        config: Arc<OperatorConfig>,
    ) -> Result<Self> {
        let aws = platform.aws()?;
        let api = AwsS3Client::new(
            client.clone(),
            &config.namespace,
            &config.credentials_secret_name(),
            &aws.region,
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
        api: S3ApiRef,
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
impl StorageDriver for AwsDriver {
    fn platform_type(&self) -> PlatformType {
        PlatformType::Aws
    }

    async fn create_storage(&self, instance: &mut BackupInstall) -> Result<()> {
        instance.initialize_status(PlatformType::Aws);
        let bucket = instance
            .storage_bucket(PlatformType::Aws)
            .cloned()
            .unwrap_or_default();

        // No bucket name selected yet
        if bucket.name.is_empty() {
            info!("No S3 bucket defined, searching for existing bucket to adopt");
            let names = self.api.list_buckets().await?;
            let mut tagged = BTreeMap::new();
            for name in names {
                let tags = self.api.get_bucket_tags(&name).await?;
                if !tags.is_empty() {
                    tagged.insert(name, tags);
                }
            }

            if let Some(existing) = find_matching_bucket(&tagged, &self.config, &self.infra_name)
            {
                info!(bucket = existing, "Recovered existing bucket");
                let existing = existing.to_string();
                let slot = instance.storage_bucket_mut(PlatformType::Aws);
                slot.name = existing;
                slot.provisioned = true;
                return self.status.update_status(instance).await;
            }

            // None to adopt; propose a new name for the next pass
            let proposed = generate_bucket_name(&self.config.bucket_prefix);
            if self.api.head_bucket(&proposed).await? {
                return Err(Error::ProposedNameTaken(proposed));
            }

            info!(bucket = %proposed, "Setting proposed bucket name");
            let slot = instance.storage_bucket_mut(PlatformType::Aws);
            slot.name = proposed;
            slot.provisioned = false;
            return self.status.update_status(instance).await;
        }

        let name = bucket.name.clone();

        // Name committed but bucket not yet provisioned
        if !bucket.provisioned {
            info!(bucket = %name, "S3 bucket defined but not provisioned, creating");
            match self.api.create_bucket(&name).await {
                Ok(()) => {}
                Err(err) => match err.provider_code() {
                    Some(code) if is_conflict_not_owned(code) => {
                        info!(bucket = %name, "Bucket exists but is not owned by this account, retrying");
                        let slot = instance.storage_bucket_mut(PlatformType::Aws);
                        slot.name.clear();
                        slot.provisioned = false;
                        return self.status.update_status(instance).await;
                    }
                    Some(code) if is_conflict_owned(code) => {
                        info!(bucket = %name, "Bucket exists and is owned by this account, continuing");
                    }
                    _ => return Err(Self::step_error("creating", &name, err)),
                },
            }

            // Claim the bucket immediately so a concurrent adopter
            // elsewhere cannot also claim it
            tag_bucket(
                self.api.as_ref(),
                &name,
                &build_tag_map(&self.config, &self.infra_name),
            )
            .await
            .map_err(|err| Self::step_error("tagging", &name, err))?;
        }

        // Verification
        info!(bucket = %name, "Verifying S3 bucket exists");
        let exists = self
            .api
            .head_bucket(&name)
            .await
            .map_err(|err| Self::step_error("verifying", &name, err))?;
        if !exists {
            error!(bucket = %name, "S3 bucket doesn't appear to exist");
            instance.storage_bucket_mut(PlatformType::Aws).provisioned = false;
            return self.status.update_status(instance).await;
        }

        // Hardening, idempotent and repeated every pass
        info!(bucket = %name, "Enforcing S3 bucket encryption");
        self.api
            .put_bucket_encryption(&name)
            .await
            .map_err(|err| Self::step_error("encrypting", &name, err))?;

        info!(bucket = %name, "Enforcing S3 bucket public access policy");
        self.api
            .put_public_access_block(&name)
            .await
            .map_err(|err| Self::step_error("blocking public access to", &name, err))?;

        info!(bucket = %name, "Enforcing S3 bucket lifecycle rules");
        self.api
            .put_bucket_lifecycle(&name)
            .await
            .map_err(|err| Self::step_error("configuring lifecycle rules on", &name, err))?;

        info!(bucket = %name, "Enforcing S3 bucket tags");
        tag_bucket(
            self.api.as_ref(),
            &name,
            &build_tag_map(&self.config, &self.infra_name),
        )
        .await
        .map_err(|err| Self::step_error("tagging", &name, err))?;

        let slot = instance.storage_bucket_mut(PlatformType::Aws);
        slot.provisioned = true;
        slot.last_sync_timestamp = Some(Utc::now());
        self.status.update_status(instance).await
    }

    async fn storage_exists(&self, bucket_name: &str) -> Result<bool> {
        if bucket_name.is_empty() {
            return Ok(false);
        }
        self.api.head_bucket(bucket_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::client::S3Api;
    use super::*;
    use crate::crd::BackupInstallSpec;
    use crate::storage::StatusWriter;
    use std::sync::Mutex;

    const INFRA: &str = "test-cluster-x7f2";

    /// In-memory S3 with call recording
    #[derive(Default)]
    struct MockS3 {
        buckets: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
        calls: Mutex<Vec<String>>,
        create_error_code: Mutex<Option<String>>,
    }

    impl MockS3 {
        fn with_bucket(self, name: &str, tags: &[(&str, &str)]) -> Self {
            self.buckets.lock().unwrap().insert(
                name.to_string(),
                tags.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            );
            self
        }

        fn fail_create_with(self, code: &str) -> Self {
            *self.create_error_code.lock().unwrap() = Some(code.to_string());
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }
    }

    #[async_trait]
    impl client::S3Api for MockS3 {
        async fn create_bucket(&self, name: &str) -> Result<()> {
            self.record("create_bucket");
            if let Some(code) = self.create_error_code.lock().unwrap().clone() {
                return Err(Error::provider("aws", Some(code), "conflict"));
            }
            self.buckets
                .lock()
                .unwrap()
                .insert(name.to_string(), BTreeMap::new());
            Ok(())
        }

        async fn head_bucket(&self, name: &str) -> Result<bool> {
            self.record("head_bucket");
            Ok(self.buckets.lock().unwrap().contains_key(name))
        }

        async fn list_buckets(&self) -> Result<Vec<String>> {
            self.record("list_buckets");
            Ok(self.buckets.lock().unwrap().keys().cloned().collect())
        }

        async fn get_bucket_tags(&self, name: &str) -> Result<BTreeMap<String, String>> {
            self.record("get_bucket_tags");
            Ok(self
                .buckets
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .unwrap_or_default())
        }

        async fn delete_bucket_tags(&self, name: &str) -> Result<()> {
            self.record("delete_bucket_tags");
            if let Some(tags) = self.buckets.lock().unwrap().get_mut(name) {
                tags.clear();
            }
            Ok(())
        }

        async fn put_bucket_tags(
            &self,
            name: &str,
            tags: &BTreeMap<String, String>,
        ) -> Result<()> {
            self.record("put_bucket_tags");
            self.buckets
                .lock()
                .unwrap()
                .insert(name.to_string(), tags.clone());
            Ok(())
        }

        async fn put_bucket_encryption(&self, _name: &str) -> Result<()> {
            self.record("put_bucket_encryption");
            Ok(())
        }

        async fn put_public_access_block(&self, _name: &str) -> Result<()> {
            self.record("put_public_access_block");
            Ok(())
        }

        async fn put_bucket_lifecycle(&self, _name: &str) -> Result<()> {
            self.record("put_bucket_lifecycle");
            Ok(())
        }
    }

    /// Status writer that only counts persists
    #[derive(Default)]
    struct RecordingStatusWriter {
        updates: Mutex<usize>,
    }

    impl RecordingStatusWriter {
        fn count(&self) -> usize {
            *self.updates.lock().unwrap()
        }
    }

    #[async_trait]
    impl StatusWriter for RecordingStatusWriter {
        async fn update_status(&self, _instance: &BackupInstall) -> Result<()> {
            *self.updates.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn driver(api: Arc<MockS3>, status: Arc<RecordingStatusWriter>) -> AwsDriver {
        AwsDriver::with_parts(api, status, Arc::new(OperatorConfig::default()), INFRA)
    }

    fn instance() -> BackupInstall {
        BackupInstall::new("cluster-backup", BackupInstallSpec::default())
    }

    #[tokio::test]
    async fn test_adopts_existing_tagged_bucket() {
        let api = Arc::new(MockS3::default().with_bucket(
            "managed-backups-old",
            &[
                ("velero.io/backup-location", "default"),
                ("velero.io/infrastructureName", INFRA),
            ],
        ));
        let status = Arc::new(RecordingStatusWriter::default());
        let mut inst = instance();

        driver(api.clone(), status.clone())
            .create_storage(&mut inst)
            .await
            .unwrap();

        let bucket = inst.storage_bucket(PlatformType::Aws).unwrap();
        assert_eq!(bucket.name, "managed-backups-old");
        assert!(bucket.provisioned);
        assert_eq!(status.count(), 1);
        assert!(!api.calls().contains(&"create_bucket".to_string()));
    }

    #[tokio::test]
    async fn test_proposes_name_when_nothing_to_adopt() {
        let api = Arc::new(MockS3::default());
        let status = Arc::new(RecordingStatusWriter::default());
        let mut inst = instance();

        driver(api.clone(), status.clone())
            .create_storage(&mut inst)
            .await
            .unwrap();

        let bucket = inst.storage_bucket(PlatformType::Aws).unwrap();
        assert!(bucket.name.starts_with("managed-backups-"));
        assert!(!bucket.provisioned);
        assert_eq!(status.count(), 1);
    }

    #[tokio::test]
    async fn test_proposed_name_collision_fails_pass_and_keeps_name_unset() {
        // Mock where every proposed name already exists
        struct CollidingS3(MockS3);

        #[async_trait]
        impl client::S3Api for CollidingS3 {
            async fn create_bucket(&self, name: &str) -> Result<()> {
                self.0.create_bucket(name).await
            }
            async fn head_bucket(&self, _name: &str) -> Result<bool> {
                self.0.record("head_bucket");
                Ok(true)
            }
            async fn list_buckets(&self) -> Result<Vec<String>> {
                self.0.list_buckets().await
            }
            async fn get_bucket_tags(&self, name: &str) -> Result<BTreeMap<String, String>> {
                self.0.get_bucket_tags(name).await
            }
            async fn delete_bucket_tags(&self, name: &str) -> Result<()> {
                self.0.delete_bucket_tags(name).await
            }
            async fn put_bucket_tags(
                &self,
                name: &str,
                tags: &BTreeMap<String, String>,
            ) -> Result<()> {
                self.0.put_bucket_tags(name, tags).await
            }
            async fn put_bucket_encryption(&self, name: &str) -> Result<()> {
                self.0.put_bucket_encryption(name).await
            }
            async fn put_public_access_block(&self, name: &str) -> Result<()> {
                self.0.put_public_access_block(name).await
            }
            async fn put_bucket_lifecycle(&self, name: &str) -> Result<()> {
                self.0.put_bucket_lifecycle(name).await
            }
        }

        let status = Arc::new(RecordingStatusWriter::default());
        let drv = AwsDriver::with_parts(
            Arc::new(CollidingS3(MockS3::default())),
            status.clone(),
            Arc::new(OperatorConfig::default()),
            INFRA,
        );
        let mut inst = instance();

        let err = drv.create_storage(&mut inst).await.unwrap_err();
        assert!(matches!(err, Error::ProposedNameTaken(_)));

        // The stored name stays unset so the next pass proposes fresh
        let bucket = inst.storage_bucket(PlatformType::Aws).unwrap();
        assert!(bucket.name.is_empty());
        assert_eq!(status.count(), 0);
    }

    #[tokio::test]
    async fn test_create_conflict_not_owned_resets_name() {
        let api = Arc::new(MockS3::default().fail_create_with("BucketAlreadyExists"));
        let status = Arc::new(RecordingStatusWriter::default());
        let mut inst = instance();
        inst.storage_bucket_mut(PlatformType::Aws).name = "managed-backups-taken".into();

        driver(api, status.clone())
            .create_storage(&mut inst)
            .await
            .unwrap();

        let bucket = inst.storage_bucket(PlatformType::Aws).unwrap();
        assert!(bucket.name.is_empty());
        assert!(!bucket.provisioned);
        assert_eq!(status.count(), 1);
    }

    #[tokio::test]
    async fn test_create_conflict_owned_continues_to_hardening() {
        let api = Arc::new(
            MockS3::default()
                .with_bucket("managed-backups-mine", &[])
                .fail_create_with("BucketAlreadyOwnedByYou"),
        );
        let status = Arc::new(RecordingStatusWriter::default());
        let mut inst = instance();
        inst.storage_bucket_mut(PlatformType::Aws).name = "managed-backups-mine".into();

        driver(api.clone(), status.clone())
            .create_storage(&mut inst)
            .await
            .unwrap();

        let bucket = inst.storage_bucket(PlatformType::Aws).unwrap();
        assert!(bucket.provisioned);
        assert!(bucket.last_sync_timestamp.is_some());
        let calls = api.calls();
        assert!(calls.contains(&"put_bucket_encryption".to_string()));
        assert!(calls.contains(&"put_public_access_block".to_string()));
        assert!(calls.contains(&"put_bucket_lifecycle".to_string()));
    }

    #[tokio::test]
    async fn test_unknown_create_error_is_fatal_for_pass() {
        let api = Arc::new(MockS3::default().fail_create_with("AccessDenied"));
        let status = Arc::new(RecordingStatusWriter::default());
        let mut inst = instance();
        inst.storage_bucket_mut(PlatformType::Aws).name = "managed-backups-x".into();

        let err = driver(api, status.clone())
            .create_storage(&mut inst)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BucketStep { step: "creating", .. }));
        assert_eq!(status.count(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_bucket_resets_provisioned() {
        // Provisioned bucket that no longer exists
        let api = Arc::new(MockS3::default());
        let status = Arc::new(RecordingStatusWriter::default());
        let mut inst = instance();
        {
            let slot = inst.storage_bucket_mut(PlatformType::Aws);
            slot.name = "managed-backups-gone".into();
            slot.provisioned = true;
        }

        driver(api, status.clone())
            .create_storage(&mut inst)
            .await
            .unwrap();

        let bucket = inst.storage_bucket(PlatformType::Aws).unwrap();
        assert!(!bucket.provisioned);
        assert_eq!(bucket.name, "managed-backups-gone");
        assert_eq!(status.count(), 1);
    }

    #[tokio::test]
    async fn test_second_pass_is_idempotent() {
        let api = Arc::new(MockS3::default());
        let status = Arc::new(RecordingStatusWriter::default());
        let drv = driver(api.clone(), status.clone());
        let mut inst = instance();

        // Pass 1: propose; pass 2: create + harden
        drv.create_storage(&mut inst).await.unwrap();
        drv.create_storage(&mut inst).await.unwrap();
        let after_provision = inst.storage_bucket(PlatformType::Aws).unwrap().clone();
        assert!(after_provision.provisioned);
        let creates_before = api
            .calls()
            .iter()
            .filter(|c| *c == "create_bucket")
            .count();

        // Pass 3: nothing external changed; no further creation, name and
        // provisioned unchanged
        drv.create_storage(&mut inst).await.unwrap();
        let after_repeat = inst.storage_bucket(PlatformType::Aws).unwrap();
        assert_eq!(after_repeat.name, after_provision.name);
        assert!(after_repeat.provisioned);
        let creates_after = api
            .calls()
            .iter()
            .filter(|c| *c == "create_bucket")
            .count();
        assert_eq!(creates_before, creates_after);
    }
}
