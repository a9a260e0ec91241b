//! Azure storage driver
//!
//! Azure adds a parent-resource step to the lifecycle machine: a storage
//! account must be discovered or created before any container operation
//! is possible. The account is adopted by tag match scoped to the
//! resource group; the container itself has a fixed conventional name.

pub mod account;
pub mod client;
pub mod container;

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

use account::{get_or_create_storage_account, reconcile_storage_account};
use client::{AzureApiRef, AzureMgmtClient};
use container::{get_or_create_container, reconcile_container};

/// Storage driver for Azure blob storage
pub struct AzureDriver {
    api: AzureApiRef,
    status: StatusWriterRef,
    config: Arc<OperatorConfig>,
    infra_name: String,
}

impl AzureDriver {
    /// Build a driver scoped to the cluster's resource group, reading the
    /// operator's service-principal credential secret.
    pub async fn new(
        client: Client,
        platform: &PlatformStatus,
        config: Arc<OperatorConfig>,
    ) -> Result<Self> {
        let azure = platform.azure()?;
        let api = AzureMgmtClient::new(
            client.clone(),
            &config.namespace,
            &config.credentials_secret_name(),
            &azure.resource_group_name,
            &azure.region,
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
        api: AzureApiRef,
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

    fn storage_account(instance: &BackupInstall) -> String {
        instance
            .status
            .as_ref()
            .and_then(|s| s.azure.as_ref())
            .map(|a| a.storage_account.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl StorageDriver for AzureDriver {
    fn platform_type(&self) -> PlatformType {
        PlatformType::Azure
    }

    async fn create_storage(&self, instance: &mut BackupInstall) -> Result<()> {
        instance.initialize_status(PlatformType::Azure);
        let account = Self::storage_account(instance);

        // Parent resource first: without a storage account there is
        // nothing to nest the container under
        if account.is_empty() {
            let account =
                get_or_create_storage_account(self.api.as_ref(), &self.config, &self.infra_name)
                    .await?;
            if let Some(azure) = instance
                .status
                .as_mut()
                .and_then(|status| status.azure.as_mut())
            {
                azure.storage_account = account;
            }
            return self.status.update_status(instance).await;
        }

        // Idempotent parent hardening
        reconcile_storage_account(self.api.as_ref(), &account)
            .await
            .map_err(|err| Self::step_error("reconciling storage account for", &account, err))?;

        let bucket = instance
            .storage_bucket(PlatformType::Azure)
            .cloned()
            .unwrap_or_default();

        let name = if bucket.name.is_empty() {
            let name =
                get_or_create_container(self.api.as_ref(), &account, &self.config.container_name)
                    .await
                    .map_err(|err| {
                        Self::step_error("creating", &self.config.container_name, err)
                    })?;
            instance.storage_bucket_mut(PlatformType::Azure).name = name.clone();
            name
        } else {
            bucket.name.clone()
        };

        // Verification: the account and the container must both be there
        info!(account = %account, container = %name, "Verifying blob container exists");
        let account_exists = self
            .api
            .storage_account_exists(&account)
            .await
            .map_err(|err| Self::step_error("verifying", &name, err))?;
        let container_exists = if account_exists {
            self.api
                .container_exists(&account, &name)
                .await
                .map_err(|err| Self::step_error("verifying", &name, err))?
        } else {
            false
        };
        if !container_exists {
            error!(account = %account, container = %name, "Blob container doesn't appear to exist");
            instance.storage_bucket_mut(PlatformType::Azure).provisioned = false;
            return self.status.update_status(instance).await;
        }

        // Hardening, idempotent and repeated every pass
        reconcile_container(self.api.as_ref(), &account, &name)
            .await
            .map_err(|err| Self::step_error("reconciling access policy on", &name, err))?;

        let slot = instance.storage_bucket_mut(PlatformType::Azure);
        slot.provisioned = true;
        slot.last_sync_timestamp = Some(Utc::now());
        self.status.update_status(instance).await
    }

    async fn storage_exists(&self, bucket_name: &str) -> Result<bool> {
        if bucket_name.is_empty() {
            return Ok(false);
        }
        // The container nests under whichever account carries our tags
        let accounts = self.api.list_storage_accounts().await?;
        let Some(account) =
            account::find_matching_account(&accounts, &self.config, &self.infra_name)
        else {
            return Ok(false);
        };
        self.api.container_exists(account, bucket_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::client::{AzureAccount, AzureStorageApi};
    use super::*;
    use crate::crd::BackupInstallSpec;
    use crate::storage::StatusWriter;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Mutex;

    const INFRA: &str = "test-cluster-x7f2";

    #[derive(Default)]
    struct MockAzure {
        accounts: Mutex<Vec<AzureAccount>>,
        containers: Mutex<BTreeSet<(String, String)>>,
        calls: Mutex<Vec<String>>,
    }

    impl MockAzure {
        fn with_account(self, name: &str, tags: BTreeMap<String, String>) -> Self {
            self.accounts.lock().unwrap().push(AzureAccount {
                name: name.to_string(),
                tags,
            });
            self
        }

        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AzureStorageApi for MockAzure {
        async fn list_storage_accounts(&self) -> Result<Vec<AzureAccount>> {
            self.record("list_storage_accounts");
            Ok(self.accounts.lock().unwrap().clone())
        }

        async fn check_name_availability(&self, name: &str) -> Result<bool> {
            self.record("check_name_availability");
            Ok(!self.accounts.lock().unwrap().iter().any(|a| a.name == name))
        }

        async fn create_storage_account(
            &self,
            name: &str,
            tags: &BTreeMap<String, String>,
        ) -> Result<()> {
            self.record("create_storage_account");
            self.accounts.lock().unwrap().push(AzureAccount {
                name: name.to_string(),
                tags: tags.clone(),
            });
            Ok(())
        }

        async fn update_storage_account(&self, _name: &str) -> Result<()> {
            self.record("update_storage_account");
            Ok(())
        }

        async fn storage_account_exists(&self, name: &str) -> Result<bool> {
            self.record("storage_account_exists");
            Ok(self.accounts.lock().unwrap().iter().any(|a| a.name == name))
        }

        async fn create_container(&self, account: &str, name: &str) -> Result<()> {
            self.record("create_container");
            self.containers
                .lock()
                .unwrap()
                .insert((account.to_string(), name.to_string()));
            Ok(())
        }

        async fn container_exists(&self, account: &str, name: &str) -> Result<bool> {
            self.record("container_exists");
            Ok(self
                .containers
                .lock()
                .unwrap()
                .contains(&(account.to_string(), name.to_string())))
        }

        async fn set_container_access(&self, _account: &str, _name: &str) -> Result<()> {
            self.record("set_container_access");
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

    fn driver(api: Arc<MockAzure>) -> AzureDriver {
        AzureDriver::with_parts(
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
    async fn test_adopts_tagged_storage_account() {
        let api = Arc::new(MockAzure::default().with_account(
            "managedbackupsold1",
            account::build_account_tag_map(&OperatorConfig::default(), INFRA),
        ));
        let mut inst = instance();

        driver(api.clone()).create_storage(&mut inst).await.unwrap();

        let azure = inst.status.as_ref().unwrap().azure.as_ref().unwrap();
        assert_eq!(azure.storage_account, "managedbackupsold1");
        assert!(!api.calls().contains(&"create_storage_account".to_string()));
    }

    #[tokio::test]
    async fn test_account_creation_is_the_only_transition_in_first_pass() {
        let api = Arc::new(MockAzure::default());
        let mut inst = instance();

        driver(api.clone()).create_storage(&mut inst).await.unwrap();

        let azure = inst.status.as_ref().unwrap().azure.as_ref().unwrap();
        assert!(azure.storage_account.starts_with("managedbackups"));
        // The container step runs on the next pass
        assert!(!api.calls().contains(&"create_container".to_string()));
        assert!(azure.storage_bucket.name.is_empty());
    }

    #[tokio::test]
    async fn test_second_pass_creates_container_and_hardens() {
        let api = Arc::new(MockAzure::default());
        let drv = driver(api.clone());
        let mut inst = instance();

        drv.create_storage(&mut inst).await.unwrap();
        drv.create_storage(&mut inst).await.unwrap();

        let azure = inst.status.as_ref().unwrap().azure.as_ref().unwrap();
        assert_eq!(azure.storage_bucket.name, "managed-backup-container");
        assert!(azure.storage_bucket.provisioned);
        assert!(azure.storage_bucket.last_sync_timestamp.is_some());

        let calls = api.calls();
        assert!(calls.contains(&"update_storage_account".to_string()));
        assert!(calls.contains(&"create_container".to_string()));
        assert!(calls.contains(&"set_container_access".to_string()));
    }

    #[tokio::test]
    async fn test_storage_exists_requires_owned_account() {
        let api = Arc::new(MockAzure::default().with_account(
            "unrelated",
            BTreeMap::from([("env".to_string(), "prod".to_string())]),
        ));
        let exists = driver(api)
            .storage_exists("managed-backup-container")
            .await
            .unwrap();
        assert!(!exists);
    }
}
