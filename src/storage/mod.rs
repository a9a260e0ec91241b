//! Storage drivers
//!
//! One driver per cloud provider, each owning the bucket lifecycle state
//! machine for its object-storage family:
//! - [`aws`]: S3 buckets (tag sets, head-bucket probes)
//! - [`gcp`]: GCS buckets (label maps, uniform bucket-level access)
//! - [`azure`]: blob containers nested under a storage account
//!
//! Drivers are selected once per reconcile pass by a match on the resolved
//! platform and share the [`StorageDriver`] capability interface.

pub mod aws;
pub mod azure;
pub mod gcp;

use std::sync::Arc;

use async_trait::async_trait;
use kube::Client;

use crate::config::OperatorConfig;
use crate::crd::BackupInstall;
use crate::error::Result;
use crate::platform::{PlatformStatus, PlatformType};

// =============================================================================
// Driver Capability Interface
// =============================================================================

/// Capability interface satisfied by every storage driver
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// The platform this driver serves
    fn platform_type(&self) -> PlatformType;

    /// Run one pass of the bucket lifecycle state machine, persisting the
    /// instance status after each externally visible transition. At most
    /// one such transition happens per call.
    async fn create_storage(&self, instance: &mut BackupInstall) -> Result<()>;

    /// Probe whether the named bucket exists and is reachable
    async fn storage_exists(&self, bucket_name: &str) -> Result<bool>;
}

pub type StorageDriverRef = Arc<dyn StorageDriver>;

// =============================================================================
// Status Persistence Port
// =============================================================================

/// Persists instance status between state transitions. The drivers write
/// through this port so the state machine can be exercised without an
/// apiserver.
#[async_trait]
pub trait StatusWriter: Send + Sync {
    async fn update_status(&self, instance: &BackupInstall) -> Result<()>;
}

pub type StatusWriterRef = Arc<dyn StatusWriter>;

/// Status writer backed by the real apiserver
pub struct KubeStatusWriter {
    client: Client,
}

impl KubeStatusWriter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusWriter for KubeStatusWriter {
    async fn update_status(&self, instance: &BackupInstall) -> Result<()> {
        instance.update_status(self.client.clone()).await
    }
}

// =============================================================================
// Driver Factory
// =============================================================================

/// Build the storage driver for the resolved platform.
///
/// Validates that the platform carries the information the driver needs
/// (region, project, resource group) and constructs the provider client
/// from the operator's credential secret.
pub async fn new_driver(
    client: Client,
    platform: &PlatformStatus,
    config: Arc<OperatorConfig>,
) -> Result<StorageDriverRef> {
    platform.validate()?;

    let driver: StorageDriverRef = match platform.platform {
        PlatformType::Aws => Arc::new(aws::AwsDriver::new(client, platform, config).await?),
        PlatformType::Gcp => Arc::new(gcp::GcpDriver::new(client, platform, config).await?),
        PlatformType::Azure => Arc::new(azure::AzureDriver::new(client, platform, config).await?),
    };

    Ok(driver)
}
