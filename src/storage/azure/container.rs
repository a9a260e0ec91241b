//! Blob container discovery and creation
//!
//! The container name is a fixed convention, so there is no proposal step;
//! the container is looked up under the storage account and created if
//! missing, always with public access off.

use tracing::info;

use crate::error::Result;
use crate::storage::azure::client::AzureStorageApi;

/// Return the existing backup container, creating it if missing
pub async fn get_or_create_container(
    api: &dyn AzureStorageApi,
    account: &str,
    container: &str,
) -> Result<String> {
    if api.container_exists(account, container).await? {
        return Ok(container.to_string());
    }

    info!(account, container, "Existing blob container cannot be found, creating new blob container");
    api.create_container(account, container).await?;
    Ok(container.to_string())
}

/// Re-assert that public access to the container is off
pub async fn reconcile_container(
    api: &dyn AzureStorageApi,
    account: &str,
    container: &str,
) -> Result<()> {
    info!(account, container, "Reconciling blob container");
    api.set_container_access(account, container).await
}
