//! Storage-account discovery and creation
//!
//! The storage account is the parent resource every container operation
//! nests under. Accounts are adopted by the same tag-matching strategy the
//! bucket drivers use, scoped to the cluster's resource group.

use std::collections::BTreeMap;

use tracing::info;
use uuid::Uuid;

use crate::config::OperatorConfig;
use crate::error::{Error, Result};
use crate::storage::azure::client::{AzureAccount, AzureStorageApi};

/// Length of the random suffix on proposed account names
const ACCOUNT_SUFFIX_LEN: usize = 8;

/// Propose a storage-account name. Azure account names must be lower-case
/// alphanumeric, so the suffix is drawn from a hex-encoded uuid.
pub fn generate_account_name(prefix: &str) -> String {
    let suffix: String = Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(ACCOUNT_SUFFIX_LEN)
        .collect();
    format!("{prefix}{suffix}")
}

/// The ownership tag set applied to the storage account. Azure tag keys
/// cannot contain `/`, so the bucket tag keys are flattened.
pub fn build_account_tag_map(
    config: &OperatorConfig,
    infra_name: &str,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            OperatorConfig::azure_tag_key(&config.tag_backup_location),
            config.default_backup_location.clone(),
        ),
        (
            OperatorConfig::azure_tag_key(&config.tag_infrastructure_name),
            infra_name.to_string(),
        ),
    ])
}

/// Decide whether one of the resource group's accounts already belongs to
/// this cluster: it must carry both the backup-location tag and a matching
/// infrastructure-identity tag.
pub fn find_matching_account<'a>(
    accounts: &'a [AzureAccount],
    config: &OperatorConfig,
    infra_name: &str,
) -> Option<&'a str> {
    let wanted = build_account_tag_map(config, infra_name);
    accounts
        .iter()
        .find(|account| {
            wanted
                .iter()
                .all(|(key, value)| account.tags.get(key) == Some(value))
        })
        .map(|account| account.name.as_str())
}

/// Adopt an existing tagged storage account, or create a new one
pub async fn get_or_create_storage_account(
    api: &dyn AzureStorageApi,
    config: &OperatorConfig,
    infra_name: &str,
) -> Result<String> {
    let accounts = api.list_storage_accounts().await?;
    if let Some(existing) = find_matching_account(&accounts, config, infra_name) {
        info!(account = existing, "Found existing storage account");
        return Ok(existing.to_string());
    }

    let proposed = generate_account_name(&config.account_prefix);
    if !api.check_name_availability(&proposed).await? {
        return Err(Error::AccountNameTaken(proposed));
    }

    info!(account = %proposed, "No storage account found, creating new storage account");
    api.create_storage_account(&proposed, &build_account_tag_map(config, infra_name))
        .await?;
    Ok(proposed)
}

/// Re-assert the account's sku, transport, and tier settings
pub async fn reconcile_storage_account(api: &dyn AzureStorageApi, name: &str) -> Result<()> {
    info!(account = name, "Reconciling storage account");
    api.update_storage_account(name).await
}
