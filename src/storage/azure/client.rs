//! Azure storage client port and ARM-backed implementation
//!
//! Azure nests the backup container under a storage account, so the port
//! carries primitives for both resources. Everything goes through the
//! Azure Resource Manager REST API with an AAD client-credentials token;
//! account creation is accepted asynchronously by ARM and confirmed by the
//! next pass's existence probe.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use serde::Deserialize;
use serde_json::json;

use crate::error::{Error, Result};

const MANAGEMENT_ENDPOINT: &str = "https://management.azure.com";
const API_VERSION: &str = "2019-06-01";

// =============================================================================
// Azure Port
// =============================================================================

/// A storage account as seen during the adoption scan
#[derive(Debug, Clone)]
pub struct AzureAccount {
    pub name: String,
    pub tags: BTreeMap<String, String>,
}

/// Storage-account and container primitives the Azure driver needs
#[async_trait]
pub trait AzureStorageApi: Send + Sync {
    /// All storage accounts in the resource group, with their tags
    async fn list_storage_accounts(&self) -> Result<Vec<AzureAccount>>;

    /// Whether the proposed account name is still free
    async fn check_name_availability(&self, name: &str) -> Result<bool>;

    /// Create the storage account with ownership tags
    async fn create_storage_account(
        &self,
        name: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Re-assert sku, HTTPS-only transport, and access tier
    async fn update_storage_account(&self, name: &str) -> Result<()>;

    /// Probe the storage account; `Ok(false)` when it does not exist
    async fn storage_account_exists(&self, name: &str) -> Result<bool>;

    /// Create the blob container under the account, public access off
    async fn create_container(&self, account: &str, name: &str) -> Result<()>;

    /// Probe the container; `Ok(false)` when it does not exist
    async fn container_exists(&self, account: &str, name: &str) -> Result<bool>;

    /// Re-assert that public access to the container is off
    async fn set_container_access(&self, account: &str, name: &str) -> Result<()>;
}

pub type AzureApiRef = Arc<dyn AzureStorageApi>;

// =============================================================================
// ARM Client
// =============================================================================

/// Service-principal material, as stored in the credential secret
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServicePrincipal {
    client_id: String,
    client_secret: String,
    tenant_id: String,
    subscription_id: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Azure Resource Manager client scoped to one resource group
pub struct AzureMgmtClient {
    http: reqwest::Client,
    token: String,
    subscription_id: String,
    resource_group: String,
    region: String,
}

impl AzureMgmtClient {
    /// Read the service-principal secret in the operator's namespace and
    /// acquire a management-plane token.
    pub async fn new(
        kube: Client,
        namespace: &str,
        secret_name: &str,
        resource_group: &str,
        region: &str,
    ) -> Result<Self> {
        let secrets: Api<Secret> = Api::namespaced(kube, namespace);
        let secret = secrets.get(secret_name).await?;
        let principal_data = secret
            .data
            .as_ref()
            .and_then(|data| data.get("osServicePrincipal.json"))
            .ok_or_else(|| Error::CredentialsKey {
                secret: secret_name.to_string(),
                key: "osServicePrincipal.json".to_string(),
            })?;
        let principal: ServicePrincipal = serde_json::from_slice(&principal_data.0)?;

        let http = reqwest::Client::new();
        let token = Self::acquire_token(&http, &principal).await?;

        Ok(Self {
            http,
            token,
            subscription_id: principal.subscription_id,
            resource_group: resource_group.to_string(),
            region: region.to_string(),
        })
    }

    async fn acquire_token(
        http: &reqwest::Client,
        principal: &ServicePrincipal,
    ) -> Result<String> {
        let url = format!(
            "https://login.microsoftonline.com/{}/oauth2/token",
            principal.tenant_id
        );
        let response = http
            .post(url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", principal.client_id.as_str()),
                ("client_secret", principal.client_secret.as_str()),
                ("resource", &format!("{MANAGEMENT_ENDPOINT}/")),
            ])
            .send()
            .await?;
        let response = check("acquiring token", response).await?;
        let token: TokenResponse = response.json().await?;
        Ok(token.access_token)
    }

    fn accounts_url(&self) -> String {
        format!(
            "{MANAGEMENT_ENDPOINT}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Storage/storageAccounts",
            self.subscription_id, self.resource_group
        )
    }

    fn account_url(&self, account: &str) -> String {
        format!("{}/{}", self.accounts_url(), urlencoding::encode(account))
    }

    fn container_url(&self, account: &str, container: &str) -> String {
        format!(
            "{}/blobServices/default/containers/{}",
            self.account_url(account),
            urlencoding::encode(container)
        )
    }
}

/// Surface a non-success response as a provider error carrying the HTTP
/// status as its code
async fn check(context: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::provider(
        "azure",
        Some(status.as_u16().to_string()),
        format!("{context}: {body}"),
    ))
}

#[async_trait]
impl AzureStorageApi for AzureMgmtClient {
    async fn list_storage_accounts(&self) -> Result<Vec<AzureAccount>> {
        #[derive(Deserialize)]
        struct AccountResource {
            name: String,
            #[serde(default)]
            tags: BTreeMap<String, String>,
        }
        #[derive(Deserialize)]
        struct ListResponse {
            #[serde(default)]
            value: Vec<AccountResource>,
        }

        let response = self
            .http
            .get(self.accounts_url())
            .query(&[("api-version", API_VERSION)])
            .bearer_auth(&self.token)
            .send()
            .await?;
        let response = check("listing storage accounts", response).await?;
        let list: ListResponse = response.json().await?;

        Ok(list
            .value
            .into_iter()
            .map(|account| AzureAccount {
                name: account.name,
                tags: account.tags,
            })
            .collect())
    }

    async fn check_name_availability(&self, name: &str) -> Result<bool> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct AvailabilityResponse {
            name_available: bool,
        }

        let url = format!(
            "{MANAGEMENT_ENDPOINT}/subscriptions/{}/providers/Microsoft.Storage/checkNameAvailability",
            self.subscription_id
        );
        let response = self
            .http
            .post(url)
            .query(&[("api-version", API_VERSION)])
            .bearer_auth(&self.token)
            .json(&json!({
                "name": name,
                "type": "Microsoft.Storage/storageAccounts",
            }))
            .send()
            .await?;
        let response = check("checking account name availability", response).await?;
        let availability: AvailabilityResponse = response.json().await?;
        Ok(availability.name_available)
    }

    async fn create_storage_account(
        &self,
        name: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<()> {
        let body = json!({
            "sku": { "name": "Standard_GRS" },
            "kind": "BlobStorage",
            "location": self.region,
            "tags": tags,
            "properties": {
                "supportsHttpsTrafficOnly": true,
                "accessTier": "Hot",
            },
        });
        let response = self
            .http
            .put(self.account_url(name))
            .query(&[("api-version", API_VERSION)])
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        check("creating storage account", response).await?;
        Ok(())
    }

    async fn update_storage_account(&self, name: &str) -> Result<()> {
        let body = json!({
            "sku": { "name": "Standard_GRS" },
            "properties": {
                "supportsHttpsTrafficOnly": true,
                "accessTier": "Hot",
            },
        });
        let response = self
            .http
            .patch(self.account_url(name))
            .query(&[("api-version", API_VERSION)])
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        check("updating storage account", response).await?;
        Ok(())
    }

    async fn storage_account_exists(&self, name: &str) -> Result<bool> {
        let response = self
            .http
            .get(self.account_url(name))
            .query(&[("api-version", API_VERSION)])
            .bearer_auth(&self.token)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check("probing storage account", response).await?;
        Ok(true)
    }

    async fn create_container(&self, account: &str, name: &str) -> Result<()> {
        let response = self
            .http
            .put(self.container_url(account, name))
            .query(&[("api-version", API_VERSION)])
            .bearer_auth(&self.token)
            .json(&json!({ "properties": { "publicAccess": "None" } }))
            .send()
            .await?;
        check("creating blob container", response).await?;
        Ok(())
    }

    async fn container_exists(&self, account: &str, name: &str) -> Result<bool> {
        let response = self
            .http
            .get(self.container_url(account, name))
            .query(&[("api-version", API_VERSION)])
            .bearer_auth(&self.token)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check("probing blob container", response).await?;
        Ok(true)
    }

    async fn set_container_access(&self, account: &str, name: &str) -> Result<()> {
        let response = self
            .http
            .patch(self.container_url(account, name))
            .query(&[("api-version", API_VERSION)])
            .bearer_auth(&self.token)
            .json(&json!({ "properties": { "publicAccess": "None" } }))
            .send()
            .await?;
        check("setting blob container access policy", response).await?;
        Ok(())
    }
}
