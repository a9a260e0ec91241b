//! GCS client port and JSON-API implementation
//!
//! GCS is driven through its JSON API: bucket resources live under
//! `storage/v1/b` and carry label maps instead of tag sets. Auth is a
//! service-account JWT assertion exchanged for a bearer token.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{Error, Result};

const STORAGE_API: &str = "https://storage.googleapis.com/storage/v1";
const STORAGE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.full_control";
const JWT_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Days after which backup objects expire
const LIFECYCLE_EXPIRY_DAYS: u32 = 90;

/// Key prefix the expiry rule applies to
const LIFECYCLE_PREFIX: &str = "backups/";

// =============================================================================
// GCS Port
// =============================================================================

/// A bucket as seen during the adoption scan
#[derive(Debug, Clone)]
pub struct GcsBucket {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

/// Bucket primitives the GCP driver needs
#[async_trait]
pub trait GcsApi: Send + Sync {
    /// Create the bucket with uniform bucket-level access enabled and the
    /// given labels applied at creation time
    async fn insert_bucket(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<()>;

    /// Probe the bucket; `Ok(false)` when it does not exist
    async fn bucket_exists(&self, name: &str) -> Result<bool>;

    /// All buckets in the project, with their labels
    async fn list_buckets(&self) -> Result<Vec<GcsBucket>>;

    /// Re-assert the given labels on the bucket
    async fn patch_labels(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<()>;

    /// Enforce the backup-expiry lifecycle rule
    async fn patch_lifecycle(&self, name: &str) -> Result<()>;
}

pub type GcsApiRef = Arc<dyn GcsApi>;

// =============================================================================
// JSON-API Client
// =============================================================================

/// Service-account key material, as stored in the credential secret
#[derive(Debug, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

#[derive(Debug, Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// GCS client over the JSON API
pub struct GcsHttpClient {
    http: reqwest::Client,
    token: String,
    project: String,
    region: String,
}

impl GcsHttpClient {
    /// Read the service-account secret in the operator's namespace and
    /// exchange it for a bearer token.
    pub async fn new(
        kube: Client,
        namespace: &str,
        secret_name: &str,
        region: &str,
        project: &str,
    ) -> Result<Self> {
        let secrets: Api<Secret> = Api::namespaced(kube, namespace);
        let secret = secrets.get(secret_name).await?;
        let key_data = secret
            .data
            .as_ref()
            .and_then(|data| data.get("service_account.json"))
            .ok_or_else(|| Error::CredentialsKey {
                secret: secret_name.to_string(),
                key: "service_account.json".to_string(),
            })?;
        let key: ServiceAccountKey = serde_json::from_slice(&key_data.0)?;

        let http = reqwest::Client::new();
        let token = Self::exchange_token(&http, &key).await?;

        Ok(Self {
            http,
            token,
            project: project.to_string(),
            region: region.to_string(),
        })
    }

    async fn exchange_token(http: &reqwest::Client, key: &ServiceAccountKey) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = JwtClaims {
            iss: &key.client_email,
            scope: STORAGE_SCOPE,
            aud: &key.token_uri,
            iat: now,
            exp: now + 3600,
        };
        let assertion = jsonwebtoken::encode(
            &Header::new(Algorithm::RS256),
            &claims,
            &EncodingKey::from_rsa_pem(key.private_key.as_bytes())?,
        )?;

        let response = http
            .post(&key.token_uri)
            .form(&[("grant_type", JWT_GRANT_TYPE), ("assertion", &assertion)])
            .send()
            .await?;
        let response = check("exchanging token", response).await?;
        let token: TokenResponse = response.json().await?;
        Ok(token.access_token)
    }

    fn bucket_url(&self, name: &str) -> String {
        format!("{}/b/{}", STORAGE_API, urlencoding::encode(name))
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
        "gcs",
        Some(status.as_u16().to_string()),
        format!("{context}: {body}"),
    ))
}

#[async_trait]
impl GcsApi for GcsHttpClient {
    async fn insert_bucket(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<()> {
        let body = json!({
            "name": name,
            "location": self.region.to_uppercase(),
            "iamConfiguration": { "uniformBucketLevelAccess": { "enabled": true } },
            "labels": labels,
        });
        let response = self
            .http
            .post(format!("{STORAGE_API}/b"))
            .query(&[("project", self.project.as_str())])
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        check("creating bucket", response).await?;
        Ok(())
    }

    async fn bucket_exists(&self, name: &str) -> Result<bool> {
        let response = self
            .http
            .get(self.bucket_url(name))
            .bearer_auth(&self.token)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check("probing bucket", response).await?;
        Ok(true)
    }

    async fn list_buckets(&self) -> Result<Vec<GcsBucket>> {
        #[derive(Deserialize)]
        struct BucketResource {
            name: String,
            #[serde(default)]
            labels: BTreeMap<String, String>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ListResponse {
            #[serde(default)]
            items: Vec<BucketResource>,
            next_page_token: Option<String>,
        }

        let mut buckets = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self
                .http
                .get(format!("{STORAGE_API}/b"))
                .query(&[("project", self.project.as_str())])
                .bearer_auth(&self.token);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }
            let response = check("listing buckets", request.send().await?).await?;
            let page: ListResponse = response.json().await?;

            buckets.extend(page.items.into_iter().map(|item| GcsBucket {
                name: item.name,
                labels: item.labels,
            }));

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(buckets)
    }

    async fn patch_labels(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<()> {
        let response = self
            .http
            .patch(self.bucket_url(name))
            .bearer_auth(&self.token)
            .json(&json!({ "labels": labels }))
            .send()
            .await?;
        check("labeling bucket", response).await?;
        Ok(())
    }

    async fn patch_lifecycle(&self, name: &str) -> Result<()> {
        let body = json!({
            "lifecycle": {
                "rule": [{
                    "action": { "type": "Delete" },
                    "condition": {
                        "age": LIFECYCLE_EXPIRY_DAYS,
                        "matchesPrefix": [LIFECYCLE_PREFIX],
                    },
                }],
            },
        });
        let response = self
            .http
            .patch(self.bucket_url(name))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        check("configuring lifecycle rules on bucket", response).await?;
        Ok(())
    }
}
