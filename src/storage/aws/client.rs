//! S3 client port and SDK-backed implementation
//!
//! The driver talks to S3 through the [`S3Api`] trait so the state machine
//! can be tested against an in-memory implementation. [`AwsS3Client`] is
//! the real thing, built from the operator's IAM credential secret.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::types::{
    BucketCannedAcl, BucketLifecycleConfiguration, BucketLocationConstraint,
    CreateBucketConfiguration, ExpirationStatus, LifecycleExpiration, LifecycleRule,
    LifecycleRuleFilter, PublicAccessBlockConfiguration, ServerSideEncryption,
    ServerSideEncryptionByDefault, ServerSideEncryptionConfiguration, ServerSideEncryptionRule,
    Tag, Tagging,
};
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};

use super::bucket::is_not_found_code;
use crate::error::{Error, Result};

/// ID of the lifecycle rule expiring old backup objects
const LIFECYCLE_RULE_ID: &str = "Backup Expiry";

/// Key prefix the expiry rule applies to
const LIFECYCLE_PREFIX: &str = "backups/";

/// Days after which backup objects expire
const LIFECYCLE_EXPIRY_DAYS: i32 = 90;

// =============================================================================
// S3 Port
// =============================================================================

/// Bucket primitives the AWS driver needs
#[async_trait]
pub trait S3Api: Send + Sync {
    /// Create the bucket in the client's region
    async fn create_bucket(&self, name: &str) -> Result<()>;

    /// Probe the bucket; `Ok(false)` when it does not exist
    async fn head_bucket(&self, name: &str) -> Result<bool>;

    /// Names of all buckets visible to the credential
    async fn list_buckets(&self) -> Result<Vec<String>>;

    /// Tag set of the bucket; empty when the bucket has no tags or has
    /// disappeared since listing
    async fn get_bucket_tags(&self, name: &str) -> Result<BTreeMap<String, String>>;

    /// Remove all tags from the bucket
    async fn delete_bucket_tags(&self, name: &str) -> Result<()>;

    /// Apply the given tag set to the bucket
    async fn put_bucket_tags(&self, name: &str, tags: &BTreeMap<String, String>) -> Result<()>;

    /// Enforce default server-side encryption
    async fn put_bucket_encryption(&self, name: &str) -> Result<()>;

    /// Block public access to the bucket and its objects
    async fn put_public_access_block(&self, name: &str) -> Result<()>;

    /// Enforce the backup-expiry lifecycle rule
    async fn put_bucket_lifecycle(&self, name: &str) -> Result<()>;
}

pub type S3ApiRef = Arc<dyn S3Api>;

/// Wipe any existing tags, then apply ours, so a bucket adopted from a
/// previous installation does not keep stale ownership markers.
pub async fn tag_bucket(api: &dyn S3Api, name: &str, tags: &BTreeMap<String, String>) -> Result<()> {
    api.delete_bucket_tags(name).await?;
    api.put_bucket_tags(name, tags).await
}

// =============================================================================
// SDK-backed Client
// =============================================================================

/// S3 client over the AWS SDK
pub struct AwsS3Client {
    inner: aws_sdk_s3::Client,
    region: String,
}

impl AwsS3Client {
    /// Read the IAM credential secret in the operator's namespace and
    /// build a client for the cluster's region.
    pub async fn new(
        kube: Client,
        namespace: &str,
        secret_name: &str,
        region: &str,
    ) -> Result<Self> {
        let secrets: Api<Secret> = Api::namespaced(kube, namespace);
        let secret = secrets.get(secret_name).await?;

        let access_key = secret_value(&secret, secret_name, "aws_access_key_id")?;
        let secret_key = secret_value(&secret, secret_name, "aws_secret_access_key")?;

        let credentials =
            Credentials::new(access_key, secret_key, None, None, "managed-backup-operator");
        let conf = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .credentials_provider(credentials)
            .build();

        Ok(Self {
            inner: aws_sdk_s3::Client::from_conf(conf),
            region: region.to_string(),
        })
    }
}

/// Extract a UTF-8 value from a secret, by key
fn secret_value(secret: &Secret, secret_name: &str, key: &str) -> Result<String> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|v| String::from_utf8_lossy(&v.0).into_owned())
        .ok_or_else(|| Error::CredentialsKey {
            secret: secret_name.to_string(),
            key: key.to_string(),
        })
}

/// Map an SDK error, preserving the service error code for classification
fn sdk_error<E>(err: SdkError<E>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let code = err
        .as_service_error()
        .and_then(|service| service.code())
        .map(str::to_string);
    Error::provider("aws", code, err.to_string())
}

#[async_trait]
impl S3Api for AwsS3Client {
    async fn create_bucket(&self, name: &str) -> Result<()> {
        let mut request = self
            .inner
            .create_bucket()
            .acl(BucketCannedAcl::Private)
            .bucket(name);

        // us-east-1 rejects an explicit location constraint
        if self.region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }

        request.send().await.map_err(sdk_error)?;
        Ok(())
    }

    async fn head_bucket(&self, name: &str) -> Result<bool> {
        match self.inner.head_bucket().bucket(name).send().await {
            Ok(_) => Ok(true),
            Err(err) => {
                let code = err.as_service_error().and_then(|service| service.code());
                if code.is_some_and(is_not_found_code) {
                    Ok(false)
                } else {
                    Err(sdk_error(err))
                }
            }
        }
    }

    async fn list_buckets(&self) -> Result<Vec<String>> {
        let output = self.inner.list_buckets().send().await.map_err(sdk_error)?;
        Ok(output
            .buckets()
            .iter()
            .filter_map(|bucket| bucket.name().map(str::to_string))
            .collect())
    }

    async fn get_bucket_tags(&self, name: &str) -> Result<BTreeMap<String, String>> {
        match self.inner.get_bucket_tagging().bucket(name).send().await {
            Ok(output) => Ok(output
                .tag_set()
                .iter()
                .map(|tag| (tag.key().to_string(), tag.value().to_string()))
                .collect()),
            Err(err) => {
                let code = err.as_service_error().and_then(|service| service.code());
                match code {
                    // No tags, or the bucket vanished between listing and
                    // tagging reads; either way it is not a candidate.
                    Some("NoSuchTagSet") | Some("NoSuchBucket") => Ok(BTreeMap::new()),
                    _ => Err(sdk_error(err)),
                }
            }
        }
    }

    async fn delete_bucket_tags(&self, name: &str) -> Result<()> {
        self.inner
            .delete_bucket_tagging()
            .bucket(name)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn put_bucket_tags(&self, name: &str, tags: &BTreeMap<String, String>) -> Result<()> {
        let mut tag_set = Vec::with_capacity(tags.len());
        for (key, value) in tags {
            let tag = Tag::builder()
                .key(key)
                .value(value)
                .build()
                .map_err(|e| Error::Internal(e.to_string()))?;
            tag_set.push(tag);
        }
        let tagging = Tagging::builder()
            .set_tag_set(Some(tag_set))
            .build()
            .map_err(|e| Error::Internal(e.to_string()))?;

        self.inner
            .put_bucket_tagging()
            .bucket(name)
            .tagging(tagging)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn put_bucket_encryption(&self, name: &str) -> Result<()> {
        let by_default = ServerSideEncryptionByDefault::builder()
            .sse_algorithm(ServerSideEncryption::Aes256)
            .build()
            .map_err(|e| Error::Internal(e.to_string()))?;
        let configuration = ServerSideEncryptionConfiguration::builder()
            .rules(
                ServerSideEncryptionRule::builder()
                    .apply_server_side_encryption_by_default(by_default)
                    .build(),
            )
            .build()
            .map_err(|e| Error::Internal(e.to_string()))?;

        self.inner
            .put_bucket_encryption()
            .bucket(name)
            .server_side_encryption_configuration(configuration)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn put_public_access_block(&self, name: &str) -> Result<()> {
        let configuration = PublicAccessBlockConfiguration::builder()
            .block_public_acls(true)
            .block_public_policy(true)
            .ignore_public_acls(true)
            .restrict_public_buckets(true)
            .build();

        self.inner
            .put_public_access_block()
            .bucket(name)
            .public_access_block_configuration(configuration)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn put_bucket_lifecycle(&self, name: &str) -> Result<()> {
        let rule = LifecycleRule::builder()
            .id(LIFECYCLE_RULE_ID)
            .status(ExpirationStatus::Enabled)
            .filter(
                LifecycleRuleFilter::builder()
                    .prefix(LIFECYCLE_PREFIX)
                    .build(),
            )
            .expiration(
                LifecycleExpiration::builder()
                    .days(LIFECYCLE_EXPIRY_DAYS)
                    .build(),
            )
            .build()
            .map_err(|e| Error::Internal(e.to_string()))?;
        let configuration = BucketLifecycleConfiguration::builder()
            .rules(rule)
            .build()
            .map_err(|e| Error::Internal(e.to_string()))?;

        self.inner
            .put_bucket_lifecycle_configuration()
            .bucket(name)
            .lifecycle_configuration(configuration)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }
}
