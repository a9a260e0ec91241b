//! Operator configuration
//!
//! Every package-level constant the operator depends on (image references,
//! tag keys, naming prefixes, the bucket reconcile period) is hoisted into
//! [`OperatorConfig`], constructed once at startup and passed into the
//! coordinator. Tests override individual fields instead of patching globals.

use std::time::Duration;

/// AWS regions served out of the China partition. The upstream image
/// registry is not reachable from these regions, so a mirror is used.
pub const AWS_CHINA_REGIONS: &[&str] = &["cn-north-1", "cn-northwest-1"];

/// Static configuration for the operator
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Operator name, used to derive convention-based resource names
    pub operator_name: String,

    /// Namespace the operator manages Velero in
    pub namespace: String,

    /// How often a fully-provisioned bucket is re-verified
    pub reconcile_period: Duration,

    /// Prefix for proposed bucket names
    pub bucket_prefix: String,

    /// Prefix for proposed Azure storage-account names
    /// (must only contain lower case letters or numbers)
    pub account_prefix: String,

    /// Fixed name of the Azure blob container
    pub container_name: String,

    /// Tag key marking a bucket as a backup location
    pub tag_backup_location: String,

    /// Tag key carrying the owning cluster's infrastructure name
    pub tag_infrastructure_name: String,

    /// Value of the backup-location tag, and the name of the
    /// backup/snapshot location records
    pub default_backup_location: String,

    /// Name of the Velero deployment
    pub deployment_name: String,

    /// Name of the credential-request record and its minted secret
    pub credentials_request_name: String,

    /// Upstream image registry for Velero images
    pub image_registry: String,

    /// Mirror registry used from AWS China regions
    pub image_registry_cn: String,

    /// Velero server image tag
    pub velero_image_tag: String,

    /// Velero AWS object-store plugin image tag
    pub aws_plugin_image_tag: String,

    /// Velero GCP object-store plugin image tag
    pub gcp_plugin_image_tag: String,

    /// Velero Azure object-store plugin image tag
    pub azure_plugin_image_tag: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            operator_name: "managed-backup-operator".to_string(),
            namespace: "managed-backup".to_string(),
            reconcile_period: Duration::from_secs(60 * 60),
            bucket_prefix: "managed-backups-".to_string(),
            account_prefix: "managedbackups".to_string(),
            container_name: "managed-backup-container".to_string(),
            tag_backup_location: "velero.io/backup-location".to_string(),
            tag_infrastructure_name: "velero.io/infrastructureName".to_string(),
            default_backup_location: "default".to_string(),
            deployment_name: "velero".to_string(),
            credentials_request_name: "velero-iam-credentials".to_string(),
            image_registry: "docker.io/velero".to_string(),
            image_registry_cn: "registry.docker-cn.com/velero".to_string(),
            velero_image_tag: "velero:v1.3.1".to_string(),
            aws_plugin_image_tag: "velero-plugin-for-aws:v1.0.1".to_string(),
            gcp_plugin_image_tag: "velero-plugin-for-gcp:v1.0.1".to_string(),
            azure_plugin_image_tag: "velero-plugin-for-microsoft-azure:v1.0.1".to_string(),
        }
    }
}

impl OperatorConfig {
    /// Name of the secret holding the operator's own cloud credentials
    pub fn credentials_secret_name(&self) -> String {
        format!("{}-iam-credentials", self.operator_name)
    }

    /// Name of the metrics service in front of the Velero deployment
    pub fn metrics_service_name(&self) -> String {
        format!("{}-metrics", self.deployment_name)
    }

    /// Image registry to pull Velero images from for the given region
    pub fn registry_for_region(&self, region: &str) -> &str {
        if AWS_CHINA_REGIONS.contains(&region) {
            &self.image_registry_cn
        } else {
            &self.image_registry
        }
    }

    /// Fully-qualified Velero server image for the given registry
    pub fn velero_image(&self, registry: &str) -> String {
        format!("{}/{}", registry, self.velero_image_tag)
    }

    /// Azure tag keys may not contain `/`, so the bucket tag keys are
    /// flattened with `_` on that platform.
    pub fn azure_tag_key(key: &str) -> String {
        key.replace('/', "_")
    }
}
