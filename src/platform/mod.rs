//! Platform resolution
//!
//! Thin adapter over the cluster infrastructure config: figures out which
//! cloud the cluster runs in, the region/project/resource-group scope, and
//! the cluster's infrastructure identity. Everything downstream (driver
//! selection, credential requests, location records) keys off the
//! [`PlatformStatus`] resolved here.

use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Platform Types
// =============================================================================

/// Cloud platforms supported by the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum PlatformType {
    #[serde(rename = "AWS")]
    Aws,
    #[serde(rename = "GCP")]
    Gcp,
    #[serde(rename = "Azure")]
    Azure,
}

impl PlatformType {
    /// Provider string used in backup/snapshot location records
    pub fn provider(&self) -> &'static str {
        match self {
            PlatformType::Aws => "aws",
            PlatformType::Gcp => "gcp",
            PlatformType::Azure => "azure",
        }
    }
}

impl std::fmt::Display for PlatformType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlatformType::Aws => write!(f, "AWS"),
            PlatformType::Gcp => write!(f, "GCP"),
            PlatformType::Azure => write!(f, "Azure"),
        }
    }
}

/// AWS-specific platform information
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AwsPlatformInfo {
    pub region: String,
}

/// GCP-specific platform information
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GcpPlatformInfo {
    pub region: String,
    #[serde(rename = "projectID")]
    pub project_id: String,
}

/// Azure-specific platform information
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AzurePlatformInfo {
    pub resource_group_name: String,
    #[serde(default)]
    pub region: String,
}

/// Resolved platform: where the cluster runs and under which identity
#[derive(Debug, Clone)]
pub struct PlatformStatus {
    pub platform: PlatformType,
    pub infrastructure_name: String,
    pub aws: Option<AwsPlatformInfo>,
    pub gcp: Option<GcpPlatformInfo>,
    pub azure: Option<AzurePlatformInfo>,
}

impl PlatformStatus {
    /// Verify that the platform carries the information its driver needs.
    /// A missing region/project/resource-group is a configuration error
    /// that no amount of retrying will fix.
    pub fn validate(&self) -> Result<()> {
        match self.platform {
            PlatformType::Aws => {
                if self.aws.as_ref().map_or(true, |a| a.region.is_empty()) {
                    return Err(Error::Configuration(
                        "unable to determine AWS region".into(),
                    ));
                }
            }
            PlatformType::Gcp => {
                let gcp = self.gcp.as_ref();
                if gcp.map_or(true, |g| g.region.is_empty() || g.project_id.is_empty()) {
                    return Err(Error::Configuration(
                        "unable to determine GCP region or project".into(),
                    ));
                }
            }
            PlatformType::Azure => {
                if self
                    .azure
                    .as_ref()
                    .map_or(true, |a| a.resource_group_name.is_empty())
                {
                    return Err(Error::Configuration(
                        "unable to determine Azure resource group".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn aws(&self) -> Result<&AwsPlatformInfo> {
        self.aws
            .as_ref()
            .ok_or_else(|| Error::Configuration("missing AWS platform status".into()))
    }

    pub fn gcp(&self) -> Result<&GcpPlatformInfo> {
        self.gcp
            .as_ref()
            .ok_or_else(|| Error::Configuration("missing GCP platform status".into()))
    }

    pub fn azure(&self) -> Result<&AzurePlatformInfo> {
        self.azure
            .as_ref()
            .ok_or_else(|| Error::Configuration("missing Azure platform status".into()))
    }
}

/// Check if the platform is in the list of supported platforms
pub fn is_platform_supported(platform: PlatformType, supported: &[PlatformType]) -> bool {
    supported.contains(&platform)
}

// =============================================================================
// Cluster Infrastructure Resource
// =============================================================================

/// Platform status block as persisted on the cluster infrastructure object
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InfraPlatformStatus {
    #[serde(rename = "type")]
    pub platform_type: PlatformType,
    #[serde(default)]
    pub aws: Option<AwsPlatformInfo>,
    #[serde(default)]
    pub gcp: Option<GcpPlatformInfo>,
    #[serde(default)]
    pub azure: Option<AzurePlatformInfo>,
}

/// The cluster-scoped infrastructure config object, maintained by the
/// cluster installer. Read-only to this operator.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "config.openshift.io",
    version = "v1",
    kind = "Infrastructure",
    plural = "infrastructures",
    status = "InfrastructureStatus"
)]
pub struct InfrastructureSpec {}

/// Observed infrastructure state
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureStatus {
    #[serde(default)]
    pub infrastructure_name: String,
    #[serde(default)]
    pub platform_status: Option<InfraPlatformStatus>,
}

// =============================================================================
// Resolution
// =============================================================================

/// Shape of the deprecated install-config document, as far as we read it
#[derive(Debug, Deserialize)]
struct InstallConfig {
    #[serde(default)]
    platform: InstallConfigPlatform,
}

#[derive(Debug, Default, Deserialize)]
struct InstallConfigPlatform {
    #[serde(default)]
    aws: Option<InstallConfigAws>,
}

#[derive(Debug, Deserialize)]
struct InstallConfigAws {
    region: String,
}

/// Resolve the platform the cluster runs in.
///
/// Old AWS clusters expose the region only through the install-config
/// ConfigMap; everything else is served from the infrastructure object's
/// platform status.
pub async fn resolve_platform(client: Client) -> Result<PlatformStatus> {
    let infra_api: Api<Infrastructure> = Api::all(client.clone());
    let infra = infra_api.get("cluster").await?;
    let status = infra
        .status
        .ok_or_else(|| Error::Configuration("infrastructure status not populated".into()))?;

    if let Some(ps) = &status.platform_status {
        let complete = match ps.platform_type {
            // Only AWS needs the install-config fallback
            PlatformType::Aws => ps.aws.as_ref().is_some_and(|a| !a.region.is_empty()),
            _ => true,
        };
        if complete {
            return Ok(PlatformStatus {
                platform: ps.platform_type,
                infrastructure_name: status.infrastructure_name.clone(),
                aws: ps.aws.clone(),
                gcp: ps.gcp.clone(),
                azure: ps.azure.clone(),
            });
        }
    }

    // Fall back to the deprecated install-config for old AWS clusters
    let cm_api: Api<ConfigMap> = Api::namespaced(client, "kube-system");
    let cm = cm_api.get("cluster-config-v1").await?;
    let data = cm
        .data
        .as_ref()
        .and_then(|d| d.get("install-config"))
        .ok_or_else(|| Error::Configuration("missing install-config in configmap".into()))?;
    let ic: InstallConfig = serde_yaml::from_str(data)?;
    let region = ic
        .platform
        .aws
        .map(|a| a.region)
        .unwrap_or_default();

    Ok(PlatformStatus {
        platform: PlatformType::Aws,
        infrastructure_name: status.infrastructure_name,
        aws: Some(AwsPlatformInfo { region }),
        gcp: None,
        azure: None,
    })
}
