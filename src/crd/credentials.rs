//! CredentialsRequest CRD
//!
//! Record consumed by the cluster's credential minter: it requests cloud
//! credentials scoped to the backup bucket and materializes them as a
//! secret for the Velero deployment. The provider payload travels as an
//! opaque encoded document, so comparison must decode it first; the raw
//! encoded form is not canonical.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

// =============================================================================
// CredentialsRequest CRD
// =============================================================================

/// Request for minted cloud credentials
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "credentials.managed.io",
    version = "v1",
    kind = "CredentialsRequest",
    plural = "credentialsrequests",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsRequestSpec {
    /// Where the minted credentials are written
    pub secret_ref: SecretReference,

    /// Opaque, provider-specific permission payload
    #[schemars(schema_with = "crate::crd::credentials::any_schema")]
    pub provider_spec: Value,
}

/// Reference to a namespaced secret
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    pub name: String,
    pub namespace: String,
}

/// Schema for the opaque payload: any JSON document
pub fn any_schema(_gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    schemars::schema::Schema::Bool(true)
}

// =============================================================================
// Provider Payloads
// =============================================================================

/// AWS IAM policy payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsProviderSpec {
    #[serde(default)]
    pub kind: String,

    #[serde(default)]
    pub statement_entries: Vec<StatementEntry>,
}

/// One IAM policy statement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatementEntry {
    pub effect: String,
    pub action: Vec<String>,
    pub resource: String,
}

/// GCP role payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcpProviderSpec {
    #[serde(default)]
    pub kind: String,

    #[serde(default)]
    pub predefined_roles: Vec<String>,

    #[serde(default)]
    pub skip_service_check: bool,
}

/// Azure role payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureProviderSpec {
    #[serde(default)]
    pub kind: String,

    #[serde(default)]
    pub role_bindings: Vec<RoleBinding>,
}

/// One Azure role assignment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleBinding {
    pub role: String,
}

// =============================================================================
// Payload Decoding
// =============================================================================

/// Decode an opaque provider payload into its typed form.
///
/// A payload that fails to decode poisons only the credential-request
/// reconciliation; other resource kinds proceed.
pub fn decode_provider_spec<T: DeserializeOwned>(payload: &Value) -> Result<T> {
    serde_json::from_value(payload.clone()).map_err(|e| Error::SpecDecode {
        kind: "CredentialsRequest",
        message: e.to_string(),
    })
}
