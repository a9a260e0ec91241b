//! Desired credential-request records
//!
//! One CredentialsRequest per cluster asks the credential minter for
//! bucket-scoped permissions and lands them in the secret the Velero
//! deployment mounts. The provider payload is encoded, so equality is
//! judged on the decoded form.

use serde_json::Value;

use crate::config::OperatorConfig;
use crate::crd::{
    decode_provider_spec, AwsProviderSpec, AzureProviderSpec, CredentialsRequest,
    CredentialsRequestSpec, GcpProviderSpec, RoleBinding, SecretReference, StatementEntry,
};
use crate::error::Result;
use crate::platform::{PlatformStatus, PlatformType};

/// Map an AWS region onto its ARN partition
pub fn aws_partition_for_region(region: &str) -> &'static str {
    if region.starts_with("cn-") {
        "aws-cn"
    } else if region.starts_with("us-gov-") {
        "aws-us-gov"
    } else {
        "aws"
    }
}

fn aws_provider_spec(region: &str, bucket: &str) -> AwsProviderSpec {
    let resource = format!("arn:{}:s3:::{}", aws_partition_for_region(region), bucket);

    AwsProviderSpec {
        kind: "AWSProviderSpec".to_string(),
        statement_entries: vec![
            StatementEntry {
                effect: "Allow".to_string(),
                action: vec![
                    "ec2:DescribeVolumes".to_string(),
                    "ec2:DescribeSnapshots".to_string(),
                    "ec2:CreateTags".to_string(),
                    "ec2:CreateVolume".to_string(),
                    "ec2:CreateSnapshot".to_string(),
                    "ec2:DeleteSnapshot".to_string(),
                ],
                resource: "*".to_string(),
            },
            StatementEntry {
                effect: "Allow".to_string(),
                action: vec![
                    "s3:GetObject".to_string(),
                    "s3:DeleteObject".to_string(),
                    "s3:PutObject".to_string(),
                    "s3:AbortMultipartUpload".to_string(),
                    "s3:ListMultipartUploadParts".to_string(),
                ],
                resource: format!("{resource}/*"),
            },
            StatementEntry {
                effect: "Allow".to_string(),
                action: vec!["s3:ListBucket".to_string()],
                resource,
            },
        ],
    }
}

fn gcp_provider_spec() -> GcpProviderSpec {
    GcpProviderSpec {
        kind: "GCPProviderSpec".to_string(),
        predefined_roles: vec![
            "roles/compute.storageAdmin".to_string(),
            "roles/iam.serviceAccountUser".to_string(),
            "roles/cloudmigration.storageaccess".to_string(),
        ],
        skip_service_check: true,
    }
}

fn azure_provider_spec() -> AzureProviderSpec {
    AzureProviderSpec {
        kind: "AzureProviderSpec".to_string(),
        role_bindings: vec![RoleBinding {
            role: "Contributor".to_string(),
        }],
    }
}

fn encode_payload(platform: &PlatformStatus, bucket: &str) -> Result<Value> {
    let payload = match platform.platform {
        PlatformType::Aws => serde_json::to_value(aws_provider_spec(
            &platform.aws()?.region,
            bucket,
        ))?,
        PlatformType::Gcp => serde_json::to_value(gcp_provider_spec())?,
        PlatformType::Azure => serde_json::to_value(azure_provider_spec())?,
    };
    Ok(payload)
}

/// Desired CredentialsRequest for the platform and bucket
pub fn credentials_request(
    namespace: &str,
    platform: &PlatformStatus,
    bucket: &str,
    config: &OperatorConfig,
) -> Result<CredentialsRequest> {
    let mut request = CredentialsRequest::new(
        &config.credentials_request_name,
        CredentialsRequestSpec {
            secret_ref: SecretReference {
                name: config.credentials_request_name.clone(),
                namespace: namespace.to_string(),
            },
            provider_spec: encode_payload(platform, bucket)?,
        },
    );
    request.metadata.namespace = Some(namespace.to_string());
    Ok(request)
}

/// Equality for credential requests decodes the provider payload first:
/// byte-level equality of the encoded form is meaningless because the
/// encoding is not canonical.
pub fn credentials_specs_equal(
    observed: &CredentialsRequestSpec,
    desired: &CredentialsRequestSpec,
    platform: PlatformType,
) -> Result<bool> {
    if observed.secret_ref != desired.secret_ref {
        return Ok(false);
    }

    match platform {
        PlatformType::Aws => {
            let observed: AwsProviderSpec = decode_provider_spec(&observed.provider_spec)?;
            let desired: AwsProviderSpec = decode_provider_spec(&desired.provider_spec)?;
            Ok(observed == desired)
        }
        PlatformType::Gcp => {
            let observed: GcpProviderSpec = decode_provider_spec(&observed.provider_spec)?;
            let desired: GcpProviderSpec = decode_provider_spec(&desired.provider_spec)?;
            Ok(observed == desired)
        }
        PlatformType::Azure => {
            let observed: AzureProviderSpec = decode_provider_spec(&observed.provider_spec)?;
            let desired: AzureProviderSpec = decode_provider_spec(&desired.provider_spec)?;
            Ok(observed == desired)
        }
    }
}
