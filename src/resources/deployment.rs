//! Desired Velero deployment
//!
//! Builds the full deployment spec for the Velero server: one replica,
//! rolling updates, infra-node scheduling preferences, the provider's
//! object-store plugin as an init container, and credentials wired the way
//! each provider's plugin expects them.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource,
    NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, ObjectFieldSelector,
    PodSecurityContext, PodSpec, PodTemplateSpec, PreferredSchedulingTerm, SecretKeySelector,
    SecretVolumeSource, Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::config::OperatorConfig;
use crate::platform::{PlatformStatus, PlatformType};

/// Port the Velero server exposes metrics on
pub const METRICS_PORT: i32 = 8085;

/// Pod labels; the metrics service selects on these
pub fn deployment_labels(config: &OperatorConfig) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("component".to_string(), config.deployment_name.clone()),
        ("deploy".to_string(), config.deployment_name.clone()),
    ])
}

/// Deployments compare by plain spec equality; every field is pinned
/// explicitly in the desired spec so apiserver defaulting does not
/// produce drift.
pub fn deployment_specs_equal(observed: &Deployment, desired: &Deployment) -> bool {
    observed.spec == desired.spec
}

/// Desired Velero deployment for the platform
pub fn velero_deployment(
    namespace: &str,
    platform: &PlatformStatus,
    config: &OperatorConfig,
) -> Deployment {
    let registry = match platform.platform {
        PlatformType::Aws => config.registry_for_region(
            platform
                .aws
                .as_ref()
                .map(|aws| aws.region.as_str())
                .unwrap_or_default(),
        ),
        _ => config.image_registry.as_str(),
    };

    let labels = deployment_labels(config);
    let annotations = BTreeMap::from([
        ("prometheus.io/scrape".to_string(), "true".to_string()),
        ("prometheus.io/port".to_string(), METRICS_PORT.to_string()),
        ("prometheus.io/path".to_string(), "/metrics".to_string()),
    ]);

    Deployment {
        metadata: ObjectMeta {
            name: Some(config.deployment_name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            revision_history_limit: Some(2),
            progress_deadline_seconds: Some(600),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateDeployment {
                    max_unavailable: Some(IntOrString::String("25%".to_string())),
                    max_surge: Some(IntOrString::String("25%".to_string())),
                }),
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(annotations),
                    ..Default::default()
                }),
                spec: Some(pod_spec(platform, config, registry)),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn pod_spec(platform: &PlatformStatus, config: &OperatorConfig, registry: &str) -> PodSpec {
    PodSpec {
        service_account_name: Some(config.deployment_name.clone()),
        restart_policy: Some("Always".to_string()),
        dns_policy: Some("ClusterFirst".to_string()),
        scheduler_name: Some("default-scheduler".to_string()),
        termination_grace_period_seconds: Some(30),
        security_context: Some(PodSecurityContext::default()),
        tolerations: Some(vec![Toleration {
            key: Some("node-role.kubernetes.io/infra".to_string()),
            operator: Some("Exists".to_string()),
            effect: Some("NoSchedule".to_string()),
            ..Default::default()
        }]),
        affinity: Some(scheduling_affinity()),
        init_containers: Some(vec![plugin_container(platform, config, registry)]),
        containers: vec![server_container(platform, config, registry)],
        volumes: Some(volumes(platform, config)),
        ..Default::default()
    }
}

/// Backups run on infra nodes when available; the images are amd64 only
fn scheduling_affinity() -> Affinity {
    Affinity {
        node_affinity: Some(NodeAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                PreferredSchedulingTerm {
                    weight: 1,
                    preference: NodeSelectorTerm {
                        match_expressions: Some(vec![NodeSelectorRequirement {
                            key: "node-role.kubernetes.io/infra".to_string(),
                            operator: "Exists".to_string(),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    },
                },
            ]),
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: Some(vec![NodeSelectorRequirement {
                        key: "kubernetes.io/arch".to_string(),
                        operator: "In".to_string(),
                        values: Some(vec!["amd64".to_string()]),
                    }]),
                    ..Default::default()
                }],
            }),
        }),
        ..Default::default()
    }
}

/// The provider's object-store plugin, installed into the plugins volume
fn plugin_container(
    platform: &PlatformStatus,
    config: &OperatorConfig,
    registry: &str,
) -> Container {
    let (name, image_tag) = match platform.platform {
        PlatformType::Aws => ("velero-plugin-for-aws", &config.aws_plugin_image_tag),
        PlatformType::Gcp => ("velero-plugin-for-gcp", &config.gcp_plugin_image_tag),
        PlatformType::Azure => (
            "velero-plugin-for-microsoft-azure",
            &config.azure_plugin_image_tag,
        ),
    };

    Container {
        name: name.to_string(),
        image: Some(format!("{registry}/{image_tag}")),
        image_pull_policy: Some("IfNotPresent".to_string()),
        volume_mounts: Some(vec![VolumeMount {
            name: "plugins".to_string(),
            mount_path: "/target".to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

fn server_container(
    platform: &PlatformStatus,
    config: &OperatorConfig,
    registry: &str,
) -> Container {
    let mut env = vec![
        EnvVar {
            name: "VELERO_SCRATCH_DIR".to_string(),
            value: Some("/scratch".to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "VELERO_NAMESPACE".to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    api_version: Some("v1".to_string()),
                    field_path: "metadata.namespace".to_string(),
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];
    env.extend(provider_env(platform, config));

    let mut volume_mounts = vec![
        VolumeMount {
            name: "plugins".to_string(),
            mount_path: "/plugins".to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: "scratch".to_string(),
            mount_path: "/scratch".to_string(),
            ..Default::default()
        },
    ];
    if uses_credentials_volume(platform.platform) {
        volume_mounts.push(VolumeMount {
            name: "cloud-credentials".to_string(),
            mount_path: "/credentials".to_string(),
            ..Default::default()
        });
    }

    Container {
        name: config.deployment_name.clone(),
        image: Some(config.velero_image(registry)),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec!["/velero".to_string()]),
        args: Some(vec!["server".to_string()]),
        ports: Some(vec![ContainerPort {
            name: Some("metrics".to_string()),
            container_port: METRICS_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env: Some(env),
        volume_mounts: Some(volume_mounts),
        termination_message_path: Some("/dev/termination-log".to_string()),
        termination_message_policy: Some("File".to_string()),
        ..Default::default()
    }
}

/// GCP and Azure plugins read a credentials file from a mounted volume;
/// the AWS plugin takes its keys from the environment.
fn uses_credentials_volume(platform: PlatformType) -> bool {
    matches!(platform, PlatformType::Gcp | PlatformType::Azure)
}

fn provider_env(platform: &PlatformStatus, config: &OperatorConfig) -> Vec<EnvVar> {
    let secret_env = |name: &str, key: &str| EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: Some(config.credentials_request_name.clone()),
                key: key.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    match platform.platform {
        PlatformType::Aws => vec![
            secret_env("AWS_ACCESS_KEY_ID", "aws_access_key_id"),
            secret_env("AWS_SECRET_ACCESS_KEY", "aws_secret_access_key"),
        ],
        PlatformType::Gcp => vec![EnvVar {
            name: "GOOGLE_APPLICATION_CREDENTIALS".to_string(),
            value: Some("/credentials/service_account.json".to_string()),
            ..Default::default()
        }],
        PlatformType::Azure => vec![EnvVar {
            name: "AZURE_CREDENTIALS_FILE".to_string(),
            value: Some("/credentials/osServicePrincipal.json".to_string()),
            ..Default::default()
        }],
    }
}

fn volumes(platform: &PlatformStatus, config: &OperatorConfig) -> Vec<Volume> {
    let mut volumes = vec![
        Volume {
            name: "plugins".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
        Volume {
            name: "scratch".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    ];
    if uses_credentials_volume(platform.platform) {
        volumes.push(Volume {
            name: "cloud-credentials".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(config.credentials_request_name.clone()),
                default_mode: Some(0o644),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    volumes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{AwsPlatformInfo, GcpPlatformInfo};

    fn aws_platform(region: &str) -> PlatformStatus {
        PlatformStatus {
            platform: PlatformType::Aws,
            infrastructure_name: "test-cluster-x7f2".into(),
            aws: Some(AwsPlatformInfo {
                region: region.into(),
            }),
            gcp: None,
            azure: None,
        }
    }

    fn gcp_platform() -> PlatformStatus {
        PlatformStatus {
            platform: PlatformType::Gcp,
            infrastructure_name: "test-cluster-x7f2".into(),
            aws: None,
            gcp: Some(GcpPlatformInfo {
                region: "us-central1".into(),
                project_id: "test-project".into(),
            }),
            azure: None,
        }
    }

    #[test]
    fn test_aws_deployment_uses_env_credentials_and_aws_plugin() {
        let cfg = OperatorConfig::default();
        let deployment = velero_deployment("managed-backup", &aws_platform("us-east-2"), &cfg);

        let pod = deployment.spec.unwrap().template.spec.unwrap();
        let plugin = &pod.init_containers.as_ref().unwrap()[0];
        assert_eq!(
            plugin.image.as_deref(),
            Some("docker.io/velero/velero-plugin-for-aws:v1.0.1")
        );

        let server = &pod.containers[0];
        let env_names: Vec<_> = server
            .env
            .as_ref()
            .unwrap()
            .iter()
            .map(|e| e.name.as_str())
            .collect();
        assert!(env_names.contains(&"AWS_ACCESS_KEY_ID"));
        assert!(env_names.contains(&"AWS_SECRET_ACCESS_KEY"));
        // No credentials volume on AWS
        assert_eq!(pod.volumes.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn test_china_region_uses_mirror_registry() {
        let cfg = OperatorConfig::default();
        let deployment = velero_deployment("managed-backup", &aws_platform("cn-north-1"), &cfg);

        let pod = deployment.spec.unwrap().template.spec.unwrap();
        let image = pod.containers[0].image.as_deref().unwrap();
        assert!(image.starts_with("registry.docker-cn.com/velero/"));
    }

    #[test]
    fn test_gcp_deployment_mounts_credentials_volume() {
        let cfg = OperatorConfig::default();
        let deployment = velero_deployment("managed-backup", &gcp_platform(), &cfg);

        let pod = deployment.spec.unwrap().template.spec.unwrap();
        let volumes = pod.volumes.as_ref().unwrap();
        assert!(volumes.iter().any(|v| v.name == "cloud-credentials"));

        let server = &pod.containers[0];
        assert!(server
            .env
            .as_ref()
            .unwrap()
            .iter()
            .any(|e| e.name == "GOOGLE_APPLICATION_CREDENTIALS"));
        assert!(server
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .any(|m| m.mount_path == "/credentials"));
    }

    #[test]
    fn test_image_bump_is_detected_as_drift() {
        let cfg = OperatorConfig::default();
        let platform = aws_platform("us-east-2");
        let observed = velero_deployment("managed-backup", &platform, &cfg);

        let mut bumped = cfg.clone();
        bumped.velero_image_tag = "velero:v1.4.0".to_string();
        let desired = velero_deployment("managed-backup", &platform, &bumped);

        assert!(!deployment_specs_equal(&observed, &desired));
        assert!(deployment_specs_equal(
            &observed,
            &velero_deployment("managed-backup", &platform, &cfg)
        ));
    }
}
