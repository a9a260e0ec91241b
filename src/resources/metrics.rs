//! Metrics service and scrape record
//!
//! The metrics service fronts the Velero deployment's metrics port and is
//! derived from the deployment's pod labels. The ServiceMonitor is
//! generated from the *observed* service, because its selector needs the
//! labels the object store actually holds.

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::config::OperatorConfig;
use crate::crd::{ServiceMonitor, ServiceMonitorEndpoint, ServiceMonitorSelector, ServiceMonitorSpec};
use crate::resources::deployment::{deployment_labels, METRICS_PORT};

/// Desired metrics service, selecting the deployment's pods
pub fn metrics_service(namespace: &str, config: &OperatorConfig) -> Service {
    let labels = deployment_labels(config);

    Service {
        metadata: ObjectMeta {
            name: Some(config.metrics_service_name()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(labels),
            ports: Some(vec![ServicePort {
                name: Some("metrics".to_string()),
                port: METRICS_PORT,
                target_port: Some(IntOrString::String("metrics".to_string())),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

/// Copy the fields only the object store can assign from the observed
/// service into the desired one, so they never read as drift.
pub fn adopt_service_fields(desired: &mut Service, observed: &Service) {
    let Some(observed_spec) = observed.spec.as_ref() else {
        return;
    };
    let desired_spec = desired.spec.get_or_insert_with(Default::default);

    desired_spec.cluster_ip = observed_spec.cluster_ip.clone();
    desired_spec.cluster_ips = observed_spec.cluster_ips.clone();
    desired_spec.ip_families = observed_spec.ip_families.clone();
    desired_spec.ip_family_policy = observed_spec.ip_family_policy.clone();
    desired_spec.internal_traffic_policy = observed_spec.internal_traffic_policy.clone();
    desired_spec.session_affinity = observed_spec.session_affinity.clone();
}

/// Services compare by spec equality after store-assigned fields have
/// been adopted
pub fn service_specs_equal(observed: &Service, desired: &Service) -> bool {
    observed.spec == desired.spec
}

/// One scrape endpoint per named service port
pub fn populate_endpoints_from_service_ports(service: &Service) -> Vec<ServiceMonitorEndpoint> {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .filter_map(|port| port.name.clone())
                .map(|port| ServiceMonitorEndpoint { port })
                .collect()
        })
        .unwrap_or_default()
}

/// Generate the scrape record for an observed service: same name and
/// namespace, selector matching the service's labels, one endpoint per
/// port.
pub fn generate_service_monitor(service: &Service) -> ServiceMonitor {
    let labels = service.labels().clone();

    let mut monitor = ServiceMonitor::new(
        &service.name_any(),
        ServiceMonitorSpec {
            selector: ServiceMonitorSelector {
                match_labels: labels.clone(),
            },
            endpoints: populate_endpoints_from_service_ports(service),
        },
    );
    monitor.metadata.namespace = service.namespace();
    monitor.metadata.labels = Some(labels);
    monitor
}

/// Scrape records compare by plain spec equality
pub fn service_monitor_specs_equal(observed: &ServiceMonitor, desired: &ServiceMonitor) -> bool {
    observed.spec == desired.spec
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn example_service() -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("example".to_string()),
                namespace: Some("default".to_string()),
                labels: Some(BTreeMap::from([
                    ("app".to_string(), "web".to_string()),
                    ("env".to_string(), "production".to_string()),
                ])),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(BTreeMap::from([("app".to_string(), "web".to_string())])),
                ports: Some(vec![ServicePort {
                    name: Some("https".to_string()),
                    port: 443,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            status: None,
        }
    }

    #[test]
    fn test_generate_service_monitor_mirrors_labels() {
        let service = example_service();
        let monitor = generate_service_monitor(&service);

        assert_eq!(monitor.metadata.labels.as_ref(), service.metadata.labels.as_ref());
        assert_eq!(
            &monitor.spec.selector.match_labels,
            service.metadata.labels.as_ref().unwrap()
        );
        assert_eq!(monitor.metadata.name.as_deref(), Some("example"));
        assert_eq!(monitor.metadata.namespace.as_deref(), Some("default"));
    }

    #[test]
    fn test_populate_endpoints_from_service_ports() {
        let mut service = example_service();
        let endpoints = populate_endpoints_from_service_ports(&service);
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].port, "https");

        // Two ports yield two endpoints, matched by name
        if let Some(spec) = service.spec.as_mut() {
            spec.ports = Some(vec![
                ServicePort {
                    name: Some("http".to_string()),
                    port: 80,
                    ..Default::default()
                },
                ServicePort {
                    name: Some("https".to_string()),
                    port: 443,
                    ..Default::default()
                },
            ]);
        }
        let endpoints = populate_endpoints_from_service_ports(&service);
        let names: Vec<_> = endpoints.iter().map(|e| e.port.as_str()).collect();
        assert_eq!(names, vec!["http", "https"]);
    }

    #[test]
    fn test_store_assigned_fields_do_not_trigger_drift() {
        let cfg = OperatorConfig::default();
        let mut desired = metrics_service("managed-backup", &cfg);
        let mut observed = desired.clone();

        // The apiserver allocated addresses on the observed object
        if let Some(spec) = observed.spec.as_mut() {
            spec.cluster_ip = Some("172.30.0.17".to_string());
            spec.cluster_ips = Some(vec!["172.30.0.17".to_string()]);
            spec.ip_families = Some(vec!["IPv4".to_string()]);
            spec.session_affinity = Some("None".to_string());
        }

        assert!(!service_specs_equal(&observed, &desired));
        adopt_service_fields(&mut desired, &observed);
        assert!(service_specs_equal(&observed, &desired));
    }
}
