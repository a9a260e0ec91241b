//! Dependent resource reconciliation
//!
//! Computes the desired spec for every resource the Velero installation
//! needs and applies the generic create-or-update protocol to each, in a
//! fixed order: backup location, snapshot location, credential request,
//! deployment, metrics service, scrape record. Later kinds depend on
//! earlier ones' identity.

pub mod apply;
pub mod credreq;
pub mod deployment;
pub mod locations;
pub mod metrics;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::{Api, Client, Resource};
use tracing::{info, warn};

use crate::config::OperatorConfig;
use crate::crd::{BackupInstall, BackupStorageLocation, CredentialsRequest, ServiceMonitor, VolumeSnapshotLocation};
use crate::error::{Error, Result};
use crate::platform::PlatformStatus;

use apply::{reconcile_resource, Applied};

/// Reconcile every dependent resource for the instance.
///
/// Runs only when the bucket machine is settled; the bucket name is read
/// from the instance status the storage driver persisted.
pub async fn reconcile_resources(
    client: Client,
    namespace: &str,
    platform: &PlatformStatus,
    instance: &BackupInstall,
    config: &OperatorConfig,
) -> Result<()> {
    let owner = instance.controller_owner_ref(&());
    let bucket = instance
        .storage_bucket(platform.platform)
        .map(|bucket| bucket.name.clone())
        .unwrap_or_default();

    // A credential-request payload that fails to decode poisons only that
    // resource; the remaining kinds still reconcile before the error is
    // surfaced.
    let mut deferred: Option<Error> = None;

    // Backup storage location
    let bsl_api: Api<BackupStorageLocation> = Api::namespaced(client.clone(), namespace);
    reconcile_resource(
        &bsl_api,
        &config.default_backup_location,
        locations::backup_storage_location(namespace, platform, &bucket, config),
        owner.as_ref(),
        |_, _| {},
        |observed, desired| Ok(locations::bsl_specs_equal(observed, desired)),
        |observed, desired| observed.spec = desired.spec.clone(),
    )
    .await?;

    // Volume snapshot location
    let vsl_api: Api<VolumeSnapshotLocation> = Api::namespaced(client.clone(), namespace);
    reconcile_resource(
        &vsl_api,
        &config.default_backup_location,
        locations::volume_snapshot_location(namespace, platform, config),
        owner.as_ref(),
        |_, _| {},
        |observed, desired| Ok(locations::vsl_specs_equal(observed, desired)),
        |observed, desired| observed.spec = desired.spec.clone(),
    )
    .await?;

    // Credential request
    let platform_type = platform.platform;
    let credreq_api: Api<CredentialsRequest> = Api::namespaced(client.clone(), namespace);
    let outcome = reconcile_resource(
        &credreq_api,
        &config.credentials_request_name,
        credreq::credentials_request(namespace, platform, &bucket, config)?,
        owner.as_ref(),
        |_, _| {},
        move |observed, desired| {
            credreq::credentials_specs_equal(&observed.spec, &desired.spec, platform_type)
        },
        |observed, desired| observed.spec = desired.spec.clone(),
    )
    .await;
    match outcome {
        Ok(_) => {}
        Err(err @ Error::SpecDecode { .. }) => {
            warn!(error = %err, "Skipping credential request reconciliation");
            deferred = Some(err);
        }
        Err(err) => return Err(err),
    }

    // Velero deployment
    let deployment_api: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    reconcile_resource(
        &deployment_api,
        &config.deployment_name,
        deployment::velero_deployment(namespace, platform, config),
        owner.as_ref(),
        |_, _| {},
        |observed, desired| Ok(deployment::deployment_specs_equal(observed, desired)),
        |observed, desired| observed.spec = desired.spec.clone(),
    )
    .await?;

    // Metrics service
    let service_name = config.metrics_service_name();
    let service_api: Api<Service> = Api::namespaced(client.clone(), namespace);
    let applied = reconcile_resource(
        &service_api,
        &service_name,
        metrics::metrics_service(namespace, config),
        owner.as_ref(),
        metrics::adopt_service_fields,
        |observed, desired| Ok(metrics::service_specs_equal(observed, desired)),
        |observed, desired| observed.spec = desired.spec.clone(),
    )
    .await?;

    // The scrape record needs the identity the object store assigned to
    // the service at creation, so a freshly created service ends the pass
    if applied == Applied::Created {
        info!("Metrics service created, scrape record reconciles on the next pass");
        return deferred.map_or(Ok(()), Err);
    }

    // Scrape record, generated from the observed service
    let observed_service = service_api.get(&service_name).await?;
    let monitor_api: Api<ServiceMonitor> = Api::namespaced(client, namespace);
    reconcile_resource(
        &monitor_api,
        &service_name,
        metrics::generate_service_monitor(&observed_service),
        owner.as_ref(),
        |_, _| {},
        |observed, desired| Ok(metrics::service_monitor_specs_equal(observed, desired)),
        |observed, desired| observed.spec = desired.spec.clone(),
    )
    .await?;

    deferred.map_or(Ok(()), Err)
}
