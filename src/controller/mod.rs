//! Instance coordinator
//!
//! Entry point for every reconcile trigger: load the instance, resolve the
//! platform, select the storage driver, and decide whether this pass runs
//! the bucket lifecycle machine or the dependent-resource sweep. A pass is
//! always single-purpose so its side effects stay easy to reason about.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use prometheus::IntCounter;
use tracing::{debug, info, warn};

use crate::config::OperatorConfig;
use crate::crd::{
    BackupInstall, BackupStorageLocation, CredentialsRequest, ServiceMonitor,
    VolumeSnapshotLocation,
};
use crate::error::{Error, ErrorAction, Result};
use crate::platform::resolve_platform;
use crate::resources::reconcile_resources;
use crate::storage::new_driver;

/// Fallback requeue for retryable errors
const ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Shared state handed to every reconcile pass
pub struct Coordinator {
    client: Client,
    config: Arc<OperatorConfig>,
    passes_total: IntCounter,
    failures_total: IntCounter,
}

impl Coordinator {
    pub fn new(client: Client, config: Arc<OperatorConfig>) -> Result<Self> {
        let passes_total = prometheus::register_int_counter!(
            "managed_backup_reconcile_passes_total",
            "Total number of reconcile passes"
        )
        .map_err(|e| Error::Internal(e.to_string()))?;
        let failures_total = prometheus::register_int_counter!(
            "managed_backup_reconcile_failures_total",
            "Total number of failed reconcile passes"
        )
        .map_err(|e| Error::Internal(e.to_string()))?;

        Ok(Self {
            client,
            config,
            passes_total,
            failures_total,
        })
    }
}

/// One reconcile pass for a BackupInstall
pub async fn reconcile(
    instance: Arc<BackupInstall>,
    ctx: Arc<Coordinator>,
) -> std::result::Result<Action, Error> {
    ctx.passes_total.inc();

    let name = instance.name_any();
    let namespace = instance
        .namespace()
        .unwrap_or_else(|| ctx.config.namespace.clone());
    info!(namespace = %namespace, name = %name, "Reconciling backup installation");

    // Re-fetch by key: the instance may have been deleted since the
    // trigger fired, and owned objects cascade away on their own
    let api: Api<BackupInstall> = Api::namespaced(ctx.client.clone(), &namespace);
    let Some(mut instance) = api.get_opt(&name).await? else {
        debug!(name = %name, "Instance gone, nothing to do");
        return Ok(Action::await_change());
    };

    // Resolve where the cluster runs
    let platform = resolve_platform(ctx.client.clone()).await?;
    platform.validate()?;
    instance.initialize_status(platform.platform);

    // Select the storage driver for the platform
    let driver = new_driver(ctx.client.clone(), &platform, ctx.config.clone()).await?;

    // Bucket work and resource work never share a pass. The bucket
    // machine persists status, which triggers the next pass.
    if instance.bucket_reconcile_required(platform.platform, ctx.config.reconcile_period) {
        driver.create_storage(&mut instance).await?;
        return Ok(Action::requeue(ctx.config.reconcile_period));
    }

    reconcile_resources(
        ctx.client.clone(),
        &namespace,
        &platform,
        &instance,
        &ctx.config,
    )
    .await?;

    Ok(Action::requeue(ctx.config.reconcile_period))
}

/// Map the error taxonomy onto requeue decisions
pub fn error_policy(
    _instance: Arc<BackupInstall>,
    err: &Error,
    ctx: Arc<Coordinator>,
) -> Action {
    ctx.failures_total.inc();
    warn!(error = %err, "Reconcile pass failed");

    match err.action() {
        ErrorAction::RequeueWithBackoff => Action::requeue(ERROR_REQUEUE),
        ErrorAction::RequeueAfter(duration) => Action::requeue(duration),
        // Nothing productive until the external environment changes
        ErrorAction::NoRequeue => Action::await_change(),
    }
}

/// Start the controller and block until the watch stream ends
pub async fn run(client: Client, config: Arc<OperatorConfig>) -> Result<()> {
    let namespace = config.namespace.clone();
    let instances: Api<BackupInstall> = Api::namespaced(client.clone(), &namespace);
    let ctx = Arc::new(Coordinator::new(client.clone(), config)?);

    info!(namespace = %namespace, "Starting backup install controller");

    Controller::new(instances, watcher::Config::default())
        .owns(
            Api::<BackupStorageLocation>::namespaced(client.clone(), &namespace),
            watcher::Config::default(),
        )
        .owns(
            Api::<VolumeSnapshotLocation>::namespaced(client.clone(), &namespace),
            watcher::Config::default(),
        )
        .owns(
            Api::<CredentialsRequest>::namespaced(client.clone(), &namespace),
            watcher::Config::default(),
        )
        .owns(
            Api::<Deployment>::namespaced(client.clone(), &namespace),
            watcher::Config::default(),
        )
        .owns(
            Api::<Service>::namespaced(client.clone(), &namespace),
            watcher::Config::default(),
        )
        .owns(
            Api::<ServiceMonitor>::namespaced(client.clone(), &namespace),
            watcher::Config::default(),
        )
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!(object = %object.name, "Reconcile pass complete"),
                Err(err) => warn!(error = %err, "Controller runtime error"),
            }
        })
        .await;

    Ok(())
}
