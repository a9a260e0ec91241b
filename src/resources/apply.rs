//! Generic create-or-update protocol
//!
//! Every dependent resource follows the same shape: fetch by its
//! deterministic key, create with an owner reference when absent, or
//! overwrite the whole observed spec when it drifts from the desired one.
//! Equality is an explicit per-kind decision supplied by the caller, never
//! a blind deep-compare, so store-assigned fields and encoded payloads get
//! handled deliberately.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, PostParams};
use kube::core::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use crate::error::Result;

/// What the protocol did to the observed object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Created,
    Updated,
    Unchanged,
}

/// Reconcile one dependent resource toward its desired form.
///
/// `adopt_observed` runs before the comparison and copies fields only the
/// object store can assign (e.g. an allocated cluster IP) from the
/// observed object into the desired one, so they never trigger a spurious
/// update. `specs_equal` decides drift; `overwrite_spec` replaces the
/// entire observed spec with the desired one (full overwrite, not a
/// field-level merge).
///
/// The owner reference is set at creation time only and never re-asserted
/// on update.
pub async fn reconcile_resource<K>(
    api: &Api<K>,
    name: &str,
    mut desired: K,
    owner: Option<&OwnerReference>,
    adopt_observed: impl Fn(&mut K, &K),
    specs_equal: impl Fn(&K, &K) -> Result<bool>,
    overwrite_spec: impl Fn(&mut K, &K),
) -> Result<Applied>
where
    K: Resource<DynamicType = ()> + Clone + std::fmt::Debug + DeserializeOwned + Serialize,
{
    let kind = K::kind(&());

    match api.get_opt(name).await? {
        None => {
            info!(name, "Creating {kind}");
            if let Some(owner) = owner {
                desired
                    .meta_mut()
                    .owner_references
                    .get_or_insert_with(Vec::new)
                    .push(owner.clone());
            }
            api.create(&PostParams::default(), &desired).await?;
            Ok(Applied::Created)
        }
        Some(mut observed) => {
            adopt_observed(&mut desired, &observed);
            if specs_equal(&observed, &desired)? {
                return Ok(Applied::Unchanged);
            }

            info!(name, "Updating {kind}");
            overwrite_spec(&mut observed, &desired);
            api.replace(name, &PostParams::default(), &observed).await?;
            Ok(Applied::Updated)
        }
    }
}
