//! Kubernetes operator for Vertica databases.
//!
//! The controller watches `VerticaDB` resources and drives each one toward
//! its spec by running an ordered list of actors per reconcile pass (see
//! [`controller::pipeline`]). Pod state is gathered into [`podfacts`], the
//! objects the operator owns are generated in [`resources`], and everything
//! that talks to the API server or to a Vertica pod sits behind the traits in
//! [`client`].

pub mod client;
pub mod controller;
pub mod crd;
pub mod health;
pub mod podfacts;
pub mod resources;

pub use health::HealthState;

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::controller::Error as ControllerError;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{Controller, WatchStreamExt, metadata_watcher, predicates, reflector, watcher};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info};

use controller::context::Context;
use controller::error::Error;
use controller::pipeline::{error_policy, reconcile};
use crd::VerticaDB;
use crd::annotations::{MANAGED_BY_LABEL, OPERATOR_NAME, VDB_INSTANCE_LABEL};

/// Environment variable restricting the controller to one namespace.
pub const WATCH_NAMESPACE_ENV: &str = "WATCH_NAMESPACE";

/// `Api` over one namespace, or over all of them when `namespace` is `None`.
pub fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + std::fmt::Debug,
    <T as Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Namespace to watch, from `WATCH_NAMESPACE`. Unset or empty means all.
pub fn watch_namespace() -> Option<String> {
    std::env::var(WATCH_NAMESPACE_ENV)
        .ok()
        .filter(|ns| !ns.is_empty())
}

/// The VerticaDB a pod belongs to, read from its labels.
///
/// Pods are owned by StatefulSets, not by the VerticaDB, so they are mapped
/// back through the instance label instead of owner references.
pub fn vdb_for_pod(meta: &ObjectMeta) -> Option<ObjectRef<VerticaDB>> {
    let labels = meta.labels.as_ref()?;
    if labels.get(MANAGED_BY_LABEL).map(String::as_str) != Some(OPERATOR_NAME) {
        return None;
    }
    let name = labels.get(VDB_INSTANCE_LABEL)?;
    let namespace = meta.namespace.as_deref()?;
    Some(ObjectRef::new(name).within(namespace))
}

/// Run the controller over the namespace named by `WATCH_NAMESPACE`, or the
/// whole cluster. Returns only if the watch streams end.
pub async fn run_controller(client: Client, health_state: Option<Arc<HealthState>>) {
    let namespace = watch_namespace();
    run_controller_scoped(client, health_state, namespace.as_deref()).await
}

/// Run the controller, watching only `namespace` when one is given.
pub async fn run_controller_scoped(
    client: Client,
    health_state: Option<Arc<HealthState>>,
    namespace: Option<&str>,
) {
    info!(
        scope = namespace.unwrap_or("cluster-wide"),
        "watching VerticaDB resources"
    );
    if let Some(state) = &health_state {
        state.set_ready(true);
    }
    let ctx = Arc::new(Context::new(client.clone(), health_state));

    let config = WatcherConfig::default().any_semantic();
    let owned_pods = config
        .clone()
        .labels(&format!("{MANAGED_BY_LABEL}={OPERATOR_NAME}"));

    // Status writes bump no generation, so they do not retrigger a pass.
    let (store, writer) = reflector::store();
    let vdb_api = scoped_api::<VerticaDB>(client.clone(), namespace);
    let vdbs = reflector(writer, watcher(vdb_api, config.clone()))
        .default_backoff()
        .applied_objects()
        .predicate_filter(predicates::generation);

    // Replica counts of the StatefulSets feed pod facts, so they are watched
    // in full. Services only need to exist. Pods are not owned by the
    // VerticaDB and map back to it through labels.
    let services = metadata_watcher(
        scoped_api::<Service>(client.clone(), namespace),
        config.clone(),
    );
    let pods = metadata_watcher(scoped_api::<Pod>(client.clone(), namespace), owned_pods);
    Controller::for_stream(vdbs, store)
        .owns(scoped_api::<StatefulSet>(client, namespace), config)
        .owns_stream(services.touched_objects())
        .watches_stream(pods.touched_objects(), |pod| vdb_for_pod(&pod.metadata))
        .run(reconcile, error_policy, ctx)
        .for_each(|outcome| async move {
            match outcome {
                Ok((vdb, _)) => debug!(vdb = %vdb.name, "pass finished"),
                Err(e) if is_gone(&e) => debug!(error = ?e, "VerticaDB is gone"),
                Err(e) => error!(error = ?e, "pass failed"),
            }
        })
        .await;

    error!("controller stream ended");
}

/// A trigger for a VerticaDB that was deleted in the meantime.
fn is_gone(e: &ControllerError<Error, watcher::Error>) -> bool {
    match e {
        ControllerError::ObjectNotFound(_) => true,
        ControllerError::ReconcilerFailed(err, _) => err.is_not_found(),
        _ => false,
    }
}
