//! Common resource generation utilities.
//!
//! Object names, labels, annotations and owner references shared by every
//! object the operator creates for a VerticaDB.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;

use crate::client::PodName;
use crate::crd::annotations::{
    CLIENT_ROUTING_LABEL, CLIENT_ROUTING_VALUE, MANAGED_BY_LABEL, OPERATOR_NAME, SANDBOX_LABEL,
    SUBCLUSTER_NAME_LABEL, SUBCLUSTER_SVC_NAME_LABEL, SUBCLUSTER_TRANSIENT_LABEL,
    SUBCLUSTER_TYPE_LABEL, VDB_INSTANCE_LABEL,
};
use crate::crd::{Subcluster, VerticaDB};

/// Name of the per-pod PVC template.
pub const LOCAL_DATA_PVC: &str = "local-data";

// ============================================================================
// Names
// ============================================================================

/// Headless service shared by every pod of the database.
pub fn headless_service_name(vdb: &VerticaDB) -> String {
    vdb.name_any()
}

/// StatefulSet backing a subcluster.
pub fn statefulset_name(vdb: &VerticaDB, sc: &Subcluster) -> String {
    format!("{}-{}", vdb.name_any(), sc.fqdn_name())
}

/// Client-facing service for a subcluster. Subclusters may share one.
pub fn external_service_name(vdb: &VerticaDB, sc: &Subcluster) -> String {
    format!("{}-{}", vdb.name_any(), sc.service_name())
}

pub fn pod_name(vdb: &VerticaDB, sc: &Subcluster, index: i32) -> PodName {
    PodName::new(
        vdb.namespace_or_default(),
        format!("{}-{index}", statefulset_name(vdb, sc)),
    )
}

/// Stable DNS name of a pod behind the headless service.
pub fn pod_dns_name(vdb: &VerticaDB, pod: &PodName) -> String {
    format!("{}.{}.{}", pod.name, headless_service_name(vdb), pod.namespace)
}

// ============================================================================
// Labels and annotations
// ============================================================================

/// Labels every object created for `vdb` carries, including pods.
pub fn operator_labels(vdb: &VerticaDB) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), OPERATOR_NAME.to_string());
    labels.insert("app.kubernetes.io/name".to_string(), "vertica".to_string());
    labels.insert(VDB_INSTANCE_LABEL.to_string(), vdb.name_any());
    labels.insert(
        "app.kubernetes.io/component".to_string(),
        "database".to_string(),
    );
    labels.insert("vertica.com/database".to_string(), vdb.spec.db_name.clone());
    labels
}

/// Labels that identify a subcluster and its scope.
pub fn subcluster_labels(vdb: &VerticaDB, sc: &Subcluster) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(SUBCLUSTER_NAME_LABEL.to_string(), sc.name.clone());
    labels.insert(SUBCLUSTER_TYPE_LABEL.to_string(), sc.r#type.to_string());
    labels.insert(
        SUBCLUSTER_TRANSIENT_LABEL.to_string(),
        sc.is_transient().to_string(),
    );
    // Transient subclusters take traffic for every service during an upgrade.
    if !sc.is_transient() {
        labels.insert(SUBCLUSTER_SVC_NAME_LABEL.to_string(), sc.service_name());
    }
    if let Some(sandbox) = vdb.scope_of_subcluster(&sc.name).sandbox_name() {
        labels.insert(SANDBOX_LABEL.to_string(), sandbox.to_string());
    }
    labels
}

/// Standard labels applied to all managed resources, merged with the
/// user-supplied labels from the spec.
pub fn standard_labels(vdb: &VerticaDB, sc: Option<&Subcluster>) -> BTreeMap<String, String> {
    let mut labels = operator_labels(vdb);
    if let Some(sc) = sc {
        labels.extend(subcluster_labels(vdb, sc));
    }
    for (key, value) in &vdb.spec.labels {
        labels.insert(key.clone(), value.clone());
    }
    labels
}

/// Annotations copied from the spec onto every object.
pub fn standard_annotations(vdb: &VerticaDB) -> BTreeMap<String, String> {
    vdb.spec.annotations.clone()
}

/// Selector matching every pod of the VerticaDB.
pub fn base_selector_labels(vdb: &VerticaDB) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(VDB_INSTANCE_LABEL.to_string(), vdb.name_any());
    labels
}

/// Selector of a subcluster's StatefulSet.
pub fn statefulset_selector_labels(vdb: &VerticaDB, sc: &Subcluster) -> BTreeMap<String, String> {
    let mut labels = base_selector_labels(vdb);
    labels.insert(SUBCLUSTER_NAME_LABEL.to_string(), sc.name.clone());
    labels
}

/// Selector of a subcluster's external service. Only pods that were
/// confirmed to own shards carry the client-routing label.
pub fn service_selector_labels(vdb: &VerticaDB, sc: &Subcluster) -> BTreeMap<String, String> {
    let mut labels = base_selector_labels(vdb);
    labels.insert(SUBCLUSTER_SVC_NAME_LABEL.to_string(), sc.service_name());
    labels.insert(
        CLIENT_ROUTING_LABEL.to_string(),
        CLIENT_ROUTING_VALUE.to_string(),
    );
    labels
}

/// Create owner reference for a VerticaDB
pub fn owner_reference(vdb: &VerticaDB) -> OwnerReference {
    OwnerReference {
        api_version: "vertica.com/v1".to_string(),
        kind: "VerticaDB".to_string(),
        name: vdb.name_any(),
        uid: vdb.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}
