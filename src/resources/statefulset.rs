//! StatefulSet generation for Vertica subclusters.
//!
//! Each subcluster is backed by one StatefulSet:
//! - Stable network identity via the headless service
//! - A `local-data` PVC per pod for catalog, data and depot
//! - The server container plus, in sidecar mode, the node management agent
//! - Parallel pod management so a whole subcluster schedules at once

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, ObjectFieldSelector, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Probe, TCPSocketAction, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::controller::config::PassConfig;
use crate::crd::annotations::{NMA_CONTAINER, SERVER_CONTAINER};
use crate::crd::{Subcluster, VerticaDB};
use crate::resources::common::{
    LOCAL_DATA_PVC, headless_service_name, owner_reference, standard_annotations,
    standard_labels, statefulset_name, statefulset_selector_labels,
};

/// Vertica client port
pub const CLIENT_PORT: i32 = 5433;
/// Internal communication between vertica nodes
const INTERNAL_PORT: i32 = 5434;
/// HTTPS service used by vclusterops
pub const HTTPS_PORT: i32 = 8443;
/// Node management agent
pub const NMA_PORT: i32 = 5554;

const NMA_BIN: &str = "/opt/vertica/bin/node_management_agent";
const LOCAL_DATA_MOUNT: &str = "/home/dbadmin/local-data";

/// Image a subcluster should run: its override, else the image of its scope.
pub fn pick_image<'a>(vdb: &'a VerticaDB, sc: &'a Subcluster) -> &'a str {
    match sc.image_override.as_deref() {
        Some(img) if !img.is_empty() => img,
        _ => vdb.image_for_scope(&vdb.scope_of_subcluster(&sc.name)),
    }
}

/// Generate the StatefulSet for a subcluster.
pub fn generate_statefulset(vdb: &VerticaDB, sc: &Subcluster, cfg: &PassConfig) -> StatefulSet {
    let labels = standard_labels(vdb, Some(sc));
    let annotations = standard_annotations(vdb);

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(statefulset_name(vdb, sc)),
            namespace: Some(vdb.namespace_or_default()),
            labels: Some(labels.clone()),
            annotations: if annotations.is_empty() {
                None
            } else {
                Some(annotations.clone())
            },
            owner_references: Some(vec![owner_reference(vdb)]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(if sc.shutdown { 0 } else { sc.size }),
            service_name: Some(headless_service_name(vdb)),
            selector: LabelSelector {
                match_labels: Some(statefulset_selector_labels(vdb, sc)),
                ..Default::default()
            },
            pod_management_policy: Some("Parallel".to_string()),
            update_strategy: Some(update_strategy(cfg)),
            template: generate_pod_template(vdb, sc, cfg, labels, annotations),
            volume_claim_templates: Some(vec![generate_pvc_template(vdb)]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// With k-safety 0 one pod going down takes every other pod with it, so a
/// rolling update cannot make progress.
fn update_strategy(cfg: &PassConfig) -> StatefulSetUpdateStrategy {
    let type_ = if cfg.k_safety == 0 {
        "OnDelete"
    } else {
        "RollingUpdate"
    };
    StatefulSetUpdateStrategy {
        type_: Some(type_.to_string()),
        ..Default::default()
    }
}

fn generate_pod_template(
    vdb: &VerticaDB,
    sc: &Subcluster,
    cfg: &PassConfig,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
) -> PodTemplateSpec {
    let mut containers = vec![generate_server_container(vdb, sc, cfg)];
    if cfg.uses_vclusterops() && cfg.nma_sidecar {
        containers.push(generate_nma_container(vdb, sc));
    }
    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels),
            annotations: if annotations.is_empty() {
                None
            } else {
                Some(annotations)
            },
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers,
            node_selector: if sc.node_selector.is_empty() {
                None
            } else {
                Some(sc.node_selector.clone())
            },
            service_account_name: vdb.spec.service_account_name.clone(),
            termination_grace_period_seconds: Some(0),
            ..Default::default()
        }),
    }
}

fn generate_server_container(vdb: &VerticaDB, sc: &Subcluster, cfg: &PassConfig) -> Container {
    let mut ports = vec![
        ContainerPort {
            container_port: CLIENT_PORT,
            name: Some("vertica".to_string()),
            ..Default::default()
        },
        ContainerPort {
            container_port: INTERNAL_PORT,
            name: Some("vertica-int".to_string()),
            ..Default::default()
        },
    ];
    if cfg.uses_vclusterops() {
        ports.push(ContainerPort {
            container_port: HTTPS_PORT,
            name: Some("vertica-http".to_string()),
            ..Default::default()
        });
    }
    Container {
        name: SERVER_CONTAINER.to_string(),
        image: Some(pick_image(vdb, sc).to_string()),
        image_pull_policy: vdb.spec.image_pull_policy.clone(),
        ports: Some(ports),
        env: Some(generate_env_vars(vdb, cfg)),
        volume_mounts: Some(generate_volume_mounts()),
        readiness_probe: Some(tcp_socket_check(CLIENT_PORT, 5, 10)),
        liveness_probe: Some(tcp_socket_check(CLIENT_PORT, 30, 30)),
        ..Default::default()
    }
}

fn generate_nma_container(vdb: &VerticaDB, sc: &Subcluster) -> Container {
    Container {
        name: NMA_CONTAINER.to_string(),
        image: Some(pick_image(vdb, sc).to_string()),
        image_pull_policy: vdb.spec.image_pull_policy.clone(),
        command: Some(vec![NMA_BIN.to_string()]),
        ports: Some(vec![ContainerPort {
            container_port: NMA_PORT,
            name: Some("nma".to_string()),
            ..Default::default()
        }]),
        volume_mounts: Some(generate_volume_mounts()),
        readiness_probe: Some(tcp_socket_check(NMA_PORT, 5, 10)),
        ..Default::default()
    }
}

fn field_ref(name: &str, path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn value(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn generate_env_vars(vdb: &VerticaDB, cfg: &PassConfig) -> Vec<EnvVar> {
    vec![
        field_ref("POD_IP", "status.podIP"),
        field_ref("HOST_IP", "status.hostIP"),
        field_ref("HOST_NODENAME", "spec.nodeName"),
        value("DATA_PATH", &vdb.spec.local.data_path),
        value("DEPOT_PATH", &vdb.spec.local.depot_path),
        value("CATALOG_PATH", vdb.spec.local.catalog_path()),
        value("DATABASE_NAME", &vdb.spec.db_name),
        value("VSQL_USER", &cfg.superuser),
    ]
}

fn generate_volume_mounts() -> Vec<VolumeMount> {
    vec![VolumeMount {
        name: LOCAL_DATA_PVC.to_string(),
        mount_path: LOCAL_DATA_MOUNT.to_string(),
        ..Default::default()
    }]
}

fn tcp_socket_check(port: i32, period: i32, initial_delay: i32) -> Probe {
    Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::Int(port),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(period),
        timeout_seconds: Some(5),
        failure_threshold: Some(3),
        ..Default::default()
    }
}

fn generate_pvc_template(vdb: &VerticaDB) -> PersistentVolumeClaim {
    let mut requests = BTreeMap::new();
    requests.insert(
        "storage".to_string(),
        Quantity(vdb.spec.local.request_size.clone()),
    );
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(LOCAL_DATA_PVC.to_string()),
            owner_references: Some(vec![owner_reference(vdb)]),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: vdb.spec.local.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// ============================================================================
// Inspection helpers
// ============================================================================

fn containers(sts: &StatefulSet) -> &[Container] {
    sts.spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .map(|p| p.containers.as_slice())
        .unwrap_or_default()
}

/// Image of the server container in the pod template.
pub fn server_image(sts: &StatefulSet) -> Option<&str> {
    containers(sts)
        .iter()
        .find(|c| c.name == SERVER_CONTAINER)
        .and_then(|c| c.image.as_deref())
}

/// True if the pod template runs the node management agent as a sidecar.
pub fn has_nma_container(sts: &StatefulSet) -> bool {
    containers(sts).iter().any(|c| c.name == NMA_CONTAINER)
}

pub fn replicas(sts: &StatefulSet) -> i32 {
    sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0)
}

/// Replace the image of every container in the template. Returns true if
/// anything changed.
pub fn set_template_image(sts: &mut StatefulSet, image: &str) -> bool {
    let Some(pod_spec) = sts.spec.as_mut().and_then(|s| s.template.spec.as_mut()) else {
        return false;
    };
    let mut changed = false;
    for c in &mut pod_spec.containers {
        if c.image.as_deref() != Some(image) {
            c.image = Some(image.to_string());
            changed = true;
        }
    }
    changed
}

/// Switch the update strategy to OnDelete. Returns true if it changed.
pub fn set_on_delete(sts: &mut StatefulSet) -> bool {
    let Some(spec) = sts.spec.as_mut() else {
        return false;
    };
    let current = spec.update_strategy.as_ref().and_then(|u| u.type_.as_deref());
    if current == Some("OnDelete") {
        return false;
    }
    spec.update_strategy = Some(StatefulSetUpdateStrategy {
        type_: Some("OnDelete".to_string()),
        ..Default::default()
    });
    true
}
