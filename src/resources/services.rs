//! Service generation for Vertica databases.
//!
//! Creates two kinds of services:
//! - **Headless Service**: one per database, gives every pod a stable DNS name
//! - **External Service**: one per distinct subcluster service name, routes
//!   clients to pods carrying the client-routing label

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::controller::config::PassConfig;
use crate::crd::{Subcluster, VerticaDB};
use crate::resources::common::{
    base_selector_labels, external_service_name, headless_service_name, owner_reference,
    service_selector_labels, standard_annotations, standard_labels,
};
use crate::resources::statefulset::{CLIENT_PORT, HTTPS_PORT, NMA_PORT};

const SPREAD_CLIENT_PORT: i32 = 4803;
const CLUSTER_COMM_PORT: i32 = 5434;
const SSH_PORT: i32 = 22;

const SVC_TYPE_LABEL: &str = "vertica.com/svc-type";

fn port(port: i32, name: &str) -> ServicePort {
    ServicePort {
        port,
        name: Some(name.to_string()),
        ..Default::default()
    }
}

fn metadata(vdb: &VerticaDB, name: String, sc: Option<&Subcluster>, svc_type: &str) -> ObjectMeta {
    let mut labels = standard_labels(vdb, sc);
    labels.insert(SVC_TYPE_LABEL.to_string(), svc_type.to_string());
    let annotations = standard_annotations(vdb);
    ObjectMeta {
        name: Some(name),
        namespace: Some(vdb.namespace_or_default()),
        labels: Some(labels),
        annotations: if annotations.is_empty() {
            None
        } else {
            Some(annotations)
        },
        owner_references: Some(vec![owner_reference(vdb)]),
        ..Default::default()
    }
}

/// Generate the headless Service.
///
/// `publishNotReadyAddresses` is set so pods resolve each other before
/// vertica is up; the database cannot start without it.
pub fn generate_headless_service(vdb: &VerticaDB, cfg: &PassConfig) -> Service {
    let mut ports = vec![
        port(CLUSTER_COMM_PORT, "tcp-verticaclustercomm"),
        port(SPREAD_CLIENT_PORT, "tcp-spreadclient"),
    ];
    if cfg.uses_vclusterops() {
        ports.push(port(HTTPS_PORT, "tcp-httpservice"));
        ports.push(port(NMA_PORT, "tcp-nma"));
    } else {
        ports.push(port(SSH_PORT, "tcp-ssh"));
    }
    Service {
        metadata: metadata(vdb, headless_service_name(vdb), None, "headless"),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            type_: Some("ClusterIP".to_string()),
            publish_not_ready_addresses: Some(true),
            selector: Some(base_selector_labels(vdb)),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the external Service for a subcluster.
pub fn generate_external_service(vdb: &VerticaDB, sc: &Subcluster) -> Service {
    Service {
        metadata: metadata(vdb, external_service_name(vdb, sc), Some(sc), "external"),
        spec: Some(ServiceSpec {
            type_: Some(sc.service_type.clone()),
            selector: Some(service_selector_labels(vdb, sc)),
            ports: Some(vec![
                port(CLIENT_PORT, "vertica"),
                port(HTTPS_PORT, "vertica-http"),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
