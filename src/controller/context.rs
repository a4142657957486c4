//! State shared by every reconcile pass.

use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use tracing::warn;

use super::events::{EventKind, EventSink};
use crate::client::{ClusterState, KubeClusterState};
use crate::crd::VerticaDB;
use crate::health::HealthState;

/// Name the operator reports as in events and field ownership.
pub const FIELD_MANAGER: &str = "vertica-operator";

/// Handed to the controller once and cloned into each pass.
#[derive(Clone)]
pub struct Context {
    pub client: Client,
    pub state: Arc<dyn ClusterState>,
    recorder: Recorder,
    pub health_state: Option<Arc<HealthState>>,
}

impl Context {
    pub fn new(client: Client, health_state: Option<Arc<HealthState>>) -> Self {
        let reporter = Reporter {
            controller: FIELD_MANAGER.into(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            state: Arc::new(KubeClusterState::new(client.clone())),
            recorder: Recorder::new(client.clone(), reporter),
            client,
            health_state,
        }
    }
}

/// Events go out through the Kubernetes recorder. A failed publish is only
/// logged; it never fails the pass.
#[async_trait]
impl EventSink for Context {
    async fn event(&self, vdb: &VerticaDB, kind: EventKind, reason: &str, message: String) {
        let event = Event {
            type_: match kind {
                EventKind::Normal => EventType::Normal,
                EventKind::Warning => EventType::Warning,
            },
            reason: reason.to_string(),
            note: Some(message),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &vdb.object_ref(&())).await {
            warn!(reason, error = %e, "dropping event");
        }
    }
}
