//! Fixtures shared by the actor tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::client::{FakeDispatcher, FakePodRunner, MemoryClusterState, PodName};
use crate::controller::actor::{ActorContext, ReconcilePass};
use crate::controller::events::RecordingEventSink;
use crate::crd::{ClusterScope, Subcluster, VerticaDB, VerticaDBSpec};
use crate::podfacts::{PodFact, PodFacts};

pub(crate) struct Harness {
    pub state: Arc<MemoryClusterState>,
    pub runner: Arc<FakePodRunner>,
    pub dispatcher: Arc<FakeDispatcher>,
    pub events: Arc<RecordingEventSink>,
    pub ctx: ActorContext,
}

impl Harness {
    pub fn new() -> Self {
        let state = Arc::new(MemoryClusterState::new());
        let runner = Arc::new(FakePodRunner::new());
        let dispatcher = Arc::new(FakeDispatcher::new());
        let events = Arc::new(RecordingEventSink::new());
        let ctx = ActorContext {
            state: state.clone(),
            runner: runner.clone(),
            dispatcher: dispatcher.clone(),
            events: events.clone(),
            health: None,
        };
        Self {
            state,
            runner,
            dispatcher,
            events,
            ctx,
        }
    }

    /// Store `vdb` and build a pass whose facts are already collected.
    pub async fn pass(&self, vdb: &VerticaDB, facts: Vec<PodFact>) -> ReconcilePass {
        let stored = self.state.put_vdb(vdb).await;
        let mut pass = ReconcilePass::new(stored);
        pass.pfacts = PodFacts::from_facts(ClusterScope::MainCluster, facts);
        pass
    }
}

/// VerticaDB `v` in namespace `ns` with the given annotations.
pub(crate) fn vdb(annotations: &[(&str, &str)], subclusters: Vec<Subcluster>) -> VerticaDB {
    let mut vdb = VerticaDB::new(
        "v",
        VerticaDBSpec {
            subclusters,
            ..Default::default()
        },
    );
    vdb.metadata.namespace = Some("ns".into());
    vdb.metadata.uid = Some("uid-1".into());
    vdb.metadata.annotations = Some(
        annotations
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
    );
    vdb
}

/// A healthy primary pod of subcluster `sc` that is up in the database.
pub(crate) fn fact(sc: &str, index: i32) -> PodFact {
    let name = format!("v-{sc}-{index}");
    PodFact {
        name: PodName::new("ns", name.clone()),
        pod_index: index,
        dns_name: format!("{name}.v.ns"),
        pod_ip: format!("10.0.0.{}", index + 1),
        subcluster_name: sc.to_string(),
        is_primary: true,
        exists: true,
        is_pod_running: true,
        managed_by_parent: true,
        is_installed: true,
        db_exists: true,
        up_node: true,
        has_dc_table_annotations: true,
        vnode_name: format!("v_vertdb_node{:04}", index + 1),
        shard_subscriptions: 1,
        ..Default::default()
    }
}
