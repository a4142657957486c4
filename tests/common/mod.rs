//! Test fixtures and builder patterns for VerticaDB.
//!
//! Shared by the unit, proptest and functional test crates. Each crate uses
//! a different subset, hence the `dead_code` allowance.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use vertica_operator::client::{FakeDispatcher, FakePodRunner, MemoryClusterState, PodName};
use vertica_operator::controller::events::RecordingEventSink;
use vertica_operator::controller::{ActorContext, ReconcilePass};
use vertica_operator::crd::{
    ClusterScope, CommunalStorage, Condition, ConditionType, InitPolicy, Subcluster,
    SubclusterType, VerticaDB, VerticaDBSpec,
};
use vertica_operator::crd::annotations::{VCLUSTER_OPS, VERSION};
use vertica_operator::podfacts::{PodFact, PodFacts};

/// Namespace every fixture lives in.
pub const NAMESPACE: &str = "test-ns";

/// Builder for creating VerticaDB test fixtures.
///
/// # Example
/// ```ignore
/// let vdb = VerticaDbBuilder::new("vdb")
///     .primary("pri", 3)
///     .secondary("sec", 2)
///     .eon("s3://bucket/db")
///     .build();
/// ```
#[derive(Clone, Debug)]
pub struct VerticaDbBuilder {
    name: String,
    namespace: String,
    spec: VerticaDBSpec,
    annotations: BTreeMap<String, String>,
    initialized: bool,
    generation: Option<i64>,
}

impl VerticaDbBuilder {
    /// Create a new builder with the given resource name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: NAMESPACE.to_string(),
            spec: VerticaDBSpec::default(),
            annotations: BTreeMap::new(),
            initialized: false,
            generation: Some(1),
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.spec.image = image.into();
        self
    }

    pub fn primary(mut self, name: &str, size: i32) -> Self {
        self.spec
            .subclusters
            .push(Subcluster::new(name, size, SubclusterType::Primary));
        self
    }

    pub fn secondary(mut self, name: &str, size: i32) -> Self {
        self.spec
            .subclusters
            .push(Subcluster::new(name, size, SubclusterType::Secondary));
        self
    }

    /// Eon mode with the given communal path.
    pub fn eon(mut self, path: &str) -> Self {
        self.spec.communal.path = path.to_string();
        self
    }

    pub fn init_policy(mut self, policy: InitPolicy) -> Self {
        self.spec.init_policy = policy;
        self
    }

    pub fn annotation(mut self, key: &str, value: &str) -> Self {
        self.annotations.insert(key.to_string(), value.to_string());
        self
    }

    /// Admintools deployment of the given server version.
    pub fn admintools(self, version: &str) -> Self {
        self.annotation(VCLUSTER_OPS, "false").annotation(VERSION, version)
    }

    /// vclusterops deployment of the given server version.
    pub fn vclusterops(self, version: &str) -> Self {
        self.annotation(VCLUSTER_OPS, "true").annotation(VERSION, version)
    }

    pub fn additional_bucket(mut self, bucket: CommunalStorage) -> Self {
        self.spec.additional_buckets.push(bucket);
        self
    }

    pub fn password_secret(mut self, name: &str) -> Self {
        self.spec.password_secret = Some(name.to_string());
        self
    }

    /// Mark the database as created.
    pub fn initialized(mut self) -> Self {
        self.initialized = true;
        self
    }

    pub fn build(self) -> VerticaDB {
        let mut vdb = VerticaDB::new(&self.name, self.spec);
        vdb.metadata.namespace = Some(self.namespace);
        vdb.metadata.uid = Some(format!("uid-{}", self.name));
        vdb.metadata.generation = self.generation;
        if !self.annotations.is_empty() {
            vdb.metadata.annotations = Some(self.annotations);
        }
        if self.initialized {
            vdb.status_mut().conditions.push(Condition::new(
                ConditionType::DbInitialized,
                true,
                "Initialized",
                "",
                None,
            ));
        }
        vdb
    }
}

/// In-memory collaborators wired into an actor context.
pub struct TestEnv {
    pub state: Arc<MemoryClusterState>,
    pub runner: Arc<FakePodRunner>,
    pub dispatcher: Arc<FakeDispatcher>,
    pub events: Arc<RecordingEventSink>,
    pub ctx: ActorContext,
}

impl TestEnv {
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

/// A running, installed pod of `vdb` whose node is up in the database.
pub fn up_fact(vdb: &VerticaDB, sc: &str, index: i32) -> PodFact {
    let name = format!("{}-{sc}-{index}", vdb.metadata.name.as_deref().unwrap_or("v"));
    let is_primary = vdb
        .spec
        .subclusters
        .iter()
        .find(|s| s.name == sc)
        .is_none_or(Subcluster::is_primary);
    PodFact {
        name: PodName::new(NAMESPACE, name.clone()),
        pod_index: index,
        dns_name: format!("{name}.{NAMESPACE}"),
        pod_ip: format!("10.1.0.{}", index + 1),
        subcluster_name: sc.to_string(),
        is_primary,
        image: vdb.spec.image.clone(),
        exists: true,
        is_pod_running: true,
        managed_by_parent: true,
        is_installed: true,
        db_exists: true,
        up_node: true,
        has_dc_table_annotations: true,
        vnode_name: format!("v_vertdb_node{:04}", index + 1),
        shard_subscriptions: 1,
        exec_container_name: "server".to_string(),
        ..Default::default()
    }
}
