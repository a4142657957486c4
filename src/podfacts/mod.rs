//! Point-in-time facts about every pod of a VerticaDB.
//!
//! [`PodFacts`] holds one [`PodFact`] per expected pod slot. A slot exists for
//! each index below `max(declared size, StatefulSet replicas)` of every
//! subcluster, including subclusters that are being removed, so pods scheduled
//! for deletion stay visible with `is_pending_delete` set until they are gone.
//!
//! Collection is lazy: [`PodFacts::collect`] is a no-op until an actor calls
//! [`PodFacts::invalidate`] after changing cluster membership.
//!
//! ## Collection steps, per pod
//!
//! 1. Run the gather script (running pods only).
//! 2. Installation state.
//! 3. Database presence and vertica node name.
//! 4. Simple copies from the gather output, including the up state.
//! 5. Node details through vsql (up pods only).
//! 6. Startup in progress.

pub mod gather;
pub mod node_details;
mod select;

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, warn};

use crate::client::{ClusterState, Host, PodName, PodRunner};
use crate::controller::config::PassConfig;
use crate::controller::error::{Error, Result};
use crate::controller::finder::{FindFlags, SubclusterFinder};
use crate::crd::annotations::{
    ADMINTOOLS_CONF, KUBERNETES_VERSION_ANNOTATION, NMA_CONTAINER, SANDBOX_LABEL,
    SERVER_CONTAINER,
};
use crate::crd::{ClusterScope, InitPolicy, Subcluster, VerticaDB};
use crate::resources::common::{pod_dns_name, pod_name, statefulset_name};
use crate::resources::statefulset::{has_nma_container, replicas, server_image};

use self::gather::{GatherInput, GatherState, gather_script, parse_gather_output};
use self::node_details::{FetchOutcome, fetch_node_details};

pub use self::select::ReIpFilter;

/// Everything known about one pod slot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PodFact {
    pub name: PodName,
    pub pod_index: i32,
    pub dns_name: String,
    pub pod_ip: String,
    pub subcluster_name: String,
    pub subcluster_oid: String,
    pub sandbox: ClusterScope,
    pub is_primary: bool,
    pub is_transient: bool,
    /// Server image of the pod, or of the StatefulSet template when the pod
    /// does not exist.
    pub image: String,
    pub creation_timestamp: String,

    // Liveness
    pub exists: bool,
    /// Running and not being deleted.
    pub is_pod_running: bool,
    pub is_terminating: bool,
    /// The StatefulSet replica count covers this index.
    pub managed_by_parent: bool,
    /// The index is beyond the declared subcluster size.
    pub is_pending_delete: bool,
    pub shutdown: bool,

    // Installation
    pub is_installed: bool,
    pub has_stale_admintools_conf: bool,
    pub admintools_exists: bool,
    pub eula_accepted: bool,
    pub dir_exists: BTreeMap<String, bool>,
    pub file_exists: BTreeMap<String, bool>,
    pub has_dc_table_annotations: bool,

    // Database membership and health
    pub db_exists: bool,
    pub vnode_name: String,
    pub compat21_node_name: String,
    pub up_node: bool,
    pub read_only: bool,
    pub startup_in_progress: bool,

    // Database internals
    pub shard_subscriptions: i64,
    pub depot_disk_percent_size: String,
    pub max_depot_size: u64,
    pub local_data_size: i64,
    pub local_data_avail: i64,
    pub catalog_path: String,

    // Node management agent
    pub has_nma_sidecar: bool,
    pub is_nma_container_ready: bool,
    /// Container the operator execs into for this pod.
    pub exec_container_name: String,
}

impl PodFact {
    /// Host entry used by dispatched admin commands.
    pub fn host(&self) -> Host {
        Host {
            pod: self.name.clone(),
            ip: self.pod_ip.clone(),
            vnode_name: self.vnode_name.clone(),
        }
    }
}

/// Pod facts for one scope of a VerticaDB.
#[derive(Clone, Debug)]
pub struct PodFacts {
    pub scope: ClusterScope,
    need_collection: bool,
    detail: BTreeMap<PodName, PodFact>,
}

impl PodFacts {
    pub fn new(scope: ClusterScope) -> Self {
        Self {
            scope,
            need_collection: true,
            detail: BTreeMap::new(),
        }
    }

    /// Build pre-populated facts. Collection is considered done.
    pub fn from_facts(scope: ClusterScope, facts: impl IntoIterator<Item = PodFact>) -> Self {
        Self {
            scope,
            need_collection: false,
            detail: facts.into_iter().map(|f| (f.name.clone(), f)).collect(),
        }
    }

    /// Force the next [`PodFacts::collect`] to gather again.
    pub fn invalidate(&mut self) {
        self.need_collection = true;
    }

    pub fn needs_collection(&self) -> bool {
        self.need_collection
    }

    pub fn get(&self, name: &PodName) -> Option<&PodFact> {
        self.detail.get(name)
    }

    pub fn get_mut(&mut self, name: &PodName) -> Option<&mut PodFact> {
        self.detail.get_mut(name)
    }

    /// Facts ordered by pod name.
    pub fn iter(&self) -> impl Iterator<Item = &PodFact> {
        self.detail.values()
    }

    pub fn len(&self) -> usize {
        self.detail.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detail.is_empty()
    }

    /// Facts of one subcluster ordered by pod index.
    pub fn in_subcluster<'a>(&'a self, sc_name: &'a str) -> Vec<&'a PodFact> {
        let mut pods: Vec<&PodFact> = self
            .detail
            .values()
            .filter(|p| p.subcluster_name == sc_name)
            .collect();
        pods.sort_by_key(|p| p.pod_index);
        pods
    }

    /// Gather facts for every pod slot unless they are still fresh.
    pub async fn collect(
        &mut self,
        state: &dyn ClusterState,
        runner: &dyn PodRunner,
        vdb: &VerticaDB,
        cfg: &PassConfig,
    ) -> Result<()> {
        if !self.need_collection {
            return Ok(());
        }
        self.detail.clear();

        let finder = SubclusterFinder::new(state, vdb, self.scope.clone());
        let subclusters = finder
            .find_subclusters(FindFlags::ALL | FindFlags::SORTED)
            .await?;
        let namespace = vdb.namespace_or_default();
        for sc in &subclusters {
            let sts = state
                .get_statefulset(&namespace, &statefulset_name(vdb, sc))
                .await?;
            let size = sc.size.max(sts.as_ref().map_or(0, replicas));
            for index in 0..size {
                let fact = self
                    .collect_pod(state, runner, vdb, cfg, sc, sts.as_ref(), index)
                    .await?;
                debug!(pod = %fact.name, up = fact.up_node, installed = fact.is_installed,
                    db_exists = fact.db_exists, read_only = fact.read_only, "pod fact");
                self.detail.insert(fact.name.clone(), fact);
            }
        }
        self.need_collection = false;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn collect_pod(
        &self,
        state: &dyn ClusterState,
        runner: &dyn PodRunner,
        vdb: &VerticaDB,
        cfg: &PassConfig,
        sc: &Subcluster,
        sts: Option<&StatefulSet>,
        index: i32,
    ) -> Result<PodFact> {
        let name = pod_name(vdb, sc, index);
        let sts_sandbox = sts
            .and_then(|s| s.metadata.labels.as_ref())
            .and_then(|l| l.get(SANDBOX_LABEL))
            .map(String::as_str);
        let mut pf = PodFact {
            dns_name: pod_dns_name(vdb, &name),
            name,
            pod_index: index,
            subcluster_name: sc.name.clone(),
            sandbox: ClusterScope::from_label(sts_sandbox),
            is_primary: sc.is_primary(),
            is_transient: sc.is_transient(),
            image: sts.and_then(server_image).unwrap_or_default().to_string(),
            managed_by_parent: sts.is_some_and(|s| index < replicas(s)),
            is_pending_delete: index >= sc.size,
            shutdown: sc.shutdown,
            catalog_path: vdb.spec.local.catalog_path().to_string(),
            exec_container_name: if sts.is_some_and(has_nma_container) {
                NMA_CONTAINER.to_string()
            } else {
                SERVER_CONTAINER.to_string()
            },
            ..Default::default()
        };

        if let Some(pod) = state.get_pod(&pf.name.namespace, &pf.name.name).await? {
            apply_pod_object(&mut pf, &pod);
        }

        let gs = self.run_gather(runner, vdb, &pf).await?;
        check_is_installed(vdb, cfg, &mut pf, &gs);
        check_is_db_created(vdb, &mut pf, &gs);
        check_simple_gather_mapping(cfg, &mut pf, &gs);
        check_node_details(runner, vdb, cfg, &mut pf).await?;
        check_startup(&mut pf, &gs);
        Ok(pf)
    }

    /// Run the gather script. Exec failures leave the default state.
    async fn run_gather(
        &self,
        runner: &dyn PodRunner,
        vdb: &VerticaDB,
        pf: &PodFact,
    ) -> Result<GatherState> {
        if !pf.is_pod_running {
            return Ok(GatherState::default());
        }
        let indicator = vdb.installer_indicator_file();
        let script = gather_script(&GatherInput {
            installer_indicator: &indicator,
            catalog_path: &pf.catalog_path,
            db_name: &vdb.spec.db_name,
            pod_ip: &pf.pod_ip,
            is_primary: pf.is_primary,
            in_server_container: pf.exec_container_name == SERVER_CONTAINER,
        });
        let cmd = vec!["bash".to_string(), "-c".to_string(), script];
        match runner
            .exec_in_pod(&pf.name, &pf.exec_container_name, &cmd)
            .await
        {
            Ok(out) => Ok(parse_gather_output(&out.stdout)?),
            Err(e @ Error::Exec { .. }) => {
                warn!(pod = %pf.name, error = %e, "gather failed, treating pod as down");
                Ok(GatherState::default())
            }
            Err(e) => Err(e),
        }
    }
}

/// Copy what the pod object itself tells us.
fn apply_pod_object(pf: &mut PodFact, pod: &Pod) {
    pf.exists = true;
    pf.is_terminating = pod.metadata.deletion_timestamp.is_some();
    // A terminating pod is seconds away from deletion; never exec into it.
    pf.is_pod_running = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|p| p == "Running")
        && !pf.is_terminating;
    pf.pod_ip = pod
        .status
        .as_ref()
        .and_then(|s| s.pod_ip.clone())
        .unwrap_or_default();
    pf.creation_timestamp = pod
        .metadata
        .creation_timestamp
        .as_ref()
        .map(|t| t.0.to_string())
        .unwrap_or_default();
    let containers = pod
        .spec
        .as_ref()
        .map(|s| s.containers.as_slice())
        .unwrap_or_default();
    if let Some(image) = containers
        .iter()
        .find(|c| c.name == SERVER_CONTAINER)
        .and_then(|c| c.image.clone())
    {
        pf.image = image;
    }
    pf.has_nma_sidecar = containers.iter().any(|c| c.name == NMA_CONTAINER);
    pf.is_nma_container_ready = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .is_some_and(|cs| cs.iter().any(|c| c.name == NMA_CONTAINER && c.ready));
    pf.has_dc_table_annotations = pod
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(KUBERNETES_VERSION_ANNOTATION));
}

// ============================================================================
// Checkers
// ============================================================================

pub(crate) fn check_is_installed(
    vdb: &VerticaDB,
    cfg: &PassConfig,
    pf: &mut PodFact,
    gs: &GatherState,
) {
    // vclusterops has no install step.
    if cfg.uses_vclusterops() {
        pf.is_installed = true;
        pf.has_stale_admintools_conf = false;
        pf.compat21_node_name.clear();
        return;
    }

    // Start from the status; the pod may have been installed before the
    // status was written or the config may have been wiped since.
    pf.is_installed = vdb
        .find_subcluster_status(&pf.subcluster_name)
        .and_then(|s| usize::try_from(pf.pod_index).ok().and_then(|i| s.detail.get(i)))
        .is_some_and(|d| d.installed);
    if !pf.is_pod_running {
        return;
    }

    if vdb.spec.init_policy == InitPolicy::ScheduleOnly {
        if !pf.is_installed {
            pf.is_installed = gs.file_exists.get(ADMINTOOLS_CONF).copied().unwrap_or(false);
        }
        // The install was not ours, so the node name is unknown.
        pf.compat21_node_name.clear();
        return;
    }

    pf.is_installed = gs.install_indicator_exists;
    if pf.is_installed {
        pf.compat21_node_name = gs.compat21_node_name.clone();
    } else {
        // A config without our indicator is left over and must be removed.
        pf.has_stale_admintools_conf = gs.file_exists.get(ADMINTOOLS_CONF).copied().unwrap_or(false);
    }
}

pub(crate) fn check_is_db_created(vdb: &VerticaDB, pf: &mut PodFact, gs: &GatherState) {
    pf.db_exists = false;
    // The status is trusted first: the on-disk catalog can disappear, e.g.
    // when a pod leaves a sandbox.
    if let Some(scs) = vdb.find_subcluster_status(&pf.subcluster_name) {
        pf.db_exists = i64::from(scs.added_to_db_count) > i64::from(pf.pod_index);
        if let Some(detail) = usize::try_from(pf.pod_index).ok().and_then(|i| scs.detail.get(i)) {
            pf.vnode_name = detail.vnode_name.clone();
            pf.db_exists = detail.added_to_db;
        }
    }
    if !pf.is_pod_running {
        return;
    }
    pf.db_exists = gs.db_exists || pf.db_exists;
    if !gs.vnode_name.is_empty() {
        pf.vnode_name = gs.vnode_name.clone();
    }
}

pub(crate) fn check_simple_gather_mapping(cfg: &PassConfig, pf: &mut PodFact, gs: &GatherState) {
    if !pf.is_pod_running {
        return;
    }
    pf.eula_accepted = gs.eula_accepted;
    pf.dir_exists = gs.dir_exists.clone();
    pf.file_exists = gs.file_exists.clone();
    pf.local_data_size = gs.local_data_size;
    pf.local_data_avail = gs.local_data_avail;
    pf.admintools_exists = gs.admintools_exists;
    pf.up_node = if cfg.uses_vclusterops() {
        // The HTTPS service answers only once the node is up.
        gs.up_node
    } else {
        pf.db_exists && gs.vertica_pid_running
    };
}

async fn check_node_details(
    runner: &dyn PodRunner,
    vdb: &VerticaDB,
    cfg: &PassConfig,
    pf: &mut PodFact,
) -> Result<()> {
    if !pf.is_pod_running || !pf.up_node {
        return Ok(());
    }
    let outcome = fetch_node_details(
        runner,
        &pf.name,
        &pf.exec_container_name,
        &pf.vnode_name,
        vdb.is_eon(),
        cfg.version.as_ref(),
    )
    .await?;
    match outcome {
        FetchOutcome::Details(d) => {
            if let Some(up) = d.up {
                pf.up_node = up;
            }
            pf.read_only = d.read_only;
            pf.subcluster_oid = d.subcluster_oid;
            pf.sandbox = ClusterScope::from_label(Some(d.sandbox.as_str()));
            pf.shard_subscriptions = d.shard_subscriptions;
            pf.max_depot_size = d.max_depot_size;
            pf.depot_disk_percent_size = d.depot_disk_percent;
        }
        FetchOutcome::Unavailable(message) => {
            // A node that cannot answer vsql is treated as down.
            debug!(pod = %pf.name, %message, "node details unavailable, marking down");
            pf.up_node = false;
            pf.read_only = false;
        }
    }
    Ok(())
}

pub(crate) fn check_startup(pf: &mut PodFact, gs: &GatherState) {
    pf.startup_in_progress = false;
    if !pf.db_exists || !pf.is_pod_running || pf.up_node || !gs.vertica_pid_running {
        return;
    }
    pf.startup_in_progress = !gs.startup_complete;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::client::{FakePodRunner, MemoryClusterState};
    use crate::crd::annotations::{VCLUSTER_OPS, VERSION};
    use crate::crd::{SubclusterStatus, SubclusterType, VerticaDBPodStatus, VerticaDBSpec};
    use crate::resources::statefulset::generate_statefulset;
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn admintools_vdb(size: i32) -> VerticaDB {
        let mut vdb = VerticaDB::new(
            "v",
            VerticaDBSpec {
                subclusters: vec![Subcluster::new("sc", size, SubclusterType::Primary)],
                ..Default::default()
            },
        );
        vdb.metadata.namespace = Some("ns".into());
        vdb.metadata.annotations = Some(
            [
                (VCLUSTER_OPS.to_string(), "false".to_string()),
                (VERSION.to_string(), "v12.0.4-0".to_string()),
            ]
            .into(),
        );
        vdb
    }

    fn running_pod(name: &str, ip: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some("Running".into()),
                pod_ip: Some(ip.into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_admintools_install_state() {
        let vdb = admintools_vdb(1);
        let cfg = PassConfig::from_vdb(&vdb);
        let mut pf = PodFact {
            is_pod_running: true,
            ..Default::default()
        };
        let mut gs = GatherState::default();
        gs.file_exists.insert(ADMINTOOLS_CONF.to_string(), true);
        check_is_installed(&vdb, &cfg, &mut pf, &gs);
        assert!(!pf.is_installed);
        assert!(pf.has_stale_admintools_conf);

        gs.install_indicator_exists = true;
        gs.compat21_node_name = "node0001".into();
        check_is_installed(&vdb, &cfg, &mut pf, &gs);
        assert!(pf.is_installed);
        assert_eq!(pf.compat21_node_name, "node0001");
    }

    #[test]
    fn test_vclusterops_is_always_installed() {
        let mut vdb = admintools_vdb(1);
        vdb.metadata.annotations = None;
        let cfg = PassConfig::from_vdb(&vdb);
        let mut pf = PodFact {
            has_stale_admintools_conf: true,
            ..Default::default()
        };
        check_is_installed(&vdb, &cfg, &mut pf, &GatherState::default());
        assert!(pf.is_installed);
        assert!(!pf.has_stale_admintools_conf);
    }

    #[test]
    fn test_db_exists_keeps_status_vnode() {
        let mut vdb = admintools_vdb(1);
        vdb.status_mut().subclusters.push(SubclusterStatus {
            name: "sc".into(),
            added_to_db_count: 1,
            detail: vec![VerticaDBPodStatus {
                added_to_db: true,
                vnode_name: "v_vertdb_node0001".into(),
                ..Default::default()
            }],
            ..Default::default()
        });
        let mut pf = PodFact {
            subcluster_name: "sc".into(),
            ..Default::default()
        };
        check_is_db_created(&vdb, &mut pf, &GatherState::default());
        assert!(pf.db_exists);
        assert_eq!(pf.vnode_name, "v_vertdb_node0001");
    }

    #[test]
    fn test_startup_in_progress() {
        let mut pf = PodFact {
            db_exists: true,
            is_pod_running: true,
            ..Default::default()
        };
        let gs = GatherState {
            vertica_pid_running: true,
            ..Default::default()
        };
        check_startup(&mut pf, &gs);
        assert!(pf.startup_in_progress);
        pf.up_node = true;
        check_startup(&mut pf, &gs);
        assert!(!pf.startup_in_progress);
    }

    #[tokio::test]
    async fn test_collect_sizes_by_replicas_and_spec() {
        let state = MemoryClusterState::new();
        let runner = FakePodRunner::new();
        let big = admintools_vdb(3);
        let cfg = PassConfig::from_vdb(&big);
        state
            .put_statefulset("ns", &generate_statefulset(&big, &big.spec.subclusters[0], &cfg))
            .await;
        // Spec shrunk to one, StatefulSet still at three.
        let vdb = admintools_vdb(1);
        let mut pfacts = PodFacts::new(ClusterScope::MainCluster);
        pfacts.collect(&state, &runner, &vdb, &cfg).await.unwrap();
        assert_eq!(pfacts.len(), 3);
        let pending: Vec<_> = pfacts.iter().filter(|p| p.is_pending_delete).collect();
        assert_eq!(pending.len(), 2);
        assert!(pfacts.iter().all(|p| p.managed_by_parent && !p.exists));
    }

    #[tokio::test]
    async fn test_collect_up_read_only_node() {
        let state = MemoryClusterState::new();
        let runner = FakePodRunner::new();
        let vdb = admintools_vdb(1);
        let cfg = PassConfig::from_vdb(&vdb);
        state
            .put_statefulset("ns", &generate_statefulset(&vdb, &vdb.spec.subclusters[0], &cfg))
            .await;
        state.put_pod("ns", &running_pod("v-sc-0", "10.0.0.1")).await;
        let pod = PodName::new("ns", "v-sc-0");
        runner.respond(
            &pod,
            "installIndicatorExists",
            "installIndicatorExists: true\ndbExists: true\nverticaPIDRunning: true\nvnodeName: v_vertdb_node0001\n",
        );
        runner.respond(&pod, "current_session", "v_db_node0001|UP|123456|t");

        let mut pfacts = PodFacts::new(ClusterScope::MainCluster);
        pfacts.collect(&state, &runner, &vdb, &cfg).await.unwrap();
        let pf = pfacts.get(&pod).unwrap();
        assert!(pf.up_node);
        assert!(pf.read_only);
        assert_eq!(pf.subcluster_oid, "123456");
        assert_eq!(pf.vnode_name, "v_vertdb_node0001");

        // Fresh facts are not collected again.
        runner.clear_calls();
        pfacts.collect(&state, &runner, &vdb, &cfg).await.unwrap();
        assert!(runner.calls().is_empty());
        pfacts.invalidate();
        pfacts.collect(&state, &runner, &vdb, &cfg).await.unwrap();
        assert!(!runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_gather_exec_failure_means_down() {
        let state = MemoryClusterState::new();
        let runner = FakePodRunner::new();
        let vdb = admintools_vdb(1);
        let cfg = PassConfig::from_vdb(&vdb);
        state.put_pod("ns", &running_pod("v-sc-0", "10.0.0.1")).await;
        runner.fail_any("installIndicatorExists", "container not found");
        let mut pfacts = PodFacts::new(ClusterScope::MainCluster);
        pfacts.collect(&state, &runner, &vdb, &cfg).await.unwrap();
        let pf = pfacts.get(&PodName::new("ns", "v-sc-0")).unwrap();
        assert!(pf.is_pod_running);
        assert!(!pf.up_node);
    }

    async fn collect_with_node_state(
        configure: impl FnOnce(&FakePodRunner, &PodName),
    ) -> PodFact {
        let state = MemoryClusterState::new();
        let runner = FakePodRunner::new();
        let vdb = admintools_vdb(1);
        let cfg = PassConfig::from_vdb(&vdb);
        state
            .put_statefulset("ns", &generate_statefulset(&vdb, &vdb.spec.subclusters[0], &cfg))
            .await;
        state.put_pod("ns", &running_pod("v-sc-0", "10.0.0.1")).await;
        let pod = PodName::new("ns", "v-sc-0");
        runner.respond(
            &pod,
            "installIndicatorExists",
            "installIndicatorExists: true\ndbExists: true\nverticaPIDRunning: true\nvnodeName: v_vertdb_node0001\n",
        );
        configure(&runner, &pod);

        let mut pfacts = PodFacts::new(ClusterScope::MainCluster);
        pfacts.collect(&state, &runner, &vdb, &cfg).await.unwrap();
        pfacts.get(&pod).unwrap().clone()
    }

    #[tokio::test]
    async fn test_catalog_down_state_overrides_running_process() {
        let pf = collect_with_node_state(|runner, pod| {
            runner.respond(pod, "current_session", "v_db_node0001|DOWN|123456|f");
        })
        .await;
        assert!(pf.db_exists);
        assert!(!pf.up_node);
        assert!(!pf.read_only);
    }

    #[tokio::test]
    async fn test_vsql_failure_marks_node_down_and_not_read_only() {
        let pf = collect_with_node_state(|runner, pod| {
            runner.fail(pod, "current_session", "vsql: could not connect");
        })
        .await;
        assert!(pf.is_pod_running);
        assert!(!pf.up_node);
        assert!(!pf.read_only);
    }
}
