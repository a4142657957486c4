//! Keep vertica running in every pod that belongs to the database.
//!
//! Two paths:
//!
//! - **cluster**: no writable node is up, so the database as a whole is
//!   started from a down pod after updating the catalog with the current pod
//!   IPs.
//! - **node**: the database is up; down pods are restarted individually.
//!   When restarting them would not leave a quorum, the cluster path is taken
//!   instead.

use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::client::dispatcher::{ReIpOptions, RestartNodeOptions, StartDbOptions};
use crate::client::{Host, PodName};
use crate::controller::actor::{Actor, ActorContext, Directive, ReconcilePass};
use crate::controller::error::{Error, Result};
use crate::controller::events;
use crate::controller::status::update_condition;
use crate::crd::annotations::SERVER_CONTAINER;
use crate::crd::{Condition, ConditionType, InitPolicy};
use crate::podfacts::{PodFact, ReIpFilter};

const KILL_MARKER: &str = "Killing process";
const STARTUP_CONF_FILE: &str = "/opt/vertica/config/startup.json";

/// Restarts vertica in pods whose node is down.
pub struct RestartActor {
    /// Read-only nodes count as down and get restarted too.
    restart_read_only: bool,
}

impl RestartActor {
    pub fn new(restart_read_only: bool) -> Self {
        Self { restart_read_only }
    }
}

#[async_trait]
impl Actor for RestartActor {
    fn name(&self) -> &'static str {
        "Restart"
    }

    async fn reconcile(&self, ctx: &ActorContext, pass: &mut ReconcilePass) -> Result<Directive> {
        let auto_restart = pass.vdb.spec.auto_restart_vertica;
        if pass.vdb.is_condition_true(ConditionType::AutoRestartVertica) != auto_restart {
            let condition = Condition::new(
                ConditionType::AutoRestartVertica,
                auto_restart,
                "",
                "",
                pass.vdb.metadata.generation,
            );
            let updated = update_condition(ctx.state.as_ref(), &pass.vdb, condition).await?;
            pass.set_vdb(updated);
        }
        if !auto_restart {
            debug!("automatic restart is disabled");
            return Ok(Directive::Continue);
        }
        // Without a database there is nothing to start.
        if pass.config.uses_vclusterops() && !pass.vdb.is_condition_true(ConditionType::DbInitialized) {
            return Ok(Directive::Continue);
        }

        pass.collect(ctx).await?;
        if pass.pfacts.up_node_and_not_read_only_count() == 0
            && pass.vdb.spec.init_policy != InitPolicy::ScheduleOnly
        {
            return self.restart_cluster(ctx, pass).await;
        }
        self.restart_pods(ctx, pass).await
    }
}

impl RestartActor {
    async fn restart_cluster(&self, ctx: &ActorContext, pass: &mut ReconcilePass) -> Result<Directive> {
        let vclusterops = pass.config.uses_vclusterops();
        let pfacts = &pass.pfacts;
        if pfacts.are_all_pods_running_and_zero_installed() {
            return Ok(Directive::Continue);
        }
        if pfacts.count_running_and_installed() == 0 {
            info!("waiting for installed pods to be running");
            return Ok(Directive::requeue());
        }
        // Without k-safety every node is needed to start.
        if pass.config.k_safety == 0 && pfacts.count_not_restartable_pods(vclusterops) > 0 {
            info!("waiting for every pod to be running before a cluster start");
            return Ok(Directive::requeue());
        }

        if self.restart_read_only && self.kill_read_only_processes(ctx, pfacts).await? {
            info!("killed read-only vertica processes, requeue");
            pass.pfacts.invalidate();
            return Ok(Directive::requeue());
        }

        let Some(initiator) = pfacts.find_pod_to_run_admin_cmd_offline() else {
            info!("no pod to initiate the cluster start from");
            return Ok(Directive::requeue());
        };
        let initiator = initiator.name.clone();
        let down: Vec<Host> = pfacts
            .find_restartable_pods(self.restart_read_only, !vclusterops, true)
            .into_iter()
            .map(PodFact::host)
            .collect();
        let re_ip: Vec<Host> = pfacts
            .find_re_ip_pods(ReIpFilter::Any)
            .into_iter()
            .map(PodFact::host)
            .collect();
        let db_exists = pfacts.does_db_exist();

        if let Some(d) = self.re_ip(ctx, pass, &initiator, re_ip).await? {
            return Ok(d);
        }
        if !db_exists || down.is_empty() {
            return Ok(Directive::Continue);
        }

        ctx.normal(&pass.vdb, events::CLUSTER_RESTART_STARTED, "Starting restart of the cluster")
            .await;
        let start = Instant::now();
        let opts = StartDbOptions {
            initiator,
            hosts: down,
            scope: pass.pfacts.scope.clone(),
            timeout_secs: pass.config.restart_timeout_secs,
        };
        match ctx.dispatcher.start_db(&opts).await {
            Ok(()) => {}
            Err(e @ Error::Dispatch { .. }) => {
                warn!(error = %e, "cluster start failed");
                pass.pfacts.invalidate();
                return Ok(Directive::requeue());
            }
            Err(e) => return Err(e),
        }
        pass.pfacts.invalidate();
        ctx.normal(
            &pass.vdb,
            events::CLUSTER_RESTART_SUCCEEDED,
            format!(
                "Successfully restarted the cluster and it took {}s",
                start.elapsed().as_secs()
            ),
        )
        .await;
        Ok(Directive::Continue)
    }

    async fn restart_pods(&self, ctx: &ActorContext, pass: &mut ReconcilePass) -> Result<Directive> {
        let pfacts = &pass.pfacts;
        let down = pfacts.find_restartable_pods(self.restart_read_only, false, false);
        if !down.is_empty() {
            // Restarting nodes needs a live quorum; otherwise start the
            // cluster as a whole.
            if !pfacts.does_db_have_quorum(0) && pfacts.quorum_check_for_restart_cluster(self.restart_read_only) {
                info!("database lost quorum, starting the cluster");
                return self.restart_cluster(ctx, pass).await;
            }
            let Some(initiator) = pfacts.find_first_up_pod(true, None) else {
                info!("no up pod to initiate node restarts from");
                return Ok(Directive::requeue());
            };
            let initiator = initiator.name.clone();
            let hosts: Vec<Host> = down.iter().map(|p| p.host()).collect();
            let names: Vec<String> = down.iter().map(|p| p.name.name.clone()).collect();

            if let Some(d) = self.re_ip(ctx, pass, &initiator, hosts.clone()).await? {
                return Ok(d);
            }

            ctx.normal(
                &pass.vdb,
                events::NODE_RESTART_STARTED,
                format!("Starting database restart node of the following pods: {}", names.join(", ")),
            )
            .await;
            let start = Instant::now();
            let opts = RestartNodeOptions {
                initiator,
                hosts,
                timeout_secs: pass.config.restart_timeout_secs,
            };
            match ctx.dispatcher.restart_node(&opts).await {
                Ok(()) => {}
                Err(e @ Error::Dispatch { .. }) => {
                    ctx.warning(&pass.vdb, events::NODE_RESTART_FAILED, e.to_string()).await;
                    pass.pfacts.invalidate();
                    return Ok(Directive::requeue());
                }
                Err(e) => return Err(e),
            }
            pass.pfacts.invalidate();
            ctx.normal(
                &pass.vdb,
                events::NODE_RESTART_SUCCEEDED,
                format!(
                    "Successfully restarted database nodes and it took {}s",
                    start.elapsed().as_secs()
                ),
            )
            .await;
            pass.collect(ctx).await?;
        }

        if let Some(pod) = pass.pfacts.any_installed_pods_not_running() {
            info!(pod = %pod, "installed pod is not running, requeue");
            return Ok(Directive::requeue());
        }
        Ok(Directive::Continue)
    }

    /// Update the catalog with the current pod IPs. Returns a directive when
    /// the pass must stop.
    async fn re_ip(
        &self,
        ctx: &ActorContext,
        pass: &mut ReconcilePass,
        initiator: &PodName,
        hosts: Vec<Host>,
    ) -> Result<Option<Directive>> {
        if hosts.is_empty() {
            debug!("no pods qualify for re-ip");
            return Ok(None);
        }
        if hosts.iter().any(|h| h.ip.is_empty()) {
            info!("not every pod has an address yet, requeue");
            return Ok(Some(Directive::requeue()));
        }
        let opts = ReIpOptions {
            initiator: initiator.clone(),
            hosts,
        };
        match ctx.dispatcher.re_ip(&opts).await {
            Ok(()) => Ok(None),
            Err(e @ Error::Dispatch { .. }) => {
                ctx.warning(&pass.vdb, events::REIP_FAILED, e.to_string()).await;
                Ok(Some(Directive::requeue()))
            }
            Err(e) => Err(e),
        }
    }

    /// Kill vertica in read-only pods so they can be restarted writable.
    /// Returns true if any process was killed.
    async fn kill_read_only_processes(
        &self,
        ctx: &ActorContext,
        pfacts: &crate::podfacts::PodFacts,
    ) -> Result<bool> {
        let cmd = vec![
            "bash".to_string(),
            "-c".to_string(),
            format!(
                "for pid in $(pgrep ^vertica$); do echo \"{KILL_MARKER} $pid\"; kill -n SIGKILL $pid; done && rm -rf {STARTUP_CONF_FILE}"
            ),
        ];
        let mut killed = false;
        for pod in pfacts.filter_pods(|p| p.read_only && p.is_pod_running) {
            let out = ctx.runner.exec_in_pod(&pod.name, SERVER_CONTAINER, &cmd).await?;
            killed |= out.stdout.contains(KILL_MARKER);
        }
        Ok(killed)
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::client::{DispatchCall, FakeDispatcher, FakePodRunner, MemoryClusterState};
    use crate::controller::events::RecordingEventSink;
    use crate::crd::annotations::{VCLUSTER_OPS, VERSION};
    use crate::crd::{ClusterScope, Subcluster, SubclusterType, VerticaDB, VerticaDBSpec};
    use crate::podfacts::PodFacts;

    fn fact(index: i32, up: bool) -> PodFact {
        PodFact {
            name: PodName::new("ns", format!("v-sc-{index}")),
            pod_index: index,
            subcluster_name: "sc".into(),
            pod_ip: format!("10.0.0.{index}"),
            vnode_name: format!("v_db_node000{}", index + 1),
            is_primary: true,
            exists: true,
            is_pod_running: true,
            managed_by_parent: true,
            is_installed: true,
            db_exists: true,
            has_dc_table_annotations: true,
            up_node: up,
            ..Default::default()
        }
    }

    async fn setup(facts: Vec<PodFact>) -> (ActorContext, ReconcilePass, Arc<FakeDispatcher>) {
        let state = Arc::new(MemoryClusterState::new());
        let dispatcher = Arc::new(FakeDispatcher::new());
        let mut vdb = VerticaDB::new(
            "v",
            VerticaDBSpec {
                subclusters: vec![Subcluster::new("sc", 3, SubclusterType::Primary)],
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
        let vdb = state.put_vdb(&vdb).await;
        let ctx = ActorContext {
            state,
            runner: Arc::new(FakePodRunner::new()),
            dispatcher: dispatcher.clone(),
            events: Arc::new(RecordingEventSink::new()),
            health: None,
        };
        let mut pass = ReconcilePass::new(vdb);
        pass.pfacts = PodFacts::from_facts(ClusterScope::MainCluster, facts);
        (ctx, pass, dispatcher)
    }

    #[tokio::test]
    async fn test_restarts_single_down_node() {
        let (ctx, mut pass, dispatcher) = setup(vec![fact(0, true), fact(1, true), fact(2, false)]).await;
        let d = RestartActor::new(true).reconcile(&ctx, &mut pass).await.unwrap();
        assert_eq!(d, Directive::Continue);
        let restarts = dispatcher.calls_named("restart_node");
        assert_eq!(restarts.len(), 1);
        let DispatchCall::RestartNode(opts) = &restarts[0] else {
            panic!("expected restart_node");
        };
        assert_eq!(opts.hosts.len(), 1);
        assert_eq!(opts.hosts[0].pod.name, "v-sc-2");
        assert!(dispatcher.calls_named("start_db").is_empty());
    }

    #[tokio::test]
    async fn test_all_down_starts_cluster() {
        let (ctx, mut pass, dispatcher) = setup(vec![fact(0, false), fact(1, false), fact(2, false)]).await;
        let d = RestartActor::new(true).reconcile(&ctx, &mut pass).await.unwrap();
        assert_eq!(d, Directive::Continue);
        assert_eq!(dispatcher.calls_named("re_ip").len(), 1);
        let starts = dispatcher.calls_named("start_db");
        assert_eq!(starts.len(), 1);
        let DispatchCall::StartDb(opts) = &starts[0] else {
            panic!("expected start_db");
        };
        assert_eq!(opts.hosts.len(), 3);
        assert!(pass.pfacts.needs_collection());
    }

    #[tokio::test]
    async fn test_disabled_auto_restart_does_nothing() {
        let (ctx, mut pass, dispatcher) = setup(vec![fact(0, false)]).await;
        let mut vdb = pass.vdb.clone();
        vdb.spec.auto_restart_vertica = false;
        let vdb = ctx.state.replace_vdb(&vdb).await.unwrap();
        pass.set_vdb(vdb);
        let d = RestartActor::new(true).reconcile(&ctx, &mut pass).await.unwrap();
        assert_eq!(d, Directive::Continue);
        assert!(dispatcher.calls().is_empty());
        assert!(!pass.vdb.is_condition_true(ConditionType::AutoRestartVertica));
    }

    #[tokio::test]
    async fn test_failed_start_requeues() {
        let (ctx, mut pass, dispatcher) = setup(vec![fact(0, false), fact(1, false)]).await;
        dispatcher.fail_op("start_db", "timeout");
        let d = RestartActor::new(true).reconcile(&ctx, &mut pass).await.unwrap();
        assert_eq!(d, Directive::requeue());
    }
}
