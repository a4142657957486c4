//! Keep database membership in line with the subclusters of the spec.
//!
//! Subclusters and nodes are added after the pods exist and are installed;
//! they are removed before the pods go away.

use std::collections::BTreeSet;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::client::dispatcher::{
    AddNodeOptions, AddSubclusterOptions, RemoveNodeOptions, RemoveSubclusterOptions, sql_quote,
};
use crate::client::{Host, PodName};
use crate::controller::actor::{Actor, ActorContext, Directive, ReconcilePass};
use crate::controller::error::{Error, Result};
use crate::controller::events;
use crate::controller::finder::{FindFlags, SubclusterFinder};
use crate::crd::annotations::SERVER_CONTAINER;
use crate::crd::InitPolicy;
use crate::podfacts::PodFact;

const SUBCLUSTERS_QUERY: &str = "SELECT DISTINCT(subcluster_name) FROM subclusters;";
const DEFAULT_SUBCLUSTER_QUERY: &str =
    "SELECT subcluster_name FROM subclusters WHERE is_default IS TRUE;";

/// Non-empty trimmed lines of vsql output.
fn output_lines(stdout: &str) -> BTreeSet<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

fn pod_names(pods: &[PodFact]) -> String {
    pods.iter()
        .map(|p| p.name.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Requeue on admin command failures; any other error propagates.
async fn dispatch_outcome(
    ctx: &ActorContext,
    pass: &mut ReconcilePass,
    result: Result<()>,
    failed_reason: &str,
) -> Result<Option<Directive>> {
    match result {
        Ok(()) => Ok(None),
        Err(e @ Error::Dispatch { .. }) => {
            ctx.warning(&pass.vdb, failed_reason, e.to_string()).await;
            pass.pfacts.invalidate();
            Ok(Some(Directive::requeue()))
        }
        Err(e) => Err(e),
    }
}

// ============================================================================
// DbAddSubcluster
// ============================================================================

pub struct DbAddSubclusterActor;

#[async_trait]
impl Actor for DbAddSubclusterActor {
    fn name(&self) -> &'static str {
        "DbAddSubcluster"
    }

    async fn reconcile(&self, ctx: &ActorContext, pass: &mut ReconcilePass) -> Result<Directive> {
        if pass.vdb.spec.init_policy == InitPolicy::ScheduleOnly || !pass.vdb.is_eon() {
            return Ok(Directive::Continue);
        }
        pass.collect(ctx).await?;
        if !pass.pfacts.does_db_exist() {
            return Ok(Directive::Continue);
        }

        // A subcluster with a node in the database is known to exist.
        let scope = pass.pfacts.scope.clone();
        let candidates: Vec<_> = pass
            .vdb
            .subclusters_in_scope(&scope)
            .into_iter()
            .filter(|sc| !pass.pfacts.in_subcluster(&sc.name).iter().any(|p| p.db_exists))
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Ok(Directive::Continue);
        }

        let Some(initiator) = pass
            .pfacts
            .find_pod_to_run_admin_cmd_any()
            .filter(|p| p.up_node)
            .map(|p| p.name.clone())
        else {
            info!("no up pod to add subclusters from, requeue");
            return Ok(Directive::requeue());
        };
        let out = ctx
            .runner
            .exec_vsql(&initiator, SERVER_CONTAINER, SUBCLUSTERS_QUERY)
            .await?;
        let existing = output_lines(&out.stdout);

        for sc in candidates {
            if existing.contains(&sc.name) {
                continue;
            }
            ctx.normal(
                &pass.vdb,
                events::ADD_SUBCLUSTER_START,
                format!("Starting add subcluster '{}'", sc.name),
            )
            .await;
            let opts = AddSubclusterOptions {
                initiator: initiator.clone(),
                subcluster: sc.name.clone(),
                is_primary: sc.is_primary(),
            };
            let result = ctx.dispatcher.add_subcluster(&opts).await;
            if let Some(d) = dispatch_outcome(ctx, pass, result, events::ADD_SUBCLUSTER_FAILED).await? {
                return Ok(d);
            }
            ctx.normal(
                &pass.vdb,
                events::ADD_SUBCLUSTER_SUCCEEDED,
                format!("Added new subcluster '{}'", sc.name),
            )
            .await;
        }
        Ok(Directive::Continue)
    }
}

// ============================================================================
// DbRemoveSubcluster
// ============================================================================

pub struct DbRemoveSubclusterActor;

#[async_trait]
impl Actor for DbRemoveSubclusterActor {
    fn name(&self) -> &'static str {
        "DbRemoveSubcluster"
    }

    async fn reconcile(&self, ctx: &ActorContext, pass: &mut ReconcilePass) -> Result<Directive> {
        if pass.vdb.spec.init_policy == InitPolicy::ScheduleOnly {
            return Ok(Directive::Continue);
        }
        pass.collect(ctx).await?;

        let finder = SubclusterFinder::new(ctx.state.as_ref(), &pass.vdb, pass.pfacts.scope.clone());
        let removed: Vec<String> = finder
            .find_subclusters(FindFlags::NOT_IN_VDB | FindFlags::SORTED)
            .await?
            .into_iter()
            .map(|sc| sc.name)
            .filter(|name| pass.pfacts.in_subcluster(name).iter().any(|p| p.db_exists))
            .collect();
        if removed.is_empty() {
            return Ok(Directive::Continue);
        }

        let Some(initiator) = pass
            .pfacts
            .find_pod_to_run_admin_cmd_any()
            .filter(|p| p.up_node)
            .map(|p| p.name.clone())
        else {
            info!("no up pod to remove subclusters from, requeue");
            return Ok(Directive::requeue());
        };
        self.reset_default_subcluster(ctx, pass, &initiator).await?;

        for name in removed {
            ctx.normal(
                &pass.vdb,
                events::REMOVE_SUBCLUSTER_START,
                format!("Starting remove subcluster '{name}'"),
            )
            .await;
            let opts = RemoveSubclusterOptions {
                initiator: initiator.clone(),
                subcluster: name.clone(),
            };
            let result = ctx.dispatcher.remove_subcluster(&opts).await;
            if let Some(d) = dispatch_outcome(ctx, pass, result, events::REMOVE_SUBCLUSTER_FAILED).await? {
                return Ok(d);
            }
            ctx.normal(
                &pass.vdb,
                events::REMOVE_SUBCLUSTER_SUCCEEDED,
                format!("Removed subcluster '{name}'"),
            )
            .await;
        }
        pass.pfacts.invalidate();
        Ok(Directive::Continue)
    }
}

impl DbRemoveSubclusterActor {
    /// The default subcluster cannot be removed. Move the default to a
    /// subcluster that stays.
    async fn reset_default_subcluster(
        &self,
        ctx: &ActorContext,
        pass: &ReconcilePass,
        initiator: &PodName,
    ) -> Result<()> {
        let out = ctx
            .runner
            .exec_vsql(initiator, SERVER_CONTAINER, DEFAULT_SUBCLUSTER_QUERY)
            .await?;
        let Some(current) = out.stdout.lines().map(str::trim).find(|l| !l.is_empty()) else {
            debug!("default subcluster not reported");
            return Ok(());
        };
        if pass.vdb.subcluster_map().contains_key(current) {
            return Ok(());
        }
        let scope = pass.pfacts.scope.clone();
        let in_scope = pass.vdb.subclusters_in_scope(&scope);
        let Some(target) = in_scope
            .iter()
            .find(|sc| sc.is_primary())
            .or_else(|| in_scope.first())
        else {
            return Ok(());
        };
        info!(from = current, to = %target.name, "changing default subcluster");
        let sql = format!("ALTER SUBCLUSTER \"{}\" SET DEFAULT;", sql_quote(&target.name));
        ctx.runner.exec_vsql(initiator, SERVER_CONTAINER, &sql).await?;
        Ok(())
    }
}

// ============================================================================
// DbAddNode
// ============================================================================

pub struct DbAddNodeActor;

#[async_trait]
impl Actor for DbAddNodeActor {
    fn name(&self) -> &'static str {
        "DbAddNode"
    }

    async fn reconcile(&self, ctx: &ActorContext, pass: &mut ReconcilePass) -> Result<Directive> {
        if pass.vdb.spec.init_policy == InitPolicy::ScheduleOnly {
            return Ok(Directive::Continue);
        }
        pass.collect(ctx).await?;
        if !pass.pfacts.does_db_exist() {
            info!("database does not exist yet, requeue add node");
            return Ok(Directive::requeue());
        }

        let scope = pass.pfacts.scope.clone();
        let names: Vec<String> = pass
            .vdb
            .subclusters_in_scope(&scope)
            .into_iter()
            .filter(|sc| !sc.shutdown)
            .map(|sc| sc.name.clone())
            .collect();
        for sc_name in names {
            let mut pods: Vec<PodFact> = pass
                .pfacts
                .in_subcluster(&sc_name)
                .into_iter()
                .filter(|p| !p.db_exists && !p.is_pending_delete)
                .cloned()
                .collect();
            if pods.is_empty() {
                continue;
            }
            if let Some(p) = pods.iter().find(|p| !p.is_pod_running || !p.is_installed) {
                info!(pod = %p.name, "pod not ready for add node, requeue");
                return Ok(Directive::requeue());
            }
            pods.sort_by(|a, b| a.dns_name.cmp(&b.dns_name));
            if let Some(d) = self.add_nodes(ctx, pass, &sc_name, &pods).await? {
                return Ok(d);
            }
        }
        Ok(Directive::Continue)
    }
}

impl DbAddNodeActor {
    async fn add_nodes(
        &self,
        ctx: &ActorContext,
        pass: &mut ReconcilePass,
        sc_name: &str,
        pods: &[PodFact],
    ) -> Result<Option<Directive>> {
        let Some(initiator) = pass.pfacts.find_first_up_pod(false, None).map(|p| p.name.clone()) else {
            info!("no up pod to add nodes from, requeue");
            return Ok(Some(Directive::requeue()));
        };
        ctx.normal(
            &pass.vdb,
            events::ADD_NODE_START,
            format!("Starting add database node for pod(s) '{}'", pod_names(pods)),
        )
        .await;
        let start = Instant::now();
        let opts = AddNodeOptions {
            initiator,
            subcluster: sc_name.to_string(),
            hosts: pods.iter().map(PodFact::host).collect(),
        };
        let result = ctx.dispatcher.add_node(&opts).await;
        if let Some(d) = dispatch_outcome(ctx, pass, result, events::ADD_NODE_FAILED).await? {
            return Ok(Some(d));
        }
        pass.pfacts.invalidate();
        ctx.normal(
            &pass.vdb,
            events::ADD_NODE_SUCCEEDED,
            format!(
                "Successfully added database nodes and it took {}s",
                start.elapsed().as_secs()
            ),
        )
        .await;
        Ok(None)
    }
}

// ============================================================================
// DbRemoveNode
// ============================================================================

pub struct DbRemoveNodeActor;

#[async_trait]
impl Actor for DbRemoveNodeActor {
    fn name(&self) -> &'static str {
        "DbRemoveNode"
    }

    async fn reconcile(&self, ctx: &ActorContext, pass: &mut ReconcilePass) -> Result<Directive> {
        if pass.vdb.spec.init_policy == InitPolicy::ScheduleOnly {
            return Ok(Directive::Continue);
        }
        pass.collect(ctx).await?;

        let scope = pass.pfacts.scope.clone();
        let names: Vec<String> = pass
            .vdb
            .subclusters_in_scope(&scope)
            .into_iter()
            .map(|sc| sc.name.clone())
            .collect();
        let mut requeue = false;
        for sc_name in names {
            let leaving: Vec<PodFact> = pass
                .pfacts
                .in_subcluster(&sc_name)
                .into_iter()
                .filter(|p| p.is_pending_delete && p.db_exists)
                .cloned()
                .collect();
            let (ready, waiting): (Vec<PodFact>, Vec<PodFact>) =
                leaving.into_iter().partition(|p| p.is_pod_running);
            if !waiting.is_empty() {
                info!(pods = %pod_names(&waiting), "pods need scale down but are not running");
                requeue = true;
            }
            if ready.is_empty() {
                continue;
            }
            if let Some(d) = self.remove_nodes(ctx, pass, &ready).await? {
                return Ok(d);
            }
        }
        Ok(if requeue {
            Directive::requeue()
        } else {
            Directive::Continue
        })
    }
}

impl DbRemoveNodeActor {
    async fn remove_nodes(
        &self,
        ctx: &ActorContext,
        pass: &mut ReconcilePass,
        pods: &[PodFact],
    ) -> Result<Option<Directive>> {
        let Some(initiator) = pass
            .pfacts
            .find_pod_to_run_admin_cmd_any()
            .map(|p| p.name.clone())
        else {
            info!("no pod to run remove node from, requeue");
            return Ok(Some(Directive::requeue()));
        };
        ctx.normal(
            &pass.vdb,
            events::REMOVE_NODES_START,
            format!("Starting database remove node for pods '{}'", pod_names(pods)),
        )
        .await;
        let start = Instant::now();
        let hosts: Vec<Host> = pods.iter().map(PodFact::host).collect();
        let opts = RemoveNodeOptions { initiator, hosts };
        let result = ctx.dispatcher.remove_node(&opts).await;
        if let Some(d) = dispatch_outcome(ctx, pass, result, events::REMOVE_NODES_FAILED).await? {
            return Ok(Some(d));
        }
        pass.pfacts.invalidate();
        ctx.normal(
            &pass.vdb,
            events::REMOVE_NODES_SUCCEEDED,
            format!(
                "Successfully removed nodes from database and it took {}s",
                start.elapsed().as_secs()
            ),
        )
        .await;
        Ok(None)
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
    use super::*;
    use crate::client::DispatchCall;
    use crate::controller::actors::testing::{Harness, fact, vdb};
    use crate::controller::config::PassConfig;
    use crate::crd::{Subcluster, SubclusterType, VerticaDB};
    use crate::resources::statefulset::generate_statefulset;

    fn eon(subclusters: Vec<Subcluster>) -> VerticaDB {
        let mut v = vdb(&[], subclusters);
        v.spec.communal.path = "s3://bucket/db".into();
        v
    }

    fn new_pod(sc: &str, index: i32) -> PodFact {
        PodFact {
            db_exists: false,
            up_node: false,
            is_primary: false,
            vnode_name: String::new(),
            ..fact(sc, index)
        }
    }

    #[tokio::test]
    async fn test_add_subcluster_for_new_spec_entry() {
        let h = Harness::new();
        h.runner.respond_any("FROM subclusters", "pri\n");
        let v = eon(vec![
            Subcluster::new("pri", 1, SubclusterType::Primary),
            Subcluster::new("sec", 1, SubclusterType::Secondary),
        ]);
        let mut pass = h.pass(&v, vec![fact("pri", 0), new_pod("sec", 0)]).await;
        let d = DbAddSubclusterActor.reconcile(&h.ctx, &mut pass).await.unwrap();
        assert_eq!(d, Directive::Continue);
        let calls = h.dispatcher.calls_named("add_subcluster");
        assert_eq!(calls.len(), 1);
        let DispatchCall::AddSubcluster(opts) = &calls[0] else {
            panic!("unexpected call");
        };
        assert_eq!(opts.subcluster, "sec");
        assert!(!opts.is_primary);
        assert!(h.events.has_reason(events::ADD_SUBCLUSTER_SUCCEEDED));
    }

    #[tokio::test]
    async fn test_add_subcluster_skips_enterprise() {
        let h = Harness::new();
        let v = vdb(&[], vec![Subcluster::new("pri", 1, SubclusterType::Primary)]);
        let mut pass = h.pass(&v, vec![fact("pri", 0)]).await;
        DbAddSubclusterActor.reconcile(&h.ctx, &mut pass).await.unwrap();
        assert!(h.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_add_node_for_pods_without_database() {
        let h = Harness::new();
        let v = eon(vec![Subcluster::new("pri", 3, SubclusterType::Primary)]);
        let mut pass = h
            .pass(&v, vec![fact("pri", 0), new_pod("pri", 2), new_pod("pri", 1)])
            .await;
        let d = DbAddNodeActor.reconcile(&h.ctx, &mut pass).await.unwrap();
        assert_eq!(d, Directive::Continue);
        let calls = h.dispatcher.calls_named("add_node");
        assert_eq!(calls.len(), 1);
        let DispatchCall::AddNode(opts) = &calls[0] else {
            panic!("unexpected call");
        };
        assert_eq!(opts.initiator.name, "v-pri-0");
        let names: Vec<_> = opts.hosts.iter().map(|h| h.pod.name.as_str()).collect();
        assert_eq!(names, ["v-pri-1", "v-pri-2"]);
    }

    #[tokio::test]
    async fn test_add_node_waits_for_install() {
        let h = Harness::new();
        let v = eon(vec![Subcluster::new("pri", 2, SubclusterType::Primary)]);
        let mut pending = new_pod("pri", 1);
        pending.is_installed = false;
        let mut pass = h.pass(&v, vec![fact("pri", 0), pending]).await;
        let d = DbAddNodeActor.reconcile(&h.ctx, &mut pass).await.unwrap();
        assert_eq!(d, Directive::requeue());
        assert!(h.dispatcher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_add_node_failure_requeues() {
        let h = Harness::new();
        h.dispatcher.fail_op("add_node", "license limit");
        let v = eon(vec![Subcluster::new("pri", 2, SubclusterType::Primary)]);
        let mut pass = h.pass(&v, vec![fact("pri", 0), new_pod("pri", 1)]).await;
        let d = DbAddNodeActor.reconcile(&h.ctx, &mut pass).await.unwrap();
        assert_eq!(d, Directive::requeue());
        assert!(h.events.has_reason(events::ADD_NODE_FAILED));
    }

    #[tokio::test]
    async fn test_remove_node_for_pods_beyond_size() {
        let h = Harness::new();
        let v = eon(vec![Subcluster::new("pri", 2, SubclusterType::Primary)]);
        let mut leaving = fact("pri", 2);
        leaving.is_pending_delete = true;
        let mut pass = h
            .pass(&v, vec![fact("pri", 0), fact("pri", 1), leaving])
            .await;
        let d = DbRemoveNodeActor.reconcile(&h.ctx, &mut pass).await.unwrap();
        assert_eq!(d, Directive::Continue);
        let calls = h.dispatcher.calls_named("remove_node");
        let DispatchCall::RemoveNode(opts) = &calls[0] else {
            panic!("unexpected call");
        };
        assert_eq!(opts.hosts.len(), 1);
        assert_eq!(opts.hosts[0].pod.name, "v-pri-2");
        assert!(h.events.has_reason(events::REMOVE_NODES_SUCCEEDED));
    }

    #[tokio::test]
    async fn test_remove_node_waits_for_stopped_pod() {
        let h = Harness::new();
        let v = eon(vec![Subcluster::new("pri", 1, SubclusterType::Primary)]);
        let mut leaving = fact("pri", 1);
        leaving.is_pending_delete = true;
        leaving.is_pod_running = false;
        let mut pass = h.pass(&v, vec![fact("pri", 0), leaving]).await;
        let d = DbRemoveNodeActor.reconcile(&h.ctx, &mut pass).await.unwrap();
        assert_eq!(d, Directive::requeue());
        assert!(h.dispatcher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_remove_subcluster_moves_default_first() {
        let h = Harness::new();
        h.runner.respond_any("is_default", "old\n");
        let full = eon(vec![
            Subcluster::new("pri", 1, SubclusterType::Primary),
            Subcluster::new("old", 1, SubclusterType::Secondary),
        ]);
        let cfg = PassConfig::from_vdb(&full);
        let sts = generate_statefulset(&full, &full.spec.subclusters[1], &cfg);
        h.state.put_statefulset("ns", &sts).await;

        let mut v = full.clone();
        v.spec.subclusters.truncate(1);
        let mut old = fact("old", 0);
        old.is_pending_delete = true;
        let mut pass = h.pass(&v, vec![fact("pri", 0), old]).await;
        let d = DbRemoveSubclusterActor.reconcile(&h.ctx, &mut pass).await.unwrap();
        assert_eq!(d, Directive::Continue);
        assert_eq!(h.runner.calls_matching("SET DEFAULT").len(), 1);
        assert!(h.runner.calls_matching("SET DEFAULT")[0]
            .command_line()
            .contains("\"pri\""));
        assert_eq!(h.dispatcher.calls_named("remove_subcluster").len(), 1);
    }
}
