//! Read-only online upgrade: the image changes one group of subclusters at a
//! time while the rest of the database keeps serving clients.
//!
//! All primaries are recreated together. While they are down the secondaries
//! keep running the old version in read-only mode, optionally helped by a
//! transient subcluster that takes client traffic. The secondaries follow one
//! by one.
//!
//! The list of steps and status messages is derived from the spec every pass.
//! It only depends on the subcluster layout, so a resumed upgrade lines up
//! with the status message the previous pass posted.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::controller::actor::{Actor, ActorContext, Directive, ReconcilePass};
use crate::controller::actors::client_routing::{ClientRoutingActor, RoutingMode, set_routing_label};
use crate::controller::actors::drain_node::any_active_sessions;
use crate::controller::actors::image_version::ImageVersionActor;
use crate::controller::actors::install::{InstallActor, UninstallActor};
use crate::controller::actors::membership::{
    DbAddNodeActor, DbAddSubclusterActor, DbRemoveSubclusterActor,
};
use crate::controller::actors::objects::{ObjReconcilerActor, ObjScope};
use crate::controller::actors::packages::InstallPackagesActor;
use crate::controller::actors::rebalance::RebalanceShardsActor;
use crate::controller::actors::restart::RestartActor;
use crate::controller::error::Result;
use crate::controller::status::update_vdb_with_retry;
use crate::controller::upgrade_manager::{StsSelector, UpgradeManager, UpgradeStrategy};
use crate::crd::{ClusterScope, VerticaDB};
use crate::podfacts::PodFact;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Step {
    Start,
    Post(usize),
    CreateTransient,
    /// Take the routing label off pods still on the old image.
    Reroute(Vec<String>),
    Drain(Vec<String>),
    Recreate(Vec<String>),
    WaitForPods(Vec<String>),
    CheckVersion,
    AnnotatePods,
    Install,
    WaitForReadOnly,
    Restart,
    AddRouting(Vec<String>),
    DestroyTransient,
    InstallPackages,
    Finish,
}

/// Steps of one upgrade and the status messages they post.
#[derive(Debug, Default)]
struct Plan {
    msgs: Vec<String>,
    steps: Vec<Step>,
}

impl Plan {
    fn post(&mut self, msg: impl Into<String>) {
        self.steps.push(Step::Post(self.msgs.len()));
        self.msgs.push(msg.into());
    }

    fn push(&mut self, step: Step) {
        self.steps.push(step);
    }

    fn build(vdb: &VerticaDB, scope: &ClusterScope) -> Self {
        let (primaries, secondaries): (Vec<String>, Vec<String>) = {
            let (p, s): (Vec<_>, Vec<_>) = vdb
                .subclusters_in_scope(scope)
                .into_iter()
                .filter(|sc| !sc.is_transient())
                .partition(|sc| sc.is_primary());
            (
                p.into_iter().map(|sc| sc.name.clone()).collect(),
                s.into_iter().map(|sc| sc.name.clone()).collect(),
            )
        };
        let mut plan = Plan::default();
        plan.push(Step::Start);
        plan.read_only_online(vdb.requires_transient_subcluster(), primaries, secondaries);
        plan.post("Reinstalling default packages");
        plan.push(Step::InstallPackages);
        plan.push(Step::Finish);
        plan
    }

    fn read_only_online(&mut self, transient: bool, primaries: Vec<String>, secondaries: Vec<String>) {
        if transient {
            self.post("Creating transient secondary subcluster");
            self.push(Step::CreateTransient);
        }
        self.post("Draining primary subclusters");
        self.push(Step::Reroute(primaries.clone()));
        self.push(Step::Drain(primaries.clone()));
        self.post("Recreating pods for primary subclusters");
        self.push(Step::Recreate(primaries.clone()));
        self.push(Step::WaitForPods(primaries.clone()));
        self.post("Checking if new version is compatible");
        self.push(Step::CheckVersion);
        self.post("Adding annotations to pods");
        self.push(Step::AnnotatePods);
        self.post("Running installer");
        self.push(Step::Install);
        self.post("Waiting for secondary nodes to become read-only");
        self.push(Step::WaitForReadOnly);
        self.post("Restarting vertica in primary subclusters");
        self.push(Step::Restart);
        self.push(Step::AddRouting(primaries));

        for sc in secondaries {
            let group = vec![sc.clone()];
            self.post(format!("Draining secondary subcluster '{sc}'"));
            self.push(Step::Reroute(group.clone()));
            self.push(Step::Drain(group.clone()));
            self.post(format!("Recreating pods for secondary subcluster '{sc}'"));
            self.push(Step::Recreate(group.clone()));
            self.push(Step::WaitForPods(group.clone()));
            self.post(format!("Restarting vertica in secondary subcluster '{sc}'"));
            self.push(Step::AnnotatePods);
            self.push(Step::Install);
            self.push(Step::Restart);
            self.push(Step::AddRouting(group));
        }

        if transient {
            self.post("Destroying transient secondary subcluster");
            self.push(Step::DestroyTransient);
        }
    }
}

pub struct ReadOnlyOnlineUpgradeActor;

#[async_trait]
impl Actor for ReadOnlyOnlineUpgradeActor {
    fn name(&self) -> &'static str {
        "ReadOnlyOnlineUpgrade"
    }

    async fn reconcile(&self, ctx: &ActorContext, pass: &mut ReconcilePass) -> Result<Directive> {
        let mut mgr = UpgradeManager::new(UpgradeStrategy::ReadOnlyOnline);
        if !mgr.is_upgrade_needed(ctx, pass).await? {
            return Ok(Directive::Continue);
        }
        pass.collect(ctx).await?;
        mgr.cache_primary_images(ctx, pass).await?;
        let plan = Plan::build(&pass.vdb, &pass.pfacts.scope);
        let msgs: Vec<&str> = plan.msgs.iter().map(String::as_str).collect();
        for step in &plan.steps {
            let d = run_step(step, &mgr, &msgs, ctx, pass).await?;
            if !d.is_continue() {
                info!(step = ?step, "read-only online upgrade waiting");
                return Ok(Directive::requeue_after(pass.config.upgrade_requeue_time));
            }
        }
        Ok(Directive::Continue)
    }
}

async fn run_step(
    step: &Step,
    mgr: &UpgradeManager,
    msgs: &[&str],
    ctx: &ActorContext,
    pass: &mut ReconcilePass,
) -> Result<Directive> {
    match step {
        Step::Start => mgr.start_upgrade(ctx, pass).await.map(|()| Directive::Continue),
        Step::Post(idx) => {
            mgr.post_next_status_msg(ctx, pass, msgs, *idx).await?;
            Ok(Directive::Continue)
        }
        Step::CreateTransient => create_transient(mgr, ctx, pass).await,
        Step::Reroute(names) => reroute(ctx, pass, names).await,
        Step::Drain(names) => {
            pass.collect(ctx).await?;
            let pods = old_image_pods(pass, names);
            if any_active_sessions(ctx, &pods).await? {
                return Ok(Directive::requeue());
            }
            Ok(Directive::Continue)
        }
        Step::Recreate(names) => recreate(mgr, ctx, pass, names).await,
        Step::WaitForPods(names) => wait_for_pods(ctx, pass, names).await,
        Step::CheckVersion => {
            if pass.config.ignore_upgrade_path {
                return Ok(Directive::Continue);
            }
            ImageVersionActor::new(true).reconcile(ctx, pass).await
        }
        Step::AnnotatePods => ObjReconcilerActor::new(ObjScope::CreateOnly).reconcile(ctx, pass).await,
        Step::Install => InstallActor.reconcile(ctx, pass).await,
        Step::WaitForReadOnly => {
            pass.collect(ctx).await?;
            let target = pass.vdb.image_for_scope(&pass.pfacts.scope).to_string();
            if pass.pfacts.count_up_primary_nodes() == 0
                && pass.pfacts.count_not_read_only_with_old_image(&target) > 0
            {
                info!("secondaries are not read-only yet");
                pass.pfacts.invalidate();
                return Ok(Directive::requeue());
            }
            Ok(Directive::Continue)
        }
        Step::Restart => RestartActor::new(false).reconcile(ctx, pass).await,
        Step::AddRouting(names) => {
            for sc in names {
                let d = ClientRoutingActor::for_subcluster(RoutingMode::PodReschedule, sc.clone())
                    .reconcile(ctx, pass)
                    .await?;
                if !d.is_continue() {
                    return Ok(d);
                }
            }
            Ok(Directive::Continue)
        }
        Step::DestroyTransient => destroy_transient(ctx, pass).await,
        Step::InstallPackages => InstallPackagesActor.reconcile(ctx, pass).await,
        Step::Finish => mgr.finish_upgrade(ctx, pass).await.map(|()| Directive::Continue),
    }
}

/// Pods of the named subclusters that still run another image than the
/// target.
fn old_image_pods(pass: &ReconcilePass, names: &[String]) -> Vec<PodFact> {
    let target = pass.vdb.image_for_scope(&pass.pfacts.scope);
    pass.pfacts
        .filter_pods(|p| p.exists && names.contains(&p.subcluster_name) && p.image != target)
        .into_iter()
        .cloned()
        .collect()
}

async fn reroute(ctx: &ActorContext, pass: &mut ReconcilePass, names: &[String]) -> Result<Directive> {
    pass.collect(ctx).await?;
    for pf in old_image_pods(pass, names) {
        set_routing_label(ctx, &pf, false).await?;
    }
    Ok(Directive::Continue)
}

async fn recreate(
    mgr: &UpgradeManager,
    ctx: &ActorContext,
    pass: &mut ReconcilePass,
    names: &[String],
) -> Result<Directive> {
    let mut changed = 0;
    for sc in names {
        changed += mgr
            .update_statefulset_images(ctx, pass, StsSelector::Subcluster(sc))
            .await?;
        changed += mgr.delete_pods_running_old_image(ctx, pass, Some(sc)).await?;
    }
    if changed > 0 {
        pass.pfacts.invalidate();
    }
    mgr.change_nma_deployment_if_needed(ctx, pass).await
}

/// Requeue until every pod of the named subclusters runs the target image.
pub(crate) async fn wait_for_pods(ctx: &ActorContext, pass: &mut ReconcilePass, names: &[String]) -> Result<Directive> {
    pass.collect(ctx).await?;
    let target = pass.vdb.image_for_scope(&pass.pfacts.scope).to_string();
    let waiting = pass.pfacts.find_first_pod_sorted(|p| {
        names.contains(&p.subcluster_name)
            && !p.is_pending_delete
            && (!p.is_pod_running || p.image != target)
    });
    if let Some(pf) = waiting {
        info!(pod = %pf.name, "waiting for pod to run the new image");
        pass.pfacts.invalidate();
        return Ok(Directive::requeue());
    }
    Ok(Directive::Continue)
}

/// Add the transient subcluster to the spec and bring it into the database
/// on the old image so clients have somewhere to go while the primaries
/// restart.
async fn create_transient(
    mgr: &UpgradeManager,
    ctx: &ActorContext,
    pass: &mut ReconcilePass,
) -> Result<Directive> {
    let target = pass.vdb.image_for_scope(&pass.pfacts.scope).to_string();
    if mgr.primary_images().iter().all(|img| *img == target) {
        debug!("primaries already on the new image, skipping transient subcluster");
        return Ok(Directive::Continue);
    }
    pass.collect(ctx).await?;
    if pass.pfacts.up_node_count() == 0 {
        debug!("no up nodes, skipping transient subcluster");
        return Ok(Directive::Continue);
    }
    let Some(old_image) = mgr.fetch_old_image(&target) else {
        return Ok(Directive::Continue);
    };
    let Some(transient) = pass.vdb.build_transient_subcluster(old_image) else {
        return Ok(Directive::Continue);
    };

    if pass.vdb.find_transient_subcluster().is_none() {
        info!(subcluster = %transient.name, image = old_image, "adding transient subcluster");
        let updated = update_vdb_with_retry(ctx.state.as_ref(), &pass.vdb, |v| {
            if v.find_transient_subcluster().is_some() {
                return false;
            }
            v.spec.subclusters.push(transient.clone());
            true
        })
        .await?;
        pass.set_vdb(updated);
        pass.pfacts.invalidate();
    }

    let name = transient.name;
    let actors: [Box<dyn Actor>; 6] = [
        Box::new(ObjReconcilerActor::new(ObjScope::CreateOnly)),
        Box::new(InstallActor),
        Box::new(DbAddSubclusterActor),
        Box::new(DbAddNodeActor),
        Box::new(RebalanceShardsActor::for_subcluster(name.clone())),
        Box::new(ClientRoutingActor::for_subcluster(RoutingMode::AddNode, name)),
    ];
    run_all(&actors, ctx, pass).await
}

/// Remove the transient subcluster from the spec and the database, then
/// delete its objects.
async fn destroy_transient(ctx: &ActorContext, pass: &mut ReconcilePass) -> Result<Directive> {
    let Some(name) = pass.vdb.build_transient_subcluster("").map(|sc| sc.name) else {
        return Ok(Directive::Continue);
    };
    if pass.vdb.find_transient_subcluster().is_some() {
        info!(subcluster = %name, "removing transient subcluster");
        let updated = update_vdb_with_retry(ctx.state.as_ref(), &pass.vdb, |v| {
            let before = v.spec.subclusters.len();
            v.spec.subclusters.retain(|sc| !sc.is_transient());
            v.spec.subclusters.len() != before
        })
        .await?;
        pass.set_vdb(updated);
        pass.pfacts.invalidate();
    }

    let actors: [Box<dyn Actor>; 4] = [
        Box::new(ClientRoutingActor::for_subcluster(RoutingMode::DelNode, name)),
        Box::new(DbRemoveSubclusterActor),
        Box::new(UninstallActor),
        Box::new(ObjReconcilerActor::new(ObjScope::All)),
    ];
    run_all(&actors, ctx, pass).await
}

/// Run `actors` in order, stopping at the first that does not continue.
pub(crate) async fn run_all(
    actors: &[Box<dyn Actor>],
    ctx: &ActorContext,
    pass: &mut ReconcilePass,
) -> Result<Directive> {
    for actor in actors {
        let d = actor.reconcile(ctx, pass).await?;
        if !d.is_continue() {
            debug!(actor = actor.name(), "sub-actor asked to requeue");
            return Ok(d);
        }
    }
    Ok(Directive::Continue)
}
