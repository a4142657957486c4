//! Offline upgrade: stop the whole database, swap the image and start it
//! again.
//!
//! The steps run in a fixed order every pass. Each step is a no-op once its
//! work is done, so a pass that resumes an interrupted upgrade falls through
//! the finished steps and picks up where the previous one stopped.

use std::time::Instant;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::client::dispatcher::StopDbOptions;
use crate::controller::actor::{Actor, ActorContext, Directive, ReconcilePass};
use crate::controller::actors::client_routing::{ClientRoutingActor, RoutingMode};
use crate::controller::actors::image_version::ImageVersionActor;
use crate::controller::actors::install::InstallActor;
use crate::controller::actors::objects::{ObjReconcilerActor, ObjScope};
use crate::controller::actors::packages::InstallPackagesActor;
use crate::controller::actors::restart::RestartActor;
use crate::controller::error::{Error, Result};
use crate::controller::events;
use crate::controller::upgrade_manager::{StsSelector, UpgradeManager, UpgradeStrategy};
use crate::crd::UpgradePolicy;

pub const OFFLINE_UPGRADE_STATUS_MSGS: [&str; 4] = [
    "Shutting down cluster",
    "Rescheduling pods with new image",
    "Restarting cluster with new image",
    "Reinstalling default packages",
];

const SHUTDOWN_MSG: usize = 0;
const RESCHEDULE_MSG: usize = 1;
const RESTART_MSG: usize = 2;
const PACKAGES_MSG: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Step {
    Start,
    WarnIncompatiblePolicy,
    PostShutdownMsg,
    StopCluster,
    PostRescheduleMsg,
    UpdateImages,
    DeletePods,
    CheckNmaDeployment,
    WaitForNewPods,
    CheckVersion,
    PostRestartMsg,
    AnnotatePods,
    Install,
    Restart,
    PostPackagesMsg,
    InstallPackages,
    AddClientRouting,
    Finish,
}

const STEPS: [Step; 18] = [
    Step::Start,
    Step::WarnIncompatiblePolicy,
    Step::PostShutdownMsg,
    Step::StopCluster,
    Step::PostRescheduleMsg,
    Step::UpdateImages,
    Step::DeletePods,
    Step::CheckNmaDeployment,
    Step::WaitForNewPods,
    Step::CheckVersion,
    Step::PostRestartMsg,
    Step::AnnotatePods,
    Step::Install,
    Step::Restart,
    Step::PostPackagesMsg,
    Step::InstallPackages,
    Step::AddClientRouting,
    Step::Finish,
];

pub struct OfflineUpgradeActor;

#[async_trait]
impl Actor for OfflineUpgradeActor {
    fn name(&self) -> &'static str {
        "OfflineUpgrade"
    }

    async fn reconcile(&self, ctx: &ActorContext, pass: &mut ReconcilePass) -> Result<Directive> {
        let mut mgr = UpgradeManager::new(UpgradeStrategy::Offline);
        if !mgr.is_upgrade_needed(ctx, pass).await? {
            return Ok(Directive::Continue);
        }
        pass.collect(ctx).await?;

        for step in STEPS {
            let d = run_step(step, &mgr, ctx, pass).await?;
            if !d.is_continue() {
                info!(step = ?step, "offline upgrade waiting");
                return Ok(Directive::requeue_after(pass.config.upgrade_requeue_time));
            }
        }
        Ok(Directive::Continue)
    }
}

async fn run_step(
    step: Step,
    mgr: &UpgradeManager,
    ctx: &ActorContext,
    pass: &mut ReconcilePass,
) -> Result<Directive> {
    let msgs = &OFFLINE_UPGRADE_STATUS_MSGS;
    match step {
        Step::Start => mgr.start_upgrade(ctx, pass).await.map(|()| Directive::Continue),
        Step::WarnIncompatiblePolicy => {
            if !mgr.is_continuing()
                && pass.pfacts.scope.is_main()
                && matches!(
                    pass.vdb.spec.upgrade_policy,
                    UpgradePolicy::Online | UpgradePolicy::ReadOnlyOnline
                )
            {
                ctx.normal(
                    &pass.vdb,
                    events::INCOMPATIBLE_ONLINE_UPGRADE,
                    "Online upgrade was requested but it is incompatible with the Vertica server.  \
                     Falling back to offline upgrade.",
                )
                .await;
            }
            Ok(Directive::Continue)
        }
        Step::PostShutdownMsg => post(mgr, ctx, pass, msgs, SHUTDOWN_MSG).await,
        Step::StopCluster => stop_cluster(ctx, pass).await,
        Step::PostRescheduleMsg => post(mgr, ctx, pass, msgs, RESCHEDULE_MSG).await,
        Step::UpdateImages => {
            if mgr
                .update_statefulset_images(ctx, pass, StsSelector::NonTransient)
                .await?
                > 0
            {
                pass.pfacts.invalidate();
            }
            Ok(Directive::Continue)
        }
        Step::DeletePods => {
            if mgr.delete_pods_running_old_image(ctx, pass, None).await? > 0 {
                pass.pfacts.invalidate();
            }
            Ok(Directive::Continue)
        }
        Step::CheckNmaDeployment => mgr.change_nma_deployment_if_needed(ctx, pass).await,
        Step::WaitForNewPods => {
            if mgr.any_pod_has_new_image(ctx, pass).await? {
                Ok(Directive::Continue)
            } else {
                info!("waiting for a pod with the new image");
                Ok(Directive::requeue())
            }
        }
        Step::CheckVersion => {
            if pass.config.ignore_upgrade_path {
                return Ok(Directive::Continue);
            }
            ImageVersionActor::new(true).reconcile(ctx, pass).await
        }
        Step::PostRestartMsg => post(mgr, ctx, pass, msgs, RESTART_MSG).await,
        Step::AnnotatePods => ObjReconcilerActor::new(ObjScope::CreateOnly).reconcile(ctx, pass).await,
        Step::Install => InstallActor.reconcile(ctx, pass).await,
        Step::Restart => RestartActor::new(true).reconcile(ctx, pass).await,
        Step::PostPackagesMsg => post(mgr, ctx, pass, msgs, PACKAGES_MSG).await,
        Step::InstallPackages => InstallPackagesActor.reconcile(ctx, pass).await,
        Step::AddClientRouting => {
            ClientRoutingActor::new(RoutingMode::PodReschedule)
                .reconcile(ctx, pass)
                .await
        }
        Step::Finish => mgr.finish_upgrade(ctx, pass).await.map(|()| Directive::Continue),
    }
}

async fn post(
    mgr: &UpgradeManager,
    ctx: &ActorContext,
    pass: &mut ReconcilePass,
    msgs: &[&str],
    idx: usize,
) -> Result<Directive> {
    mgr.post_next_status_msg(ctx, pass, msgs, idx).await?;
    Ok(Directive::Continue)
}

/// Stop vertica if any up node still runs the old image.
async fn stop_cluster(ctx: &ActorContext, pass: &mut ReconcilePass) -> Result<Directive> {
    pass.collect(ctx).await?;
    let target = pass.vdb.image_for_scope(&pass.pfacts.scope).to_string();
    let Some(initiator) = pass.pfacts.find_running_pod().map(|p| p.name.clone()) else {
        info!("no pods running, skipping shutdown");
        return Ok(Directive::Continue);
    };
    if pass.pfacts.up_node_count() == 0 {
        info!("no vertica process running, nothing to shut down");
        return Ok(Directive::Continue);
    }
    if !pass.pfacts.iter().any(|p| p.up_node && p.image != target) {
        info!("no vertica process running with the old image");
        return Ok(Directive::Continue);
    }

    ctx.normal(&pass.vdb, events::CLUSTER_SHUTDOWN_STARTED, "Starting stop database")
        .await;
    let start = Instant::now();
    let opts = StopDbOptions {
        initiator,
        scope: pass.pfacts.scope.clone(),
    };
    match ctx.dispatcher.stop_db(&opts).await {
        Ok(()) => {}
        Err(e @ Error::Dispatch { .. }) => {
            warn!(error = %e, "stop database failed");
            ctx.warning(&pass.vdb, events::CLUSTER_SHUTDOWN_FAILED, "Failed to shutdown the cluster")
                .await;
            pass.pfacts.invalidate();
            return Ok(Directive::requeue());
        }
        Err(e) => return Err(e),
    }
    pass.pfacts.invalidate();
    ctx.normal(
        &pass.vdb,
        events::CLUSTER_SHUTDOWN_SUCCEEDED,
        format!(
            "Successfully shutdown the database and it took {}s",
            start.elapsed().as_secs()
        ),
    )
    .await;
    Ok(Directive::Continue)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::client::ClusterState;
    use crate::controller::actors::testing::{Harness, fact, vdb};
    use crate::controller::config::PassConfig;
    use crate::crd::annotations::{K_SAFETY, VERSION};
    use crate::crd::{ConditionType, Subcluster, SubclusterType, VerticaDB};
    use crate::podfacts::PodFact;
    use crate::resources::statefulset::{generate_statefulset, server_image};

    const OLD: &str = "vertica:old";
    const NEW: &str = "vertica:new";

    fn offline_vdb() -> VerticaDB {
        let mut v = vdb(
            &[(VERSION, "v24.2.0-0"), (K_SAFETY, "0")],
            vec![Subcluster::new("sc", 2, SubclusterType::Primary)],
        );
        v.spec.image = NEW.into();
        v
    }

    fn old_fact(index: i32) -> PodFact {
        PodFact {
            image: OLD.into(),
            ..fact("sc", index)
        }
    }

    async fn seed_old_statefulset(h: &Harness, v: &VerticaDB) {
        let mut old = v.clone();
        old.spec.image = OLD.into();
        let cfg = PassConfig::from_vdb(&old);
        let sts = generate_statefulset(&old, &old.spec.subclusters[0], &cfg);
        h.state.put_statefulset("ns", &sts).await;
    }

    #[tokio::test]
    async fn test_not_needed_when_images_match() {
        let h = Harness::new();
        let v = offline_vdb();
        let cfg = PassConfig::from_vdb(&v);
        let sts = generate_statefulset(&v, &v.spec.subclusters[0], &cfg);
        h.state.put_statefulset("ns", &sts).await;
        let mut pass = h.pass(&v, vec![fact("sc", 0)]).await;
        let d = OfflineUpgradeActor.reconcile(&h.ctx, &mut pass).await.unwrap();
        assert_eq!(d, Directive::Continue);
        assert!(!pass.vdb.is_condition_true(ConditionType::UpgradeInProgress));
    }

    #[tokio::test]
    async fn test_first_pass_stops_cluster_and_swaps_image() {
        let h = Harness::new();
        let v = offline_vdb();
        seed_old_statefulset(&h, &v).await;
        let mut pass = h.pass(&v, vec![old_fact(0), old_fact(1)]).await;

        let d = OfflineUpgradeActor.reconcile(&h.ctx, &mut pass).await.unwrap();
        assert_eq!(d, Directive::requeue_after(pass.config.upgrade_requeue_time));
        assert!(pass.vdb.is_condition_true(ConditionType::UpgradeInProgress));
        assert!(pass.vdb.is_condition_true(ConditionType::OfflineUpgradeInProgress));
        assert_eq!(h.dispatcher.calls_named("stop_db").len(), 1);
        assert!(h.events.has_reason(events::UPGRADE_START));
        assert!(h.events.has_reason(events::CLUSTER_SHUTDOWN_SUCCEEDED));
        assert_eq!(pass.vdb.upgrade_status(), OFFLINE_UPGRADE_STATUS_MSGS[RESCHEDULE_MSG]);

        let sts = h.state.get_statefulset("ns", "v-sc").await.unwrap().unwrap();
        assert_eq!(server_image(&sts), Some(NEW));
    }

    #[tokio::test]
    async fn test_stop_failure_requeues_with_event() {
        let h = Harness::new();
        h.dispatcher.fail_op("stop_db", "timeout");
        let v = offline_vdb();
        seed_old_statefulset(&h, &v).await;
        let mut pass = h.pass(&v, vec![old_fact(0), old_fact(1)]).await;
        let d = OfflineUpgradeActor.reconcile(&h.ctx, &mut pass).await.unwrap();
        assert!(!d.is_continue());
        assert!(h.events.has_reason(events::CLUSTER_SHUTDOWN_FAILED));
        assert_eq!(pass.vdb.upgrade_status(), OFFLINE_UPGRADE_STATUS_MSGS[SHUTDOWN_MSG]);
        let sts = h.state.get_statefulset("ns", "v-sc").await.unwrap().unwrap();
        assert_eq!(server_image(&sts), Some(OLD));
    }

    #[tokio::test]
    async fn test_incompatible_policy_is_reported() {
        let h = Harness::new();
        let mut v = offline_vdb();
        v.spec.upgrade_policy = UpgradePolicy::Online;
        v.metadata.annotations = Some([(VERSION.to_string(), "v11.0.1".to_string())].into());
        seed_old_statefulset(&h, &v).await;
        let mut pass = h.pass(&v, vec![old_fact(0), old_fact(1)]).await;
        OfflineUpgradeActor.reconcile(&h.ctx, &mut pass).await.unwrap();
        assert!(h.events.has_reason(events::INCOMPATIBLE_ONLINE_UPGRADE));
    }
}
