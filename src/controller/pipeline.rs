//! The reconcile pipeline.
//!
//! One pass runs every actor in a fixed order and stops at the first one that
//! asks to come back later. The order is a dependency chain: status is
//! refreshed before decisions are made on it, objects exist before installs,
//! the database exists before membership changes, membership settles before
//! shards are rebalanced.
//!
//! Every sandbox the database has created gets a pass of its own after the
//! main cluster's, scoped to the sandbox's subclusters.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::ResourceExt;
use kube::runtime::controller::Action;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::actor::{Actor, ActorContext, Directive, ReconcilePass};
use super::actors::{
    AdditionalBucketsActor, ClientRoutingActor, CrashLoopActor, CreateDbActor, DbAddNodeActor,
    DbAddSubclusterActor, DbRemoveNodeActor, DbRemoveSubclusterActor, DrainNodeActor,
    ImageVersionActor, InstallActor, InstallPackagesActor, ObjReconcilerActor, ObjScope,
    OfflineUpgradeActor, PasswordSecretActor, ReadOnlyOnlineUpgradeActor, RebalanceShardsActor,
    ReplicatedUpgradeActor, RestartActor, ReviveDbActor, RoutingMode, SandboxSubclusterActor,
    StatusActor, TlsCertRotationActor, UninstallActor, UnsandboxSubclusterActor,
    VerifySandboxDeploymentActor,
};
use super::config::{DeploymentMode, PassConfig};
use super::context::Context;
use super::error::{Error, Result};
use super::events::{self, EventKind, EventSink};
use crate::client::cluster_state::secret_value;
use crate::client::{
    AdmintoolsDispatcher, DatabaseTarget, Dispatcher, KubePodRunner, PodRunner,
    VClusterDispatcher, VsqlCredentials,
};
use crate::crd::{ClusterScope, VerticaDB};
use crate::crd::annotations::SUPERUSER_PASSWORD_KEY;

/// Delay for a requeue that names none.
pub const DEFAULT_REQUEUE: Duration = Duration::from_secs(5);

/// Build the actors of one pass, in execution order.
pub fn build_actors() -> Vec<Box<dyn Actor>> {
    vec![
        Box::new(StatusActor),
        Box::new(OfflineUpgradeActor),
        Box::new(ReplicatedUpgradeActor),
        Box::new(ReadOnlyOnlineUpgradeActor),
        Box::new(ObjReconcilerActor::new(ObjScope::CreateOnly)),
        Box::new(RestartActor::new(true)),
        Box::new(StatusActor),
        Box::new(ClientRoutingActor::new(RoutingMode::PodReschedule)),
        Box::new(ClientRoutingActor::new(RoutingMode::DelNode)),
        Box::new(UnsandboxSubclusterActor),
        Box::new(DrainNodeActor),
        Box::new(DbRemoveSubclusterActor),
        Box::new(StatusActor),
        Box::new(DbRemoveNodeActor),
        Box::new(StatusActor),
        Box::new(UninstallActor),
        Box::new(StatusActor),
        Box::new(ObjReconcilerActor::new(ObjScope::All)),
        // Upgrade actors check the path themselves.
        Box::new(ImageVersionActor::new(false)),
        Box::new(InstallActor),
        Box::new(StatusActor),
        Box::new(CreateDbActor),
        Box::new(ReviveDbActor),
        Box::new(AdditionalBucketsActor),
        Box::new(PasswordSecretActor),
        Box::new(TlsCertRotationActor),
        Box::new(StatusActor),
        Box::new(ClientRoutingActor::new(RoutingMode::AddNode)),
        Box::new(DbAddSubclusterActor),
        Box::new(StatusActor),
        Box::new(DbAddNodeActor),
        Box::new(StatusActor),
        Box::new(RebalanceShardsActor::new()),
        Box::new(InstallPackagesActor),
        Box::new(ClientRoutingActor::new(RoutingMode::AddNode)),
        Box::new(SandboxSubclusterActor),
        Box::new(CrashLoopActor),
    ]
}

/// Actors of a sandbox's pass. Membership belongs to the main cluster, so a
/// sandbox only keeps its objects, image and processes in line.
pub fn build_sandbox_actors() -> Vec<Box<dyn Actor>> {
    vec![
        Box::new(VerifySandboxDeploymentActor),
        Box::new(StatusActor),
        Box::new(OfflineUpgradeActor),
        Box::new(ObjReconcilerActor::new(ObjScope::All)),
        Box::new(RestartActor::new(true)),
        Box::new(StatusActor),
    ]
}

/// Run `actors` in order until one of them does not continue.
///
/// A requeue is returned as the actor produced it, except that the
/// per-resource requeue time replaces its delay when configured.
pub async fn run_pipeline(
    actors: &[Box<dyn Actor>],
    ctx: &ActorContext,
    pass: &mut ReconcilePass,
) -> Result<Directive> {
    for actor in actors {
        let span = info_span!("actor", actor = actor.name());
        let directive = match actor.reconcile(ctx, pass).instrument(span).await {
            Ok(d) => d,
            Err(e) => {
                warn!(actor = actor.name(), error = %e, "actor failed");
                return Err(e);
            }
        };
        if !directive.is_continue() {
            debug!(actor = actor.name(), ?directive, "actor stopped the pass");
            if let Some(health) = &ctx.health {
                health.metrics.record_actor_abort(actor.name());
            }
            return Ok(directive.with_override(pass.config.requeue_time));
        }
    }
    Ok(Directive::Continue)
}

/// Merge the outcomes of two passes: any requeue wins, the sooner one first.
pub fn combine(a: Directive, b: Directive) -> Directive {
    match (a, b) {
        (Directive::Continue, d) | (d, Directive::Continue) => d,
        (Directive::Requeue { after: x }, Directive::Requeue { after: y }) => {
            let x = x.unwrap_or(DEFAULT_REQUEUE);
            let y = y.unwrap_or(DEFAULT_REQUEUE);
            Directive::requeue_after(x.min(y))
        }
    }
}

/// Run a pass for every sandbox the database already created.
pub async fn reconcile_sandboxes(ctx: &ActorContext, namespace: &str, name: &str) -> Result<Directive> {
    let vdb = ctx.state.get_vdb(namespace, name).await?;
    let sandboxes: Vec<String> = vdb
        .spec
        .sandboxes
        .iter()
        .filter(|sb| vdb.find_sandbox_status(&sb.name).is_some())
        .map(|sb| sb.name.clone())
        .collect();
    let mut directive = Directive::Continue;
    for sb in sandboxes {
        let span = info_span!("sandbox", sandbox = %sb);
        let mut pass = ReconcilePass::with_scope(vdb.clone(), ClusterScope::Sandbox(sb));
        let d = run_pipeline(&build_sandbox_actors(), ctx, &mut pass)
            .instrument(span)
            .await?;
        directive = combine(directive, d);
    }
    Ok(directive)
}

/// Map a pass outcome to the controller action.
pub fn action_for(directive: Directive) -> Action {
    match directive {
        Directive::Continue => Action::await_change(),
        Directive::Requeue { after: None } => Action::requeue(DEFAULT_REQUEUE),
        Directive::Requeue { after: Some(d) } => Action::requeue(d),
    }
}

/// Name of the secret holding the superuser password currently in effect.
///
/// The status keeps the old secret until a rotation succeeds.
pub fn active_password_secret(vdb: &VerticaDB) -> Option<&str> {
    vdb.status
        .as_ref()
        .and_then(|s| s.password_secret.as_deref())
        .or(vdb.spec.password_secret.as_deref())
        .filter(|s| !s.is_empty())
}

/// Build the dispatcher for the pass's deployment mode.
pub fn dispatcher_for(
    config: &PassConfig,
    runner: Arc<dyn PodRunner>,
    target: DatabaseTarget,
) -> Arc<dyn Dispatcher> {
    match config.deployment {
        DeploymentMode::Admintools => Arc::new(AdmintoolsDispatcher::new(runner, target)),
        DeploymentMode::VClusterOps => Arc::new(VClusterDispatcher::new(runner, target)),
    }
}

/// Reconcile one VerticaDB.
pub async fn reconcile(obj: Arc<VerticaDB>, ctx: Arc<Context>) -> Result<Action> {
    let start_time = Instant::now();
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());

    debug!(name = %name, namespace = %namespace, "Reconciling VerticaDB");

    // Owned objects go away with the resource through owner references.
    if obj.metadata.deletion_timestamp.is_some() {
        info!(name = %name, "VerticaDB is being deleted");
        return Ok(Action::await_change());
    }

    let vdb = (*obj).clone();
    let config = PassConfig::from_vdb(&vdb);

    let password = match active_password_secret(&vdb) {
        None => None,
        Some(secret_name) => match ctx.state.get_secret(&namespace, secret_name).await? {
            Some(secret) => secret_value(&secret, SUPERUSER_PASSWORD_KEY),
            None => {
                warn!(name = %name, secret = %secret_name, "password secret not found");
                ctx.event(
                    &vdb,
                    EventKind::Warning,
                    events::SUPERUSER_PASSWORD_SECRET_NOT_FOUND,
                    format!("Could not find the password secret '{secret_name}'"),
                )
                .await;
                return Ok(Action::requeue(config.requeue_time.unwrap_or(DEFAULT_REQUEUE)));
            }
        },
    };

    let runner: Arc<dyn PodRunner> = Arc::new(
        KubePodRunner::new(ctx.client.clone()).with_credentials(VsqlCredentials {
            user: config.superuser.clone(),
            password: password.clone(),
        }),
    );
    let target = DatabaseTarget {
        db_name: vdb.spec.db_name.clone(),
        password,
        version: config.version.clone(),
    };
    let actor_ctx = ActorContext {
        state: ctx.state.clone(),
        dispatcher: dispatcher_for(&config, runner.clone(), target),
        runner,
        events: ctx.clone(),
        health: ctx.health_state.clone(),
    };

    let mut pass = ReconcilePass::new(vdb);
    let main = run_pipeline(&build_actors(), &actor_ctx, &mut pass).await?;
    let directive = combine(main, reconcile_sandboxes(&actor_ctx, &namespace, &name).await?);

    if let Some(health) = &ctx.health_state {
        health
            .metrics
            .record_reconcile(&namespace, &name, start_time.elapsed().as_secs_f64());
        health.mark_reconciled();
    }

    debug!(name = %name, ?directive, "Reconcile pass finished");
    Ok(action_for(directive))
}

/// Error policy for the controller
pub fn error_policy(obj: Arc<VerticaDB>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());

    if let Some(ref health_state) = ctx.health_state {
        health_state.metrics.record_error(&namespace, &name);
    }

    if error.is_not_found() {
        debug!(name = %name, "Resource not found (likely deleted)");
        return Action::await_change();
    }

    if error.is_retryable() {
        warn!(name = %name, error = %error, "Retryable error, will retry");
    } else {
        error!(name = %name, error = %error, "Non-retryable error");
    }
    Action::requeue(error.requeue_after())
}
