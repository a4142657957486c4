//! Bring the database into existence: create a new one or revive one from
//! communal storage, depending on the init policy.

use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::client::{Host, PodName};
use crate::client::dispatcher::{CreateDbOptions, ReviveDbOptions};
use crate::controller::actor::{Actor, ActorContext, Directive, ReconcilePass};
use crate::controller::error::{Error, Result};
use crate::controller::events;
use crate::controller::status::update_condition;
use crate::crd::{Condition, ConditionType, InitPolicy, Subcluster};
use crate::podfacts::PodFact;

const INITIALIZED_REASON: &str = "Initialized";

/// Result of the checks both init paths share.
enum Readiness {
    /// Nothing to do this pass.
    Done,
    Wait,
    Ready(Vec<Host>),
}

/// Common gate: returns the hosts to initialize from once every one of them
/// is running and installed.
async fn readiness(
    ctx: &ActorContext,
    pass: &mut ReconcilePass,
    wanted: &[InitPolicy],
    host_filter: impl Fn(&PodFact) -> bool,
) -> Result<Readiness> {
    if !wanted.contains(&pass.vdb.spec.init_policy) {
        return Ok(Readiness::Done);
    }
    if pass.vdb.is_condition_true(ConditionType::DbInitialized) {
        return Ok(Readiness::Done);
    }
    pass.collect(ctx).await?;
    if pass.pfacts.does_db_exist() {
        debug!("database already exists");
        mark_initialized(ctx, pass).await?;
        return Ok(Readiness::Done);
    }

    let pods = pass.pfacts.filter_pods(|p| host_filter(p));
    if pods.is_empty() {
        info!("no pods to initialize the database from, requeue");
        return Ok(Readiness::Wait);
    }
    if let Some(pod) = pods
        .iter()
        .find(|p| !p.is_pod_running || !p.is_installed || p.pod_ip.is_empty())
    {
        info!(pod = %pod.name, "pod is not ready for database initialization, requeue");
        return Ok(Readiness::Wait);
    }

    let secret = &pass.vdb.spec.communal.credential_secret;
    if !secret.is_empty()
        && ctx
            .state
            .get_secret(&pass.namespace(), secret)
            .await?
            .is_none()
    {
        info!(secret = %secret, "communal credential secret not found, requeue");
        return Ok(Readiness::Wait);
    }
    Ok(Readiness::Ready(pods.into_iter().map(PodFact::host).collect()))
}

async fn mark_initialized(ctx: &ActorContext, pass: &mut ReconcilePass) -> Result<()> {
    let condition = Condition::new(
        ConditionType::DbInitialized,
        true,
        INITIALIZED_REASON,
        "",
        pass.vdb.metadata.generation,
    );
    let updated = update_condition(ctx.state.as_ref(), &pass.vdb, condition).await?;
    pass.set_vdb(updated);
    Ok(())
}

// ============================================================================
// CreateDb
// ============================================================================

/// Creates the database on the first primary subcluster.
pub struct CreateDbActor;

#[async_trait]
impl Actor for CreateDbActor {
    fn name(&self) -> &'static str {
        "CreateDb"
    }

    async fn reconcile(&self, ctx: &ActorContext, pass: &mut ReconcilePass) -> Result<Directive> {
        let Some(sc) = pass.vdb.first_primary_subcluster().cloned() else {
            return Ok(Directive::Continue);
        };
        let wanted = [InitPolicy::Create, InitPolicy::CreateSkipPackageInstall];
        let hosts = match readiness(ctx, pass, &wanted, |p| p.subcluster_name == sc.name).await? {
            Readiness::Done => return Ok(Directive::Continue),
            Readiness::Wait => return Ok(Directive::requeue()),
            Readiness::Ready(hosts) => hosts,
        };
        let Some(initiator) = hosts.first().map(|h| h.pod.clone()) else {
            return Ok(Directive::requeue());
        };

        let opts = create_options(pass, &sc, initiator, hosts);
        ctx.normal(
            &pass.vdb,
            events::CREATE_DB_START,
            "Calling create database to create the database",
        )
        .await;
        let start = Instant::now();
        match ctx.dispatcher.create_db(&opts).await {
            Ok(()) => {}
            Err(Error::Dispatch { message, .. }) => {
                ctx.warning(
                    &pass.vdb,
                    events::CREATE_DB_FAILED,
                    format!("Failed to create the database: {message}"),
                )
                .await;
                pass.pfacts.invalidate();
                return Ok(Directive::requeue());
            }
            Err(e) => return Err(e),
        }
        ctx.normal(
            &pass.vdb,
            events::CREATE_DB_SUCCEEDED,
            format!(
                "Successfully created database with subcluster '{}'. It took {:?}",
                sc.name,
                start.elapsed()
            ),
        )
        .await;
        mark_initialized(ctx, pass).await?;
        pass.pfacts.invalidate();
        Ok(Directive::Continue)
    }
}

fn create_options(
    pass: &ReconcilePass,
    sc: &Subcluster,
    initiator: PodName,
    hosts: Vec<Host>,
) -> CreateDbOptions {
    let vdb = &pass.vdb;
    CreateDbOptions {
        initiator,
        hosts,
        communal_path: if vdb.is_eon() {
            vdb.communal_path()
        } else {
            String::new()
        },
        communal_endpoint: vdb.spec.communal.endpoint.clone(),
        catalog_path: vdb.spec.local.catalog_path().to_string(),
        data_path: vdb.spec.local.data_path.clone(),
        depot_path: vdb.spec.local.depot_path.clone(),
        shard_count: vdb.spec.shard_count,
        subcluster: sc.name.clone(),
        skip_package_install: vdb.spec.init_policy == InitPolicy::CreateSkipPackageInstall,
    }
}

// ============================================================================
// ReviveDb
// ============================================================================

/// Revives an existing database from communal storage onto every pod.
pub struct ReviveDbActor;

#[async_trait]
impl Actor for ReviveDbActor {
    fn name(&self) -> &'static str {
        "ReviveDb"
    }

    async fn reconcile(&self, ctx: &ActorContext, pass: &mut ReconcilePass) -> Result<Directive> {
        let wanted = [InitPolicy::Revive];
        let hosts = match readiness(ctx, pass, &wanted, |p| !p.is_transient && !p.is_pending_delete)
            .await?
        {
            Readiness::Done => return Ok(Directive::Continue),
            Readiness::Wait => return Ok(Directive::requeue()),
            Readiness::Ready(hosts) => hosts,
        };
        let Some(initiator) = hosts.first().map(|h| h.pod.clone()) else {
            return Ok(Directive::requeue());
        };

        let opts = ReviveDbOptions {
            initiator,
            hosts,
            communal_path: pass.vdb.spec.communal.path.clone(),
            communal_endpoint: pass.vdb.spec.communal.endpoint.clone(),
        };
        ctx.normal(
            &pass.vdb,
            events::REVIVE_DB_START,
            "Calling revive database to revive the database",
        )
        .await;
        let start = Instant::now();
        match ctx.dispatcher.revive_db(&opts).await {
            Ok(()) => {}
            Err(Error::Dispatch { message, .. }) => {
                ctx.warning(
                    &pass.vdb,
                    events::REVIVE_DB_FAILED,
                    format!("Failed to revive the database: {message}"),
                )
                .await;
                pass.pfacts.invalidate();
                return Ok(Directive::requeue());
            }
            Err(e) => return Err(e),
        }
        ctx.normal(
            &pass.vdb,
            events::REVIVE_DB_SUCCEEDED,
            format!("Successfully revived database. It took {:?}", start.elapsed()),
        )
        .await;
        mark_initialized(ctx, pass).await?;
        pass.pfacts.invalidate();
        Ok(Directive::Continue)
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
    use crate::crd::SubclusterType;

    fn fresh(sc: &str, index: i32) -> PodFact {
        PodFact {
            db_exists: false,
            up_node: false,
            vnode_name: String::new(),
            ..fact(sc, index)
        }
    }

    fn subclusters() -> Vec<Subcluster> {
        vec![
            Subcluster::new("pri", 2, SubclusterType::Primary),
            Subcluster::new("sec", 1, SubclusterType::Secondary),
        ]
    }

    #[tokio::test]
    async fn test_create_uses_first_primary_only() {
        let h = Harness::new();
        let facts = vec![fresh("pri", 0), fresh("pri", 1), fresh("sec", 0)];
        let mut pass = h.pass(&vdb(&[], subclusters()), facts).await;
        let d = CreateDbActor.reconcile(&h.ctx, &mut pass).await.unwrap();
        assert_eq!(d, Directive::Continue);
        let calls = h.dispatcher.calls_named("create_db");
        assert_eq!(calls.len(), 1);
        let DispatchCall::CreateDb(opts) = &calls[0] else {
            panic!("unexpected call");
        };
        assert_eq!(opts.hosts.len(), 2);
        assert_eq!(opts.subcluster, "pri");
        assert_eq!(opts.shard_count, 12);
        assert!(pass.vdb.is_condition_true(ConditionType::DbInitialized));
        assert!(h.events.has_reason(events::CREATE_DB_SUCCEEDED));
    }

    #[tokio::test]
    async fn test_existing_database_only_sets_condition() {
        let h = Harness::new();
        let mut pass = h.pass(&vdb(&[], subclusters()), vec![fact("pri", 0)]).await;
        let d = CreateDbActor.reconcile(&h.ctx, &mut pass).await.unwrap();
        assert_eq!(d, Directive::Continue);
        assert!(h.dispatcher.calls().is_empty());
        assert!(pass.vdb.is_condition_true(ConditionType::DbInitialized));
    }

    #[tokio::test]
    async fn test_create_waits_for_running_pods() {
        let h = Harness::new();
        let mut down = fresh("pri", 1);
        down.is_pod_running = false;
        let mut pass = h.pass(&vdb(&[], subclusters()), vec![fresh("pri", 0), down]).await;
        let d = CreateDbActor.reconcile(&h.ctx, &mut pass).await.unwrap();
        assert_eq!(d, Directive::requeue());
        assert!(h.dispatcher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_create_failure_requeues_with_event() {
        let h = Harness::new();
        h.dispatcher.fail_op("create_db", "communal storage not reachable");
        let mut pass = h.pass(&vdb(&[], subclusters()), vec![fresh("pri", 0), fresh("pri", 1)]).await;
        let d = CreateDbActor.reconcile(&h.ctx, &mut pass).await.unwrap();
        assert_eq!(d, Directive::requeue());
        assert!(h.events.has_reason(events::CREATE_DB_FAILED));
        assert!(!pass.vdb.is_condition_true(ConditionType::DbInitialized));
    }

    #[tokio::test]
    async fn test_revive_uses_every_pod() {
        let h = Harness::new();
        let mut v = vdb(&[], subclusters());
        v.spec.init_policy = InitPolicy::Revive;
        v.spec.communal.path = "s3://bucket/db".into();
        let facts = vec![fresh("pri", 0), fresh("pri", 1), fresh("sec", 0)];
        let mut pass = h.pass(&v, facts).await;

        assert_eq!(CreateDbActor.reconcile(&h.ctx, &mut pass).await.unwrap(), Directive::Continue);
        assert!(h.dispatcher.calls().is_empty());

        let d = ReviveDbActor.reconcile(&h.ctx, &mut pass).await.unwrap();
        assert_eq!(d, Directive::Continue);
        let calls = h.dispatcher.calls_named("revive_db");
        let DispatchCall::ReviveDb(opts) = &calls[0] else {
            panic!("unexpected call");
        };
        assert_eq!(opts.hosts.len(), 3);
        assert_eq!(opts.communal_path, "s3://bucket/db");
    }
}
