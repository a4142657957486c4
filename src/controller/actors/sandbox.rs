//! Moving secondary subclusters in and out of sandboxes.
//!
//! `spec.sandboxes` is the wanted layout and `status.sandboxes` records what
//! the database has actually done. A subcluster listed in a spec sandbox but
//! not in its status entry gets sandboxed. A subcluster still listed in a
//! status entry but no longer in that spec sandbox gets unsandboxed.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::client::dispatcher::{SandboxSubclusterOptions, UnsandboxSubclusterOptions};
use crate::controller::actor::{Actor, ActorContext, Directive, ReconcilePass};
use crate::controller::error::Result;
use crate::controller::events;
use crate::controller::status::update_vdb_status_with_retry;
use crate::crd::version::SANDBOX_SUPPORTED_MIN_VERSION;
use crate::crd::{ClusterScope, InitPolicy, VerticaDB};
use crate::podfacts::PodFacts;

/// Fresh facts for one scope, independent of the pass's own facts.
pub(crate) async fn collect_scope(
    ctx: &ActorContext,
    pass: &ReconcilePass,
    scope: ClusterScope,
) -> Result<PodFacts> {
    let mut facts = PodFacts::new(scope);
    facts
        .collect(ctx.state.as_ref(), ctx.runner.as_ref(), &pass.vdb, &pass.config)
        .await?;
    Ok(facts)
}

/// `(sandbox, subcluster)` pairs the database has not sandboxed yet.
fn pending_sandboxing(vdb: &VerticaDB) -> Vec<(String, String)> {
    let declared = vdb.subcluster_map();
    let mut pending = Vec::new();
    for sb in &vdb.spec.sandboxes {
        let done = vdb.find_sandbox_status(&sb.name);
        for sc in &sb.subclusters {
            if done.is_some_and(|s| s.subclusters.contains(&sc.name)) {
                continue;
            }
            match declared.get(sc.name.as_str()) {
                Some(def) if def.is_secondary() => pending.push((sb.name.clone(), sc.name.clone())),
                Some(_) => warn!(subcluster = %sc.name, sandbox = %sb.name, "only secondaries can be sandboxed"),
                None => warn!(subcluster = %sc.name, sandbox = %sb.name, "sandbox names an unknown subcluster"),
            }
        }
    }
    pending
}

/// `(sandbox, subcluster)` pairs recorded in the status that the spec moved
/// out of their sandbox.
fn pending_unsandboxing(vdb: &VerticaDB) -> Vec<(String, String)> {
    let Some(status) = &vdb.status else {
        return Vec::new();
    };
    status
        .sandboxes
        .iter()
        .flat_map(|sb| {
            let scope = ClusterScope::Sandbox(sb.name.clone());
            sb.subclusters
                .iter()
                .filter(move |sc| vdb.scope_of_subcluster(sc) != scope)
                .map(move |sc| (sb.name.clone(), sc.clone()))
        })
        .collect()
}

async fn record_sandboxed(
    ctx: &ActorContext,
    pass: &mut ReconcilePass,
    sandbox: &str,
    subcluster: &str,
) -> Result<()> {
    let updated = update_vdb_status_with_retry(ctx.state.as_ref(), &pass.vdb, |v| {
        v.update_sandbox_status(sandbox, |s| {
            if s.subclusters.iter().any(|sc| sc == subcluster) {
                return false;
            }
            s.subclusters.push(subcluster.to_string());
            true
        })
    })
    .await?;
    pass.set_vdb(updated);
    Ok(())
}

/// Drop a subcluster from its status entry, and the entry once it is empty.
async fn record_unsandboxed(
    ctx: &ActorContext,
    pass: &mut ReconcilePass,
    sandbox: &str,
    subcluster: &str,
) -> Result<()> {
    let updated = update_vdb_status_with_retry(ctx.state.as_ref(), &pass.vdb, |v| {
        let sandboxes = &mut v.status_mut().sandboxes;
        let before = sandboxes.clone();
        for sb in sandboxes.iter_mut().filter(|sb| sb.name == sandbox) {
            sb.subclusters.retain(|sc| sc != subcluster);
        }
        sandboxes.retain(|sb| !sb.subclusters.is_empty() || sb.upgrade_state.upgrade_in_progress);
        *sandboxes != before
    })
    .await?;
    pass.set_vdb(updated);
    Ok(())
}

/// Sandboxes the subclusters named by `spec.sandboxes`. Runs in the main
/// cluster's pass.
pub struct SandboxSubclusterActor;

#[async_trait]
impl Actor for SandboxSubclusterActor {
    fn name(&self) -> &'static str {
        "SandboxSubcluster"
    }

    async fn reconcile(&self, ctx: &ActorContext, pass: &mut ReconcilePass) -> Result<Directive> {
        if pass.vdb.spec.init_policy == InitPolicy::ScheduleOnly
            || !pass.vdb.is_eon()
            || !pass.config.uses_vclusterops()
            || !pass.pfacts.scope.is_main()
        {
            return Ok(Directive::Continue);
        }
        let pending = pending_sandboxing(&pass.vdb);
        if pending.is_empty() {
            return Ok(Directive::Continue);
        }
        let mut facts = BTreeMap::new();
        for (sb, _) in &pending {
            if !facts.contains_key(sb) {
                let collected = collect_scope(ctx, pass, ClusterScope::Sandbox(sb.clone())).await?;
                facts.insert(sb.clone(), collected);
            }
        }
        self.sandbox_pending(ctx, pass, &facts).await
    }
}

impl SandboxSubclusterActor {
    /// Sandbox every pending subcluster whose pods are all up. `facts` holds
    /// the facts of each sandbox scope.
    pub(crate) async fn sandbox_pending(
        &self,
        ctx: &ActorContext,
        pass: &mut ReconcilePass,
        facts: &BTreeMap<String, PodFacts>,
    ) -> Result<Directive> {
        pass.collect(ctx).await?;
        let mut directive = Directive::Continue;
        for (sb, sc) in pending_sandboxing(&pass.vdb) {
            let scope = ClusterScope::Sandbox(sb.clone());
            let pods = facts.get(&sb).map(|f| f.in_subcluster(&sc)).unwrap_or_default();
            if pods.is_empty() || pods.iter().any(|p| !p.up_node) {
                info!(subcluster = %sc, sandbox = %sb, "waiting for subcluster to be up before sandboxing");
                directive = Directive::requeue();
                continue;
            }
            // The database already did it; only the status write was lost.
            if pods.iter().all(|p| p.sandbox == scope) {
                record_sandboxed(ctx, pass, &sb, &sc).await?;
                continue;
            }
            let Some(initiator) = pass
                .pfacts
                .find_first_pod_sorted(|p| p.up_node && p.is_primary && !p.read_only)
                .map(|p| p.name.clone())
            else {
                info!("no up primary in the main cluster, requeue sandboxing");
                return Ok(Directive::requeue());
            };

            ctx.normal(
                &pass.vdb,
                events::SANDBOX_SUBCLUSTER_START,
                format!("Starting to add subcluster '{sc}' to sandbox '{sb}'"),
            )
            .await;
            let opts = SandboxSubclusterOptions {
                initiator,
                subcluster: sc.clone(),
                sandbox: sb.clone(),
            };
            if let Err(e) = ctx.dispatcher.sandbox_subcluster(&opts).await {
                ctx.warning(
                    &pass.vdb,
                    events::SANDBOX_SUBCLUSTER_FAILED,
                    format!("Failed to add subcluster '{sc}' to sandbox '{sb}'"),
                )
                .await;
                return Err(e);
            }
            ctx.normal(
                &pass.vdb,
                events::SANDBOX_SUBCLUSTER_SUCCEEDED,
                format!("Successfully added subcluster '{sc}' to sandbox '{sb}'"),
            )
            .await;
            record_sandboxed(ctx, pass, &sb, &sc).await?;
            pass.pfacts.invalidate();
        }
        Ok(directive)
    }
}

/// Returns subclusters that left their sandbox in the spec to the main
/// cluster.
pub struct UnsandboxSubclusterActor;

#[async_trait]
impl Actor for UnsandboxSubclusterActor {
    fn name(&self) -> &'static str {
        "UnsandboxSubcluster"
    }

    async fn reconcile(&self, ctx: &ActorContext, pass: &mut ReconcilePass) -> Result<Directive> {
        if !pass.config.uses_vclusterops() || !pass.pfacts.scope.is_main() {
            return Ok(Directive::Continue);
        }
        let pending = pending_unsandboxing(&pass.vdb);
        if pending.is_empty() {
            return Ok(Directive::Continue);
        }
        pass.collect(ctx).await?;

        for (sb, sc) in pending {
            let pods = pass.pfacts.in_subcluster(&sc);
            if pods.iter().any(|p| p.up_node && p.sandbox.is_main()) {
                info!(subcluster = %sc, sandbox = %sb, "subcluster already back in the main cluster");
                record_unsandboxed(ctx, pass, &sb, &sc).await?;
                continue;
            }
            let Some(initiator) = pass
                .pfacts
                .find_first_pod_sorted(|p| {
                    p.up_node && p.is_primary && p.sandbox.is_main() && p.subcluster_name != sc
                })
                .map(|p| p.name.clone())
            else {
                info!("no up primary in the main cluster, requeue unsandboxing");
                return Ok(Directive::requeue());
            };

            ctx.normal(
                &pass.vdb,
                events::UNSANDBOX_SUBCLUSTER_START,
                format!("Starting to remove subcluster '{sc}' from sandbox '{sb}'"),
            )
            .await;
            let opts = UnsandboxSubclusterOptions {
                initiator,
                subcluster: sc.clone(),
            };
            if let Err(e) = ctx.dispatcher.unsandbox_subcluster(&opts).await {
                ctx.warning(
                    &pass.vdb,
                    events::UNSANDBOX_SUBCLUSTER_FAILED,
                    format!("Failed to remove subcluster '{sc}' from sandbox '{sb}'"),
                )
                .await;
                return Err(e);
            }
            ctx.normal(
                &pass.vdb,
                events::UNSANDBOX_SUBCLUSTER_SUCCEEDED,
                format!("Successfully removed subcluster '{sc}' from sandbox '{sb}'"),
            )
            .await;
            record_unsandboxed(ctx, pass, &sb, &sc).await?;
            // Nodes come back down and get restarted by the main cluster.
            pass.pfacts.invalidate();
        }
        Ok(Directive::Continue)
    }
}

/// First actor of a sandbox pass: sandboxes need the vcluster CLI and a
/// server that knows about them.
pub struct VerifySandboxDeploymentActor;

#[async_trait]
impl Actor for VerifySandboxDeploymentActor {
    fn name(&self) -> &'static str {
        "VerifySandboxDeployment"
    }

    async fn reconcile(&self, ctx: &ActorContext, pass: &mut ReconcilePass) -> Result<Directive> {
        let Some(sb) = pass.pfacts.scope.sandbox_name().map(str::to_string) else {
            return Ok(Directive::Continue);
        };
        if !pass.config.uses_vclusterops() {
            ctx.warning(
                &pass.vdb,
                events::UNSUPPORTED_DEPLOYMENT,
                format!("Sandbox '{sb}' requires a vclusterops deployment"),
            )
            .await;
            return Ok(Directive::requeue());
        }
        if pass.config.version.is_some() && !pass.config.version_at_least(SANDBOX_SUPPORTED_MIN_VERSION) {
            ctx.warning(
                &pass.vdb,
                events::UNSUPPORTED_VERTICA_VERSION,
                format!("Sandbox '{sb}' requires a server of at least {SANDBOX_SUPPORTED_MIN_VERSION}"),
            )
            .await;
            return Ok(Directive::requeue());
        }
        Ok(Directive::Continue)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::client::DispatchCall;
    use crate::controller::actors::testing::{Harness, fact, vdb};
    use crate::crd::annotations::{VCLUSTER_OPS, VERSION};
    use crate::crd::{Sandbox, SandboxStatus, SandboxSubcluster, Subcluster, SubclusterType};
    use crate::podfacts::PodFact;

    fn sandboxed_vdb(sandboxes: &[(&str, &str)]) -> VerticaDB {
        let mut v = vdb(
            &[(VERSION, "v24.3.0-0")],
            vec![
                Subcluster::new("pri", 1, SubclusterType::Primary),
                Subcluster::new("sec", 1, SubclusterType::Secondary),
            ],
        );
        v.spec.communal.path = "s3://bucket/db".into();
        v.spec.sandboxes = sandboxes
            .iter()
            .map(|(sb, sc)| Sandbox {
                name: sb.to_string(),
                image: None,
                subclusters: vec![SandboxSubcluster { name: sc.to_string() }],
            })
            .collect();
        v
    }

    fn secondary(sandbox: ClusterScope, up: bool) -> PodFact {
        PodFact {
            is_primary: false,
            sandbox,
            up_node: up,
            ..fact("sec", 0)
        }
    }

    fn sandbox_facts(pods: Vec<PodFact>) -> BTreeMap<String, PodFacts> {
        let scope = ClusterScope::Sandbox("sb1".into());
        [("sb1".to_string(), PodFacts::from_facts(scope, pods))].into()
    }

    fn status_subclusters(v: &VerticaDB, sb: &str) -> Vec<String> {
        v.find_sandbox_status(sb).map(|s| s.subclusters.clone()).unwrap_or_default()
    }

    #[test]
    fn test_pending_sandboxing_skips_recorded_and_primaries() {
        let mut v = sandboxed_vdb(&[("sb1", "sec"), ("sb2", "pri")]);
        assert_eq!(pending_sandboxing(&v), vec![("sb1".to_string(), "sec".to_string())]);
        v.update_sandbox_status("sb1", |s| s.subclusters.push("sec".into()));
        assert!(pending_sandboxing(&v).is_empty());
    }

    #[tokio::test]
    async fn test_sandboxes_up_subcluster() {
        let h = Harness::new();
        let mut pass = h.pass(&sandboxed_vdb(&[("sb1", "sec")]), vec![fact("pri", 0)]).await;
        let facts = sandbox_facts(vec![secondary(ClusterScope::MainCluster, true)]);
        let d = SandboxSubclusterActor
            .sandbox_pending(&h.ctx, &mut pass, &facts)
            .await
            .unwrap();
        assert_eq!(d, Directive::Continue);
        let calls = h.dispatcher.calls_named("sandbox_subcluster");
        assert_eq!(calls.len(), 1);
        let DispatchCall::SandboxSubcluster(opts) = &calls[0] else {
            panic!("unexpected call {:?}", calls[0]);
        };
        assert_eq!(opts.subcluster, "sec");
        assert_eq!(opts.sandbox, "sb1");
        assert_eq!(opts.initiator.name, "v-pri-0");
        assert_eq!(status_subclusters(&pass.vdb, "sb1"), vec!["sec".to_string()]);
        assert!(h.events.has_reason(events::SANDBOX_SUBCLUSTER_START));
        assert!(h.events.has_reason(events::SANDBOX_SUBCLUSTER_SUCCEEDED));
    }

    #[tokio::test]
    async fn test_down_subcluster_waits() {
        let h = Harness::new();
        let mut pass = h.pass(&sandboxed_vdb(&[("sb1", "sec")]), vec![fact("pri", 0)]).await;
        let facts = sandbox_facts(vec![secondary(ClusterScope::MainCluster, false)]);
        let d = SandboxSubclusterActor
            .sandbox_pending(&h.ctx, &mut pass, &facts)
            .await
            .unwrap();
        assert_eq!(d, Directive::requeue());
        assert!(h.dispatcher.calls().is_empty());
        assert!(status_subclusters(&pass.vdb, "sb1").is_empty());
    }

    #[tokio::test]
    async fn test_already_sandboxed_is_only_recorded() {
        let h = Harness::new();
        let mut pass = h.pass(&sandboxed_vdb(&[("sb1", "sec")]), vec![fact("pri", 0)]).await;
        let facts = sandbox_facts(vec![secondary(ClusterScope::Sandbox("sb1".into()), true)]);
        SandboxSubclusterActor
            .sandbox_pending(&h.ctx, &mut pass, &facts)
            .await
            .unwrap();
        assert!(h.dispatcher.calls().is_empty());
        assert_eq!(status_subclusters(&pass.vdb, "sb1"), vec!["sec".to_string()]);
    }

    #[tokio::test]
    async fn test_sandbox_failure_emits_event() {
        let h = Harness::new();
        h.dispatcher.fail_op("sandbox_subcluster", "boom");
        let mut pass = h.pass(&sandboxed_vdb(&[("sb1", "sec")]), vec![fact("pri", 0)]).await;
        let facts = sandbox_facts(vec![secondary(ClusterScope::MainCluster, true)]);
        let res = SandboxSubclusterActor.sandbox_pending(&h.ctx, &mut pass, &facts).await;
        assert!(res.is_err());
        assert!(h.events.has_reason(events::SANDBOX_SUBCLUSTER_FAILED));
        assert!(status_subclusters(&pass.vdb, "sb1").is_empty());
    }

    #[tokio::test]
    async fn test_unsandbox_when_removed_from_spec() {
        let h = Harness::new();
        let mut v = sandboxed_vdb(&[]);
        v.status_mut().sandboxes.push(SandboxStatus {
            name: "sb1".into(),
            subclusters: vec!["sec".into()],
            ..Default::default()
        });
        let mut pass = h
            .pass(
                &v,
                vec![fact("pri", 0), secondary(ClusterScope::Sandbox("sb1".into()), true)],
            )
            .await;
        let d = UnsandboxSubclusterActor.reconcile(&h.ctx, &mut pass).await.unwrap();
        assert_eq!(d, Directive::Continue);
        let calls = h.dispatcher.calls_named("unsandbox_subcluster");
        assert_eq!(calls.len(), 1);
        let DispatchCall::UnsandboxSubcluster(opts) = &calls[0] else {
            panic!("unexpected call {:?}", calls[0]);
        };
        assert_eq!(opts.subcluster, "sec");
        assert_eq!(opts.initiator.name, "v-pri-0");
        assert!(pass.vdb.find_sandbox_status("sb1").is_none());
        assert!(h.events.has_reason(events::UNSANDBOX_SUBCLUSTER_SUCCEEDED));
    }

    #[tokio::test]
    async fn test_unsandbox_leaves_spec_sandboxes_alone() {
        let h = Harness::new();
        let mut v = sandboxed_vdb(&[("sb1", "sec")]);
        v.update_sandbox_status("sb1", |s| s.subclusters.push("sec".into()));
        let mut pass = h.pass(&v, vec![fact("pri", 0)]).await;
        UnsandboxSubclusterActor.reconcile(&h.ctx, &mut pass).await.unwrap();
        assert!(h.dispatcher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_sandbox_pass_requires_vclusterops() {
        let h = Harness::new();
        let v = sandboxed_vdb(&[("sb1", "sec")]);
        let mut admintools = v.clone();
        admintools
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(VCLUSTER_OPS.into(), "false".into());

        let mut pass = h.pass(&admintools, vec![]).await;
        pass.pfacts = PodFacts::from_facts(ClusterScope::Sandbox("sb1".into()), []);
        let d = VerifySandboxDeploymentActor.reconcile(&h.ctx, &mut pass).await.unwrap();
        assert_eq!(d, Directive::requeue());
        assert!(h.events.has_reason(events::UNSUPPORTED_DEPLOYMENT));

        let mut pass = h.pass(&v, vec![]).await;
        pass.pfacts = PodFacts::from_facts(ClusterScope::Sandbox("sb1".into()), []);
        let d = VerifySandboxDeploymentActor.reconcile(&h.ctx, &mut pass).await.unwrap();
        assert_eq!(d, Directive::Continue);
    }
}
