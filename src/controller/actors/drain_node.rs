//! Wait for client sessions to leave nodes that are about to be removed.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::client::dispatcher::sql_quote;
use crate::client::parsing::parse_count;
use crate::controller::actor::{Actor, ActorContext, Directive, ReconcilePass};
use crate::controller::error::Result;
use crate::crd::annotations::SERVER_CONTAINER;
use crate::podfacts::PodFact;

fn active_sessions_query(vnode_name: &str) -> String {
    format!(
        "SELECT COUNT(*) FROM sessions WHERE node_name = '{}' \
         AND session_id NOT IN (SELECT session_id FROM current_session);",
        sql_quote(vnode_name)
    )
}

/// Number of client sessions connected to the node of `pf`, not counting
/// the session running the query.
pub(crate) async fn active_sessions(ctx: &ActorContext, pf: &PodFact) -> Result<i64> {
    let out = ctx
        .runner
        .exec_vsql(&pf.name, SERVER_CONTAINER, &active_sessions_query(&pf.vnode_name))
        .await?;
    Ok(parse_count(&out.stdout)?.unwrap_or(0))
}

/// True if any of the up pods in `pods` still serves a client.
pub(crate) async fn any_active_sessions(ctx: &ActorContext, pods: &[PodFact]) -> Result<bool> {
    for pf in pods.iter().filter(|p| p.up_node) {
        let count = active_sessions(ctx, pf).await?;
        if count > 0 {
            info!(pod = %pf.name, sessions = count, "node still has active sessions");
            return Ok(true);
        }
        debug!(pod = %pf.name, "node is drained");
    }
    Ok(false)
}

pub struct DrainNodeActor;

#[async_trait]
impl Actor for DrainNodeActor {
    fn name(&self) -> &'static str {
        "DrainNode"
    }

    async fn reconcile(&self, ctx: &ActorContext, pass: &mut ReconcilePass) -> Result<Directive> {
        pass.collect(ctx).await?;
        let leaving: Vec<PodFact> = pass
            .pfacts
            .filter_pods(|p| p.is_pending_delete && p.db_exists)
            .into_iter()
            .cloned()
            .collect();
        if any_active_sessions(ctx, &leaving).await? {
            return Ok(Directive::requeue());
        }
        Ok(Directive::Continue)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::controller::actors::testing::{Harness, fact, vdb};
    use crate::crd::{Subcluster, SubclusterType};

    fn leaving(index: i32) -> PodFact {
        PodFact {
            is_pending_delete: true,
            ..fact("sc", index)
        }
    }

    #[tokio::test]
    async fn test_requeues_while_sessions_remain() {
        let h = Harness::new();
        let pf = leaving(1);
        h.runner.respond(&pf.name, "FROM sessions", " 2\n");
        let v = vdb(&[], vec![Subcluster::new("sc", 1, SubclusterType::Primary)]);
        let mut pass = h.pass(&v, vec![fact("sc", 0), pf]).await;
        let d = DrainNodeActor.reconcile(&h.ctx, &mut pass).await.unwrap();
        assert_eq!(d, Directive::requeue());
    }

    #[tokio::test]
    async fn test_continues_when_drained() {
        let h = Harness::new();
        h.runner.respond_any("FROM sessions", "0\n");
        let v = vdb(&[], vec![Subcluster::new("sc", 1, SubclusterType::Primary)]);
        let mut pass = h.pass(&v, vec![fact("sc", 0), leaving(1)]).await;
        let d = DrainNodeActor.reconcile(&h.ctx, &mut pass).await.unwrap();
        assert_eq!(d, Directive::Continue);
        // Only the leaving pod is checked.
        assert_eq!(h.runner.calls_matching("FROM sessions").len(), 1);
    }

    #[tokio::test]
    async fn test_nothing_to_drain() {
        let h = Harness::new();
        let v = vdb(&[], vec![Subcluster::new("sc", 1, SubclusterType::Primary)]);
        let mut pass = h.pass(&v, vec![fact("sc", 0)]).await;
        let d = DrainNodeActor.reconcile(&h.ctx, &mut pass).await.unwrap();
        assert_eq!(d, Directive::Continue);
        assert!(h.runner.calls().is_empty());
    }
}
