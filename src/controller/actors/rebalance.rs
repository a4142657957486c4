//! Give new nodes of an Eon database their shard subscriptions.

use std::collections::BTreeSet;

use async_trait::async_trait;
use tracing::info;

use crate::client::dispatcher::RebalanceShardsOptions;
use crate::controller::actor::{Actor, ActorContext, Directive, ReconcilePass};
use crate::controller::error::{Error, Result};
use crate::controller::events;

#[derive(Default)]
pub struct RebalanceShardsActor {
    subcluster: Option<String>,
}

impl RebalanceShardsActor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_subcluster(subcluster: impl Into<String>) -> Self {
        Self {
            subcluster: Some(subcluster.into()),
        }
    }
}

#[async_trait]
impl Actor for RebalanceShardsActor {
    fn name(&self) -> &'static str {
        "RebalanceShards"
    }

    async fn reconcile(&self, ctx: &ActorContext, pass: &mut ReconcilePass) -> Result<Directive> {
        if !pass.vdb.is_eon() {
            return Ok(Directive::Continue);
        }
        pass.collect(ctx).await?;

        // Subclusters with an up node that subscribes to nothing.
        let targets: BTreeSet<String> = pass
            .pfacts
            .filter_pods(|p| {
                p.up_node
                    && p.db_exists
                    && !p.is_pending_delete
                    && p.shard_subscriptions == 0
                    && self
                        .subcluster
                        .as_deref()
                        .is_none_or(|sc| p.subcluster_name == sc)
            })
            .into_iter()
            .map(|p| p.subcluster_name.clone())
            .collect();
        if targets.is_empty() {
            return Ok(Directive::Continue);
        }

        for sc in &targets {
            let Some(initiator) = pass
                .pfacts
                .find_first_up_pod(true, Some(sc))
                .map(|p| p.name.clone())
            else {
                continue;
            };
            info!(subcluster = %sc, "rebalancing shards");
            let opts = RebalanceShardsOptions {
                initiator,
                subcluster: sc.clone(),
            };
            match ctx.dispatcher.rebalance_shards(&opts).await {
                Ok(()) => {}
                Err(Error::Dispatch { message, .. }) => {
                    info!(subcluster = %sc, error = %message, "rebalance failed, requeue");
                    pass.pfacts.invalidate();
                    return Ok(Directive::requeue());
                }
                Err(e) => return Err(e),
            }
            ctx.normal(
                &pass.vdb,
                events::REBALANCE_SHARDS,
                format!("Successfully called 'rebalance_shards' for '{sc}'"),
            )
            .await;
        }
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
    use crate::crd::{Subcluster, SubclusterType, VerticaDB};
    use crate::podfacts::PodFact;

    fn eon() -> VerticaDB {
        let mut v = vdb(
            &[],
            vec![
                Subcluster::new("pri", 1, SubclusterType::Primary),
                Subcluster::new("sec", 2, SubclusterType::Secondary),
            ],
        );
        v.spec.communal.path = "s3://bucket/db".into();
        v
    }

    fn unsubscribed(sc: &str, index: i32) -> PodFact {
        PodFact {
            shard_subscriptions: 0,
            is_primary: false,
            ..fact(sc, index)
        }
    }

    #[tokio::test]
    async fn test_rebalances_subcluster_with_new_node() {
        let h = Harness::new();
        let facts = vec![fact("pri", 0), fact("sec", 0), unsubscribed("sec", 1)];
        let mut pass = h.pass(&eon(), facts).await;
        let d = RebalanceShardsActor::new().reconcile(&h.ctx, &mut pass).await.unwrap();
        assert_eq!(d, Directive::Continue);
        let calls = h.dispatcher.calls_named("rebalance_shards");
        assert_eq!(calls.len(), 1);
        let DispatchCall::RebalanceShards(opts) = &calls[0] else {
            panic!("unexpected call");
        };
        assert_eq!(opts.subcluster, "sec");
        assert!(h.events.has_reason(events::REBALANCE_SHARDS));
    }

    #[tokio::test]
    async fn test_balanced_database_is_left_alone() {
        let h = Harness::new();
        let mut pass = h.pass(&eon(), vec![fact("pri", 0), fact("sec", 0)]).await;
        RebalanceShardsActor::new().reconcile(&h.ctx, &mut pass).await.unwrap();
        assert!(h.dispatcher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_scoped_to_one_subcluster() {
        let h = Harness::new();
        let facts = vec![unsubscribed("pri", 0), unsubscribed("sec", 0)];
        let mut pass = h.pass(&eon(), facts).await;
        RebalanceShardsActor::for_subcluster("pri")
            .reconcile(&h.ctx, &mut pass)
            .await
            .unwrap();
        assert_eq!(h.dispatcher.calls_named("rebalance_shards").len(), 1);
    }
}
