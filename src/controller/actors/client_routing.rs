//! Maintain the label that makes a pod a target of the client services.
//!
//! Pods that are up and own at least one shard get the label. Pods about to
//! leave the database lose it first so that new connections stop landing on
//! them.

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::controller::actor::{Actor, ActorContext, Directive, ReconcilePass};
use crate::controller::error::{Error, Result};
use crate::controller::status::MAX_UPDATE_ATTEMPTS;
use crate::crd::annotations::{CLIENT_ROUTING_LABEL, CLIENT_ROUTING_VALUE};
use crate::podfacts::PodFact;

/// When in the lifecycle of a node the label is applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoutingMode {
    /// After a node joined the database.
    AddNode,
    /// After a pod was rescheduled and vertica restarted in it.
    PodReschedule,
    /// Before a node leaves the database.
    DelNode,
}

pub struct ClientRoutingActor {
    mode: RoutingMode,
    /// Limit to one subcluster. All subclusters when unset.
    subcluster: Option<String>,
}

impl ClientRoutingActor {
    pub fn new(mode: RoutingMode) -> Self {
        Self {
            mode,
            subcluster: None,
        }
    }

    pub fn for_subcluster(mode: RoutingMode, subcluster: impl Into<String>) -> Self {
        Self {
            mode,
            subcluster: Some(subcluster.into()),
        }
    }

    /// Desired label state for a pod, or `None` to leave it as is.
    fn wanted(&self, pf: &PodFact, eon: bool) -> Option<bool> {
        match self.mode {
            RoutingMode::AddNode | RoutingMode::PodReschedule => {
                let owns_shard = !eon || pf.shard_subscriptions > 0;
                (pf.up_node && owns_shard && !pf.is_pending_delete).then_some(true)
            }
            RoutingMode::DelNode => pf.is_pending_delete.then_some(false),
        }
    }
}

#[async_trait]
impl Actor for ClientRoutingActor {
    fn name(&self) -> &'static str {
        match self.mode {
            RoutingMode::AddNode => "ClientRouting(AddNode)",
            RoutingMode::PodReschedule => "ClientRouting(PodReschedule)",
            RoutingMode::DelNode => "ClientRouting(DelNode)",
        }
    }

    async fn reconcile(&self, ctx: &ActorContext, pass: &mut ReconcilePass) -> Result<Directive> {
        pass.collect(ctx).await?;
        let eon = pass.vdb.is_eon();
        let mut directive = Directive::Continue;
        let pods: Vec<PodFact> = pass
            .pfacts
            .filter_pods(|p| {
                p.exists
                    && self
                        .subcluster
                        .as_deref()
                        .is_none_or(|sc| p.subcluster_name == sc)
            })
            .into_iter()
            .cloned()
            .collect();

        for pf in &pods {
            if let Some(add) = self.wanted(pf, eon) {
                set_routing_label(ctx, pf, add).await?;
            }
            // Keep checking the other pods, but come back for this one.
            if self.mode == RoutingMode::AddNode
                && eon
                && pf.up_node
                && pf.shard_subscriptions == 0
                && !pf.is_pending_delete
            {
                info!(pod = %pf.name, "pod has no shard subscriptions yet, requeue");
                directive = Directive::requeue();
            }
        }
        Ok(directive)
    }
}

/// Add or remove the label, retrying on write conflicts. A pod that is gone
/// is skipped.
pub(crate) async fn set_routing_label(ctx: &ActorContext, pf: &PodFact, add: bool) -> Result<()> {
    let namespace = &pf.name.namespace;
    for attempt in 1..=MAX_UPDATE_ATTEMPTS {
        let Some(mut pod) = ctx.state.get_pod(namespace, &pf.name.name).await? else {
            return Ok(());
        };
        let present = pod.labels().contains_key(CLIENT_ROUTING_LABEL);
        if present == add {
            return Ok(());
        }
        if add {
            pod.labels_mut()
                .insert(CLIENT_ROUTING_LABEL.to_string(), CLIENT_ROUTING_VALUE.to_string());
        } else {
            pod.labels_mut().remove(CLIENT_ROUTING_LABEL);
        }
        match ctx.state.replace_pod(namespace, &pod).await {
            Ok(_) => {
                info!(pod = %pf.name, add, "updated client routing label");
                return Ok(());
            }
            Err(e) if e.is_conflict() => {
                debug!(pod = %pf.name, attempt, "conflict updating pod labels, retrying");
            }
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        }
    }
    Err(Error::Conflict(format!("pod {}", pf.name)))
}
