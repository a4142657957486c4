//! Reconcile actor framework.
//!
//! A reconcile pass runs a fixed list of [`Actor`]s in order. Each actor looks
//! at the observed state, does one narrow piece of corrective work and returns
//! a [`Directive`]: either continue with the next actor, or stop the pass and
//! come back later. Errors stop the pass as well and are surfaced to the
//! controller's error policy.
//!
//! Actors hold no state between passes. Everything they need to resume lives
//! in the VerticaDB status or annotations, or is re-derived from [`PodFacts`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::config::PassConfig;
use super::error::Result;
use super::events::{EventKind, EventSink};
use crate::client::{ClusterState, Dispatcher, PodRunner};
use crate::crd::{ClusterScope, VerticaDB};
use crate::health::HealthState;
use crate::podfacts::PodFacts;

/// Outcome of one actor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Directive {
    /// Proceed with the next actor.
    Continue,
    /// Stop the pass and run it again later. `None` uses the default delay.
    Requeue { after: Option<Duration> },
}

impl Directive {
    pub fn requeue() -> Self {
        Directive::Requeue { after: None }
    }

    pub fn requeue_after(after: Duration) -> Self {
        Directive::Requeue { after: Some(after) }
    }

    pub fn is_continue(&self) -> bool {
        matches!(self, Directive::Continue)
    }

    /// Apply the per-resource requeue override to a requeue directive.
    pub fn with_override(self, requeue_time: Option<Duration>) -> Self {
        match (self, requeue_time) {
            (Directive::Requeue { .. }, Some(t)) => Directive::requeue_after(t),
            (d, _) => d,
        }
    }
}

/// Collaborators shared by every actor of a pass.
#[derive(Clone)]
pub struct ActorContext {
    pub state: Arc<dyn ClusterState>,
    pub runner: Arc<dyn PodRunner>,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub events: Arc<dyn EventSink>,
    pub health: Option<Arc<HealthState>>,
}

impl ActorContext {
    pub async fn normal(&self, vdb: &VerticaDB, reason: &str, message: impl Into<String>) {
        self.events
            .event(vdb, EventKind::Normal, reason, message.into())
            .await;
    }

    pub async fn warning(&self, vdb: &VerticaDB, reason: &str, message: impl Into<String>) {
        self.events
            .event(vdb, EventKind::Warning, reason, message.into())
            .await;
    }
}

/// Per-pass mutable state threaded through the actors.
pub struct ReconcilePass {
    /// Latest known copy of the resource. Actors that write it replace it
    /// through [`ReconcilePass::set_vdb`].
    pub vdb: VerticaDB,
    pub pfacts: PodFacts,
    pub config: PassConfig,
}

impl ReconcilePass {
    pub fn new(vdb: VerticaDB) -> Self {
        Self::with_scope(vdb, ClusterScope::MainCluster)
    }

    pub fn with_scope(vdb: VerticaDB, scope: ClusterScope) -> Self {
        let config = PassConfig::from_vdb(&vdb);
        Self {
            vdb,
            pfacts: PodFacts::new(scope),
            config,
        }
    }

    /// Replace the resource after a write. The config snapshot follows the
    /// annotations, so it is recomputed.
    pub fn set_vdb(&mut self, vdb: VerticaDB) {
        self.config = PassConfig::from_vdb(&vdb);
        self.vdb = vdb;
    }

    /// Collect pod facts if they are stale.
    pub async fn collect(&mut self, ctx: &ActorContext) -> Result<()> {
        self.pfacts
            .collect(
                ctx.state.as_ref(),
                ctx.runner.as_ref(),
                &self.vdb,
                &self.config,
            )
            .await
    }

    pub fn namespace(&self) -> String {
        self.vdb.namespace_or_default()
    }
}

/// One unit of convergence logic.
///
/// Implementations must be idempotent: once their goal state is reached a
/// further call changes nothing and returns [`Directive::Continue`].
#[async_trait]
pub trait Actor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn reconcile(&self, ctx: &ActorContext, pass: &mut ReconcilePass) -> Result<Directive>;
}
