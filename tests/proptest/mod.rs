// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for vertica-operator.
//!
//! Uses proptest to generate random inputs and verify invariants.

#[path = "../common/mod.rs"]
mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use proptest::prelude::*;

use common::{TestEnv, VerticaDbBuilder, up_fact};
use vertica_operator::controller::actors::status::{refresh_subcluster_status, resize_detail};
use vertica_operator::controller::config::PassConfig;
use vertica_operator::controller::pipeline::run_pipeline;
use vertica_operator::controller::upgrade_manager::next_status_msg;
use vertica_operator::controller::{Actor, ActorContext, Directive, ReconcilePass, Result};
use vertica_operator::crd::{ClusterScope, SubclusterStatus, VerticaDBPodStatus};
use vertica_operator::podfacts::PodFacts;
use vertica_operator::resources::statefulset::generate_statefulset;

const MSGS: [&str; 4] = [
    "Requeue to apply the upgrade",
    "Shutting down the cluster",
    "Rescheduling pods",
    "Restarting the cluster",
];

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Strategy for generating subcluster sizes (0-8).
fn sc_size() -> impl Strategy<Value = i32> {
    0..=8i32
}

/// Strategy for generating actor outcomes.
fn any_directive() -> impl Strategy<Value = Directive> {
    prop_oneof![
        3 => Just(Directive::Continue),
        1 => Just(Directive::requeue()),
        1 => (1..600u64).prop_map(|s| Directive::requeue_after(Duration::from_secs(s))),
    ]
}

// ============================================================================
// Upgrade status messages
// ============================================================================

proptest! {
    /// Walking the steps in any order never moves the status message
    /// backwards, and each posted message is the step's own message.
    #[test]
    fn status_msg_never_regresses(steps in prop::collection::vec(0..MSGS.len(), 1..20)) {
        let mut current = String::new();
        let mut posted_idx: Option<usize> = None;
        for idx in steps {
            if let Some(msg) = next_status_msg(&current, &MSGS, idx).unwrap() {
                prop_assert_eq!(msg, MSGS[idx]);
                if let Some(prev) = posted_idx {
                    prop_assert!(idx > prev);
                }
                posted_idx = Some(idx);
                current = msg.to_string();
            }
        }
    }

    /// Posting the same step twice is a no-op the second time.
    #[test]
    fn status_msg_is_idempotent(idx in 0..MSGS.len()) {
        let first = if idx == 0 { "" } else { MSGS[0] };
        let posted = next_status_msg(first, &MSGS, idx).unwrap();
        prop_assert_eq!(posted, Some(MSGS[idx]));
        prop_assert_eq!(next_status_msg(MSGS[idx], &MSGS, idx).unwrap(), None);
    }

    #[test]
    fn status_msg_out_of_range_is_an_error(idx in MSGS.len()..64) {
        prop_assert!(next_status_msg("", &MSGS, idx).is_err());
    }
}

// ============================================================================
// Pod fact sizing
// ============================================================================

proptest! {
    /// Facts exist for max(spec size, StatefulSet replicas) pods, and only
    /// pods beyond the spec size are pending delete.
    #[test]
    fn pod_facts_cover_spec_and_statefulset(spec_size in sc_size(), sts_size in sc_size()) {
        runtime().block_on(async {
            let env = TestEnv::new();
            let vdb = VerticaDbBuilder::new("v").primary("pri", spec_size).build();

            let mut sized = vdb.clone();
            sized.spec.subclusters[0].size = sts_size;
            let cfg = PassConfig::from_vdb(&vdb);
            let sts = generate_statefulset(&sized, &sized.spec.subclusters[0], &cfg);
            env.state.put_statefulset(common::NAMESPACE, &sts).await;
            let stored = env.state.put_vdb(&vdb).await;

            let mut facts = PodFacts::new(ClusterScope::MainCluster);
            facts
                .collect(env.state.as_ref(), env.runner.as_ref(), &stored, &cfg)
                .await
                .unwrap();

            let expected = spec_size.max(sts_size);
            assert_eq!(facts.len(), usize::try_from(expected).unwrap());
            for pf in facts.iter() {
                assert_eq!(pf.is_pending_delete, pf.pod_index >= spec_size);
                assert_eq!(pf.managed_by_parent, pf.pod_index < sts_size);
                assert!(!pf.is_pod_running);
            }
        });
    }
}

// ============================================================================
// Subcluster status detail
// ============================================================================

proptest! {
    /// Resizing keeps the entries below the new size untouched.
    #[test]
    fn resize_preserves_existing_detail(old in 0..10usize, new in 0..10usize) {
        let mut detail: Vec<VerticaDBPodStatus> = (0..old)
            .map(|i| VerticaDBPodStatus {
                vnode_name: format!("v_vertdb_node{:04}", i + 1),
                installed: true,
                ..Default::default()
            })
            .collect();
        let before = detail.clone();
        resize_detail(&mut detail, new);

        prop_assert_eq!(detail.len(), new);
        for (i, d) in detail.iter().enumerate() {
            if i < old {
                prop_assert_eq!(d, &before[i]);
            } else {
                prop_assert_eq!(d, &VerticaDBPodStatus::default());
            }
        }
    }

    /// Counts in a refreshed subcluster status always match its detail.
    #[test]
    fn refreshed_counts_match_detail(
        size in 1..6i32,
        up in prop::collection::vec(any::<bool>(), 6),
    ) {
        let vdb = VerticaDbBuilder::new("v").primary("pri", size).build();
        let sc = &vdb.spec.subclusters[0];
        let facts = PodFacts::from_facts(
            ClusterScope::MainCluster,
            (0..size).map(|i| {
                let mut pf = up_fact(&vdb, "pri", i);
                pf.up_node = up[usize::try_from(i).unwrap()];
                pf
            }),
        );

        let mut status = SubclusterStatus::default();
        refresh_subcluster_status(&mut status, sc, Some(size), &facts);

        prop_assert_eq!(status.detail.len(), usize::try_from(size).unwrap());
        let up_count = status.detail.iter().filter(|d| d.up_node).count();
        prop_assert_eq!(status.up_node_count, i32::try_from(up_count).unwrap());
        prop_assert_eq!(status.added_to_db_count, size);
    }
}

// ============================================================================
// Pipeline short-circuit
// ============================================================================

struct Scripted {
    index: usize,
    directive: Directive,
    log: Arc<Mutex<Vec<usize>>>,
}

#[async_trait]
impl Actor for Scripted {
    fn name(&self) -> &'static str {
        "Scripted"
    }

    async fn reconcile(&self, _: &ActorContext, _: &mut ReconcilePass) -> Result<Directive> {
        self.log.lock().unwrap().push(self.index);
        Ok(self.directive)
    }
}

proptest! {
    /// Actors run in order up to and including the first one that does not
    /// continue, and the pass returns that actor's directive.
    #[test]
    fn pipeline_stops_at_first_requeue(directives in prop::collection::vec(any_directive(), 0..12)) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let actors: Vec<Box<dyn Actor>> = directives
            .iter()
            .enumerate()
            .map(|(index, directive)| {
                Box::new(Scripted {
                    index,
                    directive: *directive,
                    log: log.clone(),
                }) as Box<dyn Actor>
            })
            .collect();

        let env = TestEnv::new();
        let vdb = VerticaDbBuilder::new("v").primary("pri", 3).build();
        let mut pass = ReconcilePass::new(vdb);
        let result = runtime()
            .block_on(run_pipeline(&actors, &env.ctx, &mut pass))
            .unwrap();

        let stop = directives.iter().position(|d| !d.is_continue());
        let ran = log.lock().unwrap().clone();
        match stop {
            Some(i) => {
                prop_assert_eq!(ran, (0..=i).collect::<Vec<_>>());
                prop_assert_eq!(result, directives[i]);
            }
            None => {
                prop_assert_eq!(ran, (0..directives.len()).collect::<Vec<_>>());
                prop_assert_eq!(result, Directive::Continue);
            }
        }
    }
}
