//! Roll pod facts up into the VerticaDB status.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::controller::actor::{Actor, ActorContext, Directive, ReconcilePass};
use crate::controller::error::Result;
use crate::controller::finder::{FindFlags, SubclusterFinder};
use crate::controller::status::{update_vdb_status_with_retry, update_vdb_with_retry};
use crate::crd::annotations::READY_STATUS;
use crate::crd::{ClusterScope, Subcluster, SubclusterStatus, VerticaDBPodStatus, VerticaDBStatus};
use crate::podfacts::{PodFact, PodFacts};
use crate::resources::common::statefulset_name;
use crate::resources::statefulset::replicas;

/// Refreshes per-subcluster and cluster-wide counts from pod facts.
pub struct StatusActor;

#[async_trait]
impl Actor for StatusActor {
    fn name(&self) -> &'static str {
        "Status"
    }

    async fn reconcile(&self, ctx: &ActorContext, pass: &mut ReconcilePass) -> Result<Directive> {
        pass.collect(ctx).await?;

        let namespace = pass.namespace();
        let finder = SubclusterFinder::new(ctx.state.as_ref(), &pass.vdb, pass.pfacts.scope.clone());
        let subclusters = finder
            .find_subclusters(FindFlags::ALL | FindFlags::SORTED)
            .await?;
        let mut sized = Vec::with_capacity(subclusters.len());
        for sc in subclusters {
            let sts_replicas = ctx
                .state
                .get_statefulset(&namespace, &statefulset_name(&pass.vdb, &sc))
                .await?
                .as_ref()
                .map(replicas);
            sized.push((sc, sts_replicas));
        }

        let pfacts = &pass.pfacts;
        let updated = update_vdb_status_with_retry(ctx.state.as_ref(), &pass.vdb, |v| {
            let before = v.status.clone();
            let in_scope: Vec<String> = sized.iter().map(|(sc, _)| sc.name.clone()).collect();
            let scope = pfacts.scope.clone();
            let others: Vec<SubclusterStatus> = v
                .status
                .as_ref()
                .map(|s| s.subclusters.clone())
                .unwrap_or_default()
                .into_iter()
                .filter(|s| !in_scope.contains(&s.name) && v.scope_of_subcluster(&s.name) != scope)
                .collect();
            let status = v.status_mut();
            let mut next: Vec<SubclusterStatus> = sized
                .iter()
                .map(|(sc, sts_replicas)| {
                    let mut cur = status
                        .subclusters
                        .iter()
                        .find(|s| s.name == sc.name)
                        .cloned()
                        .unwrap_or_default();
                    refresh_subcluster_status(&mut cur, sc, *sts_replicas, pfacts);
                    cur
                })
                .collect();
            next.extend(others);
            status.subclusters = next;
            roll_up(status);
            v.status != before
        })
        .await?;

        if let Some(health) = &ctx.health
            && let Some(status) = &updated.status
        {
            health.metrics.set_cluster_counts(
                &namespace,
                updated.name_any_str(),
                i64::from(status.up_node_count),
                i64::from(status.subcluster_count),
            );
        }
        debug!(
            up = updated.status.as_ref().map_or(0, |s| s.up_node_count),
            "status refreshed"
        );
        // Sandboxes share the resource; only the main cluster owns the annotation.
        let updated = if pass.pfacts.scope == ClusterScope::MainCluster {
            update_vdb_with_retry(ctx.state.as_ref(), &updated, |v| {
                let ready = ready_status(v.status.as_ref());
                let changed = v.merge_annotations(&[(READY_STATUS.to_string(), ready)].into());
                if changed {
                    info!(status = v.annotation(READY_STATUS).unwrap_or_default(), "ready status changed");
                }
                changed
            })
            .await?
        } else {
            updated
        };
        pass.set_vdb(updated);
        Ok(Directive::Continue)
    }
}

/// Grow or shrink the detail to `size` entries. Surviving entries keep what
/// was known about them.
pub fn resize_detail(detail: &mut Vec<VerticaDBPodStatus>, size: usize) {
    detail.resize_with(size, VerticaDBPodStatus::default);
}

/// Recompute one subcluster's status from its pod facts.
pub fn refresh_subcluster_status(
    cur: &mut SubclusterStatus,
    sc: &Subcluster,
    sts_replicas: Option<i32>,
    pfacts: &PodFacts,
) {
    cur.name = sc.name.clone();
    cur.shutdown = sc.shutdown;
    let size = sc.size.max(sts_replicas.unwrap_or(0));
    resize_detail(&mut cur.detail, usize::try_from(size).unwrap_or(0));

    // The pods are gone but the subcluster still exists; keep the vnode
    // names and oid so a restart can reuse them.
    let shut_down = sts_replicas == Some(0) && sc.size != 0;
    let facts: Vec<&PodFact> = pfacts.in_subcluster(&sc.name);
    for (index, detail) in cur.detail.iter_mut().enumerate() {
        if shut_down {
            detail.up_node = false;
            detail.installed = false;
            detail.added_to_db = false;
            detail.read_only = false;
            continue;
        }
        let Some(pf) = facts
            .iter()
            .find(|f| usize::try_from(f.pod_index).ok() == Some(index))
        else {
            continue;
        };
        detail.up_node = pf.up_node;
        detail.read_only = pf.read_only;
        detail.installed = pf.is_installed;
        detail.added_to_db = pf.db_exists;
        if !pf.vnode_name.is_empty() {
            detail.vnode_name = pf.vnode_name.clone();
        }
        if !pf.subcluster_oid.is_empty() {
            cur.oid = pf.subcluster_oid.clone();
        }
    }
    cur.added_to_db_count = count(&cur.detail, |d| d.added_to_db);
    cur.up_node_count = count(&cur.detail, |d| d.up_node);
}

fn count(detail: &[VerticaDBPodStatus], pred: impl Fn(&VerticaDBPodStatus) -> bool) -> i32 {
    i32::try_from(detail.iter().filter(|d| pred(d)).count()).unwrap_or(i32::MAX)
}

/// Value of the ready-status annotation for `status`.
pub fn ready_status(status: Option<&VerticaDBStatus>) -> String {
    status.map_or_else(
        || "0/0".to_string(),
        |s| format!("{}/{}", s.up_node_count, s.added_to_db_count),
    )
}

/// Cluster-wide totals over every subcluster entry.
pub fn roll_up(status: &mut VerticaDBStatus) {
    status.subcluster_count = i32::try_from(status.subclusters.len()).unwrap_or(i32::MAX);
    status.added_to_db_count = status.subclusters.iter().map(|s| s.added_to_db_count).sum();
    status.up_node_count = status.subclusters.iter().map(|s| s.up_node_count).sum();
}
