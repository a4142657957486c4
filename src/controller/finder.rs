//! Subcluster finder.
//!
//! Locates the StatefulSets, pods and services the operator created for a
//! VerticaDB and splits them by whether their subcluster is still in the
//! spec. Subclusters that only exist as a StatefulSet are being removed;
//! they are reported with size zero.
//!
//! An object belongs to the scope the spec puts its subcluster in. Only
//! objects of subclusters gone from the spec fall back to their sandbox label,
//! so a subcluster moving in or out of a sandbox is never mistaken for one
//! being removed.

use std::collections::BTreeSet;
use std::ops::BitOr;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::Resource;

use super::error::Result;
use crate::client::ClusterState;
use crate::crd::annotations::{SANDBOX_LABEL, SUBCLUSTER_NAME_LABEL, SUBCLUSTER_TYPE_LABEL};
use crate::crd::{ClusterScope, Subcluster, SubclusterType, VerticaDB};
use crate::resources::common::base_selector_labels;

/// Which objects a find call returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FindFlags(u8);

impl FindFlags {
    /// Subclusters that appear in the spec.
    pub const IN_VDB: FindFlags = FindFlags(1);
    /// Subclusters missing from the spec, i.e. being removed.
    pub const NOT_IN_VDB: FindFlags = FindFlags(1 << 1);
    /// Every subcluster that currently has objects, in the spec or not.
    pub const EXISTING: FindFlags = FindFlags(1 << 2);
    /// Sort results by name.
    pub const SORTED: FindFlags = FindFlags(1 << 3);
    pub const ALL: FindFlags = FindFlags(1 | 1 << 1);

    pub fn contains(self, other: FindFlags) -> bool {
        self.0 & other.0 == other.0
    }

    fn intersects(self, other: FindFlags) -> bool {
        self.0 & other.0 != 0
    }

    fn without(self, other: FindFlags) -> FindFlags {
        FindFlags(self.0 & !other.0)
    }
}

impl BitOr for FindFlags {
    type Output = FindFlags;

    fn bitor(self, rhs: FindFlags) -> FindFlags {
        FindFlags(self.0 | rhs.0)
    }
}

/// Finds the objects that belong to one VerticaDB within one scope.
pub struct SubclusterFinder<'a> {
    state: &'a dyn ClusterState,
    vdb: &'a VerticaDB,
    scope: ClusterScope,
    in_vdb: BTreeSet<String>,
}

impl<'a> SubclusterFinder<'a> {
    pub fn new(state: &'a dyn ClusterState, vdb: &'a VerticaDB, scope: ClusterScope) -> Self {
        let in_vdb = vdb
            .subclusters_in_scope(&scope)
            .into_iter()
            .map(|sc| sc.name.clone())
            .collect();
        Self {
            state,
            vdb,
            scope,
            in_vdb,
        }
    }

    pub async fn find_statefulsets(&self, flags: FindFlags) -> Result<Vec<StatefulSet>> {
        let all = self
            .state
            .list_statefulsets(&self.vdb.namespace_or_default(), &base_selector_labels(self.vdb))
            .await?;
        Ok(self.filter(all, flags))
    }

    pub async fn find_pods(&self, flags: FindFlags) -> Result<Vec<Pod>> {
        let all = self
            .state
            .list_pods(&self.vdb.namespace_or_default(), &base_selector_labels(self.vdb))
            .await?;
        Ok(self.filter(all, flags))
    }

    pub async fn find_services(&self, flags: FindFlags) -> Result<Vec<Service>> {
        let all = self
            .state
            .list_services(&self.vdb.namespace_or_default(), &base_selector_labels(self.vdb))
            .await?;
        Ok(self.filter(all, flags))
    }

    /// Subclusters from the spec and/or synthesized from StatefulSets.
    pub async fn find_subclusters(&self, flags: FindFlags) -> Result<Vec<Subcluster>> {
        let mut subclusters: Vec<Subcluster> = Vec::new();
        if flags.contains(FindFlags::IN_VDB) {
            subclusters.extend(
                self.vdb
                    .subclusters_in_scope(&self.scope)
                    .into_iter()
                    .cloned(),
            );
        }
        if flags.intersects(FindFlags::NOT_IN_VDB | FindFlags::EXISTING) {
            let sts_flags = flags.without(FindFlags::IN_VDB).without(FindFlags::SORTED);
            for sts in self.find_statefulsets(sts_flags).await? {
                let labels = sts.meta().labels.clone().unwrap_or_default();
                let Some(name) = labels.get(SUBCLUSTER_NAME_LABEL) else {
                    continue;
                };
                if subclusters.iter().any(|sc| &sc.name == name) {
                    continue;
                }
                let sc_type = labels
                    .get(SUBCLUSTER_TYPE_LABEL)
                    .and_then(|t| t.parse::<SubclusterType>().ok())
                    .unwrap_or(SubclusterType::Secondary);
                // Size zero marks the subcluster as being removed.
                subclusters.push(Subcluster::new(name.clone(), 0, sc_type));
            }
        }
        if flags.contains(FindFlags::SORTED) {
            subclusters.sort_by(|a, b| a.name.cmp(&b.name));
        }
        Ok(subclusters)
    }

    fn filter<K: Resource>(&self, objs: Vec<K>, flags: FindFlags) -> Vec<K> {
        let mut out: Vec<K> = objs
            .into_iter()
            .filter(|obj| {
                let labels = obj.meta().labels.as_ref();
                // Cluster wide objects such as the headless service.
                let Some(sc_name) = labels.and_then(|l| l.get(SUBCLUSTER_NAME_LABEL)) else {
                    return false;
                };
                if self.object_scope(sc_name, labels) != self.scope {
                    return false;
                }
                if flags.contains(FindFlags::EXISTING) {
                    return true;
                }
                let in_vdb = self.in_vdb.contains(sc_name);
                (flags.contains(FindFlags::IN_VDB) && in_vdb)
                    || (flags.contains(FindFlags::NOT_IN_VDB) && !in_vdb)
            })
            .collect();
        if flags.contains(FindFlags::SORTED) {
            out.sort_by(|a, b| a.meta().name.cmp(&b.meta().name));
        }
        out
    }

    fn object_scope(
        &self,
        sc_name: &str,
        labels: Option<&std::collections::BTreeMap<String, String>>,
    ) -> ClusterScope {
        if self.vdb.spec.subclusters.iter().any(|sc| sc.name == sc_name) {
            return self.vdb.scope_of_subcluster(sc_name);
        }
        ClusterScope::from_label(
            labels
                .and_then(|l| l.get(SANDBOX_LABEL))
                .map(String::as_str),
        )
    }
}
