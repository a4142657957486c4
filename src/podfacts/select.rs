//! Selection and counting over collected pod facts.
//!
//! Every function here is a pure filter or fold over the fact map. Lists are
//! returned ordered by vertica node name; "first" lookups order by DNS name so
//! the same pod is picked on every pass.

use std::collections::BTreeSet;

use super::{PodFact, PodFacts};
use crate::client::PodName;

/// Which pods [`PodFacts::find_re_ip_pods`] returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReIpFilter {
    OnlyWithDbs,
    OnlyWithoutDbs,
    Any,
}

impl PodFacts {
    /// Facts matching `pred`, ordered by vertica node name.
    pub fn filter_pods<F>(&self, pred: F) -> Vec<&PodFact>
    where
        F: Fn(&PodFact) -> bool,
    {
        let mut pods: Vec<&PodFact> = self.detail.values().filter(|p| pred(p)).collect();
        pods.sort_by(|a, b| a.vnode_name.cmp(&b.vnode_name));
        pods
    }

    /// First matching fact by DNS name.
    pub fn find_first_pod_sorted<F>(&self, pred: F) -> Option<&PodFact>
    where
        F: Fn(&PodFact) -> bool,
    {
        self.detail
            .values()
            .filter(|p| pred(p))
            .min_by(|a, b| a.dns_name.cmp(&b.dns_name))
    }

    fn count<F>(&self, pred: F) -> usize
    where
        F: Fn(&PodFact) -> bool,
    {
        self.detail.values().filter(|p| pred(p)).count()
    }

    /// True unless we are certain no database exists. Only primaries are
    /// consulted: secondaries may not have pulled the catalog yet.
    pub fn does_db_exist(&self) -> bool {
        self.detail.values().any(|p| p.is_primary && p.db_exists)
    }

    /// First up pod, optionally limited to one subcluster.
    pub fn find_first_up_pod(&self, allow_read_only: bool, sc_name: Option<&str>) -> Option<&PodFact> {
        self.find_first_pod_sorted(|p| {
            sc_name.is_none_or(|sc| p.subcluster_name == sc)
                && p.up_node
                && (allow_read_only || !p.read_only)
        })
    }

    /// Pod best suited to run an admin command against a live database.
    ///
    /// Preference: up and writable and staying, then up and writable, then
    /// up, then any running pod that is installed.
    pub fn find_pod_to_run_admin_cmd_any(&self) -> Option<&PodFact> {
        self.find_first_pod_sorted(|p| p.up_node && !p.read_only && !p.is_pending_delete)
            .or_else(|| self.find_first_pod_sorted(|p| p.up_node && !p.read_only))
            .or_else(|| self.find_first_pod_sorted(|p| p.up_node))
            .or_else(|| self.find_first_pod_sorted(|p| p.is_installed && p.is_pod_running))
    }

    /// Installed, running pod whose node is down.
    pub fn find_pod_to_run_admin_cmd_offline(&self) -> Option<&PodFact> {
        self.detail
            .values()
            .find(|p| p.is_installed && p.is_pod_running && !p.up_node)
    }

    pub fn find_running_pod(&self) -> Option<&PodFact> {
        self.detail.values().find(|p| p.is_pod_running)
    }

    /// Pods whose vertica process should be (re)started.
    pub fn find_restartable_pods(
        &self,
        restart_read_only: bool,
        restart_transient: bool,
        restart_pending_delete: bool,
    ) -> Vec<&PodFact> {
        self.filter_pods(|p| {
            if (!restart_transient && p.is_transient) || p.shutdown {
                return false;
            }
            (!p.up_node || (restart_read_only && p.read_only))
                && p.db_exists
                && p.is_pod_running
                && p.has_dc_table_annotations
                && (restart_pending_delete || !p.is_pending_delete)
        })
    }

    pub fn find_installed_pods(&self) -> Vec<&PodFact> {
        self.filter_pods(|p| p.is_installed && p.is_pod_running)
    }

    /// Pods that can take part in a re-ip.
    pub fn find_re_ip_pods(&self, filter: ReIpFilter) -> Vec<&PodFact> {
        self.filter_pods(|p| {
            if !p.exists || !p.is_pod_running || !p.is_installed {
                return false;
            }
            if p.has_nma_sidecar && !p.is_nma_container_ready {
                return false;
            }
            match filter {
                ReIpFilter::OnlyWithDbs => p.db_exists,
                ReIpFilter::OnlyWithoutDbs => !p.db_exists,
                ReIpFilter::Any => true,
            }
        })
    }

    pub fn find_pods_low_on_disk_space(&self, avail_threshold: i64) -> Vec<&PodFact> {
        self.filter_pods(|p| p.is_pod_running && p.local_data_avail <= avail_threshold)
    }

    /// True when every pod the StatefulSets own is running and none is installed.
    pub fn are_all_pods_running_and_zero_installed(&self) -> bool {
        self.detail
            .values()
            .all(|p| !(((!p.exists || !p.is_pod_running) && p.managed_by_parent) || p.is_installed))
    }

    pub fn count_running_and_installed(&self) -> usize {
        self.count(|p| p.is_pod_running && p.is_installed)
    }

    /// Pods that belong in the database but cannot be restarted yet.
    pub fn count_not_restartable_pods(&self, vclusterops: bool) -> usize {
        self.count(|p| {
            ((!vclusterops && p.is_installed) || p.db_exists)
                && p.managed_by_parent
                && (!p.is_pod_running || !p.has_dc_table_annotations)
        })
    }

    pub fn count_up_primary_nodes(&self) -> usize {
        self.count(|p| p.up_node && p.is_primary)
    }

    /// Writable up nodes still on an image other than `new_image`.
    pub fn count_not_read_only_with_old_image(&self, new_image: &str) -> usize {
        self.count(|p| p.is_pod_running && p.up_node && !p.read_only && p.image != new_image)
    }

    pub fn up_node_count(&self) -> usize {
        self.count(|p| p.up_node)
    }

    pub fn subcluster_up_node_count(&self, sc_name: &str) -> usize {
        self.count(|p| p.subcluster_name == sc_name && p.up_node)
    }

    pub fn up_node_and_not_read_only_count(&self) -> usize {
        self.count(|p| p.up_node && !p.read_only)
    }

    pub fn shutdown_count(&self) -> usize {
        self.count(|p| p.shutdown)
    }

    pub fn any_pods_not_running(&self) -> Option<&PodName> {
        self.detail
            .values()
            .find(|p| !p.is_pod_running)
            .map(|p| &p.name)
    }

    pub fn any_installed_pods_not_running(&self) -> Option<&PodName> {
        self.detail
            .values()
            .find(|p| !p.is_pod_running && p.is_installed)
            .map(|p| &p.name)
    }

    pub fn any_uninstalled_transient_pods_not_running(&self) -> Option<&PodName> {
        self.detail
            .values()
            .find(|p| p.is_transient && !p.is_pod_running && !p.is_installed)
            .map(|p| &p.name)
    }

    pub fn is_db_read_only(&self) -> bool {
        self.detail
            .values()
            .any(|p| p.is_pod_running && p.read_only)
    }

    /// Vertica node names of every pod with a database.
    pub fn find_expected_node_names(&self) -> Vec<String> {
        self.filter_pods(|p| p.db_exists)
            .into_iter()
            .map(|p| p.vnode_name.clone())
            .collect()
    }

    pub fn find_node_names_in_subclusters(&self, sc_names: &[&str]) -> Vec<String> {
        let wanted: BTreeSet<&str> = sc_names.iter().copied().collect();
        self.filter_pods(|p| wanted.contains(p.subcluster_name.as_str()))
            .into_iter()
            .map(|p| p.vnode_name.clone())
            .collect()
    }

    pub fn find_pod_names_in_subcluster(&self, sc_name: &str) -> Vec<PodName> {
        self.in_subcluster(sc_name)
            .into_iter()
            .map(|p| p.name.clone())
            .collect()
    }

    /// Enough primaries can be restarted to form a quorum.
    pub fn quorum_check_for_restart_cluster(&self, restart_read_only: bool) -> bool {
        let restartable = self
            .find_restartable_pods(restart_read_only, false, true)
            .into_iter()
            .filter(|p| p.is_primary)
            .count();
        let primaries = self.count(|p| p.is_primary);
        restartable > primaries / 2
    }

    /// True if more than half the primaries stay up after `offset` of them go down.
    pub fn does_db_have_quorum(&self, offset: usize) -> bool {
        let total = self.count(|p| p.is_primary);
        let up = self.count(|p| p.is_primary && p.up_node);
        up.checked_sub(offset)
            .is_some_and(|remaining| 2 * remaining > total)
    }

    /// Secondary subclusters whose pods run a different image than the
    /// primaries, plus the primary image.
    pub fn find_secondary_subclusters_with_different_image(&self) -> (Vec<String>, String) {
        if !self.scope.is_main() {
            return (Vec::new(), String::new());
        }
        let Some(primary_image) = self
            .detail
            .values()
            .find(|p| p.is_primary && !p.image.is_empty())
            .map(|p| p.image.clone())
        else {
            return (Vec::new(), String::new());
        };
        let scs: BTreeSet<String> = self
            .detail
            .values()
            .filter(|p| !p.is_primary && !p.is_transient && p.exists && p.image != primary_image)
            .map(|p| p.subcluster_name.clone())
            .collect();
        (scs.into_iter().collect(), primary_image)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::crd::ClusterScope;

    fn fact(name: &str, f: impl FnOnce(&mut PodFact)) -> PodFact {
        let mut pf = PodFact {
            name: PodName::new("ns", name),
            dns_name: format!("{name}.v.ns"),
            subcluster_name: "sc".into(),
            is_primary: true,
            exists: true,
            is_pod_running: true,
            is_installed: true,
            ..Default::default()
        };
        f(&mut pf);
        pf
    }

    fn facts(list: Vec<PodFact>) -> PodFacts {
        PodFacts::from_facts(ClusterScope::MainCluster, list)
    }

    #[test]
    fn test_admin_cmd_preference() {
        let pf = facts(vec![
            fact("a", |p| {
                p.up_node = true;
                p.read_only = true;
            }),
            fact("b", |p| {
                p.up_node = true;
                p.is_pending_delete = true;
            }),
            fact("c", |p| p.up_node = true),
        ]);
        assert_eq!(pf.find_pod_to_run_admin_cmd_any().unwrap().name.name, "c");

        let pf = facts(vec![
            fact("a", |p| {
                p.up_node = true;
                p.read_only = true;
            }),
            fact("b", |_| {}),
        ]);
        assert_eq!(pf.find_pod_to_run_admin_cmd_any().unwrap().name.name, "a");

        let pf = facts(vec![fact("z", |_| {})]);
        assert_eq!(pf.find_pod_to_run_admin_cmd_any().unwrap().name.name, "z");
        assert!(facts(vec![]).find_pod_to_run_admin_cmd_any().is_none());
    }

    #[test]
    fn test_first_up_pod_by_subcluster() {
        let pf = facts(vec![
            fact("a", |p| p.up_node = true),
            fact("b", |p| {
                p.subcluster_name = "sec".into();
                p.up_node = true;
                p.read_only = true;
            }),
        ]);
        assert_eq!(pf.find_first_up_pod(false, None).unwrap().name.name, "a");
        assert!(pf.find_first_up_pod(false, Some("sec")).is_none());
        assert_eq!(pf.find_first_up_pod(true, Some("sec")).unwrap().name.name, "b");
        assert!(pf.find_first_up_pod(true, Some("other")).is_none());
    }

    #[test]
    fn test_restartable_pods() {
        let pf = facts(vec![
            fact("down", |p| {
                p.db_exists = true;
                p.has_dc_table_annotations = true;
            }),
            fact("ro", |p| {
                p.db_exists = true;
                p.up_node = true;
                p.read_only = true;
                p.has_dc_table_annotations = true;
            }),
            fact("transient", |p| {
                p.db_exists = true;
                p.is_transient = true;
                p.has_dc_table_annotations = true;
            }),
            fact("no-annotations", |p| p.db_exists = true),
        ]);
        let names = |v: Vec<&PodFact>| v.iter().map(|p| p.name.name.clone()).collect::<Vec<_>>();
        assert_eq!(names(pf.find_restartable_pods(false, false, false)), vec!["down"]);
        assert_eq!(pf.find_restartable_pods(true, true, false).len(), 3);
    }

    #[test]
    fn test_quorum() {
        let pf = facts(vec![
            fact("a", |p| p.up_node = true),
            fact("b", |p| p.up_node = true),
            fact("c", |_| {}),
        ]);
        assert!(pf.does_db_have_quorum(0));
        assert!(!pf.does_db_have_quorum(1));
        assert!(!pf.does_db_have_quorum(5));
        assert_eq!(pf.count_up_primary_nodes(), 2);
    }

    #[test]
    fn test_re_ip_pods_skip_unready_sidecar() {
        let pf = facts(vec![
            fact("a", |p| p.db_exists = true),
            fact("b", |p| {
                p.has_nma_sidecar = true;
                p.db_exists = true;
            }),
            fact("c", |_| {}),
        ]);
        assert_eq!(pf.find_re_ip_pods(ReIpFilter::OnlyWithDbs).len(), 1);
        assert_eq!(pf.find_re_ip_pods(ReIpFilter::OnlyWithoutDbs).len(), 1);
        assert_eq!(pf.find_re_ip_pods(ReIpFilter::Any).len(), 2);
    }

    #[test]
    fn test_secondaries_with_different_image() {
        let pf = facts(vec![
            fact("p", |p| p.image = "new".into()),
            fact("s1", |p| {
                p.is_primary = false;
                p.subcluster_name = "s1".into();
                p.image = "old".into();
            }),
            fact("s2", |p| {
                p.is_primary = false;
                p.subcluster_name = "s2".into();
                p.image = "new".into();
            }),
        ]);
        let (scs, image) = pf.find_secondary_subclusters_with_different_image();
        assert_eq!(scs, vec!["s1"]);
        assert_eq!(image, "new");
    }

    #[test]
    fn test_zero_installed() {
        let pf = facts(vec![fact("a", |p| {
            p.is_installed = false;
            p.managed_by_parent = true;
        })]);
        assert!(pf.are_all_pods_running_and_zero_installed());
        let pf = facts(vec![fact("a", |p| {
            p.is_installed = false;
            p.is_pod_running = false;
            p.managed_by_parent = true;
        })]);
        assert!(!pf.are_all_pods_running_and_zero_installed());
    }
}
