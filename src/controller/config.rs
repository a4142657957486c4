//! Per-pass configuration snapshot.
//!
//! Feature flags and tunables are spread over annotations and spec fields.
//! They are parsed once per reconcile pass into [`PassConfig`] so actors
//! branch on typed values instead of annotation strings.

use std::time::Duration;

use crate::crd::VerticaDB;
use crate::crd::annotations::{
    self, DEFAULT_RESTART_TIMEOUT_SECS, DEFAULT_SUPERUSER, DEFAULT_UPGRADE_REQUEUE_SECS,
    bool_annotation, u64_annotation,
};
use crate::crd::version::{NMA_IN_SIDECAR_MIN_VERSION, VersionInfo};

/// Tooling used to administer the database.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeploymentMode {
    Admintools,
    VClusterOps,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PassConfig {
    pub deployment: DeploymentMode,
    pub tls_auth_enabled: bool,
    /// The node management agent runs in its own container.
    pub nma_sidecar: bool,
    /// Server version cached in annotations; `None` until first detected.
    pub version: Option<VersionInfo>,
    /// Replaces every requeue delay when set.
    pub requeue_time: Option<Duration>,
    pub upgrade_requeue_time: Duration,
    /// Zero means the tool default.
    pub restart_timeout_secs: u64,
    pub ignore_upgrade_path: bool,
    pub k_safety: u8,
    pub superuser: String,
}

impl PassConfig {
    pub fn from_vdb(vdb: &VerticaDB) -> Self {
        let empty = Default::default();
        let ann = vdb.metadata.annotations.as_ref().unwrap_or(&empty);

        let deployment = if bool_annotation(ann, annotations::VCLUSTER_OPS, true) {
            DeploymentMode::VClusterOps
        } else {
            DeploymentMode::Admintools
        };
        let version = ann
            .get(annotations::VERSION)
            .and_then(|v| VersionInfo::parse(v));
        // Sidecar mode is implied by vclusterops on servers new enough to support it.
        let sidecar_default = deployment == DeploymentMode::VClusterOps
            && version
                .as_ref()
                .is_none_or(|v| v.is_equal_or_newer(NMA_IN_SIDECAR_MIN_VERSION));

        let requeue_secs = u64_annotation(ann, annotations::REQUEUE_TIME, vdb.spec.requeue_time);
        let upgrade_requeue_secs = match u64_annotation(
            ann,
            annotations::UPGRADE_REQUEUE_TIME,
            vdb.spec.upgrade_requeue_time,
        ) {
            0 => DEFAULT_UPGRADE_REQUEUE_SECS,
            n => n,
        };

        Self {
            deployment,
            tls_auth_enabled: bool_annotation(ann, annotations::ENABLE_TLS_AUTH, false),
            nma_sidecar: bool_annotation(ann, annotations::RUN_NMA_IN_SIDECAR, sidecar_default),
            version,
            requeue_time: (requeue_secs > 0).then(|| Duration::from_secs(requeue_secs)),
            upgrade_requeue_time: Duration::from_secs(upgrade_requeue_secs),
            restart_timeout_secs: u64_annotation(
                ann,
                annotations::RESTART_TIMEOUT,
                DEFAULT_RESTART_TIMEOUT_SECS,
            ),
            ignore_upgrade_path: bool_annotation(ann, annotations::IGNORE_UPGRADE_PATH, false),
            k_safety: if ann.get(annotations::K_SAFETY).map(String::as_str) == Some("0") {
                0
            } else {
                1
            },
            superuser: ann
                .get(annotations::SUPERUSER_NAME)
                .cloned()
                .unwrap_or_else(|| DEFAULT_SUPERUSER.to_string()),
        }
    }

    pub fn uses_vclusterops(&self) -> bool {
        self.deployment == DeploymentMode::VClusterOps
    }

    /// True if the cached version is at least `min`. Unknown versions are not.
    pub fn version_at_least(&self, min: &str) -> bool {
        self.version
            .as_ref()
            .is_some_and(|v| v.is_equal_or_newer(min))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::crd::VerticaDBSpec;
    use std::collections::BTreeMap;

    fn vdb_with(pairs: &[(&str, &str)]) -> VerticaDB {
        let mut vdb = VerticaDB::new("v", VerticaDBSpec::default());
        vdb.metadata.annotations = Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        );
        vdb
    }

    #[test]
    fn test_defaults() {
        let cfg = PassConfig::from_vdb(&VerticaDB::new("v", VerticaDBSpec::default()));
        assert_eq!(cfg.deployment, DeploymentMode::VClusterOps);
        assert!(cfg.nma_sidecar);
        assert_eq!(cfg.requeue_time, None);
        assert_eq!(cfg.upgrade_requeue_time, Duration::from_secs(30));
        assert_eq!(cfg.k_safety, 1);
        assert_eq!(cfg.superuser, "dbadmin");
    }

    #[test]
    fn test_admintools_mode() {
        let cfg = PassConfig::from_vdb(&vdb_with(&[
            (annotations::VCLUSTER_OPS, "false"),
            (annotations::VERSION, "v12.0.4-0"),
            (annotations::K_SAFETY, "0"),
        ]));
        assert_eq!(cfg.deployment, DeploymentMode::Admintools);
        assert!(!cfg.nma_sidecar);
        assert!(cfg.version_at_least("v12.0.0"));
        assert_eq!(cfg.k_safety, 0);
    }

    #[test]
    fn test_requeue_times() {
        let mut vdb = vdb_with(&[(annotations::UPGRADE_REQUEUE_TIME, "90")]);
        vdb.spec.requeue_time = 5;
        vdb.spec.upgrade_requeue_time = 10;
        let cfg = PassConfig::from_vdb(&vdb);
        assert_eq!(cfg.requeue_time, Some(Duration::from_secs(5)));
        assert_eq!(cfg.upgrade_requeue_time, Duration::from_secs(90));
    }

    #[test]
    fn test_old_vclusterops_server_has_no_sidecar() {
        let cfg = PassConfig::from_vdb(&vdb_with(&[(annotations::VERSION, "v24.1.0-0")]));
        assert!(!cfg.nma_sidecar);
    }
}
