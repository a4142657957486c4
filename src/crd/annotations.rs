//! Annotation and label keys shared by the operator.
//!
//! Annotations on the VerticaDB carry feature flags and cached facts (the
//! server version); labels on the objects we create let the subcluster finder
//! locate them again.

use std::collections::BTreeMap;

// ============================================================================
// VerticaDB annotations
// ============================================================================

/// Use vclusterops (true) or admintools (false) to manage the database.
pub const VCLUSTER_OPS: &str = "vertica.com/vcluster-ops";
/// Run the node management agent in a sidecar container.
pub const RUN_NMA_IN_SIDECAR: &str = "vertica.com/run-nma-in-sidecar";
/// Enable TLS certificate rotation.
pub const ENABLE_TLS_AUTH: &str = "vertica.com/enable-tls-auth";
/// Version of the server as reported by `vertica --version`.
pub const VERSION: &str = "vertica.com/version";
pub const BUILD_DATE: &str = "vertica.com/buildDate";
pub const BUILD_REF: &str = "vertica.com/buildRef";
/// Skip the upgrade path check.
pub const IGNORE_UPGRADE_PATH: &str = "vertica.com/ignore-upgrade-path";
/// K-safety of the database ("0" or "1").
pub const K_SAFETY: &str = "vertica.com/k-safety";
/// Seconds to wait for a restart before giving up.
pub const RESTART_TIMEOUT: &str = "vertica.com/restart-timeout";
/// Fixed requeue interval, in seconds, for every reconcile.
pub const REQUEUE_TIME: &str = "vertica.com/requeue-time";
/// Requeue interval, in seconds, while an upgrade is in progress.
pub const UPGRADE_REQUEUE_TIME: &str = "vertica.com/upgrade-requeue-time";
/// Version for which the default packages were last installed.
pub const PACKAGES_INSTALLED_VERSION: &str = "vertica.com/packages-installed-version";
/// `<up nodes>/<nodes in the database>`, refreshed with the status.
pub const READY_STATUS: &str = "vertica.com/ready-status";
/// Superuser name.
pub const SUPERUSER_NAME: &str = "vertica.com/superuser-name";
/// Sandbox created by an in-flight replicated upgrade.
pub const REPLICATED_UPGRADE_SANDBOX: &str = "vertica.com/replicated-upgrade-sandbox";
/// Set once the replicated upgrade has copied the data into its sandbox.
pub const REPLICATED_UPGRADE_REPLICATION: &str = "vertica.com/replicated-upgrade-replication";
/// Set once the replicated upgrade's sandbox became the main cluster.
pub const REPLICATED_UPGRADE_PROMOTED: &str = "vertica.com/replicated-upgrade-promoted";

// ============================================================================
// Subcluster annotations
// ============================================================================

/// Replica group ("a" or "b") of a subcluster during a replicated upgrade.
pub const REPLICA_GROUP: &str = "vertica.com/replica-group";
pub const REPLICA_GROUP_A: &str = "a";
pub const REPLICA_GROUP_B: &str = "b";
/// On a group B subcluster: the group A primary it stands in for.
pub const PARENT_SUBCLUSTER: &str = "vertica.com/parent-subcluster";
/// On a group A primary: its group B copy.
pub const CHILD_SUBCLUSTER: &str = "vertica.com/child-subcluster";

pub const DEFAULT_SUPERUSER: &str = "dbadmin";
/// Key of the superuser password inside the password secret.
pub const SUPERUSER_PASSWORD_KEY: &str = "password";
pub const DEFAULT_UPGRADE_REQUEUE_SECS: u64 = 30;
pub const DEFAULT_RESTART_TIMEOUT_SECS: u64 = 0;

// ============================================================================
// Object labels
// ============================================================================

pub const SUBCLUSTER_NAME_LABEL: &str = "vertica.com/subcluster-name";
pub const SUBCLUSTER_TYPE_LABEL: &str = "vertica.com/subcluster-type";
pub const SUBCLUSTER_SVC_NAME_LABEL: &str = "vertica.com/subcluster-svc";
pub const SUBCLUSTER_TRANSIENT_LABEL: &str = "vertica.com/subcluster-transient";
pub const SANDBOX_LABEL: &str = "vertica.com/sandbox";
pub const CLIENT_ROUTING_LABEL: &str = "vertica.com/client-routing";
pub const CLIENT_ROUTING_VALUE: &str = "true";
pub const VDB_INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const OPERATOR_NAME: &str = "vertica-operator";

/// Set on pods by the operator; its presence tells vertica that the pod
/// exposes Kubernetes metadata through the downward API.
pub const KUBERNETES_VERSION_ANNOTATION: &str = "kubernetes.io/version";

// ============================================================================
// Container names and paths
// ============================================================================

pub const SERVER_CONTAINER: &str = "server";
pub const NMA_CONTAINER: &str = "nma";
pub const ADMINTOOLS_CONF: &str = "/opt/vertica/config/admintools.conf";
pub const ADMINTOOLS_BIN: &str = "/opt/vertica/bin/admintools";
pub const VCLUSTER_BIN: &str = "/opt/vertica/bin/vcluster";
pub const VERTICA_BIN: &str = "/opt/vertica/bin/vertica";
pub const INSTALLER_INDICATOR_DIR: &str = "/opt/vertica/config/install-indicator";
pub const STARTUP_COMPLETE_LOG: &str = "startup.log";

// ============================================================================
// Parsing helpers
// ============================================================================

/// Boolean annotation; anything other than a case-insensitive "true" is false.
pub fn bool_annotation(annotations: &BTreeMap<String, String>, key: &str, default: bool) -> bool {
    match annotations.get(key) {
        Some(v) => v.eq_ignore_ascii_case("true"),
        None => default,
    }
}

/// Non-negative integer annotation; unparsable values fall back to the default.
pub fn u64_annotation(annotations: &BTreeMap<String, String>, key: &str, default: u64) -> u64 {
    annotations
        .get(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}
