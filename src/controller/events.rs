//! Kubernetes events emitted by the reconcile actors.
//!
//! Events are observability only. Publishing never fails a reconcile: the
//! production sink logs and swallows publish errors.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::crd::VerticaDB;

// Upgrade
pub const UPGRADE_START: &str = "UpgradeStart";
pub const UPGRADE_SUCCEEDED: &str = "UpgradeSucceeded";
pub const INCOMPATIBLE_ONLINE_UPGRADE: &str = "IncompatibleOnlineUpgrade";
pub const CLUSTER_SHUTDOWN_STARTED: &str = "ClusterShutdownStarted";
pub const CLUSTER_SHUTDOWN_SUCCEEDED: &str = "ClusterShutdownSucceeded";
pub const CLUSTER_SHUTDOWN_FAILED: &str = "ClusterShutdownFailed";
pub const SUBCLUSTER_SHUTDOWN_STARTED: &str = "SubclusterShutdownStarted";

// Sandboxes
pub const SANDBOX_SUBCLUSTER_START: &str = "SandboxSubclusterStart";
pub const SANDBOX_SUBCLUSTER_SUCCEEDED: &str = "SandboxSubclusterSucceeded";
pub const SANDBOX_SUBCLUSTER_FAILED: &str = "SandboxSubclusterFailed";
pub const UNSANDBOX_SUBCLUSTER_START: &str = "UnsandboxSubclusterStart";
pub const UNSANDBOX_SUBCLUSTER_SUCCEEDED: &str = "UnsandboxSubclusterSucceeded";
pub const UNSANDBOX_SUBCLUSTER_FAILED: &str = "UnsandboxSubclusterFailed";
pub const UNSUPPORTED_DEPLOYMENT: &str = "UnsupportedDeployment";
pub const REPLICATION_STARTED: &str = "ReplicationStarted";
pub const REPLICATION_SUCCEEDED: &str = "ReplicationSucceeded";
pub const REPLICATION_FAILED: &str = "ReplicationFailed";
pub const PROMOTE_SANDBOX_SUCCEEDED: &str = "PromoteSandboxToMainSucceeded";
pub const PROMOTE_SANDBOX_FAILED: &str = "PromoteSandboxToMainFailed";

// TLS
pub const TLS_CERT_ROTATION_STARTED: &str = "TLSCertRotationStarted";
pub const TLS_CERT_ROTATION_SUCCEEDED: &str = "TLSCertRotationSucceeded";
pub const TLS_CERT_ROTATION_FAILED: &str = "TLSCertRotationFailed";
pub const TLS_SECRET_NOT_FOUND: &str = "TLSSecretNotFound";

// Version checks
pub const WRONG_IMAGE: &str = "WrongImage";
pub const INVALID_UPGRADE_PATH: &str = "InvalidUpgradePath";
pub const UNSUPPORTED_VERTICA_VERSION: &str = "UnsupportedVerticaVersion";

// Database lifecycle
pub const CREATE_DB_START: &str = "CreateDBStart";
pub const CREATE_DB_SUCCEEDED: &str = "CreateDBSucceeded";
pub const CREATE_DB_FAILED: &str = "CreateDBFailed";
pub const REVIVE_DB_START: &str = "ReviveDBStart";
pub const REVIVE_DB_SUCCEEDED: &str = "ReviveDBSucceeded";
pub const REVIVE_DB_FAILED: &str = "ReviveDBFailed";
pub const CLUSTER_RESTART_STARTED: &str = "ClusterRestartStarted";
pub const CLUSTER_RESTART_SUCCEEDED: &str = "ClusterRestartSucceeded";
pub const NODE_RESTART_STARTED: &str = "NodeRestartStarted";
pub const NODE_RESTART_SUCCEEDED: &str = "NodeRestartSucceeded";
pub const NODE_RESTART_FAILED: &str = "NodeRestartFailed";
pub const REIP_FAILED: &str = "ReipFailed";
pub const ADD_NODE_START: &str = "AddNodeStart";
pub const ADD_NODE_SUCCEEDED: &str = "AddNodeSucceeded";
pub const ADD_NODE_FAILED: &str = "AddNodeFailed";
pub const REMOVE_NODES_START: &str = "RemoveNodesStart";
pub const REMOVE_NODES_SUCCEEDED: &str = "RemoveNodesSucceeded";
pub const REMOVE_NODES_FAILED: &str = "RemoveNodesFailed";
pub const ADD_SUBCLUSTER_START: &str = "AddSubclusterStart";
pub const ADD_SUBCLUSTER_SUCCEEDED: &str = "AddSubclusterSucceeded";
pub const ADD_SUBCLUSTER_FAILED: &str = "AddSubclusterFailed";
pub const REMOVE_SUBCLUSTER_START: &str = "RemoveSubclusterStart";
pub const REMOVE_SUBCLUSTER_SUCCEEDED: &str = "RemoveSubclusterSucceeded";
pub const REMOVE_SUBCLUSTER_FAILED: &str = "RemoveSubclusterFailed";
pub const REBALANCE_SHARDS: &str = "RebalanceShards";
pub const INSTALL_PACKAGES_STARTED: &str = "InstallPackagesStarted";
pub const INSTALL_PACKAGES_FINISHED: &str = "InstallPackagesFinished";
pub const INSTALL_PACKAGES_FAILED: &str = "InstallPackagesFailed";

// Configuration
pub const COMMUNAL_CREDS_WRONG_KEY: &str = "CommunalCredsWrongKey";
pub const ADDITIONAL_BUCKETS_UPDATED: &str = "AdditionalBucketsUpdated";
pub const SUPERUSER_PASSWORD_SECRET_NOT_FOUND: &str = "SuperuserPasswordSecretNotFound";
pub const SUPERUSER_PASSWORD_UPDATED: &str = "SuperuserPasswordUpdated";
pub const SUPERUSER_PASSWORD_UPDATE_FAILED: &str = "SuperuserPasswordUpdateFailed";

// Diagnostics
pub const CRASH_LOOP_DETECTED: &str = "CrashLoopDetected";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

/// Fire-and-forget event emission.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn event(&self, vdb: &VerticaDB, kind: EventKind, reason: &str, message: String);
}

/// An event captured by [`RecordingEventSink`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    pub kind: EventKind,
    pub reason: String,
    pub message: String,
}

/// Sink that keeps every event in memory.
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn with_reason(&self, reason: &str) -> Vec<RecordedEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.reason == reason)
            .collect()
    }

    pub fn has_reason(&self, reason: &str) -> bool {
        !self.with_reason(reason).is_empty()
    }
}

#[async_trait]
impl EventSink for RecordingEventSink {
    async fn event(&self, _vdb: &VerticaDB, kind: EventKind, reason: &str, message: String) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedEvent {
                kind,
                reason: reason.to_string(),
                message,
            });
    }
}
