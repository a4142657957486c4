//! VerticaDB Custom Resource Definition.
//!
//! Declares the desired shape of a Vertica cluster: the image, the database to
//! create or revive, its communal storage and the subclusters (and sandboxes)
//! that make up the cluster. Everything the operator must remember between
//! reconcile passes lives in the status subresource or in annotations.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::scope::ClusterScope;

/// VerticaDB is a custom resource describing a Vertica database cluster.
///
/// Example:
/// ```yaml
/// apiVersion: vertica.com/v1
/// kind: VerticaDB
/// metadata:
///   name: verticadb-sample
///   annotations:
///     vertica.com/vcluster-ops: "true"
/// spec:
///   image: opentext/vertica-k8s:24.3.0-0
///   dbName: vertdb
///   communal:
///     path: s3://bucket/db
///     endpoint: https://s3.amazonaws.com
///     credentialSecret: s3-creds
///   subclusters:
///     - name: main
///       size: 3
///       type: primary
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "vertica.com",
    version = "v1",
    kind = "VerticaDB",
    plural = "verticadbs",
    shortname = "vdb",
    status = "VerticaDBStatus",
    namespaced,
    printcolumn = r#"{"name":"Image", "type":"string", "jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Subclusters", "type":"integer", "jsonPath":".status.subclusterCount"}"#,
    printcolumn = r#"{"name":"Installed", "type":"integer", "jsonPath":".status.addedToDBCount"}"#,
    printcolumn = r#"{"name":"Up", "type":"integer", "jsonPath":".status.upNodeCount"}"#,
    printcolumn = r#"{"name":"Upgrade", "type":"string", "jsonPath":".status.upgradeStatus"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VerticaDBSpec {
    // === Image ===
    /// Vertica server image. Changing it triggers an upgrade.
    #[serde(default = "default_image")]
    pub image: String,

    /// Pull policy applied to the server container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    // === Database ===
    /// Name of the database.
    #[serde(default = "default_db_name")]
    pub db_name: String,

    /// Number of shards in the database. Only used at create time.
    #[serde(default = "default_shard_count")]
    pub shard_count: i32,

    /// How the database is initialized.
    #[serde(default)]
    pub init_policy: InitPolicy,

    /// How an image change is rolled out.
    #[serde(default)]
    pub upgrade_policy: UpgradePolicy,

    /// Restart vertica automatically when a pod comes back without it running.
    #[serde(default = "default_true")]
    pub auto_restart_vertica: bool,

    /// Fixed requeue interval in seconds for every reconcile. Zero keeps the
    /// interval each step asks for.
    #[serde(default)]
    pub requeue_time: u64,

    /// Requeue interval in seconds while an upgrade is in progress.
    #[serde(default)]
    pub upgrade_requeue_time: u64,

    /// Secret holding the superuser password under the `password` key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_secret: Option<String>,

    /// Secret holding the license file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_secret: Option<String>,

    /// TLS secret (`tls.key`, `tls.crt`, `ca.crt`) served by the HTTPS
    /// service and the node management agent. Changing it rotates the
    /// certificates in place.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "nmaTLSSecret")]
    pub nma_tls_secret: Option<String>,

    // === Storage ===
    /// Communal storage location of the database.
    #[serde(default)]
    pub communal: CommunalStorage,

    /// Extra buckets the database may read from or write to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_buckets: Vec<CommunalStorage>,

    /// Local paths inside the pod.
    #[serde(default)]
    pub local: LocalStorage,

    // === Topology ===
    /// Subclusters making up the database.
    #[serde(default)]
    pub subclusters: Vec<Subcluster>,

    /// Sandboxes carved out of the secondary subclusters.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sandboxes: Vec<Sandbox>,

    /// Where client traffic goes while subclusters are being upgraded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporary_subcluster_routing: Option<SubclusterSelection>,

    /// Service account used by the vertica pods.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    // === Custom metadata ===
    /// Labels added to every object the operator creates.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Annotations added to every object the operator creates.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl Default for VerticaDBSpec {
    fn default() -> Self {
        Self {
            image: default_image(),
            image_pull_policy: None,
            db_name: default_db_name(),
            shard_count: default_shard_count(),
            init_policy: InitPolicy::default(),
            upgrade_policy: UpgradePolicy::default(),
            auto_restart_vertica: true,
            requeue_time: 0,
            upgrade_requeue_time: 0,
            password_secret: None,
            license_secret: None,
            nma_tls_secret: None,
            communal: CommunalStorage::default(),
            additional_buckets: Vec::new(),
            local: LocalStorage::default(),
            subclusters: Vec::new(),
            sandboxes: Vec::new(),
            temporary_subcluster_routing: None,
            service_account_name: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }
}

fn default_image() -> String {
    "opentext/vertica-k8s:latest".to_string()
}

fn default_db_name() -> String {
    "vertdb".to_string()
}

fn default_shard_count() -> i32 {
    12
}

fn default_true() -> bool {
    true
}

/// How the database comes into existence.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum InitPolicy {
    /// Create a new database in communal storage.
    #[default]
    Create,
    /// Same as `Create` but skip installing the default packages.
    CreateSkipPackageInstall,
    /// Revive an existing database from communal storage.
    Revive,
    /// Only schedule pods; the database is managed by hand.
    ScheduleOnly,
}

impl std::fmt::Display for InitPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InitPolicy::Create => write!(f, "Create"),
            InitPolicy::CreateSkipPackageInstall => write!(f, "CreateSkipPackageInstall"),
            InitPolicy::Revive => write!(f, "Revive"),
            InitPolicy::ScheduleOnly => write!(f, "ScheduleOnly"),
        }
    }
}

/// Requested upgrade behaviour. `Auto` picks the best strategy the version allows.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum UpgradePolicy {
    #[default]
    Auto,
    Offline,
    ReadOnlyOnline,
    Online,
}

/// Communal (shared object store) location plus its credentials.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CommunalStorage {
    /// Bucket path, e.g. `s3://bucket/prefix`.
    #[serde(default)]
    pub path: String,

    /// Object store endpoint URL.
    #[serde(default)]
    pub endpoint: String,

    /// Region of the bucket.
    #[serde(default)]
    pub region: String,

    /// Secret holding the access credentials.
    #[serde(default)]
    pub credential_secret: String,
}

pub const S3_PREFIX: &str = "s3://";
pub const GCLOUD_PREFIX: &str = "gs://";
pub const AZURE_PREFIX: &str = "azb://";

impl CommunalStorage {
    pub fn is_s3(&self) -> bool {
        self.path.starts_with(S3_PREFIX)
    }

    pub fn is_gcloud(&self) -> bool {
        self.path.starts_with(GCLOUD_PREFIX)
    }

    pub fn is_azure(&self) -> bool {
        self.path.starts_with(AZURE_PREFIX)
    }

    /// Bucket name: the first path segment after the scheme.
    pub fn bucket(&self) -> &str {
        let rest = self
            .path
            .split_once("://")
            .map_or(self.path.as_str(), |(_, r)| r);
        rest.split('/').next().unwrap_or(rest)
    }
}

/// Local paths mounted inside every vertica pod.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalStorage {
    #[serde(default = "default_data_path")]
    pub data_path: String,

    #[serde(default = "default_depot_path")]
    pub depot_path: String,

    /// Catalog path; defaults to the data path when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_path: Option<String>,

    /// Size of the local PVC, e.g. `10Gi`.
    #[serde(default = "default_request_size")]
    pub request_size: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

impl Default for LocalStorage {
    fn default() -> Self {
        Self {
            data_path: default_data_path(),
            depot_path: default_depot_path(),
            catalog_path: None,
            request_size: default_request_size(),
            storage_class: None,
        }
    }
}

impl LocalStorage {
    pub fn catalog_path(&self) -> &str {
        self.catalog_path.as_deref().unwrap_or(&self.data_path)
    }
}

fn default_data_path() -> String {
    "/data".to_string()
}

fn default_depot_path() -> String {
    "/depot".to_string()
}

fn default_request_size() -> String {
    "500Gi".to_string()
}

/// Role a subcluster plays in the database.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SubclusterType {
    #[default]
    Primary,
    Secondary,
    /// Temporary secondary that only lives during an online upgrade.
    Transient,
    /// Primary of a sandbox; a secondary from the main cluster's point of view.
    SandboxPrimary,
}

impl std::fmt::Display for SubclusterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubclusterType::Primary => write!(f, "primary"),
            SubclusterType::Secondary => write!(f, "secondary"),
            SubclusterType::Transient => write!(f, "transient"),
            SubclusterType::SandboxPrimary => write!(f, "sandboxprimary"),
        }
    }
}

impl std::str::FromStr for SubclusterType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary" => Ok(SubclusterType::Primary),
            "secondary" => Ok(SubclusterType::Secondary),
            "transient" => Ok(SubclusterType::Transient),
            "sandboxprimary" => Ok(SubclusterType::SandboxPrimary),
            other => Err(format!("unknown subcluster type '{other}'")),
        }
    }
}

/// A named, independently sized group of vertica nodes.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Subcluster {
    pub name: String,

    #[serde(default)]
    pub size: i32,

    #[serde(default, rename = "type")]
    pub r#type: SubclusterType,

    /// Image to use instead of `spec.image` (used by online upgrade).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_override: Option<String>,

    /// Name of the service object that fronts this subcluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,

    #[serde(default = "default_service_type")]
    pub service_type: String,

    /// Stop every node of the subcluster and scale the StatefulSet to zero.
    #[serde(default)]
    pub shutdown: bool,

    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

fn default_service_type() -> String {
    "ClusterIP".to_string()
}

impl Subcluster {
    pub fn new(name: impl Into<String>, size: i32, r#type: SubclusterType) -> Self {
        Self {
            name: name.into(),
            size,
            r#type,
            service_type: default_service_type(),
            ..Default::default()
        }
    }

    pub fn is_primary(&self) -> bool {
        self.r#type == SubclusterType::Primary
    }

    pub fn is_secondary(&self) -> bool {
        matches!(
            self.r#type,
            SubclusterType::Secondary | SubclusterType::SandboxPrimary
        )
    }

    pub fn is_transient(&self) -> bool {
        self.r#type == SubclusterType::Transient
    }

    /// Name usable inside a DNS label.
    pub fn fqdn_name(&self) -> String {
        self.name.replace('_', "-")
    }

    pub fn service_name(&self) -> String {
        self.service_name.clone().unwrap_or_else(|| self.fqdn_name())
    }
}

/// A sandbox: a set of secondary subclusters split off from the main cluster.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Sandbox {
    pub name: String,

    /// Image for the sandbox; defaults to `spec.image`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default)]
    pub subclusters: Vec<SandboxSubcluster>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSubcluster {
    pub name: String,
}

/// Routing target for client traffic while a subcluster is offline.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubclusterSelection {
    /// Existing subclusters to route to.
    #[serde(default)]
    pub names: Vec<String>,

    /// Template for a transient subcluster created for the upgrade.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<Subcluster>,
}

// ============================================================================
// Status
// ============================================================================

/// Observed state of a VerticaDB.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VerticaDBStatus {
    /// Pods that have been added to the database.
    #[serde(default)]
    pub added_to_db_count: i32,

    /// Pods whose vertica process is up.
    #[serde(default)]
    pub up_node_count: i32,

    #[serde(default)]
    pub subcluster_count: i32,

    #[serde(default)]
    pub subclusters: Vec<SubclusterStatus>,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Progress message of an in-flight upgrade.
    #[serde(default)]
    pub upgrade_status: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sandboxes: Vec<SandboxStatus>,

    /// Buckets last applied to the database. `None` until the first apply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_buckets: Option<Vec<CommunalStorage>>,

    /// Password secret currently in effect for the superuser.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_secret: Option<String>,

    /// TLS secrets currently in effect, one entry per TLS consumer.
    #[serde(default, rename = "tlsConfigs", skip_serializing_if = "Vec::is_empty")]
    pub tls_configs: Vec<TlsConfigStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Name of the TLS consumer covering HTTPS and the node management agent.
pub const HTTPS_NMA_TLS: &str = "httpsNMA";

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfigStatus {
    pub name: String,
    #[serde(default)]
    pub secret: String,
}

/// Status of one subcluster.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubclusterStatus {
    pub name: String,

    /// Object id of the subcluster in the catalog.
    #[serde(default)]
    pub oid: String,

    #[serde(default)]
    pub added_to_db_count: i32,

    #[serde(default)]
    pub up_node_count: i32,

    #[serde(default)]
    pub shutdown: bool,

    /// One entry per pod index.
    #[serde(default)]
    pub detail: Vec<VerticaDBPodStatus>,
}

/// Status of one pod.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VerticaDBPodStatus {
    #[serde(default)]
    pub installed: bool,

    #[serde(default)]
    pub added_to_db: bool,

    #[serde(default)]
    pub vnode_name: String,

    #[serde(default)]
    pub up_node: bool,

    #[serde(default)]
    pub read_only: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SandboxStatus {
    pub name: String,

    #[serde(default)]
    pub subclusters: Vec<String>,

    #[serde(default)]
    pub upgrade_state: SandboxUpgradeState,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SandboxUpgradeState {
    #[serde(default)]
    pub upgrade_in_progress: bool,

    #[serde(default)]
    pub upgrade_status: String,
}

/// Condition describes the state of a VerticaDB at a certain point.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition.
    pub r#type: String,
    /// Status of the condition ("True", "False", "Unknown").
    pub status: String,
    /// Machine-readable reason for the condition's last transition.
    pub reason: String,
    /// Human-readable message indicating details about last transition.
    #[serde(default)]
    pub message: String,
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

// Timestamps are ignored so that re-setting an unchanged condition is not a change.
impl PartialEq for Condition {
    fn eq(&self, other: &Self) -> bool {
        self.r#type == other.r#type
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

impl Condition {
    /// Create a new condition.
    pub fn new(
        condition_type: ConditionType,
        status: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status: if status {
                "True".to_string()
            } else {
                "False".to_string()
            },
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: jiff::Timestamp::now().to_string(),
            observed_generation: generation,
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

/// Condition types set on a VerticaDB.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ConditionType {
    /// Operator restarts vertica when it goes down.
    AutoRestartVertica,
    /// Database has been created or revived.
    DbInitialized,
    /// Any image change is in progress.
    UpgradeInProgress,
    OfflineUpgradeInProgress,
    ReadOnlyOnlineUpgradeInProgress,
    OnlineUpgradeInProgress,
    /// A TLS certificate rotation has started and not finished.
    TlsCertRotationInProgress,
    /// The HTTPS half of the rotation is done; the agents are next.
    HttpsCertRotationFinished,
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionType::AutoRestartVertica => write!(f, "AutoRestartVertica"),
            ConditionType::DbInitialized => write!(f, "DBInitialized"),
            ConditionType::UpgradeInProgress => write!(f, "UpgradeInProgress"),
            ConditionType::OfflineUpgradeInProgress => write!(f, "OfflineUpgradeInProgress"),
            ConditionType::ReadOnlyOnlineUpgradeInProgress => {
                write!(f, "ReadOnlyOnlineUpgradeInProgress")
            }
            ConditionType::OnlineUpgradeInProgress => write!(f, "OnlineUpgradeInProgress"),
            ConditionType::TlsCertRotationInProgress => write!(f, "TLSCertRotationInProgress"),
            ConditionType::HttpsCertRotationFinished => write!(f, "HTTPSCertRotationFinished"),
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

impl VerticaDB {
    pub fn namespace_or_default(&self) -> String {
        self.metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string())
    }

    pub fn name_any_str(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    /// Merge `new` into the annotations. Returns true if anything changed.
    pub fn merge_annotations(&mut self, new: &BTreeMap<String, String>) -> bool {
        let annotations = self.metadata.annotations.get_or_insert_with(BTreeMap::new);
        let mut changed = false;
        for (k, v) in new {
            if annotations.get(k) != Some(v) {
                annotations.insert(k.clone(), v.clone());
                changed = true;
            }
        }
        changed
    }

    pub fn subcluster_map(&self) -> BTreeMap<&str, &Subcluster> {
        self.spec
            .subclusters
            .iter()
            .map(|sc| (sc.name.as_str(), sc))
            .collect()
    }

    pub fn first_primary_subcluster(&self) -> Option<&Subcluster> {
        self.spec.subclusters.iter().find(|sc| sc.is_primary())
    }

    pub fn find_transient_subcluster(&self) -> Option<&Subcluster> {
        self.spec.subclusters.iter().find(|sc| sc.is_transient())
    }

    /// True when the temporary routing template describes a transient subcluster.
    pub fn requires_transient_subcluster(&self) -> bool {
        self.spec
            .temporary_subcluster_routing
            .as_ref()
            .and_then(|r| r.template.as_ref())
            .is_some_and(|t| !t.name.is_empty() && t.size > 0)
    }

    /// Build the transient subcluster from the routing template.
    pub fn build_transient_subcluster(&self, image_override: &str) -> Option<Subcluster> {
        let template = self
            .spec
            .temporary_subcluster_routing
            .as_ref()?
            .template
            .as_ref()?;
        Some(Subcluster {
            name: template.name.clone(),
            size: template.size,
            r#type: SubclusterType::Transient,
            image_override: Some(image_override.to_string()),
            service_name: None,
            service_type: default_service_type(),
            shutdown: false,
            node_selector: template.node_selector.clone(),
            annotations: BTreeMap::new(),
        })
    }

    pub fn find_subcluster_status(&self, name: &str) -> Option<&SubclusterStatus> {
        self.status
            .as_ref()?
            .subclusters
            .iter()
            .find(|s| s.name == name)
    }

    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    pub fn is_condition_true(&self, condition: ConditionType) -> bool {
        let name = condition.to_string();
        self.conditions()
            .iter()
            .any(|c| c.r#type == name && c.is_true())
    }

    /// Status, created empty if the object has none yet.
    pub fn status_mut(&mut self) -> &mut VerticaDBStatus {
        self.status.get_or_insert_with(VerticaDBStatus::default)
    }

    pub fn upgrade_status(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.upgrade_status.as_str())
            .unwrap_or_default()
    }

    /// Upgrade progress message of a scope. Sandboxes keep their own.
    pub fn upgrade_status_for_scope(&self, scope: &ClusterScope) -> &str {
        match scope.sandbox_name() {
            None => self.upgrade_status(),
            Some(sb) => self
                .find_sandbox_status(sb)
                .map(|s| s.upgrade_state.upgrade_status.as_str())
                .unwrap_or_default(),
        }
    }

    /// Which scope a subcluster belongs to, based on the sandbox definitions.
    pub fn scope_of_subcluster(&self, sc_name: &str) -> ClusterScope {
        self.spec
            .sandboxes
            .iter()
            .find(|sb| sb.subclusters.iter().any(|s| s.name == sc_name))
            .map_or(ClusterScope::MainCluster, |sb| {
                ClusterScope::Sandbox(sb.name.clone())
            })
    }

    /// Subclusters of the spec that belong to `scope`.
    pub fn subclusters_in_scope(&self, scope: &ClusterScope) -> Vec<&Subcluster> {
        self.spec
            .subclusters
            .iter()
            .filter(|sc| &self.scope_of_subcluster(&sc.name) == scope)
            .collect()
    }

    pub fn find_sandbox(&self, name: &str) -> Option<&Sandbox> {
        self.spec.sandboxes.iter().find(|sb| sb.name == name)
    }

    pub fn find_sandbox_status(&self, name: &str) -> Option<&SandboxStatus> {
        self.status
            .as_ref()?
            .sandboxes
            .iter()
            .find(|sb| sb.name == name)
    }

    /// Apply `f` to the status entry of a sandbox, appending an empty entry
    /// first if the sandbox has none.
    pub fn update_sandbox_status<R>(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut SandboxStatus) -> R,
    ) -> R {
        let sandboxes = &mut self.status_mut().sandboxes;
        if let Some(sb) = sandboxes.iter_mut().find(|sb| sb.name == name) {
            return f(sb);
        }
        let mut sb = SandboxStatus {
            name: name.to_string(),
            ..Default::default()
        };
        let out = f(&mut sb);
        sandboxes.push(sb);
        out
    }

    /// Sandbox a subcluster was last seen in, according to the status.
    pub fn sandbox_of_subcluster_in_status(&self, sc_name: &str) -> Option<&str> {
        self.status
            .as_ref()?
            .sandboxes
            .iter()
            .find(|sb| sb.subclusters.iter().any(|s| s == sc_name))
            .map(|sb| sb.name.as_str())
    }

    /// Secret in effect for a TLS consumer.
    pub fn tls_secret_in_use(&self, name: &str) -> Option<&str> {
        self.status
            .as_ref()?
            .tls_configs
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.secret.as_str())
            .filter(|s| !s.is_empty())
    }

    /// Target image for a scope: sandboxes may pin their own image.
    pub fn image_for_scope(&self, scope: &ClusterScope) -> &str {
        match scope {
            ClusterScope::MainCluster => &self.spec.image,
            ClusterScope::Sandbox(name) => self
                .find_sandbox(name)
                .and_then(|sb| sb.image.as_deref())
                .unwrap_or(&self.spec.image),
        }
    }

    pub fn db_catalog_path(&self) -> String {
        format!("{}/{}", self.spec.local.catalog_path(), self.spec.db_name)
    }

    pub fn db_data_path(&self) -> String {
        format!("{}/{}", self.spec.local.data_path, self.spec.db_name)
    }

    pub fn db_depot_path(&self) -> String {
        format!("{}/{}", self.spec.local.depot_path, self.spec.db_name)
    }

    /// Name of the install indicator file; unique per VerticaDB instance.
    pub fn installer_indicator_file(&self) -> String {
        format!(
            "{}/{}",
            crate::crd::annotations::INSTALLER_INDICATOR_DIR,
            self.metadata.uid.as_deref().unwrap_or_default()
        )
    }

    /// Eon mode databases keep their data in communal storage.
    pub fn is_eon(&self) -> bool {
        !self.spec.communal.path.is_empty()
    }

    /// Communal path, suffixed with the UID so each instance writes its own location.
    pub fn communal_path(&self) -> String {
        match self.metadata.uid.as_deref() {
            Some(uid) if !uid.is_empty() => format!("{}/{}", self.spec.communal.path, uid),
            _ => self.spec.communal.path.clone(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta;

    fn vdb() -> VerticaDB {
        let mut vdb = VerticaDB::new(
            "v",
            VerticaDBSpec {
                subclusters: vec![
                    Subcluster::new("pri", 3, SubclusterType::Primary),
                    Subcluster::new("sec", 2, SubclusterType::Secondary),
                    Subcluster::new("sb_sc", 1, SubclusterType::Secondary),
                ],
                sandboxes: vec![Sandbox {
                    name: "sand".into(),
                    image: Some("vertica:sandbox".into()),
                    subclusters: vec![SandboxSubcluster {
                        name: "sb_sc".into(),
                    }],
                }],
                ..Default::default()
            },
        );
        vdb.metadata = ObjectMeta {
            name: Some("v".into()),
            namespace: Some("ns".into()),
            uid: Some("abc".into()),
            ..Default::default()
        };
        vdb
    }

    #[test]
    fn test_spec_defaults() {
        let spec = VerticaDBSpec::default();
        assert_eq!(spec.db_name, "vertdb");
        assert_eq!(spec.shard_count, 12);
        assert_eq!(spec.init_policy, InitPolicy::Create);
        assert_eq!(spec.upgrade_policy, UpgradePolicy::Auto);
        assert!(spec.auto_restart_vertica);
    }

    #[test]
    fn test_subcluster_type_roundtrip() {
        for t in ["primary", "secondary", "transient", "sandboxprimary"] {
            let parsed: SubclusterType = t.parse().unwrap();
            assert_eq!(parsed.to_string(), t);
        }
        assert!("weird".parse::<SubclusterType>().is_err());
    }

    #[test]
    fn test_scope_of_subcluster() {
        let vdb = vdb();
        assert_eq!(vdb.scope_of_subcluster("pri"), ClusterScope::MainCluster);
        assert_eq!(
            vdb.scope_of_subcluster("sb_sc"),
            ClusterScope::Sandbox("sand".into())
        );
        assert_eq!(vdb.subclusters_in_scope(&ClusterScope::MainCluster).len(), 2);
        assert_eq!(
            vdb.image_for_scope(&ClusterScope::Sandbox("sand".into())),
            "vertica:sandbox"
        );
    }

    #[test]
    fn test_merge_annotations_reports_change() {
        let mut vdb = vdb();
        let mut new = BTreeMap::new();
        new.insert("a".to_string(), "1".to_string());
        assert!(vdb.merge_annotations(&new));
        assert!(!vdb.merge_annotations(&new));
        new.insert("a".to_string(), "2".to_string());
        assert!(vdb.merge_annotations(&new));
        assert_eq!(vdb.annotation("a"), Some("2"));
    }

    #[test]
    fn test_bucket_name() {
        let b = CommunalStorage {
            path: "s3://mybucket/extra/path".into(),
            ..Default::default()
        };
        assert!(b.is_s3());
        assert_eq!(b.bucket(), "mybucket");
    }

    #[test]
    fn test_paths() {
        let vdb = vdb();
        assert_eq!(vdb.db_catalog_path(), "/data/vertdb");
        assert_eq!(vdb.db_depot_path(), "/depot/vertdb");
        assert!(vdb.installer_indicator_file().ends_with("/abc"));
    }

    #[test]
    fn test_update_sandbox_status_appends_once() {
        let mut vdb = vdb();
        vdb.update_sandbox_status("sand", |sb| sb.subclusters.push("sb_sc".into()));
        vdb.update_sandbox_status("sand", |sb| sb.upgrade_state.upgrade_in_progress = true);
        let status = vdb.status.as_ref().unwrap();
        assert_eq!(status.sandboxes.len(), 1);
        assert!(status.sandboxes[0].upgrade_state.upgrade_in_progress);
        assert_eq!(vdb.sandbox_of_subcluster_in_status("sb_sc"), Some("sand"));
        assert_eq!(vdb.sandbox_of_subcluster_in_status("pri"), None);
    }

    #[test]
    fn test_tls_secret_in_use() {
        let mut vdb = vdb();
        assert_eq!(vdb.tls_secret_in_use(HTTPS_NMA_TLS), None);
        vdb.status_mut().tls_configs.push(TlsConfigStatus {
            name: HTTPS_NMA_TLS.into(),
            secret: "cert-1".into(),
        });
        assert_eq!(vdb.tls_secret_in_use(HTTPS_NMA_TLS), Some("cert-1"));
        let json = serde_json::to_value(vdb.status.as_ref().unwrap()).unwrap();
        assert_eq!(json["tlsConfigs"][0]["secret"], "cert-1");
    }

    #[test]
    fn test_condition_equality_ignores_time() {
        let a = Condition::new(ConditionType::DbInitialized, true, "Init", "", None);
        let mut b = a.clone();
        b.last_transition_time = "1970-01-01T00:00:00Z".into();
        assert_eq!(a, b);
        assert_eq!(a.r#type, "DBInitialized");
    }
}
