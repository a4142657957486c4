//! Admin commands against the database.
//!
//! The operator never talks to the database engine directly for
//! administrative work. It describes the operation with an options struct and
//! hands it to a [`Dispatcher`], which runs it from an initiator pod and
//! reports success or failure. Two implementations exist: one drives
//! `admintools`, the other the `vcluster` CLI. Which one is used depends on
//! the deployment mode of the VerticaDB.

use async_trait::async_trait;

use serde::Deserialize;

use super::parsing::first_row;
use super::pod_runner::{PodName, PodRunner};
use crate::controller::error::{Error, Result};
use crate::crd::ClusterScope;
use crate::crd::annotations::SERVER_CONTAINER;
use crate::crd::version::VersionInfo;

/// Database every dispatched command operates on.
#[derive(Clone, Debug, Default)]
pub struct DatabaseTarget {
    pub db_name: String,
    /// Superuser password; `None` when the database has no password.
    pub password: Option<String>,
    /// Server version, when known. Some flags depend on it.
    pub version: Option<VersionInfo>,
}

/// A database host: the pod we exec in plus the address vertica knows it by.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Host {
    pub pod: PodName,
    pub ip: String,
    /// Vertica node name; empty if the node is not in the database yet.
    pub vnode_name: String,
}

#[derive(Clone, Debug)]
pub struct CreateDbOptions {
    pub initiator: PodName,
    pub hosts: Vec<Host>,
    pub communal_path: String,
    pub communal_endpoint: String,
    pub catalog_path: String,
    pub data_path: String,
    pub depot_path: String,
    pub shard_count: i32,
    pub subcluster: String,
    pub skip_package_install: bool,
}

#[derive(Clone, Debug)]
pub struct ReviveDbOptions {
    pub initiator: PodName,
    pub hosts: Vec<Host>,
    pub communal_path: String,
    pub communal_endpoint: String,
}

#[derive(Clone, Debug)]
pub struct StartDbOptions {
    pub initiator: PodName,
    pub hosts: Vec<Host>,
    pub scope: ClusterScope,
    /// Seconds to wait for the nodes; zero uses the tool default.
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct StopDbOptions {
    pub initiator: PodName,
    pub scope: ClusterScope,
}

#[derive(Clone, Debug)]
pub struct RestartNodeOptions {
    pub initiator: PodName,
    pub hosts: Vec<Host>,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ReIpOptions {
    pub initiator: PodName,
    pub hosts: Vec<Host>,
}

#[derive(Clone, Debug)]
pub struct AddNodeOptions {
    pub initiator: PodName,
    pub subcluster: String,
    pub hosts: Vec<Host>,
}

#[derive(Clone, Debug)]
pub struct RemoveNodeOptions {
    pub initiator: PodName,
    pub hosts: Vec<Host>,
}

#[derive(Clone, Debug)]
pub struct AddSubclusterOptions {
    pub initiator: PodName,
    pub subcluster: String,
    pub is_primary: bool,
}

#[derive(Clone, Debug)]
pub struct RemoveSubclusterOptions {
    pub initiator: PodName,
    pub subcluster: String,
}

#[derive(Clone, Debug)]
pub struct InstallPackagesOptions {
    pub initiator: PodName,
    pub force_reinstall: bool,
}

#[derive(Clone, Debug)]
pub struct RebalanceShardsOptions {
    pub initiator: PodName,
    pub subcluster: String,
}

#[derive(Clone, Debug)]
pub struct SetConfigParameterOptions {
    pub initiator: PodName,
    pub name: String,
    pub value: String,
}

#[derive(Clone, Debug)]
pub struct SandboxSubclusterOptions {
    pub initiator: PodName,
    pub subcluster: String,
    pub sandbox: String,
}

#[derive(Clone, Debug)]
pub struct UnsandboxSubclusterOptions {
    pub initiator: PodName,
    pub subcluster: String,
}

/// Copy the main cluster's data into a sandbox.
#[derive(Clone, Debug)]
pub struct ReplicateDbOptions {
    pub initiator: PodName,
    /// Host in the sandbox that receives the data.
    pub target_host: String,
    pub target_sandbox: String,
}

#[derive(Clone, Debug)]
pub struct PromoteSandboxOptions {
    pub initiator: PodName,
    pub sandbox: String,
}

/// PEM material for a certificate rotation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CertBundle {
    pub key: String,
    pub cert: String,
    pub ca: String,
}

#[derive(Clone, Debug)]
pub struct RotateHttpsCertsOptions {
    pub initiator: PodName,
    pub secret_name: String,
    pub bundle: CertBundle,
    pub tls_mode: String,
}

#[derive(Clone, Debug)]
pub struct RotateNmaCertsOptions {
    pub initiator: PodName,
    pub hosts: Vec<Host>,
    pub bundle: CertBundle,
}

/// Outcome of installing the default packages.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstallPackagesStatus {
    /// Packages that failed to install, with the reported reason.
    pub failed: Vec<(String, String)>,
}

/// Issues admin operations to the database.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn create_db(&self, opts: &CreateDbOptions) -> Result<()>;
    async fn revive_db(&self, opts: &ReviveDbOptions) -> Result<()>;
    async fn start_db(&self, opts: &StartDbOptions) -> Result<()>;
    async fn stop_db(&self, opts: &StopDbOptions) -> Result<()>;
    async fn restart_node(&self, opts: &RestartNodeOptions) -> Result<()>;
    async fn re_ip(&self, opts: &ReIpOptions) -> Result<()>;
    async fn add_node(&self, opts: &AddNodeOptions) -> Result<()>;
    async fn remove_node(&self, opts: &RemoveNodeOptions) -> Result<()>;
    async fn add_subcluster(&self, opts: &AddSubclusterOptions) -> Result<()>;
    async fn remove_subcluster(&self, opts: &RemoveSubclusterOptions) -> Result<()>;
    async fn install_packages(&self, opts: &InstallPackagesOptions)
    -> Result<InstallPackagesStatus>;
    async fn rebalance_shards(&self, opts: &RebalanceShardsOptions) -> Result<()>;
    async fn set_config_parameter(&self, opts: &SetConfigParameterOptions) -> Result<()>;
    async fn get_config_parameter(&self, initiator: &PodName, name: &str) -> Result<String>;
    /// Wait until the HTTPS service answers on the initiator.
    async fn poll_https(&self, initiator: &PodName) -> Result<()>;
    async fn sandbox_subcluster(&self, opts: &SandboxSubclusterOptions) -> Result<()>;
    async fn unsandbox_subcluster(&self, opts: &UnsandboxSubclusterOptions) -> Result<()>;
    async fn replicate_db(&self, opts: &ReplicateDbOptions) -> Result<()>;
    /// Turn a sandbox into the main cluster, dropping the old main cluster.
    async fn promote_sandbox(&self, opts: &PromoteSandboxOptions) -> Result<()>;
    async fn rotate_https_certs(&self, opts: &RotateHttpsCertsOptions) -> Result<()>;
    async fn rotate_nma_certs(&self, opts: &RotateNmaCertsOptions) -> Result<()>;
}

/// Error for verbs only the `vcluster` CLI knows.
pub(crate) fn unsupported(op: &str) -> Error {
    Error::Dispatch {
        op: op.to_string(),
        message: "not supported by admintools deployments".to_string(),
    }
}

/// Per-package result as printed by `vcluster install_packages`.
#[derive(Debug, Deserialize)]
struct PackageStatus {
    #[serde(default)]
    package_name: String,
    #[serde(default)]
    install_status: String,
}

#[derive(Debug, Deserialize)]
struct PackageReport {
    #[serde(default)]
    packages: Vec<PackageStatus>,
}

/// Parse the JSON report of `vcluster install_packages`.
pub fn parse_package_report(output: &str) -> Result<InstallPackagesStatus> {
    // The report may be preceded by log lines.
    let json = output.find('{').map_or("", |i| output.get(i..).unwrap_or_default());
    if json.trim().is_empty() {
        return Ok(InstallPackagesStatus::default());
    }
    let report: PackageReport = serde_json::from_str(json)?;
    Ok(InstallPackagesStatus {
        failed: report
            .packages
            .into_iter()
            .filter(|p| p.install_status.starts_with("Failed"))
            .map(|p| (p.package_name, p.install_status))
            .collect(),
    })
}

// ============================================================================
// SQL-backed operations shared by both dispatchers
// ============================================================================

fn dispatch_error(op: &str, e: Error) -> Error {
    Error::Dispatch {
        op: op.to_string(),
        message: e.to_string(),
    }
}

pub(crate) async fn vsql_rebalance_shards(
    runner: &dyn PodRunner,
    opts: &RebalanceShardsOptions,
) -> Result<()> {
    let sql = format!("SELECT REBALANCE_SHARDS('{}');", sql_quote(&opts.subcluster));
    runner
        .exec_vsql(&opts.initiator, SERVER_CONTAINER, &sql)
        .await
        .map(|_| ())
        .map_err(|e| dispatch_error("rebalance_shards", e))
}

pub(crate) async fn vsql_set_config_parameter(
    runner: &dyn PodRunner,
    opts: &SetConfigParameterOptions,
) -> Result<()> {
    let sql = format!(
        "ALTER DATABASE default SET {} = '{}';",
        opts.name,
        sql_quote(&opts.value)
    );
    runner
        .exec_vsql(&opts.initiator, SERVER_CONTAINER, &sql)
        .await
        .map(|_| ())
        .map_err(|e| dispatch_error("set_config_parameter", e))
}

pub(crate) async fn vsql_get_config_parameter(
    runner: &dyn PodRunner,
    initiator: &PodName,
    name: &str,
) -> Result<String> {
    let sql = format!("SHOW DATABASE default {name};");
    let out = runner
        .exec_vsql(initiator, SERVER_CONTAINER, &sql)
        .await
        .map_err(|e| dispatch_error("get_config_parameter", e))?;
    Ok(first_row(&out.stdout)
        .and_then(|cols| cols.get(1).map(|v| v.trim().to_string()))
        .unwrap_or_default())
}

/// Comma-separated IP list for `--hosts`.
pub fn host_list(hosts: &[Host]) -> String {
    hosts
        .iter()
        .map(|h| h.ip.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

/// Escape a value for use inside a single-quoted SQL literal.
pub fn sql_quote(value: &str) -> String {
    value.replace('\'', "''")
}
