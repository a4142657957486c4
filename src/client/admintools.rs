//! [`Dispatcher`] that drives `admintools` inside the initiator pod.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info};

use super::dispatcher::{
    AddNodeOptions, AddSubclusterOptions, CreateDbOptions, DatabaseTarget, Dispatcher, Host,
    InstallPackagesOptions, InstallPackagesStatus, PromoteSandboxOptions, RebalanceShardsOptions,
    ReIpOptions, RemoveNodeOptions, RemoveSubclusterOptions, ReplicateDbOptions,
    RestartNodeOptions, ReviveDbOptions, RotateHttpsCertsOptions, RotateNmaCertsOptions,
    SandboxSubclusterOptions, SetConfigParameterOptions, StartDbOptions, StopDbOptions,
    UnsandboxSubclusterOptions, host_list, unsupported, vsql_get_config_parameter,
    vsql_rebalance_shards, vsql_set_config_parameter,
};
use super::pod_runner::{ExecOutput, PodName, PodRunner};
use crate::controller::error::{Error, Result};
use crate::crd::ClusterScope;
use crate::crd::annotations::{ADMINTOOLS_BIN, ADMINTOOLS_CONF, SERVER_CONTAINER};

/// Map file consumed by `admintools -t re_ip`.
pub const RE_IP_MAP_FILE: &str = "/opt/vertica/config/ipMap.txt";

/// `re_ip --force` is accepted from this version on.
const RE_IP_FORCE_VERSION: &str = "v11.1.0";

static AT_CONF_NODE_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(node\d{4}) = ([\d.:a-fA-F]+),").ok());

static INSTALLING_PACKAGE_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"Installing package (\S+?)\.*$").ok());

pub struct AdmintoolsDispatcher {
    runner: Arc<dyn PodRunner>,
    db: DatabaseTarget,
}

impl AdmintoolsDispatcher {
    pub fn new(runner: Arc<dyn PodRunner>, db: DatabaseTarget) -> Self {
        Self { runner, db }
    }

    async fn admintools(
        &self,
        op: &str,
        initiator: &PodName,
        args: Vec<String>,
    ) -> Result<ExecOutput> {
        let mut cmd = vec![ADMINTOOLS_BIN.to_string(), "-t".to_string(), op.to_string()];
        cmd.extend(args);
        debug!(initiator = %initiator, op, "running admintools");
        self.runner
            .exec_in_pod(initiator, SERVER_CONTAINER, &cmd)
            .await
            .map_err(|e| Error::Dispatch {
                op: op.to_string(),
                message: e.to_string(),
            })
    }

    fn db_arg(&self) -> String {
        format!("--database={}", self.db.db_name)
    }

    fn password_args(&self) -> Vec<String> {
        match &self.db.password {
            Some(pw) if !pw.is_empty() => vec!["--password".to_string(), pw.clone()],
            _ => Vec::new(),
        }
    }

    fn require_main_cluster(op: &str, scope: &ClusterScope) -> Result<()> {
        match scope {
            ClusterScope::MainCluster => Ok(()),
            ClusterScope::Sandbox(name) => Err(Error::Dispatch {
                op: op.to_string(),
                message: format!("sandbox {name} cannot be managed with admintools"),
            }),
        }
    }

    async fn old_ips(&self, initiator: &PodName) -> Result<BTreeMap<String, String>> {
        let cmd = vec![
            "bash".to_string(),
            "-c".to_string(),
            format!("grep --regexp='^node[0-9]' {ADMINTOOLS_CONF}"),
        ];
        let out = self
            .runner
            .exec_in_pod(initiator, SERVER_CONTAINER, &cmd)
            .await?;
        Ok(parse_admintools_conf_nodes(&out.stdout))
    }
}

/// Node name to IP, from the `node0001 = ip,...` lines of admintools.conf.
pub fn parse_admintools_conf_nodes(text: &str) -> BTreeMap<String, String> {
    let Some(re) = AT_CONF_NODE_RE.as_ref() else {
        return BTreeMap::new();
    };
    text.lines()
        .filter_map(|line| {
            let caps = re.captures(line)?;
            Some((caps.get(1)?.as_str().to_string(), caps.get(2)?.as_str().to_string()))
        })
        .collect()
}

/// Lines for the re_ip map file, plus whether any address actually changes.
///
/// Hosts whose node is absent from admintools.conf are skipped: re_ip accepts a
/// subset of the nodes.
pub fn re_ip_map(old_ips: &BTreeMap<String, String>, hosts: &[Host]) -> (Vec<String>, bool) {
    let mut lines = Vec::new();
    let mut changing = false;
    for host in hosts {
        let Some(node) = compat21_node_name(&host.vnode_name) else {
            continue;
        };
        let Some(old_ip) = old_ips.get(&node) else {
            continue;
        };
        changing |= *old_ip != host.ip;
        lines.push(format!("{old_ip} {}", host.ip));
    }
    (lines, changing)
}

/// admintools.conf keys nodes as `node0001`; vnode names end in that suffix.
fn compat21_node_name(vnode_name: &str) -> Option<String> {
    vnode_name
        .rfind("node")
        .and_then(|i| vnode_name.get(i..))
        .map(str::to_string)
}

/// Packages that failed, from the text printed by `admintools -t install_package`.
pub fn parse_install_package_output(output: &str) -> InstallPackagesStatus {
    let mut failed = Vec::new();
    let mut current = String::new();
    for line in output.lines().map(str::trim) {
        if let Some(name) = INSTALLING_PACKAGE_RE
            .as_ref()
            .and_then(|re| re.captures(line))
            .and_then(|c| c.get(1))
        {
            current = name.as_str().to_string();
        } else if line.contains("Failed") && !current.is_empty() {
            failed.push((current.clone(), line.to_string()));
        }
    }
    InstallPackagesStatus { failed }
}

#[async_trait]
impl Dispatcher for AdmintoolsDispatcher {
    async fn create_db(&self, opts: &CreateDbOptions) -> Result<()> {
        let mut args = vec![
            "--skip-fs-checks".to_string(),
            format!("--hosts={}", host_list(&opts.hosts)),
            format!("--catalog_path={}", opts.catalog_path),
            format!("--data_path={}", opts.data_path),
            format!("--depot_path={}", opts.depot_path),
            format!("--communal_storage_location={}", opts.communal_path),
            format!("--shard_count={}", opts.shard_count),
            self.db_arg(),
            "--noprompt".to_string(),
        ];
        if opts.skip_package_install {
            args.push("--skip-package-install".to_string());
        }
        args.extend(self.password_args());
        self.admintools("create_db", &opts.initiator, args).await?;
        info!(db = %self.db.db_name, "database created");
        Ok(())
    }

    async fn revive_db(&self, opts: &ReviveDbOptions) -> Result<()> {
        let args = vec![
            format!("--hosts={}", host_list(&opts.hosts)),
            format!("--communal-storage-location={}", opts.communal_path),
            self.db_arg(),
            "--force".to_string(),
        ];
        self.admintools("revive_db", &opts.initiator, args).await?;
        Ok(())
    }

    async fn start_db(&self, opts: &StartDbOptions) -> Result<()> {
        Self::require_main_cluster("start_db", &opts.scope)?;
        let mut args = vec![self.db_arg(), "--noprompt".to_string()];
        if opts.timeout_secs > 0 {
            args.push(format!("--timeout={}", opts.timeout_secs));
        }
        args.extend(self.password_args());
        self.admintools("start_db", &opts.initiator, args).await?;
        Ok(())
    }

    async fn stop_db(&self, opts: &StopDbOptions) -> Result<()> {
        Self::require_main_cluster("stop_db", &opts.scope)?;
        let mut args = vec!["-F".to_string(), self.db_arg()];
        args.extend(self.password_args());
        self.admintools("stop_db", &opts.initiator, args).await?;
        Ok(())
    }

    async fn restart_node(&self, opts: &RestartNodeOptions) -> Result<()> {
        let mut args = vec![
            self.db_arg(),
            format!("--hosts={}", host_list(&opts.hosts)),
            "--noprompt".to_string(),
        ];
        if opts.timeout_secs > 0 {
            args.push(format!("--timeout={}", opts.timeout_secs));
        }
        args.extend(self.password_args());
        self.admintools("restart_node", &opts.initiator, args).await?;
        Ok(())
    }

    async fn re_ip(&self, opts: &ReIpOptions) -> Result<()> {
        if opts.hosts.is_empty() {
            return Err(Error::Dispatch {
                op: "re_ip".to_string(),
                message: "at least one host is required".to_string(),
            });
        }
        let old_ips = self.old_ips(&opts.initiator).await?;
        let (lines, changing) = re_ip_map(&old_ips, &opts.hosts);
        if !changing {
            debug!("no address changes, skipping re_ip");
            return Ok(());
        }
        let upload = vec![
            "bash".to_string(),
            "-c".to_string(),
            format!("cat > {RE_IP_MAP_FILE} <<< '{}'", lines.join("\n")),
        ];
        self.runner
            .exec_in_pod(&opts.initiator, SERVER_CONTAINER, &upload)
            .await?;

        let mut args = vec![format!("--file={RE_IP_MAP_FILE}"), "--noprompt".to_string()];
        if self
            .db
            .version
            .as_ref()
            .is_some_and(|v| v.is_equal_or_newer(RE_IP_FORCE_VERSION))
        {
            args.push("--force".to_string());
        }
        self.admintools("re_ip", &opts.initiator, args).await?;
        Ok(())
    }

    async fn add_node(&self, opts: &AddNodeOptions) -> Result<()> {
        let mut args = vec![
            format!("--hosts={}", host_list(&opts.hosts)),
            self.db_arg(),
            format!("--subcluster={}", opts.subcluster),
            "--noprompt".to_string(),
        ];
        args.extend(self.password_args());
        self.admintools("db_add_node", &opts.initiator, args).await?;
        Ok(())
    }

    async fn remove_node(&self, opts: &RemoveNodeOptions) -> Result<()> {
        let mut args = vec![
            self.db_arg(),
            format!("--hosts={}", host_list(&opts.hosts)),
            "--noprompt".to_string(),
        ];
        args.extend(self.password_args());
        self.admintools("db_remove_node", &opts.initiator, args).await?;
        Ok(())
    }

    async fn add_subcluster(&self, opts: &AddSubclusterOptions) -> Result<()> {
        let mut args = vec![self.db_arg(), format!("--subcluster={}", opts.subcluster)];
        if !opts.is_primary {
            args.push("--is-secondary".to_string());
        }
        args.extend(self.password_args());
        self.admintools("db_add_subcluster", &opts.initiator, args)
            .await?;
        Ok(())
    }

    async fn remove_subcluster(&self, opts: &RemoveSubclusterOptions) -> Result<()> {
        let mut args = vec![
            self.db_arg(),
            format!("--subcluster={}", opts.subcluster),
            "--noprompt".to_string(),
        ];
        args.extend(self.password_args());
        self.admintools("db_remove_subcluster", &opts.initiator, args)
            .await?;
        Ok(())
    }

    async fn install_packages(
        &self,
        opts: &InstallPackagesOptions,
    ) -> Result<InstallPackagesStatus> {
        let mut args = vec![
            format!("--dbname={}", self.db.db_name),
            "--package".to_string(),
            "default".to_string(),
        ];
        if opts.force_reinstall {
            args.push("--force-reinstall".to_string());
        }
        args.extend(self.password_args());
        let out = self
            .admintools("install_package", &opts.initiator, args)
            .await?;
        Ok(parse_install_package_output(&out.stdout))
    }

    async fn rebalance_shards(&self, opts: &RebalanceShardsOptions) -> Result<()> {
        vsql_rebalance_shards(self.runner.as_ref(), opts).await
    }

    async fn set_config_parameter(&self, opts: &SetConfigParameterOptions) -> Result<()> {
        vsql_set_config_parameter(self.runner.as_ref(), opts).await
    }

    async fn get_config_parameter(&self, initiator: &PodName, name: &str) -> Result<String> {
        vsql_get_config_parameter(self.runner.as_ref(), initiator, name).await
    }

    async fn poll_https(&self, _initiator: &PodName) -> Result<()> {
        // No HTTPS service to wait for in admintools deployments.
        Ok(())
    }

    async fn sandbox_subcluster(&self, _opts: &SandboxSubclusterOptions) -> Result<()> {
        Err(unsupported("sandbox_subcluster"))
    }

    async fn unsandbox_subcluster(&self, _opts: &UnsandboxSubclusterOptions) -> Result<()> {
        Err(unsupported("unsandbox_subcluster"))
    }

    async fn replicate_db(&self, _opts: &ReplicateDbOptions) -> Result<()> {
        Err(unsupported("replicate_db"))
    }

    async fn promote_sandbox(&self, _opts: &PromoteSandboxOptions) -> Result<()> {
        Err(unsupported("promote_sandbox"))
    }

    async fn rotate_https_certs(&self, _opts: &RotateHttpsCertsOptions) -> Result<()> {
        Err(unsupported("rotate_https_certs"))
    }

    async fn rotate_nma_certs(&self, _opts: &RotateNmaCertsOptions) -> Result<()> {
        Err(unsupported("rotate_nma_certs"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_admintools_conf_nodes() {
        let text = "node0001 = 10.1.1.1,/data,/data\nnode0002 = 10.1.1.2,/data,/data\nother = x\n";
        let ips = parse_admintools_conf_nodes(text);
        assert_eq!(ips.len(), 2);
        assert_eq!(ips["node0002"], "10.1.1.2");
    }

    #[test]
    fn test_re_ip_map() {
        let mut old = BTreeMap::new();
        old.insert("node0001".to_string(), "10.0.0.1".to_string());
        old.insert("node0002".to_string(), "10.0.0.2".to_string());
        let host = |vnode: &str, ip: &str| Host {
            pod: PodName::new("ns", "p"),
            ip: ip.to_string(),
            vnode_name: vnode.to_string(),
        };

        let (lines, changing) = re_ip_map(&old, &[host("v_db_node0001", "10.0.0.1")]);
        assert_eq!(lines, vec!["10.0.0.1 10.0.0.1"]);
        assert!(!changing);

        let (lines, changing) = re_ip_map(
            &old,
            &[
                host("v_db_node0002", "10.0.0.9"),
                host("v_db_node0003", "10.0.0.3"),
            ],
        );
        assert_eq!(lines, vec!["10.0.0.2 10.0.0.9"]);
        assert!(changing);
    }

    #[test]
    fn test_parse_install_package_output() {
        let out = "Installing package ParquetExport...\n...Success!\n\
                   Installing package TFIntegration...\n...Failed: missing library\n";
        let status = parse_install_package_output(out);
        assert_eq!(status.failed.len(), 1);
        assert_eq!(status.failed[0].0, "TFIntegration");
    }
}
