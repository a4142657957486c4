//! [`Dispatcher`] for vclusterops deployments.
//!
//! Every operation is a `vcluster <verb>` invocation in the server container
//! of the initiator pod. The CLI talks to the node management agents itself,
//! so only the initiator needs to be reachable.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use super::dispatcher::{
    AddNodeOptions, AddSubclusterOptions, CertBundle, CreateDbOptions, DatabaseTarget,
    Dispatcher, InstallPackagesOptions, InstallPackagesStatus, PromoteSandboxOptions,
    RebalanceShardsOptions, ReIpOptions, RemoveNodeOptions, RemoveSubclusterOptions,
    ReplicateDbOptions, RestartNodeOptions, ReviveDbOptions, RotateHttpsCertsOptions,
    RotateNmaCertsOptions, SandboxSubclusterOptions, SetConfigParameterOptions, StartDbOptions,
    StopDbOptions, UnsandboxSubclusterOptions, host_list, parse_package_report,
    vsql_get_config_parameter, vsql_rebalance_shards, vsql_set_config_parameter,
};
use super::pod_runner::{ExecOutput, PodName, PodRunner};
use crate::controller::error::{Error, Result};
use crate::crd::ClusterScope;
use crate::crd::annotations::{SERVER_CONTAINER, VCLUSTER_BIN};

const RE_IP_FILE: &str = "/tmp/re_ip.json";
const HTTPS_HEALTH_URL: &str = "https://localhost:8443/v1/health";
const CERT_DIR: &str = "/tmp/certs";

pub struct VClusterDispatcher {
    runner: Arc<dyn PodRunner>,
    db: DatabaseTarget,
}

#[derive(Serialize)]
struct ReIpEntry<'a> {
    node_name: &'a str,
    to_address: &'a str,
}

impl VClusterDispatcher {
    pub fn new(runner: Arc<dyn PodRunner>, db: DatabaseTarget) -> Self {
        Self { runner, db }
    }

    /// `vcluster <verb> --db-name <db> [--password <pw>] <args>`
    pub fn command(&self, verb: &str, args: Vec<String>) -> Vec<String> {
        let mut cmd = vec![
            VCLUSTER_BIN.to_string(),
            verb.to_string(),
            "--db-name".to_string(),
            self.db.db_name.clone(),
        ];
        if let Some(pw) = self.db.password.as_ref().filter(|p| !p.is_empty()) {
            cmd.push("--password".to_string());
            cmd.push(pw.clone());
        }
        cmd.extend(args);
        cmd
    }

    async fn vcluster(
        &self,
        verb: &str,
        initiator: &PodName,
        args: Vec<String>,
    ) -> Result<ExecOutput> {
        debug!(initiator = %initiator, verb, "running vcluster");
        let cmd = self.command(verb, args);
        self.runner
            .exec_in_pod(initiator, SERVER_CONTAINER, &cmd)
            .await
            .map_err(|e| Error::Dispatch {
                op: verb.to_string(),
                message: e.to_string(),
            })
    }

    /// Write the PEM files of `bundle` into the initiator and return the
    /// `--key-file/--cert-file/--ca-file` arguments pointing at them.
    async fn upload_bundle(
        &self,
        op: &str,
        initiator: &PodName,
        bundle: &CertBundle,
    ) -> Result<Vec<String>> {
        let mut args = Vec::new();
        for (flag, file, pem) in [
            ("--key-file", "tls.key", &bundle.key),
            ("--cert-file", "tls.crt", &bundle.cert),
            ("--ca-file", "ca.crt", &bundle.ca),
        ] {
            let path = format!("{CERT_DIR}/{op}-{file}");
            let upload = vec![
                "bash".to_string(),
                "-c".to_string(),
                format!("mkdir -p {CERT_DIR} && cat > {path} <<'EOF'\n{pem}\nEOF"),
            ];
            self.runner
                .exec_in_pod(initiator, SERVER_CONTAINER, &upload)
                .await
                .map_err(|e| Error::Dispatch {
                    op: op.to_string(),
                    message: e.to_string(),
                })?;
            args.push(flag.to_string());
            args.push(path);
        }
        Ok(args)
    }
}

fn scope_args(scope: &ClusterScope) -> Vec<String> {
    match scope {
        ClusterScope::MainCluster => Vec::new(),
        ClusterScope::Sandbox(name) => vec!["--sandbox".to_string(), name.clone()],
    }
}

#[async_trait]
impl Dispatcher for VClusterDispatcher {
    async fn create_db(&self, opts: &CreateDbOptions) -> Result<()> {
        let mut args = vec![
            "--hosts".to_string(),
            host_list(&opts.hosts),
            "--catalog-path".to_string(),
            opts.catalog_path.clone(),
            "--data-path".to_string(),
            opts.data_path.clone(),
            "--depot-path".to_string(),
            opts.depot_path.clone(),
            "--communal-storage-location".to_string(),
            opts.communal_path.clone(),
            "--shard-count".to_string(),
            opts.shard_count.to_string(),
        ];
        if opts.skip_package_install {
            args.push("--skip-package-install".to_string());
        }
        self.vcluster("create_db", &opts.initiator, args).await?;
        Ok(())
    }

    async fn revive_db(&self, opts: &ReviveDbOptions) -> Result<()> {
        let args = vec![
            "--hosts".to_string(),
            host_list(&opts.hosts),
            "--communal-storage-location".to_string(),
            opts.communal_path.clone(),
        ];
        self.vcluster("revive_db", &opts.initiator, args).await?;
        Ok(())
    }

    async fn start_db(&self, opts: &StartDbOptions) -> Result<()> {
        let mut args = vec!["--hosts".to_string(), host_list(&opts.hosts)];
        args.extend(scope_args(&opts.scope));
        if opts.timeout_secs > 0 {
            args.push("--timeout".to_string());
            args.push(opts.timeout_secs.to_string());
        }
        self.vcluster("start_db", &opts.initiator, args).await?;
        Ok(())
    }

    async fn stop_db(&self, opts: &StopDbOptions) -> Result<()> {
        self.vcluster("stop_db", &opts.initiator, scope_args(&opts.scope))
            .await?;
        Ok(())
    }

    async fn restart_node(&self, opts: &RestartNodeOptions) -> Result<()> {
        let nodes = opts
            .hosts
            .iter()
            .map(|h| format!("{}={}", h.vnode_name, h.ip))
            .collect::<Vec<_>>()
            .join(",");
        let mut args = vec!["--start".to_string(), nodes];
        if opts.timeout_secs > 0 {
            args.push("--timeout".to_string());
            args.push(opts.timeout_secs.to_string());
        }
        self.vcluster("start_node", &opts.initiator, args).await?;
        Ok(())
    }

    async fn re_ip(&self, opts: &ReIpOptions) -> Result<()> {
        let entries: Vec<ReIpEntry<'_>> = opts
            .hosts
            .iter()
            .filter(|h| !h.vnode_name.is_empty())
            .map(|h| ReIpEntry {
                node_name: &h.vnode_name,
                to_address: &h.ip,
            })
            .collect();
        if entries.is_empty() {
            return Ok(());
        }
        let json = serde_json::to_string(&entries)?;
        let upload = vec![
            "bash".to_string(),
            "-c".to_string(),
            format!("cat > {RE_IP_FILE} <<< '{json}'"),
        ];
        self.runner
            .exec_in_pod(&opts.initiator, SERVER_CONTAINER, &upload)
            .await?;
        let args = vec![
            "--hosts".to_string(),
            host_list(&opts.hosts),
            "--re-ip-file".to_string(),
            RE_IP_FILE.to_string(),
        ];
        self.vcluster("re_ip", &opts.initiator, args).await?;
        Ok(())
    }

    async fn add_node(&self, opts: &AddNodeOptions) -> Result<()> {
        let args = vec![
            "--subcluster".to_string(),
            opts.subcluster.clone(),
            "--new-hosts".to_string(),
            host_list(&opts.hosts),
        ];
        self.vcluster("add_node", &opts.initiator, args).await?;
        Ok(())
    }

    async fn remove_node(&self, opts: &RemoveNodeOptions) -> Result<()> {
        let args = vec!["--remove".to_string(), host_list(&opts.hosts)];
        self.vcluster("remove_node", &opts.initiator, args).await?;
        Ok(())
    }

    async fn add_subcluster(&self, opts: &AddSubclusterOptions) -> Result<()> {
        let mut args = vec!["--subcluster".to_string(), opts.subcluster.clone()];
        if opts.is_primary {
            args.push("--is-primary".to_string());
        }
        self.vcluster("add_subcluster", &opts.initiator, args).await?;
        Ok(())
    }

    async fn remove_subcluster(&self, opts: &RemoveSubclusterOptions) -> Result<()> {
        let args = vec!["--subcluster".to_string(), opts.subcluster.clone()];
        self.vcluster("remove_subcluster", &opts.initiator, args)
            .await?;
        Ok(())
    }

    async fn install_packages(
        &self,
        opts: &InstallPackagesOptions,
    ) -> Result<InstallPackagesStatus> {
        let mut args = Vec::new();
        if opts.force_reinstall {
            args.push("--force-reinstall".to_string());
        }
        let out = self
            .vcluster("install_packages", &opts.initiator, args)
            .await?;
        parse_package_report(&out.stdout)
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

    async fn poll_https(&self, initiator: &PodName) -> Result<()> {
        let cmd = vec![
            "curl".to_string(),
            "-sk".to_string(),
            "-o".to_string(),
            "/dev/null".to_string(),
            "-w".to_string(),
            "%{http_code}".to_string(),
            HTTPS_HEALTH_URL.to_string(),
        ];
        let out = self
            .runner
            .exec_in_pod(initiator, SERVER_CONTAINER, &cmd)
            .await?;
        // Any HTTP answer, even an auth failure, means the service is listening.
        match out.stdout.trim() {
            "" | "000" => Err(Error::Transient(format!(
                "https service on {initiator} is not answering yet"
            ))),
            _ => Ok(()),
        }
    }

    async fn sandbox_subcluster(&self, opts: &SandboxSubclusterOptions) -> Result<()> {
        let args = vec![
            "--subcluster".to_string(),
            opts.subcluster.clone(),
            "--sandbox".to_string(),
            opts.sandbox.clone(),
        ];
        self.vcluster("sandbox_subcluster", &opts.initiator, args)
            .await?;
        Ok(())
    }

    async fn unsandbox_subcluster(&self, opts: &UnsandboxSubclusterOptions) -> Result<()> {
        let args = vec!["--subcluster".to_string(), opts.subcluster.clone()];
        self.vcluster("unsandbox_subcluster", &opts.initiator, args)
            .await?;
        Ok(())
    }

    async fn replicate_db(&self, opts: &ReplicateDbOptions) -> Result<()> {
        let args = vec![
            "--target-hosts".to_string(),
            opts.target_host.clone(),
            "--target-db-name".to_string(),
            self.db.db_name.clone(),
            "--sandbox".to_string(),
            opts.target_sandbox.clone(),
        ];
        self.vcluster("replicate", &opts.initiator, args).await?;
        Ok(())
    }

    async fn promote_sandbox(&self, opts: &PromoteSandboxOptions) -> Result<()> {
        let args = vec!["--sandbox".to_string(), opts.sandbox.clone()];
        self.vcluster("promote_sandbox", &opts.initiator, args)
            .await?;
        Ok(())
    }

    async fn rotate_https_certs(&self, opts: &RotateHttpsCertsOptions) -> Result<()> {
        let mut args = self
            .upload_bundle("rotate_https_certs", &opts.initiator, &opts.bundle)
            .await?;
        args.push("--tls-mode".to_string());
        args.push(opts.tls_mode.clone());
        args.push("--secret-name".to_string());
        args.push(opts.secret_name.clone());
        self.vcluster("rotate_https_certs", &opts.initiator, args)
            .await?;
        Ok(())
    }

    async fn rotate_nma_certs(&self, opts: &RotateNmaCertsOptions) -> Result<()> {
        let mut args = self
            .upload_bundle("rotate_nma_certs", &opts.initiator, &opts.bundle)
            .await?;
        args.push("--hosts".to_string());
        args.push(host_list(&opts.hosts));
        self.vcluster("rotate_nma_certs", &opts.initiator, args)
            .await?;
        Ok(())
    }
}
