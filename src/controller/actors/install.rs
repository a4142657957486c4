//! Install vertica into pods, and remove it from pods being scaled away.
//!
//! Only admintools deployments have an install step. It writes the pod into
//! `admintools.conf` on every host and drops an indicator file so a later
//! pass can tell our install from a config left behind by an earlier pod.
//! With vclusterops every running pod counts as installed.

use async_trait::async_trait;
use tracing::info;

use crate::controller::actor::{Actor, ActorContext, Directive, ReconcilePass};
use crate::controller::error::Result;
use crate::crd::annotations::{ADMINTOOLS_CONF, SERVER_CONTAINER};
use crate::podfacts::gather::{
    CONFIG_LICENSING_PATH, CONFIG_LOGROTATE_PATH, CONFIG_SHARE_PATH, EULA_ACCEPTANCE_FILE,
};
use crate::podfacts::PodFact;

const INSTALL_VERTICA: &str = "/opt/vertica/sbin/install_vertica";
const UPDATE_VERTICA: &str = "/opt/vertica/sbin/update_vertica";

fn bash(script: String) -> Vec<String> {
    vec!["bash".to_string(), "-c".to_string(), script]
}

fn ip_list(pods: &[PodFact]) -> String {
    pods.iter()
        .map(|p| p.pod_ip.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

/// Flags shared by the install and update scripts.
fn install_flags(pass: &ReconcilePass) -> String {
    format!(
        "--no-system-configuration --no-package-checks --point-to-point --dba-user {} \
         --data-dir {} --failure-threshold NONE --ignore-install-config",
        pass.config.superuser, pass.vdb.spec.local.data_path
    )
}

// ============================================================================
// Install
// ============================================================================

pub struct InstallActor;

#[async_trait]
impl Actor for InstallActor {
    fn name(&self) -> &'static str {
        "Install"
    }

    async fn reconcile(&self, ctx: &ActorContext, pass: &mut ReconcilePass) -> Result<Directive> {
        if pass.config.uses_vclusterops() {
            return Ok(Directive::Continue);
        }
        pass.collect(ctx).await?;

        let mut touched = false;
        touched |= remove_stale_configs(ctx, pass).await?;
        touched |= prepare_config_dirs(ctx, pass).await?;
        if touched {
            pass.pfacts.invalidate();
            pass.collect(ctx).await?;
        }

        let to_install: Vec<PodFact> = pass
            .pfacts
            .filter_pods(|p| p.is_pod_running && !p.is_installed && !p.is_pending_delete)
            .into_iter()
            .cloned()
            .collect();
        if to_install.is_empty() {
            return Ok(Directive::Continue);
        }
        if to_install.iter().any(|p| p.pod_ip.is_empty()) {
            info!("pods to install have no IP yet, requeue");
            return Ok(Directive::requeue());
        }

        let installed = pass
            .pfacts
            .find_first_pod_sorted(|p| p.is_pod_running && p.is_installed)
            .cloned();
        let hosts = ip_list(&to_install);
        let (initiator, script) = match &installed {
            Some(pod) => (
                pod.name.clone(),
                format!("sudo {UPDATE_VERTICA} --add-hosts {hosts} {}", install_flags(pass)),
            ),
            None => {
                let Some(first) = to_install.first() else {
                    return Ok(Directive::Continue);
                };
                (
                    first.name.clone(),
                    format!("sudo {INSTALL_VERTICA} --hosts {hosts} {}", install_flags(pass)),
                )
            }
        };
        info!(hosts = %hosts, initiator = %initiator, "installing vertica");
        ctx.runner
            .exec_in_pod(&initiator, SERVER_CONTAINER, &bash(script))
            .await?;

        let indicator = pass.vdb.installer_indicator_file();
        for pod in &to_install {
            let script = format!("mkdir -p $(dirname {indicator}) && touch {indicator}");
            ctx.runner
                .exec_in_pod(&pod.name, SERVER_CONTAINER, &bash(script))
                .await?;
        }
        pass.pfacts.invalidate();
        Ok(Directive::Continue)
    }
}

/// Remove admintools.conf from pods that were not installed by us.
async fn remove_stale_configs(ctx: &ActorContext, pass: &ReconcilePass) -> Result<bool> {
    let stale = pass
        .pfacts
        .filter_pods(|p| p.is_pod_running && p.has_stale_admintools_conf);
    for pod in &stale {
        info!(pod = %pod.name, "removing stale admintools.conf");
        ctx.runner
            .exec_in_pod(
                &pod.name,
                SERVER_CONTAINER,
                &bash(format!("rm -f {ADMINTOOLS_CONF}")),
            )
            .await?;
    }
    Ok(!stale.is_empty())
}

/// Accept the EULA and create the config directories vertica expects.
async fn prepare_config_dirs(ctx: &ActorContext, pass: &ReconcilePass) -> Result<bool> {
    let mut touched = false;
    for pod in pass.pfacts.filter_pods(|p| p.is_pod_running && !p.is_installed) {
        let mut steps = Vec::new();
        if !pod.eula_accepted {
            steps.push(format!(
                "mkdir -p $(dirname {EULA_ACCEPTANCE_FILE}) && touch {EULA_ACCEPTANCE_FILE}"
            ));
        }
        for dir in [CONFIG_LOGROTATE_PATH, CONFIG_SHARE_PATH, CONFIG_LICENSING_PATH] {
            if !pod.dir_exists.get(dir).copied().unwrap_or(false) {
                steps.push(format!("mkdir -p {dir}"));
            }
        }
        if steps.is_empty() {
            continue;
        }
        ctx.runner
            .exec_in_pod(&pod.name, SERVER_CONTAINER, &bash(steps.join(" && ")))
            .await?;
        touched = true;
    }
    Ok(touched)
}

// ============================================================================
// Uninstall
// ============================================================================

/// Removes pods beyond the subcluster size from the admintools config once
/// their nodes have left the database.
pub struct UninstallActor;

#[async_trait]
impl Actor for UninstallActor {
    fn name(&self) -> &'static str {
        "Uninstall"
    }

    async fn reconcile(&self, ctx: &ActorContext, pass: &mut ReconcilePass) -> Result<Directive> {
        if pass.config.uses_vclusterops() {
            return Ok(Directive::Continue);
        }
        pass.collect(ctx).await?;

        let pending: Vec<PodFact> = pass
            .pfacts
            .filter_pods(|p| p.is_pending_delete && p.is_installed)
            .into_iter()
            .cloned()
            .collect();
        if pending.is_empty() {
            return Ok(Directive::Continue);
        }
        if pending.iter().any(|p| p.db_exists) {
            info!("nodes are still in the database, requeue");
            return Ok(Directive::requeue());
        }
        if pending.iter().any(|p| !p.is_pod_running || p.pod_ip.is_empty()) {
            info!("pods to uninstall are not running, requeue");
            return Ok(Directive::requeue());
        }

        if let Some(initiator) = pass
            .pfacts
            .find_first_pod_sorted(|p| p.is_pod_running && p.is_installed && !p.is_pending_delete)
        {
            let hosts = ip_list(&pending);
            info!(hosts = %hosts, "uninstalling vertica");
            let script = format!(
                "sudo {UPDATE_VERTICA} --remove-hosts {hosts} {}",
                install_flags(pass)
            );
            ctx.runner
                .exec_in_pod(&initiator.name, SERVER_CONTAINER, &bash(script))
                .await?;
        }

        let indicator = pass.vdb.installer_indicator_file();
        for pod in &pending {
            ctx.runner
                .exec_in_pod(
                    &pod.name,
                    SERVER_CONTAINER,
                    &bash(format!("rm -f {indicator} {ADMINTOOLS_CONF}")),
                )
                .await?;
        }
        pass.pfacts.invalidate();
        Ok(Directive::Continue)
    }
}
