//! Install the default packages shipped with the server image.
//!
//! Runs once per server version: the version the packages were last
//! installed for is kept in an annotation.

use std::collections::BTreeMap;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::client::dispatcher::InstallPackagesOptions;
use crate::controller::actor::{Actor, ActorContext, Directive, ReconcilePass};
use crate::controller::error::{Error, Result};
use crate::controller::events;
use crate::controller::status::update_vdb_with_retry;
use crate::crd::InitPolicy;
use crate::crd::annotations::{PACKAGES_INSTALLED_VERSION, VERSION};

pub struct InstallPackagesActor;

#[async_trait]
impl Actor for InstallPackagesActor {
    fn name(&self) -> &'static str {
        "InstallPackages"
    }

    async fn reconcile(&self, ctx: &ActorContext, pass: &mut ReconcilePass) -> Result<Directive> {
        if pass.vdb.spec.init_policy == InitPolicy::CreateSkipPackageInstall {
            return Ok(Directive::Continue);
        }
        let Some(version) = pass.vdb.annotation(VERSION).map(str::to_string) else {
            debug!("server version not known yet, skipping package install");
            return Ok(Directive::Continue);
        };
        if pass.vdb.annotation(PACKAGES_INSTALLED_VERSION) == Some(version.as_str()) {
            return Ok(Directive::Continue);
        }

        pass.collect(ctx).await?;
        if !pass.pfacts.does_db_exist() {
            return Ok(Directive::Continue);
        }
        if pass.pfacts.up_node_count() == 0 {
            info!("no up node to install packages from, requeue");
            return Ok(Directive::requeue());
        }
        let Some(initiator) = pass.pfacts.find_pod_to_run_admin_cmd_any() else {
            return Ok(Directive::requeue());
        };
        let opts = InstallPackagesOptions {
            initiator: initiator.name.clone(),
            force_reinstall: true,
        };

        ctx.normal(&pass.vdb, events::INSTALL_PACKAGES_STARTED, "Starting install packages")
            .await;
        let start = Instant::now();
        let status = match ctx.dispatcher.install_packages(&opts).await {
            Ok(status) => status,
            Err(e @ Error::Dispatch { .. }) => {
                ctx.warning(&pass.vdb, events::INSTALL_PACKAGES_FAILED, e.to_string())
                    .await;
                return Ok(Directive::requeue());
            }
            Err(e) => return Err(e),
        };
        ctx.normal(
            &pass.vdb,
            events::INSTALL_PACKAGES_FINISHED,
            format!(
                "Packages installation finished. It took {}s. Number of packages failed: {}.",
                start.elapsed().as_secs(),
                status.failed.len()
            ),
        )
        .await;
        if !status.failed.is_empty() {
            for (package, reason) in &status.failed {
                warn!(package = %package, reason = %reason, "package failed to install");
            }
            ctx.warning(
                &pass.vdb,
                events::INSTALL_PACKAGES_FAILED,
                format!("{} packages failed to install", status.failed.len()),
            )
            .await;
            return Ok(Directive::requeue());
        }

        let new: BTreeMap<String, String> =
            [(PACKAGES_INSTALLED_VERSION.to_string(), version)].into();
        let updated =
            update_vdb_with_retry(ctx.state.as_ref(), &pass.vdb, |v| v.merge_annotations(&new))
                .await?;
        pass.set_vdb(updated);
        Ok(Directive::Continue)
    }
}
