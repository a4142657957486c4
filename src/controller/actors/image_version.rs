//! Record the server version of the running image in annotations.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::controller::actor::{Actor, ActorContext, Directive, ReconcilePass};
use crate::controller::error::{Error, Result};
use crate::controller::events;
use crate::controller::status::update_vdb_with_retry;
use crate::crd::annotations::{SERVER_CONTAINER, VERSION, VERTICA_BIN};
use crate::crd::version::{MINIMUM_VERSION, VersionInfo, parse_version_output};
use crate::podfacts::PodFact;

/// Reads `vertica --version` from a running pod and stores the result.
pub struct ImageVersionActor {
    /// Refuse versions that skip a required release or go backwards.
    enforce_upgrade_path: bool,
}

impl ImageVersionActor {
    pub fn new(enforce_upgrade_path: bool) -> Self {
        Self {
            enforce_upgrade_path,
        }
    }
}

#[async_trait]
impl Actor for ImageVersionActor {
    fn name(&self) -> &'static str {
        "ImageVersion"
    }

    async fn reconcile(&self, ctx: &ActorContext, pass: &mut ReconcilePass) -> Result<Directive> {
        pass.collect(ctx).await?;
        let target = pass.vdb.image_for_scope(&pass.pfacts.scope).to_string();
        // Prefer a pod already on the target image.
        let Some(pod) = pass
            .pfacts
            .find_first_pod_sorted(|p| p.is_pod_running && p.image == target)
            .or_else(|| pass.pfacts.find_running_pod())
            .cloned()
        else {
            info!("no running pod to read the version from, requeue");
            return Ok(Directive::requeue());
        };

        self.verify_image(ctx, pass, &pod).await?;

        let cmd = vec![VERTICA_BIN.to_string(), "--version".to_string()];
        let out = ctx.runner.exec_in_pod(&pod.name, SERVER_CONTAINER, &cmd).await?;
        let found = parse_version_output(&out.stdout);
        let Some(new_version) = found.get(VERSION).cloned() else {
            return Err(Error::Version(format!(
                "could not find a version in the output of vertica --version on {}",
                pod.name
            )));
        };

        if self.enforce_upgrade_path
            && !pass.config.ignore_upgrade_path
            && let Some(current) = pass.config.version.as_ref()
            && let Err(message) = current.is_valid_upgrade_path(&new_version)
        {
            ctx.warning(&pass.vdb, events::INVALID_UPGRADE_PATH, message).await;
            return Ok(Directive::requeue());
        }

        let updated = update_vdb_with_retry(ctx.state.as_ref(), &pass.vdb, |v| {
            v.merge_annotations(&found)
        })
        .await?;
        pass.set_vdb(updated);
        debug!(version = %new_version, "server version recorded");

        let supported = VersionInfo::parse(&new_version).is_some_and(|v| v.is_supported());
        if !supported {
            ctx.warning(
                &pass.vdb,
                events::UNSUPPORTED_VERTICA_VERSION,
                format!(
                    "The Vertica version {new_version} is unsupported with this operator. \
                     The minimum version supported is {MINIMUM_VERSION}."
                ),
            )
            .await;
            return Ok(Directive::requeue());
        }
        Ok(Directive::Continue)
    }
}

impl ImageVersionActor {
    /// The image must match the deployment mode: admintools images ship the
    /// admintools binary, vclusterops images do not.
    async fn verify_image(&self, ctx: &ActorContext, pass: &ReconcilePass, pod: &PodFact) -> Result<()> {
        let vclusterops = pass.config.uses_vclusterops();
        if vclusterops == pod.admintools_exists {
            let (found, wanted) = if vclusterops {
                ("admintools", "vclusterops")
            } else {
                ("vclusterops", "admintools")
            };
            let message = format!(
                "Image '{}' is built for {found} deployments but the database is configured for {wanted}",
                pod.image
            );
            ctx.warning(&pass.vdb, events::WRONG_IMAGE, message.clone()).await;
            return Err(Error::Validation(message));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::client::{FakeDispatcher, FakePodRunner, MemoryClusterState, PodName};
    use crate::controller::events::RecordingEventSink;
    use crate::crd::annotations::{BUILD_REF, VCLUSTER_OPS};
    use crate::crd::{ClusterScope, VerticaDB, VerticaDBSpec};
    use crate::podfacts::PodFacts;

    const OUTPUT: &str = "Vertica Analytic Database v24.2.0-1\n\
        vertica(v24.2.0-1) built by @re-docker2 from master@da8f0e9 on 'Tue Jun  1 05:04:35 2024' $BuildId$\n";

    struct Fixture {
        ctx: ActorContext,
        pass: ReconcilePass,
        runner: Arc<FakePodRunner>,
        events: Arc<RecordingEventSink>,
    }

    async fn fixture(annotations: &[(&str, &str)], admintools_exists: bool) -> Fixture {
        let state = Arc::new(MemoryClusterState::new());
        let runner = Arc::new(FakePodRunner::new());
        let events = Arc::new(RecordingEventSink::new());
        let mut vdb = VerticaDB::new("v", VerticaDBSpec::default());
        vdb.metadata.namespace = Some("ns".into());
        vdb.metadata.annotations = Some(
            annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        let vdb = state.put_vdb(&vdb).await;
        let mut pass = ReconcilePass::new(vdb);
        pass.pfacts = PodFacts::from_facts(
            ClusterScope::MainCluster,
            [PodFact {
                name: PodName::new("ns", "v-sc-0"),
                is_pod_running: true,
                admintools_exists,
                ..Default::default()
            }],
        );
        let ctx = ActorContext {
            state,
            runner: runner.clone(),
            dispatcher: Arc::new(FakeDispatcher::new()),
            events: events.clone(),
            health: None,
        };
        Fixture {
            ctx,
            pass,
            runner,
            events,
        }
    }

    #[tokio::test]
    async fn test_records_version_annotations() {
        let mut f = fixture(&[], false).await;
        f.runner.respond_any("--version", OUTPUT);
        let d = ImageVersionActor::new(false)
            .reconcile(&f.ctx, &mut f.pass)
            .await
            .unwrap();
        assert_eq!(d, Directive::Continue);
        assert_eq!(f.pass.vdb.annotation(VERSION), Some("v24.2.0-1"));
        assert_eq!(f.pass.vdb.annotation(BUILD_REF), Some("da8f0e9"));
        assert!(f.pass.config.version_at_least("v24.2.0"));
    }

    #[tokio::test]
    async fn test_wrong_image_for_deployment_mode() {
        let mut f = fixture(&[(VCLUSTER_OPS, "true")], true).await;
        let err = ImageVersionActor::new(false)
            .reconcile(&f.ctx, &mut f.pass)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(f.events.has_reason(events::WRONG_IMAGE));
        assert!(f.runner.calls_matching("--version").is_empty());
    }

    #[tokio::test]
    async fn test_downgrade_is_refused() {
        let mut f = fixture(&[(VERSION, "v24.3.0-0")], false).await;
        f.runner.respond_any("--version", OUTPUT);
        let d = ImageVersionActor::new(true)
            .reconcile(&f.ctx, &mut f.pass)
            .await
            .unwrap();
        assert_eq!(d, Directive::requeue());
        assert!(f.events.has_reason(events::INVALID_UPGRADE_PATH));
        assert_eq!(f.pass.vdb.annotation(VERSION), Some("v24.3.0-0"));
    }

    #[tokio::test]
    async fn test_old_version_requeues() {
        let mut f = fixture(&[], false).await;
        f.runner.respond_any(
            "--version",
            "Vertica Analytic Database v10.1.1-0\nvertica(v10.1.1-0) built by @re from r@abc on 'x'\n",
        );
        let d = ImageVersionActor::new(false)
            .reconcile(&f.ctx, &mut f.pass)
            .await
            .unwrap();
        assert_eq!(d, Directive::requeue());
        assert!(f.events.has_reason(events::UNSUPPORTED_VERTICA_VERSION));
    }
}
