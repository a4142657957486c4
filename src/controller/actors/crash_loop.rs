//! Report pods whose server container keeps crashing.
//!
//! A crash loop usually means the image or the pod template is wrong, which
//! nothing later in the pass can fix. The warning event carries a command to
//! inspect the last crash. Detection is best effort: every failure here is
//! logged and the pass goes on.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, warn};

use crate::controller::actor::{Actor, ActorContext, Directive, ReconcilePass};
use crate::controller::error::Result;
use crate::controller::events;
use crate::controller::finder::{FindFlags, SubclusterFinder};
use crate::crd::annotations::SERVER_CONTAINER;

const CRASH_LOOP_REASON: &str = "CrashLoopBackOff";

/// Restart count of the server container when it is waiting in a crash loop.
fn crash_looping(pod: &Pod) -> Option<i32> {
    let status = pod
        .status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find(|c| c.name == SERVER_CONTAINER)?;
    let waiting = status.state.as_ref()?.waiting.as_ref()?;
    (waiting.reason.as_deref() == Some(CRASH_LOOP_REASON)).then_some(status.restart_count)
}

fn logs_hint(namespace: &str, pod: &str) -> String {
    format!("kubectl logs -n {namespace} {pod} -c {SERVER_CONTAINER} --previous")
}

pub struct CrashLoopActor;

#[async_trait]
impl Actor for CrashLoopActor {
    fn name(&self) -> &'static str {
        "CrashLoop"
    }

    async fn reconcile(&self, ctx: &ActorContext, pass: &mut ReconcilePass) -> Result<Directive> {
        if let Err(e) = self.detect(ctx, pass).await {
            debug!(error = %e, "crash loop detection failed");
        }
        Ok(Directive::Continue)
    }
}

impl CrashLoopActor {
    async fn detect(&self, ctx: &ActorContext, pass: &ReconcilePass) -> Result<()> {
        let finder = SubclusterFinder::new(ctx.state.as_ref(), &pass.vdb, pass.pfacts.scope.clone());
        let namespace = pass.namespace();
        for pod in finder.find_pods(FindFlags::EXISTING).await? {
            let Some(restarts) = crash_looping(&pod) else {
                continue;
            };
            let name = pod.name_any();
            warn!(pod = %name, restarts, "server container is in a crash loop");
            ctx.warning(
                &pass.vdb,
                events::CRASH_LOOP_DETECTED,
                format!(
                    "Pod '{name}' is in {CRASH_LOOP_REASON} after {restarts} restarts. \
                     Inspect the last crash with: {}",
                    logs_hint(&namespace, &name)
                ),
            )
            .await;
        }
        Ok(())
    }
}
