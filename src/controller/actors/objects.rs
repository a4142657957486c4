//! Create and update the Kubernetes objects backing a VerticaDB.
//!
//! The headless service, one external service per subcluster service name and
//! one StatefulSet per subcluster. Image changes on existing StatefulSets are
//! left to the upgrade actors; this actor keeps whatever image the template
//! already runs.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use tracing::{debug, info};

use crate::controller::actor::{Actor, ActorContext, Directive, ReconcilePass};
use crate::controller::error::Result;
use crate::controller::finder::{FindFlags, SubclusterFinder};
use crate::crd::annotations::{KUBERNETES_VERSION_ANNOTATION, SUBCLUSTER_NAME_LABEL};
use crate::crd::{ConditionType, InitPolicy, Subcluster};
use crate::resources::services::{generate_external_service, generate_headless_service};
use crate::resources::statefulset::{
    generate_statefulset, replicas, server_image, set_on_delete, set_template_image,
};

/// Digest of the generated object, used to skip no-op updates.
pub(crate) const TEMPLATE_DIGEST_ANNOTATION: &str = "vertica.com/template-digest";
/// Kubernetes API level the operator is built against.
const KUBERNETES_API_VERSION: &str = "v1.32";

/// Which changes the reconciler may make.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjScope {
    /// Only create objects that are missing.
    CreateOnly,
    /// Create, update and remove objects, including scale down.
    All,
}

pub struct ObjReconcilerActor {
    mode: ObjScope,
}

impl ObjReconcilerActor {
    pub fn new(mode: ObjScope) -> Self {
        Self { mode }
    }
}

#[async_trait]
impl Actor for ObjReconcilerActor {
    fn name(&self) -> &'static str {
        match self.mode {
            ObjScope::CreateOnly => "ObjReconciler(CreateOnly)",
            ObjScope::All => "ObjReconciler(All)",
        }
    }

    async fn reconcile(&self, ctx: &ActorContext, pass: &mut ReconcilePass) -> Result<Directive> {
        // Scale down decisions read pod facts.
        if self.mode == ObjScope::All {
            pass.collect(ctx).await?;
        }

        let mut changed = false;
        if pass.pfacts.scope.is_main() {
            let headless = generate_headless_service(&pass.vdb, &pass.config);
            changed |= self.ensure_service(ctx, pass, headless).await?;
        }

        let subclusters: Vec<Subcluster> = pass
            .vdb
            .subclusters_in_scope(&pass.pfacts.scope)
            .into_iter()
            .cloned()
            .collect();
        for sc in &subclusters {
            if !sc.is_transient() {
                let svc = generate_external_service(&pass.vdb, sc);
                changed |= self.ensure_service(ctx, pass, svc).await?;
            }
            if let Some(directive) = self.ensure_statefulset(ctx, pass, sc, &mut changed).await? {
                return Ok(directive);
            }
        }

        if self.mode == ObjScope::All
            && let Some(directive) = self.remove_unused(ctx, pass).await?
        {
            return Ok(directive);
        }

        changed |= self.annotate_pods(ctx, pass).await?;
        if changed {
            pass.pfacts.invalidate();
        }
        Ok(Directive::Continue)
    }
}

impl ObjReconcilerActor {
    /// Create or update a service. Returns true if a write happened.
    async fn ensure_service(
        &self,
        ctx: &ActorContext,
        pass: &ReconcilePass,
        mut desired: Service,
    ) -> Result<bool> {
        let namespace = pass.namespace();
        let name = desired.name_any();
        stamp_digest(&mut desired)?;
        let Some(current) = ctx.state.get_service(&namespace, &name).await? else {
            info!(service = %name, "creating service");
            ctx.state.create_service(&namespace, &desired).await?;
            return Ok(true);
        };
        if self.mode == ObjScope::CreateOnly || digest_of(&current) == digest_of(&desired) {
            return Ok(false);
        }
        // Allocated addresses are immutable.
        if let (Some(want), Some(have)) = (desired.spec.as_mut(), current.spec.as_ref()) {
            if want.cluster_ip.is_none() {
                want.cluster_ip = have.cluster_ip.clone();
                want.cluster_ips = have.cluster_ips.clone();
            }
        }
        desired.metadata.resource_version = current.metadata.resource_version.clone();
        info!(service = %name, "updating service");
        ctx.state.replace_service(&namespace, &desired).await?;
        Ok(true)
    }

    /// Create or update a subcluster's StatefulSet. A directive is returned
    /// when the change has to wait.
    async fn ensure_statefulset(
        &self,
        ctx: &ActorContext,
        pass: &ReconcilePass,
        sc: &Subcluster,
        changed: &mut bool,
    ) -> Result<Option<Directive>> {
        let namespace = pass.namespace();
        let mut desired = generate_statefulset(&pass.vdb, sc, &pass.config);
        let name = desired.name_any();
        let Some(current) = ctx.state.get_statefulset(&namespace, &name).await? else {
            stamp_digest(&mut desired)?;
            info!(statefulset = %name, replicas = replicas(&desired), "creating statefulset");
            ctx.state.create_statefulset(&namespace, &desired).await?;
            *changed = true;
            return Ok(None);
        };
        if self.mode == ObjScope::CreateOnly {
            return Ok(None);
        }

        if pass.vdb.spec.init_policy != InitPolicy::ScheduleOnly
            && let Some(image) = server_image(&current)
        {
            let image = image.to_string();
            set_template_image(&mut desired, &image);
        }
        if pass.vdb.is_condition_true(ConditionType::UpgradeInProgress) {
            set_on_delete(&mut desired);
        }

        let want = replicas(&desired);
        if want < replicas(&current) && !sc.shutdown {
            let busy = pass
                .pfacts
                .in_subcluster(&sc.name)
                .into_iter()
                .any(|p| p.pod_index >= want && (p.is_installed || p.db_exists));
            if busy {
                info!(statefulset = %name, "pods being removed are still part of the database, requeue");
                return Ok(Some(Directive::requeue()));
            }
        }

        stamp_digest(&mut desired)?;
        if digest_of(&current) == digest_of(&desired) {
            return Ok(None);
        }
        // Claim templates cannot change once created.
        if let (Some(want), Some(have)) = (desired.spec.as_mut(), current.spec.as_ref()) {
            want.volume_claim_templates = have.volume_claim_templates.clone();
        }
        desired.metadata.resource_version = current.metadata.resource_version.clone();
        info!(statefulset = %name, replicas = want, "updating statefulset");
        ctx.state.replace_statefulset(&namespace, &desired).await?;
        *changed = true;
        Ok(None)
    }

    /// Delete StatefulSets of subclusters no longer in the spec.
    async fn remove_unused(&self, ctx: &ActorContext, pass: &ReconcilePass) -> Result<Option<Directive>> {
        let namespace = pass.namespace();
        let finder = SubclusterFinder::new(ctx.state.as_ref(), &pass.vdb, pass.pfacts.scope.clone());
        for sts in finder.find_statefulsets(FindFlags::NOT_IN_VDB).await? {
            let sc_name = sts.labels().get(SUBCLUSTER_NAME_LABEL).cloned().unwrap_or_default();
            let still_in_db = pass
                .pfacts
                .in_subcluster(&sc_name)
                .into_iter()
                .any(|p| p.is_installed || p.db_exists);
            if still_in_db {
                info!(subcluster = %sc_name, "subcluster still in the database, requeue");
                return Ok(Some(Directive::requeue()));
            }
            info!(statefulset = %sts.name_any(), "deleting statefulset of removed subcluster");
            ctx.state.delete_statefulset(&namespace, &sts.name_any()).await?;
        }
        Ok(None)
    }

    /// Pods need the Kubernetes version annotation before vertica can start
    /// in them.
    async fn annotate_pods(&self, ctx: &ActorContext, pass: &ReconcilePass) -> Result<bool> {
        let namespace = pass.namespace();
        let finder = SubclusterFinder::new(ctx.state.as_ref(), &pass.vdb, pass.pfacts.scope.clone());
        let mut changed = false;
        for mut pod in finder.find_pods(FindFlags::EXISTING).await? {
            if pod.annotations().contains_key(KUBERNETES_VERSION_ANNOTATION) {
                continue;
            }
            pod.annotations_mut().insert(
                KUBERNETES_VERSION_ANNOTATION.to_string(),
                KUBERNETES_API_VERSION.to_string(),
            );
            debug!(pod = %pod.name_any(), "adding kubernetes version annotation");
            ctx.state.replace_pod(&namespace, &pod).await?;
            changed = true;
        }
        Ok(changed)
    }
}

fn digest_of<K: Resource>(obj: &K) -> Option<&str> {
    obj.meta()
        .annotations
        .as_ref()
        .and_then(|a| a.get(TEMPLATE_DIGEST_ANNOTATION))
        .map(String::as_str)
}

/// Record a digest of the object's labels and spec in its annotations.
fn stamp_digest<K>(obj: &mut K) -> Result<()>
where
    K: Resource + Serialize,
{
    obj.annotations_mut().remove(TEMPLATE_DIGEST_ANNOTATION);
    let json = serde_json::to_string(obj)?;
    let mut hasher = DefaultHasher::new();
    json.hash(&mut hasher);
    let digest = format!("{:016x}", hasher.finish());
    obj.annotations_mut()
        .insert(TEMPLATE_DIGEST_ANNOTATION.to_string(), digest);
    Ok(())
}
