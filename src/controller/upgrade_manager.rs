//! Image change machinery shared by the upgrade actors.
//!
//! An upgrade is a long-running operation spread over many reconcile passes.
//! Nothing about its progress is kept in memory: whether it is in progress
//! comes from a status condition, and which step it reached comes from the
//! `upgradeStatus` message. [`UpgradeManager`] is rebuilt every pass and
//! resumes from those.
//!
//! ## Strategies
//!
//! | Strategy | Condition | Selected when |
//! |----------|-----------|---------------|
//! | Offline | `OfflineUpgradeInProgress` | policy Offline, k-safety 0, or an old server |
//! | ReadOnlyOnline | `ReadOnlyOnlineUpgradeInProgress` | server >= 11.1.0 |
//! | Replicated | `OnlineUpgradeInProgress` | vclusterops server >= 24.3.0-2 |
//!
//! Sandboxes only ever upgrade offline. Their progress lives in the sandbox's
//! entry of `status.sandboxes` instead of the conditions.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::info;

use super::actor::{ActorContext, Directive, ReconcilePass};
use super::config::PassConfig;
use super::error::{Error, Result};
use super::events;
use super::finder::{FindFlags, SubclusterFinder};
use super::status::{set_condition, set_upgrade_status, update_vdb_status_with_retry, update_vdb_with_retry};
use crate::crd::annotations::{
    SERVER_CONTAINER, SUBCLUSTER_NAME_LABEL, SUBCLUSTER_TRANSIENT_LABEL, SUBCLUSTER_TYPE_LABEL,
    VERSION,
};
use crate::crd::version::{NMA_IN_SIDECAR_MIN_VERSION, ONLINE_UPGRADE_VERSION, READ_ONLY_ONLINE_UPGRADE_VERSION};
use crate::crd::{
    ClusterScope, Condition, ConditionType, InitPolicy, SubclusterType, UpgradePolicy, VerticaDB,
};
use crate::resources::statefulset::{server_image, set_on_delete, set_template_image};

/// Reason recorded on the upgrade conditions.
const UPGRADE_REASON: &str = "UpgradeStarted";
const UPGRADE_DONE_REASON: &str = "UpgradeFinished";

/// Container error reported when the pod template no longer fits the image.
const CREATE_CONTAINER_ERROR: &str = "CreateContainerError";

/// How an image change is rolled out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpgradeStrategy {
    /// Stop the whole database, swap images, start it again.
    Offline,
    /// Primaries restart while secondaries serve read-only queries.
    ReadOnlyOnline,
    /// A copy of the cluster is upgraded in a sandbox, loaded by
    /// replication and promoted, so the database stays writable.
    Replicated,
}

impl UpgradeStrategy {
    /// Pick the strategy for the resource as it stands now.
    pub fn select(vdb: &VerticaDB, cfg: &PassConfig) -> Self {
        let policy = vdb.spec.upgrade_policy;
        if policy == UpgradePolicy::Offline {
            return UpgradeStrategy::Offline;
        }
        if policy == UpgradePolicy::Auto
            && (cfg.k_safety == 0
                || (vdb.requires_transient_subcluster() && vdb.spec.license_secret.is_none()))
        {
            return UpgradeStrategy::Offline;
        }
        if cfg.version.is_none() {
            return UpgradeStrategy::Offline;
        }
        if matches!(policy, UpgradePolicy::Online | UpgradePolicy::Auto)
            && cfg.uses_vclusterops()
            && cfg.version_at_least(ONLINE_UPGRADE_VERSION)
        {
            return UpgradeStrategy::Replicated;
        }
        if cfg.version_at_least(READ_ONLY_ONLINE_UPGRADE_VERSION) {
            return UpgradeStrategy::ReadOnlyOnline;
        }
        UpgradeStrategy::Offline
    }

    /// Like [`UpgradeStrategy::select`] but for one scope of the resource.
    pub fn select_for_scope(vdb: &VerticaDB, cfg: &PassConfig, scope: &ClusterScope) -> Self {
        if scope.is_main() {
            Self::select(vdb, cfg)
        } else {
            UpgradeStrategy::Offline
        }
    }

    /// Status condition that marks this strategy in progress.
    pub fn condition(self) -> ConditionType {
        match self {
            UpgradeStrategy::Offline => ConditionType::OfflineUpgradeInProgress,
            UpgradeStrategy::ReadOnlyOnline => ConditionType::ReadOnlyOnlineUpgradeInProgress,
            UpgradeStrategy::Replicated => ConditionType::OnlineUpgradeInProgress,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UpgradeStrategy::Offline => "offline",
            UpgradeStrategy::ReadOnlyOnline => "read-only online",
            UpgradeStrategy::Replicated => "replicated",
        }
    }
}

/// Which StatefulSets an image change applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StsSelector<'a> {
    /// Every StatefulSet except the transient subcluster's.
    NonTransient,
    Primaries,
    Subcluster(&'a str),
}

impl StsSelector<'_> {
    fn matches(&self, sts: &StatefulSet) -> bool {
        let labels = sts.labels();
        if labels.get(SUBCLUSTER_TRANSIENT_LABEL).map(String::as_str) == Some("true") {
            return false;
        }
        match self {
            StsSelector::NonTransient => true,
            StsSelector::Primaries => labels
                .get(SUBCLUSTER_TYPE_LABEL)
                .is_some_and(|t| *t == SubclusterType::Primary.to_string()),
            StsSelector::Subcluster(name) => labels
                .get(SUBCLUSTER_NAME_LABEL)
                .is_some_and(|n| n == name),
        }
    }
}

/// Compute the message to post for step `idx` given the current status.
///
/// Step 0 is only posted when no step was posted yet. Later steps are posted
/// when the current message belongs to an earlier step. Anything else means
/// the step was already posted (or a later one was) and nothing changes.
pub fn next_status_msg<'a>(current: &str, msgs: &[&'a str], idx: usize) -> Result<Option<&'a str>> {
    let Some(msg) = msgs.get(idx).copied() else {
        return Err(Error::Permanent(format!(
            "upgrade status message index {idx} out of range ({} messages)",
            msgs.len()
        )));
    };
    if idx == 0 {
        return Ok(current.is_empty().then_some(msg));
    }
    let earlier = msgs.get(..idx).unwrap_or_default();
    Ok(earlier.iter().any(|m| *m == current).then_some(msg))
}

/// State of one upgrade strategy for one reconcile pass.
#[derive(Clone, Debug)]
pub struct UpgradeManager {
    strategy: UpgradeStrategy,
    continuing: bool,
    primary_images: Vec<String>,
}

impl UpgradeManager {
    pub fn new(strategy: UpgradeStrategy) -> Self {
        Self {
            strategy,
            continuing: false,
            primary_images: Vec::new(),
        }
    }

    pub fn with_primary_images(mut self, images: Vec<String>) -> Self {
        self.primary_images = images;
        self
    }

    pub fn strategy(&self) -> UpgradeStrategy {
        self.strategy
    }

    /// The upgrade was started by an earlier pass.
    pub fn is_continuing(&self) -> bool {
        self.continuing
    }

    pub fn primary_images(&self) -> &[String] {
        &self.primary_images
    }

    /// Decide whether this strategy has work to do.
    pub async fn is_upgrade_needed(
        &mut self,
        ctx: &ActorContext,
        pass: &ReconcilePass,
    ) -> Result<bool> {
        let vdb = &pass.vdb;
        let scope = &pass.pfacts.scope;
        if vdb.spec.init_policy == InitPolicy::ScheduleOnly {
            return Ok(false);
        }
        if self.marked_in_progress(vdb, scope) {
            self.continuing = true;
            return Ok(true);
        }
        match scope.sandbox_name() {
            // Another strategy owns the running upgrade.
            None if vdb.is_condition_true(ConditionType::UpgradeInProgress) => return Ok(false),
            // Not sandboxed in the database yet.
            Some(sb) if vdb.find_sandbox_status(sb).is_none() => return Ok(false),
            _ => {}
        }
        if UpgradeStrategy::select_for_scope(vdb, &pass.config, scope) != self.strategy {
            return Ok(false);
        }
        let target = vdb.image_for_scope(scope);
        let finder = SubclusterFinder::new(ctx.state.as_ref(), vdb, pass.pfacts.scope.clone());
        let stss = finder.find_statefulsets(FindFlags::IN_VDB).await?;
        Ok(stss.iter().any(|sts| {
            StsSelector::NonTransient.matches(sts) && server_image(sts).is_some_and(|img| img != target)
        }))
    }

    fn marked_in_progress(&self, vdb: &VerticaDB, scope: &ClusterScope) -> bool {
        match scope.sandbox_name() {
            None => vdb.is_condition_true(self.strategy.condition()),
            Some(sb) => vdb
                .find_sandbox_status(sb)
                .is_some_and(|s| s.upgrade_state.upgrade_in_progress),
        }
    }

    /// Mark the upgrade as started.
    pub async fn start_upgrade(&self, ctx: &ActorContext, pass: &mut ReconcilePass) -> Result<()> {
        let scope = pass.pfacts.scope.clone();
        info!(strategy = self.strategy.as_str(), continuing = self.continuing, %scope, "starting upgrade");
        let generation = pass.vdb.metadata.generation;
        let strategy_condition = self.strategy.condition();
        let updated = update_vdb_status_with_retry(ctx.state.as_ref(), &pass.vdb, |v| {
            if let Some(sb) = scope.sandbox_name() {
                return v.update_sandbox_status(sb, |s| {
                    !std::mem::replace(&mut s.upgrade_state.upgrade_in_progress, true)
                });
            }
            let a = set_condition(
                v,
                Condition::new(ConditionType::UpgradeInProgress, true, UPGRADE_REASON, "", generation),
            );
            let b = set_condition(
                v,
                Condition::new(strategy_condition, true, UPGRADE_REASON, "", generation),
            );
            a || b
        })
        .await?;
        pass.set_vdb(updated);
        if !self.continuing {
            let message = match scope.sandbox_name() {
                None => format!("Vertica server upgrade has started ({})", self.strategy.as_str()),
                Some(sb) => format!(
                    "Vertica server upgrade has started ({}) in sandbox {sb}",
                    self.strategy.as_str()
                ),
            };
            ctx.normal(&pass.vdb, events::UPGRADE_START, message).await;
        }
        Ok(())
    }

    /// Clear the upgrade status and conditions.
    pub async fn finish_upgrade(&self, ctx: &ActorContext, pass: &mut ReconcilePass) -> Result<()> {
        let scope = pass.pfacts.scope.clone();
        let generation = pass.vdb.metadata.generation;
        let strategy_condition = self.strategy.condition();
        let updated = update_vdb_status_with_retry(ctx.state.as_ref(), &pass.vdb, |v| {
            if let Some(sb) = scope.sandbox_name() {
                return v.update_sandbox_status(sb, |s| {
                    let was = std::mem::take(&mut s.upgrade_state.upgrade_in_progress);
                    let msg = std::mem::take(&mut s.upgrade_state.upgrade_status);
                    was || !msg.is_empty()
                });
            }
            let mut changed = false;
            let status = v.status_mut();
            if !status.upgrade_status.is_empty() {
                status.upgrade_status.clear();
                changed = true;
            }
            changed |= set_condition(
                v,
                Condition::new(
                    ConditionType::UpgradeInProgress,
                    false,
                    UPGRADE_DONE_REASON,
                    "",
                    generation,
                ),
            );
            changed |= set_condition(
                v,
                Condition::new(strategy_condition, false, UPGRADE_DONE_REASON, "", generation),
            );
            changed
        })
        .await?;
        pass.set_vdb(updated);
        info!(strategy = self.strategy.as_str(), %scope, "upgrade finished");
        ctx.normal(
            &pass.vdb,
            events::UPGRADE_SUCCEEDED,
            format!(
                "Vertica server upgrade has completed successfully.  New image is '{}'",
                pass.vdb.image_for_scope(&scope)
            ),
        )
        .await;
        Ok(())
    }

    /// Point the selected StatefulSets at the target image and switch them
    /// to OnDelete so the pods are only replaced when we delete them.
    /// Returns how many StatefulSets changed.
    pub async fn update_statefulset_images(
        &self,
        ctx: &ActorContext,
        pass: &ReconcilePass,
        selector: StsSelector<'_>,
    ) -> Result<usize> {
        let namespace = pass.namespace();
        let target = pass.vdb.image_for_scope(&pass.pfacts.scope).to_string();
        let finder = SubclusterFinder::new(ctx.state.as_ref(), &pass.vdb, pass.pfacts.scope.clone());
        let mut changed = 0;
        for mut sts in finder.find_statefulsets(FindFlags::EXISTING).await? {
            if !selector.matches(&sts) {
                continue;
            }
            let on_delete = set_on_delete(&mut sts);
            let image = set_template_image(&mut sts, &target);
            if on_delete || image {
                info!(statefulset = %sts.name_any(), image = %target, "updating statefulset image");
                ctx.state.replace_statefulset(&namespace, &sts).await?;
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Delete pods whose server container still runs another image.
    /// Returns how many pods were deleted.
    pub async fn delete_pods_running_old_image(
        &self,
        ctx: &ActorContext,
        pass: &ReconcilePass,
        sc_name: Option<&str>,
    ) -> Result<usize> {
        let namespace = pass.namespace();
        let target = pass.vdb.image_for_scope(&pass.pfacts.scope);
        let finder = SubclusterFinder::new(ctx.state.as_ref(), &pass.vdb, pass.pfacts.scope.clone());
        let mut deleted = 0;
        for pod in finder.find_pods(FindFlags::EXISTING).await? {
            if let Some(sc) = sc_name
                && pod.labels().get(SUBCLUSTER_NAME_LABEL).map(String::as_str) != Some(sc)
            {
                continue;
            }
            if pod_server_image(&pod).is_some_and(|img| img != target) {
                info!(pod = %pod.name_any(), "deleting pod running old image");
                ctx.state.delete_pod(&namespace, &pod.name_any()).await?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// True once at least one pod runs the target image.
    pub async fn any_pod_has_new_image(&self, ctx: &ActorContext, pass: &ReconcilePass) -> Result<bool> {
        let target = pass.vdb.image_for_scope(&pass.pfacts.scope);
        let finder = SubclusterFinder::new(ctx.state.as_ref(), &pass.vdb, pass.pfacts.scope.clone());
        Ok(finder
            .find_pods(FindFlags::EXISTING)
            .await?
            .iter()
            .any(|p| pod_server_image(p) == Some(target)))
    }

    /// Post the message of step `idx` if the upgrade has not passed it yet.
    pub async fn post_next_status_msg(
        &self,
        ctx: &ActorContext,
        pass: &mut ReconcilePass,
        msgs: &[&str],
        idx: usize,
    ) -> Result<()> {
        let scope = pass.pfacts.scope.clone();
        let current = pass.vdb.upgrade_status_for_scope(&scope);
        let Some(msg) = next_status_msg(current, msgs, idx)? else {
            return Ok(());
        };
        info!(status = msg, %scope, "upgrade status");
        let updated = match scope.sandbox_name() {
            None => set_upgrade_status(ctx.state.as_ref(), &pass.vdb, msg).await?,
            Some(sb) => {
                update_vdb_status_with_retry(ctx.state.as_ref(), &pass.vdb, |v| {
                    v.update_sandbox_status(sb, |s| {
                        if s.upgrade_state.upgrade_status == msg {
                            return false;
                        }
                        s.upgrade_state.upgrade_status = msg.to_string();
                        true
                    })
                })
                .await?
            }
        };
        pass.set_vdb(updated);
        Ok(())
    }

    /// Remember the distinct images of the primary subclusters before any of
    /// them is changed.
    pub async fn cache_primary_images(&mut self, ctx: &ActorContext, pass: &ReconcilePass) -> Result<()> {
        let finder = SubclusterFinder::new(ctx.state.as_ref(), &pass.vdb, pass.pfacts.scope.clone());
        let mut images: Vec<String> = Vec::new();
        for sts in finder.find_statefulsets(FindFlags::IN_VDB | FindFlags::SORTED).await? {
            if !StsSelector::Primaries.matches(&sts) {
                continue;
            }
            if let Some(img) = server_image(&sts)
                && !images.iter().any(|i| i == img)
            {
                images.push(img.to_string());
            }
        }
        self.primary_images = images;
        Ok(())
    }

    /// The image being upgraded from: the first cached primary image that is
    /// not the target.
    pub fn fetch_old_image(&self, target: &str) -> Option<&str> {
        self.primary_images
            .iter()
            .map(String::as_str)
            .find(|img| *img != target)
    }

    /// Handle a change of NMA container layout between the old and new
    /// server.
    ///
    /// Servers older than 24.2.0 run the agent inside the server container.
    /// When the new image expects a sidecar the old template fails with
    /// `CreateContainerError`. The version annotation is then lowered to the
    /// first sidecar version and the StatefulSets are deleted so they get
    /// regenerated with the new layout. The real version is restored by the
    /// image version check once the pods come up.
    pub async fn change_nma_deployment_if_needed(
        &self,
        ctx: &ActorContext,
        pass: &mut ReconcilePass,
    ) -> Result<Directive> {
        if !pass.config.uses_vclusterops() || pass.config.nma_sidecar {
            return Ok(Directive::Continue);
        }
        let namespace = pass.namespace();
        let finder = SubclusterFinder::new(ctx.state.as_ref(), &pass.vdb, pass.pfacts.scope.clone());
        let stss = finder.find_statefulsets(FindFlags::EXISTING).await?;
        let mut broken = Vec::new();
        for sts in &stss {
            let first = format!("{}-0", sts.name_any());
            if let Some(pod) = ctx.state.get_pod(&namespace, &first).await?
                && server_waiting_reason(&pod) == Some(CREATE_CONTAINER_ERROR)
            {
                broken.push(sts.name_any());
            }
        }
        if broken.is_empty() {
            return Ok(Directive::Continue);
        }
        info!(statefulsets = ?broken, "container layout changed, regenerating statefulsets");
        let new: BTreeMap<String, String> =
            [(VERSION.to_string(), NMA_IN_SIDECAR_MIN_VERSION.to_string())].into();
        let updated = update_vdb_with_retry(ctx.state.as_ref(), &pass.vdb, |v| v.merge_annotations(&new)).await?;
        pass.set_vdb(updated);
        for name in broken {
            ctx.state.delete_statefulset(&namespace, &name).await?;
        }
        Ok(Directive::requeue_after(pass.config.upgrade_requeue_time))
    }
}

/// Image of the server container of a pod.
pub fn pod_server_image(pod: &Pod) -> Option<&str> {
    pod.spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == SERVER_CONTAINER)
        .and_then(|c| c.image.as_deref())
}

fn server_waiting_reason(pod: &Pod) -> Option<&str> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find(|c| c.name == SERVER_CONTAINER)?
        .state
        .as_ref()?
        .waiting
        .as_ref()?
        .reason
        .as_deref()
}
