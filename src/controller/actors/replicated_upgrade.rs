//! Replicated upgrade: the database stays writable while a copy of it is
//! upgraded next to it.
//!
//! The existing subclusters form replica group A. Every primary of group A
//! gets a secondary twin in group B, and group B is moved into a sandbox
//! that runs the old image. The sandbox is upgraded on its own, then the
//! main cluster's data is replicated into it. Client traffic of each group A
//! service is pointed at group B, and the sandbox is promoted to be the new
//! main cluster. Group A is dropped and its secondaries are recreated on the
//! new image.
//!
//! Progress lives in the resource itself: the replica-group annotations on
//! the subclusters, the sandbox in the spec and a few markers on the
//! VerticaDB. Every step checks those first, so a pass can resume anywhere.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::client::dispatcher::{PromoteSandboxOptions, ReplicateDbOptions};
use crate::controller::actor::{Actor, ActorContext, Directive, ReconcilePass};
use crate::controller::actors::client_routing::{ClientRoutingActor, RoutingMode, set_routing_label};
use crate::controller::actors::drain_node::any_active_sessions;
use crate::controller::actors::install::InstallActor;
use crate::controller::actors::membership::{DbAddNodeActor, DbAddSubclusterActor};
use crate::controller::actors::objects::{ObjReconcilerActor, ObjScope, TEMPLATE_DIGEST_ANNOTATION};
use crate::controller::actors::read_only_upgrade::run_all;
use crate::controller::actors::sandbox::{SandboxSubclusterActor, collect_scope};
use crate::controller::error::{Error, Result};
use crate::controller::events;
use crate::controller::status::{update_vdb_status_with_retry, update_vdb_with_retry};
use crate::controller::upgrade_manager::{UpgradeManager, UpgradeStrategy};
use crate::crd::annotations::{
    CHILD_SUBCLUSTER, CLIENT_ROUTING_LABEL, CLIENT_ROUTING_VALUE, PARENT_SUBCLUSTER,
    REPLICA_GROUP, REPLICA_GROUP_A, REPLICA_GROUP_B, REPLICATED_UPGRADE_PROMOTED,
    REPLICATED_UPGRADE_REPLICATION, REPLICATED_UPGRADE_SANDBOX, SUBCLUSTER_NAME_LABEL,
    SUBCLUSTER_SVC_NAME_LABEL,
};
use crate::crd::{ClusterScope, Sandbox, SandboxSubcluster, Subcluster, SubclusterType, VerticaDB};
use crate::podfacts::PodFacts;
use crate::resources::common::{base_selector_labels, external_service_name, pod_name};

/// Preferred name of the sandbox holding replica group B.
const SANDBOX_NAME: &str = "replica-group-b";
/// Appended to a subcluster name to name its replacement.
const TWIN_SUFFIX: &str = "-sb";
const MARKER_DONE: &str = "true";

const MSGS: [&str; 8] = [
    "Creating subclusters for replica group B",
    "Sandboxing replica group B",
    "Upgrading replica group B",
    "Pausing connections to replica group A",
    "Replicating data to replica group B",
    "Redirecting connections to replica group B",
    "Promoting replica group B to the main cluster",
    "Recreating secondary subclusters",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Step {
    Start,
    Post(usize),
    AssignGroupA,
    CreateGroupB,
    DefineSandbox,
    SandboxGroupB,
    UpgradeSandbox,
    WaitForSandbox,
    PauseGroupA,
    Replicate,
    Redirect,
    Promote,
    RetireGroupA,
    Rebuild,
    Finish,
}

const STEPS: [Step; 22] = [
    Step::Start,
    Step::Post(0),
    Step::AssignGroupA,
    Step::CreateGroupB,
    Step::Post(1),
    Step::DefineSandbox,
    Step::SandboxGroupB,
    Step::Post(2),
    Step::UpgradeSandbox,
    Step::WaitForSandbox,
    Step::Post(3),
    Step::PauseGroupA,
    Step::Post(4),
    Step::Replicate,
    Step::Post(5),
    Step::Redirect,
    Step::Post(6),
    Step::Promote,
    Step::Post(7),
    Step::RetireGroupA,
    Step::Rebuild,
    Step::Finish,
];

pub struct ReplicatedUpgradeActor;

#[async_trait]
impl Actor for ReplicatedUpgradeActor {
    fn name(&self) -> &'static str {
        "ReplicatedUpgrade"
    }

    async fn reconcile(&self, ctx: &ActorContext, pass: &mut ReconcilePass) -> Result<Directive> {
        let mut mgr = UpgradeManager::new(UpgradeStrategy::Replicated);
        if !mgr.is_upgrade_needed(ctx, pass).await? {
            return Ok(Directive::Continue);
        }
        pass.collect(ctx).await?;
        mgr.cache_primary_images(ctx, pass).await?;
        for step in STEPS {
            let d = run_step(step, &mgr, ctx, pass).await?;
            if !d.is_continue() {
                info!(step = ?step, "replicated upgrade waiting");
                return Ok(Directive::requeue_after(pass.config.upgrade_requeue_time));
            }
        }
        Ok(Directive::Continue)
    }
}

async fn run_step(
    step: Step,
    mgr: &UpgradeManager,
    ctx: &ActorContext,
    pass: &mut ReconcilePass,
) -> Result<Directive> {
    let promoted = is_promoted(&pass.vdb);
    match step {
        Step::Start => mgr.start_upgrade(ctx, pass).await.map(|()| Directive::Continue),
        Step::Post(idx) => {
            mgr.post_next_status_msg(ctx, pass, &MSGS, idx).await?;
            Ok(Directive::Continue)
        }
        _ if promoted && step < Step::RetireGroupA => Ok(Directive::Continue),
        Step::AssignGroupA => {
            update_spec(ctx, pass, assign_group_a).await?;
            Ok(Directive::Continue)
        }
        Step::CreateGroupB => create_group_b(mgr, ctx, pass).await,
        Step::DefineSandbox => {
            if sandbox_name(&pass.vdb).is_some() {
                return Ok(Directive::Continue);
            }
            let old = old_image(mgr, &pass.vdb)?;
            update_spec(ctx, pass, |v| define_sandbox(v, &old)).await?;
            Ok(Directive::Continue)
        }
        Step::SandboxGroupB => sandbox_group_b(ctx, pass).await,
        Step::UpgradeSandbox => {
            let name = required_sandbox(&pass.vdb)?;
            update_spec(ctx, pass, |v| set_sandbox_image(v, &name)).await?;
            Ok(Directive::Continue)
        }
        Step::WaitForSandbox => wait_for_sandbox(ctx, pass).await,
        Step::PauseGroupA => pause_group_a(ctx, pass).await,
        Step::Replicate => {
            if pass.vdb.annotation(REPLICATED_UPGRADE_REPLICATION).is_some() {
                return Ok(Directive::Continue);
            }
            let sandbox = sandbox_facts(ctx, pass).await?;
            replicate(ctx, pass, &sandbox).await
        }
        Step::Redirect => {
            let sandbox = sandbox_facts(ctx, pass).await?;
            redirect(ctx, pass, &sandbox).await
        }
        Step::Promote => {
            let sandbox = sandbox_facts(ctx, pass).await?;
            promote(ctx, pass, &sandbox).await
        }
        Step::RetireGroupA => retire_group_a(ctx, pass).await,
        Step::Rebuild => {
            let actors: [Box<dyn Actor>; 5] = [
                Box::new(ObjReconcilerActor::new(ObjScope::All)),
                Box::new(InstallActor),
                Box::new(DbAddSubclusterActor),
                Box::new(DbAddNodeActor),
                Box::new(ClientRoutingActor::new(RoutingMode::AddNode)),
            ];
            run_all(&actors, ctx, pass).await
        }
        Step::Finish => {
            mgr.finish_upgrade(ctx, pass).await?;
            update_spec(ctx, pass, clear_markers).await?;
            Ok(Directive::Continue)
        }
    }
}

fn is_promoted(vdb: &VerticaDB) -> bool {
    vdb.annotation(REPLICATED_UPGRADE_PROMOTED) == Some(MARKER_DONE)
}

/// Sandbox defined for group B, if any.
fn sandbox_name(vdb: &VerticaDB) -> Option<String> {
    vdb.annotation(REPLICATED_UPGRADE_SANDBOX)
        .filter(|name| !name.is_empty() && vdb.find_sandbox(name).is_some())
        .map(str::to_string)
}

fn required_sandbox(vdb: &VerticaDB) -> Result<String> {
    sandbox_name(vdb).ok_or_else(|| Error::Permanent("replica group B has no sandbox".to_string()))
}

fn old_image(mgr: &UpgradeManager, vdb: &VerticaDB) -> Result<String> {
    mgr.fetch_old_image(&vdb.spec.image)
        .map(str::to_string)
        .ok_or_else(|| Error::Permanent("no primary runs the old image".to_string()))
}

fn in_group(sc: &Subcluster, group: &str) -> bool {
    sc.annotations.get(REPLICA_GROUP).is_some_and(|g| g == group)
}

fn group_members(vdb: &VerticaDB, group: &str) -> Vec<String> {
    vdb.spec
        .subclusters
        .iter()
        .filter(|sc| in_group(sc, group))
        .map(|sc| sc.name.clone())
        .collect()
}

/// `base`, or `base-N` with the smallest N that is free.
fn unique_name(base: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_string();
    }
    (1..)
        .map(|i| format!("{base}-{i}"))
        .find(|n| !taken(n))
        .unwrap_or_else(|| base.to_string())
}

async fn update_spec<F>(ctx: &ActorContext, pass: &mut ReconcilePass, mutate: F) -> Result<()>
where
    F: Fn(&mut VerticaDB) -> bool + Send + Sync,
{
    let mut preview = pass.vdb.clone();
    if !mutate(&mut preview) {
        return Ok(());
    }
    let updated = update_vdb_with_retry(ctx.state.as_ref(), &pass.vdb, mutate).await?;
    pass.set_vdb(updated);
    pass.pfacts.invalidate();
    Ok(())
}

/// Tag every subcluster as group A, once.
fn assign_group_a(vdb: &mut VerticaDB) -> bool {
    if vdb.spec.subclusters.iter().any(|sc| in_group(sc, REPLICA_GROUP_A)) {
        return false;
    }
    for sc in &mut vdb.spec.subclusters {
        sc.annotations
            .insert(REPLICA_GROUP.to_string(), REPLICA_GROUP_A.to_string());
    }
    true
}

/// Add a secondary twin on the old image for every group A primary.
fn add_group_b(vdb: &mut VerticaDB, old_image: &str) -> bool {
    if !group_members(vdb, REPLICA_GROUP_B).is_empty() {
        return false;
    }
    let mut taken: Vec<String> = vdb.spec.subclusters.iter().map(|sc| sc.name.clone()).collect();
    let mut twins = Vec::new();
    for parent in vdb
        .spec
        .subclusters
        .iter_mut()
        .filter(|sc| sc.is_primary() && in_group(sc, REPLICA_GROUP_A))
    {
        let name = unique_name(&format!("{}{TWIN_SUFFIX}", parent.name), |n| {
            taken.iter().any(|t| t == n)
        });
        taken.push(name.clone());
        let mut annotations = parent.annotations.clone();
        annotations.insert(REPLICA_GROUP.to_string(), REPLICA_GROUP_B.to_string());
        annotations.insert(PARENT_SUBCLUSTER.to_string(), parent.name.clone());
        twins.push(Subcluster {
            name: name.clone(),
            r#type: SubclusterType::Secondary,
            image_override: Some(old_image.to_string()),
            service_name: None,
            service_type: "ClusterIP".to_string(),
            annotations,
            ..parent.clone()
        });
        parent.annotations.insert(CHILD_SUBCLUSTER.to_string(), name);
    }
    if twins.is_empty() {
        return false;
    }
    vdb.spec.subclusters.extend(twins);
    true
}

/// Put group B in a sandbox pinned to the old image.
fn define_sandbox(vdb: &mut VerticaDB, old_image: &str) -> bool {
    if sandbox_name(vdb).is_some() {
        return false;
    }
    let members = group_members(vdb, REPLICA_GROUP_B);
    if members.is_empty() {
        return false;
    }
    let name = unique_name(SANDBOX_NAME, |n| vdb.find_sandbox(n).is_some());
    for sc in vdb.spec.subclusters.iter_mut().filter(|sc| in_group(sc, REPLICA_GROUP_B)) {
        sc.image_override = None;
    }
    vdb.spec.sandboxes.push(Sandbox {
        name: name.clone(),
        image: Some(old_image.to_string()),
        subclusters: members
            .into_iter()
            .map(|name| SandboxSubcluster { name })
            .collect(),
    });
    let marker = BTreeMap::from([(REPLICATED_UPGRADE_SANDBOX.to_string(), name)]);
    vdb.merge_annotations(&marker);
    true
}

fn set_sandbox_image(vdb: &mut VerticaDB, sandbox: &str) -> bool {
    let target = vdb.spec.image.clone();
    match vdb.spec.sandboxes.iter_mut().find(|sb| sb.name == sandbox) {
        Some(sb) if sb.image.as_deref() != Some(target.as_str()) => {
            sb.image = Some(target);
            true
        }
        _ => false,
    }
}

/// Where each group A subcluster's clients go: a primary to its twin, the
/// secondaries round-robin over group B.
fn redirect_targets(vdb: &VerticaDB) -> Result<Vec<(Subcluster, String)>> {
    let group_b = group_members(vdb, REPLICA_GROUP_B);
    if group_b.is_empty() {
        return Err(Error::Permanent("replica group B is empty".to_string()));
    }
    let mut next = group_b.iter().cycle();
    let mut targets = Vec::new();
    for sc in vdb.spec.subclusters.iter().filter(|sc| in_group(sc, REPLICA_GROUP_A)) {
        let target = if sc.is_primary() {
            sc.annotations.get(CHILD_SUBCLUSTER).cloned().ok_or_else(|| {
                Error::Permanent(format!("primary subcluster '{}' has no twin", sc.name))
            })?
        } else {
            next.next().cloned().unwrap_or_default()
        };
        targets.push((sc.clone(), target));
    }
    Ok(targets)
}

/// Make group B the main cluster's spec: twins become the primaries under
/// their parent's service, group A leaves, and its secondaries are declared
/// again under new names.
fn promote_spec(vdb: &mut VerticaDB, sandbox: &str) -> bool {
    let grouped = vdb.spec.subclusters.iter().any(|sc| sc.annotations.contains_key(REPLICA_GROUP));
    if !grouped && vdb.find_sandbox(sandbox).is_none() {
        return false;
    }
    let old = std::mem::take(&mut vdb.spec.subclusters);
    let fronts: BTreeMap<String, (String, String)> = old
        .iter()
        .map(|sc| (sc.name.clone(), (sc.service_name(), sc.service_type.clone())))
        .collect();
    let mut kept = Vec::new();
    let mut recreated: Vec<Subcluster> = Vec::new();
    for mut sc in old {
        let group = sc.annotations.remove(REPLICA_GROUP);
        let parent = sc.annotations.remove(PARENT_SUBCLUSTER);
        sc.annotations.remove(CHILD_SUBCLUSTER);
        match group.as_deref() {
            Some(REPLICA_GROUP_B) => {
                sc.r#type = SubclusterType::Primary;
                sc.image_override = None;
                if let Some((service, service_type)) = parent.and_then(|p| fronts.get(&p)) {
                    sc.service_name = Some(service.clone());
                    sc.service_type = service_type.clone();
                }
                kept.push(sc);
            }
            Some(REPLICA_GROUP_A) if sc.is_secondary() => {
                sc.service_name = Some(sc.service_name());
                sc.image_override = None;
                sc.name = unique_name(&format!("{}{TWIN_SUFFIX}", sc.name), |n| {
                    fronts.contains_key(n) || recreated.iter().any(|r| r.name == n)
                });
                recreated.push(sc);
            }
            // Group A primaries and transients went away with the old main cluster.
            Some(REPLICA_GROUP_A) => {}
            _ => kept.push(sc),
        }
    }
    kept.extend(recreated);
    vdb.spec.subclusters = kept;
    vdb.spec.sandboxes.retain(|sb| sb.name != sandbox);
    true
}

fn clear_markers(vdb: &mut VerticaDB) -> bool {
    let Some(annotations) = vdb.metadata.annotations.as_mut() else {
        return false;
    };
    let mut changed = false;
    for key in [
        REPLICATED_UPGRADE_SANDBOX,
        REPLICATED_UPGRADE_REPLICATION,
        REPLICATED_UPGRADE_PROMOTED,
    ] {
        changed |= annotations.remove(key).is_some();
    }
    changed
}

fn set_marker(vdb: &mut VerticaDB, key: &str) -> bool {
    vdb.merge_annotations(&BTreeMap::from([(key.to_string(), MARKER_DONE.to_string())]))
}

async fn sandbox_facts(ctx: &ActorContext, pass: &ReconcilePass) -> Result<PodFacts> {
    let name = required_sandbox(&pass.vdb)?;
    collect_scope(ctx, pass, ClusterScope::Sandbox(name)).await
}

/// Create the twins in the main cluster on the old image.
async fn create_group_b(
    mgr: &UpgradeManager,
    ctx: &ActorContext,
    pass: &mut ReconcilePass,
) -> Result<Directive> {
    if sandbox_name(&pass.vdb).is_some() {
        return Ok(Directive::Continue);
    }
    if group_members(&pass.vdb, REPLICA_GROUP_B).is_empty() {
        let old = old_image(mgr, &pass.vdb)?;
        info!(image = %old, "adding replica group B");
        update_spec(ctx, pass, |v| add_group_b(v, &old)).await?;
    }
    let actors: [Box<dyn Actor>; 4] = [
        Box::new(ObjReconcilerActor::new(ObjScope::CreateOnly)),
        Box::new(InstallActor),
        Box::new(DbAddSubclusterActor),
        Box::new(DbAddNodeActor),
    ];
    run_all(&actors, ctx, pass).await
}

async fn sandbox_group_b(ctx: &ActorContext, pass: &mut ReconcilePass) -> Result<Directive> {
    let name = required_sandbox(&pass.vdb)?;
    let all_sandboxed = |vdb: &VerticaDB| {
        let members = group_members(vdb, REPLICA_GROUP_B);
        vdb.find_sandbox_status(&name)
            .is_some_and(|s| members.iter().all(|m| s.subclusters.contains(m)))
    };
    if all_sandboxed(&pass.vdb) {
        return Ok(Directive::Continue);
    }
    let facts = collect_scope(ctx, pass, ClusterScope::Sandbox(name.clone())).await?;
    let facts = BTreeMap::from([(name.clone(), facts)]);
    SandboxSubclusterActor.sandbox_pending(ctx, pass, &facts).await?;
    if all_sandboxed(&pass.vdb) {
        Ok(Directive::Continue)
    } else {
        Ok(Directive::requeue())
    }
}

/// The sandbox pass does the upgrade itself; wait for it to settle.
async fn wait_for_sandbox(ctx: &ActorContext, pass: &mut ReconcilePass) -> Result<Directive> {
    let name = required_sandbox(&pass.vdb)?;
    let facts = collect_scope(ctx, pass, ClusterScope::Sandbox(name.clone())).await?;
    let target = pass.vdb.spec.image.as_str();
    let pods = facts.filter_pods(|_| true);
    if pods.is_empty() {
        info!(sandbox = %name, "sandbox has no pods yet");
        return Ok(Directive::requeue());
    }
    if let Some(pf) = pods.iter().find(|p| !p.up_node || p.image != target) {
        info!(pod = %pf.name, sandbox = %name, "waiting for sandbox to come up on the new image");
        return Ok(Directive::requeue());
    }
    if pass
        .vdb
        .find_sandbox_status(&name)
        .is_some_and(|s| s.upgrade_state.upgrade_in_progress)
    {
        info!(sandbox = %name, "sandbox upgrade still in progress");
        return Ok(Directive::requeue());
    }
    Ok(Directive::Continue)
}

/// Stop routing new clients to group A and wait for its sessions to end.
async fn pause_group_a(ctx: &ActorContext, pass: &mut ReconcilePass) -> Result<Directive> {
    if pass.vdb.annotation(REPLICATED_UPGRADE_REPLICATION).is_some() {
        return Ok(Directive::Continue);
    }
    pass.collect(ctx).await?;
    let pods: Vec<_> = pass
        .pfacts
        .filter_pods(|p| p.exists)
        .into_iter()
        .cloned()
        .collect();
    for pf in &pods {
        set_routing_label(ctx, pf, false).await?;
    }
    let up: Vec<_> = pods.into_iter().filter(|p| p.up_node).collect();
    if any_active_sessions(ctx, &up).await? {
        info!("waiting for client sessions on replica group A to end");
        return Ok(Directive::requeue());
    }
    Ok(Directive::Continue)
}

/// Copy the main cluster's data into the sandbox.
async fn replicate(ctx: &ActorContext, pass: &mut ReconcilePass, sandbox: &PodFacts) -> Result<Directive> {
    let name = required_sandbox(&pass.vdb)?;
    pass.collect(ctx).await?;
    let Some(initiator) = pass.pfacts.find_first_up_pod(false, None).map(|p| p.name.clone()) else {
        info!("no up pod in the main cluster, requeue replication");
        return Ok(Directive::requeue());
    };
    let Some(target_host) = sandbox.find_first_up_pod(false, None).map(|p| p.pod_ip.clone()) else {
        info!(sandbox = %name, "no up pod in the sandbox, requeue replication");
        return Ok(Directive::requeue());
    };

    ctx.normal(
        &pass.vdb,
        events::REPLICATION_STARTED,
        format!("Starting database replication to sandbox '{name}'"),
    )
    .await;
    let opts = ReplicateDbOptions {
        initiator,
        target_host,
        target_sandbox: name.clone(),
    };
    if let Err(e) = ctx.dispatcher.replicate_db(&opts).await {
        ctx.warning(
            &pass.vdb,
            events::REPLICATION_FAILED,
            format!("Failed to replicate the database to sandbox '{name}'"),
        )
        .await;
        return Err(e);
    }
    ctx.normal(
        &pass.vdb,
        events::REPLICATION_SUCCEEDED,
        format!("Successfully replicated the database to sandbox '{name}'"),
    )
    .await;
    update_spec(ctx, pass, |v| set_marker(v, REPLICATED_UPGRADE_REPLICATION)).await?;
    Ok(Directive::Continue)
}

/// Point every group A service at its group B target and let the target's
/// up pods take clients.
async fn redirect(ctx: &ActorContext, pass: &mut ReconcilePass, sandbox: &PodFacts) -> Result<Directive> {
    let namespace = pass.namespace();
    for (source, target) in redirect_targets(&pass.vdb)? {
        let svc_name = external_service_name(&pass.vdb, &source);
        if let Some(svc) = ctx.state.get_service(&namespace, &svc_name).await? {
            let mut selector = base_selector_labels(&pass.vdb);
            selector.insert(SUBCLUSTER_NAME_LABEL.to_string(), target.clone());
            selector.insert(CLIENT_ROUTING_LABEL.to_string(), CLIENT_ROUTING_VALUE.to_string());
            if let Some(updated) = with_selector(svc, selector) {
                info!(service = %svc_name, target = %target, "redirecting service to replica group B");
                ctx.state.replace_service(&namespace, &updated).await?;
            }
        }
        for pf in sandbox.in_subcluster(&target).into_iter().filter(|p| p.up_node) {
            set_routing_label(ctx, pf, true).await?;
        }
    }
    Ok(Directive::Continue)
}

/// The service with its selector swapped, or `None` if it already matches.
/// The template digest goes away so the object reconciler rebuilds the
/// service once the upgrade is over.
fn with_selector(mut svc: Service, selector: BTreeMap<String, String>) -> Option<Service> {
    let spec = svc.spec.get_or_insert_with(Default::default);
    if spec.selector.as_ref() == Some(&selector) {
        return None;
    }
    spec.selector = Some(selector);
    svc.annotations_mut().remove(TEMPLATE_DIGEST_ANNOTATION);
    Some(svc)
}

async fn promote(ctx: &ActorContext, pass: &mut ReconcilePass, sandbox: &PodFacts) -> Result<Directive> {
    let name = required_sandbox(&pass.vdb)?;
    let Some(initiator) = sandbox.find_first_up_pod(false, None).map(|p| p.name.clone()) else {
        info!(sandbox = %name, "no up pod in the sandbox, requeue promotion");
        return Ok(Directive::requeue());
    };
    let opts = PromoteSandboxOptions {
        initiator,
        sandbox: name.clone(),
    };
    if let Err(e) = ctx.dispatcher.promote_sandbox(&opts).await {
        ctx.warning(
            &pass.vdb,
            events::PROMOTE_SANDBOX_FAILED,
            format!("Failed to promote sandbox '{name}' to the main cluster"),
        )
        .await;
        return Err(e);
    }
    ctx.normal(
        &pass.vdb,
        events::PROMOTE_SANDBOX_SUCCEEDED,
        format!("Successfully promoted sandbox '{name}' to the main cluster"),
    )
    .await;
    update_spec(ctx, pass, |v| set_marker(v, REPLICATED_UPGRADE_PROMOTED)).await?;
    Ok(Directive::Continue)
}

/// Drop group A from the resource once the database promoted group B.
async fn retire_group_a(ctx: &ActorContext, pass: &mut ReconcilePass) -> Result<Directive> {
    if !is_promoted(&pass.vdb) {
        return Err(Error::Permanent("replica group B was not promoted".to_string()));
    }
    let sandbox = pass
        .vdb
        .annotation(REPLICATED_UPGRADE_SANDBOX)
        .unwrap_or_default()
        .to_string();

    // Pods keep the labels they were created with; move the twins under the
    // service they are about to front.
    let mut preview = pass.vdb.clone();
    if !promote_spec(&mut preview, &sandbox) {
        return Ok(Directive::Continue);
    }
    let namespace = pass.namespace();
    for sc in preview.spec.subclusters.iter().filter(|sc| sc.is_primary()) {
        let Some(current) = pass.vdb.spec.subclusters.iter().find(|c| c.name == sc.name) else {
            continue;
        };
        for index in 0..current.size {
            let pod = pod_name(&pass.vdb, current, index);
            let Some(mut obj) = ctx.state.get_pod(&namespace, &pod.name).await? else {
                continue;
            };
            let service = sc.service_name();
            if obj.labels().get(SUBCLUSTER_SVC_NAME_LABEL) == Some(&service) {
                continue;
            }
            obj.labels_mut().insert(SUBCLUSTER_SVC_NAME_LABEL.to_string(), service);
            debug!(pod = %pod, "moving pod under its new service");
            ctx.state.replace_pod(&namespace, &obj).await?;
        }
    }

    let updated = update_vdb_status_with_retry(ctx.state.as_ref(), &pass.vdb, |v| {
        let sandboxes = &mut v.status_mut().sandboxes;
        let before = sandboxes.len();
        sandboxes.retain(|s| s.name != sandbox);
        sandboxes.len() != before
    })
    .await?;
    pass.set_vdb(updated);
    info!(sandbox = %sandbox, "replica group A retired");
    update_spec(ctx, pass, |v| promote_spec(v, &sandbox)).await?;
    if pass.vdb.spec.subclusters.is_empty() {
        warn!("no subclusters left after promotion");
    }
    Ok(Directive::Continue)
}
