//! Scenario tests: a single actor driven from a known starting state.

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::common::{NAMESPACE, TestEnv, VerticaDbBuilder, up_fact};
use vertica_operator::client::{ClusterState, DispatchCall, PodName};
use vertica_operator::controller::actors::{
    AdditionalBucketsActor, ImageVersionActor, RebalanceShardsActor, StatusActor,
};
use vertica_operator::controller::config::PassConfig;
use vertica_operator::controller::events::{
    ADDITIONAL_BUCKETS_UPDATED, EventKind, REBALANCE_SHARDS, WRONG_IMAGE,
};
use vertica_operator::controller::upgrade_manager::{UpgradeManager, UpgradeStrategy};
use vertica_operator::controller::{Actor, Directive, Error, ReconcilePass};
use vertica_operator::crd::CommunalStorage;
use vertica_operator::crd::annotations::VERSION;
use vertica_operator::resources::statefulset::generate_statefulset;

const VERSION_OUTPUT: &str = "Vertica Analytic Database v24.2.0-1\n\
    vertica(v24.2.0-1) built by @re-docker2 from master@da8f0e9 on 'Tue Jun  1 05:04:35 2024' $BuildId$\n";

fn s3_bucket() -> CommunalStorage {
    CommunalStorage {
        path: "s3://extra/data".into(),
        endpoint: "https://s3.example.com".into(),
        region: "us-east-1".into(),
        credential_secret: "s3-creds".into(),
    }
}

fn s3_secret() -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some("s3-creds".into()),
            namespace: Some(NAMESPACE.into()),
            ..Default::default()
        },
        data: Some(
            [
                ("accesskey".to_string(), ByteString(b"AKIA".to_vec())),
                ("secretkey".to_string(), ByteString(b"s3cr3t".to_vec())),
            ]
            .into(),
        ),
        ..Default::default()
    }
}

// ============================================================================
// Shard rebalancing
// ============================================================================

/// Only the subcluster holding a node with no shard subscriptions is
/// rebalanced, initiated from that subcluster.
#[tokio::test]
async fn test_rebalance_targets_unsubscribed_subcluster() {
    let env = TestEnv::new();
    let vdb = VerticaDbBuilder::new("v")
        .eon("s3://bucket/db")
        .primary("pri", 3)
        .secondary("sec", 3)
        .initialized()
        .build();
    let mut facts: Vec<_> = (0..3)
        .flat_map(|i| [up_fact(&vdb, "pri", i), up_fact(&vdb, "sec", i)])
        .collect();
    for pf in facts.iter_mut() {
        if pf.subcluster_name == "sec" && pf.pod_index == 2 {
            pf.shard_subscriptions = 0;
        }
    }
    let mut pass = env.pass(&vdb, facts).await;

    let directive = RebalanceShardsActor::new()
        .reconcile(&env.ctx, &mut pass)
        .await
        .unwrap();

    assert_eq!(directive, Directive::Continue);
    let calls = env.dispatcher.calls_named("rebalance_shards");
    assert_eq!(calls.len(), 1);
    let DispatchCall::RebalanceShards(opts) = &calls[0] else {
        panic!("unexpected call {:?}", calls[0]);
    };
    assert_eq!(opts.subcluster, "sec");
    assert_eq!(opts.initiator, PodName::new(NAMESPACE, "v-sec-0"));
    assert!(env.events.has_reason(REBALANCE_SHARDS));
}

#[tokio::test]
async fn test_rebalance_skips_enterprise_database() {
    let env = TestEnv::new();
    let vdb = VerticaDbBuilder::new("v").primary("pri", 1).build();
    let mut fact = up_fact(&vdb, "pri", 0);
    fact.shard_subscriptions = 0;
    let mut pass = env.pass(&vdb, vec![fact]).await;

    let directive = RebalanceShardsActor::new()
        .reconcile(&env.ctx, &mut pass)
        .await
        .unwrap();

    assert_eq!(directive, Directive::Continue);
    assert!(env.dispatcher.calls().is_empty());
}

// ============================================================================
// Additional buckets
// ============================================================================

/// After a successful pass the status records exactly the spec's buckets.
#[tokio::test]
async fn test_buckets_status_follows_spec() {
    let env = TestEnv::new();
    env.state.put_secret(NAMESPACE, &s3_secret()).await;
    let vdb = VerticaDbBuilder::new("v")
        .eon("s3://bucket/db")
        .primary("pri", 3)
        .additional_bucket(s3_bucket())
        .initialized()
        .build();
    let facts = (0..3).map(|i| up_fact(&vdb, "pri", i)).collect();
    let mut pass = env.pass(&vdb, facts).await;

    let directive = AdditionalBucketsActor
        .reconcile(&env.ctx, &mut pass)
        .await
        .unwrap();

    assert_eq!(directive, Directive::Continue);
    let stored = env.state.get_vdb(NAMESPACE, "v").await.unwrap();
    assert_eq!(
        stored.status.unwrap().additional_buckets,
        Some(vec![s3_bucket()])
    );
    let execs = env.runner.calls_matching("S3BucketCredentials");
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0].pod, PodName::new(NAMESPACE, "v-pri-0"));
    assert!(execs[0].command_line().contains("AKIA"));
    assert!(env.events.has_reason(ADDITIONAL_BUCKETS_UPDATED));
}

#[tokio::test]
async fn test_buckets_wait_for_credential_secret() {
    let env = TestEnv::new();
    let vdb = VerticaDbBuilder::new("v")
        .eon("s3://bucket/db")
        .primary("pri", 1)
        .additional_bucket(s3_bucket())
        .initialized()
        .build();
    let mut pass = env.pass(&vdb, vec![up_fact(&vdb, "pri", 0)]).await;
    let writes = env.state.vdb_write_count().await;

    let directive = AdditionalBucketsActor
        .reconcile(&env.ctx, &mut pass)
        .await
        .unwrap();

    assert_eq!(directive, Directive::requeue());
    assert!(env.runner.calls().is_empty());
    assert_eq!(env.state.vdb_write_count().await, writes);
}

// ============================================================================
// Pod facts into status
// ============================================================================

/// A node reported up and read-only ends up that way in the status detail.
#[tokio::test]
async fn test_read_only_node_reaches_status() {
    let env = TestEnv::new();
    let vdb = VerticaDbBuilder::new("v")
        .admintools("v12.0.4-0")
        .primary("pri", 2)
        .build();
    let mut read_only = up_fact(&vdb, "pri", 1);
    read_only.read_only = true;
    read_only.subcluster_oid = "123456".into();
    let mut pass = env
        .pass(&vdb, vec![up_fact(&vdb, "pri", 0), read_only])
        .await;

    StatusActor.reconcile(&env.ctx, &mut pass).await.unwrap();

    let status = pass.vdb.status.as_ref().unwrap();
    assert_eq!(status.up_node_count, 2);
    assert_eq!(status.subcluster_count, 1);
    let sc = &status.subclusters[0];
    assert_eq!(sc.oid, "123456");
    assert!(!sc.detail[0].read_only);
    assert!(sc.detail[1].read_only);
    assert_eq!(sc.detail[1].vnode_name, "v_vertdb_node0002");
}

// ============================================================================
// Image version
// ============================================================================

/// An admintools image under a vclusterops deployment is refused before the
/// version is read.
#[tokio::test]
async fn test_admintools_image_rejected_for_vclusterops() {
    let env = TestEnv::new();
    let vdb = VerticaDbBuilder::new("v")
        .vclusterops("v24.2.0-0")
        .primary("pri", 1)
        .build();
    let mut fact = up_fact(&vdb, "pri", 0);
    fact.admintools_exists = true;
    let mut pass = env.pass(&vdb, vec![fact]).await;

    let result = ImageVersionActor::new(false)
        .reconcile(&env.ctx, &mut pass)
        .await;

    assert!(matches!(result, Err(Error::Validation(_))));
    let warnings = env.events.with_reason(WRONG_IMAGE);
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].kind, EventKind::Warning);
    assert!(env.runner.calls_matching("--version").is_empty());
}

#[tokio::test]
async fn test_image_version_recorded() {
    let env = TestEnv::new();
    let vdb = VerticaDbBuilder::new("v")
        .vclusterops("v24.1.0-0")
        .primary("pri", 1)
        .build();
    env.runner.respond_any("--version", VERSION_OUTPUT);
    let mut pass = env.pass(&vdb, vec![up_fact(&vdb, "pri", 0)]).await;

    let directive = ImageVersionActor::new(true)
        .reconcile(&env.ctx, &mut pass)
        .await
        .unwrap();

    assert_eq!(directive, Directive::Continue);
    assert_eq!(pass.vdb.annotation(VERSION), Some("v24.2.0-1"));
    let stored = env.state.get_vdb(NAMESPACE, "v").await.unwrap();
    assert_eq!(stored.annotation(VERSION), Some("v24.2.0-1"));
}

// ============================================================================
// Upgrade source image
// ============================================================================

/// With primaries split over two images the one that is not the target is
/// the image being upgraded from.
#[tokio::test]
async fn test_old_image_from_primary_statefulsets() {
    let env = TestEnv::new();
    let vdb = VerticaDbBuilder::new("v")
        .image("vertica:v2")
        .primary("pri1", 1)
        .primary("pri2", 1)
        .build();
    let cfg = PassConfig::from_vdb(&vdb);
    let mut old = vdb.clone();
    old.spec.image = "vertica:v1".into();
    env.state
        .put_statefulset(
            NAMESPACE,
            &generate_statefulset(&old, &old.spec.subclusters[0], &cfg),
        )
        .await;
    env.state
        .put_statefulset(
            NAMESPACE,
            &generate_statefulset(&vdb, &vdb.spec.subclusters[1], &cfg),
        )
        .await;
    let stored = env.state.put_vdb(&vdb).await;
    let pass = ReconcilePass::new(stored);

    let mut mgr = UpgradeManager::new(UpgradeStrategy::Offline);
    assert!(mgr.is_upgrade_needed(&env.ctx, &pass).await.unwrap());
    mgr.cache_primary_images(&env.ctx, &pass).await.unwrap();

    assert_eq!(mgr.primary_images(), ["vertica:v1", "vertica:v2"]);
    assert_eq!(mgr.fetch_old_image("vertica:v2"), Some("vertica:v1"));
}
