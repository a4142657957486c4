//! Convergence tests: repeated passes and conflicting writers.

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::common::{NAMESPACE, TestEnv, VerticaDbBuilder, up_fact};
use vertica_operator::client::ClusterState;
use vertica_operator::controller::actors::{AdditionalBucketsActor, StatusActor};
use vertica_operator::controller::pipeline::run_pipeline;
use vertica_operator::controller::upgrade_manager::{UpgradeManager, UpgradeStrategy};
use vertica_operator::controller::{Actor, Directive, Error};
use vertica_operator::crd::CommunalStorage;
use vertica_operator::crd::annotations::READY_STATUS;

const UPGRADE_MSGS: [&str; 3] = [
    "Shutting down the cluster",
    "Rescheduling pods",
    "Restarting the cluster",
];

fn gcs_bucket() -> CommunalStorage {
    CommunalStorage {
        path: "gs://archive/db".into(),
        credential_secret: "gcs-creds".into(),
        ..Default::default()
    }
}

fn gcs_secret() -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some("gcs-creds".into()),
            namespace: Some(NAMESPACE.into()),
            ..Default::default()
        },
        data: Some(
            [
                ("accesskey".to_string(), ByteString(b"GOOG".to_vec())),
                ("secretkey".to_string(), ByteString(b"hmac".to_vec())),
            ]
            .into(),
        ),
        ..Default::default()
    }
}

// ============================================================================
// Idempotence
// ============================================================================

/// Once the buckets are applied a second pass neither runs SQL nor writes.
#[tokio::test]
async fn test_buckets_second_pass_is_a_no_op() {
    let env = TestEnv::new();
    env.state.put_secret(NAMESPACE, &gcs_secret()).await;
    let vdb = VerticaDbBuilder::new("v")
        .eon("gs://bucket/db")
        .primary("pri", 1)
        .additional_bucket(gcs_bucket())
        .initialized()
        .build();
    let mut pass = env.pass(&vdb, vec![up_fact(&vdb, "pri", 0)]).await;

    let first = AdditionalBucketsActor
        .reconcile(&env.ctx, &mut pass)
        .await
        .unwrap();
    assert_eq!(first, Directive::Continue);
    assert_eq!(env.runner.calls_matching("GCSAuth").len(), 1);

    env.runner.clear_calls();
    let writes = env.state.vdb_write_count().await;
    let second = AdditionalBucketsActor
        .reconcile(&env.ctx, &mut pass)
        .await
        .unwrap();

    assert_eq!(second, Directive::Continue);
    assert!(env.runner.calls().is_empty());
    assert_eq!(env.state.vdb_write_count().await, writes);
}

/// Refreshing an unchanged status does not write the resource again.
#[tokio::test]
async fn test_status_refresh_is_idempotent() {
    let env = TestEnv::new();
    let vdb = VerticaDbBuilder::new("v")
        .primary("pri", 3)
        .secondary("sec", 1)
        .build();
    let facts = vec![
        up_fact(&vdb, "pri", 0),
        up_fact(&vdb, "pri", 1),
        up_fact(&vdb, "pri", 2),
        up_fact(&vdb, "sec", 0),
    ];
    let mut pass = env.pass(&vdb, facts).await;

    StatusActor.reconcile(&env.ctx, &mut pass).await.unwrap();
    let writes = env.state.vdb_write_count().await;
    // One status write and one ready-status annotation write.
    assert_eq!(writes, 2);
    StatusActor.reconcile(&env.ctx, &mut pass).await.unwrap();

    assert_eq!(env.state.vdb_write_count().await, writes);
    assert_eq!(pass.vdb.status.as_ref().unwrap().up_node_count, 4);
    assert_eq!(pass.vdb.annotation(READY_STATUS), Some("4/4"));
}

/// Status messages of a step are posted once even if the step reruns.
#[tokio::test]
async fn test_upgrade_status_posted_once() {
    let env = TestEnv::new();
    let vdb = VerticaDbBuilder::new("v").primary("pri", 1).build();
    let mut pass = env.pass(&vdb, Vec::new()).await;
    let mgr = UpgradeManager::new(UpgradeStrategy::Offline);

    mgr.post_next_status_msg(&env.ctx, &mut pass, &UPGRADE_MSGS, 0)
        .await
        .unwrap();
    mgr.post_next_status_msg(&env.ctx, &mut pass, &UPGRADE_MSGS, 1)
        .await
        .unwrap();
    let writes = env.state.vdb_write_count().await;

    // Rerunning earlier steps does not move the message back.
    mgr.post_next_status_msg(&env.ctx, &mut pass, &UPGRADE_MSGS, 0)
        .await
        .unwrap();
    mgr.post_next_status_msg(&env.ctx, &mut pass, &UPGRADE_MSGS, 1)
        .await
        .unwrap();

    assert_eq!(env.state.vdb_write_count().await, writes);
    let stored = env.state.get_vdb(NAMESPACE, "v").await.unwrap();
    assert_eq!(stored.upgrade_status(), "Rescheduling pods");
}

// ============================================================================
// Optimistic concurrency
// ============================================================================

#[tokio::test]
async fn test_status_write_retries_conflicts() {
    let env = TestEnv::new();
    let vdb = VerticaDbBuilder::new("v").primary("pri", 1).build();
    let mut pass = env.pass(&vdb, vec![up_fact(&vdb, "pri", 0)]).await;
    env.state.inject_vdb_conflicts(2).await;

    let directive = StatusActor.reconcile(&env.ctx, &mut pass).await.unwrap();

    assert_eq!(directive, Directive::Continue);
    assert_eq!(env.state.vdb_write_count().await, 2);
    let stored = env.state.get_vdb(NAMESPACE, "v").await.unwrap();
    assert_eq!(stored.annotation(READY_STATUS), Some("1/1"));
    assert_eq!(stored.status.unwrap().up_node_count, 1);
}

#[tokio::test]
async fn test_status_write_gives_up_after_repeated_conflicts() {
    let env = TestEnv::new();
    let vdb = VerticaDbBuilder::new("v").primary("pri", 1).build();
    let mut pass = env.pass(&vdb, vec![up_fact(&vdb, "pri", 0)]).await;
    env.state.inject_vdb_conflicts(100).await;

    let result = StatusActor.reconcile(&env.ctx, &mut pass).await;

    assert!(matches!(result, Err(Error::Conflict(_))));
    assert_eq!(env.state.vdb_write_count().await, 0);
}

/// The ready-status annotation follows nodes going down.
#[tokio::test]
async fn test_ready_status_tracks_down_nodes() {
    let env = TestEnv::new();
    let vdb = VerticaDbBuilder::new("v").primary("pri", 3).build();
    let mut down = up_fact(&vdb, "pri", 2);
    down.up_node = false;
    let mut pass = env
        .pass(&vdb, vec![up_fact(&vdb, "pri", 0), up_fact(&vdb, "pri", 1), down])
        .await;

    StatusActor.reconcile(&env.ctx, &mut pass).await.unwrap();

    let stored = env.state.get_vdb(NAMESPACE, "v").await.unwrap();
    assert_eq!(stored.annotation(READY_STATUS), Some("2/3"));
}

/// A pipeline pass over an already converged resource returns Continue and
/// performs no writes.
#[tokio::test]
async fn test_converged_pipeline_pass_writes_nothing() {
    let env = TestEnv::new();
    let vdb = VerticaDbBuilder::new("v").primary("pri", 1).build();
    let mut pass = env.pass(&vdb, vec![up_fact(&vdb, "pri", 0)]).await;
    let actors: Vec<Box<dyn Actor>> = vec![Box::new(StatusActor), Box::new(StatusActor)];

    run_pipeline(&actors, &env.ctx, &mut pass).await.unwrap();
    let writes = env.state.vdb_write_count().await;
    let directive = run_pipeline(&actors, &env.ctx, &mut pass).await.unwrap();

    assert_eq!(directive, Directive::Continue);
    assert_eq!(env.state.vdb_write_count().await, writes);
}
