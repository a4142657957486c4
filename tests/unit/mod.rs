//! Unit tests for vertica-operator.
//!
//! These tests run without a Kubernetes cluster and test individual
//! components in isolation through the public API.

// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

#[path = "../common/mod.rs"]
mod common;

mod crd_tests {
    use std::collections::BTreeMap;

    use super::common::VerticaDbBuilder;
    use vertica_operator::crd::{
        ClusterScope, CommunalStorage, Condition, ConditionType, SubclusterSelection,
    };
    use vertica_operator::crd::{Subcluster, SubclusterType};

    #[test]
    fn test_condition_new() {
        let c = Condition::new(ConditionType::DbInitialized, true, "Created", "done", Some(2));
        assert_eq!(c.r#type, "DBInitialized");
        assert_eq!(c.status, "True");
        assert!(c.is_true());
        assert_eq!(c.observed_generation, Some(2));

        let c = Condition::new(ConditionType::UpgradeInProgress, false, "Idle", "", None);
        assert_eq!(c.status, "False");
        assert!(!c.is_true());
    }

    #[test]
    fn test_is_condition_true() {
        let vdb = VerticaDbBuilder::new("vdb").primary("pri", 3).initialized().build();
        assert!(vdb.is_condition_true(ConditionType::DbInitialized));
        assert!(!vdb.is_condition_true(ConditionType::UpgradeInProgress));
    }

    #[test]
    fn test_communal_storage_schemes() {
        let s3 = CommunalStorage {
            path: "s3://bucket/prefix/db".into(),
            ..Default::default()
        };
        assert!(s3.is_s3());
        assert!(!s3.is_gcloud());
        assert_eq!(s3.bucket(), "bucket");

        let gcs = CommunalStorage {
            path: "gs://other".into(),
            ..Default::default()
        };
        assert!(gcs.is_gcloud());
        assert_eq!(gcs.bucket(), "other");

        let azure = CommunalStorage {
            path: "azb://account/container".into(),
            ..Default::default()
        };
        assert!(azure.is_azure());
    }

    #[test]
    fn test_eon_mode_follows_communal_path() {
        assert!(!VerticaDbBuilder::new("vdb").primary("pri", 3).build().is_eon());
        assert!(
            VerticaDbBuilder::new("vdb")
                .primary("pri", 3)
                .eon("s3://bucket/db")
                .build()
                .is_eon()
        );
    }

    #[test]
    fn test_merge_annotations_reports_change() {
        let mut vdb = VerticaDbBuilder::new("vdb").vclusterops("v24.2.0-0").build();
        let same: BTreeMap<String, String> = [(
            vertica_operator::crd::annotations::VERSION.to_string(),
            "v24.2.0-0".to_string(),
        )]
        .into();
        assert!(!vdb.merge_annotations(&same));
        let newer: BTreeMap<String, String> = [(
            vertica_operator::crd::annotations::VERSION.to_string(),
            "v24.3.0-0".to_string(),
        )]
        .into();
        assert!(vdb.merge_annotations(&newer));
        assert_eq!(
            vdb.annotation(vertica_operator::crd::annotations::VERSION),
            Some("v24.3.0-0")
        );
    }

    #[test]
    fn test_transient_subcluster_from_template() {
        let mut vdb = VerticaDbBuilder::new("vdb")
            .primary("pri", 3)
            .secondary("sec", 2)
            .build();
        assert!(!vdb.requires_transient_subcluster());

        vdb.spec.temporary_subcluster_routing = Some(SubclusterSelection {
            template: Some(Subcluster::new("transient", 1, SubclusterType::Secondary)),
            ..Default::default()
        });
        assert!(vdb.requires_transient_subcluster());
        let sc = vdb.build_transient_subcluster("vertica:old").unwrap();
        assert!(sc.is_transient());
        assert_eq!(sc.image_override.as_deref(), Some("vertica:old"));
        assert_eq!(sc.size, 1);
    }

    #[test]
    fn test_main_cluster_scope_holds_unsandboxed_subclusters() {
        let vdb = VerticaDbBuilder::new("vdb")
            .primary("pri", 3)
            .secondary("sec", 2)
            .build();
        assert_eq!(vdb.scope_of_subcluster("sec"), ClusterScope::MainCluster);
        let names: Vec<_> = vdb
            .subclusters_in_scope(&ClusterScope::MainCluster)
            .iter()
            .map(|sc| sc.name.clone())
            .collect();
        assert_eq!(names, vec!["pri", "sec"]);
    }
}

mod version_tests {
    use vertica_operator::crd::annotations::{BUILD_DATE, BUILD_REF, VERSION};
    use vertica_operator::crd::version::{VersionInfo, parse_version_output};

    #[test]
    fn test_parse_and_compare() {
        let v = VersionInfo::parse("v24.3.0-2").unwrap();
        assert_eq!(v.hotfix, 2);
        assert!(v.is_equal_or_newer("v24.3.0"));
        assert!(v.is_equal_or_newer_with_hotfix("v24.3.0-2"));
        assert!(!v.is_equal_or_newer_with_hotfix("v24.3.0-3"));
        assert!(v.is_older("v24.4.0"));
        assert!(VersionInfo::parse("latest").is_none());
    }

    #[test]
    fn test_minimum_supported() {
        assert!(VersionInfo::parse("v11.0.1").unwrap().is_supported());
        assert!(!VersionInfo::parse("v10.1.1-0").unwrap().is_supported());
    }

    #[test]
    fn test_upgrade_paths() {
        let v = VersionInfo::parse("v11.0.1").unwrap();
        assert!(v.is_valid_upgrade_path("v11.0.1").is_ok());
        assert!(v.is_valid_upgrade_path("v11.0.2").is_ok());
        assert!(v.is_valid_upgrade_path("v11.1.0").is_ok());
        assert!(v.is_valid_upgrade_path("v12.0.0").unwrap_err().contains("skips"));

        let v = VersionInfo::parse("v12.0.4").unwrap();
        assert!(v.is_valid_upgrade_path("v12.0.1").unwrap_err().contains("downgrade"));
        assert!(v.is_valid_upgrade_path("v24.1.0").is_ok());
    }

    #[test]
    fn test_parse_version_output() {
        let out = "Vertica Analytic Database v11.0.0-20210601\n\
                   vertica(v11.0.0-20210601) built by @re-docker2 from master@da8f0e9 on 'Tue Jun  1 05:04:35 2021' $BuildId$\n";
        let found = parse_version_output(out);
        assert_eq!(found.get(VERSION).map(String::as_str), Some("v11.0.0-20210601"));
        assert_eq!(found.get(BUILD_REF).map(String::as_str), Some("da8f0e9"));
        assert_eq!(
            found.get(BUILD_DATE).map(String::as_str),
            Some("Tue Jun  1 05:04:35 2021")
        );
    }
}

mod parsing_tests {
    use vertica_operator::client::parsing::{
        ParseError, parse_count, parse_depot_details, parse_node_state,
    };

    #[test]
    fn test_node_state_up_and_read_only() {
        let state = parse_node_state("v_db_node0001|UP|123456|t").unwrap().unwrap();
        assert!(state.up);
        assert!(state.read_only);
        assert_eq!(state.subcluster_oid, "123456");
        assert!(state.sandbox.is_empty());
    }

    #[test]
    fn test_empty_output_is_no_data() {
        assert_eq!(parse_node_state("").unwrap(), None);
        assert_eq!(parse_count("\n").unwrap(), None);
        assert_eq!(parse_depot_details("").unwrap(), None);
    }

    #[test]
    fn test_malformed_output_is_an_error() {
        assert!(matches!(
            parse_node_state("v_db_node0001|UP"),
            Err(ParseError::ColumnCount {
                expected: 3,
                found: 2,
                ..
            })
        ));
        assert!(parse_count("many").is_err());
    }

    #[test]
    fn test_count() {
        assert_eq!(parse_count("7\n").unwrap(), Some(7));
    }
}

mod config_tests {
    use std::time::Duration;

    use super::common::VerticaDbBuilder;
    use vertica_operator::controller::config::{DeploymentMode, PassConfig};
    use vertica_operator::crd::annotations::{REQUEUE_TIME, RUN_NMA_IN_SIDECAR, SUPERUSER_NAME};

    #[test]
    fn test_admintools_deployment() {
        let cfg = PassConfig::from_vdb(&VerticaDbBuilder::new("vdb").admintools("v12.0.4-0").build());
        assert_eq!(cfg.deployment, DeploymentMode::Admintools);
        assert!(!cfg.uses_vclusterops());
        assert!(!cfg.nma_sidecar);
    }

    #[test]
    fn test_annotation_overrides() {
        let vdb = VerticaDbBuilder::new("vdb")
            .vclusterops("v24.3.0-0")
            .annotation(RUN_NMA_IN_SIDECAR, "false")
            .annotation(REQUEUE_TIME, "12")
            .annotation(SUPERUSER_NAME, "admin")
            .build();
        let cfg = PassConfig::from_vdb(&vdb);
        assert!(cfg.uses_vclusterops());
        assert!(!cfg.nma_sidecar);
        assert_eq!(cfg.requeue_time, Some(Duration::from_secs(12)));
        assert_eq!(cfg.superuser, "admin");
        assert!(cfg.version_at_least("v24.3.0"));
    }
}

mod upgrade_tests {
    use super::common::VerticaDbBuilder;
    use vertica_operator::controller::config::PassConfig;
    use vertica_operator::controller::upgrade_manager::{
        UpgradeManager, UpgradeStrategy, next_status_msg,
    };
    use vertica_operator::crd::{ConditionType, UpgradePolicy};

    const MSGS: [&str; 3] = ["Shutting down", "Rescheduling", "Restarting"];

    #[test]
    fn test_fetch_old_image() {
        let mgr = UpgradeManager::new(UpgradeStrategy::Offline)
            .with_primary_images(vec!["v1".into(), "v2".into()]);
        assert_eq!(mgr.fetch_old_image("v2"), Some("v1"));
        assert_eq!(mgr.fetch_old_image("v1"), Some("v2"));

        let settled = UpgradeManager::new(UpgradeStrategy::Offline)
            .with_primary_images(vec!["v2".into()]);
        assert_eq!(settled.fetch_old_image("v2"), None);
    }

    #[test]
    fn test_next_status_msg() {
        assert_eq!(next_status_msg("", &MSGS, 0).unwrap(), Some("Shutting down"));
        assert_eq!(next_status_msg("Shutting down", &MSGS, 0).unwrap(), None);
        assert_eq!(next_status_msg("Shutting down", &MSGS, 2).unwrap(), Some("Restarting"));
        assert_eq!(next_status_msg("Restarting", &MSGS, 1).unwrap(), None);
        assert_eq!(next_status_msg("Restarting", &MSGS, 2).unwrap(), None);
        assert!(next_status_msg("", &MSGS, 3).is_err());
    }

    #[test]
    fn test_strategy_selection() {
        let offline = VerticaDbBuilder::new("vdb").admintools("v12.0.4-0").build();
        let mut explicit = offline.clone();
        explicit.spec.upgrade_policy = UpgradePolicy::Offline;
        assert_eq!(
            UpgradeStrategy::select(&explicit, &PassConfig::from_vdb(&explicit)),
            UpgradeStrategy::Offline
        );
        assert_eq!(
            UpgradeStrategy::select(&offline, &PassConfig::from_vdb(&offline)),
            UpgradeStrategy::ReadOnlyOnline
        );

        let online = VerticaDbBuilder::new("vdb").vclusterops("v24.3.0-2").build();
        assert_eq!(
            UpgradeStrategy::select(&online, &PassConfig::from_vdb(&online)),
            UpgradeStrategy::Replicated
        );
        assert_eq!(
            UpgradeStrategy::Replicated.condition(),
            ConditionType::OnlineUpgradeInProgress
        );

        let unknown = VerticaDbBuilder::new("vdb").build();
        assert_eq!(
            UpgradeStrategy::select(&unknown, &PassConfig::from_vdb(&unknown)),
            UpgradeStrategy::Offline
        );
    }
}

mod bucket_tests {
    use super::common::VerticaDbBuilder;
    use vertica_operator::controller::actors::buckets::status_matches_spec;
    use vertica_operator::crd::CommunalStorage;

    fn bucket() -> CommunalStorage {
        CommunalStorage {
            path: "s3://extra/data".into(),
            endpoint: "https://s3.example.com".into(),
            region: "us-east-1".into(),
            credential_secret: "s3-creds".into(),
        }
    }

    #[test]
    fn test_any_field_difference_is_a_mismatch() {
        let mut vdb = VerticaDbBuilder::new("vdb")
            .additional_bucket(bucket())
            .build();
        assert!(!status_matches_spec(&vdb));
        vdb.status_mut().additional_buckets = Some(vec![bucket()]);
        assert!(status_matches_spec(&vdb));

        let variants: [fn(&mut CommunalStorage); 4] = [
            |b| b.path = "s3://other/data".into(),
            |b| b.region = "eu-west-1".into(),
            |b| b.endpoint = "https://minio:9000".into(),
            |b| b.credential_secret = "rotated".into(),
        ];
        for change in variants {
            let mut changed = bucket();
            change(&mut changed);
            vdb.status_mut().additional_buckets = Some(vec![changed]);
            assert!(!status_matches_spec(&vdb));
        }
    }

    #[test]
    fn test_no_buckets_anywhere_matches() {
        assert!(status_matches_spec(&VerticaDbBuilder::new("vdb").build()));
    }
}

mod error_tests {
    use std::time::Duration;

    use vertica_operator::controller::error::{Error, api_error};

    #[test]
    fn test_retry_classification() {
        assert!(api_error(409, "Conflict", "stale").is_retryable());
        assert!(api_error(503, "Unavailable", "busy").is_retryable());
        assert!(!api_error(400, "BadRequest", "nope").is_retryable());
        assert!(api_error(404, "NotFound", "gone").is_not_found());
        assert_eq!(
            Error::Validation("bad image".into()).requeue_after(),
            Duration::from_secs(300)
        );
        assert_eq!(
            Error::Dispatch {
                op: "add_node".into(),
                message: "timeout".into()
            }
            .requeue_after(),
            Duration::from_secs(30)
        );
    }
}

mod pipeline_tests {
    use vertica_operator::controller::Actor;
    use vertica_operator::controller::pipeline::build_actors;

    #[test]
    fn test_actor_order() {
        let names: Vec<_> = build_actors().iter().map(|a| a.name()).collect();
        let position = |name: &str| names.iter().position(|n| *n == name).unwrap();
        assert!(position("ObjReconciler(CreateOnly)") < position("ObjReconciler(All)"));
        assert!(position("ObjReconciler(All)") < position("Install"));
        assert!(position("Install") < position("CreateDb"));
        assert!(position("CreateDb") < position("DbAddSubcluster"));
        assert!(position("DbAddNode") < position("RebalanceShards"));
        assert_eq!(names.last(), Some(&"CrashLoop"));
    }
}

mod finder_tests {
    use vertica_operator::controller::finder::FindFlags;

    #[test]
    fn test_flag_algebra() {
        assert!(FindFlags::ALL.contains(FindFlags::IN_VDB));
        assert!(FindFlags::ALL.contains(FindFlags::NOT_IN_VDB));
        assert!(!FindFlags::ALL.contains(FindFlags::EXISTING));
        assert!((FindFlags::ALL | FindFlags::SORTED).contains(FindFlags::SORTED));
    }
}
