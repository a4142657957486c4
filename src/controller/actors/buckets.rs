//! Configure access to object store buckets beyond the communal one.
//!
//! The buckets last applied are copied into the status so the SQL only runs
//! when the spec changes.

use async_trait::async_trait;
use serde_json::{Map, json};
use tracing::{info, warn};

use crate::client::cluster_state::secret_value;
use crate::client::dispatcher::sql_quote;
use crate::client::parsing::{endpoint_host_port, endpoint_protocol};
use crate::controller::actor::{Actor, ActorContext, Directive, ReconcilePass};
use crate::controller::error::{Error, Result};
use crate::controller::events;
use crate::controller::status::update_vdb_status_with_retry;
use crate::crd::annotations::SERVER_CONTAINER;
use crate::crd::{CommunalStorage, VerticaDB};

const ACCESS_KEY: &str = "accesskey";
const SECRET_KEY: &str = "secretkey";
const AZURE_ACCOUNT_NAME: &str = "accountName";
const AZURE_BLOB_ENDPOINT: &str = "blobEndpoint";
const AZURE_ACCOUNT_KEY: &str = "accountKey";
const AZURE_SAS: &str = "sharedAccessSignature";

/// True when the status records exactly the buckets of the spec.
pub fn status_matches_spec(vdb: &VerticaDB) -> bool {
    let applied = vdb
        .status
        .as_ref()
        .and_then(|s| s.additional_buckets.as_deref())
        .unwrap_or_default();
    applied == vdb.spec.additional_buckets.as_slice()
}

/// Why statements could not be built for a bucket.
enum CredsProblem {
    SecretMissing(String),
    WrongKey(String),
}

pub struct AdditionalBucketsActor;

#[async_trait]
impl Actor for AdditionalBucketsActor {
    fn name(&self) -> &'static str {
        "AdditionalBuckets"
    }

    async fn reconcile(&self, ctx: &ActorContext, pass: &mut ReconcilePass) -> Result<Directive> {
        if status_matches_spec(&pass.vdb) {
            return Ok(Directive::Continue);
        }
        pass.collect(ctx).await?;
        if !pass.pfacts.does_db_exist() {
            return Ok(Directive::Continue);
        }
        let Some(initiator) = pass.pfacts.find_first_up_pod(false, None).map(|p| p.name.clone()) else {
            info!("no up pod to configure buckets from, requeue");
            return Ok(Directive::requeue());
        };

        let mut sql = String::new();
        for bucket in &pass.vdb.spec.additional_buckets {
            match bucket_statements(ctx, pass, bucket).await? {
                Ok(stmts) => sql.push_str(&stmts),
                Err(CredsProblem::SecretMissing(name)) => {
                    info!(secret = %name, "bucket credential secret not found, requeue");
                    return Ok(Directive::requeue());
                }
                Err(CredsProblem::WrongKey(message)) => {
                    ctx.warning(&pass.vdb, events::COMMUNAL_CREDS_WRONG_KEY, message).await;
                    return Ok(Directive::requeue());
                }
            }
        }

        if !sql.is_empty() {
            match ctx.runner.exec_vsql(&initiator, SERVER_CONTAINER, &sql).await {
                Ok(_) => {}
                Err(e @ Error::Exec { .. }) => {
                    warn!(error = %e, "failed to configure additional buckets");
                    return Ok(Directive::requeue());
                }
                Err(e) => return Err(e),
            }
        }

        let wanted = pass.vdb.spec.additional_buckets.clone();
        let updated = update_vdb_status_with_retry(ctx.state.as_ref(), &pass.vdb, |v| {
            let status = v.status_mut();
            if status.additional_buckets.as_ref() == Some(&wanted) {
                return false;
            }
            status.additional_buckets = Some(wanted.clone());
            true
        })
        .await?;
        pass.set_vdb(updated);
        ctx.normal(
            &pass.vdb,
            events::ADDITIONAL_BUCKETS_UPDATED,
            format!(
                "Configured {} additional bucket(s)",
                pass.vdb.spec.additional_buckets.len()
            ),
        )
        .await;
        Ok(Directive::Continue)
    }
}

async fn bucket_statements(
    ctx: &ActorContext,
    pass: &ReconcilePass,
    bucket: &CommunalStorage,
) -> Result<std::result::Result<String, CredsProblem>> {
    let name = &bucket.credential_secret;
    let Some(secret) = ctx.state.get_secret(&pass.namespace(), name).await? else {
        return Ok(Err(CredsProblem::SecretMissing(name.clone())));
    };
    let key = |k: &str| secret_value(&secret, k);
    let wrong_key = |k: &str| {
        CredsProblem::WrongKey(format!(
            "The credential secret '{name}' does not have a key named '{k}'"
        ))
    };

    if bucket.is_s3() || bucket.is_gcloud() {
        let Some(access) = key(ACCESS_KEY) else {
            return Ok(Err(wrong_key(ACCESS_KEY)));
        };
        let Some(secret_key) = key(SECRET_KEY) else {
            return Ok(Err(wrong_key(SECRET_KEY)));
        };
        if bucket.is_gcloud() {
            return Ok(Ok(format!(
                "ALTER DATABASE default SET GCSAuth = '{}:{}';",
                sql_quote(&access),
                sql_quote(&secret_key)
            )));
        }
        let config = json!([{
            "bucket": bucket.bucket(),
            "region": bucket.region,
            "protocol": endpoint_protocol(&bucket.endpoint),
            "endpoint": endpoint_host_port(&bucket.endpoint),
        }]);
        let creds = json!([{
            "bucket": bucket.bucket(),
            "accessKey": access,
            "secretAccessKey": secret_key,
        }]);
        return Ok(Ok(format!(
            "ALTER DATABASE default SET S3BucketConfig = '{}';\
             ALTER DATABASE default SET S3BucketCredentials = '{}';",
            sql_quote(&config.to_string()),
            sql_quote(&creds.to_string())
        )));
    }

    if bucket.is_azure() {
        let account = key(AZURE_ACCOUNT_NAME);
        let endpoint_raw = key(AZURE_BLOB_ENDPOINT);
        if account.is_none() && endpoint_raw.is_none() {
            return Ok(Err(CredsProblem::WrongKey(format!(
                "The credential secret '{name}' is not setup properly for azure.  \
                 It must have one '{AZURE_ACCOUNT_NAME}' or '{AZURE_BLOB_ENDPOINT}'"
            ))));
        }
        let account_key = key(AZURE_ACCOUNT_KEY);
        let sas = key(AZURE_SAS);
        if account_key.is_some() && sas.is_some() {
            return Ok(Err(CredsProblem::WrongKey(format!(
                "The credential secret '{name}' is not setup properly for azure.  \
                 It cannot have both '{AZURE_ACCOUNT_KEY}' and '{AZURE_SAS}'"
            ))));
        }
        let account = account.unwrap_or_default();
        let endpoint_raw = endpoint_raw.unwrap_or_default();
        let mut cred = Map::new();
        cred.insert("accountName".into(), json!(account));
        if let Some(k) = account_key {
            cred.insert("accountKey".into(), json!(k));
        }
        if let Some(s) = sas {
            cred.insert("sharedAccessSignature".into(), json!(s));
        }
        let endpoint = json!([{
            "accountName": account,
            "blobEndpoint": endpoint_host_port(&endpoint_raw),
            "protocol": endpoint_protocol(&endpoint_raw),
        }]);
        return Ok(Ok(format!(
            "ALTER DATABASE default SET AzureStorageCredentials = '{}';\
             ALTER DATABASE default SET AzureStorageEndpointConfig = '{}';",
            sql_quote(&json!([cred]).to_string()),
            sql_quote(&endpoint.to_string())
        )));
    }

    warn!(path = %bucket.path, "unrecognized bucket scheme, skipping");
    Ok(Ok(String::new()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use k8s_openapi::ByteString;
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;
    use crate::controller::actors::testing::{Harness, fact, vdb};
    use crate::crd::{Subcluster, SubclusterType};

    fn bucket(path: &str, secret: &str) -> CommunalStorage {
        CommunalStorage {
            path: path.into(),
            endpoint: "https://minio:9000".into(),
            region: "us-east-1".into(),
            credential_secret: secret.into(),
        }
    }

    fn with_buckets(buckets: Vec<CommunalStorage>) -> VerticaDB {
        let mut v = vdb(&[], vec![Subcluster::new("sc", 1, SubclusterType::Primary)]);
        v.spec.additional_buckets = buckets;
        v
    }

    async fn seed_secret(h: &Harness, name: &str, keys: &[(&str, &str)]) {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            data: Some(
                keys.iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Default::default()
        };
        h.state.put_secret("ns", &secret).await;
    }

    #[test]
    fn test_status_matches_spec_on_any_field() {
        let mut v = with_buckets(vec![bucket("s3://extra/data", "creds")]);
        assert!(!status_matches_spec(&v));
        v.status_mut().additional_buckets = Some(v.spec.additional_buckets.clone());
        assert!(status_matches_spec(&v));
        v.spec.additional_buckets[0].region = "eu-west-1".into();
        assert!(!status_matches_spec(&v));
    }

    #[test]
    fn test_no_buckets_matches_empty_status() {
        assert!(status_matches_spec(&with_buckets(vec![])));
    }

    #[tokio::test]
    async fn test_s3_bucket_is_configured_and_recorded() {
        let h = Harness::new();
        seed_secret(&h, "creds", &[(ACCESS_KEY, "ak"), (SECRET_KEY, "sk")]).await;
        let v = with_buckets(vec![bucket("s3://extra/data", "creds")]);
        let mut pass = h.pass(&v, vec![fact("sc", 0)]).await;

        let d = AdditionalBucketsActor.reconcile(&h.ctx, &mut pass).await.unwrap();
        assert_eq!(d, Directive::Continue);
        let calls = h.runner.calls_matching("S3BucketCredentials");
        assert_eq!(calls.len(), 1);
        assert!(calls[0].command_line().contains("\"bucket\":\"extra\""));
        assert!(status_matches_spec(&pass.vdb));
        assert!(h.events.has_reason(events::ADDITIONAL_BUCKETS_UPDATED));

        AdditionalBucketsActor.reconcile(&h.ctx, &mut pass).await.unwrap();
        assert_eq!(h.runner.calls_matching("S3BucketCredentials").len(), 1);
    }

    #[tokio::test]
    async fn test_missing_key_requeues_with_event() {
        let h = Harness::new();
        seed_secret(&h, "creds", &[(ACCESS_KEY, "ak")]).await;
        let v = with_buckets(vec![bucket("gs://extra", "creds")]);
        let mut pass = h.pass(&v, vec![fact("sc", 0)]).await;
        let d = AdditionalBucketsActor.reconcile(&h.ctx, &mut pass).await.unwrap();
        assert_eq!(d, Directive::requeue());
        assert!(h.events.has_reason(events::COMMUNAL_CREDS_WRONG_KEY));
        assert!(!status_matches_spec(&pass.vdb));
    }

    #[tokio::test]
    async fn test_azure_rejects_key_and_sas_together() {
        let h = Harness::new();
        seed_secret(
            &h,
            "az",
            &[(AZURE_ACCOUNT_NAME, "acct"), (AZURE_ACCOUNT_KEY, "k"), (AZURE_SAS, "s")],
        )
        .await;
        let v = with_buckets(vec![bucket("azb://acct/container", "az")]);
        let mut pass = h.pass(&v, vec![fact("sc", 0)]).await;
        let d = AdditionalBucketsActor.reconcile(&h.ctx, &mut pass).await.unwrap();
        assert_eq!(d, Directive::requeue());
        assert!(h.events.has_reason(events::COMMUNAL_CREDS_WRONG_KEY));
    }

    #[tokio::test]
    async fn test_missing_secret_requeues_quietly() {
        let h = Harness::new();
        let v = with_buckets(vec![bucket("s3://extra", "nope")]);
        let mut pass = h.pass(&v, vec![fact("sc", 0)]).await;
        let d = AdditionalBucketsActor.reconcile(&h.ctx, &mut pass).await.unwrap();
        assert_eq!(d, Directive::requeue());
        assert!(h.events.events().is_empty());
    }
}
