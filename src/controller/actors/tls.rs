//! Rotate the certificates served by the HTTPS service and the node
//! management agents when `spec.nmaTLSSecret` changes.
//!
//! `status.tlsConfigs` records the secret in effect. The HTTPS half goes
//! first and is marked with its own condition so a resumed rotation skips
//! it. A failed rotation puts the old secret back into the spec.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::client::cluster_state::secret_value;
use crate::client::dispatcher::{CertBundle, RotateHttpsCertsOptions, RotateNmaCertsOptions};
use crate::controller::actor::{Actor, ActorContext, Directive, ReconcilePass};
use crate::controller::error::{Error, Result};
use crate::controller::events;
use crate::controller::status::{set_condition, update_vdb_status_with_retry, update_vdb_with_retry};
use crate::crd::{Condition, ConditionType, HTTPS_NMA_TLS, TlsConfigStatus};
use crate::podfacts::PodFact;

pub const TLS_KEY: &str = "tls.key";
pub const TLS_CERT: &str = "tls.crt";
pub const TLS_CA: &str = "ca.crt";

/// Server verifies client certificates when they are presented.
const TLS_MODE: &str = "TRY_VERIFY";

const ROTATION_REASON: &str = "RotationStarted";
const ROTATION_DONE_REASON: &str = "RotationFinished";

pub struct TlsCertRotationActor;

#[async_trait]
impl Actor for TlsCertRotationActor {
    fn name(&self) -> &'static str {
        "TlsCertRotation"
    }

    async fn reconcile(&self, ctx: &ActorContext, pass: &mut ReconcilePass) -> Result<Directive> {
        if !pass.config.uses_vclusterops()
            || !pass.pfacts.scope.is_main()
            || !pass.vdb.is_condition_true(ConditionType::DbInitialized)
        {
            return Ok(Directive::Continue);
        }
        let wanted = pass.vdb.spec.nma_tls_secret.clone().unwrap_or_default();
        if wanted.is_empty() {
            return Ok(Directive::Continue);
        }
        let current = match pass.vdb.tls_secret_in_use(HTTPS_NMA_TLS) {
            // The secret the database was set up with.
            None => {
                record_secret(ctx, pass, &wanted).await?;
                return Ok(Directive::Continue);
            }
            Some(current) if current == wanted => return Ok(Directive::Continue),
            Some(current) => current.to_string(),
        };

        let Some(bundle) = fetch_bundle(ctx, pass, &wanted).await? else {
            return Ok(Directive::requeue());
        };
        pass.collect(ctx).await?;
        let Some(initiator) = pass.pfacts.find_first_up_pod(false, None).map(|p| p.name.clone()) else {
            info!("no up nodes, requeue certificate rotation");
            return Ok(Directive::requeue());
        };

        if !pass.vdb.is_condition_true(ConditionType::HttpsCertRotationFinished) {
            ctx.normal(
                &pass.vdb,
                events::TLS_CERT_ROTATION_STARTED,
                format!("Starting to rotate certificates from '{current}' to '{wanted}'"),
            )
            .await;
            set_conditions(ctx, pass, &[(ConditionType::TlsCertRotationInProgress, true)]).await?;
            let opts = RotateHttpsCertsOptions {
                initiator: initiator.clone(),
                secret_name: wanted.clone(),
                bundle: bundle.clone(),
                tls_mode: TLS_MODE.to_string(),
            };
            if let Err(e) = ctx.dispatcher.rotate_https_certs(&opts).await {
                return self.fail(ctx, pass, &current, e).await;
            }
            set_conditions(ctx, pass, &[(ConditionType::HttpsCertRotationFinished, true)]).await?;
        }

        let hosts = pass
            .pfacts
            .filter_pods(|p| p.up_node)
            .into_iter()
            .map(PodFact::host)
            .collect();
        let opts = RotateNmaCertsOptions {
            initiator,
            hosts,
            bundle,
        };
        if let Err(e) = ctx.dispatcher.rotate_nma_certs(&opts).await {
            return self.fail(ctx, pass, &current, e).await;
        }

        record_secret(ctx, pass, &wanted).await?;
        set_conditions(
            ctx,
            pass,
            &[
                (ConditionType::TlsCertRotationInProgress, false),
                (ConditionType::HttpsCertRotationFinished, false),
            ],
        )
        .await?;
        ctx.normal(
            &pass.vdb,
            events::TLS_CERT_ROTATION_SUCCEEDED,
            format!("Successfully rotated certificates to '{wanted}'"),
        )
        .await;
        Ok(Directive::Continue)
    }
}

impl TlsCertRotationActor {
    /// Roll back to `previous` and surface the error.
    async fn fail(
        &self,
        ctx: &ActorContext,
        pass: &mut ReconcilePass,
        previous: &str,
        err: Error,
    ) -> Result<Directive> {
        warn!(error = %err, previous, "certificate rotation failed, rolling back");
        ctx.warning(
            &pass.vdb,
            events::TLS_CERT_ROTATION_FAILED,
            format!("Failed to rotate certificates, reverting to '{previous}'"),
        )
        .await;

        // HTTPS already serves the new certificate; put the old one back.
        if pass.vdb.is_condition_true(ConditionType::HttpsCertRotationFinished)
            && let Some(bundle) = fetch_bundle(ctx, pass, previous).await?
            && let Some(initiator) = pass.pfacts.find_first_up_pod(false, None).map(|p| p.name.clone())
        {
            let opts = RotateHttpsCertsOptions {
                initiator,
                secret_name: previous.to_string(),
                bundle,
                tls_mode: TLS_MODE.to_string(),
            };
            if let Err(e) = ctx.dispatcher.rotate_https_certs(&opts).await {
                warn!(error = %e, "could not restore the previous HTTPS certificate");
            }
        }

        let updated = update_vdb_with_retry(ctx.state.as_ref(), &pass.vdb, |v| {
            if v.spec.nma_tls_secret.as_deref() == Some(previous) {
                return false;
            }
            v.spec.nma_tls_secret = Some(previous.to_string());
            true
        })
        .await?;
        pass.set_vdb(updated);
        set_conditions(
            ctx,
            pass,
            &[
                (ConditionType::TlsCertRotationInProgress, false),
                (ConditionType::HttpsCertRotationFinished, false),
            ],
        )
        .await?;
        Err(err)
    }
}

/// Read the PEM bundle of a TLS secret. A missing secret or key is reported
/// with an event and yields `None`.
async fn fetch_bundle(ctx: &ActorContext, pass: &ReconcilePass, name: &str) -> Result<Option<CertBundle>> {
    let Some(secret) = ctx.state.get_secret(&pass.namespace(), name).await? else {
        ctx.warning(
            &pass.vdb,
            events::TLS_SECRET_NOT_FOUND,
            format!("Could not find the TLS secret '{name}'"),
        )
        .await;
        return Ok(None);
    };
    let value = |key| secret_value(&secret, key).filter(|v| !v.is_empty());
    match (value(TLS_KEY), value(TLS_CERT), value(TLS_CA)) {
        (Some(key), Some(cert), Some(ca)) => Ok(Some(CertBundle { key, cert, ca })),
        _ => {
            ctx.warning(
                &pass.vdb,
                events::TLS_SECRET_NOT_FOUND,
                format!("TLS secret '{name}' must hold {TLS_KEY}, {TLS_CERT} and {TLS_CA}"),
            )
            .await;
            Ok(None)
        }
    }
}

async fn record_secret(ctx: &ActorContext, pass: &mut ReconcilePass, secret: &str) -> Result<()> {
    let updated = update_vdb_status_with_retry(ctx.state.as_ref(), &pass.vdb, |v| {
        let configs = &mut v.status_mut().tls_configs;
        match configs.iter_mut().find(|c| c.name == HTTPS_NMA_TLS) {
            Some(c) if c.secret == secret => false,
            Some(c) => {
                c.secret = secret.to_string();
                true
            }
            None => {
                configs.push(TlsConfigStatus {
                    name: HTTPS_NMA_TLS.to_string(),
                    secret: secret.to_string(),
                });
                true
            }
        }
    })
    .await?;
    pass.set_vdb(updated);
    Ok(())
}

async fn set_conditions(
    ctx: &ActorContext,
    pass: &mut ReconcilePass,
    conditions: &[(ConditionType, bool)],
) -> Result<()> {
    let generation = pass.vdb.metadata.generation;
    let updated = update_vdb_status_with_retry(ctx.state.as_ref(), &pass.vdb, |v| {
        let mut changed = false;
        for (kind, on) in conditions {
            let reason = if *on { ROTATION_REASON } else { ROTATION_DONE_REASON };
            changed |= set_condition(v, Condition::new(*kind, *on, reason, "", generation));
        }
        changed
    })
    .await?;
    pass.set_vdb(updated);
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use k8s_openapi::ByteString;
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;
    use crate::client::DispatchCall;
    use crate::controller::actors::testing::{Harness, fact, vdb};
    use crate::crd::{Subcluster, SubclusterType, VerticaDB};

    fn initialized(spec_secret: &str, in_use: Option<&str>) -> VerticaDB {
        let mut v = vdb(&[], vec![Subcluster::new("sc", 2, SubclusterType::Primary)]);
        v.spec.nma_tls_secret = Some(spec_secret.into());
        let status = v.status_mut();
        status
            .conditions
            .push(Condition::new(ConditionType::DbInitialized, true, "Initialized", "", None));
        if let Some(secret) = in_use {
            status.tls_configs.push(TlsConfigStatus {
                name: HTTPS_NMA_TLS.into(),
                secret: secret.into(),
            });
        }
        v
    }

    async fn seed_cert(h: &Harness, name: &str) {
        let pem = |s: &str| ByteString(format!("-----{name} {s}-----").into_bytes());
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            data: Some(
                [
                    (TLS_KEY.to_string(), pem("key")),
                    (TLS_CERT.to_string(), pem("cert")),
                    (TLS_CA.to_string(), pem("ca")),
                ]
                .into(),
            ),
            ..Default::default()
        };
        h.state.put_secret("ns", &secret).await;
    }

    #[tokio::test]
    async fn test_first_pass_records_secret() {
        let h = Harness::new();
        let mut pass = h.pass(&initialized("cert-1", None), vec![fact("sc", 0)]).await;
        let d = TlsCertRotationActor.reconcile(&h.ctx, &mut pass).await.unwrap();
        assert_eq!(d, Directive::Continue);
        assert_eq!(pass.vdb.tls_secret_in_use(HTTPS_NMA_TLS), Some("cert-1"));
        assert!(h.dispatcher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_rotation_runs_https_then_nma() {
        let h = Harness::new();
        seed_cert(&h, "cert-2").await;
        let mut pass = h
            .pass(&initialized("cert-2", Some("cert-1")), vec![fact("sc", 0), fact("sc", 1)])
            .await;
        let d = TlsCertRotationActor.reconcile(&h.ctx, &mut pass).await.unwrap();
        assert_eq!(d, Directive::Continue);

        let calls = h.dispatcher.calls();
        let ops: Vec<_> = calls.iter().map(DispatchCall::op).collect();
        assert_eq!(ops, vec!["rotate_https_certs", "rotate_nma_certs"]);
        let DispatchCall::RotateHttpsCerts(https) = &calls[0] else {
            panic!("expected an HTTPS rotation");
        };
        assert_eq!(https.tls_mode, "TRY_VERIFY");
        assert_eq!(https.bundle.cert, "-----cert-2 cert-----");
        let DispatchCall::RotateNmaCerts(nma) = &calls[1] else {
            panic!("expected an NMA rotation");
        };
        assert_eq!(nma.hosts.len(), 2);

        assert_eq!(pass.vdb.tls_secret_in_use(HTTPS_NMA_TLS), Some("cert-2"));
        assert!(!pass.vdb.is_condition_true(ConditionType::TlsCertRotationInProgress));
        assert!(!pass.vdb.is_condition_true(ConditionType::HttpsCertRotationFinished));
        assert!(h.events.has_reason(events::TLS_CERT_ROTATION_STARTED));
        assert!(h.events.has_reason(events::TLS_CERT_ROTATION_SUCCEEDED));
    }

    #[tokio::test]
    async fn test_resumed_rotation_skips_https() {
        let h = Harness::new();
        seed_cert(&h, "cert-2").await;
        let mut v = initialized("cert-2", Some("cert-1"));
        v.status_mut().conditions.push(Condition::new(
            ConditionType::HttpsCertRotationFinished,
            true,
            ROTATION_REASON,
            "",
            None,
        ));
        let mut pass = h.pass(&v, vec![fact("sc", 0)]).await;
        TlsCertRotationActor.reconcile(&h.ctx, &mut pass).await.unwrap();
        let calls = h.dispatcher.calls();
        let ops: Vec<_> = calls.iter().map(DispatchCall::op).collect();
        assert_eq!(ops, vec!["rotate_nma_certs"]);
        assert_eq!(pass.vdb.tls_secret_in_use(HTTPS_NMA_TLS), Some("cert-2"));
    }

    #[tokio::test]
    async fn test_missing_secret_requeues() {
        let h = Harness::new();
        let mut pass = h
            .pass(&initialized("gone", Some("cert-1")), vec![fact("sc", 0)])
            .await;
        let d = TlsCertRotationActor.reconcile(&h.ctx, &mut pass).await.unwrap();
        assert_eq!(d, Directive::requeue());
        assert!(h.events.has_reason(events::TLS_SECRET_NOT_FOUND));
        assert_eq!(pass.vdb.tls_secret_in_use(HTTPS_NMA_TLS), Some("cert-1"));
    }

    #[tokio::test]
    async fn test_failed_rotation_rolls_back_spec() {
        let h = Harness::new();
        seed_cert(&h, "cert-1").await;
        seed_cert(&h, "cert-2").await;
        h.dispatcher.fail_op("rotate_nma_certs", "agent unreachable");
        let mut pass = h
            .pass(&initialized("cert-2", Some("cert-1")), vec![fact("sc", 0)])
            .await;
        let res = TlsCertRotationActor.reconcile(&h.ctx, &mut pass).await;
        assert!(res.is_err());
        assert!(h.events.has_reason(events::TLS_CERT_ROTATION_FAILED));
        assert_eq!(pass.vdb.spec.nma_tls_secret.as_deref(), Some("cert-1"));
        assert_eq!(pass.vdb.tls_secret_in_use(HTTPS_NMA_TLS), Some("cert-1"));
        assert!(!pass.vdb.is_condition_true(ConditionType::TlsCertRotationInProgress));

        // HTTPS was rotated forward, then back to the old certificate.
        let https = h.dispatcher.calls_named("rotate_https_certs");
        assert_eq!(https.len(), 2);
        let DispatchCall::RotateHttpsCerts(restore) = &https[1] else {
            panic!("expected an HTTPS rotation");
        };
        assert_eq!(restore.secret_name, "cert-1");
    }
}
