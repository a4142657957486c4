//! Rotate the superuser password when the password secret changes.
//!
//! The status records which secret is in effect. Until the rotation
//! succeeds the old secret keeps being used to connect.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::client::cluster_state::secret_value;
use crate::client::dispatcher::sql_quote;
use crate::controller::actor::{Actor, ActorContext, Directive, ReconcilePass};
use crate::controller::error::Result;
use crate::controller::events;
use crate::controller::status::update_vdb_status_with_retry;
use crate::crd::annotations::{SERVER_CONTAINER, SUPERUSER_PASSWORD_KEY};
use crate::crd::ConditionType;

pub struct PasswordSecretActor;

#[async_trait]
impl Actor for PasswordSecretActor {
    fn name(&self) -> &'static str {
        "PasswordSecret"
    }

    async fn reconcile(&self, ctx: &ActorContext, pass: &mut ReconcilePass) -> Result<Directive> {
        if !pass.vdb.is_condition_true(ConditionType::DbInitialized) {
            return Ok(Directive::Continue);
        }
        let wanted = pass.vdb.spec.password_secret.clone().unwrap_or_default();
        let current = pass
            .vdb
            .status
            .as_ref()
            .and_then(|s| s.password_secret.clone());
        match current {
            // First pass after the database exists: the spec secret is in effect.
            None => return self.record(ctx, pass, wanted).await,
            Some(current) if current == wanted => return Ok(Directive::Continue),
            Some(_) => {}
        }

        let password = if wanted.is_empty() {
            String::new()
        } else {
            let Some(secret) = ctx.state.get_secret(&pass.namespace(), &wanted).await? else {
                ctx.warning(
                    &pass.vdb,
                    events::SUPERUSER_PASSWORD_SECRET_NOT_FOUND,
                    format!("Could not find the password secret '{wanted}'"),
                )
                .await;
                return Ok(Directive::requeue());
            };
            secret_value(&secret, SUPERUSER_PASSWORD_KEY).unwrap_or_default()
        };

        pass.collect(ctx).await?;
        let Some(initiator) = pass.pfacts.find_first_up_pod(false, None).map(|p| p.name.clone()) else {
            info!("no up nodes, requeue password rotation");
            return Ok(Directive::requeue());
        };
        let sql = format!(
            "ALTER USER {} IDENTIFIED BY '{}';",
            pass.config.superuser,
            sql_quote(&password)
        );
        if let Err(e) = ctx.runner.exec_vsql(&initiator, SERVER_CONTAINER, &sql).await {
            warn!(error = %e, "failed to update superuser password");
            ctx.warning(
                &pass.vdb,
                events::SUPERUSER_PASSWORD_UPDATE_FAILED,
                "Superuser password update failed",
            )
            .await;
            return Err(e);
        }
        ctx.normal(
            &pass.vdb,
            events::SUPERUSER_PASSWORD_UPDATED,
            "Superuser password update succeeded",
        )
        .await;
        self.record(ctx, pass, wanted).await
    }
}

impl PasswordSecretActor {
    async fn record(&self, ctx: &ActorContext, pass: &mut ReconcilePass, secret: String) -> Result<Directive> {
        let updated = update_vdb_status_with_retry(ctx.state.as_ref(), &pass.vdb, |v| {
            let status = v.status_mut();
            if status.password_secret.as_ref() == Some(&secret) {
                return false;
            }
            status.password_secret = Some(secret.clone());
            true
        })
        .await?;
        pass.set_vdb(updated);
        Ok(Directive::Continue)
    }
}
