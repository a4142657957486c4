//! Status management utilities.
//!
//! Provides helpers for building conditions and for writing the VerticaDB.
//! Every write of the custom resource, spec or status, goes through
//! [`update_vdb_with_retry`] or [`update_vdb_status_with_retry`]: read the
//! latest copy, apply the mutation, replace with its resource version, and
//! start over on a conflict.

use tracing::debug;

use super::error::{Error, Result};
use crate::client::ClusterState;
use crate::crd::{Condition, ConditionType, VerticaDB};

/// Attempts made before a conflicting update is reported as an error.
pub const MAX_UPDATE_ATTEMPTS: usize = 5;

/// Builder for managing conditions list
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
}

impl ConditionBuilder {
    /// Create a new condition builder
    pub fn new() -> Self {
        Self {
            conditions: Vec::new(),
        }
    }

    /// Start from an existing conditions list
    pub fn from_conditions(conditions: &[Condition]) -> Self {
        Self {
            conditions: conditions.to_vec(),
        }
    }

    /// Add or update a condition
    pub fn set(&mut self, condition: Condition) -> &mut Self {
        // Find and replace existing condition of same type
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.r#type == condition.r#type)
        {
            // Keep the transition time when only the message changed
            if existing.status == condition.status {
                let time = existing.last_transition_time.clone();
                *existing = condition;
                existing.last_transition_time = time;
            } else {
                *existing = condition;
            }
        } else {
            self.conditions.push(condition);
        }
        self
    }

    /// Build the conditions list
    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

impl Default for ConditionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Check if a condition type is true
pub fn is_condition_true(conditions: &[Condition], condition_type: ConditionType) -> bool {
    let name = condition_type.to_string();
    conditions
        .iter()
        .find(|c| c.r#type == name)
        .is_some_and(Condition::is_true)
}

/// Get the reason for a condition
pub fn get_condition_reason(conditions: &[Condition], condition_type: ConditionType) -> Option<&str> {
    let name = condition_type.to_string();
    conditions
        .iter()
        .find(|c| c.r#type == name)
        .map(|c| c.reason.as_str())
}

/// Set a condition on the object. Returns true if the conditions changed.
pub fn set_condition(vdb: &mut VerticaDB, condition: Condition) -> bool {
    let status = vdb.status_mut();
    let mut builder = ConditionBuilder::from_conditions(&status.conditions);
    builder.set(condition);
    let conditions = builder.build();
    if conditions == status.conditions {
        return false;
    }
    status.conditions = conditions;
    true
}

// ============================================================================
// Optimistic-concurrency writes
// ============================================================================

async fn update_with_retry<F>(
    state: &dyn ClusterState,
    vdb: &VerticaDB,
    status_only: bool,
    mut mutate: F,
) -> Result<VerticaDB>
where
    F: FnMut(&mut VerticaDB) -> bool + Send,
{
    let namespace = vdb.namespace_or_default();
    let name = vdb.name_any_str().to_string();
    for attempt in 1..=MAX_UPDATE_ATTEMPTS {
        let mut latest = state.get_vdb(&namespace, &name).await?;
        if !mutate(&mut latest) {
            return Ok(latest);
        }
        let written = if status_only {
            state.replace_vdb_status(&latest).await
        } else {
            state.replace_vdb(&latest).await
        };
        match written {
            Ok(updated) => return Ok(updated),
            Err(e) if e.is_conflict() => {
                debug!(%namespace, %name, attempt, "conflict writing verticadb, retrying");
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::Conflict(format!("verticadb {namespace}/{name}")))
}

/// Read-modify-write of the VerticaDB metadata and spec.
///
/// `mutate` runs against the latest copy and returns whether it changed
/// anything; when it returns false no write happens and the latest copy is
/// returned.
pub async fn update_vdb_with_retry<F>(
    state: &dyn ClusterState,
    vdb: &VerticaDB,
    mutate: F,
) -> Result<VerticaDB>
where
    F: FnMut(&mut VerticaDB) -> bool + Send,
{
    update_with_retry(state, vdb, false, mutate).await
}

/// Read-modify-write of the VerticaDB status subresource.
pub async fn update_vdb_status_with_retry<F>(
    state: &dyn ClusterState,
    vdb: &VerticaDB,
    mutate: F,
) -> Result<VerticaDB>
where
    F: FnMut(&mut VerticaDB) -> bool + Send,
{
    update_with_retry(state, vdb, true, mutate).await
}

/// Persist a single condition.
pub async fn update_condition(
    state: &dyn ClusterState,
    vdb: &VerticaDB,
    condition: Condition,
) -> Result<VerticaDB> {
    update_vdb_status_with_retry(state, vdb, |v| set_condition(v, condition.clone())).await
}

/// Persist the upgrade progress message.
pub async fn set_upgrade_status(
    state: &dyn ClusterState,
    vdb: &VerticaDB,
    message: &str,
) -> Result<VerticaDB> {
    update_vdb_status_with_retry(state, vdb, |v| {
        let status = v.status_mut();
        if status.upgrade_status == message {
            return false;
        }
        status.upgrade_status = message.to_string();
        true
    })
    .await
}
