//! Node details read through vsql on an up node.
//!
//! Three queries run in order: node state, shard subscriptions, depot sizing.
//! A failed exec means the node could not answer; malformed output is a
//! structural error and is returned as such.

use crate::client::parsing::{parse_count, parse_depot_details, parse_node_state};
use crate::client::{PodName, PodRunner};
use crate::controller::error::{Error, Result};
use crate::crd::version::{
    NODES_HAVE_READ_ONLY_STATE_VERSION, SANDBOX_SUPPORTED_MIN_VERSION, VersionInfo,
};

/// Details of one node as reported by the catalog.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeDetails {
    /// Up state from the catalog; `None` when the query returned no row.
    pub up: Option<bool>,
    pub subcluster_oid: String,
    pub read_only: bool,
    /// Sandbox reported by the node; empty for the main cluster.
    pub sandbox: String,
    pub shard_subscriptions: i64,
    pub max_depot_size: u64,
    pub depot_disk_percent: String,
}

/// Node state query for the session's own node.
///
/// The read-only column only exists from 11.0.2 and the sandbox column from
/// 24.3.0. When the version is unknown neither is requested.
pub fn node_state_query(is_eon: bool, version: Option<&VersionInfo>) -> String {
    let at_least = |min: &str| version.is_some_and(|v| v.is_equal_or_newer(min));
    let mut cols = String::from("n.node_name, node_state");
    cols.push_str(if is_eon { ", subcluster_oid" } else { ", ''" });
    if at_least(NODES_HAVE_READ_ONLY_STATE_VERSION) {
        cols.push_str(", is_readonly");
    }
    if is_eon && at_least(SANDBOX_SUPPORTED_MIN_VERSION) {
        cols.push_str(", n.sandbox");
    }
    if is_eon {
        format!(
            "select {cols} from nodes as n, subclusters as s \
             where s.node_oid = n.node_id and n.node_name in (select node_name from current_session)"
        )
    } else {
        format!(
            "select {cols} from nodes as n \
             where n.node_name in (select node_name from current_session)"
        )
    }
}

pub fn shard_subscriptions_query(vnode_name: &str) -> String {
    format!(
        "select count(*) from v_catalog.node_subscriptions \
         where node_name = '{vnode_name}' and shard_name != 'replica'"
    )
}

pub fn depot_details_query(vnode_name: &str) -> String {
    format!(
        "select max_size, disk_percent from storage_locations \
         where location_usage = 'DEPOT' and node_name = '{vnode_name}'"
    )
}

/// Outcome of [`fetch_node_details`].
#[derive(Debug)]
pub enum FetchOutcome {
    Details(NodeDetails),
    /// vsql could not be run; the message is for logging.
    Unavailable(String),
}

/// Run the node detail queries on `pod`.
pub async fn fetch_node_details(
    runner: &dyn PodRunner,
    pod: &PodName,
    container: &str,
    vnode_name: &str,
    is_eon: bool,
    version: Option<&VersionInfo>,
) -> Result<FetchOutcome> {
    let mut details = NodeDetails::default();

    let out = match runner
        .exec_vsql(pod, container, &node_state_query(is_eon, version))
        .await
    {
        Ok(out) => out,
        Err(e @ Error::Exec { .. }) => return Ok(FetchOutcome::Unavailable(e.to_string())),
        Err(e) => return Err(e),
    };
    if let Some(state) = parse_node_state(&out.stdout)? {
        details.up = Some(state.up);
        details.subcluster_oid = state.subcluster_oid;
        details.read_only = state.read_only && state.up;
        details.sandbox = state.sandbox;
        if !state.up {
            // A down node has no shards or depot to report.
            return Ok(FetchOutcome::Details(details));
        }
    }

    let out = match runner
        .exec_vsql(pod, container, &shard_subscriptions_query(vnode_name))
        .await
    {
        Ok(out) => out,
        Err(e @ Error::Exec { .. }) => return Ok(FetchOutcome::Unavailable(e.to_string())),
        Err(e) => return Err(e),
    };
    if let Some(count) = parse_count(&out.stdout)? {
        details.shard_subscriptions = count;
    }

    let out = match runner
        .exec_vsql(pod, container, &depot_details_query(vnode_name))
        .await
    {
        Ok(out) => out,
        Err(e @ Error::Exec { .. }) => return Ok(FetchOutcome::Unavailable(e.to_string())),
        Err(e) => return Err(e),
    };
    if let Some(depot) = parse_depot_details(&out.stdout)? {
        details.max_depot_size = depot.max_size;
        details.depot_disk_percent = depot.disk_percent;
    }

    Ok(FetchOutcome::Details(details))
}
