//! Parsing of textual command output from vertica pods.
//!
//! vsql runs with `-tA` so results come back as pipe-delimited rows without
//! headers. Every function here is pure. Empty output is never an error: it
//! means the query had nothing to report yet.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Errors that can occur during parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("expected at least {expected} columns but found {found} in '{output}'")]
    ColumnCount {
        expected: usize,
        found: usize,
        output: String,
    },

    #[error("could not parse '{value}' as {what}")]
    Value { what: &'static str, value: String },
}

/// First non-empty line split on `|`. `None` when there is no output.
pub fn first_row(output: &str) -> Option<Vec<&str>> {
    output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(|l| l.split('|').collect())
}

/// First row, requiring at least `min_cols` columns.
pub fn first_row_with_columns(
    output: &str,
    min_cols: usize,
) -> Result<Option<Vec<&str>>, ParseError> {
    match first_row(output) {
        None => Ok(None),
        Some(cols) if cols.len() < min_cols => Err(ParseError::ColumnCount {
            expected: min_cols,
            found: cols.len(),
            output: output.trim().to_string(),
        }),
        Some(cols) => Ok(Some(cols)),
    }
}

/// State of a node as reported by `v_catalog.nodes`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeState {
    pub up: bool,
    pub subcluster_oid: String,
    pub read_only: bool,
    /// Sandbox the node reports; empty for the main cluster.
    pub sandbox: String,
}

/// Parse `node_state|subcluster_oid|is_readonly[|sandbox]` preceded by the node name.
///
/// ```text
/// v_db_node0001|UP|123456|t
/// ```
pub fn parse_node_state(output: &str) -> Result<Option<NodeState>, ParseError> {
    const MIN_COLS: usize = 3;
    let Some(cols) = first_row_with_columns(output, MIN_COLS)? else {
        return Ok(None);
    };
    let col = |i: usize| cols.get(i).copied().unwrap_or_default();
    Ok(Some(NodeState {
        up: col(1) == "UP",
        subcluster_oid: col(2).to_string(),
        read_only: col(3) == "t",
        sandbox: col(4).to_string(),
    }))
}

/// Parse a single integer result such as `select count(*) ...`.
pub fn parse_count(output: &str) -> Result<Option<i64>, ParseError> {
    let Some(cols) = first_row(output) else {
        return Ok(None);
    };
    let value = cols.first().copied().unwrap_or_default().trim();
    value
        .parse::<i64>()
        .map(Some)
        .map_err(|_| ParseError::Value {
            what: "count",
            value: value.to_string(),
        })
}

/// Depot sizing as reported by `storage_locations`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DepotDetails {
    pub max_size: u64,
    /// Percentage of the disk the depot may use; empty when set as a size.
    pub disk_percent: String,
}

/// Parse `max_size|disk_percent`. Exactly two columns are required.
pub fn parse_depot_details(output: &str) -> Result<Option<DepotDetails>, ParseError> {
    let Some(cols) = first_row(output) else {
        return Ok(None);
    };
    if cols.len() != 2 {
        return Err(ParseError::ColumnCount {
            expected: 2,
            found: cols.len(),
            output: output.trim().to_string(),
        });
    }
    let raw = cols.first().copied().unwrap_or_default();
    let max_size = raw.parse::<u64>().map_err(|_| ParseError::Value {
        what: "depot size",
        value: raw.to_string(),
    })?;
    Ok(Some(DepotDetails {
        max_size,
        disk_percent: cols.get(1).copied().unwrap_or_default().to_string(),
    }))
}

static PROTOCOL_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"([a-z]+)://(.*)").ok());

const DEFAULT_PROTOCOL: &str = "HTTPS";

/// Protocol of an endpoint URL in upper case; HTTPS when none is given.
pub fn endpoint_protocol(endpoint: &str) -> String {
    PROTOCOL_RE
        .as_ref()
        .and_then(|re| re.captures(endpoint))
        .and_then(|c| c.get(1))
        .map_or_else(
            || DEFAULT_PROTOCOL.to_string(),
            |m| m.as_str().to_uppercase(),
        )
}

/// Host and port of an endpoint URL with any scheme and trailing slash removed.
pub fn endpoint_host_port(endpoint: &str) -> String {
    PROTOCOL_RE
        .as_ref()
        .and_then(|re| re.captures(endpoint))
        .and_then(|c| c.get(2))
        .map_or_else(
            || endpoint.to_string(),
            |m| m.as_str().trim_end_matches('/').to_string(),
        )
}
