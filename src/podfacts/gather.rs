//! Single-exec state gathering.
//!
//! Exec calls are expensive, so everything PodFacts needs from the
//! filesystem and process table of a pod is collected by one generated bash
//! script. The script prints YAML that maps directly onto [`GatherState`].

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Deserializer};

use crate::client::parsing::ParseError;
use crate::crd::annotations::ADMINTOOLS_CONF;

pub const EULA_ACCEPTANCE_FILE: &str = "/opt/vertica/config/d5415f948449e9d4c421b568f2411140.dat";
pub const CONFIG_LOGROTATE_PATH: &str = "/opt/vertica/config/logrotate";
pub const CONFIG_SHARE_PATH: &str = "/opt/vertica/config/share";
pub const CONFIG_LICENSING_PATH: &str = "/opt/vertica/config/licensing";
pub const HTTP_TLS_CONF_DIR: &str = "/opt/vertica/config/https_certs";
pub const CE_LICENSE_FILE: &str = "/home/dbadmin/licensing/ce/vertica_community_edition.license.key";
pub const LOGROTATE_AT_FILE: &str = "/opt/vertica/config/logrotate/admintool.logrotate";
pub const LOGROTATE_BASE_CONF_FILE: &str = "/opt/vertica/config/logrotate_base.conf";
pub const HTTP_TLS_CONF_FILE: &str = "/opt/vertica/config/https_certs/httpstls.json";

/// HTTPS endpoint answering 200 once the node is up.
const HTTP_VERSION_PATH: &str = "/v1/version";

/// Raw state reported by the gather script.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatherState {
    pub install_indicator_exists: bool,
    pub eula_accepted: bool,
    pub dir_exists: BTreeMap<String, bool>,
    pub file_exists: BTreeMap<String, bool>,
    pub db_exists: bool,
    #[serde(rename = "verticaPIDRunning")]
    pub vertica_pid_running: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub vertica_process: String,
    pub up_node: bool,
    pub startup_complete: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub compat21_node_name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub vnode_name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub local_data_size: i64,
    #[serde(deserialize_with = "null_as_default")]
    pub local_data_avail: i64,
    pub admintools_exists: bool,
}

/// Empty YAML values come back as null.
fn null_as_default<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

/// Inputs the script needs about the pod.
pub struct GatherInput<'a> {
    pub installer_indicator: &'a str,
    pub catalog_path: &'a str,
    pub db_name: &'a str,
    pub pod_ip: &'a str,
    pub is_primary: bool,
    /// The vertica process runs in the container the script executes in.
    pub in_server_container: bool,
}

/// Primaries always hold a current catalog file; secondaries may only have
/// the directory layout until their first start.
fn catalog_query(is_primary: bool) -> &'static str {
    if is_primary {
        "Catalog/*config*.cat"
    } else {
        "Catalog"
    }
}

/// Generate the gather script.
pub fn gather_script(input: &GatherInput<'_>) -> String {
    let db_lower = input.db_name.to_lowercase();
    let catalog_glob = format!(
        "{}/{}/v_{}_node????_catalog",
        input.catalog_path, input.db_name, db_lower
    );
    let mut s = String::from("set -o errexit\nset -o pipefail\n");
    let _ = writeln!(s, "echo -n 'installIndicatorExists: '");
    let _ = writeln!(s, "test -f {} && echo true || echo false", input.installer_indicator);
    let _ = writeln!(s, "echo -n 'eulaAccepted: '");
    let _ = writeln!(s, "test -f {EULA_ACCEPTANCE_FILE} && echo true || echo false");
    let _ = writeln!(s, "echo 'dirExists:'");
    for dir in [
        CONFIG_LOGROTATE_PATH,
        CONFIG_SHARE_PATH,
        CONFIG_LICENSING_PATH,
        HTTP_TLS_CONF_DIR,
    ] {
        let _ = writeln!(s, "echo -n '  {dir}: '");
        let _ = writeln!(s, "test -d {dir} && echo true || echo false");
    }
    let _ = writeln!(s, "echo 'fileExists:'");
    for file in [
        ADMINTOOLS_CONF,
        CE_LICENSE_FILE,
        LOGROTATE_AT_FILE,
        LOGROTATE_BASE_CONF_FILE,
        HTTP_TLS_CONF_FILE,
    ] {
        let _ = writeln!(s, "echo -n '  {file}: '");
        let _ = writeln!(s, "test -f {file} && echo true || echo false");
    }
    let _ = writeln!(s, "echo -n 'dbExists: '");
    let _ = writeln!(
        s,
        "ls --almost-all --hide-control-chars -1 {catalog_glob}/{} 2> /dev/null | grep --quiet . && echo true || echo false",
        catalog_query(input.is_primary)
    );
    let _ = writeln!(s, "echo -n 'compat21NodeName: '");
    let _ = writeln!(
        s,
        "test -f {ind} && echo -n '\"' && echo -n $(cat {ind}) && echo '\"' || echo '\"\"'",
        ind = input.installer_indicator
    );
    let _ = writeln!(s, "echo -n 'vnodeName: '");
    let _ = writeln!(
        s,
        "cd {catalog_glob} 2> /dev/null && basename $(pwd) | rev | cut -c9- | rev || echo \"\""
    );
    let _ = writeln!(s, "echo -n 'upNode: '");
    let _ = writeln!(
        s,
        "curl -k -s -o /dev/null -w '%{{http_code}}' https://{}:8443{HTTP_VERSION_PATH} 2> /dev/null | grep --quiet 200 2> /dev/null && echo true || echo false",
        input.pod_ip
    );
    let _ = writeln!(s, "echo -n 'startupComplete: '");
    let _ = writeln!(
        s,
        "grep --quiet -e 'Startup Complete' -e 'Database Halted' {}/{}/*_catalog/startup.log 2> /dev/null && echo true || echo false",
        input.catalog_path, input.db_name
    );
    let _ = writeln!(s, "echo -n 'localDataSize: '");
    let _ = writeln!(s, "df --block-size=1 --output=size {} | tail -1", input.catalog_path);
    let _ = writeln!(s, "echo -n 'localDataAvail: '");
    let _ = writeln!(s, "df --block-size=1 --output=avail {} | tail -1", input.catalog_path);
    let _ = writeln!(s, "echo -n 'admintoolsExists: '");
    let _ = writeln!(s, "which admintools &> /dev/null && echo true || echo false");
    if input.in_server_container {
        // Match on the pod IP so a process left over from a previous
        // incarnation of the pod is not mistaken for a running server.
        let _ = writeln!(s, "echo -n 'verticaPIDRunning: '");
        let _ = writeln!(
            s,
            "[[ $(pgrep -f \"/opt/vertica/bin/vertica.*-h {}\") ]] && echo true || echo false",
            input.pod_ip
        );
        let _ = writeln!(s, "echo -n 'verticaProcess: '");
        let _ = writeln!(s, "pgrep -f \"^.*vertica\\s-D\" -a | tail -1 || echo error");
    }
    s
}

/// Parse the script output. Empty output yields the default state.
pub fn parse_gather_output(output: &str) -> Result<GatherState, ParseError> {
    if output.trim().is_empty() {
        return Ok(GatherState::default());
    }
    serde_yaml::from_str(output).map_err(|e| ParseError::Value {
        what: "gather state",
        value: e.to_string(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn input(in_server: bool) -> GatherInput<'static> {
        GatherInput {
            installer_indicator: "/opt/vertica/config/install-indicator/uid",
            catalog_path: "/data",
            db_name: "VertDB",
            pod_ip: "10.0.0.5",
            is_primary: true,
            in_server_container: in_server,
        }
    }

    #[test]
    fn test_script_contents() {
        let script = gather_script(&input(true));
        assert!(script.contains("/data/VertDB/v_vertdb_node????_catalog/Catalog/*config*.cat"));
        assert!(script.contains("https://10.0.0.5:8443/v1/version"));
        assert!(script.contains("verticaPIDRunning"));
        assert!(!gather_script(&input(false)).contains("verticaPIDRunning"));
    }

    #[test]
    fn test_parse_output() {
        let out = "installIndicatorExists: true\n\
                   eulaAccepted: false\n\
                   dirExists:\n  /opt/vertica/config/logrotate: true\n\
                   fileExists:\n  /opt/vertica/config/admintools.conf: false\n\
                   dbExists: true\n\
                   compat21NodeName: \"node0001\"\n\
                   vnodeName: v_vertdb_node0001\n\
                   upNode: true\n\
                   startupComplete: false\n\
                   localDataSize: 1000\n\
                   localDataAvail: 400\n\
                   admintoolsExists: true\n\
                   verticaPIDRunning: true\n\
                   verticaProcess: 123 /opt/vertica/bin/vertica -D /data\n";
        let gs = parse_gather_output(out).unwrap();
        assert!(gs.install_indicator_exists);
        assert!(!gs.eula_accepted);
        assert!(gs.dir_exists[CONFIG_LOGROTATE_PATH]);
        assert!(!gs.file_exists[ADMINTOOLS_CONF]);
        assert!(gs.db_exists);
        assert_eq!(gs.compat21_node_name, "node0001");
        assert_eq!(gs.vnode_name, "v_vertdb_node0001");
        assert!(gs.vertica_pid_running);
        assert_eq!(gs.local_data_avail, 400);
    }

    #[test]
    fn test_parse_empty_and_bad_output() {
        assert_eq!(parse_gather_output("").unwrap(), GatherState::default());
        assert!(parse_gather_output("upNode: [unterminated").is_err());
        let gs = parse_gather_output("vnodeName: \nupNode: false\n").unwrap();
        assert_eq!(gs.vnode_name, "");
    }
}
