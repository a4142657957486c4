//! Vertica server versions.
//!
//! Versions look like `v24.3.0-2`: major.minor.patch plus an optional hotfix
//! (or build date) suffix. Feature gates compare against the constants below.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use semver::Version;

use super::annotations;

/// Oldest server the operator can manage.
pub const MINIMUM_VERSION: &str = "v11.0.1";
/// Nodes report a read-only state starting here.
pub const NODES_HAVE_READ_ONLY_STATE_VERSION: &str = "v11.0.2";
pub const READ_ONLY_ONLINE_UPGRADE_VERSION: &str = "v11.1.0";
/// Replicated (fully online) upgrade needs this hotfix.
pub const ONLINE_UPGRADE_VERSION: &str = "v24.3.0-2";
pub const VCLUSTER_OPS_DEFAULT_VERSION: &str = "v24.1.0";
pub const NMA_IN_SIDECAR_MIN_VERSION: &str = "v24.2.0";
pub const SANDBOX_SUPPORTED_MIN_VERSION: &str = "v24.3.0";

static VERSION_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"v(\d+)\.(\d+)\.(\d+)(?:-(\d+))?").ok());

/// A parsed server version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionInfo {
    /// The text the version was parsed from.
    pub raw: String,
    pub version: Version,
    pub hotfix: u64,
}

impl VersionInfo {
    /// Parse a version string. Returns `None` when no `vX.Y.Z` is found.
    pub fn parse(raw: &str) -> Option<Self> {
        let re = VERSION_RE.as_ref()?;
        let caps = re.captures(raw)?;
        let num = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u64>().ok());
        Some(Self {
            raw: raw.to_string(),
            version: Version::new(num(1)?, num(2)?, num(3)?),
            hotfix: num(4).unwrap_or(0),
        })
    }

    fn parse_const(raw: &str) -> Self {
        Self::parse(raw).unwrap_or(Self {
            raw: raw.to_string(),
            version: Version::new(0, 0, 0),
            hotfix: 0,
        })
    }

    /// True if this version is at least `other`, ignoring hotfixes.
    pub fn is_equal_or_newer(&self, other: &str) -> bool {
        self.version >= Self::parse_const(other).version
    }

    /// True if this version is at least `other`, hotfix included.
    pub fn is_equal_or_newer_with_hotfix(&self, other: &str) -> bool {
        let other = Self::parse_const(other);
        match self.version.cmp(&other.version) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => self.hotfix >= other.hotfix,
        }
    }

    pub fn is_older(&self, other: &str) -> bool {
        !self.is_equal_or_newer(other)
    }

    pub fn is_supported(&self) -> bool {
        self.is_equal_or_newer(MINIMUM_VERSION)
    }

    fn same_minor(&self, other: &VersionInfo) -> bool {
        self.version.major == other.version.major && self.version.minor == other.version.minor
    }

    /// Check that moving from this version to `target` is allowed.
    ///
    /// Downgrades are rejected. Patch releases may be skipped, but between
    /// major/minor releases the required intermediate hop must not be skipped.
    pub fn is_valid_upgrade_path(&self, target: &str) -> Result<(), String> {
        let t = VersionInfo::parse(target)
            .ok_or_else(|| format!("could not parse version '{target}'"))?;
        if self.version == t.version {
            return Ok(());
        }
        if t.version < self.version {
            return Err(format!(
                "Version '{}' to '{}' is a downgrade and is not supported",
                self.raw, t.raw
            ));
        }
        if self.same_minor(&t) {
            return Ok(());
        }
        match next_required_release(&self.version) {
            // Releases newer than the table are not blocked.
            None => Ok(()),
            Some((label, next)) => {
                if t.version.major == next.major && t.version.minor == next.minor {
                    Ok(())
                } else {
                    Err(format!(
                        "Version '{}' to '{}' is invalid because it skips '{}'",
                        self.raw, t.raw, label
                    ))
                }
            }
        }
    }
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Release that must come next when upgrading from `from`.
fn next_required_release(from: &Version) -> Option<(&'static str, Version)> {
    match (from.major, from.minor, from.patch) {
        (11, 0, 0..=2) => Some(("v11.1.x", Version::new(11, 1, 0))),
        (11, 1, 0..=1) => Some(("v12.0.x", Version::new(12, 0, 0))),
        _ => None,
    }
}

static VERSION_OUTPUT_RE: LazyLock<Vec<(&'static str, Option<Regex>)>> = LazyLock::new(|| {
    vec![
        (annotations::VERSION, Regex::new(r"(v[0-9a-zA-Z.-]+)\n").ok()),
        (
            annotations::BUILD_REF,
            Regex::new(r"built by .* from .*@([^ ]+) ").ok(),
        ),
        (
            annotations::BUILD_DATE,
            Regex::new(r"on '([A-Za-z0-9: ]+)'").ok(),
        ),
    ]
});

/// Turn the output of `vertica --version` into version annotations.
///
/// ```text
/// Vertica Analytic Database v11.0.0-20210601
/// vertica(v11.0.0-20210601) built by @re-docker2 from master@da8f0e9 on 'Tue Jun  1 05:04:35 2021' $BuildId$
/// ```
pub fn parse_version_output(output: &str) -> BTreeMap<String, String> {
    let mut found = BTreeMap::new();
    for (key, re) in VERSION_OUTPUT_RE.iter() {
        if let Some(m) = re
            .as_ref()
            .and_then(|re| re.captures(output))
            .and_then(|c| c.get(1))
        {
            found.insert((*key).to_string(), m.as_str().to_string());
        }
    }
    found
}
