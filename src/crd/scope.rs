//! Cluster scope: the main cluster or one named sandbox.

use std::fmt;

/// Which part of a VerticaDB an operation targets.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClusterScope {
    #[default]
    MainCluster,
    Sandbox(String),
}

impl ClusterScope {
    /// Scope from a sandbox label value. An empty value means the main cluster.
    pub fn from_label(value: Option<&str>) -> Self {
        match value {
            Some(v) if !v.is_empty() => ClusterScope::Sandbox(v.to_string()),
            _ => ClusterScope::MainCluster,
        }
    }

    pub fn is_main(&self) -> bool {
        matches!(self, ClusterScope::MainCluster)
    }

    pub fn sandbox_name(&self) -> Option<&str> {
        match self {
            ClusterScope::MainCluster => None,
            ClusterScope::Sandbox(name) => Some(name),
        }
    }

    /// Human-readable form used in events and logs.
    pub fn extended_name(&self) -> String {
        match self {
            ClusterScope::MainCluster => "main cluster".to_string(),
            ClusterScope::Sandbox(name) => format!("sandbox {name}"),
        }
    }
}

impl fmt::Display for ClusterScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.extended_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_label() {
        assert_eq!(ClusterScope::from_label(None), ClusterScope::MainCluster);
        assert_eq!(ClusterScope::from_label(Some("")), ClusterScope::MainCluster);
        assert_eq!(
            ClusterScope::from_label(Some("sb1")),
            ClusterScope::Sandbox("sb1".into())
        );
    }

    #[test]
    fn test_extended_name() {
        assert_eq!(ClusterScope::MainCluster.extended_name(), "main cluster");
        assert_eq!(
            ClusterScope::Sandbox("sb1".into()).to_string(),
            "sandbox sb1"
        );
        assert_eq!(ClusterScope::Sandbox("x".into()).sandbox_name(), Some("x"));
    }
}
