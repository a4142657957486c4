//! Custom Resource Definitions (CRDs) for vertica-operator.
//!
//! - `VerticaDB`: desired and observed state of a Vertica cluster
//! - `annotations`: annotation and label keys, container paths
//! - `scope`: main cluster vs. sandbox
//! - `version`: server version parsing and upgrade paths

pub mod annotations;
pub mod scope;
pub mod version;
mod verticadb;

pub use scope::ClusterScope;
pub use verticadb::*;
