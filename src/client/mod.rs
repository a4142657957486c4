//! Collaborators the reconcile core talks to.
//!
//! The core never reaches the API server or the database directly. It goes
//! through three seams, each with a production and an in-memory implementation.
//!
//! ## Architecture
//!
//! - `cluster_state`: typed CRUD over the Kubernetes objects we own (`KubeClusterState`)
//! - `memory`: in-memory object store with resource-version checks (`MemoryClusterState`)
//! - `pod_runner`: command and SQL execution inside pods (`KubePodRunner`)
//! - `dispatcher`: admin command contract, with `admintools` and `vcluster` backends
//! - `parsing`: pure parsers for pipe-delimited vsql output
//! - `fake`: scripted `PodRunner` and recording `Dispatcher` for tests
//!
//! ## Example
//!
//! ```rust,ignore
//! use vertica_operator::client::{KubePodRunner, PodName, PodRunner};
//!
//! let runner = KubePodRunner::new(client);
//! let out = runner
//!     .exec_vsql(&PodName::new("ns", "vdb-main-0"), "server", "select 1")
//!     .await?;
//! ```

pub mod admintools;
pub mod cluster_state;
pub mod dispatcher;
pub mod fake;
pub mod memory;
pub mod parsing;
pub mod pod_runner;
pub mod vcluster;

pub use admintools::AdmintoolsDispatcher;
pub use cluster_state::{ClusterState, KubeClusterState, Labels};
pub use dispatcher::{DatabaseTarget, Dispatcher, Host};
pub use fake::{DispatchCall, FakeDispatcher, FakePodRunner};
pub use memory::MemoryClusterState;
pub use pod_runner::{ExecOutput, KubePodRunner, PodName, PodRunner, VsqlCredentials};
pub use vcluster::VClusterDispatcher;
