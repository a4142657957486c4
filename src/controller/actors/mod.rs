//! The reconcile actors.
//!
//! Each module holds one actor, or a family of actors that share helpers.
//! [`crate::controller::pipeline::build_actors`] puts them in order.

pub mod buckets;
pub mod client_routing;
pub mod crash_loop;
pub mod drain_node;
pub mod image_version;
pub mod init_db;
pub mod install;
pub mod membership;
pub mod objects;
pub mod offline_upgrade;
pub mod packages;
pub mod password;
pub mod read_only_upgrade;
pub mod rebalance;
pub mod replicated_upgrade;
pub mod restart;
pub mod sandbox;
pub mod status;
pub mod tls;

#[cfg(test)]
pub(crate) mod testing;

pub use buckets::AdditionalBucketsActor;
pub use client_routing::{ClientRoutingActor, RoutingMode};
pub use crash_loop::CrashLoopActor;
pub use drain_node::DrainNodeActor;
pub use image_version::ImageVersionActor;
pub use init_db::{CreateDbActor, ReviveDbActor};
pub use install::{InstallActor, UninstallActor};
pub use membership::{
    DbAddNodeActor, DbAddSubclusterActor, DbRemoveNodeActor, DbRemoveSubclusterActor,
};
pub use objects::{ObjReconcilerActor, ObjScope};
pub use offline_upgrade::OfflineUpgradeActor;
pub use packages::InstallPackagesActor;
pub use password::PasswordSecretActor;
pub use read_only_upgrade::ReadOnlyOnlineUpgradeActor;
pub use rebalance::RebalanceShardsActor;
pub use replicated_upgrade::ReplicatedUpgradeActor;
pub use restart::RestartActor;
pub use sandbox::{SandboxSubclusterActor, UnsandboxSubclusterActor, VerifySandboxDeploymentActor};
pub use status::StatusActor;
pub use tls::TlsCertRotationActor;
