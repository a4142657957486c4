//! Controller module for vertica-operator.
//!
//! Contains the reconcile pipeline and everything it runs on: the actor
//! framework and the actors, error handling, status writes, the subcluster
//! finder and the upgrade machinery.

// Shared modules
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod status;

// Reconcile pipeline
pub mod actor;
pub mod actors;
pub mod finder;
pub mod pipeline;
pub mod upgrade_manager;

pub use actor::{Actor, ActorContext, Directive, ReconcilePass};
pub use error::{Error, Result};
