//! Objects the operator creates for a VerticaDB.
//!
//! Every subcluster gets a StatefulSet and a client-facing Service; the
//! database as a whole gets one headless Service for pod DNS. All of them
//! carry an owner reference back to the VerticaDB so deleting it cleans up.

pub mod common;
pub mod services;
pub mod statefulset;

pub use common::{owner_reference, standard_labels};
