// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Functional tests for the VerticaDB reconcile actors.
//!
//! These tests drive actors end to end against the in-memory cluster state,
//! the scripted pod runner and the recording dispatcher. No Kubernetes
//! cluster or Vertica server is needed.
//!
//! ```bash
//! # Run all functional tests
//! cargo test --test functional
//!
//! # Run specific test
//! cargo test --test functional test_rebalance_targets_unsubscribed_subcluster
//!
//! # Run with verbose output
//! cargo test --test functional -- --nocapture
//! ```
//!
//! ## Test Categories
//!
//! - **Scenario tests**: one actor taking the cluster from a known state to
//!   its goal state
//! - **Convergence tests**: repeated passes change nothing once converged, and
//!   status writes survive optimistic concurrency conflicts

#[path = "../common/mod.rs"]
mod common;

mod convergence_tests;
mod scenario_tests;
