//! Fault injection and convergence verification for quorum-replicated
//! database clusters.
//!
//! A run disrupts selected nodes, optionally applies a cluster-wide
//! operation, waits for the replicated database to regain quorum, and checks
//! every affected node's domain membership against a deterministic
//! prediction before restoring the cluster for the next iteration.

pub mod backend;
pub mod cluster;
pub mod controller;
pub mod convergence;
pub mod error;
pub mod expected;
pub mod hooks;
pub mod injector;
pub mod poll;
pub mod report;
pub mod scenario;
pub mod selector;
pub mod settings;
pub mod trace;
pub mod verifier;
pub mod wipe;

pub use faultline_macros::test;
