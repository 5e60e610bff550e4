//! Integration tests against a real cluster
//!
//! # Test Organization
//!
//! - `ledger_operations`: Stories about the ConfigMap-backed ledger and its
//!   compare-and-set under real optimistic concurrency
//!
//! - `restart_e2e`: Stories about a ConfigMap change rolling its dependents
//!   through the real API server
//!
//! # Running These Tests
//!
//! ```bash
//! cargo test --test kind -- --ignored --nocapture
//! ```

mod helpers;
mod ledger_operations;
mod restart_e2e;
