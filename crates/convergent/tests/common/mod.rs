//! Shared helpers for integration tests.
//!
//! Each test gets an isolated temp directory holding a local source tree and
//! a config directory, plus an in-memory cluster to reconcile against.

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::TestHarness;
