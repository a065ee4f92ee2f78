//! Utility functions.
//!
//! Stateless helpers used across the codebase.

pub mod bootstrap;
pub mod retry;
