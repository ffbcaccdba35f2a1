//! Process-level helpers.
//!
//! These are stateless functions used by the bus and the binaries.

pub mod bootstrap;
pub mod retry;
