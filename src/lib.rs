//! Single-node proof-of-work ledger engine.
//!
//! The core lives in [`blockchain`]; [`api`] is the thin HTTP layer the node
//! binary serves, and [`config`] holds the engine tunables.

pub mod api;
pub mod blockchain;
pub mod config;
