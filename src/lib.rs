//! Purpose: Library crate behind the `predictcrop` binary and its tests.
//! Exports: `api` (request adapter, script runner capability, errors).
//! Role: Keeps the relay logic independent of the HTTP server so it can run in-process.
//! Invariants: No module-level mutable state; every request carries its own inputs.
pub mod api;
mod core;
