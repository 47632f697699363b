//! tideflow — a durable, persistent workflow engine.
//!
//! Hosts register [`engine::registry::FlowKind`]s, submit flows through the
//! [`engine::executor::FlowEngine`], and the engine schedules steps against
//! the declared dependency graph with pause/resume, retries, timeouts,
//! idempotency, branching, bounded jumps, and crash recovery from
//! document-store snapshots.

pub mod config;
pub mod engine;
pub mod storage;
