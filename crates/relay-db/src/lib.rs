//! Persistence layer for the relay scheduling engine.
//!
//! Owns the SQLite schema (`scheduled_tasks`, `task_executions`), the
//! connection pool, and every query the engine issues. All state
//! transitions on execution rows happen here so their invariants (single
//! active execution per task, monotonic `terminate_requested`, terminal
//! rows never re-opened) can be enforced in one place.

pub mod compact;
pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
