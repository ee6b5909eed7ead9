//! The relay scheduling engine.
//!
//! A durable task scheduler: tasks live in a relational store, fire from
//! cron or interval triggers (or by hand), execute on a bounded worker pool
//! under cooperative pause/terminate control, and compose into DAG
//! workflows that can resume from the point of failure.
//!
//! The [`scheduler::Scheduler`] facade is the programmatic surface; HTTP or
//! CLI frontends are collaborators built on top of it.

pub mod action;
pub mod config;
pub mod cron;
pub mod dispatch;
pub mod error;
pub mod runtime;
pub mod schedule;
pub mod scheduler;
pub mod service;
pub mod sweeper;
pub mod workflow;

pub use action::{Action, ActionRegistry, ExecutionContext, ProgressUpdate};
pub use config::SchedulerConfig;
pub use error::{EngineError, EngineResult};
pub use scheduler::Scheduler;
