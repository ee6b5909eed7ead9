//! The action seam -- the interface between the engine and the code a task
//! actually runs.
//!
//! Collaborators implement [`Action`] and register it under a name at
//! process start. The engine only contracts that an action respects
//! cancellation and reports progress through its [`ExecutionContext`];
//! what the action does is opaque.

mod context;
mod registry;

pub use context::{ExecutionContext, ProgressUpdate};
pub use registry::ActionRegistry;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::EngineResult;

/// A named, registered unit of executable work.
///
/// # Contract
///
/// Implementations should call [`ExecutionContext::report_progress`] (or at
/// least [`ExecutionContext::checkpoint`]) periodically: that is how pause
/// and terminate requests reach the action. An action that never polls can
/// only be stopped by the force-clean path.
///
/// The returned value is a free-form map persisted (compacted) as the
/// execution result.
#[async_trait]
pub trait Action: Send + Sync {
    /// The name collaborators use in `task_action` config fields.
    fn name(&self) -> &str;

    /// Run the action to completion under the given context.
    async fn execute(&self, ctx: &ExecutionContext, config: &Value) -> EngineResult<Value>;
}

// Compile-time assertion: Action must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Action) {}
};
