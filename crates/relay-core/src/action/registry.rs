//! Action registry -- a named collection of registered executors.
//!
//! The runtime resolves `task_action` config fields against this registry.
//! The `command` and workflow paths are built into the runtime itself and
//! never appear here.

use std::collections::HashMap;
use std::sync::Arc;

use super::Action;

/// A collection of registered [`Action`] implementations, keyed by name.
///
/// # Example
///
/// ```ignore
/// let mut registry = ActionRegistry::new();
/// registry.register(SyncCalendarAction::new());
/// let action = registry.get("sync_calendar").unwrap();
/// ```
#[derive(Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action.
    ///
    /// The action is stored under the name returned by [`Action::name`].
    /// If an action with the same name is already registered, it is
    /// replaced and the old one is returned.
    pub fn register(&mut self, action: impl Action + 'static) -> Option<Arc<dyn Action>> {
        let name = action.name().to_string();
        self.actions.insert(name, Arc::new(action))
    }

    /// Look up an action by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name).cloned()
    }

    /// List the names of all registered actions.
    ///
    /// The order is not guaranteed (HashMap iteration order).
    pub fn list(&self) -> Vec<&str> {
        self.actions.keys().map(|s| s.as_str()).collect()
    }

    /// Return the number of registered actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Return `true` if no actions are registered.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .finish()
    }
}
