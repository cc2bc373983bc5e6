//! Per-node dirty state.

use std::sync::Arc;
use std::time::Instant;

use indexmap::IndexMap;

use crate::error::HookError;
use crate::graph::NodeId;

/// Callback run after a node becomes dirty ("refresh my badge", "grey out
/// the preview", ...). Runs during the next drain, never inline.
pub type PostDirtyHook = Arc<dyn Fn(NodeId) -> Result<(), HookError> + Send + Sync>;

/// Dirty flag, timestamp and hooks of one node. Created lazily on first use.
#[derive(Clone, Default)]
pub struct DirtyState {
    dirty: bool,
    since: Option<Instant>,
    hooks: IndexMap<String, PostDirtyHook>,
}

impl DirtyState {
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// When the node last went from clean to dirty.
    pub fn since(&self) -> Option<Instant> {
        self.since
    }

    pub fn hook_names(&self) -> impl Iterator<Item = &str> {
        self.hooks.keys().map(String::as_str)
    }

    /// Set the flag. Returns `false` if it was already set.
    pub(crate) fn mark(&mut self) -> bool {
        if self.dirty {
            return false;
        }
        self.dirty = true;
        self.since = Some(Instant::now());
        true
    }

    pub(crate) fn clear(&mut self) {
        self.dirty = false;
        self.since = None;
    }

    pub(crate) fn has_hooks(&self) -> bool {
        !self.hooks.is_empty()
    }

    pub(crate) fn hooks(&self) -> Vec<(String, PostDirtyHook)> {
        self.hooks
            .iter()
            .map(|(name, hook)| (name.clone(), Arc::clone(hook)))
            .collect()
    }

    pub(crate) fn add_hook(&mut self, name: String, hook: PostDirtyHook) {
        self.hooks.insert(name, hook);
    }

    pub(crate) fn remove_hook(&mut self, name: &str) -> bool {
        self.hooks.shift_remove(name).is_some()
    }
}

impl std::fmt::Debug for DirtyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirtyState")
            .field("dirty", &self.dirty)
            .field("since", &self.since)
            .field("hooks", &self.hooks.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_is_idempotent() {
        let mut state = DirtyState::default();
        assert!(state.mark());
        let since = state.since();
        assert!(!state.mark());
        assert_eq!(state.since(), since);

        state.clear();
        assert!(!state.is_dirty());
        assert!(state.since().is_none());
    }

    #[test]
    fn hooks_survive_clear() {
        let mut state = DirtyState::default();
        let hook: PostDirtyHook = Arc::new(|_: NodeId| -> Result<(), HookError> { Ok(()) });
        state.add_hook("badge".into(), hook);
        state.mark();
        state.clear();

        assert!(state.has_hooks());
        assert_eq!(state.hook_names().collect::<Vec<_>>(), vec!["badge"]);
        assert!(state.remove_hook("badge"));
        assert!(!state.remove_hook("badge"));
    }
}
