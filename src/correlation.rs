//! Correlation-map propagation for the logging collaborator.
//!
//! Loggers attach correlation tags (request IDs, user IDs) to a map that is
//! conceptually "per thread". Once a handler can suspend and resume on a
//! different worker thread, a plain thread-local map silently loses those
//! tags. This module routes the map through a process-wide indirection keyed
//! by the current thread: each thread has one slot that either points at the
//! active scope's [`CorrelationMap`] or falls back to a per-thread root map
//! for code running outside any scope. The indirection is initialized lazily
//! per thread and torn down never.
//!
//! [`CorrelationContext`] is the [`ContextElement`] that swaps a scope's map
//! into the slot around every dispatch slice, and deep-copies it on fork so
//! a child scope's tags never leak into the parent's snapshot.
//!
//! The free functions ([`get`], [`insert`], [`remove`], [`snapshot`],
//! [`clear`]) are the surface the logging collaborator uses; it needs no
//! knowledge of jobs or scopes.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::context::{ContextElement, Restore};

thread_local! {
    /// Per-thread slot of the process-wide indirection table: the active
    /// scope's map, if one is installed on this thread right now.
    static ACTIVE: RefCell<Option<Arc<CorrelationMap>>> = const { RefCell::new(None) };

    /// Fallback map for code running outside any scope on this thread.
    static ROOT: RefCell<HashMap<String, String>> = RefCell::new(HashMap::new());
}

/// A map of correlation tags owned by one scope.
///
/// The copy-on-fork rule confines mutation to a single logical owner at a
/// time; the internal mutex only makes the map `Sync` so it can travel with
/// work between threads.
#[derive(Debug, Default)]
pub struct CorrelationMap {
    entries: Mutex<HashMap<String, String>>,
}

impl CorrelationMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a map pre-populated from a snapshot.
    pub fn from_snapshot(entries: HashMap<String, String>) -> Self {
        Self {
            entries: Mutex::new(entries),
        }
    }

    /// Returns the value for `key`, if present.
    pub fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .expect("correlation map lock poisoned")
            .get(key)
            .cloned()
    }

    /// Inserts or replaces a tag.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries
            .lock()
            .expect("correlation map lock poisoned")
            .insert(key.into(), value.into());
    }

    /// Removes a tag.
    pub fn remove(&self, key: &str) {
        self.entries
            .lock()
            .expect("correlation map lock poisoned")
            .remove(key);
    }

    /// Removes all tags.
    pub fn clear(&self) {
        self.entries
            .lock()
            .expect("correlation map lock poisoned")
            .clear();
    }

    /// Returns a copy of all tags.
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.entries
            .lock()
            .expect("correlation map lock poisoned")
            .clone()
    }

    /// Deep copy for a child scope.
    fn deep_copy(&self) -> Self {
        Self::from_snapshot(self.snapshot())
    }
}

/// Context element that makes a [`CorrelationMap`] ambient for the current
/// thread around each dispatch slice.
pub struct CorrelationContext {
    map: Arc<CorrelationMap>,
}

impl CorrelationContext {
    /// Creates a context with an empty map.
    pub fn empty() -> Self {
        Self {
            map: Arc::new(CorrelationMap::new()),
        }
    }

    /// Captures the currently-ambient tags into a new context.
    ///
    /// Tags visible on the calling thread at capture time (scope-installed
    /// or root) become the initial content of this context's own map.
    pub fn capture() -> Self {
        Self {
            map: Arc::new(CorrelationMap::from_snapshot(snapshot())),
        }
    }

    /// Returns the underlying map.
    pub fn map(&self) -> &Arc<CorrelationMap> {
        &self.map
    }
}

impl ContextElement for CorrelationContext {
    fn name(&self) -> &str {
        "correlation"
    }

    fn install(&self) -> Restore {
        let previous = ACTIVE.with(|slot| slot.borrow_mut().replace(Arc::clone(&self.map)));
        Box::new(previous)
    }

    fn restore(&self, previous: Restore) {
        if let Ok(previous) = previous.downcast::<Option<Arc<CorrelationMap>>>() {
            ACTIVE.with(|slot| *slot.borrow_mut() = *previous);
        }
    }

    fn fork(&self) -> Arc<dyn ContextElement> {
        Arc::new(Self {
            map: Arc::new(self.map.deep_copy()),
        })
    }
}

/// Returns the value for `key` in the ambient correlation map.
pub fn get(key: &str) -> Option<String> {
    ACTIVE.with(|slot| match &*slot.borrow() {
        Some(map) => map.get(key),
        None => ROOT.with(|root| root.borrow().get(key).cloned()),
    })
}

/// Inserts or replaces a tag in the ambient correlation map.
pub fn insert(key: impl Into<String>, value: impl Into<String>) {
    ACTIVE.with(|slot| match &*slot.borrow() {
        Some(map) => map.insert(key, value),
        None => ROOT.with(|root| {
            root.borrow_mut().insert(key.into(), value.into());
        }),
    })
}

/// Removes a tag from the ambient correlation map.
pub fn remove(key: &str) {
    ACTIVE.with(|slot| match &*slot.borrow() {
        Some(map) => map.remove(key),
        None => ROOT.with(|root| {
            root.borrow_mut().remove(key);
        }),
    })
}

/// Removes all tags from the ambient correlation map.
pub fn clear() {
    ACTIVE.with(|slot| match &*slot.borrow() {
        Some(map) => map.clear(),
        None => ROOT.with(|root| root.borrow_mut().clear()),
    })
}

/// Returns a copy of all tags in the ambient correlation map.
pub fn snapshot() -> HashMap<String, String> {
    ACTIVE.with(|slot| match &*slot.borrow() {
        Some(map) => map.snapshot(),
        None => ROOT.with(|root| root.borrow().clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::InstallGuard;

    fn guard_elements(ctx: CorrelationContext) -> Vec<Arc<dyn ContextElement>> {
        vec![Arc::new(ctx)]
    }

    #[test]
    fn test_root_map_used_outside_scope() {
        clear();
        assert_eq!(get("request_id"), None);

        insert("request_id", "r-1");
        assert_eq!(get("request_id"), Some("r-1".to_string()));

        remove("request_id");
        assert_eq!(get("request_id"), None);
    }

    #[test]
    fn test_installed_context_shadows_root() {
        clear();
        insert("source", "root");

        let ctx = CorrelationContext::empty();
        ctx.map().insert("source", "scope");

        let elements = guard_elements(ctx);
        {
            let _guard = InstallGuard::install(&elements);
            assert_eq!(get("source"), Some("scope".to_string()));
            insert("added", "inside");
        }

        // Root map untouched by scope-side mutation.
        assert_eq!(get("source"), Some("root".to_string()));
        assert_eq!(get("added"), None);
        clear();
    }

    #[test]
    fn test_capture_copies_ambient_tags() {
        clear();
        insert("trace", "t-9");

        let ctx = CorrelationContext::capture();
        assert_eq!(ctx.map().get("trace"), Some("t-9".to_string()));

        // Mutating the capture does not touch the ambient root map.
        ctx.map().insert("trace", "t-10");
        assert_eq!(get("trace"), Some("t-9".to_string()));
        clear();
    }

    #[test]
    fn test_fork_isolates_child_mutations() {
        let parent = CorrelationContext::empty();
        parent.map().insert("tenant", "A");

        let child = parent.fork();
        let child_elements = vec![child];
        {
            let _guard = InstallGuard::install(&child_elements);
            insert("tenant", "B");
            insert("child_only", "yes");
            assert_eq!(get("tenant"), Some("B".to_string()));
        }

        // Parent snapshot still reads A and never sees the child's tag.
        assert_eq!(parent.map().get("tenant"), Some("A".to_string()));
        assert_eq!(parent.map().get("child_only"), None);
    }

    #[test]
    fn test_restore_returns_previous_map() {
        let outer = CorrelationContext::empty();
        outer.map().insert("level", "outer");
        let inner = CorrelationContext::empty();
        inner.map().insert("level", "inner");

        let outer_elements = guard_elements(outer);
        let inner_elements = guard_elements(inner);
        {
            let _outer_guard = InstallGuard::install(&outer_elements);
            assert_eq!(get("level"), Some("outer".to_string()));
            {
                let _inner_guard = InstallGuard::install(&inner_elements);
                assert_eq!(get("level"), Some("inner".to_string()));
            }
            assert_eq!(get("level"), Some("outer".to_string()));
        }
    }

    #[test]
    fn test_snapshot_of_installed_context() {
        let ctx = CorrelationContext::empty();
        ctx.map().insert("a", "1");
        ctx.map().insert("b", "2");

        let elements = guard_elements(ctx);
        let _guard = InstallGuard::install(&elements);
        let snap = snapshot();
        assert_eq!(snap.get("a"), Some(&"1".to_string()));
        assert_eq!(snap.get("b"), Some(&"2".to_string()));
    }
}
