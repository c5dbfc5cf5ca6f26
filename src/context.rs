//! Capturable/restorable units of thread-affine ambient state.
//!
//! A [`ContextElement`] snapshots some piece of thread-local state (request
//! identity, correlation tags, host container internals) when it is created,
//! and knows how to make that snapshot ambient on whatever thread a suspended
//! computation later resumes on.
//!
//! The contract has three legs:
//!
//! - `install()` makes the captured value ambient for the current thread and
//!   returns whatever was ambient before.
//! - `restore(previous)` puts the previous value back. Install/restore calls
//!   are strictly paired per dispatch slice; [`InstallGuard`] enforces the
//!   pairing through `Drop`, so it holds on success, failure, panic, and at
//!   suspension handoffs alike.
//! - `fork()` copies the element for a child scope such that mutations in
//!   the child never leak back into the parent's snapshot (copy-on-fork).
//!
//! `release()` frees any resource the element pinned (a suspended host
//! request context, for example). The owning scope guarantees it is called
//! exactly once when the job completes, no matter how many times the element
//! was installed in between.

use std::any::Any;
use std::sync::Arc;

/// Previously-ambient state returned by [`ContextElement::install`] and
/// consumed by [`ContextElement::restore`].
pub type Restore = Box<dyn Any + Send>;

/// A named piece of thread-affine state with a capture/restore contract.
///
/// Implementations capture their snapshot at construction time (the moment
/// the owning scope is created) and reinstall it on every thread the scope's
/// work resumes on.
pub trait ContextElement: Send + Sync + 'static {
    /// Short name for logging.
    fn name(&self) -> &str;

    /// Makes the captured snapshot ambient for the current thread, returning
    /// the previously-ambient value.
    fn install(&self) -> Restore;

    /// Restores the previously-ambient value returned by `install`.
    fn restore(&self, previous: Restore);

    /// Copies this element for a child scope.
    ///
    /// The copy must be deep enough that mutations through the child are
    /// invisible to the parent's snapshot.
    fn fork(&self) -> Arc<dyn ContextElement>;

    /// Releases resources pinned by this element.
    ///
    /// Called exactly once by the owning scope when its job reaches a
    /// terminal state. The default does nothing.
    fn release(&self) {}
}

/// RAII guard that installs a set of elements in declaration order and
/// restores them in reverse order on drop.
///
/// Dropping the guard is the only restore path, which keeps install/restore
/// strictly LIFO per dispatch slice even when the guarded work panics.
pub struct InstallGuard<'a> {
    installed: Vec<(&'a dyn ContextElement, Option<Restore>)>,
}

impl<'a> InstallGuard<'a> {
    /// Installs every element in `elements`, in order.
    pub fn install(elements: &'a [Arc<dyn ContextElement>]) -> Self {
        let mut installed = Vec::with_capacity(elements.len());
        for element in elements {
            let previous = element.install();
            installed.push((element.as_ref(), Some(previous)));
        }
        Self { installed }
    }
}

impl Drop for InstallGuard<'_> {
    fn drop(&mut self) {
        // Reverse order: the last element installed is the first restored.
        for (element, previous) in self.installed.iter_mut().rev() {
            if let Some(previous) = previous.take() {
                element.restore(previous);
            }
        }
    }
}

/// Forks every element in a scope's list for a child scope.
pub(crate) fn fork_all(elements: &[Arc<dyn ContextElement>]) -> Vec<Arc<dyn ContextElement>> {
    elements.iter().map(|e| e.fork()).collect()
}
