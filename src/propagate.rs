//! Context propagation around suspension points.
//!
//! [`Propagated`] wraps a future so that the scope's context elements are
//! installed immediately before every poll and restored immediately after
//! it, whether the slice ends in completion, failure, or a suspension
//! handoff. Each resumption slice gets its own install/restore pair; nothing
//! stays installed across the suspension gap, so the wrapped future can
//! resume on any worker thread without leaking or losing ambient state.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use pin_project_lite::pin_project;

use crate::context::{ContextElement, InstallGuard};

pin_project! {
    /// Future wrapper that installs context elements around each poll slice.
    pub struct Propagated<F> {
        #[pin]
        inner: F,
        elements: Vec<Arc<dyn ContextElement>>,
    }
}

impl<F> Propagated<F> {
    /// Wraps `inner` so that `elements` are ambient during every poll.
    ///
    /// Elements are installed in the order given and restored in reverse.
    pub fn new(elements: Vec<Arc<dyn ContextElement>>, inner: F) -> Self {
        Self { inner, elements }
    }
}

impl<F: Future> Future for Propagated<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let _guard = InstallGuard::install(this.elements);
        this.inner.poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Restore;
    use std::cell::Cell;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    thread_local! {
        static AMBIENT: Cell<u64> = const { Cell::new(0) };
    }

    /// Element that installs a numeric marker and counts pairings.
    struct MarkerElement {
        value: u64,
        installs: AtomicUsize,
        restores: AtomicUsize,
    }

    impl MarkerElement {
        fn new(value: u64) -> Arc<Self> {
            Arc::new(Self {
                value,
                installs: AtomicUsize::new(0),
                restores: AtomicUsize::new(0),
            })
        }
    }

    impl ContextElement for MarkerElement {
        fn name(&self) -> &str {
            "marker"
        }

        fn install(&self) -> Restore {
            self.installs.fetch_add(1, Ordering::SeqCst);
            let previous = AMBIENT.with(|slot| slot.replace(self.value));
            Box::new(previous)
        }

        fn restore(&self, previous: Restore) {
            self.restores.fetch_add(1, Ordering::SeqCst);
            if let Ok(previous) = previous.downcast::<u64>() {
                AMBIENT.with(|slot| slot.set(*previous));
            }
        }

        fn fork(&self) -> Arc<dyn ContextElement> {
            MarkerElement::new(self.value)
        }
    }

    fn ambient() -> u64 {
        AMBIENT.with(|slot| slot.get())
    }

    #[tokio::test]
    async fn test_element_ambient_only_during_poll() {
        let marker = MarkerElement::new(7);
        let observed = Arc::new(Mutex::new(Vec::new()));

        let observed_clone = Arc::clone(&observed);
        let elements: Vec<Arc<dyn ContextElement>> = vec![marker.clone()];
        let fut = Propagated::new(elements, async move {
            observed_clone.lock().unwrap().push(ambient());
            tokio::task::yield_now().await;
            observed_clone.lock().unwrap().push(ambient());
        });

        assert_eq!(ambient(), 0);
        fut.await;
        assert_eq!(ambient(), 0);

        // The marker was ambient inside both poll slices.
        assert_eq!(*observed.lock().unwrap(), vec![7, 7]);
    }

    #[tokio::test]
    async fn test_install_restore_pair_per_slice() {
        let marker = MarkerElement::new(3);

        let elements: Vec<Arc<dyn ContextElement>> = vec![marker.clone()];
        let fut = Propagated::new(elements, async {
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
        });
        fut.await;

        // Three poll slices (initial + two resumptions), three pairs.
        let installs = marker.installs.load(Ordering::SeqCst);
        let restores = marker.restores.load(Ordering::SeqCst);
        assert_eq!(installs, 3);
        assert_eq!(installs, restores);
    }

    #[tokio::test]
    async fn test_restores_when_inner_future_errs() {
        let marker = MarkerElement::new(11);

        let elements: Vec<Arc<dyn ContextElement>> = vec![marker.clone()];
        let fut = Propagated::new(elements, async { Err::<(), &str>("handler failed") });
        let result = fut.await;

        assert!(result.is_err());
        assert_eq!(ambient(), 0);
        assert_eq!(
            marker.installs.load(Ordering::SeqCst),
            marker.restores.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn test_propagation_across_spawned_resumption() {
        // Resume on a different worker thread; the marker must follow.
        let marker = MarkerElement::new(42);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let elements: Vec<Arc<dyn ContextElement>> = vec![marker];
        let fut = Propagated::new(elements, async move {
            let before = ambient();
            let _ = rx.await;
            let after = ambient();
            (before, after)
        });

        let handle = tokio::spawn(fut);
        tokio::task::yield_now().await;
        let _ = tx.send(());
        let (before, after) = handle.await.unwrap();

        assert_eq!(before, 42);
        assert_eq!(after, 42);
    }
}
