//! Handler invocation orchestration.
//!
//! The [`InvocationDispatcher`] runs one handler under a request scope and
//! decides, from the handler's immediate behavior, what to tell the host:
//!
//! - The handler ran to completion on the calling thread (it was declared
//!   non-suspendable, or it was suspendable but never actually yielded):
//!   the dispatcher delivers the result itself, inline, and the host keeps
//!   the thread. The bridge is never constructed on this path.
//! - The handler suspended: the dispatcher asks the host to release the
//!   calling thread, wires the rest of the handler to a
//!   [`SuspendResumeBridge`], and drives it on the dispatch target racing
//!   the request's cancellation token.
//!
//! The two paths are mutually exclusive; per-invocation cleanup (element
//! release, job completion) is owned by the request job's terminal hook in
//! both, so neither path can double-release.
//!
//! Whether a handler is suspendable is decided by the reflection/adaptation
//! layer outside this crate; it arrives here pre-classified as a
//! [`HandlerCall`] variant.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::task::noop_waker;
use tracing::{debug, warn};

use crate::bridge::{ResponseSink, SuspendResumeBridge};
use crate::context::InstallGuard;
use crate::error::{BoxError, CancelReason, DispatchError, InvokeError};
use crate::propagate::Propagated;
use crate::scope::RequestScope;

/// A handler invocation with resolved arguments, classified by the
/// reflection layer.
pub enum HandlerCall<T> {
    /// Runs to completion on the calling thread; cannot yield.
    Blocking(Box<dyn FnOnce() -> Result<T, BoxError> + Send>),

    /// May suspend at await points and resume on any worker thread.
    Suspendable(Pin<Box<dyn Future<Output = Result<T, BoxError>> + Send>>),
}

impl<T> HandlerCall<T> {
    /// Wraps a run-to-completion handler.
    pub fn blocking(handler: impl FnOnce() -> Result<T, BoxError> + Send + 'static) -> Self {
        Self::Blocking(Box::new(handler))
    }

    /// Wraps a suspendable handler.
    pub fn suspendable<F>(handler: F) -> Self
    where
        F: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        Self::Suspendable(Box::pin(handler))
    }
}

/// The host's view of one in-flight exchange.
///
/// Provides the two operations the dispatcher needs from the container: the
/// single-shot response sink, and the "release the calling thread" request
/// used when a handler suspends.
pub trait HostExchange<T>: Send + 'static {
    /// Asks the host to suspend the exchange so the calling thread can
    /// serve other requests.
    ///
    /// Returns false if the exchange cannot be suspended (already
    /// suspended, or suspension unsupported in this context).
    fn suspend(&mut self) -> bool;

    /// Surrenders the single-shot response sink.
    ///
    /// The dispatcher calls this exactly once per invocation.
    fn take_sink(&mut self) -> Box<dyn ResponseSink<T>>;
}

/// What the dispatcher tells the host about the calling thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The handler finished and the response was delivered; the calling
    /// thread may return normally.
    Completed,

    /// The handler suspended; the exchange was suspended and the response
    /// will be delivered later by the bridge.
    Suspended,
}

/// Orchestrates single handler invocations.
#[derive(Clone, Copy, Debug, Default)]
pub struct InvocationDispatcher;

impl InvocationDispatcher {
    /// Creates a dispatcher.
    pub fn new() -> Self {
        Self
    }

    /// Invokes `call` under `scope`, delivering its outcome through
    /// `exchange`.
    ///
    /// Returns [`DispatchOutcome::Suspended`] when the host must release
    /// the calling thread. The only error is [`DispatchError::SuspendRefused`]:
    /// the handler suspended but the host would not release the thread —
    /// fatal to the request, which is aborted before returning, and the
    /// caller must report a server error through its own channel (the sink
    /// is intentionally left untouched on that path; it was never taken).
    pub fn dispatch<T, E>(
        &self,
        scope: &RequestScope,
        call: HandlerCall<T>,
        mut exchange: E,
    ) -> Result<DispatchOutcome, DispatchError>
    where
        T: Send + 'static,
        E: HostExchange<T>,
    {
        let job = scope.job().clone();

        // A request cancelled before dispatch (shutdown race): deliver a
        // cancellation-kind outcome and keep the thread.
        if !job.is_active() {
            let reason = job
                .cancel_reason()
                .unwrap_or(CancelReason::ParentCancelled);
            debug!(job_id = %job.id(), reason = %reason, "Dispatch under terminal job");
            deliver_inline(exchange.take_sink(), Err(InvokeError::Cancelled(reason)));
            return Ok(DispatchOutcome::Completed);
        }

        match call {
            HandlerCall::Blocking(handler) => {
                let result = {
                    let _guard = InstallGuard::install(scope.elements());
                    handler()
                };
                debug!(job_id = %job.id(), "Handler completed without suspending");
                deliver_inline(exchange.take_sink(), result.map_err(InvokeError::Handler));
                job.complete();
                Ok(DispatchOutcome::Completed)
            }

            HandlerCall::Suspendable(handler) => {
                let mut handler =
                    Box::pin(Propagated::new(scope.elements().to_vec(), handler));

                // Undispatched start: poll once on the calling thread so a
                // handler that never yields costs no thread hop.
                let waker = noop_waker();
                let mut poll_cx = Context::from_waker(&waker);
                match handler.as_mut().poll(&mut poll_cx) {
                    Poll::Ready(result) => {
                        // Completed synchronously; the bridge is never
                        // constructed on this path.
                        debug!(job_id = %job.id(), "Suspendable handler completed synchronously");
                        deliver_inline(exchange.take_sink(), result.map_err(InvokeError::Handler));
                        job.complete();
                        Ok(DispatchOutcome::Completed)
                    }

                    Poll::Pending => {
                        if !exchange.suspend() {
                            warn!(job_id = %job.id(), "Host refused to suspend the exchange");
                            job.cancel(CancelReason::SuspendRefused);
                            return Err(DispatchError::SuspendRefused);
                        }
                        debug!(job_id = %job.id(), "Handler suspended; exchange released");

                        let bridge = SuspendResumeBridge::new(
                            exchange.take_sink(),
                            job.clone(),
                            scope.dispatch().clone(),
                            scope.scope().tracker().clone(),
                        );
                        let token = job.cancellation_token().clone();

                        scope.scope().tracker().spawn_on(
                            async move {
                                tokio::select! {
                                    result = &mut handler => {
                                        bridge.deliver(result.map_err(InvokeError::Handler));
                                    }
                                    () = token.cancelled() => {
                                        // Drop the handler so no further
                                        // context installs happen for this
                                        // subtree, then resolve the pending
                                        // await as a cancellation failure.
                                        drop(handler);
                                        let reason = job
                                            .cancel_reason()
                                            .unwrap_or(CancelReason::ParentCancelled);
                                        bridge.deliver(Err(InvokeError::Cancelled(reason)));
                                    }
                                }
                            },
                            scope.dispatch(),
                        );
                        Ok(DispatchOutcome::Suspended)
                    }
                }
            }
        }
    }
}

/// Delivers an outcome directly on the calling thread.
///
/// Used when the handler never suspended: the calling thread is one the
/// host already permits to write responses from, so no redispatch hop is
/// needed. Sink failures are swallowed the same way the bridge swallows
/// them.
fn deliver_inline<T: Send + 'static>(sink: Box<dyn ResponseSink<T>>, outcome: Result<T, InvokeError>) {
    if let Err(error) = sink.deliver(outcome) {
        warn!(error = %error, "Response sink rejected inline delivery");
    }
}
