//! Error types for scope, bridge, and dispatch failures.
//!
//! The taxonomy distinguishes four situations that need different handling:
//!
//! - [`InvokeError`]: the outcome of a handler invocation when it did not
//!   produce a value. Handler failures are *expected* outcomes of request
//!   processing and complete the owning job; cancellations are a distinct
//!   kind so observers can tell "the client gave up" from "the handler
//!   failed".
//! - [`DispatchError`]: the host refused the suspension protocol. Fatal to
//!   the request and surfaced to the caller, never silently dropped.
//! - [`SetupError`]: structural incompatibility detected at application
//!   startup. Raised immediately, never deferred to the first request.
//! - [`SinkError`]: the host's response sink rejected a delivery (e.g. the
//!   client connection is already closed). Swallowed at the bridge.

use std::fmt;
use thiserror::Error;

/// Boxed error type used for handler-domain failures.
///
/// Handlers report their own failures through whatever error type they like;
/// the engine carries it opaquely to the response sink.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Why a job or request was cancelled.
///
/// Carried as the cancellation cause on the job tree and inside
/// [`InvokeError::Cancelled`] deliveries, so that response mapping and log
/// output can distinguish shutdown from client disconnects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CancelReason {
    /// The application is shutting down.
    Shutdown,

    /// The client disconnected or the host aborted the request.
    Disconnect,

    /// The parent job was cancelled; the cancellation propagated down.
    ParentCancelled,

    /// A child job failed abnormally and the parent is not supervising.
    ChildFailed,

    /// The host refused to suspend the exchange for a suspending handler.
    SuspendRefused,

    /// Cancelled explicitly with a caller-supplied reason.
    Aborted(String),
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shutdown => write!(f, "application is shutting down"),
            Self::Disconnect => write!(f, "client disconnected"),
            Self::ParentCancelled => write!(f, "parent job was cancelled"),
            Self::ChildFailed => write!(f, "child job failed"),
            Self::SuspendRefused => write!(f, "host refused to suspend the exchange"),
            Self::Aborted(reason) => write!(f, "aborted: {}", reason),
        }
    }
}

/// Failure outcome of a handler invocation, delivered to the response sink.
#[derive(Debug, Error)]
pub enum InvokeError {
    /// The handler raised a domain/application error.
    ///
    /// This is an expected outcome of request processing: it is delivered
    /// verbatim to the response sink and the request job *completes*.
    #[error("handler failed: {0}")]
    Handler(#[source] BoxError),

    /// The invocation was cancelled before the handler produced a value.
    ///
    /// Process shutdown and client disconnects both arrive here; the request
    /// job is *cancelled* with the same reason.
    #[error("invocation cancelled: {0}")]
    Cancelled(CancelReason),
}

impl InvokeError {
    /// Returns true if this is a cancellation-kind failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

/// Failure of the suspension protocol between dispatcher and host.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The handler suspended but the host refused to release the calling
    /// thread (exchange already suspended, or suspension unsupported).
    ///
    /// Fatal to the request: the request job is aborted and the host must
    /// report a server error.
    #[error("host refused to suspend the exchange")]
    SuspendRefused,
}

/// Structural incompatibility detected during application startup.
///
/// Raised when a host integration cannot hook the thread-local state it
/// needs to propagate (e.g. an incompatible host version). These indicate
/// problems no retry fixes, so they abort startup outright instead of being
/// deferred to the first request.
#[derive(Debug, Error)]
pub enum SetupError {
    /// A host integration failed its startup compatibility check.
    #[error("host integration incompatible: {0}")]
    Incompatible(String),
}

/// The host's response sink failed to accept a delivery.
///
/// A broken client connection must not leak the handler's resources, so the
/// bridge logs and swallows this; the owning job still completes.
#[derive(Debug, Error)]
#[error("response sink rejected delivery: {0}")]
pub struct SinkError(#[source] pub BoxError);

impl SinkError {
    /// Creates a sink error from any error value.
    pub fn new(source: impl Into<BoxError>) -> Self {
        Self(source.into())
    }

    /// Creates a sink error from a plain message.
    pub fn message(msg: impl Into<String>) -> Self {
        Self(msg.into().into())
    }
}
