//! Coroscope - Structured concurrency lifecycle for suspendable request handlers
//!
//! This library gives a thread-per-request host container the lifecycle and
//! context-propagation machinery it needs to run handlers that suspend: a
//! supervised [`job::Job`] tree for cancellation, [`context::ContextElement`]
//! capture/install/restore around every resumption slice, request scopes
//! forked from one application scope, and a single-shot bridge from
//! suspend/resume semantics back to the host's response callback.
//!
//! # High-Level API
//!
//! The [`scope`] and [`dispatch`] modules are the usual entry points:
//!
//! ```ignore
//! use coroscope::dispatch::{HandlerCall, InvocationDispatcher};
//! use coroscope::scope::{ApplicationScope, ScopeConfig};
//!
//! let app = ApplicationScope::initialize(runtime, ScopeConfig::default(), elements, providers)?;
//!
//! // Per request:
//! let scope = app.request_scope();
//! let outcome = InvocationDispatcher::new().dispatch(&scope, call, exchange)?;
//! ```

pub mod bridge;
pub mod context;
pub mod correlation;
pub mod dispatch;
pub mod error;
pub mod job;
pub mod propagate;
pub mod scope;

pub use bridge::{ResponseSink, SuspendResumeBridge};
pub use context::{ContextElement, InstallGuard, Restore};
pub use dispatch::{DispatchOutcome, HandlerCall, HostExchange, InvocationDispatcher};
pub use error::{BoxError, CancelReason, DispatchError, InvokeError, SetupError, SinkError};
pub use job::{Job, JobId, JobState};
pub use propagate::Propagated;
pub use scope::{ApplicationScope, ElementProvider, RequestScope, Scope, ScopeConfig};

/// Version of the coroscope library.
///
/// The version is defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
