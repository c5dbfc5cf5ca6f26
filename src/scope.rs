//! Execution scopes: application-wide and per-request.
//!
//! A [`Scope`] bundles a [`Job`], a dispatch target (the host container's
//! worker pool, represented as a `tokio::runtime::Handle`), and an ordered
//! list of [`ContextElement`]s into a reusable execution environment.
//!
//! [`ApplicationScope`] is created once per process and owns a *supervising*
//! root job: one failed request never takes down its siblings. Each inbound
//! request gets a [`RequestScope`] whose job is a direct child of the root,
//! and whose element list is a copy-on-fork of the application's plus one
//! host-supplied element capturing the request's ambient state, so that
//! host thread-locals the handler depends on survive suspension.
//!
//! Disposal is asymmetric by design: application shutdown *cancels* the root
//! job and joins in-flight work (bounded or unbounded per [`ScopeConfig`]);
//! a request finishing normally *completes* its job, while a host abort
//! (client disconnect) cancels it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::context::{fork_all, ContextElement};
use crate::error::{CancelReason, SetupError};
use crate::job::{Job, JobId, JobState};
use crate::propagate::Propagated;

/// Counter for generating per-request scope identifiers.
static REQUEST_SCOPE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Configuration for the application scope.
#[derive(Clone, Debug)]
pub struct ScopeConfig {
    /// How long shutdown waits for in-flight handlers before giving up.
    ///
    /// `None` waits indefinitely. The default is unbounded, matching the
    /// expectation that a redeploy must not abandon in-flight work.
    pub shutdown_timeout: Option<Duration>,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: None,
        }
    }
}

impl ScopeConfig {
    /// Sets a bounded shutdown wait.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }
}

/// Supplies the per-request context element that captures the host
/// container's ambient request state.
///
/// Implemented by host adapters outside this crate; the core never touches
/// host internals directly. `verify` runs once at application startup so
/// structural incompatibilities surface immediately rather than on the
/// first request.
pub trait ElementProvider: Send + Sync + 'static {
    /// Checks host compatibility at application startup.
    fn verify(&self) -> Result<(), SetupError> {
        Ok(())
    }

    /// Captures the current request's ambient host state into an element.
    ///
    /// Called on the request thread at request start, before any suspension
    /// can occur.
    fn capture(&self) -> Arc<dyn ContextElement>;
}

/// A bundle of job, dispatch target, and context elements.
///
/// Not long-lived state by itself: the application scope holds one for the
/// process lifetime and a fresh one is assembled per request.
#[derive(Clone)]
pub struct Scope {
    job: Job,
    dispatch: Handle,
    elements: Arc<Vec<Arc<dyn ContextElement>>>,
    tracker: TaskTracker,
}

impl Scope {
    fn new(
        job: Job,
        dispatch: Handle,
        elements: Vec<Arc<dyn ContextElement>>,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            job,
            dispatch,
            elements: Arc::new(elements),
            tracker,
        }
    }

    /// Returns the job owning this scope.
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Returns the dispatch target.
    pub fn dispatch(&self) -> &Handle {
        &self.dispatch
    }

    /// Returns the scope's context elements, in declaration order.
    pub fn elements(&self) -> &[Arc<dyn ContextElement>] {
        &self.elements
    }

    /// Returns the task tracker used for the shutdown join.
    pub(crate) fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Spawns concurrent child work onto the dispatch target.
    ///
    /// Every element is forked for the child (copy-on-fork), so mutations
    /// the child makes — adding a correlation tag, say — stay confined to
    /// its own subtree. The work races the scope's cancellation token;
    /// `None` means it was cancelled before producing a value.
    pub fn spawn<F>(&self, work: F) -> JoinHandle<Option<F::Output>>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let forked = fork_all(&self.elements);
        let propagated = Propagated::new(forked, work);
        let token = self.job.cancellation_token().clone();
        self.tracker.spawn_on(
            async move {
                tokio::select! {
                    out = propagated => Some(out),
                    () = token.cancelled() => None,
                }
            },
            &self.dispatch,
        )
    }
}

/// The root scope, one per running server process.
pub struct ApplicationScope {
    scope: Scope,
    config: ScopeConfig,
    providers: Vec<Arc<dyn ElementProvider>>,
}

impl ApplicationScope {
    /// Initializes the application scope.
    ///
    /// Verifies every host [`ElementProvider`] up front: a provider that
    /// cannot hook its host state fails startup here, loudly, instead of
    /// failing the first request.
    ///
    /// `dispatch` is the host container's own worker pool; the scope never
    /// manages a pool of its own, so operators have only one pool to tune.
    pub fn initialize(
        dispatch: Handle,
        config: ScopeConfig,
        elements: Vec<Arc<dyn ContextElement>>,
        providers: Vec<Arc<dyn ElementProvider>>,
    ) -> Result<Self, SetupError> {
        for provider in &providers {
            provider.verify()?;
        }

        let job = Job::root(JobId::new("application"), true);

        // Application-level elements live for the process; their release is
        // tied to the root job's terminal state, same discipline as requests.
        let for_release = elements.clone();
        job.on_terminal(move |state| {
            debug!(final_state = %state, released = for_release.len(), "Releasing application context elements");
            for element in &for_release {
                element.release();
            }
        });

        info!(shutdown_timeout = ?config.shutdown_timeout, "Application scope initialized");

        Ok(Self {
            scope: Scope::new(job, dispatch, elements, TaskTracker::new()),
            config,
            providers,
        })
    }

    /// Returns the underlying scope.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Returns the supervising root job.
    pub fn job(&self) -> &Job {
        self.scope.job()
    }

    /// Creates a scope for an inbound request.
    pub fn request_scope(&self) -> RequestScope {
        let seq = REQUEST_SCOPE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let id = JobId::new(format!("request-{}", seq));
        let job = self.scope.job().child(id);

        let mut elements = fork_all(&self.scope.elements);
        for provider in &self.providers {
            elements.push(provider.capture());
        }

        // Elements are released exactly once, when the request job reaches a
        // terminal state, regardless of which path finished it.
        let for_release = elements.clone();
        job.on_terminal(move |state| {
            debug!(final_state = %state, released = for_release.len(), "Releasing request context elements");
            for element in &for_release {
                element.release();
            }
        });

        debug!(job_id = %job.id(), "Request scope created");
        RequestScope {
            scope: Scope::new(
                job,
                self.scope.dispatch.clone(),
                elements,
                self.scope.tracker.clone(),
            ),
        }
    }

    /// Shuts the application down.
    ///
    /// Cancels the root job (which cancels every in-flight request job) and
    /// waits for all tracked work — handler drivers and response deliveries —
    /// to finish, bounded by [`ScopeConfig::shutdown_timeout`].
    pub async fn shutdown(&self) {
        info!("Application scope shutting down");
        self.scope.job().cancel(CancelReason::Shutdown);
        self.scope.tracker.close();

        match self.config.shutdown_timeout {
            Some(timeout) => {
                if tokio::time::timeout(timeout, self.scope.tracker.wait())
                    .await
                    .is_err()
                {
                    warn!(
                        timeout_ms = timeout.as_millis() as u64,
                        "Shutdown timed out waiting for in-flight handlers"
                    );
                    return;
                }
            }
            None => self.scope.tracker.wait().await,
        }

        info!("All in-flight handlers terminated");
    }
}

/// A scope created per inbound request, parented to the application scope.
pub struct RequestScope {
    scope: Scope,
}

impl RequestScope {
    /// Returns the underlying scope.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Returns the request job.
    pub fn job(&self) -> &Job {
        self.scope.job()
    }

    /// Returns the dispatch target.
    pub fn dispatch(&self) -> &Handle {
        self.scope.dispatch()
    }

    /// Returns the request's context elements.
    pub fn elements(&self) -> &[Arc<dyn ContextElement>] {
        self.scope.elements()
    }

    /// Completes the request job: the request finished normally.
    ///
    /// The job may linger in `Completing` until in-flight child work
    /// finishes; element release waits for the terminal state.
    pub fn complete(&self) {
        self.scope.job().complete();
    }

    /// Aborts the request: the host reported a client disconnect or the
    /// request was otherwise torn down before completing.
    pub fn abort(&self, reason: CancelReason) {
        self.scope.job().cancel(reason);
    }

    /// Returns true if the request job is still active.
    pub fn is_active(&self) -> bool {
        self.scope.job().is_active()
    }

    /// Returns the final state, if the request job is terminal.
    pub fn final_state(&self) -> Option<JobState> {
        let state = self.scope.job().state();
        state.is_terminal().then_some(state)
    }
}
