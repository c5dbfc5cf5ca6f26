//! Job tree: cancellable, hierarchically supervised units of work.
//!
//! A [`Job`] is a node in a cancellation/completion tree. Jobs form the
//! structural backbone of the crate: the application scope owns a supervising
//! root job, each request scope owns a direct child, and every handler
//! invocation is tied to its request's job.
//!
//! # State machine
//!
//! ```text
//! Active ──complete()──▶ Completing ──last child finishes──▶ Completed
//!    │                        │
//!    └──────cancel()──────────┴──────────▶ Cancelled
//! ```
//!
//! Terminal states (`Completed`, `Cancelled`) never revert. `complete()` and
//! `cancel()` on an already-terminal job are silent no-ops, which tolerates
//! races between normal completion and cancellation during shutdown.
//!
//! # Supervision
//!
//! Cancelling a job cancels all current and future children. In the other
//! direction, a child that finishes *abnormally* (cancelled with a cause)
//! cancels an ordinary parent with that same cause, while a supervising
//! parent (the application root) absorbs the failure and stays active.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::CancelReason;

/// Global counter for generating unique job IDs.
static JOB_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a job.
///
/// Job IDs are strings so they can carry meaningful request identity (a
/// request ID, a trace ID) or be generated automatically.
#[derive(Clone, Hash, Eq, PartialEq)]
pub struct JobId(String);

impl JobId {
    /// Creates a job ID with the given string value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates a unique auto-generated job ID of the form `job-{n}`.
    pub fn auto() -> Self {
        let counter = JOB_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("job-{}", counter))
    }

    /// Returns the string value of this job ID.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Lifecycle state of a job.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum JobState {
    /// Running; children may be created.
    #[default]
    Active,

    /// `complete()` was called while children were still in flight; the job
    /// finalizes to `Completed` once the last child finishes.
    Completing,

    /// Finished normally.
    Completed,

    /// Cancelled before completion; see [`Job::cancel_reason`] for the cause.
    Cancelled,
}

impl JobState {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Returns true if the job is still doing work (Active or Completing).
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active | Self::Completing)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::Completing => write!(f, "Completing"),
            Self::Completed => write!(f, "Completed"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Hook invoked exactly once when the job reaches a terminal state.
type TerminalHook = Box<dyn FnOnce(JobState) + Send + 'static>;

/// State guarded by the job's single mutex.
///
/// Keeping the state and the children list under one lock makes compound
/// transitions (complete-with-children, auto-finalize) atomic.
struct Core {
    state: JobState,
    children: Vec<Job>,
}

struct JobInner {
    id: JobId,
    /// Weak back-reference; a child never owns its parent.
    parent: Weak<JobInner>,
    /// A supervising job absorbs child failures instead of failing itself.
    supervising: bool,
    token: CancellationToken,
    core: Mutex<Core>,
    /// Broadcasts state changes to `join()` waiters.
    state_tx: watch::Sender<JobState>,
    cause: Mutex<Option<CancelReason>>,
    hooks: Mutex<Vec<TerminalHook>>,
}

/// A node in the cancellation/completion tree.
///
/// `Job` is a cheap-to-clone handle; all clones refer to the same node.
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

impl Job {
    /// Creates a root job with no parent.
    ///
    /// A supervising root absorbs child failures without cancelling itself,
    /// which is the behavior required at the application level: one failed
    /// request must not take down every other in-flight request.
    pub fn root(id: JobId, supervising: bool) -> Self {
        let (state_tx, _) = watch::channel(JobState::Active);
        Self {
            inner: Arc::new(JobInner {
                id,
                parent: Weak::new(),
                supervising,
                token: CancellationToken::new(),
                core: Mutex::new(Core {
                    state: JobState::Active,
                    children: Vec::new(),
                }),
                state_tx,
                cause: Mutex::new(None),
                hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Creates a new child of this job.
    ///
    /// The child's cancellation token is derived from this job's token, so
    /// cancelling the parent reaches the child even before its own state
    /// machine catches up. A child created under an already-terminal parent
    /// is born cancelled: cancellation covers future children too.
    pub fn child(&self, id: JobId) -> Job {
        let (state_tx, _) = watch::channel(JobState::Active);
        let child = Job {
            inner: Arc::new(JobInner {
                id,
                parent: Arc::downgrade(&self.inner),
                supervising: false,
                token: self.inner.token.child_token(),
                core: Mutex::new(Core {
                    state: JobState::Active,
                    children: Vec::new(),
                }),
                state_tx,
                cause: Mutex::new(None),
                hooks: Mutex::new(Vec::new()),
            }),
        };

        let born_cancelled = {
            let mut core = self.inner.core.lock().expect("job core lock poisoned");
            if core.state.is_terminal() {
                true
            } else {
                core.children.push(child.clone());
                false
            }
        };

        if born_cancelled {
            debug!(
                job_id = %child.id(),
                parent_id = %self.id(),
                "Child created under terminal parent; born cancelled"
            );
            child.cancel(CancelReason::ParentCancelled);
        }

        child
    }

    /// Returns this job's identifier.
    pub fn id(&self) -> &JobId {
        &self.inner.id
    }

    /// Returns the current state.
    pub fn state(&self) -> JobState {
        *self.inner.state_tx.borrow()
    }

    /// Returns true if the job has not yet reached a terminal state.
    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    /// Returns the cancellation token for this job.
    ///
    /// The token trips when this job (or any ancestor) is cancelled; race it
    /// against pending awaits with `tokio::select!`.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.token
    }

    /// Returns the cancellation cause, if the job was cancelled.
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        self.inner.cause.lock().expect("job cause lock poisoned").clone()
    }

    /// Registers a hook to run exactly once when the job reaches a terminal
    /// state. If the job is already terminal, the hook runs immediately.
    pub fn on_terminal(&self, hook: impl FnOnce(JobState) + Send + 'static) {
        let mut pending: Option<TerminalHook> = Some(Box::new(hook));
        let run_now = {
            let core = self.inner.core.lock().expect("job core lock poisoned");
            if core.state.is_terminal() {
                Some(core.state)
            } else {
                if let Some(hook) = pending.take() {
                    self.inner
                        .hooks
                        .lock()
                        .expect("job hooks lock poisoned")
                        .push(hook);
                }
                None
            }
        };
        if let (Some(state), Some(hook)) = (run_now, pending.take()) {
            hook(state);
        }
    }

    /// Cancels this job and, depth-first, all of its children.
    ///
    /// Idempotent: cancelling an already-terminal job is a silent no-op so
    /// that concurrent cancellation races (shutdown vs. normal completion)
    /// need no coordination from callers. Never blocks the cancelling thread.
    pub fn cancel(&self, reason: CancelReason) {
        let children = {
            let mut core = self.inner.core.lock().expect("job core lock poisoned");
            if core.state.is_terminal() {
                return;
            }
            {
                let mut cause = self.inner.cause.lock().expect("job cause lock poisoned");
                if cause.is_none() {
                    *cause = Some(reason.clone());
                }
            }
            core.state = JobState::Cancelled;
            // send_replace stores even with no subscribers, and publishing
            // under the core lock keeps the watch in transition order.
            self.inner.state_tx.send_replace(JobState::Cancelled);
            std::mem::take(&mut core.children)
        };

        debug!(job_id = %self.id(), reason = %reason, "Job cancelled");

        for child in children {
            child.cancel(CancelReason::ParentCancelled);
        }

        self.inner.token.cancel();
        self.run_terminal_hooks(JobState::Cancelled);
        self.notify_parent(JobState::Cancelled);
    }

    /// Completes this job.
    ///
    /// If children are still in flight the job enters `Completing` and
    /// auto-finalizes to `Completed` once the last child finishes; a request
    /// may still have in-flight child work at response-write time. Calling
    /// `complete` on a terminal or already-completing job is a silent no-op.
    pub fn complete(&self) {
        let finalized = {
            let mut core = self.inner.core.lock().expect("job core lock poisoned");
            match core.state {
                JobState::Active if core.children.is_empty() => {
                    core.state = JobState::Completed;
                    self.inner.state_tx.send_replace(JobState::Completed);
                    true
                }
                JobState::Active => {
                    core.state = JobState::Completing;
                    self.inner.state_tx.send_replace(JobState::Completing);
                    false
                }
                // Completing, Completed, Cancelled: nothing to do.
                _ => return,
            }
        };

        if finalized {
            debug!(job_id = %self.id(), "Job completed");
            self.run_terminal_hooks(JobState::Completed);
            self.notify_parent(JobState::Completed);
        } else {
            debug!(job_id = %self.id(), "Job completing; waiting for children");
        }
    }

    /// Waits until the job reaches a terminal state and returns it.
    ///
    /// Used only during orderly shutdown, never on a request-handling thread.
    pub async fn join(&self) -> JobState {
        let mut rx = self.inner.state_tx.subscribe();
        // Bound before matching: the Ok value borrows rx.
        let result = rx.wait_for(|state| state.is_terminal()).await;
        match result {
            Ok(state) => *state,
            // Sender dropped; the job handle we hold keeps it alive, so this
            // only happens if every handle is gone. Report the last state.
            Err(_) => self.state(),
        }
    }

    /// Returns the number of live (non-terminal) children.
    pub fn child_count(&self) -> usize {
        self.inner
            .core
            .lock()
            .expect("job core lock poisoned")
            .children
            .len()
    }

    /// Called by a child when it reaches a terminal state.
    fn child_finished(&self, child_id: &JobId, child_state: JobState, child_cause: Option<CancelReason>) {
        let finalize = {
            let mut core = self.inner.core.lock().expect("job core lock poisoned");
            core.children.retain(|c| c.id() != child_id);

            if child_state == JobState::Cancelled && !self.inner.supervising && !core.state.is_terminal() {
                // Fail-fast: adopt the child's cause as our own cancellation.
                drop(core);
                let cause = child_cause.unwrap_or(CancelReason::ChildFailed);
                debug!(
                    job_id = %self.id(),
                    child_id = %child_id,
                    "Child cancelled abnormally; cancelling parent"
                );
                self.cancel(cause);
                return;
            }

            if core.state == JobState::Completing && core.children.is_empty() {
                core.state = JobState::Completed;
                self.inner.state_tx.send_replace(JobState::Completed);
                true
            } else {
                false
            }
        };

        if finalize {
            debug!(job_id = %self.id(), "Last child finished; job completed");
            self.run_terminal_hooks(JobState::Completed);
            self.notify_parent(JobState::Completed);
        }
    }

    fn notify_parent(&self, state: JobState) {
        if let Some(parent) = self.inner.parent.upgrade() {
            let cause = self.cancel_reason();
            Job { inner: parent }.child_finished(self.id(), state, cause);
        }
    }

    fn run_terminal_hooks(&self, state: JobState) {
        let hooks = std::mem::take(&mut *self.inner.hooks.lock().expect("job hooks lock poisoned"));
        for hook in hooks {
            hook(state);
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("supervising", &self.inner.supervising)
            .finish()
    }
}
