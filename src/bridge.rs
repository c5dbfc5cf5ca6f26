//! One-shot adapter from suspend/resume semantics to the host's single-shot
//! response callback.
//!
//! The host container accepts exactly one delivery per request: a value or
//! an error, never both, never twice. A suspended handler, by contrast, can
//! finish three ways — producing a value, raising a failure, or being
//! cancelled from outside — and those can race during shutdown. The
//! [`SuspendResumeBridge`] collapses the race: the first delivery wins,
//! later attempts are dropped silently (ordinary shutdown races are not
//! worth log noise), and the owning job is driven to its terminal state on
//! exactly one path.
//!
//! Delivery always hops onto the dispatch target before the sink runs,
//! because the handler's last resumption may have happened on a thread the
//! host does not permit to write responses from.

use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::error::{InvokeError, SinkError};
use crate::job::Job;

/// The host's single-shot response callback.
///
/// Consuming `Box<Self>` makes the at-most-once contract structural: once a
/// delivery happens there is no sink left to deliver to. A sink that cannot
/// accept the outcome (connection already closed) reports a [`SinkError`];
/// the bridge swallows it, because a broken client connection must not leak
/// the handler's resources.
pub trait ResponseSink<T>: Send + 'static {
    /// Delivers the final outcome of the invocation.
    fn deliver(self: Box<Self>, outcome: Result<T, InvokeError>) -> Result<(), SinkError>;
}

impl<T, F> ResponseSink<T> for F
where
    F: FnOnce(Result<T, InvokeError>) -> Result<(), SinkError> + Send + 'static,
{
    fn deliver(self: Box<Self>, outcome: Result<T, InvokeError>) -> Result<(), SinkError> {
        (self)(outcome)
    }
}

/// Converts the host's single-shot callback into a resumable continuation
/// and drives the owning job to completion on delivery.
///
/// States: Pending (sink present) and Delivered (sink taken). The single
/// synchronized transition is the `take` of the sink slot.
pub struct SuspendResumeBridge<T> {
    sink: Mutex<Option<Box<dyn ResponseSink<T>>>>,
    job: Job,
    dispatch: Handle,
    tracker: TaskTracker,
}

impl<T: Send + 'static> SuspendResumeBridge<T> {
    /// Creates a pending bridge for one handler invocation.
    pub fn new(
        sink: Box<dyn ResponseSink<T>>,
        job: Job,
        dispatch: Handle,
        tracker: TaskTracker,
    ) -> Arc<Self> {
        Arc::new(Self {
            sink: Mutex::new(Some(sink)),
            job,
            dispatch,
            tracker,
        })
    }

    /// Returns true if no delivery has happened yet.
    pub fn is_pending(&self) -> bool {
        self.sink.lock().expect("bridge sink lock poisoned").is_some()
    }

    /// Delivers the outcome: forwards it to the response sink on the
    /// dispatch target, then completes or cancels the owning job.
    ///
    /// Returns true if this call won the delivery; a losing call is a
    /// silent no-op so that cancellation racing normal completion needs no
    /// coordination.
    pub fn deliver(&self, outcome: Result<T, InvokeError>) -> bool {
        let sink = {
            let mut slot = self.sink.lock().expect("bridge sink lock poisoned");
            match slot.take() {
                Some(sink) => sink,
                None => {
                    debug!(job_id = %self.job.id(), "Duplicate delivery dropped");
                    return false;
                }
            }
        };

        // Handler failures are expected outcomes: the job completes. Only
        // cancellation-kind failures cancel it.
        let cancel_reason = match &outcome {
            Err(InvokeError::Cancelled(reason)) => Some(reason.clone()),
            _ => None,
        };

        let job = self.job.clone();
        self.tracker.spawn_on(
            async move {
                if let Err(error) = sink.deliver(outcome) {
                    warn!(
                        job_id = %job.id(),
                        error = %error,
                        "Response sink rejected delivery; completing job anyway"
                    );
                }
                match cancel_reason {
                    Some(reason) => job.cancel(reason),
                    None => job.complete(),
                }
            },
            &self.dispatch,
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CancelReason;
    use crate::job::{JobId, JobState};
    use std::sync::mpsc;
    use std::time::Duration;

    fn recording_sink<T: Send + 'static>(
    ) -> (Box<dyn ResponseSink<T>>, mpsc::Receiver<Result<T, InvokeError>>) {
        let (tx, rx) = mpsc::channel();
        let sink = Box::new(move |outcome: Result<T, InvokeError>| {
            tx.send(outcome).map_err(|_| SinkError::message("receiver gone"))
        });
        (sink, rx)
    }

    fn failing_sink<T: Send + 'static>() -> Box<dyn ResponseSink<T>> {
        Box::new(|_outcome: Result<T, InvokeError>| {
            Err(SinkError::message("connection already closed"))
        })
    }

    async fn settle(job: &Job) -> JobState {
        tokio::time::timeout(Duration::from_secs(2), job.join())
            .await
            .expect("job did not settle")
    }

    #[tokio::test]
    async fn test_success_delivery_completes_job() {
        let job = Job::root(JobId::new("req"), false);
        let (sink, rx) = recording_sink::<&'static str>();
        let bridge =
            SuspendResumeBridge::new(sink, job.clone(), Handle::current(), TaskTracker::new());

        assert!(bridge.is_pending());
        assert!(bridge.deliver(Ok("payload")));
        assert!(!bridge.is_pending());

        assert_eq!(settle(&job).await, JobState::Completed);
        assert_eq!(rx.recv().unwrap().unwrap(), "payload");
    }

    #[tokio::test]
    async fn test_handler_failure_completes_job() {
        let job = Job::root(JobId::new("req"), false);
        let (sink, rx) = recording_sink::<()>();
        let bridge =
            SuspendResumeBridge::new(sink, job.clone(), Handle::current(), TaskTracker::new());

        bridge.deliver(Err(InvokeError::Handler("validation failed".into())));

        // A handler failure is an expected outcome: completed, not cancelled.
        assert_eq!(settle(&job).await, JobState::Completed);
        let delivered = rx.recv().unwrap();
        assert!(matches!(delivered, Err(InvokeError::Handler(_))));
    }

    #[tokio::test]
    async fn test_cancellation_delivery_cancels_job() {
        let job = Job::root(JobId::new("req"), false);
        let (sink, rx) = recording_sink::<()>();
        let bridge =
            SuspendResumeBridge::new(sink, job.clone(), Handle::current(), TaskTracker::new());

        bridge.deliver(Err(InvokeError::Cancelled(CancelReason::Shutdown)));

        assert_eq!(settle(&job).await, JobState::Cancelled);
        assert_eq!(job.cancel_reason(), Some(CancelReason::Shutdown));
        assert!(matches!(
            rx.recv().unwrap(),
            Err(InvokeError::Cancelled(CancelReason::Shutdown))
        ));
    }

    #[tokio::test]
    async fn test_first_delivery_wins() {
        let job = Job::root(JobId::new("req"), false);
        let (sink, rx) = recording_sink::<&'static str>();
        let bridge =
            SuspendResumeBridge::new(sink, job.clone(), Handle::current(), TaskTracker::new());

        assert!(bridge.deliver(Ok("first")));
        assert!(!bridge.deliver(Err(InvokeError::Cancelled(CancelReason::Shutdown))));
        assert!(!bridge.deliver(Ok("third")));

        assert_eq!(settle(&job).await, JobState::Completed);
        assert_eq!(rx.recv().unwrap().unwrap(), "first");
        // Exactly one delivery reached the sink.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sink_failure_swallowed_job_still_completes() {
        let job = Job::root(JobId::new("req"), false);
        let bridge = SuspendResumeBridge::new(
            failing_sink::<&'static str>(),
            job.clone(),
            Handle::current(),
            TaskTracker::new(),
        );

        assert!(bridge.deliver(Ok("lost")));
        assert_eq!(settle(&job).await, JobState::Completed);
    }
}
