use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::FusedFuture;
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

use crate::error::SequencerError;

// ─── Phase ────────────────────────────────────────────────────────────────

/// Where a run is in its lifecycle.
///
/// ```text
/// Idle → Starting → Running → Committing  → Succeeded
///                          ↘ RollingBack → Failed
/// Idle → Succeeded                          (empty queue)
/// ```
///
/// `Succeeded` and `Failed` are the two done states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Starting,
    Running,
    Committing,
    RollingBack,
    Succeeded,
    Failed,
}

impl Phase {
    pub fn is_done(self) -> bool {
        matches!(self, Phase::Succeeded | Phase::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Starting => "starting",
            Phase::Running => "running",
            Phase::Committing => "committing",
            Phase::RollingBack => "rolling_back",
            Phase::Succeeded => "succeeded",
            Phase::Failed => "failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Finished ─────────────────────────────────────────────────────────────

/// What the run task sends back through the terminal channel.
#[derive(Debug)]
pub(crate) struct Finished {
    pub(crate) result: Result<(), SequencerError>,
    pub(crate) actions_invoked: usize,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) elapsed: Duration,
}

impl Finished {
    fn lost() -> Self {
        Self {
            result: Err(SequencerError::Lost),
            actions_invoked: 0,
            started_at: Utc::now(),
            elapsed: Duration::ZERO,
        }
    }
}

// ─── RunReport ────────────────────────────────────────────────────────────

/// Terminal outcome of a run plus bookkeeping about how it got there.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub outcome: Result<(), SequencerError>,
    /// Actions registered before `run`.
    pub actions_total: usize,
    /// Actions actually invoked (the failing one included).
    pub actions_invoked: usize,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }
}

// ─── RunHandle ────────────────────────────────────────────────────────────

/// Handle to a running transaction, returned by
/// [`Sequencer::run`](crate::Sequencer::run).
///
/// Awaiting it yields the run's single terminal signal: `Ok(())` once the
/// transaction committed, or the [`SequencerError`] that ended it.
/// Dropping the handle detaches the run; it still commits or rolls back.
#[derive(Debug)]
pub struct RunHandle {
    run_id: Uuid,
    actions_total: usize,
    rx: oneshot::Receiver<Finished>,
    finished: Option<Finished>,
    terminated: bool,
    phase: watch::Receiver<Phase>,
    cancel: watch::Sender<bool>,
}

impl RunHandle {
    pub(crate) fn new(
        run_id: Uuid,
        actions_total: usize,
        rx: oneshot::Receiver<Finished>,
        phase: watch::Receiver<Phase>,
        cancel: watch::Sender<bool>,
    ) -> Self {
        Self {
            run_id,
            actions_total,
            rx,
            finished: None,
            terminated: false,
            phase,
            cancel,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// The phase the run is in right now.
    ///
    /// The done phase is published just after the outcome is sent, so an
    /// awaited outcome may briefly be ahead of this value.
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Ask the run to stop.
    ///
    /// Observed before each action and while waiting on `begin` or on an
    /// action; an open transaction is rolled back and the run fails with
    /// [`SequencerError::Cancelled`]. A commit or rollback already issued is
    /// left to finish. No effect once the run is done.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// True once the outcome is available: when this returns true,
    /// [`try_outcome`](Self::try_outcome) returns `Some` unless the outcome
    /// was already taken by awaiting the handle.
    pub fn is_finished(&self) -> bool {
        self.finished.is_some() || self.phase().is_done()
    }

    /// Check for the terminal signal without waiting.
    ///
    /// Returns `None` while the run is still going. Always `None` directly
    /// after [`Sequencer::run`](crate::Sequencer::run) returns, even for an
    /// empty queue: the outcome is only produced by the spawned task.
    pub fn try_outcome(&mut self) -> Option<&Result<(), SequencerError>> {
        if self.finished.is_none() && !self.terminated {
            match self.rx.try_recv() {
                Ok(finished) => self.finished = Some(finished),
                Err(oneshot::error::TryRecvError::Closed) => self.finished = Some(Finished::lost()),
                Err(oneshot::error::TryRecvError::Empty) => {}
            }
        }
        self.finished.as_ref().map(|f| &f.result)
    }

    /// Wait for the run to finish and return the full [`RunReport`].
    pub async fn report(mut self) -> RunReport {
        let finished = std::future::poll_fn(|cx| self.poll_finished(cx)).await;
        RunReport {
            run_id: self.run_id,
            outcome: finished.result,
            actions_total: self.actions_total,
            actions_invoked: finished.actions_invoked,
            started_at: finished.started_at,
            elapsed: finished.elapsed,
        }
    }

    fn poll_finished(&mut self, cx: &mut Context<'_>) -> Poll<Finished> {
        if let Some(finished) = self.finished.take() {
            self.terminated = true;
            return Poll::Ready(finished);
        }
        let received = std::task::ready!(Pin::new(&mut self.rx).poll(cx));
        self.terminated = true;
        Poll::Ready(received.unwrap_or_else(|_| Finished::lost()))
    }
}

impl Future for RunHandle {
    type Output = Result<(), SequencerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.poll_finished(cx).map(|finished| finished.result)
    }
}

impl FusedFuture for RunHandle {
    fn is_terminated(&self) -> bool {
        self.terminated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (RunHandle, oneshot::Sender<Finished>, watch::Sender<Phase>) {
        let (tx, rx) = oneshot::channel();
        let (phase_tx, phase_rx) = watch::channel(Phase::Idle);
        let (cancel_tx, _cancel_rx) = watch::channel(false);
        let handle = RunHandle::new(Uuid::new_v4(), 2, rx, phase_rx, cancel_tx);
        (handle, tx, phase_tx)
    }

    fn finished(result: Result<(), SequencerError>) -> Finished {
        Finished {
            result,
            actions_invoked: 2,
            started_at: Utc::now(),
            elapsed: Duration::from_millis(3),
        }
    }

    #[test]
    fn try_outcome_is_none_until_sent() {
        let (mut handle, tx, _phase) = handle();
        assert!(handle.try_outcome().is_none());
        tx.send(finished(Ok(()))).unwrap();
        assert!(matches!(handle.try_outcome(), Some(Ok(()))));
        // Still there on a second look.
        assert!(handle.is_finished());
        assert!(matches!(handle.try_outcome(), Some(Ok(()))));
    }

    #[tokio::test]
    async fn outcome_seen_by_try_outcome_is_still_awaitable() {
        let (mut handle, tx, _phase) = handle();
        tx.send(finished(Err(SequencerError::Commit("disk full".into()))))
            .unwrap();
        assert!(handle.try_outcome().is_some());
        let err = handle.await.unwrap_err();
        assert!(matches!(err, SequencerError::Commit(_)));
    }

    #[tokio::test]
    async fn dropped_sender_is_lost() {
        let (handle, tx, _phase) = handle();
        drop(tx);
        assert!(matches!(handle.await, Err(SequencerError::Lost)));
    }

    #[tokio::test]
    async fn report_carries_counts() {
        let (handle, tx, _phase) = handle();
        let id = handle.run_id();
        tx.send(finished(Ok(()))).unwrap();
        let report = handle.report().await;
        assert_eq!(report.run_id, id);
        assert!(report.succeeded());
        assert_eq!(report.actions_total, 2);
        assert_eq!(report.actions_invoked, 2);
        assert_eq!(report.elapsed, Duration::from_millis(3));
    }

    #[test]
    fn phase_follows_the_watch() {
        let (handle, _tx, phase) = handle();
        assert_eq!(handle.phase(), Phase::Idle);
        phase.send(Phase::Running).unwrap();
        assert_eq!(handle.phase(), Phase::Running);
        assert!(!handle.is_finished());
        phase.send(Phase::Failed).unwrap();
        assert!(handle.is_finished());
        assert_eq!(Phase::RollingBack.to_string(), "rolling_back");
    }
}
