use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use crate::action::{settle, Action, BoxedAction, Completion, Emitter, Invocation};
use crate::config::SequencerConfig;
use crate::error::{ActionError, BoxError, SequencerError};
use crate::handle::{Finished, Phase, RunHandle};
use crate::store::Store;

// ─── Sequencer ────────────────────────────────────────────────────────────

/// Runs queued actions in order inside one store transaction.
///
/// Actions are registered with the chainable `add*` methods and executed
/// by [`run`](Sequencer::run), which consumes the sequencer: one
/// sequencer drives exactly one transaction.
///
/// ```rust,ignore
/// let handle = Sequencer::new(store)
///     .add_ready(|s: &mut MemorySession| s.increment("checking", -25).map(drop))
///     .add_emitter(|s| {
///         let s = s.clone();
///         Emitter::spawn(async move { s.put("audit", "withdrawal") })
///     })
///     .run();
/// handle.await?;
/// ```
pub struct Sequencer<S: Store> {
    store: S,
    queue: VecDeque<BoxedAction<S::Session>>,
    config: SequencerConfig,
}

impl<S: Store> Sequencer<S> {
    pub fn new(store: S) -> Self {
        Self::with_config(store, SequencerConfig::default())
    }

    pub fn with_config(store: S, config: SequencerConfig) -> Self {
        Self {
            store,
            queue: VecDeque::new(),
            config,
        }
    }

    pub fn config(&self) -> &SequencerConfig {
        &self.config
    }

    /// Number of queued actions.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queue an action that picks its own completion convention.
    pub fn add<F>(mut self, action: F) -> Self
    where
        F: FnOnce(&mut S::Session, Completion) -> Invocation + Send + 'static,
    {
        self.queue.push_back(Box::new(action));
        self
    }

    /// Queue a named [`Action`] implementation.
    pub fn add_action<A>(mut self, action: A) -> Self
    where
        A: Action<S::Session> + 'static,
    {
        self.queue.push_back(Box::new(action));
        self
    }

    /// Queue an action that reports through its [`Completion`].
    pub fn add_callback<F>(self, action: F) -> Self
    where
        F: FnOnce(&mut S::Session, Completion) + Send + 'static,
    {
        self.add(move |session, done| {
            action(session, done);
            Invocation::Callback
        })
    }

    /// Queue an action that returns an [`Emitter`].
    pub fn add_emitter<F>(self, action: F) -> Self
    where
        F: FnOnce(&mut S::Session) -> Emitter + Send + 'static,
    {
        self.add(move |session, _done| Invocation::Emitter(action(session)))
    }

    /// Queue an action that finishes during the call.
    pub fn add_ready<F, E>(self, action: F) -> Self
    where
        F: FnOnce(&mut S::Session) -> Result<(), E> + Send + 'static,
        E: Into<BoxError>,
    {
        self.add(move |session, _done| Invocation::Ready(action(session).map_err(Into::into)))
    }

    /// Start the transaction on a new Tokio task and return at once.
    ///
    /// The outcome is only observable through the returned [`RunHandle`];
    /// even an empty queue reports success from the task, never from this
    /// call. An empty queue does not open a transaction at all.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn run(self) -> RunHandle {
        let run_id = Uuid::new_v4();
        let actions_total = self.queue.len();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (phase_tx, phase_rx) = watch::channel(Phase::Idle);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let mut runner = Runner {
            store: self.store,
            queue: self.queue,
            config: self.config,
            phase: phase_tx,
            cancel: cancel_rx,
            deadline: None,
            invoked: 0,
        };

        let span = tracing::info_span!("txn", run_id = %run_id);
        tokio::spawn(
            async move {
                let started_at = Utc::now();
                let clock = Instant::now();
                let result = runner.drive().await;
                let done = if result.is_ok() {
                    Phase::Succeeded
                } else {
                    Phase::Failed
                };

                // The outcome goes out before the done phase, so a handle
                // that sees a done phase can always take the outcome.
                let finished = Finished {
                    result,
                    actions_invoked: runner.invoked,
                    started_at,
                    elapsed: clock.elapsed(),
                };
                if let Err(unclaimed) = outcome_tx.send(finished) {
                    tracing::debug!(
                        succeeded = unclaimed.result.is_ok(),
                        "run handle dropped; outcome discarded"
                    );
                }
                runner.phase.send_replace(done);
            }
            .instrument(span),
        );

        RunHandle::new(run_id, actions_total, outcome_rx, phase_rx, cancel_tx)
    }
}

// ─── Runner ───────────────────────────────────────────────────────────────

/// State owned by the run task.
struct Runner<S: Store> {
    store: S,
    queue: VecDeque<BoxedAction<S::Session>>,
    config: SequencerConfig,
    phase: watch::Sender<Phase>,
    cancel: watch::Receiver<bool>,
    deadline: Option<Instant>,
    invoked: usize,
}

/// Why a guarded wait ended.
enum Wait<T> {
    Done(T),
    Cancelled,
    TimedOut,
}

/// How one action ended.
enum Step {
    Ok,
    Failed(ActionError),
    ActionTimedOut(Duration),
    Cancelled,
    RunTimedOut,
}

impl<S: Store> Runner<S> {
    async fn drive(&mut self) -> Result<(), SequencerError> {
        if self.queue.is_empty() {
            tracing::debug!("empty transaction; nothing to begin");
            return Ok(());
        }
        self.deadline = self.config.run_timeout.map(|t| Instant::now() + t);

        self.enter(Phase::Starting);
        tracing::debug!(actions = self.queue.len(), "beginning transaction");
        let begin = self.store.begin();
        let mut session = match guard(&mut self.cancel, self.deadline, begin).await {
            Wait::Done(Ok(session)) => session,
            Wait::Done(Err(e)) => {
                tracing::debug!(error = %e, "begin failed");
                return Err(SequencerError::Begin(Box::new(e)));
            }
            Wait::Cancelled => return Err(SequencerError::Cancelled { rollback: None }),
            Wait::TimedOut => {
                return Err(SequencerError::TimedOut {
                    after: self.run_timeout(),
                    rollback: None,
                })
            }
        };

        self.enter(Phase::Running);
        while !self.queue.is_empty() {
            let index = self.invoked;
            let cancelled = *self.cancel.borrow();
            let step = if cancelled {
                Step::Cancelled
            } else {
                self.step(&mut session, index).await
            };

            let failure = match step {
                Step::Ok => continue,
                Step::Failed(error) => {
                    tracing::debug!(index, error = %error, "action failed");
                    let rollback = self.rollback(session).await;
                    SequencerError::Action {
                        index,
                        error,
                        rollback,
                    }
                }
                Step::ActionTimedOut(after) => {
                    tracing::debug!(index, ?after, "action timed out");
                    let rollback = self.rollback(session).await;
                    SequencerError::ActionTimedOut {
                        index,
                        after,
                        rollback,
                    }
                }
                Step::Cancelled => {
                    tracing::debug!(index, "run cancelled");
                    let rollback = self.rollback(session).await;
                    SequencerError::Cancelled { rollback }
                }
                Step::RunTimedOut => {
                    tracing::debug!(index, "run deadline passed");
                    let rollback = self.rollback(session).await;
                    SequencerError::TimedOut {
                        after: self.run_timeout(),
                        rollback,
                    }
                }
            };
            return Err(failure);
        }

        self.enter(Phase::Committing);
        match self.store.commit(session).await {
            Ok(()) => {
                tracing::debug!(actions = self.invoked, "transaction committed");
                Ok(())
            }
            Err(e) => {
                tracing::debug!(error = %e, "commit failed");
                Err(SequencerError::Commit(Box::new(e)))
            }
        }
    }

    /// Pop the queue head, invoke it and wait for its report.
    async fn step(&mut self, session: &mut S::Session, index: usize) -> Step {
        let Some(action) = self.queue.pop_front() else {
            return Step::Ok;
        };
        self.invoked += 1;
        tracing::trace!(index, "invoking action");

        let (done, callback) = Completion::pair();
        let invoked = panic::catch_unwind(AssertUnwindSafe(|| action.invoke(session, done)));
        let invocation = match invoked {
            Ok(invocation) => invocation,
            Err(payload) => {
                let message = panic_message(&*payload);
                tracing::warn!(index, panic = %message, "action panicked");
                return Step::Failed(ActionError::Panicked(message));
            }
        };
        let settled = settle(invocation, callback);

        match self.config.action_timeout {
            Some(limit) => {
                let timed = tokio::time::timeout(limit, settled);
                match guard(&mut self.cancel, self.deadline, timed).await {
                    Wait::Done(Ok(Ok(()))) => Step::Ok,
                    Wait::Done(Ok(Err(e))) => Step::Failed(e),
                    Wait::Done(Err(_elapsed)) => Step::ActionTimedOut(limit),
                    Wait::Cancelled => Step::Cancelled,
                    Wait::TimedOut => Step::RunTimedOut,
                }
            }
            None => match guard(&mut self.cancel, self.deadline, settled).await {
                Wait::Done(Ok(())) => Step::Ok,
                Wait::Done(Err(e)) => Step::Failed(e),
                Wait::Cancelled => Step::Cancelled,
                Wait::TimedOut => Step::RunTimedOut,
            },
        }
    }

    /// Roll back, returning the rollback's own error for secondary reporting.
    async fn rollback(&mut self, session: S::Session) -> Option<BoxError> {
        self.enter(Phase::RollingBack);
        match self.store.rollback(session).await {
            Ok(()) => {
                tracing::debug!("transaction rolled back");
                None
            }
            Err(e) => {
                if self.config.log_rollback_failures {
                    tracing::warn!(error = %e, "rollback failed; reporting the original failure");
                }
                Some(Box::new(e))
            }
        }
    }

    fn enter(&self, phase: Phase) {
        self.phase.send_replace(phase);
    }

    fn run_timeout(&self) -> Duration {
        self.config.run_timeout.unwrap_or_default()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Wait for `fut`, giving up early on cancellation or the run deadline.
///
/// A finished `fut` wins ties.
async fn guard<F: Future>(
    cancel: &mut watch::Receiver<bool>,
    deadline: Option<Instant>,
    fut: F,
) -> Wait<F::Output> {
    tokio::select! {
        biased;
        out = fut => Wait::Done(out),
        _ = cancelled(cancel) => Wait::Cancelled,
        _ = expired(deadline) => Wait::TimedOut,
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let handle_dropped = cancel.wait_for(|&requested| requested).await.is_err();
    // A dropped handle can no longer cancel; wait forever.
    if handle_dropped {
        std::future::pending::<()>().await;
    }
}

async fn expired(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}
