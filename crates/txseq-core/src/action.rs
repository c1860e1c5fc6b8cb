//! Actions and the two ways they report completion.
//!
//! An action is invoked once with the open session and a [`Completion`].
//! Its return value, an [`Invocation`], says how the result will arrive:
//!
//! ```text
//! Invocation::Callback      → the action fires the Completion it was given
//! Invocation::Emitter(e)    → the action returned an Emitter that fires later
//! Invocation::Ready(result) → the action already finished
//! ```
//!
//! Both handles sit on a `oneshot` channel carrying `Result<(), BoxError>`,
//! so either convention resolves to the same [`ActionError`] shape and a
//! queue may mix them freely.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::FusedFuture;
use tokio::sync::oneshot;

use crate::error::{ActionError, BoxError};

type Report = Result<(), BoxError>;

// ─── Invocation ───────────────────────────────────────────────────────────

/// How an invoked action will report its outcome.
#[derive(Debug)]
pub enum Invocation {
    /// The action fires the [`Completion`] it was handed, now or later.
    Callback,
    /// The action returned an [`Emitter`]; the `Completion` is ignored.
    Emitter(Emitter),
    /// The action finished during the call.
    Ready(Report),
}

impl Invocation {
    /// A finished action that succeeded.
    pub fn ok() -> Self {
        Invocation::Ready(Ok(()))
    }

    /// A finished action that failed with `err`.
    pub fn err(err: impl Into<BoxError>) -> Self {
        Invocation::Ready(Err(err.into()))
    }
}

impl From<Emitter> for Invocation {
    fn from(emitter: Emitter) -> Self {
        Invocation::Emitter(emitter)
    }
}

// ─── Completion ───────────────────────────────────────────────────────────

/// Callback handed to every action.
///
/// Consumed when fired, so an action reports at most once. Dropping it
/// unfired (from an action that returned [`Invocation::Callback`]) fails
/// the action with [`ActionError::Abandoned`].
#[derive(Debug)]
pub struct Completion {
    tx: oneshot::Sender<Report>,
}

impl Completion {
    pub(crate) fn pair() -> (Self, Pending) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, Pending::new(rx))
    }

    pub fn success(self) {
        self.finish(Ok::<(), BoxError>(()));
    }

    pub fn failure(self, err: impl Into<BoxError>) {
        self.finish(Err(err));
    }

    /// Report a `Result` directly.
    pub fn finish<E: Into<BoxError>>(self, result: Result<(), E>) {
        // The sequencer may have stopped listening (action timed out or the
        // run was cancelled); the late report is dropped.
        let _ = self.tx.send(result.map_err(Into::into));
    }
}

// ─── Emitter / Signal ─────────────────────────────────────────────────────

/// Sending half of an [`Emitter`]: fires one of the two completion events.
#[derive(Debug)]
pub struct Signal {
    tx: oneshot::Sender<Report>,
}

impl Signal {
    /// Fire the success event.
    pub fn success(self) {
        let _ = self.tx.send(Ok(()));
    }

    /// Fire the failure event with `err`.
    pub fn failure(self, err: impl Into<BoxError>) {
        let _ = self.tx.send(Err(err.into()));
    }
}

/// A pending action outcome returned from the action itself.
///
/// Resolves to `Ok(())` on the success event, to
/// `Err(ActionError::Failed(_))` on the failure event, and to
/// `Err(ActionError::Abandoned)` if its [`Signal`] is dropped unfired.
#[derive(Debug)]
pub struct Emitter {
    pending: Pending,
}

impl Emitter {
    /// A connected `(Signal, Emitter)` pair.
    pub fn channel() -> (Signal, Emitter) {
        let (tx, rx) = oneshot::channel();
        (Signal { tx }, Emitter { pending: Pending::new(rx) })
    }

    /// Build an emitter and hand its signal to `f` straight away.
    ///
    /// ```rust,ignore
    /// Emitter::run(|signal| {
    ///     tokio::spawn(async move { signal.failure("unable to save the account") });
    /// })
    /// ```
    pub fn run<F>(f: F) -> Emitter
    where
        F: FnOnce(Signal),
    {
        let (signal, emitter) = Self::channel();
        f(signal);
        emitter
    }

    /// Drive `fut` on a new Tokio task; its result fires the signal.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<F, E>(fut: F) -> Emitter
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let (signal, emitter) = Self::channel();
        tokio::spawn(async move {
            match fut.await {
                Ok(()) => signal.success(),
                Err(e) => signal.failure(e),
            }
        });
        emitter
    }
}

impl Future for Emitter {
    type Output = Result<(), ActionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.pending).poll(cx)
    }
}

impl FusedFuture for Emitter {
    fn is_terminated(&self) -> bool {
        self.pending.done
    }
}

// ─── Pending ──────────────────────────────────────────────────────────────

/// Receiving half shared by both conventions.
#[derive(Debug)]
pub(crate) struct Pending {
    rx: oneshot::Receiver<Report>,
    done: bool,
}

impl Pending {
    fn new(rx: oneshot::Receiver<Report>) -> Self {
        Self { rx, done: false }
    }
}

impl Future for Pending {
    type Output = Result<(), ActionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let received = std::task::ready!(Pin::new(&mut self.rx).poll(cx));
        self.done = true;
        Poll::Ready(match received {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ActionError::Failed(e)),
            Err(_) => Err(ActionError::Abandoned),
        })
    }
}

/// Wait for an invoked action to report, whichever convention it chose.
pub(crate) async fn settle(invocation: Invocation, callback: Pending) -> Result<(), ActionError> {
    match invocation {
        Invocation::Callback => callback.await,
        Invocation::Emitter(emitter) => {
            drop(callback);
            emitter.await
        }
        Invocation::Ready(result) => result.map_err(ActionError::Failed),
    }
}

// ─── Action ───────────────────────────────────────────────────────────────

/// One unit of work run against an open session.
///
/// Closures of the shape `FnOnce(&mut Session, Completion) -> Invocation`
/// implement this automatically; implement it by hand for named action
/// types.
pub trait Action<S>: Send {
    fn invoke(self: Box<Self>, session: &mut S, done: Completion) -> Invocation;
}

impl<S, F> Action<S> for F
where
    F: FnOnce(&mut S, Completion) -> Invocation + Send,
{
    fn invoke(self: Box<Self>, session: &mut S, done: Completion) -> Invocation {
        (*self)(session, done)
    }
}

/// A queued action.
pub type BoxedAction<S> = Box<dyn Action<S>>;

// ─── Tests ────────────────────────────────────────────────────────────────
