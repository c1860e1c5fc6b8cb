use std::time::Duration;

use thiserror::Error;

/// Type-erased error carried through a run.
///
/// Store errors and action errors are boxed so the caller's own error
/// types survive unchanged and can be recovered with `downcast_ref`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Why a single action did not succeed.
#[derive(Debug, Error)]
pub enum ActionError {
    /// The action reported this error, through either completion convention.
    #[error(transparent)]
    Failed(BoxError),

    /// The completion handle or emitter signal was dropped without firing.
    #[error("action finished without signalling success or failure")]
    Abandoned,

    /// The action panicked while being invoked; carries the panic message.
    #[error("action panicked: {0}")]
    Panicked(String),
}

impl ActionError {
    /// Borrow the reported error as a concrete type, if it is one.
    pub fn downcast_ref<T: std::error::Error + 'static>(&self) -> Option<&T> {
        match self {
            ActionError::Failed(e) => e.downcast_ref::<T>(),
            ActionError::Abandoned | ActionError::Panicked(_) => None,
        }
    }
}

/// Terminal failure of a transaction run.
///
/// Exactly one of these (or success) is delivered per run. Variants that
/// roll back carry the rollback's own error as a secondary `rollback`
/// field; it never replaces the primary reason or its `Display`.
#[derive(Debug, Error)]
pub enum SequencerError {
    #[error("failed to begin transaction: {0}")]
    Begin(BoxError),

    /// Action `index` (0-based, registration order) failed.
    #[error("{error}")]
    Action {
        index: usize,
        error: ActionError,
        rollback: Option<BoxError>,
    },

    #[error("action {index} timed out after {after:?}")]
    ActionTimedOut {
        index: usize,
        after: Duration,
        rollback: Option<BoxError>,
    },

    /// Every action succeeded but the store refused the commit.
    #[error("failed to commit transaction: {0}")]
    Commit(BoxError),

    #[error("transaction cancelled")]
    Cancelled { rollback: Option<BoxError> },

    #[error("transaction timed out after {after:?}")]
    TimedOut {
        after: Duration,
        rollback: Option<BoxError>,
    },

    /// The run task ended without reporting (it panicked or was aborted).
    #[error("transaction task ended without reporting an outcome")]
    Lost,
}

impl SequencerError {
    /// The primary action error, when an action caused the failure.
    pub fn action_error(&self) -> Option<&ActionError> {
        match self {
            SequencerError::Action { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Index of the action that failed or timed out.
    pub fn failed_index(&self) -> Option<usize> {
        match self {
            SequencerError::Action { index, .. } | SequencerError::ActionTimedOut { index, .. } => {
                Some(*index)
            }
            _ => None,
        }
    }

    /// Secondary error raised by the rollback that followed the failure.
    pub fn rollback_error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            SequencerError::Action { rollback, .. }
            | SequencerError::ActionTimedOut { rollback, .. }
            | SequencerError::Cancelled { rollback }
            | SequencerError::TimedOut { rollback, .. } => rollback.as_deref(),
            _ => None,
        }
    }
}
