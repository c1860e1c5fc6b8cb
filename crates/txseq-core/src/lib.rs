//! Run an ordered list of actions inside one store transaction.
//!
//! Actions are queued on a [`Sequencer`] and executed strictly one at a
//! time against the session returned by [`Store::begin`]. When every
//! action reports success the session is committed; the first failure
//! stops the queue and rolls the session back.
//!
//! # Architecture
//!
//! ```text
//! Sequencer::add(..)      ← queue actions (chainable)
//!     │
//!     ▼
//! Sequencer::run()        ← spawns the run task, returns a RunHandle
//!     │                      Idle → Starting → Running → Committing | RollingBack
//!     ▼
//! action.invoke(session, Completion) → Invocation::{Callback, Emitter, Ready}
//!     │
//!     ▼
//! RunHandle (Future)      ← exactly one terminal Result per run
//! ```
//!
//! # Quick start
//!
//! ```rust,ignore
//! use txseq_core::{Emitter, MemorySession, MemoryStore, Sequencer};
//!
//! let store = MemoryStore::with_data([("checking", 100)]);
//! let outcome = Sequencer::new(store.clone())
//!     .add_callback(|s: &mut MemorySession, done| {
//!         done.finish(s.increment("checking", -25).map(drop));
//!     })
//!     .add_emitter(|_| Emitter::run(|signal| signal.failure("unable to save the account")))
//!     .run()
//!     .await;
//!
//! assert_eq!(outcome.unwrap_err().to_string(), "unable to save the account");
//! assert_eq!(store.get("checking"), Some(100.into()));
//! ```

pub mod action;
pub mod config;
pub mod error;
pub mod handle;
pub mod memory;
pub mod sequencer;
pub mod store;


pub use action::{Action, BoxedAction, Completion, Emitter, Invocation, Signal};
pub use config::{ConfigError, ConfigWarning, SequencerConfig, WarnLevel};
pub use error::{ActionError, BoxError, SequencerError};
pub use handle::{Phase, RunHandle, RunReport};
pub use memory::{MemoryError, MemorySession, MemoryStore, StoreOp};
pub use sequencer::Sequencer;
pub use store::Store;
