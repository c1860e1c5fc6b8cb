//! In-memory transactional key/value store.
//!
//! A reference [`Store`] used by the test suite and the `txseq` binary.
//! Values are `serde_json::Value`s keyed by string. At most one
//! transaction is open at a time; its writes are staged on the side and
//! applied atomically on commit.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::store::Store;

// ---------------------------------------------------------------------------
// StoreOp / MemoryError
// ---------------------------------------------------------------------------

/// A transaction-control call made against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreOp {
    Begin,
    Commit,
    Rollback,
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StoreOp::Begin => "begin",
            StoreOp::Commit => "commit",
            StoreOp::Rollback => "rollback",
        })
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum MemoryError {
    #[error("a transaction is already open")]
    TransactionActive,

    #[error("transaction {0} is no longer open")]
    TransactionClosed(u64),

    #[error("injected {0} failure")]
    Injected(StoreOp),

    #[error("value at '{key}' is not an integer")]
    NotAnInteger { key: String },

    #[error("integer overflow at '{key}'")]
    Overflow { key: String },
}

// ---------------------------------------------------------------------------
// Inner state
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Inner {
    data: BTreeMap<String, Value>,
    open: Option<OpenTxn>,
    last_txn: u64,
    journal: Vec<StoreOp>,
    failures: Vec<StoreOp>,
}

/// Writes staged by the open transaction; `None` marks a delete.
#[derive(Debug)]
struct OpenTxn {
    id: u64,
    staged: BTreeMap<String, Option<Value>>,
}

impl Inner {
    fn record(&mut self, op: StoreOp) -> Result<(), MemoryError> {
        self.journal.push(op);
        match self.failures.iter().position(|f| *f == op) {
            Some(i) => {
                self.failures.remove(i);
                Err(MemoryError::Injected(op))
            }
            None => Ok(()),
        }
    }

    fn txn(&mut self, id: u64) -> Result<&mut OpenTxn, MemoryError> {
        self.open
            .as_mut()
            .filter(|t| t.id == id)
            .ok_or(MemoryError::TransactionClosed(id))
    }

    fn close(&mut self, id: u64) -> Result<OpenTxn, MemoryError> {
        self.txn(id)?;
        self.open.take().ok_or(MemoryError::TransactionClosed(id))
    }

    fn read(&mut self, id: u64, key: &str) -> Result<Option<Value>, MemoryError> {
        let txn = self.txn(id)?;
        if let Some(staged) = txn.staged.get(key) {
            return Ok(staged.clone());
        }
        Ok(self.data.get(key).cloned())
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// Shared handle to an in-memory store; clones see the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-populated with committed `data`.
    pub fn with_data<K, V>(data: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        let store = Self::new();
        store.lock().data = data
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        store
    }

    /// Committed value at `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().data.get(key).cloned()
    }

    /// All committed data.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.lock().data.clone()
    }

    /// Every begin/commit/rollback call so far, failed ones included.
    pub fn journal(&self) -> Vec<StoreOp> {
        self.lock().journal.clone()
    }

    pub fn in_transaction(&self) -> bool {
        self.lock().open.is_some()
    }

    /// Make the next call of kind `op` fail with [`MemoryError::Injected`].
    ///
    /// A failed commit or rollback still closes the transaction and
    /// discards its staged writes.
    pub fn fail_next(&self, op: StoreOp) {
        self.lock().failures.push(op);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Session = MemorySession;
    type Error = MemoryError;

    async fn begin(&mut self) -> Result<MemorySession, MemoryError> {
        let mut inner = self.lock();
        inner.record(StoreOp::Begin)?;
        if inner.open.is_some() {
            return Err(MemoryError::TransactionActive);
        }
        inner.last_txn += 1;
        let id = inner.last_txn;
        inner.open = Some(OpenTxn {
            id,
            staged: BTreeMap::new(),
        });
        Ok(MemorySession {
            inner: Arc::clone(&self.inner),
            txn: id,
        })
    }

    async fn commit(&mut self, session: MemorySession) -> Result<(), MemoryError> {
        let mut inner = self.lock();
        let recorded = inner.record(StoreOp::Commit);
        let txn = inner.close(session.txn)?;
        recorded?;
        for (key, value) in txn.staged {
            match value {
                Some(v) => inner.data.insert(key, v),
                None => inner.data.remove(&key),
            };
        }
        Ok(())
    }

    async fn rollback(&mut self, session: MemorySession) -> Result<(), MemoryError> {
        let mut inner = self.lock();
        let recorded = inner.record(StoreOp::Rollback);
        inner.close(session.txn)?;
        recorded
    }
}

// ---------------------------------------------------------------------------
// MemorySession
// ---------------------------------------------------------------------------

/// One open transaction on a [`MemoryStore`].
///
/// Reads see the transaction's own staged writes. Cloning is cheap, so a
/// session can move into a spawned task that reports back later; every
/// call fails with [`MemoryError::TransactionClosed`] once the transaction
/// has been committed or rolled back.
#[derive(Debug, Clone)]
pub struct MemorySession {
    inner: Arc<Mutex<Inner>>,
    txn: u64,
}

impl MemorySession {
    pub fn id(&self) -> u64 {
        self.txn
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>, MemoryError> {
        self.lock().read(self.txn, key)
    }

    pub fn put(&self, key: impl Into<String>, value: impl Into<Value>) -> Result<(), MemoryError> {
        let mut inner = self.lock();
        inner
            .txn(self.txn)?
            .staged
            .insert(key.into(), Some(value.into()));
        Ok(())
    }

    pub fn delete(&self, key: impl Into<String>) -> Result<(), MemoryError> {
        let mut inner = self.lock();
        inner.txn(self.txn)?.staged.insert(key.into(), None);
        Ok(())
    }

    /// Add `by` to the integer at `key` (missing counts as 0); returns the new value.
    pub fn increment(&self, key: &str, by: i64) -> Result<i64, MemoryError> {
        let mut inner = self.lock();
        let current = match inner.read(self.txn, key)? {
            None => 0,
            Some(v) => v.as_i64().ok_or_else(|| MemoryError::NotAnInteger {
                key: key.to_string(),
            })?,
        };
        let next = current.checked_add(by).ok_or_else(|| MemoryError::Overflow {
            key: key.to_string(),
        })?;
        inner
            .txn(self.txn)?
            .staged
            .insert(key.to_string(), Some(Value::from(next)));
        Ok(next)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
