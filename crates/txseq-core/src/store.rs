use async_trait::async_trait;

// ─── Store ────────────────────────────────────────────────────────────────

/// A transaction-capable store driver.
///
/// The sequencer calls [`begin`](Store::begin) once per run, hands the
/// returned session to each action in turn, and finishes with exactly one
/// of [`commit`](Store::commit) or [`rollback`](Store::rollback). Both
/// consume the session: a closed transaction cannot be touched again.
///
/// Implementations only need to support one open transaction at a time;
/// the sequencer never nests them.
#[async_trait]
pub trait Store: Send + 'static {
    /// Handle to one open transaction.
    type Session: Send + 'static;

    /// Error reported by the driver.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Open a new transaction.
    async fn begin(&mut self) -> Result<Self::Session, Self::Error>;

    /// Make the transaction's writes durable.
    async fn commit(&mut self, session: Self::Session) -> Result<(), Self::Error>;

    /// Discard the transaction's writes.
    async fn rollback(&mut self, session: Self::Session) -> Result<(), Self::Error>;
}
