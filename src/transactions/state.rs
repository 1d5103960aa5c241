//! Per-session transaction context.

use crate::storage::wal::Lsn;

/// Transaction state owned by the calling session and passed by `&mut`
/// into every transaction and logging call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionContext {
    /// ID of the transaction in progress, if any.
    pub transaction_id: Option<u32>,
    /// Newest record written for this transaction (tip of its chain).
    pub last_lsn: Option<Lsn>,
    /// Whether the user started the transaction explicitly.
    pub user_started: bool,
    /// Whether the `StartTxn` record has been written.
    pub logged_start: bool,
}

impl TransactionContext {
    /// Creates a context with no transaction in progress.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if a transaction is in progress.
    #[must_use]
    pub fn is_in_progress(&self) -> bool {
        self.transaction_id.is_some()
    }

    /// Marks transaction `txn_id` as started. Nothing is logged yet.
    pub fn begin(&mut self, txn_id: u32, user_started: bool) {
        *self = Self {
            transaction_id: Some(txn_id),
            last_lsn: None,
            user_started,
            logged_start: false,
        };
    }

    /// Forgets the transaction.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
