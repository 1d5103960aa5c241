//! Transaction layer: per-session contexts, the persistent transaction
//! state, and the manager that ties them to the write-ahead log.

mod manager;
mod state;
mod state_file;

pub use manager::TransactionManager;
pub use state::TransactionContext;
pub use state_file::{TxnState, TxnStateFile, TXNSTATE_FILENAME, TXNSTATE_MAGIC, TXNSTATE_VERSION};
