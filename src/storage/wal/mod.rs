//! Write-Ahead Logging (WAL) and ARIES-style crash recovery.
//!
//! Every page change is described by a log record that reaches stable
//! storage before the page itself does. After an uncontrolled shutdown the
//! log is replayed to restore the database.
//!
//! # Architecture
//!
//! The log is a stream of self-framing records split across numbered
//! segment files (`wal-00000.log`, `wal-00001.log`, ...). A position in
//! the stream is a [`LogSequenceNumber`]. Each segment starts with:
//! - A 2-byte typed-file header (owned by the storage layer)
//! - A 4-byte offset where the previous segment's records end (0 if none)
//!
//! Records of one transaction are chained backward through `prev_lsn`.
//!
//! # Recovery Process
//!
//! On startup, over the stored `[first_lsn, next_lsn)` range:
//! 1. Redo: replay every record's new bytes in log order
//! 2. Undo: walk backward, rolling back transactions that never finished
//!    and logging a redo-only compensation record for every undone change
//! 3. Force the log, flush every page, and move `first_lsn` up to `next_lsn`

mod checkpointer;
mod diff;
mod lsn;
mod manager;
mod reader;
mod record;
mod recovery;
mod segment;
mod writer;

pub use checkpointer::Checkpointer;
pub use diff::{compute_segments, MAX_ABSORBED_GAP};
pub use lsn::LogSequenceNumber;
pub use manager::{check_loggable, WalManager};
pub use reader::WalReader;
pub use record::{
    decode_record, record_start_before, ByteCursor, RedoSegment, UpdateSegment, WalRecord,
    WalRecordType, END_RECORD_SIZE, MAX_FILE_NAME_LEN, START_RECORD_SIZE,
};
pub use recovery::{RecoveryEngine, RecoveryInfo, RecoveryPhase};
pub use segment::{next_file_no, prev_file_no, wal_file_name, WalFileStore};
pub use writer::WalWriter;

/// Short alias used throughout the transaction layer.
pub type Lsn = LogSequenceNumber;

/// Largest WAL segment number; numbering wraps back to 0 after it.
pub const MAX_WAL_FILE_NUMBER: u16 = u16::MAX;

/// Default segment size cap (10 MiB).
pub const DEFAULT_MAX_WAL_FILE_SIZE: u32 = 10 * 1024 * 1024;

/// Offset of the previous segment's end offset in a segment header.
pub const OFFSET_PREV_FILE_END: u32 = 2;

/// Offset of the first record in every segment.
pub const OFFSET_FIRST_RECORD: u32 = 6;
