//! Log sequence numbers.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{AriesError, Result};
use crate::storage::wal::MAX_WAL_FILE_NUMBER;

/// Locator of a byte position in the segmented write-ahead log.
///
/// Ordering is lexicographic on `(log_file_no, file_offset)`. The record
/// size is an ephemeral annotation filled in once a record has been
/// written or parsed; it takes no part in equality, ordering or hashing
/// and is never persisted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LogSequenceNumber {
    log_file_no: u16,
    file_offset: u32,
    #[serde(skip)]
    record_size: Option<u32>,
}

impl LogSequenceNumber {
    /// Creates an LSN from a segment number and offset.
    #[must_use]
    pub const fn new(log_file_no: u16, file_offset: u32) -> Self {
        Self {
            log_file_no,
            file_offset,
            record_size: None,
        }
    }

    /// Creates an LSN from unchecked parts.
    ///
    /// # Errors
    ///
    /// Returns [`AriesError::InvalidArgument`] if the file number exceeds
    /// the largest segment number or the offset is negative or too large.
    pub fn try_from_parts(log_file_no: i64, file_offset: i64) -> Result<Self> {
        if !(0..=i64::from(MAX_WAL_FILE_NUMBER)).contains(&log_file_no) {
            return Err(AriesError::InvalidArgument(format!(
                "WAL file number must be in 0..={MAX_WAL_FILE_NUMBER}, got {log_file_no}"
            )));
        }
        let file_offset = u32::try_from(file_offset).map_err(|_| {
            AriesError::InvalidArgument(format!("Invalid WAL file offset {file_offset}"))
        })?;
        // Range checked above.
        Ok(Self::new(log_file_no as u16, file_offset))
    }

    /// Returns the segment number.
    #[must_use]
    pub const fn log_file_no(&self) -> u16 {
        self.log_file_no
    }

    /// Returns the byte offset within the segment.
    #[must_use]
    pub const fn file_offset(&self) -> u32 {
        self.file_offset
    }

    /// Returns the size of the record at this LSN, when known.
    #[must_use]
    pub const fn record_size(&self) -> Option<u32> {
        self.record_size
    }

    /// Returns a copy annotated with the record size.
    #[must_use]
    pub const fn with_record_size(mut self, size: u32) -> Self {
        self.record_size = Some(size);
        self
    }

    /// Returns the position just past the record at this LSN.
    ///
    /// Falls back to the LSN itself when the record size is unknown.
    #[must_use]
    pub fn end(&self) -> Self {
        let size = self.record_size.unwrap_or(0);
        Self::new(self.log_file_no, self.file_offset.saturating_add(size))
    }
}

impl PartialEq for LogSequenceNumber {
    fn eq(&self, other: &Self) -> bool {
        self.log_file_no == other.log_file_no && self.file_offset == other.file_offset
    }
}

impl Eq for LogSequenceNumber {}

impl Hash for LogSequenceNumber {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.log_file_no.hash(state);
        self.file_offset.hash(state);
    }
}

impl PartialOrd for LogSequenceNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LogSequenceNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.log_file_no, self.file_offset).cmp(&(other.log_file_no, other.file_offset))
    }
}

impl fmt::Display for LogSequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LSN[{:05}:{:08}]", self.log_file_no, self.file_offset)
    }
}

impl FromStr for LogSequenceNumber {
    type Err = AriesError;

    /// Parses `FILE:OFFSET`, e.g. `3:1024`.
    fn from_str(s: &str) -> Result<Self> {
        let (file, offset) = s.split_once(':').ok_or_else(|| {
            AriesError::InvalidArgument(format!("Expected FILE:OFFSET, got {s:?}"))
        })?;
        let parse = |part: &str| {
            part.trim().parse::<i64>().map_err(|_| {
                AriesError::InvalidArgument(format!("Invalid number {part:?} in LSN {s:?}"))
            })
        };
        Self::try_from_parts(parse(file)?, parse(offset)?)
    }
}
