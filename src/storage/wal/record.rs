//! WAL record types and their byte-level framing.
//!
//! Every record starts and ends with its type byte, so the log can be
//! walked in both directions. All integers are big-endian.
//!
//! ```text
//! StartTxn           [1][txn u32][1]
//! CommitTxn/AbortTxn [t][txn u32][prev file u16][prev offset u32][t]
//! UpdatePage         [2][txn u32][prev 6B][name len u8][name][page u16][count u16]
//!                    {[offset u16][len u16][old bytes][new bytes]}*[start u32][2]
//! UpdatePageRedoOnly same as UpdatePage, each segment carries one byte array
//! ```

use std::fmt;

use crate::error::{AriesError, Result};
use crate::storage::page::{PageId, PAGE_SIZE};
use crate::storage::wal::{LogSequenceNumber, OFFSET_FIRST_RECORD};

/// Size in bytes of a serialized LSN (file number + offset).
pub const LSN_SIZE: u32 = 6;

/// Size of a `StartTxn` record.
pub const START_RECORD_SIZE: u32 = 1 + 4 + 1;

/// Size of a `CommitTxn` or `AbortTxn` record.
pub const END_RECORD_SIZE: u32 = 1 + 4 + LSN_SIZE + 1;

/// Maximum length of a file name stored in an update record.
pub const MAX_FILE_NAME_LEN: usize = u8::MAX as usize;

/// Type of WAL record, stored as the first and last byte of each record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WalRecordType {
    /// A transaction made its first logged change.
    StartTxn = 1,
    /// Before and after bytes of a page change.
    UpdatePage = 2,
    /// After bytes only; written when undoing a change.
    UpdatePageRedoOnly = 3,
    /// A transaction committed.
    CommitTxn = 10,
    /// A transaction finished rolling back.
    AbortTxn = 11,
}

impl WalRecordType {
    /// Returns the size of records of this type when it is fixed.
    #[must_use]
    pub const fn fixed_size(self) -> Option<u32> {
        match self {
            WalRecordType::StartTxn => Some(START_RECORD_SIZE),
            WalRecordType::CommitTxn | WalRecordType::AbortTxn => Some(END_RECORD_SIZE),
            WalRecordType::UpdatePage | WalRecordType::UpdatePageRedoOnly => None,
        }
    }
}

impl TryFrom<u8> for WalRecordType {
    type Error = ();

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(WalRecordType::StartTxn),
            2 => Ok(WalRecordType::UpdatePage),
            3 => Ok(WalRecordType::UpdatePageRedoOnly),
            10 => Ok(WalRecordType::CommitTxn),
            11 => Ok(WalRecordType::AbortTxn),
            _ => Err(()),
        }
    }
}

impl fmt::Display for WalRecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WalRecordType::StartTxn => "START_TXN",
            WalRecordType::UpdatePage => "UPDATE_PAGE",
            WalRecordType::UpdatePageRedoOnly => "UPDATE_PAGE_REDO_ONLY",
            WalRecordType::CommitTxn => "COMMIT_TXN",
            WalRecordType::AbortTxn => "ABORT_TXN",
        };
        f.write_str(name)
    }
}

/// One changed window of a page, with its bytes before and after.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateSegment {
    /// Offset of the window within the page.
    pub offset: u16,
    /// Bytes before the change.
    pub old_data: Vec<u8>,
    /// Bytes after the change.
    pub new_data: Vec<u8>,
}

/// One window of a page with only the bytes to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedoSegment {
    /// Offset of the window within the page.
    pub offset: u16,
    /// Bytes to write at `offset`.
    pub data: Vec<u8>,
}

/// A single decoded WAL record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    /// First record of a transaction. Has no `prev_lsn`.
    StartTxn { txn_id: u32 },
    /// Commit marker.
    CommitTxn {
        txn_id: u32,
        prev_lsn: LogSequenceNumber,
    },
    /// Abort marker, written once a rollback has finished.
    AbortTxn {
        txn_id: u32,
        prev_lsn: LogSequenceNumber,
    },
    /// Undoable page change.
    UpdatePage {
        txn_id: u32,
        prev_lsn: LogSequenceNumber,
        file_name: String,
        page_no: u16,
        segments: Vec<UpdateSegment>,
    },
    /// Redo-only page change (compensation).
    UpdatePageRedoOnly {
        txn_id: u32,
        prev_lsn: LogSequenceNumber,
        file_name: String,
        page_no: u16,
        segments: Vec<RedoSegment>,
    },
}

impl WalRecord {
    /// Returns the record's type tag.
    #[must_use]
    pub fn record_type(&self) -> WalRecordType {
        match self {
            WalRecord::StartTxn { .. } => WalRecordType::StartTxn,
            WalRecord::CommitTxn { .. } => WalRecordType::CommitTxn,
            WalRecord::AbortTxn { .. } => WalRecordType::AbortTxn,
            WalRecord::UpdatePage { .. } => WalRecordType::UpdatePage,
            WalRecord::UpdatePageRedoOnly { .. } => WalRecordType::UpdatePageRedoOnly,
        }
    }

    /// Returns the owning transaction.
    #[must_use]
    pub fn txn_id(&self) -> u32 {
        match self {
            WalRecord::StartTxn { txn_id }
            | WalRecord::CommitTxn { txn_id, .. }
            | WalRecord::AbortTxn { txn_id, .. }
            | WalRecord::UpdatePage { txn_id, .. }
            | WalRecord::UpdatePageRedoOnly { txn_id, .. } => *txn_id,
        }
    }

    /// Returns the previous record of the same transaction, if any.
    #[must_use]
    pub fn prev_lsn(&self) -> Option<LogSequenceNumber> {
        match self {
            WalRecord::StartTxn { .. } => None,
            WalRecord::CommitTxn { prev_lsn, .. }
            | WalRecord::AbortTxn { prev_lsn, .. }
            | WalRecord::UpdatePage { prev_lsn, .. }
            | WalRecord::UpdatePageRedoOnly { prev_lsn, .. } => Some(*prev_lsn),
        }
    }

    /// Returns the page an update record touches.
    #[must_use]
    pub fn page_id(&self) -> Option<PageId> {
        match self {
            WalRecord::UpdatePage {
                file_name, page_no, ..
            }
            | WalRecord::UpdatePageRedoOnly {
                file_name, page_no, ..
            } => Some(PageId::new(file_name.as_str(), u32::from(*page_no))),
            _ => None,
        }
    }

    /// Returns the number of page segments in an update record.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        match self {
            WalRecord::UpdatePage { segments, .. } => segments.len(),
            WalRecord::UpdatePageRedoOnly { segments, .. } => segments.len(),
            _ => 0,
        }
    }

    /// Serializes the record as it will be stored at `start_offset`.
    ///
    /// # Errors
    ///
    /// Returns [`AriesError::InvalidArgument`] for file names longer than
    /// 255 bytes, segments that leave the page, or too many segments.
    pub fn encode(&self, start_offset: u32) -> Result<Vec<u8>> {
        let tag = self.record_type() as u8;
        let mut buf = Vec::with_capacity(64);
        buf.push(tag);
        buf.extend_from_slice(&self.txn_id().to_be_bytes());

        match self {
            WalRecord::StartTxn { .. } => {}
            WalRecord::CommitTxn { prev_lsn, .. } | WalRecord::AbortTxn { prev_lsn, .. } => {
                put_lsn(&mut buf, *prev_lsn);
            }
            WalRecord::UpdatePage {
                prev_lsn,
                file_name,
                page_no,
                segments,
                ..
            } => {
                put_lsn(&mut buf, *prev_lsn);
                put_page_header(&mut buf, file_name, *page_no, segments.len())?;
                for segment in segments {
                    if segment.old_data.len() != segment.new_data.len() {
                        return Err(AriesError::InvalidArgument(format!(
                            "Segment at offset {} has mismatched old/new lengths",
                            segment.offset
                        )));
                    }
                    put_segment_header(&mut buf, segment.offset, segment.new_data.len())?;
                    buf.extend_from_slice(&segment.old_data);
                    buf.extend_from_slice(&segment.new_data);
                }
                buf.extend_from_slice(&start_offset.to_be_bytes());
            }
            WalRecord::UpdatePageRedoOnly {
                prev_lsn,
                file_name,
                page_no,
                segments,
                ..
            } => {
                put_lsn(&mut buf, *prev_lsn);
                put_page_header(&mut buf, file_name, *page_no, segments.len())?;
                for segment in segments {
                    put_segment_header(&mut buf, segment.offset, segment.data.len())?;
                    buf.extend_from_slice(&segment.data);
                }
                buf.extend_from_slice(&start_offset.to_be_bytes());
            }
        }

        buf.push(tag);
        Ok(buf)
    }
}

impl fmt::Display for WalRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} txn={}", self.record_type(), self.txn_id())?;
        if let Some(prev) = self.prev_lsn() {
            write!(f, " prev={prev}")?;
        }
        if let Some(page_id) = self.page_id() {
            write!(f, " page={page_id} segments={}", self.segment_count())?;
        }
        Ok(())
    }
}

fn put_lsn(buf: &mut Vec<u8>, lsn: LogSequenceNumber) {
    buf.extend_from_slice(&lsn.log_file_no().to_be_bytes());
    buf.extend_from_slice(&lsn.file_offset().to_be_bytes());
}

fn put_page_header(buf: &mut Vec<u8>, file_name: &str, page_no: u16, count: usize) -> Result<()> {
    let name = file_name.as_bytes();
    let name_len = u8::try_from(name.len()).map_err(|_| {
        AriesError::InvalidArgument(format!(
            "File name of {} bytes exceeds {MAX_FILE_NAME_LEN}",
            name.len()
        ))
    })?;
    let count = u16::try_from(count)
        .map_err(|_| AriesError::InvalidArgument(format!("Too many page segments ({count})")))?;

    buf.push(name_len);
    buf.extend_from_slice(name);
    buf.extend_from_slice(&page_no.to_be_bytes());
    buf.extend_from_slice(&count.to_be_bytes());
    Ok(())
}

fn put_segment_header(buf: &mut Vec<u8>, offset: u16, len: usize) -> Result<()> {
    if usize::from(offset) + len > PAGE_SIZE {
        return Err(AriesError::InvalidArgument(format!(
            "Segment of {len} bytes at offset {offset} leaves the page"
        )));
    }
    buf.extend_from_slice(&offset.to_be_bytes());
    // Bounded by PAGE_SIZE above.
    buf.extend_from_slice(&(len as u16).to_be_bytes());
    Ok(())
}

/// Bounds-checked big-endian reader over one segment's bytes.
///
/// Every failure is reported as a corrupt log at the record being read.
pub struct ByteCursor<'a> {
    buf: &'a [u8],
    pos: usize,
    lsn: LogSequenceNumber,
}

impl<'a> ByteCursor<'a> {
    /// Creates a cursor at `pos`, attributing errors to `lsn`.
    #[must_use]
    pub fn new(buf: &'a [u8], pos: usize, lsn: LogSequenceNumber) -> Self {
        Self { buf, pos, lsn }
    }

    /// Returns the current position.
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Reads `len` raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`AriesError::CorruptLog`] if the buffer ends first.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| {
                AriesError::corrupt(
                    self.lsn,
                    format!("record truncated reading {len} bytes at offset {}", self.pos),
                )
            })?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    /// Reads one byte.
    ///
    /// # Errors
    ///
    /// Returns [`AriesError::CorruptLog`] if the buffer ends first.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    /// Reads a big-endian `u16`.
    ///
    /// # Errors
    ///
    /// Returns [`AriesError::CorruptLog`] if the buffer ends first.
    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    /// Reads a big-endian `u32`.
    ///
    /// # Errors
    ///
    /// Returns [`AriesError::CorruptLog`] if the buffer ends first.
    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    /// Reads a serialized LSN.
    ///
    /// # Errors
    ///
    /// Returns [`AriesError::CorruptLog`] if the buffer ends first.
    pub fn read_lsn(&mut self) -> Result<LogSequenceNumber> {
        let file_no = self.read_u16()?;
        let offset = self.read_u32()?;
        Ok(LogSequenceNumber::new(file_no, offset))
    }

    fn read_type(&mut self) -> Result<WalRecordType> {
        let byte = self.read_u8()?;
        WalRecordType::try_from(byte)
            .map_err(|()| AriesError::corrupt(self.lsn, format!("unrecognized record type {byte}")))
    }

    fn read_page_header(&mut self) -> Result<(String, u16, u16)> {
        let name_len = usize::from(self.read_u8()?);
        let name = std::str::from_utf8(self.read_bytes(name_len)?)
            .map_err(|_| AriesError::corrupt(self.lsn, "file name is not valid UTF-8"))?
            .to_string();
        let page_no = self.read_u16()?;
        let count = self.read_u16()?;
        Ok((name, page_no, count))
    }

    fn read_segment_header(&mut self) -> Result<(u16, usize)> {
        let offset = self.read_u16()?;
        let len = usize::from(self.read_u16()?);
        if usize::from(offset) + len > PAGE_SIZE {
            return Err(AriesError::corrupt(
                self.lsn,
                format!("segment of {len} bytes at offset {offset} leaves the page"),
            ));
        }
        Ok((offset, len))
    }
}

/// Decodes the record starting at `lsn.file_offset()` within `buf`.
///
/// `buf` holds the whole segment. Returns the record and the offset just
/// past it.
///
/// # Errors
///
/// Returns [`AriesError::CorruptLog`] for truncated records, unknown type
/// bytes, mismatched trailers or a wrong stored start offset.
pub fn decode_record(buf: &[u8], lsn: LogSequenceNumber) -> Result<(WalRecord, usize)> {
    let start = lsn.file_offset() as usize;
    let mut cursor = ByteCursor::new(buf, start, lsn);
    let record_type = cursor.read_type()?;
    let txn_id = cursor.read_u32()?;

    let record = match record_type {
        WalRecordType::StartTxn => WalRecord::StartTxn { txn_id },
        WalRecordType::CommitTxn => WalRecord::CommitTxn {
            txn_id,
            prev_lsn: cursor.read_lsn()?,
        },
        WalRecordType::AbortTxn => WalRecord::AbortTxn {
            txn_id,
            prev_lsn: cursor.read_lsn()?,
        },
        WalRecordType::UpdatePage => {
            let prev_lsn = cursor.read_lsn()?;
            let (file_name, page_no, count) = cursor.read_page_header()?;
            let mut segments = Vec::with_capacity(usize::from(count));
            for _ in 0..count {
                let (offset, len) = cursor.read_segment_header()?;
                let old_data = cursor.read_bytes(len)?.to_vec();
                let new_data = cursor.read_bytes(len)?.to_vec();
                segments.push(UpdateSegment {
                    offset,
                    old_data,
                    new_data,
                });
            }
            check_start_offset(&mut cursor, lsn)?;
            WalRecord::UpdatePage {
                txn_id,
                prev_lsn,
                file_name,
                page_no,
                segments,
            }
        }
        WalRecordType::UpdatePageRedoOnly => {
            let prev_lsn = cursor.read_lsn()?;
            let (file_name, page_no, count) = cursor.read_page_header()?;
            let mut segments = Vec::with_capacity(usize::from(count));
            for _ in 0..count {
                let (offset, len) = cursor.read_segment_header()?;
                let data = cursor.read_bytes(len)?.to_vec();
                segments.push(RedoSegment { offset, data });
            }
            check_start_offset(&mut cursor, lsn)?;
            WalRecord::UpdatePageRedoOnly {
                txn_id,
                prev_lsn,
                file_name,
                page_no,
                segments,
            }
        }
    };

    let trailer = cursor.read_u8()?;
    if trailer != record_type as u8 {
        return Err(AriesError::corrupt(
            lsn,
            format!(
                "trailing type byte {trailer} does not match {record_type} ({})",
                record_type as u8
            ),
        ));
    }

    Ok((record, cursor.position()))
}

fn check_start_offset(cursor: &mut ByteCursor<'_>, lsn: LogSequenceNumber) -> Result<()> {
    let stored = cursor.read_u32()?;
    if stored != lsn.file_offset() {
        return Err(AriesError::corrupt(
            lsn,
            format!("stored start offset {stored} does not match record position"),
        ));
    }
    Ok(())
}

/// Finds the start offset of the record that ends just before `end`.
///
/// `at` names the position for error reporting.
///
/// # Errors
///
/// Returns [`AriesError::CorruptLog`] if the trailing type byte is unknown
/// or the computed start lies outside the segment's record area.
pub fn record_start_before(buf: &[u8], end: usize, at: LogSequenceNumber) -> Result<usize> {
    if end <= OFFSET_FIRST_RECORD as usize || end > buf.len() {
        return Err(AriesError::corrupt(
            at,
            format!("no record can end at offset {end}"),
        ));
    }

    let mut cursor = ByteCursor::new(buf, end - 1, at);
    let record_type = cursor.read_type()?;

    let start = match record_type.fixed_size() {
        Some(size) => end.checked_sub(size as usize),
        None => {
            let mut cursor = ByteCursor::new(buf, end - 5, at);
            Some(cursor.read_u32()? as usize)
        }
    };

    match start {
        Some(start) if start >= OFFSET_FIRST_RECORD as usize && start < end => Ok(start),
        _ => Err(AriesError::corrupt(
            at,
            format!("{record_type} record ending at offset {end} has an invalid start"),
        )),
    }
}
