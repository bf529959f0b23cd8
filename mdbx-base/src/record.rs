//! Row record codec.
//!
//! A row's MDBX key is its primary-key column; the MDBX value is a record
//! carrying every other non-NULL column:
//!
//! ```text
//! +-------+-----+------+----------+--------+--------------------------------+
//! | magic | ver | ncol | body_len | crc32c | (col_id u32, len u32, bytes)*  |
//! |  u16  | u8  |  u8  |   u32    |  u32   |                                |
//! +-------+-----+------+----------+--------+--------------------------------+
//! ```
//!
//! All integers are little-endian. NULL columns are simply absent. The
//! checksum covers the body only and is verified on every decode.

use common::DbError;
use thiserror::Error;

use crate::interop::ColumnId;

const RECORD_MAGIC: u16 = 0xD1C7;
const RECORD_VERSION: u8 = 1;
pub const RECORD_HEADER_SIZE: usize = 12;
const ENTRY_HEADER_SIZE: usize = 8;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("record of {len} bytes is smaller than its header")]
    TooSmall { len: usize },

    #[error("magic mismatch: got {0:#06x}")]
    BadMagic(u16),

    #[error("unsupported record version {0}")]
    UnsupportedVersion(u8),

    #[error("body length mismatch: header says {declared}, found {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("crc mismatch: expected {expected:#010x} got {actual:#010x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("malformed record body: {0}")]
    Malformed(String),

    #[error("record cannot hold {0} columns")]
    TooManyColumns(usize),

    #[error("encode buffer is {actual} bytes, record needs {needed}")]
    BufferSize { needed: usize, actual: usize },
}

impl From<RecordError> for DbError {
    fn from(err: RecordError) -> Self {
        match err {
            RecordError::TooManyColumns(_) | RecordError::BufferSize { .. } => {
                DbError::InvalidOperation(err.to_string())
            }
            other => DbError::Corruption(other.to_string()),
        }
    }
}

/// CRC32C (Castagnoli). The crate picks SSE4.2/ARM instructions when present
/// and a table-driven fallback otherwise, so stored checksums are portable.
pub fn record_checksum(bytes: &[u8]) -> u32 {
    crc32c::crc32c(bytes)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: u16,
    pub version: u8,
    pub columns: u8,
    pub body_len: u32,
    pub crc32: u32,
}

impl Header {
    fn to_bytes(self) -> [u8; RECORD_HEADER_SIZE] {
        let mut b = [0u8; RECORD_HEADER_SIZE];
        b[0..2].copy_from_slice(&self.magic.to_le_bytes());
        b[2] = self.version;
        b[3] = self.columns;
        b[4..8].copy_from_slice(&self.body_len.to_le_bytes());
        b[8..12].copy_from_slice(&self.crc32.to_le_bytes());
        b
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Header, RecordError> {
        if buf.len() < RECORD_HEADER_SIZE {
            return Err(RecordError::TooSmall { len: buf.len() });
        }
        Ok(Header {
            magic: u16::from_le_bytes([buf[0], buf[1]]),
            version: buf[2],
            columns: buf[3],
            body_len: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            crc32: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }
}

/// Total encoded size for `columns`.
pub fn encoded_len(columns: &[(ColumnId, &[u8])]) -> usize {
    RECORD_HEADER_SIZE
        + columns
            .iter()
            .map(|(_, data)| ENTRY_HEADER_SIZE + data.len())
            .sum::<usize>()
}

/// Writes the record for `columns` into `dst`, which must be exactly
/// [`encoded_len`] bytes (typically an `MDBX_RESERVE`d region).
pub fn encode_into(dst: &mut [u8], columns: &[(ColumnId, &[u8])]) -> Result<(), RecordError> {
    let needed = encoded_len(columns);
    if dst.len() != needed {
        return Err(RecordError::BufferSize {
            needed,
            actual: dst.len(),
        });
    }
    let count = u8::try_from(columns.len()).map_err(|_| RecordError::TooManyColumns(columns.len()))?;
    let body_len = u32::try_from(needed - RECORD_HEADER_SIZE)
        .map_err(|_| RecordError::Malformed("body exceeds 4GiB".into()))?;

    let mut at = RECORD_HEADER_SIZE;
    for (id, data) in columns {
        let len = u32::try_from(data.len())
            .map_err(|_| RecordError::Malformed(format!("{} exceeds 4GiB", id)))?;
        dst[at..at + 4].copy_from_slice(&id.0.to_le_bytes());
        dst[at + 4..at + 8].copy_from_slice(&len.to_le_bytes());
        at += ENTRY_HEADER_SIZE;
        dst[at..at + data.len()].copy_from_slice(data);
        at += data.len();
    }

    let header = Header {
        magic: RECORD_MAGIC,
        version: RECORD_VERSION,
        columns: count,
        body_len,
        crc32: record_checksum(&dst[RECORD_HEADER_SIZE..]),
    };
    dst[..RECORD_HEADER_SIZE].copy_from_slice(&header.to_bytes());
    Ok(())
}

/// Heap-allocating convenience wrapper around [`encode_into`].
pub fn encode(columns: &[(ColumnId, &[u8])]) -> Result<Vec<u8>, RecordError> {
    let mut buf = vec![0u8; encoded_len(columns)];
    encode_into(&mut buf, columns)?;
    Ok(buf)
}

/// Validated view over an encoded record; borrows the engine's memory.
#[derive(Debug, Clone, Copy)]
pub struct RecordView<'a> {
    body: &'a [u8],
}

/// Validates header, checksum and entry framing.
pub fn decode(bytes: &[u8]) -> Result<RecordView<'_>, RecordError> {
    let header = Header::from_bytes(bytes)?;
    if header.magic != RECORD_MAGIC {
        return Err(RecordError::BadMagic(header.magic));
    }
    if header.version != RECORD_VERSION {
        return Err(RecordError::UnsupportedVersion(header.version));
    }
    let body = &bytes[RECORD_HEADER_SIZE..];
    if header.body_len as usize != body.len() {
        return Err(RecordError::LengthMismatch {
            declared: header.body_len as usize,
            actual: body.len(),
        });
    }
    let actual = record_checksum(body);
    if actual != header.crc32 {
        return Err(RecordError::CrcMismatch {
            expected: header.crc32,
            actual,
        });
    }

    let view = RecordView { body };
    let mut seen = 0usize;
    let mut at = 0usize;
    while at < body.len() {
        if body.len() - at < ENTRY_HEADER_SIZE {
            return Err(RecordError::Malformed("truncated entry header".into()));
        }
        let len = u32::from_le_bytes([body[at + 4], body[at + 5], body[at + 6], body[at + 7]]) as usize;
        at += ENTRY_HEADER_SIZE;
        if body.len() - at < len {
            return Err(RecordError::Malformed("entry overruns body".into()));
        }
        at += len;
        seen += 1;
    }
    if seen != header.columns as usize {
        return Err(RecordError::Malformed(format!(
            "header lists {} columns, body holds {}",
            header.columns, seen
        )));
    }
    Ok(view)
}

impl<'a> RecordView<'a> {
    /// Value of column `id`, or `None` when it is NULL.
    pub fn column(&self, id: ColumnId) -> Option<&'a [u8]> {
        self.iter().find(|(cid, _)| *cid == id).map(|(_, data)| data)
    }

    pub fn iter(&self) -> RecordIter<'a> {
        RecordIter {
            body: self.body,
            at: 0,
        }
    }
}

pub struct RecordIter<'a> {
    body: &'a [u8],
    at: usize,
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = (ColumnId, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        // Framing was validated by `decode`.
        let b = self.body;
        if self.at + ENTRY_HEADER_SIZE > b.len() {
            return None;
        }
        let at = self.at;
        let id = u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]]);
        let len = u32::from_le_bytes([b[at + 4], b[at + 5], b[at + 6], b[at + 7]]) as usize;
        let start = at + ENTRY_HEADER_SIZE;
        let data = b.get(start..start + len)?;
        self.at = start + len;
        Some((ColumnId(id), data))
    }
}
