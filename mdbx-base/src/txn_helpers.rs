//! Transaction Helpers - thin, unsafe wrappers around raw MDBX transaction calls.
//!
//! [`Session`](crate::Session) builds the safe API on top of these. Everything
//! here takes raw pointers and leaves lifetime management to the caller.

use std::ffi::{c_void, CString};
use std::ptr;
use std::slice;

use common::DbError;
use mdbx_sys::{
    mdbx_dbi_open, mdbx_txn_abort, mdbx_txn_begin_ex, mdbx_txn_commit_ex, MDBX_dbi, MDBX_env,
    MDBX_txn, MDBX_val, MDBX_BUSY, MDBX_CREATE, MDBX_NOTFOUND, MDBX_RESULT_TRUE, MDBX_SUCCESS,
    MDBX_TXN_RDONLY, MDBX_TXN_TRY,
};
use thiserror::Error;

use crate::env_builder::error_message;
use crate::interop::InteropError;
use crate::record::RecordError;

#[derive(Debug, Error)]
pub enum TxnError {
    #[error("Failed to begin transaction: {message} ({code})")]
    BeginFailed { code: i32, message: String },

    /// The writer lock is held elsewhere (or by this thread already).
    #[error("Write transaction busy")]
    Busy,

    #[error("Failed to commit transaction: {message} ({code})")]
    CommitFailed { code: i32, message: String },

    #[error("Failed to open DBI '{name}': {message} ({code})")]
    DbiOpenFailed {
        name: String,
        code: i32,
        message: String,
    },

    #[error("{op} failed: {message} ({code})")]
    Operation {
        op: &'static str,
        code: i32,
        message: String,
    },

    #[error("No active transaction")]
    NoTransaction,

    #[error("Write attempted inside a read-only transaction")]
    ReadOnly,

    #[error("Read-only transactions cannot be nested")]
    NestedReadOnly,

    #[error("Invalid table name: {0}")]
    InvalidName(String),

    #[error("Table '{0}' already exists")]
    TableExists(String),

    /// Carries the encoded key as hex.
    #[error("Key already exists: {0}")]
    KeyExists(String),

    #[error("Cursor is not positioned on a row")]
    NotPositioned,

    #[error("Schema operation rejected: {0}")]
    Schema(String),

    #[error("Catalog serialization failed: {0}")]
    Catalog(String),

    #[error(transparent)]
    Interop(#[from] InteropError),

    #[error(transparent)]
    Record(#[from] RecordError),
}

impl From<TxnError> for DbError {
    fn from(err: TxnError) -> Self {
        match err {
            TxnError::Busy => DbError::WriteConflict { attempts: 1 },
            TxnError::BeginFailed { code, message } => DbError::Engine {
                op: "mdbx_txn_begin_ex",
                code,
                message,
            },
            TxnError::CommitFailed { code, message } => DbError::Engine {
                op: "mdbx_txn_commit_ex",
                code,
                message,
            },
            TxnError::DbiOpenFailed { code, message, name } => DbError::Engine {
                op: "mdbx_dbi_open",
                code,
                message: format!("{} ({})", message, name),
            },
            TxnError::Operation { op, code, message } => DbError::Engine { op, code, message },
            TxnError::KeyExists(key) => DbError::DuplicateKey(key),
            TxnError::Catalog(msg) => DbError::Serialization(msg),
            TxnError::Interop(e) => e.into(),
            TxnError::Record(e) => e.into(),
            other => DbError::InvalidOperation(other.to_string()),
        }
    }
}

/// Maps an MDBX return code for `op` into a result.
pub fn check(rc: i32, op: &'static str) -> Result<(), TxnError> {
    if rc == MDBX_SUCCESS {
        Ok(())
    } else {
        Err(TxnError::Operation {
            op,
            code: rc,
            message: error_message(rc),
        })
    }
}

/// Like [`check`] but maps `MDBX_NOTFOUND` to `Ok(false)`.
pub fn check_found(rc: i32, op: &'static str) -> Result<bool, TxnError> {
    if rc == MDBX_NOTFOUND {
        return Ok(false);
    }
    check(rc, op).map(|_| true)
}

/// Lowercase hex of a raw key, for error messages.
pub fn key_hex(key: &[u8]) -> String {
    key.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Borrows a byte slice as an `MDBX_val` for the duration of an FFI call.
pub fn val_of(bytes: &[u8]) -> MDBX_val {
    MDBX_val {
        iov_len: bytes.len(),
        iov_base: bytes.as_ptr() as *mut c_void,
    }
}

pub fn empty_val() -> MDBX_val {
    MDBX_val {
        iov_len: 0,
        iov_base: ptr::null_mut(),
    }
}

/// Views an `MDBX_val` returned by the engine as a slice.
///
/// # Safety
///
/// `val` must point into memory that stays valid for `'a`, i.e. the
/// transaction (and, for cursor values, the cursor position) is unchanged.
pub unsafe fn slice_of<'a>(val: &MDBX_val) -> &'a [u8] {
    if val.iov_len == 0 || val.iov_base.is_null() {
        return &[];
    }
    slice::from_raw_parts(val.iov_base as *const u8, val.iov_len)
}

/// Begins a transaction.
///
/// `parent` must be null for read-only transactions. With `try_lock` a busy
/// writer lock yields [`TxnError::Busy`] instead of blocking.
///
/// # Safety
///
/// `env` must be open; `parent`, if non-null, must be a live write
/// transaction of the same environment owned by the calling thread.
pub unsafe fn begin_txn(
    env: *mut MDBX_env,
    parent: *mut MDBX_txn,
    read_only: bool,
    try_lock: bool,
) -> Result<*mut MDBX_txn, TxnError> {
    let mut flags: u32 = 0;
    if read_only {
        flags |= MDBX_TXN_RDONLY as u32;
    }
    if try_lock && !read_only {
        flags |= MDBX_TXN_TRY as u32;
    }

    let mut txn: *mut MDBX_txn = ptr::null_mut();
    let rc = mdbx_txn_begin_ex(env, parent, flags as _, &mut txn, ptr::null_mut());
    match rc {
        MDBX_SUCCESS => Ok(txn),
        MDBX_BUSY => Err(TxnError::Busy),
        code => Err(TxnError::BeginFailed {
            code,
            message: error_message(code),
        }),
    }
}

/// Commits and frees `txn`. The handle is gone whatever the outcome.
///
/// # Safety
///
/// `txn` must be live, with no child transaction or write cursor still open.
pub unsafe fn commit_txn(txn: *mut MDBX_txn) -> Result<(), TxnError> {
    let rc = mdbx_txn_commit_ex(txn, ptr::null_mut());
    match rc {
        MDBX_SUCCESS => Ok(()),
        MDBX_BUSY => Err(TxnError::Busy),
        // The engine aborted the transaction because an earlier call failed.
        MDBX_RESULT_TRUE => Err(TxnError::CommitFailed {
            code: rc,
            message: "transaction was aborted after an earlier error".to_string(),
        }),
        code => Err(TxnError::CommitFailed {
            code,
            message: error_message(code),
        }),
    }
}

/// Aborts and frees `txn`.
///
/// # Safety
///
/// `txn` must be live.
pub unsafe fn abort_txn(txn: *mut MDBX_txn) {
    mdbx_txn_abort(txn);
}

/// Opens a named database (DBI) within a transaction.
///
/// Returns `Ok(None)` when the database does not exist and `create` is false.
///
/// # Safety
///
/// The transaction must be valid and active; `create` requires a write
/// transaction.
pub unsafe fn open_dbi(
    txn: *mut MDBX_txn,
    name: &str,
    create: bool,
) -> Result<Option<MDBX_dbi>, TxnError> {
    let name_c = CString::new(name).map_err(|_| TxnError::InvalidName(name.to_string()))?;
    let flags = if create { MDBX_CREATE as u32 } else { 0 };

    let mut dbi: MDBX_dbi = 0;
    let rc = mdbx_dbi_open(txn, name_c.as_ptr(), flags as _, &mut dbi);
    match rc {
        MDBX_SUCCESS => Ok(Some(dbi)),
        MDBX_NOTFOUND if !create => Ok(None),
        code => Err(TxnError::DbiOpenFailed {
            name: name.to_string(),
            code,
            message: error_message(code),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_maps_codes() {
        assert!(check(MDBX_SUCCESS, "noop").is_ok());
        assert_eq!(check_found(MDBX_NOTFOUND, "get").unwrap(), false);
        assert_eq!(check_found(MDBX_SUCCESS, "get").unwrap(), true);

        let err = check(MDBX_BUSY, "put").unwrap_err();
        match err {
            TxnError::Operation { op, code, .. } => {
                assert_eq!(op, "put");
                assert_eq!(code, MDBX_BUSY);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_key_exists_names_the_key() {
        let err = DbError::from(TxnError::KeyExists(key_hex(&[0x01, b'f', b'o', b'o'])));
        match err {
            DbError::DuplicateKey(key) => assert_eq!(key, "01666f6f"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_busy_becomes_write_conflict() {
        assert!(DbError::from(TxnError::Busy).is_write_conflict());
        assert!(!DbError::from(TxnError::ReadOnly).is_write_conflict());
    }

    #[test]
    fn test_val_round_trip() {
        let bytes = b"payload".to_vec();
        let val = val_of(&bytes);
        let view = unsafe { slice_of(&val) };
        assert_eq!(view, b"payload");
        assert!(unsafe { slice_of(&empty_val()) }.is_empty());
    }
}
