//! Cursors over a table's primary index.
//!
//! A [`Cursor`] borrows the [`Session`] that opened it, so it cannot outlive
//! the session or survive a commit/rollback of the transaction it runs in.
//! The primary-key column is the MDBX key; every other column is read from and
//! written to the row record (see [`crate::record`]).

use std::marker::PhantomData;
use std::ptr;

use mdbx_sys::{
    mdbx_cursor_close, mdbx_cursor_del, mdbx_cursor_get, mdbx_cursor_open, mdbx_cursor_put,
    MDBX_cursor, MDBX_cursor_op, MDBX_val, MDBX_CURRENT, MDBX_FIRST, MDBX_GET_CURRENT,
    MDBX_KEYEXIST, MDBX_LAST, MDBX_NEXT, MDBX_NOOVERWRITE, MDBX_PREV, MDBX_RESERVE, MDBX_SET_KEY,
    MDBX_SET_RANGE, MDBX_UPSERT,
};
use tracing::trace;

use crate::catalog::{Table, TableLayout};
use crate::interop::{ColumnId, InteropError, TempTableGrbit};
use crate::record::{self, RecordError};
use crate::session::Session;
use crate::txn_helpers::{check, check_found, empty_val, key_hex, slice_of, val_of, TxnError};

/// Column values staged for an insert or replace.
///
/// `None` sets the column to NULL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateBuffer {
    columns: Vec<(ColumnId, Option<Vec<u8>>)>,
}

impl UpdateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, id: ColumnId, value: impl Into<Vec<u8>>) -> &mut Self {
        self.stage(id, Some(value.into()))
    }

    pub fn set_null(&mut self, id: ColumnId) -> &mut Self {
        self.stage(id, None)
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    fn stage(&mut self, id: ColumnId, value: Option<Vec<u8>>) -> &mut Self {
        match self.columns.iter_mut().find(|(cid, _)| *cid == id) {
            Some(slot) => slot.1 = value,
            None => self.columns.push((id, value)),
        }
        self
    }

    fn get(&self, id: ColumnId) -> Option<&Option<Vec<u8>>> {
        self.columns.iter().find(|(cid, _)| *cid == id).map(|(_, v)| v)
    }

    fn validate(&self, layout: &TableLayout, key_column: ColumnId) -> Result<(), TxnError> {
        for (id, value) in &self.columns {
            if *id == key_column {
                return Err(TxnError::Schema(format!(
                    "{} is the primary key and cannot be set through the update buffer",
                    id
                )));
            }
            let column = layout
                .column(*id)
                .ok_or_else(|| TxnError::Schema(format!("{} does not exist", id)))?;
            match value {
                None if !column.is_nullable() => {
                    return Err(TxnError::Schema(format!("column '{}' is NOT NULL", column.name)));
                }
                None => {}
                Some(bytes) => {
                    if let Some(width) = column.def.column_type.fixed_size() {
                        if bytes.len() != width {
                            return Err(InteropError::InvalidParameter(format!(
                                "column '{}' is {} bytes wide, got {}",
                                column.name,
                                width,
                                bytes.len()
                            ))
                            .into());
                        }
                    } else if column.def.max_size != 0 && bytes.len() > column.def.max_size {
                        return Err(InteropError::OutOfRange {
                            field: "column",
                            value: bytes.len() as u64,
                            max: column.def.max_size as u64,
                        }
                        .into());
                    }
                }
            }
        }
        Ok(())
    }
}

/// Position within a table, bound to the session that opened it.
pub struct Cursor<'s> {
    cursor: *mut MDBX_cursor,
    session: &'s Session,
    table: &'s Table,
    key_column: ColumnId,
    positioned: bool,
    _not_send: PhantomData<*mut ()>,
}

impl Session {
    /// Opens a cursor in the current transaction. The table needs a primary index.
    pub fn open_cursor<'s>(&'s self, table: &'s Table) -> Result<Cursor<'s>, TxnError> {
        let key_column = table
            .layout()
            .key_column()
            .ok_or_else(|| TxnError::Schema(format!("table '{}' has no primary index", table.name())))?;
        let txn = self.txn()?;
        let mut cursor: *mut MDBX_cursor = ptr::null_mut();
        let rc = unsafe { mdbx_cursor_open(txn, table.dbi(), &mut cursor) };
        check(rc, "mdbx_cursor_open")?;
        trace!(session = self.id(), table = table.name(), "cursor opened");
        Ok(Cursor {
            cursor,
            session: self,
            table,
            key_column,
            positioned: false,
            _not_send: PhantomData,
        })
    }
}

impl<'s> Cursor<'s> {
    pub fn table(&self) -> &Table {
        self.table
    }

    pub fn is_positioned(&self) -> bool {
        self.positioned
    }

    fn get(&mut self, key: &mut MDBX_val, op: MDBX_cursor_op, name: &'static str) -> Result<bool, TxnError> {
        let mut data = empty_val();
        let rc = unsafe { mdbx_cursor_get(self.cursor, key, &mut data, op) };
        let found = check_found(rc, name)?;
        self.positioned = found;
        Ok(found)
    }

    fn step(&mut self, op: MDBX_cursor_op, name: &'static str) -> Result<bool, TxnError> {
        let mut key = empty_val();
        self.get(&mut key, op, name)
    }

    fn require_scrollable(&self) -> Result<(), TxnError> {
        match self.table.layout().temp_flags {
            Some(flags) if flags.contains(TempTableGrbit::FORWARD_ONLY) => Err(TxnError::Schema(
                format!("temporary table '{}' is forward-only", self.table.name()),
            )),
            _ => Ok(()),
        }
    }

    fn check_key(&self, key: &[u8]) -> Result<(), TxnError> {
        let max = self.table.layout().max_key_size;
        if key.len() > max {
            return Err(InteropError::OutOfRange {
                field: "key",
                value: key.len() as u64,
                max: max as u64,
            }
            .into());
        }
        Ok(())
    }

    /// Positions on `key`. Returns false (and leaves the cursor unpositioned)
    /// when there is no such row.
    pub fn seek_exact(&mut self, key: &[u8]) -> Result<bool, TxnError> {
        self.check_key(key)?;
        let mut k = val_of(key);
        self.get(&mut k, MDBX_SET_KEY, "mdbx_cursor_get(SET_KEY)")
    }

    /// Positions on the first row whose key is `>= key`.
    pub fn seek_at_or_after(&mut self, key: &[u8]) -> Result<bool, TxnError> {
        self.check_key(key)?;
        let mut k = val_of(key);
        self.get(&mut k, MDBX_SET_RANGE, "mdbx_cursor_get(SET_RANGE)")
    }

    pub fn move_first(&mut self) -> Result<bool, TxnError> {
        self.step(MDBX_FIRST, "mdbx_cursor_get(FIRST)")
    }

    pub fn move_last(&mut self) -> Result<bool, TxnError> {
        self.require_scrollable()?;
        self.step(MDBX_LAST, "mdbx_cursor_get(LAST)")
    }

    /// Advances; on an unpositioned cursor this moves to the first row.
    pub fn move_next(&mut self) -> Result<bool, TxnError> {
        self.step(MDBX_NEXT, "mdbx_cursor_get(NEXT)")
    }

    pub fn move_prev(&mut self) -> Result<bool, TxnError> {
        self.require_scrollable()?;
        self.step(MDBX_PREV, "mdbx_cursor_get(PREV)")
    }

    fn current(&self) -> Result<(&[u8], &[u8]), TxnError> {
        if !self.positioned {
            return Err(TxnError::NotPositioned);
        }
        let mut key = empty_val();
        let mut data = empty_val();
        let rc = unsafe { mdbx_cursor_get(self.cursor, &mut key, &mut data, MDBX_GET_CURRENT) };
        if !check_found(rc, "mdbx_cursor_get(GET_CURRENT)")? {
            return Err(TxnError::NotPositioned);
        }
        // SAFETY: valid until the cursor moves or writes, both of which need
        // `&mut self`.
        Ok(unsafe { (slice_of(&key), slice_of(&data)) })
    }

    /// Encoded primary key of the current row.
    pub fn key(&self) -> Result<&[u8], TxnError> {
        self.current().map(|(key, _)| key)
    }

    /// Value of column `id` in the current row; `None` is NULL.
    pub fn retrieve_column(&self, id: ColumnId) -> Result<Option<&[u8]>, TxnError> {
        if self.table.layout().column(id).is_none() {
            return Err(TxnError::Schema(format!(
                "{} does not exist in '{}'",
                id,
                self.table.name()
            )));
        }
        let (key, data) = self.current()?;
        if id == self.key_column {
            return Ok(Some(key));
        }
        let view = record::decode(data)?;
        Ok(view.column(id))
    }

    fn require_write(&self) -> Result<(), TxnError> {
        self.session.write_txn().map(|_| ())
    }

    /// Inserts a new row. Fails with [`TxnError::KeyExists`] if `key` is taken.
    /// The cursor is left on the new row.
    pub fn insert(&mut self, key: &[u8], update: &UpdateBuffer) -> Result<(), TxnError> {
        self.require_write()?;
        self.check_key(key)?;
        let layout = self.table.layout();
        update.validate(layout, self.key_column)?;
        for column in layout.columns() {
            if column.id != self.key_column && !column.is_nullable() && update.get(column.id).is_none() {
                return Err(TxnError::Schema(format!("column '{}' is NOT NULL", column.name)));
            }
        }

        let mut columns: Vec<(ColumnId, &[u8])> = update
            .columns
            .iter()
            .filter_map(|(id, v)| v.as_deref().map(|bytes| (*id, bytes)))
            .collect();
        columns.sort_by_key(|(id, _)| *id);
        let len = record::encoded_len(&columns);

        let k = val_of(key);
        let mut data = MDBX_val {
            iov_len: len,
            iov_base: ptr::null_mut(),
        };
        let rc = unsafe { mdbx_cursor_put(self.cursor, &k, &mut data, MDBX_NOOVERWRITE | MDBX_RESERVE) };
        if rc == MDBX_KEYEXIST {
            return Err(TxnError::KeyExists(key_hex(key)));
        }
        check(rc, "mdbx_cursor_put(RESERVE)")?;
        if data.iov_base.is_null() || data.iov_len != len {
            return Err(RecordError::BufferSize {
                needed: len,
                actual: data.iov_len,
            }
            .into());
        }
        // SAFETY: the engine reserved exactly `len` writable bytes that stay
        // valid until the next write in this transaction.
        let dst = unsafe { std::slice::from_raw_parts_mut(data.iov_base as *mut u8, len) };
        record::encode_into(dst, &columns)?;
        self.positioned = true;
        Ok(())
    }

    /// Rewrites the current row, changing only the columns in `update`.
    /// The key, and so the row's position, is unchanged.
    pub fn replace(&mut self, update: &UpdateBuffer) -> Result<(), TxnError> {
        self.require_write()?;
        update.validate(self.table.layout(), self.key_column)?;

        let (key, data) = self.current()?;
        let key = key.to_vec();
        let existing = record::decode(data)?;
        let mut merged: Vec<(ColumnId, Vec<u8>)> = existing
            .iter()
            .filter(|(id, _)| update.get(*id).is_none())
            .map(|(id, bytes)| (id, bytes.to_vec()))
            .collect();
        merged.extend(
            update
                .columns
                .iter()
                .filter_map(|(id, v)| v.clone().map(|bytes| (*id, bytes))),
        );
        merged.sort_by_key(|(id, _)| *id);

        let columns: Vec<(ColumnId, &[u8])> = merged.iter().map(|(id, b)| (*id, b.as_slice())).collect();
        let encoded = record::encode(&columns)?;
        let k = val_of(&key);
        let mut d = val_of(&encoded);
        let rc = unsafe { mdbx_cursor_put(self.cursor, &k, &mut d, MDBX_CURRENT) };
        check(rc, "mdbx_cursor_put(CURRENT)")?;
        Ok(())
    }

    /// Deletes the current row. The cursor is left unpositioned.
    pub fn delete(&mut self) -> Result<(), TxnError> {
        self.require_write()?;
        if !self.positioned {
            return Err(TxnError::NotPositioned);
        }
        let rc = unsafe { mdbx_cursor_del(self.cursor, MDBX_UPSERT) };
        self.positioned = false;
        check(rc, "mdbx_cursor_del")
    }
}

impl Drop for Cursor<'_> {
    fn drop(&mut self) {
        unsafe { mdbx_cursor_close(self.cursor) };
    }
}
