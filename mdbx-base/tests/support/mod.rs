//! Shared fixtures for mdbx-base integration tests.

#![allow(dead_code)]

use common::DbResult;
use mdbx_base::{
    with_retry, ColumnDef, ColumnGrbit, ColumnId, ColumnType, IndexCreate, IndexGrbit,
    RetryPolicy, Session, Table, TableCreate, ToWire, UpdateBuffer,
};

pub const TABLE: &str = "items";

pub fn text_key() -> ColumnDef {
    ColumnDef {
        column_type: ColumnType::Text,
        max_size: 0,
        flags: ColumnGrbit::NOT_NULL,
    }
}

pub fn blob_value() -> ColumnDef {
    ColumnDef {
        column_type: ColumnType::LongBinary,
        max_size: 0,
        flags: ColumnGrbit::NONE,
    }
}

/// Creates `items(key TEXT NOT NULL PRIMARY KEY, value LONG BINARY)` and
/// returns the table and the value column.
pub fn create_items(session: &mut Session) -> DbResult<(Table, ColumnId)> {
    with_retry(session, &RetryPolicy::default(), |s| {
        let mut table = s.create_table(TABLE, &TableCreate::default().to_wire()?)?;
        let key = s.add_column(&mut table, "key", &text_key().to_wire()?)?;
        let value = s.add_column(&mut table, "value", &blob_value().to_wire()?)?;
        let index = IndexCreate {
            key_column: key,
            flags: IndexGrbit::PRIMARY | IndexGrbit::UNIQUE,
            max_key_size: 0,
        };
        s.create_index(&mut table, "primary", &index.to_wire()?)?;
        Ok((table, value))
    })
}

/// Upserts inside whatever write transaction the session has open.
pub fn write(session: &Session, table: &Table, column: ColumnId, key: &[u8], value: &[u8]) -> DbResult<()> {
    let mut cursor = session.open_cursor(table)?;
    let mut update = UpdateBuffer::new();
    update.set(column, value.to_vec());
    if cursor.seek_exact(key)? {
        cursor.replace(&update)?;
    } else {
        cursor.insert(key, &update)?;
    }
    Ok(())
}

/// Upserts in its own retried transaction.
pub fn put(session: &mut Session, table: &Table, column: ColumnId, key: &[u8], value: &[u8]) -> DbResult<()> {
    with_retry(session, &RetryPolicy::default(), |s| write(s, table, column, key, value))
}

fn lookup(session: &Session, table: &Table, column: ColumnId, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
    let mut cursor = session.open_cursor(table)?;
    if !cursor.seek_exact(key)? {
        return Ok(None);
    }
    Ok(cursor.retrieve_column(column)?.map(|v| v.to_vec()))
}

/// Reads in a fresh snapshot.
pub fn read(session: &mut Session, table: &Table, column: ColumnId, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
    session.begin_read_transaction()?;
    let result = lookup(session, table, column, key);
    session.commit()?;
    result
}

/// All keys in index order, read in a fresh snapshot.
pub fn keys(session: &mut Session, table: &Table) -> DbResult<Vec<Vec<u8>>> {
    session.begin_read_transaction()?;
    let result = (|| -> DbResult<Vec<Vec<u8>>> {
        let mut cursor = session.open_cursor(table)?;
        let mut out = Vec::new();
        let mut more = cursor.move_first()?;
        while more {
            out.push(cursor.key()?.to_vec());
            more = cursor.move_next()?;
        }
        Ok(out)
    })();
    session.commit()?;
    result
}
