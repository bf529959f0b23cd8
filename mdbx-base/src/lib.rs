//! Native call boundary for the persistent dictionary.
//!
//! Everything that touches `mdbx-sys` lives in this crate. On top of the raw
//! environment, transaction, DBI and cursor calls it provides:
//!
//! - versioned parameter blocks and their fixed-layout wire structs
//!   ([`interop`]),
//! - sessions with nested transactions and bounded write-conflict retry
//!   ([`session`]),
//! - tables with typed columns and a primary index, described in a catalog
//!   ([`catalog`]),
//! - cursors that read and write checksummed row records ([`cursor`],
//!   [`record`]).
//!
//! # Example
//!
//! ```no_run
//! use mdbx_base::{
//!     with_retry, ColumnDef, ColumnGrbit, ColumnType, IndexCreate, IndexGrbit, MdbxEnvBuilder,
//!     RetryPolicy, Session, TableCreate, ToWire, UpdateBuffer,
//! };
//!
//! let env = MdbxEnvBuilder::new("/path/to/db").open_shared()?;
//! let mut session = Session::open(env);
//! with_retry(&mut session, &RetryPolicy::default(), |s| {
//!     let mut table = s.create_table("people", &TableCreate::default().to_wire()?)?;
//!     let name = s.add_column(&mut table, "name", &ColumnDef {
//!         column_type: ColumnType::Text,
//!         max_size: 0,
//!         flags: ColumnGrbit::NOT_NULL,
//!     }.to_wire()?)?;
//!     let age = s.add_column(&mut table, "age", &ColumnDef {
//!         column_type: ColumnType::Long,
//!         max_size: 0,
//!         flags: ColumnGrbit::NONE,
//!     }.to_wire()?)?;
//!     s.create_index(&mut table, "primary", &IndexCreate {
//!         key_column: name,
//!         flags: IndexGrbit::PRIMARY | IndexGrbit::UNIQUE,
//!         max_key_size: 0,
//!     }.to_wire()?)?;
//!
//!     let mut cursor = s.open_cursor(&table)?;
//!     let mut update = UpdateBuffer::new();
//!     update.set(age, 42i32.to_le_bytes().to_vec());
//!     cursor.insert(b"ada", &update)?;
//!     Ok(())
//! })?;
//! # Ok::<(), common::DbError>(())
//! ```

/// Versioned parameter blocks <-> `#[repr(C)]` wire structs
pub mod interop;

/// Environment builder and process-wide environment registry
pub mod env_builder;

/// Raw transaction and DBI calls
pub mod txn_helpers;

/// Sessions, nested transactions and conflict retry
pub mod session;

/// Table catalog: create/open/drop tables, columns, primary index
pub mod catalog;

/// Cursors and update buffers
pub mod cursor;

/// Checksummed row records
pub mod record;

// Re-export MDBX bindings (ONLY place with this dep!)
pub use mdbx_sys;

pub use catalog::{ColumnInfo, IndexInfo, Table, TableLayout, CATALOG_NAME, MAX_COLUMNS};
pub use cursor::{Cursor, UpdateBuffer};
pub use env_builder::{
    data_file_exists, delete_files, is_open, MdbxEnv, MdbxEnvBuilder, MdbxEnvError, SyncMode,
    DATA_FILE_NAME,
};
pub use interop::{
    accept, ColumnDef, ColumnGrbit, ColumnId, ColumnType, FromWire, IndexCreate, IndexGrbit,
    InteropError, NativeColumnDef, NativeIndexCreate, NativeOpenTemporaryTable, NativeTableCreate,
    NativeTableCreateV1, OpenTemporaryTable, TableCreate, TableGrbit, TableStats, TempTableGrbit,
    ToWire, Versioned, WireLayoutOf, WireStruct,
};
pub use record::RecordError;
pub use session::{with_retry, LockWait, RetryPolicy, Session};
pub use txn_helpers::TxnError;
