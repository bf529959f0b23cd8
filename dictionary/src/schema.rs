//! Mapping of a key/value type pair onto a two-column table.
//!
//! The table has a `key` column (NOT NULL, covered by the unique primary
//! index) and a `value` column. The layout is derived from the types before
//! the storage location is touched, so an unsupported pair never leaves files
//! behind.

use common::{DbError, DbResult};
use mdbx_base::{
    with_retry, ColumnDef, ColumnGrbit, ColumnId, ColumnType, IndexCreate, IndexGrbit,
    RetryPolicy, Session, Table, TableCreate, TableGrbit, ToWire,
};
use tracing::{debug, info};

use crate::codec::TypeDescriptor;

pub const KEY_COLUMN: &str = "key";
pub const VALUE_COLUMN: &str = "value";
pub const PRIMARY_INDEX: &str = "primary";

/// One column as the dictionary expects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSchema {
    pub name: &'static str,
    pub column_type: ColumnType,
    pub nullable: bool,
}

impl ColumnSchema {
    fn def(&self) -> ColumnDef {
        ColumnDef {
            column_type: self.column_type,
            max_size: 0,
            flags: if self.nullable {
                ColumnGrbit::NONE
            } else {
                ColumnGrbit::NOT_NULL
            },
        }
    }
}

/// Columns derived from a key/value type pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaLayout {
    pub table_name: String,
    pub key: ColumnSchema,
    pub value: ColumnSchema,
    pub key_type: TypeDescriptor,
    pub value_type: TypeDescriptor,
}

/// An opened dictionary table whose layout matches its types.
#[derive(Debug, Clone)]
pub struct TableSchema {
    layout: SchemaLayout,
    table: Table,
    key_column: ColumnId,
    value_column: ColumnId,
}

impl TableSchema {
    pub fn table_name(&self) -> &str {
        &self.layout.table_name
    }

    pub fn layout(&self) -> &SchemaLayout {
        &self.layout
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn key_column(&self) -> ColumnId {
        self.key_column
    }

    pub fn value_column(&self) -> ColumnId {
        self.value_column
    }

    /// Longest encoded key the table accepts.
    pub fn max_key_size(&self) -> usize {
        self.table.layout().max_key_size
    }
}

/// Creates or validates dictionary tables.
pub struct SchemaManager;

impl SchemaManager {
    /// Maps the type pair onto columns.
    ///
    /// # Errors
    ///
    /// `UnsupportedType` when the key is nullable or either type nests
    /// nullability (`Option<Option<T>>`).
    pub fn derive(table_name: &str, key: &TypeDescriptor, value: &TypeDescriptor) -> DbResult<SchemaLayout> {
        if !key.keyable {
            return Err(DbError::UnsupportedType(format!(
                "{} cannot be a dictionary key: nullable types are not keyable",
                key
            )));
        }
        for descriptor in [key, value] {
            if !descriptor.storable {
                return Err(DbError::UnsupportedType(format!(
                    "{} nests nullable types and has no column mapping",
                    descriptor
                )));
            }
        }
        Ok(SchemaLayout {
            table_name: table_name.to_string(),
            key: ColumnSchema {
                name: KEY_COLUMN,
                column_type: key.key_column_type,
                nullable: false,
            },
            value: ColumnSchema {
                name: VALUE_COLUMN,
                column_type: value.column_type,
                nullable: value.nullable,
            },
            key_type: *key,
            value_type: *value,
        })
    }

    /// Opens the table for `layout`, creating it on first use.
    ///
    /// The session must be idle. An existing table is checked in a read
    /// snapshot; creation runs in a write transaction that re-checks, so two
    /// racing openers end up with the same table.
    ///
    /// # Errors
    ///
    /// `SchemaMismatch` if the table exists with different columns.
    pub fn ensure_schema(session: &mut Session, layout: &SchemaLayout, retry: &RetryPolicy) -> DbResult<TableSchema> {
        session.begin_read_transaction()?;
        let existing = session.open_table(&layout.table_name);
        session.commit()?;
        if let Some(table) = existing? {
            return Self::validate(layout, table);
        }

        with_retry(session, retry, |s| match s.open_table(&layout.table_name)? {
            Some(table) => Self::validate(layout, table),
            None => Self::create(s, layout),
        })
    }

    fn create(session: &Session, layout: &SchemaLayout) -> DbResult<TableSchema> {
        let params = TableCreate {
            column_count: 2,
            flags: TableGrbit::FIXED_DDL,
            max_key_size: 0,
            max_var_segment: 0,
        };
        let mut table = session.create_table(&layout.table_name, &params.to_wire()?)?;
        let key_column = session.add_column(&mut table, layout.key.name, &layout.key.def().to_wire()?)?;
        let value_column = session.add_column(&mut table, layout.value.name, &layout.value.def().to_wire()?)?;
        let index = IndexCreate {
            key_column,
            flags: IndexGrbit::PRIMARY | IndexGrbit::UNIQUE | IndexGrbit::DISALLOW_NULL,
            max_key_size: 0,
        };
        session.create_index(&mut table, PRIMARY_INDEX, &index.to_wire()?)?;

        info!(
            table = %layout.table_name,
            key = %layout.key_type,
            value = %layout.value_type,
            "created dictionary table"
        );
        Ok(TableSchema {
            layout: layout.clone(),
            table,
            key_column,
            value_column,
        })
    }

    fn validate(layout: &SchemaLayout, table: Table) -> DbResult<TableSchema> {
        let mismatch = |detail: String| DbError::SchemaMismatch {
            table: layout.table_name.clone(),
            detail,
        };
        let stored = table.layout();
        if stored.columns().len() != 2 {
            return Err(mismatch(format!(
                "expected 2 columns, found {}",
                stored.columns().len()
            )));
        }

        let mut ids = [ColumnId(0); 2];
        for (slot, expected) in ids.iter_mut().zip([&layout.key, &layout.value]) {
            let column = stored
                .column_by_name(expected.name)
                .ok_or_else(|| mismatch(format!("column '{}' is missing", expected.name)))?;
            if column.def.column_type != expected.column_type {
                return Err(mismatch(format!(
                    "column '{}' is {}, expected {}",
                    expected.name, column.def.column_type, expected.column_type
                )));
            }
            if column.is_nullable() != expected.nullable {
                return Err(mismatch(format!(
                    "column '{}' nullability is {}, expected {}",
                    expected.name,
                    column.is_nullable(),
                    expected.nullable
                )));
            }
            *slot = column.id;
        }

        let [key_column, value_column] = ids;
        if stored.key_column() != Some(key_column) {
            return Err(mismatch(format!(
                "primary index does not cover column '{}'",
                KEY_COLUMN
            )));
        }

        debug!(table = %layout.table_name, "dictionary schema verified");
        Ok(TableSchema {
            layout: layout.clone(),
            table,
            key_column,
            value_column,
        })
    }
}
