//! Tables, columns and the primary index on top of MDBX named databases.
//!
//! Every table is one DBI. Its column layout lives in the `__catalog` DBI as an
//! rkyv-archived [`TableRecord`] keyed by table name, written in the same
//! transaction as the DDL that changed it. Temporary tables get a DBI too but
//! no catalog entry; they must be dropped before the outermost commit.
//!
//! All DDL entry points take the wire layout of their parameter block and
//! decode it through [`accept`], so any published version of the struct is
//! understood.

use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use mdbx_sys::{
    mdbx_del, mdbx_drop, mdbx_get, mdbx_put, MDBX_dbi, MDBX_txn, MDBX_NOTFOUND, MDBX_SUCCESS,
    MDBX_UPSERT,
};
use rkyv::util::AlignedVec;
use tracing::{debug, info};

use crate::interop::{
    accept, ColumnDef, ColumnGrbit, ColumnId, ColumnType, FromWire, IndexCreate, IndexGrbit,
    InteropError, NativeColumnDef, NativeIndexCreate, NativeOpenTemporaryTable, NativeTableCreate,
    OpenTemporaryTable, TableCreate, TableGrbit, TempTableGrbit, WireLayoutOf,
};
use crate::session::Session;
use crate::txn_helpers::{check, empty_val, open_dbi, slice_of, val_of, TxnError};

/// Name of the DBI holding table definitions.
pub const CATALOG_NAME: &str = "__catalog";

const TEMP_PREFIX: &str = "__temp_";
const CATALOG_FORMAT: u32 = 1;

/// Row records count columns in a single byte.
pub const MAX_COLUMNS: usize = 255;

static NEXT_TEMP_TABLE: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Persisted catalog records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
struct ColumnRecord {
    id: u32,
    name: String,
    coltyp: u32,
    cb_max: u32,
    grbit: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
struct IndexRecord {
    name: String,
    column: u32,
    grbit: u32,
    cb_key_most: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
struct TableRecord {
    format: u32,
    grbit: u32,
    cb_key_most: u32,
    cb_var_seg_mac: u32,
    next_column: u32,
    columns: Vec<ColumnRecord>,
    primary_index: Option<IndexRecord>,
}

// ============================================================================
// In-memory layout
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub id: ColumnId,
    pub name: String,
    pub def: ColumnDef,
}

impl ColumnInfo {
    pub fn is_nullable(&self) -> bool {
        !self.def.flags.contains(ColumnGrbit::NOT_NULL)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexInfo {
    pub name: String,
    pub key_column: ColumnId,
    pub flags: IndexGrbit,
    pub max_key_size: usize,
}

/// Column and index layout of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLayout {
    pub flags: TableGrbit,
    /// Effective key limit; never above the environment's.
    pub max_key_size: usize,
    pub max_var_segment: usize,
    /// Set for temporary tables only.
    pub temp_flags: Option<TempTableGrbit>,
    columns: Vec<ColumnInfo>,
    primary_index: Option<IndexInfo>,
    next_column: u32,
}

impl TableLayout {
    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    pub fn column(&self, id: ColumnId) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.id == id)
    }

    pub fn column_by_name(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_index(&self) -> Option<&IndexInfo> {
        self.primary_index.as_ref()
    }

    pub fn key_column(&self) -> Option<ColumnId> {
        self.primary_index.as_ref().map(|idx| idx.key_column)
    }

    pub fn is_temporary(&self) -> bool {
        self.temp_flags.is_some()
    }

    fn to_record(&self) -> TableRecord {
        TableRecord {
            format: CATALOG_FORMAT,
            grbit: self.flags.bits(),
            cb_key_most: self.max_key_size as u32,
            cb_var_seg_mac: self.max_var_segment as u32,
            next_column: self.next_column,
            columns: self
                .columns
                .iter()
                .map(|c| ColumnRecord {
                    id: c.id.0,
                    name: c.name.clone(),
                    coltyp: c.def.column_type.code(),
                    cb_max: c.def.max_size as u32,
                    grbit: c.def.flags.bits(),
                })
                .collect(),
            primary_index: self.primary_index.as_ref().map(|idx| IndexRecord {
                name: idx.name.clone(),
                column: idx.key_column.0,
                grbit: idx.flags.bits(),
                cb_key_most: idx.max_key_size as u32,
            }),
        }
    }

    fn from_record(table: &str, record: TableRecord) -> Result<Self, TxnError> {
        if record.format != CATALOG_FORMAT {
            return Err(TxnError::Catalog(format!(
                "table '{}' has catalog format {}",
                table, record.format
            )));
        }
        let columns = record
            .columns
            .into_iter()
            .map(|c| {
                let column_type = ColumnType::from_code(c.coltyp).ok_or_else(|| {
                    TxnError::Catalog(format!("table '{}' column '{}' has coltyp {}", table, c.name, c.coltyp))
                })?;
                Ok(ColumnInfo {
                    id: ColumnId(c.id),
                    name: c.name,
                    def: ColumnDef {
                        column_type,
                        max_size: c.cb_max as usize,
                        flags: ColumnGrbit(c.grbit),
                    },
                })
            })
            .collect::<Result<Vec<_>, TxnError>>()?;

        Ok(Self {
            flags: TableGrbit(record.grbit),
            max_key_size: record.cb_key_most as usize,
            max_var_segment: record.cb_var_seg_mac as usize,
            temp_flags: None,
            columns,
            primary_index: record.primary_index.map(|idx| IndexInfo {
                name: idx.name,
                key_column: ColumnId(idx.column),
                flags: IndexGrbit(idx.grbit),
                max_key_size: idx.cb_key_most as usize,
            }),
            next_column: record.next_column,
        })
    }
}

/// Handle to an open table.
#[derive(Debug, Clone)]
pub struct Table {
    name: String,
    dbi: MDBX_dbi,
    layout: TableLayout,
}

impl Table {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layout(&self) -> &TableLayout {
        &self.layout
    }

    pub fn is_temporary(&self) -> bool {
        self.layout.is_temporary()
    }

    pub(crate) fn dbi(&self) -> MDBX_dbi {
        self.dbi
    }
}

fn validate_name(name: &str) -> Result<(), TxnError> {
    if name.is_empty() || name.starts_with("__") || name.contains('\0') {
        return Err(TxnError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn key_limit(requested: usize, env_max: usize) -> Result<usize, TxnError> {
    match requested {
        0 => Ok(env_max),
        n if n > env_max => Err(InteropError::OutOfRange {
            field: "cbKeyMost",
            value: n as u64,
            max: env_max as u64,
        }
        .into()),
        n => Ok(n),
    }
}

fn validate_column_def(def: &ColumnDef) -> Result<(), TxnError> {
    if let Some(width) = def.column_type.fixed_size() {
        if def.max_size != 0 && def.max_size != width {
            return Err(InteropError::InvalidParameter(format!(
                "{} columns are {} bytes, cbMax {} given",
                def.column_type, width, def.max_size
            ))
            .into());
        }
    }
    Ok(())
}

// ============================================================================
// Catalog access
// ============================================================================

unsafe fn read_record(txn: *mut MDBX_txn, catalog: MDBX_dbi, name: &str) -> Result<Option<TableRecord>, TxnError> {
    let key = val_of(name.as_bytes());
    let mut data = empty_val();
    let rc = mdbx_get(txn, catalog, &key, &mut data);
    if rc == MDBX_NOTFOUND {
        return Ok(None);
    }
    check(rc, "mdbx_get")?;

    // Engine memory carries no alignment guarantee for archived data.
    let bytes = slice_of(&data);
    let mut aligned = AlignedVec::<16>::with_capacity(bytes.len());
    aligned.extend_from_slice(bytes);
    let record = rkyv::from_bytes::<TableRecord, rkyv::rancor::Error>(&aligned)
        .map_err(|e| TxnError::Catalog(format!("table '{}': {}", name, e)))?;
    Ok(Some(record))
}

unsafe fn write_record(txn: *mut MDBX_txn, catalog: MDBX_dbi, name: &str, layout: &TableLayout) -> Result<(), TxnError> {
    let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&layout.to_record())
        .map_err(|e| TxnError::Catalog(format!("table '{}': {}", name, e)))?;
    let key = val_of(name.as_bytes());
    let mut data = val_of(&bytes);
    let rc = mdbx_put(txn, catalog, &key, &mut data, MDBX_UPSERT);
    check(rc, "mdbx_put")
}

impl Session {
    fn catalog(&self, txn: *mut MDBX_txn, create: bool) -> Result<Option<MDBX_dbi>, TxnError> {
        unsafe { open_dbi(txn, CATALOG_NAME, create) }
    }

    fn persist_layout(&self, table: &Table) -> Result<(), TxnError> {
        if table.is_temporary() {
            return Ok(());
        }
        let txn = self.write_txn()?;
        let catalog = self
            .catalog(txn, true)?
            .ok_or_else(|| TxnError::Catalog("catalog missing".into()))?;
        unsafe { write_record(txn, catalog, &table.name, &table.layout) }
    }

    /// Creates an empty table with no columns.
    pub fn create_table<W>(&self, name: &str, params: &W) -> Result<Table, TxnError>
    where
        W: WireLayoutOf<NativeTableCreate>,
    {
        validate_name(name)?;
        let native: NativeTableCreate = accept(params)?;
        let create = TableCreate::from_wire(&native)?;
        if create.column_count > MAX_COLUMNS {
            return Err(InteropError::OutOfRange {
                field: "ccolumn",
                value: create.column_count as u64,
                max: MAX_COLUMNS as u64,
            }
            .into());
        }
        let max_key_size = key_limit(create.max_key_size, self.env().max_key_size())?;

        let txn = self.write_txn()?;
        let catalog = self
            .catalog(txn, true)?
            .ok_or_else(|| TxnError::Catalog("catalog missing".into()))?;
        if unsafe { read_record(txn, catalog, name) }?.is_some() {
            return Err(TxnError::TableExists(name.to_string()));
        }
        if unsafe { open_dbi(txn, name, false) }?.is_some() {
            return Err(TxnError::TableExists(name.to_string()));
        }
        let dbi = unsafe { open_dbi(txn, name, true) }?
            .ok_or_else(|| TxnError::Catalog(format!("table '{}' vanished during create", name)))?;

        let layout = TableLayout {
            flags: create.flags,
            max_key_size,
            max_var_segment: create.max_var_segment,
            temp_flags: None,
            columns: Vec::with_capacity(create.column_count),
            primary_index: None,
            next_column: 1,
        };
        unsafe { write_record(txn, catalog, name, &layout) }?;
        info!(table = name, max_key_size, "created table");
        Ok(Table {
            name: name.to_string(),
            dbi,
            layout,
        })
    }

    /// Opens a table created earlier, or returns `None` if there is none.
    pub fn open_table(&self, name: &str) -> Result<Option<Table>, TxnError> {
        validate_name(name)?;
        let txn = self.txn()?;
        let Some(catalog) = self.catalog(txn, false)? else {
            return Ok(None);
        };
        let Some(record) = (unsafe { read_record(txn, catalog, name) })? else {
            return Ok(None);
        };
        let layout = TableLayout::from_record(name, record)?;
        let dbi = unsafe { open_dbi(txn, name, false) }?.ok_or_else(|| {
            TxnError::Catalog(format!("catalog lists table '{}' but its data is missing", name))
        })?;
        debug!(table = name, columns = layout.columns.len(), "opened table");
        Ok(Some(Table {
            name: name.to_string(),
            dbi,
            layout,
        }))
    }

    /// Adds a column; ids are assigned from 1 in creation order.
    pub fn add_column<W>(&self, table: &mut Table, name: &str, def: &W) -> Result<ColumnId, TxnError>
    where
        W: WireLayoutOf<NativeColumnDef>,
    {
        let native: NativeColumnDef = accept(def)?;
        let def = ColumnDef::from_wire(&native)?;
        validate_column_def(&def)?;

        let layout = &mut table.layout;
        if name.is_empty() {
            return Err(TxnError::Schema("column name is empty".into()));
        }
        if layout.flags.contains(TableGrbit::FIXED_DDL) && layout.primary_index.is_some() {
            return Err(TxnError::Schema(format!("table '{}' has fixed DDL", table.name)));
        }
        if layout.column_by_name(name).is_some() {
            return Err(TxnError::Schema(format!(
                "column '{}' already exists in '{}'",
                name, table.name
            )));
        }
        if layout.columns.len() >= MAX_COLUMNS {
            return Err(InteropError::OutOfRange {
                field: "ccolumn",
                value: layout.columns.len() as u64 + 1,
                max: MAX_COLUMNS as u64,
            }
            .into());
        }

        let id = ColumnId(layout.next_column);
        layout.next_column += 1;
        layout.columns.push(ColumnInfo {
            id,
            name: name.to_string(),
            def,
        });
        self.persist_layout(table)?;
        debug!(table = table.name(), column = name, %id, coltyp = %def.column_type, "added column");
        Ok(id)
    }

    /// Creates the primary index. The table must be empty.
    pub fn create_index<W>(&self, table: &mut Table, name: &str, params: &W) -> Result<(), TxnError>
    where
        W: WireLayoutOf<NativeIndexCreate>,
    {
        let native: NativeIndexCreate = accept(params)?;
        let create = IndexCreate::from_wire(&native)?;

        if !create.flags.contains(IndexGrbit::PRIMARY) {
            return Err(TxnError::Schema("only primary indexes are supported".into()));
        }
        if table.layout.primary_index.is_some() {
            return Err(TxnError::Schema(format!(
                "table '{}' already has a primary index",
                table.name
            )));
        }
        let column = table.layout.column(create.key_column).ok_or_else(|| {
            TxnError::Schema(format!("{} does not exist in '{}'", create.key_column, table.name))
        })?;
        if column.def.column_type.is_long_value() {
            return Err(TxnError::Schema(format!(
                "{} columns cannot be index keys",
                column.def.column_type
            )));
        }
        if column.is_nullable() && !create.flags.contains(IndexGrbit::DISALLOW_NULL) {
            return Err(TxnError::Schema(format!(
                "key column '{}' must be NOT NULL",
                column.name
            )));
        }
        let max_key_size = key_limit(create.max_key_size, table.layout.max_key_size)?;
        if self.table_stats(table)?.entries > 0 {
            return Err(TxnError::Schema(format!(
                "table '{}' must be empty to index it",
                table.name
            )));
        }

        table.layout.max_key_size = max_key_size;
        table.layout.primary_index = Some(IndexInfo {
            name: name.to_string(),
            key_column: create.key_column,
            flags: create.flags | IndexGrbit::UNIQUE,
            max_key_size,
        });
        self.persist_layout(table)?;
        debug!(table = table.name(), index = name, key = %create.key_column, "created primary index");
        Ok(())
    }

    /// Opens a scratch table in the current write transaction.
    ///
    /// `columns` are added in order and the first one is the unique key. The
    /// table is dropped when the outermost transaction commits, or earlier
    /// through [`drop_table`](Self::drop_table).
    pub fn open_temporary_table<W>(&self, params: &W, columns: &[ColumnDef]) -> Result<Table, TxnError>
    where
        W: WireLayoutOf<NativeOpenTemporaryTable>,
    {
        let native: NativeOpenTemporaryTable = accept(params)?;
        let open = OpenTemporaryTable::from_wire(&native)?;
        if open.column_count != columns.len() {
            return Err(InteropError::InvalidParameter(format!(
                "ccolumn is {} but {} column definitions were given",
                open.column_count,
                columns.len()
            ))
            .into());
        }
        if columns.is_empty() || columns.len() > MAX_COLUMNS {
            return Err(InteropError::OutOfRange {
                field: "ccolumn",
                value: columns.len() as u64,
                max: MAX_COLUMNS as u64,
            }
            .into());
        }
        let max_key_size = key_limit(open.max_key_size, self.env().max_key_size())?;

        let mut infos = Vec::with_capacity(columns.len());
        for (i, def) in columns.iter().enumerate() {
            validate_column_def(def)?;
            infos.push(ColumnInfo {
                id: ColumnId(i as u32 + 1),
                name: format!("column{}", i + 1),
                def: *def,
            });
        }
        if infos[0].def.column_type.is_long_value() {
            return Err(TxnError::Schema("temporary table key cannot be a long value".into()));
        }

        let name = format!(
            "{}{}_{}",
            TEMP_PREFIX,
            self.id(),
            NEXT_TEMP_TABLE.fetch_add(1, Ordering::Relaxed)
        );
        let txn = self.write_txn()?;
        let dbi = unsafe { open_dbi(txn, &name, true) }?
            .ok_or_else(|| TxnError::Catalog(format!("temporary table '{}' was not created", name)))?;

        let layout = TableLayout {
            flags: TableGrbit::FIXED_DDL,
            max_key_size,
            max_var_segment: open.max_var_segment,
            temp_flags: Some(open.flags),
            next_column: infos.len() as u32 + 1,
            primary_index: Some(IndexInfo {
                name: "primary".to_string(),
                key_column: ColumnId(1),
                flags: IndexGrbit::PRIMARY | IndexGrbit::UNIQUE | IndexGrbit::DISALLOW_NULL,
                max_key_size,
            }),
            columns: infos,
        };
        self.track_temporary_table(dbi);
        debug!(table = %name, columns = columns.len(), flags = open.flags.bits(), "opened temporary table");
        Ok(Table { name, dbi, layout })
    }

    /// Deletes the table, its rows and its catalog entry.
    pub fn drop_table(&self, table: Table) -> Result<(), TxnError> {
        let txn = self.write_txn()?;
        let rc = unsafe { mdbx_drop(txn, table.dbi, true) };
        check(rc, "mdbx_drop")?;

        if table.is_temporary() {
            self.mark_temporary_table_dropped(table.dbi);
        } else if let Some(catalog) = self.catalog(txn, false)? {
            let key = val_of(table.name.as_bytes());
            let rc = unsafe { mdbx_del(txn, catalog, &key, ptr::null()) };
            if rc != MDBX_SUCCESS && rc != MDBX_NOTFOUND {
                check(rc, "mdbx_del")?;
            }
        }
        info!(table = table.name(), "dropped table");
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::interop::ToWire;

    fn layout_with_columns() -> TableLayout {
        TableLayout {
            flags: TableGrbit::NONE,
            max_key_size: 64,
            max_var_segment: 0,
            temp_flags: None,
            columns: vec![
                ColumnInfo {
                    id: ColumnId(1),
                    name: "key".into(),
                    def: ColumnDef {
                        column_type: ColumnType::Text,
                        max_size: 64,
                        flags: ColumnGrbit::NOT_NULL,
                    },
                },
                ColumnInfo {
                    id: ColumnId(2),
                    name: "value".into(),
                    def: ColumnDef {
                        column_type: ColumnType::LongLong,
                        max_size: 0,
                        flags: ColumnGrbit::NONE,
                    },
                },
            ],
            primary_index: Some(IndexInfo {
                name: "primary".into(),
                key_column: ColumnId(1),
                flags: IndexGrbit::PRIMARY | IndexGrbit::UNIQUE,
                max_key_size: 64,
            }),
            next_column: 3,
        }
    }

    #[test]
    fn test_layout_record_round_trip() {
        let layout = layout_with_columns();
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&layout.to_record()).unwrap();
        let record = rkyv::from_bytes::<TableRecord, rkyv::rancor::Error>(&bytes).unwrap();
        let back = TableLayout::from_record("t", record).unwrap();
        assert_eq!(back, layout);
        assert_eq!(back.key_column(), Some(ColumnId(1)));
        assert!(back.column_by_name("value").unwrap().is_nullable());
        assert!(!back.column(ColumnId(1)).unwrap().is_nullable());
    }

    #[test]
    fn test_unknown_catalog_format_rejected() {
        let mut record = layout_with_columns().to_record();
        record.format = 99;
        assert!(matches!(
            TableLayout::from_record("t", record),
            Err(TxnError::Catalog(_))
        ));
    }

    #[test]
    fn test_table_names() {
        assert!(validate_name("PersistentDictionary").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("__catalog").is_err());
        assert!(validate_name("a\0b").is_err());
    }

    #[test]
    fn test_key_limit() {
        assert_eq!(key_limit(0, 500).unwrap(), 500);
        assert_eq!(key_limit(100, 500).unwrap(), 100);
        assert!(matches!(
            key_limit(501, 500),
            Err(TxnError::Interop(InteropError::OutOfRange { field: "cbKeyMost", .. }))
        ));
    }

    #[test]
    fn test_fixed_width_column_size_checked() {
        let ok = ColumnDef {
            column_type: ColumnType::Long,
            max_size: 4,
            flags: ColumnGrbit::NONE,
        };
        assert!(validate_column_def(&ok).is_ok());
        let bad = ColumnDef { max_size: 3, ..ok };
        assert!(validate_column_def(&bad).is_err());
        // The wire form carries the same information.
        assert_eq!(bad.to_wire().unwrap().cb_max, 3);
    }
}
