//! Versioned parameter blocks and their fixed-layout wire structs.
//!
//! Callers describe engine requests with named-field blocks ([`TableCreate`],
//! [`ColumnDef`], ...). Right before a native call each block is lowered with
//! [`ToWire`] into a `#[repr(C)]` struct whose first field, `cb_struct`,
//! records the struct's own byte size. The receiving side reads that size
//! first ([`Versioned::read_versioned`]) and copies only the prefix it
//! understands, so an older caller and a newer engine (or the reverse) keep
//! working when fields are appended.
//!
//! Wire structs are built from `u32` fields only. That keeps them free of
//! padding, which [`WireStruct::as_bytes`] relies on.

use std::fmt;
use std::mem;
use std::ptr;
use std::slice;

use common::DbError;
use mdbx_sys::MDBX_stat;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InteropError {
    #[error("{field} = {value} does not fit the native field (max {max})")]
    OutOfRange {
        field: &'static str,
        value: u64,
        max: u64,
    },

    #[error("wire buffer of {len} bytes cannot hold a cb_struct header")]
    Truncated { len: usize },

    #[error("cb_struct declares {declared} bytes but only {available} were supplied")]
    SizeMismatch { declared: u32, available: usize },

    #[error("cb_struct {0} is not a recognised structure version")]
    UnknownVersion(u32),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

impl From<InteropError> for DbError {
    fn from(err: InteropError) -> Self {
        match err {
            InteropError::OutOfRange { field, value, max } => {
                DbError::OutOfRange { field, value, max }
            }
            other => DbError::InvalidOperation(other.to_string()),
        }
    }
}

/// Narrows an edge-side count or size into a native `u32` field.
pub fn to_native_u32(field: &'static str, value: usize) -> Result<u32, InteropError> {
    u32::try_from(value).map_err(|_| InteropError::OutOfRange {
        field,
        value: value as u64,
        max: u32::MAX as u64,
    })
}

/// Byte size of a wire struct, as stored in its `cb_struct` field.
pub const fn wire_size<W>() -> u32 {
    mem::size_of::<W>() as u32
}

// ============================================================================
// Traits
// ============================================================================

/// Fixed-layout struct handed across the native boundary.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]`, contain only `u32` fields (so there is
/// no padding and every bit pattern is valid), and start with `cb_struct`.
pub unsafe trait WireStruct: Copy + Default + 'static {
    fn cb_struct(&self) -> u32;

    /// Raw bytes of the struct exactly as the native side receives them.
    fn as_bytes(&self) -> &[u8] {
        // SAFETY: repr(C) all-u32 layout, see trait contract.
        unsafe { slice::from_raw_parts(self as *const Self as *const u8, mem::size_of::<Self>()) }
    }
}

/// Current layout of a wire struct that may arrive in an older or newer size.
pub trait Versioned: WireStruct {
    /// `cb_struct` of the oldest layout still accepted.
    const MIN_SIZE: u32;

    /// Reads whichever version `bytes` holds into the current layout.
    ///
    /// Fields the sender did not know about keep their defaults; trailing
    /// fields this side does not know about are ignored.
    fn read_versioned(bytes: &[u8]) -> Result<Self, InteropError> {
        if bytes.len() < 4 {
            return Err(InteropError::Truncated { len: bytes.len() });
        }
        let declared = u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if declared as usize > bytes.len() {
            return Err(InteropError::SizeMismatch {
                declared,
                available: bytes.len(),
            });
        }
        if declared < Self::MIN_SIZE || declared % 4 != 0 {
            return Err(InteropError::UnknownVersion(declared));
        }

        let mut current = Self::default();
        let known = (declared as usize).min(mem::size_of::<Self>());
        // SAFETY: `known` fits both the source slice and `current`; the target
        // is all-u32 so any byte pattern is a valid value.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), &mut current as *mut Self as *mut u8, known);
        }
        Ok(current)
    }
}

/// `Self` is one of the layouts (historical or current) of `W`.
pub trait WireLayoutOf<W: Versioned>: WireStruct {}

impl<W: Versioned> WireLayoutOf<W> for W {}

/// Native-side entry: accept any known layout of `W`.
pub fn accept<W, L>(layout: &L) -> Result<W, InteropError>
where
    W: Versioned,
    L: WireLayoutOf<W>,
{
    W::read_versioned(layout.as_bytes())
}

pub trait ToWire {
    type Wire: WireStruct;

    fn to_wire(&self) -> Result<Self::Wire, InteropError>;
}

pub trait FromWire<W>: Sized {
    fn from_wire(wire: &W) -> Result<Self, InteropError>;
}

fn check_declared<W: Versioned>(wire: &W) -> Result<(), InteropError> {
    let declared = wire.cb_struct();
    if declared < W::MIN_SIZE {
        return Err(InteropError::UnknownVersion(declared));
    }
    Ok(())
}

// ============================================================================
// Flags and column types
// ============================================================================

macro_rules! grbit {
    ($(#[$meta:meta])* $name:ident { $($(#[$fmeta:meta])* $flag:ident = $value:expr;)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(pub u32);

        impl $name {
            pub const NONE: Self = Self(0);
            $($(#[$fmeta])* pub const $flag: Self = Self($value);)*

            pub fn bits(self) -> u32 {
                self.0
            }

            pub fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }
    };
}

grbit! {
    /// Behaviour flags for temporary tables.
    TempTableGrbit {
        INDEXED = 0x1;
        UNIQUE = 0x2;
        UPDATABLE = 0x4;
        SCROLLABLE = 0x8;
        SORT_NULLS_HIGH = 0x10;
        FORCE_MATERIALIZATION = 0x20;
        FORWARD_ONLY = 0x40;
    }
}

grbit! {
    TableGrbit {
        /// Reject `add_column` once the primary index exists.
        FIXED_DDL = 0x1;
    }
}

grbit! {
    ColumnGrbit {
        FIXED = 0x1;
        TAGGED = 0x2;
        NOT_NULL = 0x4;
    }
}

grbit! {
    IndexGrbit {
        UNIQUE = 0x1;
        PRIMARY = 0x2;
        DISALLOW_NULL = 0x4;
    }
}

/// Column identifier, unique within a table. Ids start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColumnId(pub u32);

impl fmt::Display for ColumnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "column#{}", self.0)
    }
}

/// Physical column type (the `coltyp` wire code).
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Bit = 1,
    UnsignedByte = 2,
    Short = 3,
    Long = 4,
    IeeeSingle = 6,
    IeeeDouble = 7,
    DateTime = 8,
    Binary = 9,
    Text = 10,
    LongBinary = 11,
    LongText = 12,
    UnsignedLong = 14,
    LongLong = 15,
    Guid = 16,
    UnsignedShort = 17,
    UnsignedLongLong = 18,
    SignedByte = 19,
    TimeSpan = 20,
}

impl ColumnType {
    const ALL: [ColumnType; 18] = [
        ColumnType::Bit,
        ColumnType::UnsignedByte,
        ColumnType::Short,
        ColumnType::Long,
        ColumnType::IeeeSingle,
        ColumnType::IeeeDouble,
        ColumnType::DateTime,
        ColumnType::Binary,
        ColumnType::Text,
        ColumnType::LongBinary,
        ColumnType::LongText,
        ColumnType::UnsignedLong,
        ColumnType::LongLong,
        ColumnType::Guid,
        ColumnType::UnsignedShort,
        ColumnType::UnsignedLongLong,
        ColumnType::SignedByte,
        ColumnType::TimeSpan,
    ];

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.code() == code)
    }

    /// Exact stored width for fixed-width types, `None` for variable length.
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            ColumnType::Bit | ColumnType::UnsignedByte | ColumnType::SignedByte => Some(1),
            ColumnType::Short | ColumnType::UnsignedShort => Some(2),
            ColumnType::Long | ColumnType::UnsignedLong | ColumnType::IeeeSingle => Some(4),
            ColumnType::LongLong | ColumnType::UnsignedLongLong | ColumnType::IeeeDouble => Some(8),
            ColumnType::DateTime | ColumnType::TimeSpan => Some(12),
            ColumnType::Guid => Some(16),
            ColumnType::Binary | ColumnType::Text | ColumnType::LongBinary | ColumnType::LongText => {
                None
            }
        }
    }

    /// Long-value types are not allowed as index keys.
    pub fn is_long_value(self) -> bool {
        matches!(self, ColumnType::LongBinary | ColumnType::LongText)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ============================================================================
// Open temporary table
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenTemporaryTable {
    pub column_count: usize,
    pub flags: TempTableGrbit,
    /// Maximum key length in bytes; 0 lets the engine decide.
    pub max_key_size: usize,
    /// Maximum variable-length segment in bytes; 0 lets the engine decide.
    pub max_var_segment: usize,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NativeOpenTemporaryTable {
    pub cb_struct: u32,
    pub ccolumn: u32,
    pub grbit: u32,
    pub cb_key_most: u32,
    pub cb_var_seg_mac: u32,
}

unsafe impl WireStruct for NativeOpenTemporaryTable {
    fn cb_struct(&self) -> u32 {
        self.cb_struct
    }
}

impl Versioned for NativeOpenTemporaryTable {
    const MIN_SIZE: u32 = wire_size::<NativeOpenTemporaryTable>();
}

impl ToWire for OpenTemporaryTable {
    type Wire = NativeOpenTemporaryTable;

    fn to_wire(&self) -> Result<Self::Wire, InteropError> {
        Ok(NativeOpenTemporaryTable {
            cb_struct: wire_size::<NativeOpenTemporaryTable>(),
            ccolumn: to_native_u32("ccolumn", self.column_count)?,
            grbit: self.flags.bits(),
            cb_key_most: to_native_u32("cbKeyMost", self.max_key_size)?,
            cb_var_seg_mac: to_native_u32("cbVarSegMac", self.max_var_segment)?,
        })
    }
}

impl FromWire<NativeOpenTemporaryTable> for OpenTemporaryTable {
    fn from_wire(wire: &NativeOpenTemporaryTable) -> Result<Self, InteropError> {
        check_declared(wire)?;
        Ok(Self {
            column_count: wire.ccolumn as usize,
            flags: TempTableGrbit(wire.grbit),
            max_key_size: wire.cb_key_most as usize,
            max_var_segment: wire.cb_var_seg_mac as usize,
        })
    }
}

// ============================================================================
// Create table
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableCreate {
    /// Number of columns the caller intends to add; used as a capacity hint.
    pub column_count: usize,
    pub flags: TableGrbit,
    pub max_key_size: usize,
    pub max_var_segment: usize,
}

/// First published layout: no key or segment limits.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NativeTableCreateV1 {
    pub cb_struct: u32,
    pub ccolumn: u32,
    pub grbit: u32,
}

unsafe impl WireStruct for NativeTableCreateV1 {
    fn cb_struct(&self) -> u32 {
        self.cb_struct
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NativeTableCreate {
    pub cb_struct: u32,
    pub ccolumn: u32,
    pub grbit: u32,
    pub cb_key_most: u32,
    pub cb_var_seg_mac: u32,
}

unsafe impl WireStruct for NativeTableCreate {
    fn cb_struct(&self) -> u32 {
        self.cb_struct
    }
}

impl Versioned for NativeTableCreate {
    const MIN_SIZE: u32 = wire_size::<NativeTableCreateV1>();
}

impl WireLayoutOf<NativeTableCreate> for NativeTableCreateV1 {}

impl TableCreate {
    /// Lowers to the first layout, dropping fields it cannot carry.
    pub fn to_wire_v1(&self) -> Result<NativeTableCreateV1, InteropError> {
        Ok(NativeTableCreateV1 {
            cb_struct: wire_size::<NativeTableCreateV1>(),
            ccolumn: to_native_u32("ccolumn", self.column_count)?,
            grbit: self.flags.bits(),
        })
    }
}

impl ToWire for TableCreate {
    type Wire = NativeTableCreate;

    fn to_wire(&self) -> Result<Self::Wire, InteropError> {
        Ok(NativeTableCreate {
            cb_struct: wire_size::<NativeTableCreate>(),
            ccolumn: to_native_u32("ccolumn", self.column_count)?,
            grbit: self.flags.bits(),
            cb_key_most: to_native_u32("cbKeyMost", self.max_key_size)?,
            cb_var_seg_mac: to_native_u32("cbVarSegMac", self.max_var_segment)?,
        })
    }
}

impl FromWire<NativeTableCreate> for TableCreate {
    fn from_wire(wire: &NativeTableCreate) -> Result<Self, InteropError> {
        check_declared(wire)?;
        Ok(Self {
            column_count: wire.ccolumn as usize,
            flags: TableGrbit(wire.grbit),
            max_key_size: wire.cb_key_most as usize,
            max_var_segment: wire.cb_var_seg_mac as usize,
        })
    }
}

impl FromWire<NativeTableCreateV1> for TableCreate {
    fn from_wire(wire: &NativeTableCreateV1) -> Result<Self, InteropError> {
        if wire.cb_struct < wire_size::<NativeTableCreateV1>() {
            return Err(InteropError::UnknownVersion(wire.cb_struct));
        }
        Ok(Self {
            column_count: wire.ccolumn as usize,
            flags: TableGrbit(wire.grbit),
            ..Self::default()
        })
    }
}

// ============================================================================
// Column definition
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    pub column_type: ColumnType,
    /// Maximum stored length in bytes; 0 means unbounded.
    pub max_size: usize,
    pub flags: ColumnGrbit,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NativeColumnDef {
    pub cb_struct: u32,
    pub coltyp: u32,
    pub cb_max: u32,
    pub grbit: u32,
}

unsafe impl WireStruct for NativeColumnDef {
    fn cb_struct(&self) -> u32 {
        self.cb_struct
    }
}

impl Versioned for NativeColumnDef {
    const MIN_SIZE: u32 = wire_size::<NativeColumnDef>();
}

impl ToWire for ColumnDef {
    type Wire = NativeColumnDef;

    fn to_wire(&self) -> Result<Self::Wire, InteropError> {
        Ok(NativeColumnDef {
            cb_struct: wire_size::<NativeColumnDef>(),
            coltyp: self.column_type.code(),
            cb_max: to_native_u32("cbMax", self.max_size)?,
            grbit: self.flags.bits(),
        })
    }
}

impl FromWire<NativeColumnDef> for ColumnDef {
    fn from_wire(wire: &NativeColumnDef) -> Result<Self, InteropError> {
        check_declared(wire)?;
        let column_type = ColumnType::from_code(wire.coltyp).ok_or_else(|| {
            InteropError::InvalidParameter(format!("unknown coltyp {}", wire.coltyp))
        })?;
        Ok(Self {
            column_type,
            max_size: wire.cb_max as usize,
            flags: ColumnGrbit(wire.grbit),
        })
    }
}

// ============================================================================
// Index creation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexCreate {
    pub key_column: ColumnId,
    pub flags: IndexGrbit,
    pub max_key_size: usize,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NativeIndexCreate {
    pub cb_struct: u32,
    pub columnid: u32,
    pub grbit: u32,
    pub cb_key_most: u32,
}

unsafe impl WireStruct for NativeIndexCreate {
    fn cb_struct(&self) -> u32 {
        self.cb_struct
    }
}

impl Versioned for NativeIndexCreate {
    const MIN_SIZE: u32 = wire_size::<NativeIndexCreate>();
}

impl ToWire for IndexCreate {
    type Wire = NativeIndexCreate;

    fn to_wire(&self) -> Result<Self::Wire, InteropError> {
        Ok(NativeIndexCreate {
            cb_struct: wire_size::<NativeIndexCreate>(),
            columnid: self.key_column.0,
            grbit: self.flags.bits(),
            cb_key_most: to_native_u32("cbKeyMost", self.max_key_size)?,
        })
    }
}

impl FromWire<NativeIndexCreate> for IndexCreate {
    fn from_wire(wire: &NativeIndexCreate) -> Result<Self, InteropError> {
        check_declared(wire)?;
        Ok(Self {
            key_column: ColumnId(wire.columnid),
            flags: IndexGrbit(wire.grbit),
            max_key_size: wire.cb_key_most as usize,
        })
    }
}

// ============================================================================
// Native result: table statistics
// ============================================================================

/// Statistics of one table, decoded from `MDBX_stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableStats {
    /// Number of rows.
    pub entries: u64,
    pub depth: u32,
    pub page_size: u32,
    pub branch_pages: u64,
    pub leaf_pages: u64,
    pub overflow_pages: u64,
    /// Transaction id of the last modification.
    pub last_modified_txn: u64,
}

impl FromWire<MDBX_stat> for TableStats {
    fn from_wire(stat: &MDBX_stat) -> Result<Self, InteropError> {
        Ok(Self {
            entries: stat.ms_entries as u64,
            depth: stat.ms_depth as u32,
            page_size: stat.ms_psize as u32,
            branch_pages: stat.ms_branch_pages as u64,
            leaf_pages: stat.ms_leaf_pages as u64,
            overflow_pages: stat.ms_overflow_pages as u64,
            last_modified_txn: stat.ms_mod_txnid as u64,
        })
    }
}
