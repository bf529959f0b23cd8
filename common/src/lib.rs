//! Common types shared across the persistent dictionary crates.
//!
//! This crate sits at the bottom of the dependency hierarchy:
//! - Has NO dependencies on other workspace crates
//! - Defines the error taxonomy every layer converts into
//! - Owns the tracing subscriber setup used by binaries and tests
//!
//! `mdbx-base` keeps its own fine-grained error enums (environment, transaction,
//! interop, record) and converts them into [`DbError`] at its public seams, so
//! callers of the dictionary only ever match on one type.

pub mod logging;

// --- Error Types ---

/// Common error type for dictionary and engine operations.
///
/// Variants map one-to-one onto the failure outcomes a caller can act on.
/// Write conflicts are retried internally and only surface here once the
/// retry budget is spent.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A value does not fit the fixed-width native field it targets.
    #[error("Value {value} out of range for {field} (max {max})")]
    OutOfRange {
        field: &'static str,
        value: u64,
        max: u64,
    },

    /// The storage location could not be attached or created.
    #[error("Storage location '{path}' unavailable: {reason}")]
    EngineUnavailable { path: String, reason: String },

    /// Concurrent writers collided and the retry budget was exhausted.
    #[error("Write conflict persisted after {attempts} attempt(s)")]
    WriteConflict { attempts: u32 },

    /// `add` was called with a key that is already present.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Indexer lookup of a key that is not present.
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// An existing table's layout disagrees with the expected schema.
    #[error("Schema mismatch for table '{table}': {detail}")]
    SchemaMismatch { table: String, detail: String },

    /// The key or value type has no storage mapping.
    #[error("Unsupported type: {0}")]
    UnsupportedType(String),

    /// Any other native engine failure.
    #[error("Engine error during {op}: {message} ({code})")]
    Engine {
        op: &'static str,
        code: i32,
        message: String,
    },

    /// Stored bytes failed an integrity check or could not be decoded.
    #[error("Corruption detected: {0}")]
    Corruption(String),

    /// Error during serialization/deserialization of catalog metadata.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid operation or arguments.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Configuration could not be parsed or failed validation.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DbError {
    /// Returns true when the error is a write-conflict signal worth retrying.
    pub fn is_write_conflict(&self) -> bool {
        matches!(self, DbError::WriteConflict { .. })
    }
}

/// Result type alias for dictionary and engine operations.
pub type DbResult<T> = Result<T, DbError>;

// --- Tests ---
