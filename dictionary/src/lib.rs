//! Disk-backed, transactional dictionary.
//!
//! [`PersistentDictionary<K, V>`] stores a typed map in an MDBX environment.
//! Keys and values are any [`ColumnValue`] type: integers, floats, `bool`,
//! `String`, `Vec<u8>`, `Uuid`, `DateTime<Utc>`, `Duration`, and `Option` of
//! those as values.
//!
//! # Architecture
//!
//! - [`codec`]: order-preserving key and value encodings
//! - [`schema`]: maps the type pair onto a two-column table
//! - [`engine`]: cursor operations, retry and lazy batched scans
//! - [`pool`]: reusable sessions
//! - [`PersistentDictionary`]: the typed map API
//!
//! # Concurrency Safety
//!
//! The dictionary is `Send + Sync`; share it with an `Arc`. Writers are
//! serialized by the engine and retried on conflict; readers never block.
//!
//! ```no_run
//! use dictionary::PersistentDictionary;
//! use std::sync::Arc;
//! use std::thread;
//!
//! # fn main() -> Result<(), common::DbError> {
//! let dict = Arc::new(PersistentDictionary::<u64, String>::open("my_dictionary")?);
//!
//! let writer = Arc::clone(&dict);
//! let handle = thread::spawn(move || writer.set(&1, &"one".to_string()));
//!
//! handle.join().unwrap()?;
//! assert!(dict.contains_key(&1)?);
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
mod dictionary;
pub mod engine;
pub mod pool;
pub mod schema;

pub use codec::{ColumnValue, TypeDescriptor};
pub use common::{DbError, DbResult};
pub use config::DictionaryConfig;
pub use dictionary::{
    DictionaryTransaction, Entries, KeyIter, Keys, PersistentDictionary, ValueIter, Values,
};
pub use mdbx_base::{LockWait, RetryPolicy, SyncMode};
pub use schema::{SchemaManager, TableSchema};
