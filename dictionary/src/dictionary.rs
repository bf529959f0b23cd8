//! Typed map facade over the dictionary engine.

use std::fmt;
use std::ops::{Bound, RangeBounds};
use std::path::Path;

use common::{DbError, DbResult};
use mdbx_base::{MdbxEnvBuilder, Session, SyncMode};
use tracing::{debug, info};

use crate::codec::{self, ColumnValue};
use crate::config::DictionaryConfig;
use crate::engine::{DictionaryEngine, Scan};
use crate::pool::SessionPool;
use crate::schema::{SchemaManager, TableSchema};

/// A map from `K` to `V` stored on disk.
///
/// Every operation is its own transaction unless it runs inside
/// [`transaction`](Self::transaction). Writes from any thread are serialized
/// by the engine; readers see the last committed state. Enumeration is lazy,
/// ordered by key, and reads the snapshot taken when it yields its first entry.
///
/// # Example
///
/// ```no_run
/// use dictionary::PersistentDictionary;
///
/// let dict = PersistentDictionary::<String, u64>::open("/tmp/visits")?;
/// dict.set(&"home".to_string(), &1)?;
/// assert_eq!(dict.get(&"home".to_string())?, 1);
/// for entry in &dict {
///     let (page, visits) = entry?;
///     println!("{page}: {visits}");
/// }
/// # Ok::<(), common::DbError>(())
/// ```
pub struct PersistentDictionary<K, V> {
    engine: DictionaryEngine<K, V>,
    config: DictionaryConfig,
}

impl<K: ColumnValue, V: ColumnValue> PersistentDictionary<K, V> {
    /// Opens or creates a dictionary at `path` with default settings.
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        Self::open_with_config(DictionaryConfig::new(path.as_ref()))
    }

    /// Opens or creates a dictionary.
    ///
    /// The storage directory is created if it doesn't exist. The key/value
    /// types are checked before anything is written to disk.
    ///
    /// # Arguments
    ///
    /// * `config` - Storage location, table name and engine settings
    ///
    /// # Errors
    ///
    /// Returns `DbError` if:
    /// - `config` fails validation (`Configuration`)
    /// - `K` or `V` has no column mapping (`UnsupportedType`)
    /// - the location cannot be opened (`EngineUnavailable`)
    /// - the table exists with a different layout (`SchemaMismatch`)
    pub fn open_with_config(config: DictionaryConfig) -> DbResult<Self> {
        config.validate()?;
        let layout = SchemaManager::derive(&config.table_name, &K::descriptor(), &V::descriptor())?;

        let env = MdbxEnvBuilder::new(&config.path)
            .with_max_dbs(config.max_tables)
            .with_size_upper(config.max_size as isize)
            .with_growth_step(config.growth_step as isize)
            .with_sync_mode(config.sync_mode)
            .open_shared()?;
        let pool = SessionPool::new(env, config.max_pooled_sessions);
        let schema = SchemaManager::ensure_schema(&mut pool.get(), &layout, &config.retry)?;

        info!(
            path = %config.path.display(),
            table = %config.table_name,
            key = %layout.key_type,
            value = %layout.value_type,
            "opened persistent dictionary"
        );
        let engine = DictionaryEngine::new(schema, pool, config.retry.clone(), config.enumeration_batch);
        Ok(Self { engine, config })
    }

    /// Returns true if a storage location exists at `path`.
    pub fn exists(path: impl AsRef<Path>) -> bool {
        mdbx_base::data_file_exists(path)
    }

    /// Deletes the storage files at `path`. Returns false if there were none.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` while any dictionary in this process still has the
    /// location open.
    pub fn delete_files(path: impl AsRef<Path>) -> DbResult<bool> {
        Ok(mdbx_base::delete_files(path)?)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn config(&self) -> &DictionaryConfig {
        &self.config
    }

    pub fn schema(&self) -> &TableSchema {
        self.engine.schema()
    }

    /// Value stored under `key`.
    ///
    /// # Errors
    ///
    /// `KeyNotFound` if there is no such key.
    pub fn get(&self, key: &K) -> DbResult<V> {
        self.engine
            .get(key)?
            .ok_or_else(|| DbError::KeyNotFound(format!("{:?}", key)))
    }

    pub fn try_get(&self, key: &K) -> DbResult<Option<V>> {
        self.engine.get(key)
    }

    /// Inserts or overwrites the value under `key`.
    pub fn set(&self, key: &K, value: &V) -> DbResult<()> {
        self.engine.set(key, value)
    }

    /// Inserts a new key.
    ///
    /// # Errors
    ///
    /// `DuplicateKey` if `key` is already present; the stored value is left
    /// unchanged.
    pub fn add(&self, key: &K, value: &V) -> DbResult<()> {
        self.engine.add(key, value)
    }

    /// Removes `key`. Returns false if it was not present.
    pub fn remove(&self, key: &K) -> DbResult<bool> {
        self.engine.remove(key)
    }

    pub fn contains_key(&self, key: &K) -> DbResult<bool> {
        self.engine.contains_key(key)
    }

    /// Returns true if `key` is present and maps to `value`.
    pub fn contains(&self, key: &K, value: &V) -> DbResult<bool>
    where
        V: PartialEq,
    {
        Ok(self.engine.get(key)?.as_ref() == Some(value))
    }

    /// Scans every value.
    pub fn contains_value(&self, value: &V) -> DbResult<bool>
    where
        V: PartialEq,
    {
        self.values().contains(value)
    }

    /// Removes every entry atomically.
    pub fn clear(&self) -> DbResult<()> {
        self.engine.clear()
    }

    /// Number of entries as of the last commit.
    pub fn len(&self) -> DbResult<usize> {
        self.engine.count()
    }

    pub fn is_empty(&self) -> DbResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn keys(&self) -> Keys<'_, K, V> {
        Keys { dict: self }
    }

    pub fn values(&self) -> Values<'_, K, V> {
        Values { dict: self }
    }

    /// Entries in key order, from one snapshot held until the iterator is
    /// exhausted or dropped.
    pub fn iter(&self) -> Entries<'_, K, V> {
        Entries {
            scan: self.engine.scan(Bound::Unbounded, Bound::Unbounded),
        }
    }

    /// Entries whose keys fall in `range`, in key order.
    pub fn range<R: RangeBounds<K>>(&self, range: R) -> Entries<'_, K, V> {
        Entries {
            scan: self
                .engine
                .scan(encode_bound(range.start_bound()), encode_bound(range.end_bound())),
        }
    }

    /// Entry with the smallest key.
    pub fn first(&self) -> DbResult<Option<(K, V)>> {
        self.engine
            .scan_batch(Bound::Unbounded, Bound::Unbounded, 1)?
            .first()
            .map(DictionaryEngine::<K, V>::decode_entry)
            .transpose()
    }

    /// Entry with the largest key.
    pub fn last(&self) -> DbResult<Option<(K, V)>> {
        self.engine
            .last()?
            .as_ref()
            .map(DictionaryEngine::<K, V>::decode_entry)
            .transpose()
    }

    /// Runs `op` as one atomic unit.
    ///
    /// All changes made through the [`DictionaryTransaction`] commit together
    /// when `op` returns `Ok`, and are rolled back when it returns `Err`. On a
    /// write conflict the whole closure is run again, so it must not have side
    /// effects outside the dictionary.
    ///
    /// Calling other methods of this dictionary from inside `op` on the same
    /// thread is not supported.
    pub fn transaction<T, F>(&self, mut op: F) -> DbResult<T>
    where
        F: FnMut(&DictionaryTransaction<'_, K, V>) -> DbResult<T>,
    {
        self.engine.write(|session| {
            op(&DictionaryTransaction {
                engine: &self.engine,
                session,
            })
        })
    }

    /// Forces buffered commits to disk.
    pub fn flush(&self) -> DbResult<()> {
        self.engine.pool().env().sync(true)
    }

    /// Releases the dictionary, flushing first unless every commit is
    /// already durable. The location closes once no other dictionary in
    /// the process uses it.
    pub fn close(self) -> DbResult<()> {
        if self.config.sync_mode != SyncMode::Durable {
            self.flush()?;
        }
        self.engine.pool().clear();
        debug!(path = %self.config.path.display(), "closed persistent dictionary");
        Ok(())
    }
}

impl<K, V> fmt::Debug for PersistentDictionary<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentDictionary")
            .field("path", &self.config.path)
            .field("table", &self.config.table_name)
            .finish_non_exhaustive()
    }
}

impl<'d, K: ColumnValue, V: ColumnValue> IntoIterator for &'d PersistentDictionary<K, V> {
    type Item = DbResult<(K, V)>;
    type IntoIter = Entries<'d, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

fn encode_bound<K: ColumnValue>(bound: Bound<&K>) -> Bound<Vec<u8>> {
    match bound {
        Bound::Included(key) => Bound::Included(codec::encode_key(key)),
        Bound::Excluded(key) => Bound::Excluded(codec::encode_key(key)),
        Bound::Unbounded => Bound::Unbounded,
    }
}

// ============================================================================
// Transactions
// ============================================================================

/// Dictionary operations inside one write transaction.
pub struct DictionaryTransaction<'t, K, V> {
    engine: &'t DictionaryEngine<K, V>,
    session: &'t Session,
}

impl<K: ColumnValue, V: ColumnValue> DictionaryTransaction<'_, K, V> {
    pub fn get(&self, key: &K) -> DbResult<V> {
        self.engine
            .get_in(self.session, key)?
            .ok_or_else(|| DbError::KeyNotFound(format!("{:?}", key)))
    }

    pub fn try_get(&self, key: &K) -> DbResult<Option<V>> {
        self.engine.get_in(self.session, key)
    }

    pub fn contains_key(&self, key: &K) -> DbResult<bool> {
        self.engine.contains_key_in(self.session, key)
    }

    pub fn set(&self, key: &K, value: &V) -> DbResult<()> {
        self.engine.set_in(self.session, key, value)
    }

    pub fn add(&self, key: &K, value: &V) -> DbResult<()> {
        self.engine.add_in(self.session, key, value)
    }

    pub fn remove(&self, key: &K) -> DbResult<bool> {
        self.engine.remove_in(self.session, key)
    }

    pub fn clear(&self) -> DbResult<()> {
        self.engine.clear_in(self.session)
    }

    /// Row count including this transaction's uncommitted changes.
    pub fn len(&self) -> DbResult<usize> {
        self.engine.count_in(self.session)
    }

    pub fn is_empty(&self) -> DbResult<bool> {
        Ok(self.len()? == 0)
    }
}

// ============================================================================
// Views and iterators
// ============================================================================

/// Entries in key order. Yields an error and stops if a read fails.
pub struct Entries<'d, K, V> {
    scan: Scan<'d, K, V>,
}

impl<K: ColumnValue, V: ColumnValue> Iterator for Entries<'_, K, V> {
    type Item = DbResult<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        let raw = self.scan.next()?;
        Some(raw.and_then(|raw| DictionaryEngine::<K, V>::decode_entry(&raw)))
    }
}

/// Live view of the keys.
pub struct Keys<'d, K, V> {
    dict: &'d PersistentDictionary<K, V>,
}

impl<'d, K: ColumnValue, V: ColumnValue> Keys<'d, K, V> {
    pub fn iter(&self) -> KeyIter<'d, K, V> {
        KeyIter {
            scan: self.dict.engine.scan(Bound::Unbounded, Bound::Unbounded),
        }
    }

    pub fn len(&self) -> DbResult<usize> {
        self.dict.len()
    }

    pub fn is_empty(&self) -> DbResult<bool> {
        self.dict.is_empty()
    }

    pub fn contains(&self, key: &K) -> DbResult<bool> {
        self.dict.contains_key(key)
    }
}

impl<'d, K: ColumnValue, V: ColumnValue> IntoIterator for Keys<'d, K, V> {
    type Item = DbResult<K>;
    type IntoIter = KeyIter<'d, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct KeyIter<'d, K, V> {
    scan: Scan<'d, K, V>,
}

impl<K: ColumnValue, V: ColumnValue> Iterator for KeyIter<'_, K, V> {
    type Item = DbResult<K>;

    fn next(&mut self) -> Option<Self::Item> {
        let raw = self.scan.next()?;
        Some(raw.and_then(|raw| codec::decode_key(&raw.key)))
    }
}

/// Live view of the values, in key order.
pub struct Values<'d, K, V> {
    dict: &'d PersistentDictionary<K, V>,
}

impl<'d, K: ColumnValue, V: ColumnValue> Values<'d, K, V> {
    pub fn iter(&self) -> ValueIter<'d, K, V> {
        ValueIter {
            scan: self.dict.engine.scan(Bound::Unbounded, Bound::Unbounded),
        }
    }

    pub fn len(&self) -> DbResult<usize> {
        self.dict.len()
    }

    pub fn is_empty(&self) -> DbResult<bool> {
        self.dict.is_empty()
    }

    /// Linear scan.
    pub fn contains(&self, value: &V) -> DbResult<bool>
    where
        V: PartialEq,
    {
        for stored in self.iter() {
            if stored? == *value {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl<'d, K: ColumnValue, V: ColumnValue> IntoIterator for Values<'d, K, V> {
    type Item = DbResult<V>;
    type IntoIter = ValueIter<'d, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct ValueIter<'d, K, V> {
    scan: Scan<'d, K, V>,
}

impl<K: ColumnValue, V: ColumnValue> Iterator for ValueIter<'_, K, V> {
    type Item = DbResult<V>;

    fn next(&mut self) -> Option<Self::Item> {
        let raw = self.scan.next()?;
        Some(raw.and_then(|raw| codec::decode_value(raw.value.as_deref())))
    }
}
