//! Row operations on the dictionary table.
//!
//! Each public operation checks a session out of the pool and runs in its own
//! transaction: reads in a snapshot, writes through [`with_retry`]. The
//! `*_in` variants run inside a transaction the caller already holds, which
//! is how [`crate::DictionaryTransaction`] composes several of them.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::ops::Bound;

use common::{DbError, DbResult};
use mdbx_base::{with_retry, Cursor, RetryPolicy, Session, TxnError, UpdateBuffer};
use tracing::{debug, trace};

use crate::codec::{self, ColumnValue};
use crate::pool::{PooledSession, SessionPool};
use crate::schema::TableSchema;

/// A row as stored: encoded key and value column (`None` is NULL).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

pub struct DictionaryEngine<K, V> {
    schema: TableSchema,
    pool: SessionPool,
    retry: RetryPolicy,
    batch: usize,
    _types: PhantomData<fn() -> (K, V)>,
}

impl<K: ColumnValue, V: ColumnValue> DictionaryEngine<K, V> {
    pub fn new(schema: TableSchema, pool: SessionPool, retry: RetryPolicy, batch: usize) -> Self {
        Self {
            schema,
            pool,
            retry,
            batch: batch.max(1),
            _types: PhantomData,
        }
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    // ------------------------------------------------------------------
    // Transaction plumbing
    // ------------------------------------------------------------------

    fn read<T>(&self, op: impl FnOnce(&Session) -> DbResult<T>) -> DbResult<T> {
        let mut session = self.pool.get();
        session.begin_read_transaction()?;
        let result = op(&*session);
        let ended = session.commit();
        let value = result?;
        ended?;
        Ok(value)
    }

    /// Runs `op` in a write transaction with conflict retry.
    pub fn write<T>(&self, mut op: impl FnMut(&Session) -> DbResult<T>) -> DbResult<T> {
        let mut session = self.pool.get();
        with_retry(&mut session, &self.retry, |s| op(s))
    }

    fn cursor<'s>(&'s self, session: &'s Session) -> DbResult<Cursor<'s>> {
        Ok(session.open_cursor(self.schema.table())?)
    }

    fn value_update(&self, value: &V) -> UpdateBuffer {
        let mut update = UpdateBuffer::new();
        match codec::encode_value(value) {
            Some(bytes) => update.set(self.schema.value_column(), bytes),
            None => update.set_null(self.schema.value_column()),
        };
        update
    }

    // ------------------------------------------------------------------
    // Operations inside the caller's transaction
    // ------------------------------------------------------------------

    pub fn get_in(&self, session: &Session, key: &K) -> DbResult<Option<V>> {
        let encoded = codec::encode_key(key);
        let mut cursor = self.cursor(session)?;
        if !cursor.seek_exact(&encoded)? {
            return Ok(None);
        }
        let stored = cursor.retrieve_column(self.schema.value_column())?;
        codec::decode_value(stored).map(Some)
    }

    pub fn contains_key_in(&self, session: &Session, key: &K) -> DbResult<bool> {
        let encoded = codec::encode_key(key);
        Ok(self.cursor(session)?.seek_exact(&encoded)?)
    }

    /// Inserts or overwrites.
    pub fn set_in(&self, session: &Session, key: &K, value: &V) -> DbResult<()> {
        let encoded = codec::encode_key(key);
        let update = self.value_update(value);
        let mut cursor = self.cursor(session)?;
        if cursor.seek_exact(&encoded)? {
            cursor.replace(&update)?;
        } else {
            cursor.insert(&encoded, &update)?;
        }
        trace!(table = self.schema.table_name(), key = ?key, "set");
        Ok(())
    }

    /// Inserts only if `key` is absent.
    pub fn add_in(&self, session: &Session, key: &K, value: &V) -> DbResult<()> {
        let encoded = codec::encode_key(key);
        let update = self.value_update(value);
        let mut cursor = self.cursor(session)?;
        match cursor.insert(&encoded, &update) {
            Ok(()) => Ok(()),
            Err(TxnError::KeyExists(_)) => Err(DbError::DuplicateKey(format!("{:?}", key))),
            Err(err) => Err(err.into()),
        }
    }

    pub fn remove_in(&self, session: &Session, key: &K) -> DbResult<bool> {
        let encoded = codec::encode_key(key);
        let mut cursor = self.cursor(session)?;
        if !cursor.seek_exact(&encoded)? {
            return Ok(false);
        }
        cursor.delete()?;
        trace!(table = self.schema.table_name(), key = ?key, "removed");
        Ok(true)
    }

    pub fn clear_in(&self, session: &Session) -> DbResult<()> {
        session.clear_table(self.schema.table())?;
        debug!(table = self.schema.table_name(), "cleared");
        Ok(())
    }

    /// Row count from the table statistics, as seen by the transaction.
    pub fn count_in(&self, session: &Session) -> DbResult<usize> {
        let stats = session.table_stats(self.schema.table())?;
        Ok(stats.entries as usize)
    }

    // ------------------------------------------------------------------
    // Self-contained operations
    // ------------------------------------------------------------------

    pub fn get(&self, key: &K) -> DbResult<Option<V>> {
        self.read(|s| self.get_in(s, key))
    }

    pub fn contains_key(&self, key: &K) -> DbResult<bool> {
        self.read(|s| self.contains_key_in(s, key))
    }

    pub fn set(&self, key: &K, value: &V) -> DbResult<()> {
        self.write(|s| self.set_in(s, key, value))
    }

    pub fn add(&self, key: &K, value: &V) -> DbResult<()> {
        self.write(|s| self.add_in(s, key, value))
    }

    pub fn remove(&self, key: &K) -> DbResult<bool> {
        self.write(|s| self.remove_in(s, key))
    }

    /// Deletes every row in one transaction; on failure nothing is deleted.
    pub fn clear(&self) -> DbResult<()> {
        self.write(|s| self.clear_in(s))
    }

    pub fn count(&self) -> DbResult<usize> {
        self.read(|s| self.count_in(s))
    }

    pub fn last(&self) -> DbResult<Option<RawEntry>> {
        self.read(|s| {
            let mut cursor = self.cursor(s)?;
            if !cursor.move_last()? {
                return Ok(None);
            }
            self.raw_entry(&cursor).map(Some)
        })
    }

    fn raw_entry(&self, cursor: &Cursor<'_>) -> DbResult<RawEntry> {
        Ok(RawEntry {
            key: cursor.key()?.to_vec(),
            value: cursor
                .retrieve_column(self.schema.value_column())?
                .map(<[u8]>::to_vec),
        })
    }

    /// Up to `limit` rows after `lower` and within `upper`, in key order, read
    /// in a snapshot of its own.
    pub fn scan_batch(
        &self,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
        limit: usize,
    ) -> DbResult<Vec<RawEntry>> {
        self.read(|s| self.scan_batch_in(s, lower, upper, limit))
    }

    /// Up to `limit` rows after `lower` and within `upper`, in key order.
    pub fn scan_batch_in(
        &self,
        session: &Session,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
        limit: usize,
    ) -> DbResult<Vec<RawEntry>> {
        let mut cursor = self.cursor(session)?;
        let mut found = match lower {
            Bound::Unbounded => cursor.move_first()?,
            Bound::Included(key) => cursor.seek_at_or_after(key)?,
            Bound::Excluded(key) => {
                let found = cursor.seek_at_or_after(key)?;
                if found && cursor.key()? == key {
                    cursor.move_next()?
                } else {
                    found
                }
            }
        };

        let mut rows = Vec::with_capacity(limit.min(self.batch));
        while found && rows.len() < limit {
            let key = cursor.key()?;
            let past_end = match upper {
                Bound::Included(end) => key > end,
                Bound::Excluded(end) => key >= end,
                Bound::Unbounded => false,
            };
            if past_end {
                break;
            }
            rows.push(self.raw_entry(&cursor)?);
            found = cursor.move_next()?;
        }
        Ok(rows)
    }

    /// Lazy scan over encoded key bounds.
    pub fn scan(&self, lower: Bound<Vec<u8>>, upper: Bound<Vec<u8>>) -> Scan<'_, K, V> {
        Scan {
            engine: self,
            snapshot: None,
            buffer: VecDeque::new(),
            resume: lower,
            upper,
            exhausted: false,
        }
    }

    pub fn decode_entry(raw: &RawEntry) -> DbResult<(K, V)> {
        Ok((
            codec::decode_key(&raw.key)?,
            codec::decode_value(raw.value.as_deref())?,
        ))
    }
}

fn borrowed(bound: &Bound<Vec<u8>>) -> Bound<&[u8]> {
    match bound {
        Bound::Included(key) => Bound::Included(key.as_slice()),
        Bound::Excluded(key) => Bound::Excluded(key.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// Ordered scan over one read-only snapshot.
///
/// The snapshot is taken on the first `next()` and held until the scan is
/// exhausted or dropped; rows are pulled from it `batch` at a time. Changes
/// committed after that point are never seen.
pub struct Scan<'e, K, V> {
    engine: &'e DictionaryEngine<K, V>,
    snapshot: Option<PooledSession<'e>>,
    buffer: VecDeque<RawEntry>,
    resume: Bound<Vec<u8>>,
    upper: Bound<Vec<u8>>,
    exhausted: bool,
}

impl<K: ColumnValue, V: ColumnValue> Scan<'_, K, V> {
    fn refill(&mut self) -> DbResult<()> {
        if self.snapshot.is_none() {
            let mut session = self.engine.pool.get();
            session.begin_read_transaction()?;
            trace!(session = session.id(), "scan snapshot opened");
            self.snapshot = Some(session);
        }
        let Some(session) = self.snapshot.as_deref() else {
            return Ok(());
        };

        let limit = self.engine.batch;
        let rows = self.engine.scan_batch_in(
            session,
            borrowed(&self.resume),
            borrowed(&self.upper),
            limit,
        )?;
        if rows.len() < limit {
            self.exhausted = true;
            self.release();
        }
        if let Some(last) = rows.last() {
            self.resume = Bound::Excluded(last.key.clone());
        }
        self.buffer.extend(rows);
        Ok(())
    }
}

impl<K, V> Scan<'_, K, V> {
    /// Ends the snapshot and hands the session back to the pool.
    fn release(&mut self) {
        if let Some(mut session) = self.snapshot.take() {
            if let Err(err) = session.commit() {
                debug!(session = session.id(), error = %err, "scan snapshot did not end cleanly");
            }
        }
    }
}

impl<K: ColumnValue, V: ColumnValue> Iterator for Scan<'_, K, V> {
    type Item = DbResult<RawEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(err) = self.refill() {
                self.exhausted = true;
                self.release();
                return Some(Err(err));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

impl<K, V> Drop for Scan<'_, K, V> {
    fn drop(&mut self) {
        self.release();
    }
}
