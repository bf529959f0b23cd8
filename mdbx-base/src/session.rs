//! Sessions, nested transactions and write-conflict retry.
//!
//! A [`Session`] is one logical connection to an environment. It keeps a stack
//! of open transactions: the bottom frame is either a read-only snapshot or a
//! write transaction, every frame above it is a nested write transaction whose
//! commit folds into its parent. Nothing becomes visible to other sessions
//! until the bottom frame commits.
//!
//! MDBX has a single writer per environment. Under [`LockWait::Try`] a
//! contended writer lock surfaces as a write conflict, which [`with_retry`]
//! absorbs up to [`RetryPolicy::max_attempts`] times.

use std::cell::RefCell;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use common::{DbError, DbResult};
use mdbx_sys::{mdbx_dbi_stat, mdbx_drop, MDBX_dbi, MDBX_stat, MDBX_txn, MDBX_RESULT_TRUE};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::catalog::Table;
use crate::env_builder::MdbxEnv;
use crate::interop::{FromWire, TableStats};
use crate::txn_helpers::{abort_txn, begin_txn, check, commit_txn, TxnError};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// What a writer does when another writer holds the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockWait {
    /// Wait for the lock.
    #[default]
    Block,
    /// Fail fast with a write conflict and let the retry loop yield.
    Try,
}

/// Bounded retry for write operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub lock_wait: LockWait,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 64,
            lock_wait: LockWait::Block,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, lock_wait: LockWait) -> Self {
        Self {
            max_attempts,
            lock_wait,
        }
    }
}

#[derive(Debug)]
struct TxnFrame {
    txn: *mut MDBX_txn,
    read_only: bool,
}

/// Scratch table opened at transaction `level` (1 is the outermost).
/// `dropped` is the level whose transaction dropped it, if any.
#[derive(Debug, Clone, Copy)]
struct TempTable {
    level: usize,
    dbi: MDBX_dbi,
    dropped: Option<usize>,
}

/// Logical connection to an environment.
///
/// A session may move between threads while no transaction is open. A write
/// transaction must be committed on the thread that began it.
///
/// Temporary tables live until the outermost transaction ends: they are
/// dropped just before it commits and vanish with it on rollback.
pub struct Session {
    env: Arc<MdbxEnv>,
    frames: Vec<TxnFrame>,
    temp_tables: RefCell<Vec<TempTable>>,
    id: u64,
}

// SAFETY: the raw transaction pointers are only touched through &mut self or
// &self on the owning thread; the pool never hands out a session with open
// frames.
unsafe impl Send for Session {}

impl Session {
    pub fn open(env: Arc<MdbxEnv>) -> Self {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        trace!(session = id, "session opened");
        Self {
            env,
            frames: Vec::new(),
            temp_tables: RefCell::new(Vec::new()),
            id,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn env(&self) -> &Arc<MdbxEnv> {
        &self.env
    }

    /// Number of open transaction frames (0 when idle).
    pub fn transaction_level(&self) -> usize {
        self.frames.len()
    }

    pub fn in_transaction(&self) -> bool {
        !self.frames.is_empty()
    }

    pub fn is_read_only(&self) -> bool {
        self.frames.last().map(|f| f.read_only).unwrap_or(false)
    }

    /// Begins a write transaction, nested if one is already open.
    pub fn begin_transaction(&mut self) -> Result<(), TxnError> {
        self.begin_transaction_with(LockWait::Block)
    }

    pub fn begin_transaction_with(&mut self, lock_wait: LockWait) -> Result<(), TxnError> {
        let parent = match self.frames.last() {
            Some(frame) if frame.read_only => return Err(TxnError::ReadOnly),
            Some(frame) => frame.txn,
            None => ptr::null_mut(),
        };
        // Only the outermost begin can contend for the writer lock.
        let try_lock = lock_wait == LockWait::Try && parent.is_null();
        let txn = unsafe { begin_txn(self.env.as_ptr(), parent, false, try_lock) }?;
        self.frames.push(TxnFrame {
            txn,
            read_only: false,
        });
        debug!(session = self.id, level = self.frames.len(), "begin write transaction");
        Ok(())
    }

    /// Begins a read-only snapshot. Only allowed at the outermost level.
    pub fn begin_read_transaction(&mut self) -> Result<(), TxnError> {
        if self.in_transaction() {
            return Err(TxnError::NestedReadOnly);
        }
        let txn = unsafe { begin_txn(self.env.as_ptr(), ptr::null_mut(), true, false) }?;
        self.frames.push(TxnFrame {
            txn,
            read_only: true,
        });
        trace!(session = self.id, "begin read transaction");
        Ok(())
    }

    /// Commits the innermost transaction. For a snapshot this just ends it.
    pub fn commit(&mut self) -> Result<(), TxnError> {
        let level = self.frames.len();
        let frame = self.frames.pop().ok_or(TxnError::NoTransaction)?;
        if frame.read_only {
            let result = unsafe { commit_txn(frame.txn) };
            // Committing (rather than aborting) a snapshot keeps any DBI
            // handles it opened.
            return match result {
                Err(TxnError::CommitFailed { code, .. }) if code == MDBX_RESULT_TRUE => Ok(()),
                other => other,
            };
        }

        if level == 1 {
            if let Err(err) = self.drop_temporary_tables(frame.txn) {
                unsafe { abort_txn(frame.txn) };
                self.forget_temporary_tables(1);
                return Err(err);
            }
        }

        let result = unsafe { commit_txn(frame.txn) };
        if level > 1 {
            if result.is_ok() {
                // The parent now owns what the child created or dropped.
                for temp in self.temp_tables.get_mut().iter_mut() {
                    temp.level = temp.level.min(level - 1);
                    temp.dropped = temp.dropped.map(|at| at.min(level - 1));
                }
            } else {
                self.forget_temporary_tables(level);
            }
        }
        debug!(session = self.id, level, ok = result.is_ok(), "commit transaction");
        result
    }

    /// Rolls back the innermost transaction.
    pub fn rollback(&mut self) -> Result<(), TxnError> {
        let level = self.frames.len();
        let frame = self.frames.pop().ok_or(TxnError::NoTransaction)?;
        unsafe { abort_txn(frame.txn) };
        self.forget_temporary_tables(level);
        debug!(session = self.id, level, "rollback transaction");
        Ok(())
    }

    /// Rolls back every open frame, innermost first.
    pub fn rollback_all(&mut self) {
        while let Some(frame) = self.frames.pop() {
            unsafe { abort_txn(frame.txn) };
        }
        self.temp_tables.get_mut().clear();
    }

    /// Number of temporary tables the open transactions still own.
    pub fn temporary_table_count(&self) -> usize {
        self.temp_tables
            .borrow()
            .iter()
            .filter(|temp| temp.dropped.is_none())
            .count()
    }

    pub(crate) fn track_temporary_table(&self, dbi: MDBX_dbi) {
        let level = self.frames.len();
        self.temp_tables.borrow_mut().push(TempTable {
            level,
            dbi,
            dropped: None,
        });
    }

    pub(crate) fn mark_temporary_table_dropped(&self, dbi: MDBX_dbi) {
        let level = self.frames.len();
        for temp in self.temp_tables.borrow_mut().iter_mut() {
            if temp.dbi == dbi && temp.dropped.is_none() {
                temp.dropped = Some(level);
            }
        }
    }

    /// Undoes what the transaction at `level` (and deeper) did: tables it
    /// created are gone, tables it dropped are back.
    fn forget_temporary_tables(&mut self, level: usize) {
        let temps = self.temp_tables.get_mut();
        temps.retain(|temp| temp.level < level);
        for temp in temps.iter_mut() {
            if temp.dropped.is_some_and(|at| at >= level) {
                temp.dropped = None;
            }
        }
    }

    fn drop_temporary_tables(&mut self, txn: *mut MDBX_txn) -> Result<(), TxnError> {
        let pending = self.temp_tables.get_mut().drain(..).filter(|temp| temp.dropped.is_none());
        for temp in pending {
            let rc = unsafe { mdbx_drop(txn, temp.dbi, true) };
            check(rc, "mdbx_drop")?;
            trace!(session = self.id, dbi = temp.dbi, "dropped temporary table at commit");
        }
        Ok(())
    }

    pub(crate) fn txn(&self) -> Result<*mut MDBX_txn, TxnError> {
        self.frames
            .last()
            .map(|f| f.txn)
            .ok_or(TxnError::NoTransaction)
    }

    pub(crate) fn write_txn(&self) -> Result<*mut MDBX_txn, TxnError> {
        match self.frames.last() {
            Some(frame) if frame.read_only => Err(TxnError::ReadOnly),
            Some(frame) => Ok(frame.txn),
            None => Err(TxnError::NoTransaction),
        }
    }

    /// Row count and page statistics of `table`, as seen by this transaction.
    pub fn table_stats(&self, table: &Table) -> Result<TableStats, TxnError> {
        let txn = self.txn()?;
        // SAFETY: MDBX_stat is plain integers; txn is live.
        let mut stat: MDBX_stat = unsafe { mem::zeroed() };
        let rc = unsafe { mdbx_dbi_stat(txn, table.dbi(), &mut stat, mem::size_of::<MDBX_stat>()) };
        check(rc, "mdbx_dbi_stat")?;
        Ok(TableStats::from_wire(&stat)?)
    }

    /// Deletes every row of `table`, keeping the table and its catalog entry.
    pub fn clear_table(&self, table: &Table) -> Result<(), TxnError> {
        let txn = self.write_txn()?;
        let rc = unsafe { mdbx_drop(txn, table.dbi(), false) };
        check(rc, "mdbx_drop")
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.in_transaction() {
            warn!(
                session = self.id,
                level = self.frames.len(),
                "session dropped with open transactions, rolling back"
            );
            self.rollback_all();
        }
    }
}

/// Runs `op` inside a write transaction, retrying on write conflict.
///
/// At the outermost level each attempt gets a fresh transaction that is
/// committed when `op` succeeds; a conflict rolls back, yields and tries again
/// until `policy.max_attempts` is spent. Inside an ambient transaction `op`
/// runs in a nested transaction once; conflicts propagate so the owner of the
/// ambient transaction can retry the whole unit.
pub fn with_retry<T, F>(session: &mut Session, policy: &RetryPolicy, mut op: F) -> DbResult<T>
where
    F: FnMut(&mut Session) -> DbResult<T>,
{
    if session.in_transaction() {
        session.begin_transaction_with(policy.lock_wait)?;
        return match op(session) {
            Ok(value) => {
                session.commit()?;
                Ok(value)
            }
            Err(err) => {
                session.rollback()?;
                Err(err)
            }
        };
    }

    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        if let Err(err) = session.begin_transaction_with(policy.lock_wait) {
            let err = DbError::from(err);
            if err.is_write_conflict() {
                debug!(session = session.id, attempt, "writer lock busy, yielding");
                std::thread::yield_now();
                continue;
            }
            return Err(err);
        }

        match op(session) {
            Ok(value) => match session.commit() {
                Ok(()) => return Ok(value),
                Err(err) => {
                    let err = DbError::from(err);
                    if !err.is_write_conflict() {
                        return Err(err);
                    }
                }
            },
            Err(err) => {
                session.rollback_all();
                if !err.is_write_conflict() {
                    return Err(err);
                }
            }
        }
        debug!(session = session.id, attempt, "write conflict, retrying");
        std::thread::yield_now();
    }

    warn!(session = session.id, attempts, "write conflict retries exhausted");
    Err(DbError::WriteConflict { attempts })
}
