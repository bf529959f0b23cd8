use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use mdbx_base::{MdbxEnv, Session};
use parking_lot::Mutex;
use tracing::{trace, warn};

/// Reusable sessions over one environment.
///
/// Checked-out sessions are returned on drop with every transaction rolled
/// back. At most `max_idle` sessions are kept; extra ones are closed.
pub struct SessionPool {
    env: Arc<MdbxEnv>,
    idle: Mutex<Vec<Session>>,
    max_idle: usize,
}

impl SessionPool {
    pub fn new(env: Arc<MdbxEnv>, max_idle: usize) -> Self {
        Self {
            env,
            idle: Mutex::new(Vec::with_capacity(max_idle)),
            max_idle,
        }
    }

    pub fn env(&self) -> &Arc<MdbxEnv> {
        &self.env
    }

    /// Takes an idle session or opens a new one.
    pub fn get(&self) -> PooledSession<'_> {
        let session = self
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| Session::open(Arc::clone(&self.env)));
        PooledSession {
            pool: self,
            session: ManuallyDrop::new(session),
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Closes every idle session.
    pub fn clear(&self) {
        let drained: Vec<Session> = self.idle.lock().drain(..).collect();
        trace!(sessions = drained.len(), "closing idle sessions");
    }

    fn put_back(&self, mut session: Session) {
        if session.in_transaction() {
            warn!(
                session = session.id(),
                level = session.transaction_level(),
                "pooled session returned with open transactions, rolling back"
            );
            session.rollback_all();
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(session);
        }
    }
}

/// A session checked out of a [`SessionPool`].
pub struct PooledSession<'p> {
    pool: &'p SessionPool,
    session: ManuallyDrop<Session>,
}

impl Deref for PooledSession<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl DerefMut for PooledSession<'_> {
    fn deref_mut(&mut self) -> &mut Session {
        &mut self.session
    }
}

impl Drop for PooledSession<'_> {
    fn drop(&mut self) {
        // SAFETY: `session` is never touched again after this.
        let session = unsafe { ManuallyDrop::take(&mut self.session) };
        self.pool.put_back(session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdbx_base::MdbxEnvBuilder;
    use tempfile::TempDir;

    fn pool(dir: &TempDir, max_idle: usize) -> SessionPool {
        let env = MdbxEnvBuilder::new(dir.path())
            .open_shared()
            .expect("Failed to open environment");
        SessionPool::new(env, max_idle)
    }

    #[test]
    fn test_sessions_are_reused() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let pool = pool(&dir, 2);
        let first_id = pool.get().id();
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.get().id(), first_id);
    }

    #[test]
    fn test_idle_cap() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let pool = pool(&dir, 1);
        {
            let _a = pool.get();
            let _b = pool.get();
        }
        assert_eq!(pool.idle_count(), 1);
        pool.clear();
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_open_transaction_is_rolled_back_on_return() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let pool = pool(&dir, 4);
        {
            let mut session = pool.get();
            session.begin_read_transaction().expect("Failed to begin");
        }
        let session = pool.get();
        assert!(!session.in_transaction());
    }
}
