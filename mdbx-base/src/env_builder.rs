//! MDBX Environment Builder - attaches a storage directory to the engine.
//!
//! All environment-level FFI calls are encapsulated here. MDBX refuses to have
//! the same database file open twice in one process, so [`MdbxEnvBuilder::open_shared`]
//! goes through a process-wide registry and hands every caller the same
//! [`MdbxEnv`] for a given directory.
//!
//! # Example
//!
//! ```no_run
//! use mdbx_base::MdbxEnvBuilder;
//!
//! let env = MdbxEnvBuilder::new("/path/to/db")
//!     .with_max_dbs(16)
//!     .with_size_upper(1 << 30)
//!     .open_shared()?;
//! # Ok::<(), mdbx_base::MdbxEnvError>(())
//! ```

use std::ffi::{CStr, CString};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::{Arc, OnceLock, Weak};

use common::DbError;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use mdbx_sys::{
    mdbx_env_close_ex, mdbx_env_create, mdbx_env_delete, mdbx_env_get_maxkeysize_ex,
    mdbx_env_get_maxvalsize_ex, mdbx_env_open, mdbx_env_set_geometry, mdbx_env_set_option,
    mdbx_env_sync_ex, mdbx_strerror, MDBX_env, MDBX_opt_max_db, MDBX_NOMETASYNC,
    MDBX_NOSTICKYTHREADS, MDBX_RESULT_TRUE, MDBX_SAFE_NOSYNC, MDBX_SUCCESS,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Name of the data file MDBX creates inside the storage directory.
pub const DATA_FILE_NAME: &str = "mdbx.dat";

#[derive(Debug, Error)]
pub enum MdbxEnvError {
    #[error("mdbx_env_create failed: {message} ({code})")]
    CreateFailed { code: i32, message: String },

    #[error("mdbx_env_set_option failed: {message} ({code})")]
    SetOptionFailed { code: i32, message: String },

    #[error("mdbx_env_set_geometry failed: {message} ({code})")]
    SetGeometryFailed { code: i32, message: String },

    #[error("mdbx_env_open failed for {path}: {message} ({code})")]
    OpenFailed {
        path: String,
        code: i32,
        message: String,
    },

    #[error("mdbx_env_delete failed for {path}: {message} ({code})")]
    DeleteFailed {
        path: String,
        code: i32,
        message: String,
    },

    #[error("environment at {0} is still open in this process")]
    StillOpen(String),

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid path: {0}")]
    InvalidPath(String),
}

impl MdbxEnvError {
    fn path(&self) -> Option<&str> {
        match self {
            MdbxEnvError::OpenFailed { path, .. }
            | MdbxEnvError::DeleteFailed { path, .. }
            | MdbxEnvError::Io { path, .. }
            | MdbxEnvError::InvalidPath(path)
            | MdbxEnvError::StillOpen(path) => Some(path),
            _ => None,
        }
    }
}

impl From<MdbxEnvError> for DbError {
    fn from(err: MdbxEnvError) -> Self {
        if let MdbxEnvError::StillOpen(_) = err {
            return DbError::InvalidOperation(err.to_string());
        }
        DbError::EngineUnavailable {
            path: err.path().unwrap_or("<environment>").to_string(),
            reason: err.to_string(),
        }
    }
}

/// Human-readable text for an MDBX return code.
pub fn error_message(code: i32) -> String {
    // SAFETY: mdbx_strerror returns a static NUL-terminated string.
    unsafe {
        let msg = mdbx_strerror(code as _);
        if msg.is_null() {
            return format!("mdbx error {}", code);
        }
        CStr::from_ptr(msg).to_string_lossy().into_owned()
    }
}

/// Commit durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Every commit is fsync'ed.
    #[default]
    Durable,
    /// Data pages are synced, the meta page lazily.
    NoMetaSync,
    /// Sync is left to the OS; a crash may lose recent commits but never
    /// corrupts the database.
    SafeNoSync,
}

impl SyncMode {
    fn env_flags(self) -> u32 {
        match self {
            SyncMode::Durable => 0,
            SyncMode::NoMetaSync => MDBX_NOMETASYNC as u32,
            SyncMode::SafeNoSync => MDBX_SAFE_NOSYNC as u32,
        }
    }
}

/// Builder for creating MDBX environments with sensible defaults.
#[derive(Debug, Clone)]
pub struct MdbxEnvBuilder {
    path: PathBuf,
    max_dbs: u64,
    size_lower: isize,
    size_now: isize,
    size_upper: isize,
    growth_step: isize,
    shrink_threshold: isize,
    page_size: isize,
    sync_mode: SyncMode,
    flags: u32,
    mode: u32,
}

impl MdbxEnvBuilder {
    /// Creates a new builder with default configuration.
    ///
    /// **Defaults:**
    /// - `max_dbs`: 32
    /// - `size_upper`: 1GB
    /// - `size_lower`, `size_now`, `growth_step`, `shrink_threshold`, `page_size`: -1 (MDBX default)
    /// - `sync_mode`: durable
    /// - `mode`: 0o600 (read/write for owner)
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_dbs: 32,
            size_lower: -1,
            size_now: -1,
            size_upper: 1 << 30,
            growth_step: -1,
            shrink_threshold: -1,
            page_size: -1,
            sync_mode: SyncMode::Durable,
            flags: 0,
            mode: 0o600,
        }
    }

    /// Sets the maximum number of named databases (tables plus the catalog).
    pub fn with_max_dbs(mut self, max_dbs: u64) -> Self {
        self.max_dbs = max_dbs;
        self
    }

    /// Sets the maximum database size in bytes.
    pub fn with_size_upper(mut self, bytes: isize) -> Self {
        self.size_upper = bytes;
        self
    }

    /// Sets the step by which the data file grows.
    pub fn with_growth_step(mut self, bytes: isize) -> Self {
        self.growth_step = bytes;
        self
    }

    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }

    /// Extra environment flags (e.g., MDBX_NORDAHEAD), OR-ed with the sync mode.
    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    /// Sets file mode (Unix permissions).
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens a private environment handle.
    ///
    /// **Automatically creates the directory if it doesn't exist.** Prefer
    /// [`open_shared`](Self::open_shared) unless the caller guarantees nobody
    /// else in the process opens the same directory.
    pub fn open(self) -> Result<MdbxEnv, MdbxEnvError> {
        let display = self.path.display().to_string();
        std::fs::create_dir_all(&self.path).map_err(|source| MdbxEnvError::Io {
            path: display.clone(),
            source,
        })?;
        let path_c = path_to_cstring(&self.path)?;

        unsafe {
            let mut env: *mut MDBX_env = ptr::null_mut();
            let rc = mdbx_env_create(&mut env as *mut _);
            if rc != MDBX_SUCCESS {
                return Err(MdbxEnvError::CreateFailed {
                    code: rc,
                    message: error_message(rc),
                });
            }

            // Required before any named database can be opened.
            let rc = mdbx_env_set_option(env, MDBX_opt_max_db, self.max_dbs);
            if rc != MDBX_SUCCESS {
                mdbx_env_close_ex(env, false);
                return Err(MdbxEnvError::SetOptionFailed {
                    code: rc,
                    message: error_message(rc),
                });
            }

            let rc = mdbx_env_set_geometry(
                env,
                self.size_lower,
                self.size_now,
                self.size_upper,
                self.growth_step,
                self.shrink_threshold,
                self.page_size,
            );
            if rc != MDBX_SUCCESS {
                mdbx_env_close_ex(env, false);
                return Err(MdbxEnvError::SetGeometryFailed {
                    code: rc,
                    message: error_message(rc),
                });
            }

            // Snapshots are not pinned to a thread, so a thread can keep a
            // read transaction open while it writes.
            let flags = self.flags | self.sync_mode.env_flags() | MDBX_NOSTICKYTHREADS as u32;
            let rc = mdbx_env_open(env, path_c.as_ptr(), flags as _, self.mode as _);
            if rc != MDBX_SUCCESS {
                mdbx_env_close_ex(env, false);
                return Err(MdbxEnvError::OpenFailed {
                    path: display,
                    code: rc,
                    message: error_message(rc),
                });
            }

            info!(path = %display, sync_mode = ?self.sync_mode, "opened mdbx environment");
            Ok(MdbxEnv {
                env,
                path: self.path,
                slot: None,
            })
        }
    }

    /// Opens the environment, or returns the one already open for this
    /// directory in this process. Builder settings only apply to a fresh open.
    ///
    /// If the last handle for the directory is being closed on another thread,
    /// this waits until the file is released before opening it again.
    pub fn open_shared(self) -> Result<Arc<MdbxEnv>, MdbxEnvError> {
        std::fs::create_dir_all(&self.path).map_err(|source| MdbxEnvError::Io {
            path: self.path.display().to_string(),
            source,
        })?;
        let key = canonical(&self.path)?;
        let slot = registry()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(EnvSlot::default()))
            .value()
            .clone();

        let mut state = slot.state.lock();
        loop {
            if let Some(env) = state.env.upgrade() {
                debug!(path = %key.display(), "reusing open mdbx environment");
                return Ok(env);
            }
            if !state.open {
                break;
            }
            debug!(path = %key.display(), "waiting for mdbx environment to close");
            slot.released.wait(&mut state);
        }

        let mut env = match self.open() {
            Ok(env) => env,
            Err(err) => {
                drop(state);
                drop(slot);
                registry().remove_if(&key, |_, slot| Arc::strong_count(slot) == 1);
                return Err(err);
            }
        };
        env.path = key;
        env.slot = Some(Arc::clone(&slot));
        let env = Arc::new(env);
        state.env = Arc::downgrade(&env);
        state.open = true;
        Ok(env)
    }
}

/// Registry entry for one directory. `open` stays true from the moment the
/// file is opened until `mdbx_env_close_ex` has returned, which outlasts the
/// last strong reference.
#[derive(Default)]
struct EnvSlot {
    state: Mutex<SlotState>,
    released: Condvar,
}

#[derive(Default)]
struct SlotState {
    env: Weak<MdbxEnv>,
    open: bool,
}

fn registry() -> &'static DashMap<PathBuf, Arc<EnvSlot>> {
    static REGISTRY: OnceLock<DashMap<PathBuf, Arc<EnvSlot>>> = OnceLock::new();
    REGISTRY.get_or_init(DashMap::new)
}

fn canonical(path: &Path) -> Result<PathBuf, MdbxEnvError> {
    path.canonicalize().map_err(|source| MdbxEnvError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn path_to_cstring(path: &Path) -> Result<CString, MdbxEnvError> {
    let text = path
        .to_str()
        .ok_or_else(|| MdbxEnvError::InvalidPath(path.display().to_string()))?;
    CString::new(text).map_err(|_| MdbxEnvError::InvalidPath(text.to_string()))
}

/// Returns true if an environment for `path` is currently open in this process.
pub fn is_open(path: impl AsRef<Path>) -> bool {
    let Ok(key) = path.as_ref().canonicalize() else {
        return false;
    };
    let Some(slot) = registry().get(&key).map(|slot| slot.value().clone()) else {
        return false;
    };
    let open = slot.state.lock().open;
    open
}

/// Returns true if `path` holds an MDBX data file.
pub fn data_file_exists(path: impl AsRef<Path>) -> bool {
    path.as_ref().join(DATA_FILE_NAME).is_file()
}

/// Deletes the data and lock files at `path`. Refuses while the environment
/// is open in this process. Returns false if there was nothing to delete.
pub fn delete_files(path: impl AsRef<Path>) -> Result<bool, MdbxEnvError> {
    let path = path.as_ref();
    if is_open(path) {
        return Err(MdbxEnvError::StillOpen(path.display().to_string()));
    }
    if !path.exists() {
        return Ok(false);
    }
    let path_c = path_to_cstring(path)?;
    // SAFETY: path_c is a valid NUL-terminated string for the call duration.
    let rc = unsafe { mdbx_env_delete(path_c.as_ptr(), 0 as _) };
    match rc {
        MDBX_SUCCESS => {
            info!(path = %path.display(), "deleted mdbx environment files");
            Ok(true)
        }
        MDBX_RESULT_TRUE => Ok(false),
        code => Err(MdbxEnvError::DeleteFailed {
            path: path.display().to_string(),
            code,
            message: error_message(code),
        }),
    }
}

/// RAII wrapper for MDBX_env that automatically closes on drop.
pub struct MdbxEnv {
    env: *mut MDBX_env,
    path: PathBuf,
    slot: Option<Arc<EnvSlot>>,
}

impl MdbxEnv {
    /// Returns the raw environment pointer.
    pub fn as_ptr(&self) -> *mut MDBX_env {
        self.env
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Largest key the engine accepts for a table with default flags.
    pub fn max_key_size(&self) -> usize {
        // SAFETY: env is open for the lifetime of self.
        let size = unsafe { mdbx_env_get_maxkeysize_ex(self.env, 0 as _) };
        size.max(0) as usize
    }

    /// Largest value the engine accepts for a table with default flags.
    pub fn max_value_size(&self) -> usize {
        // SAFETY: env is open for the lifetime of self.
        let size = unsafe { mdbx_env_get_maxvalsize_ex(self.env, 0 as _) };
        size.max(0) as usize
    }

    /// Flushes buffered commits to disk. `force` syncs even in lazy sync modes.
    pub fn sync(&self, force: bool) -> Result<(), DbError> {
        // SAFETY: env is open for the lifetime of self.
        let rc = unsafe { mdbx_env_sync_ex(self.env, force, false) };
        if rc == MDBX_SUCCESS || rc == MDBX_RESULT_TRUE {
            Ok(())
        } else {
            Err(DbError::Engine {
                op: "mdbx_env_sync_ex",
                code: rc,
                message: error_message(rc),
            })
        }
    }
}

impl Drop for MdbxEnv {
    fn drop(&mut self) {
        if self.env.is_null() {
            return;
        }
        unsafe {
            mdbx_env_close_ex(self.env, false);
        }
        info!(path = %self.path.display(), "closed mdbx environment");

        if let Some(slot) = self.slot.take() {
            slot.state.lock().open = false;
            slot.released.notify_all();
            drop(slot);
            // Only the registry still holds an idle slot.
            registry().remove_if(&self.path, |_, slot| Arc::strong_count(slot) == 1);
        }
    }
}

unsafe impl Send for MdbxEnv {}
unsafe impl Sync for MdbxEnv {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("db");
        let env = MdbxEnvBuilder::new(&path).open().unwrap();
        assert!(data_file_exists(&path));
        assert!(env.max_key_size() > 16);
        assert!(env.max_value_size() > env.max_key_size());
    }

    #[test]
    fn test_open_shared_reuses_environment() {
        let dir = tempfile::TempDir::new().unwrap();
        let first = MdbxEnvBuilder::new(dir.path()).open_shared().unwrap();
        let second = MdbxEnvBuilder::new(dir.path()).open_shared().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(is_open(dir.path()));

        drop(first);
        drop(second);
        assert!(!is_open(dir.path()));

        let reopened = MdbxEnvBuilder::new(dir.path()).open_shared().unwrap();
        assert!(is_open(reopened.path()));
    }

    #[test]
    fn test_closed_environment_leaves_registry() {
        let dir = tempfile::TempDir::new().unwrap();
        let env = MdbxEnvBuilder::new(dir.path()).open_shared().unwrap();
        let key = env.path().to_path_buf();
        assert!(registry().contains_key(&key));

        drop(env);
        assert!(!registry().contains_key(&key));
    }

    #[test]
    fn test_close_and_reopen_from_two_threads() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().to_path_buf();

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let path = path.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let env = MdbxEnvBuilder::new(&path).open_shared().unwrap();
                        env.sync(true).unwrap();
                        drop(env);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("opener panicked");
        }

        assert!(!is_open(&path));
        assert!(!registry().contains_key(&path.canonicalize().unwrap()));
        let env = MdbxEnvBuilder::new(&path).open().unwrap();
        env.sync(true).unwrap();
    }

    #[test]
    fn test_file_in_the_way_is_unavailable() {
        let dir = tempfile::TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        let err = MdbxEnvBuilder::new(&blocker).open_shared().unwrap_err();
        assert!(matches!(DbError::from(err), DbError::EngineUnavailable { .. }));
    }

    #[test]
    fn test_delete_files_refuses_open_env() {
        let dir = tempfile::TempDir::new().unwrap();
        let env = MdbxEnvBuilder::new(dir.path()).open_shared().unwrap();
        assert!(matches!(delete_files(dir.path()), Err(MdbxEnvError::StillOpen(_))));

        drop(env);
        assert!(delete_files(dir.path()).unwrap());
        assert!(!data_file_exists(dir.path()));
    }

    #[test]
    fn test_sync_modes_open() {
        for mode in [SyncMode::Durable, SyncMode::NoMetaSync, SyncMode::SafeNoSync] {
            let dir = tempfile::TempDir::new().unwrap();
            let env = MdbxEnvBuilder::new(dir.path()).with_sync_mode(mode).open().unwrap();
            env.sync(true).unwrap();
        }
    }
}
