use std::path::{Path, PathBuf};

use common::{DbError, DbResult};
use mdbx_base::{RetryPolicy, SyncMode};
use serde::{Deserialize, Serialize};

/// Default table holding the dictionary rows.
pub const DEFAULT_TABLE_NAME: &str = "PersistentDictionary";

/// Configuration for one persistent dictionary.
///
/// Every field has a default, so a TOML file only needs the keys it changes:
///
/// ```toml
/// path = "/var/lib/app/settings"
/// sync_mode = "safe_no_sync"
///
/// [retry]
/// max_attempts = 16
/// lock_wait = "try"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DictionaryConfig {
    /// Storage directory; created on open if missing
    pub path: PathBuf,

    /// Table the rows live in
    pub table_name: String,

    /// Upper bound of the data file in bytes (default: 1GB)
    pub max_size: usize,

    /// Step by which the data file grows (default: 16MB)
    pub growth_step: usize,

    /// Named tables the environment can hold, catalog included
    pub max_tables: u64,

    pub sync_mode: SyncMode,

    /// Idle sessions kept for reuse
    pub max_pooled_sessions: usize,

    /// Rows fetched per read transaction while enumerating
    pub enumeration_batch: usize,

    pub retry: RetryPolicy,
}

impl DictionaryConfig {
    /// Create a configuration for `path` with default settings
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_table_name(mut self, name: impl Into<String>) -> Self {
        self.table_name = name.into();
        self
    }

    /// Set maximum database size
    pub fn with_max_size(mut self, bytes: usize) -> Self {
        self.max_size = bytes;
        self
    }

    pub fn with_growth_step(mut self, bytes: usize) -> Self {
        self.growth_step = bytes;
        self
    }

    pub fn with_max_tables(mut self, tables: u64) -> Self {
        self.max_tables = tables;
        self
    }

    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }

    pub fn with_max_pooled_sessions(mut self, sessions: usize) -> Self {
        self.max_pooled_sessions = sessions;
        self
    }

    pub fn with_enumeration_batch(mut self, rows: usize) -> Self {
        self.enumeration_batch = rows;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Parse a configuration from TOML text. Missing keys take defaults.
    pub fn from_toml_str(text: &str) -> DbResult<Self> {
        toml::from_str(text).map_err(|e| DbError::Configuration(e.to_string()))
    }

    /// Load a configuration file.
    ///
    /// # Errors
    ///
    /// `Io` if the file cannot be read, `Configuration` if it does not parse.
    pub fn from_toml_file(path: impl AsRef<Path>) -> DbResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Check the settings before anything touches the disk.
    pub fn validate(&self) -> DbResult<()> {
        if self.path.as_os_str().is_empty() {
            return Err(DbError::Configuration("path is empty".into()));
        }
        if self.table_name.is_empty() || self.table_name.starts_with("__") {
            return Err(DbError::Configuration(format!(
                "invalid table name '{}'",
                self.table_name
            )));
        }
        if self.max_size == 0 || self.max_size > isize::MAX as usize {
            return Err(DbError::Configuration(format!("max_size {} is out of range", self.max_size)));
        }
        if self.growth_step > self.max_size {
            return Err(DbError::Configuration(format!(
                "growth_step {} exceeds max_size {}",
                self.growth_step, self.max_size
            )));
        }
        // The catalog takes one slot.
        if self.max_tables < 2 {
            return Err(DbError::Configuration("max_tables must be at least 2".into()));
        }
        if self.enumeration_batch == 0 {
            return Err(DbError::Configuration("enumeration_batch must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(DbError::Configuration("retry.max_attempts must be positive".into()));
        }
        Ok(())
    }
}

impl Default for DictionaryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            table_name: DEFAULT_TABLE_NAME.to_string(),
            max_size: 1 << 30,
            growth_step: 16 << 20,
            max_tables: 32,
            sync_mode: SyncMode::Durable,
            max_pooled_sessions: 8,
            enumeration_batch: 64,
            retry: RetryPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdbx_base::LockWait;

    #[test]
    fn test_defaults_and_builders() {
        let config = DictionaryConfig::new("/tmp/dict")
            .with_table_name("settings")
            .with_enumeration_batch(8)
            .with_retry(RetryPolicy::new(3, LockWait::Try));
        assert_eq!(config.path, PathBuf::from("/tmp/dict"));
        assert_eq!(config.table_name, "settings");
        assert_eq!(config.max_size, 1 << 30);
        assert_eq!(config.enumeration_batch, 8);
        assert_eq!(config.retry.lock_wait, LockWait::Try);
        config.validate().expect("valid config");
    }

    #[test]
    fn test_from_toml_fills_defaults() {
        let config = DictionaryConfig::from_toml_str(
            r#"
            path = "/data/dict"
            sync_mode = "safe_no_sync"

            [retry]
            lock_wait = "try"
            "#,
        )
        .expect("Failed to parse config");
        assert_eq!(config.path, PathBuf::from("/data/dict"));
        assert_eq!(config.sync_mode, SyncMode::SafeNoSync);
        assert_eq!(config.retry.lock_wait, LockWait::Try);
        assert_eq!(config.retry.max_attempts, 64);
        assert_eq!(config.table_name, DEFAULT_TABLE_NAME);
    }

    #[test]
    fn test_bad_toml_is_configuration_error() {
        let err = DictionaryConfig::from_toml_str("max_size = \"big\"").unwrap_err();
        assert!(matches!(err, DbError::Configuration(_)));
    }

    #[test]
    fn test_from_toml_file() {
        let dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let file = dir.path().join("dictionary.toml");
        std::fs::write(&file, "path = \"x\"\nenumeration_batch = 5\n").expect("Failed to write config");
        let config = DictionaryConfig::from_toml_file(&file).expect("Failed to load config");
        assert_eq!(config.enumeration_batch, 5);

        let missing = DictionaryConfig::from_toml_file(dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(DbError::Io(_))));
    }

    #[test]
    fn test_validate_rejects() {
        let base = DictionaryConfig::new("/tmp/dict");
        let cases = [
            DictionaryConfig::default(),
            base.clone().with_table_name(""),
            base.clone().with_table_name("__catalog"),
            base.clone().with_max_size(0),
            base.clone().with_growth_step(2 << 30),
            base.clone().with_max_tables(1),
            base.clone().with_enumeration_batch(0),
            base.clone().with_retry(RetryPolicy::new(0, LockWait::Block)),
        ];
        for config in cases {
            assert!(
                matches!(config.validate(), Err(DbError::Configuration(_))),
                "{:?} should be rejected",
                config
            );
        }
    }
}
