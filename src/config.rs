use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Server configuration for a single bookie process.
///
/// All durations are milliseconds. Relative directories are resolved against
/// the config file location by [`ServerConfig::load`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Advertised address used to build the bookie id.
    pub listen_address: String,
    pub bookie_port: u16,

    pub journal_dir: PathBuf,
    pub ledger_dirs: Vec<PathBuf>,
    /// Separate index directories; ledger dirs are reused when empty.
    pub index_dirs: Vec<PathBuf>,

    /// Coordinator namespace root; registration and cookies live below it.
    pub ledgers_root: String,
    pub session_timeout_ms: u64,
    pub reregister_backoff_start_ms: u64,
    pub reregister_backoff_max_ms: u64,
    pub reregister_max_attempts: usize,

    /// Group commit flushes when this many bytes are pending.
    pub group_commit_bytes: usize,
    /// Group commit flushes after this long even if below the byte bound.
    pub max_group_wait_ms: u64,
    /// Bound of the journal queue; a full queue blocks `append` callers.
    pub journal_queue_len: usize,
    pub max_segment_bytes: u64,
    /// Old journal segments kept after a checkpoint for manual recovery.
    pub max_backup_journals: usize,

    /// Interval of periodic checkpoints; 0 disables the ticker.
    pub flush_interval_ms: u64,

    pub disk_usage_threshold: f32,
    pub disk_usage_warn_threshold: f32,
    pub disk_check_interval_ms: u64,

    /// When false, conditions that would enter read-only mode shut down
    /// the bookie instead.
    pub readonly_mode_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1".to_string(),
            bookie_port: 3181,
            journal_dir: PathBuf::from("journal"),
            ledger_dirs: vec![PathBuf::from("ledgers")],
            index_dirs: Vec::new(),
            ledgers_root: "/ledgers".to_string(),
            session_timeout_ms: 10_000,
            reregister_backoff_start_ms: 100,
            reregister_backoff_max_ms: 10_000,
            reregister_max_attempts: 8,
            group_commit_bytes: 512 * 1024,
            max_group_wait_ms: 2,
            journal_queue_len: 10_000,
            max_segment_bytes: 2 * 1024 * 1024 * 1024,
            max_backup_journals: 5,
            flush_interval_ms: 10_000,
            disk_usage_threshold: 0.95,
            disk_usage_warn_threshold: 0.90,
            disk_check_interval_ms: 10_000,
            readonly_mode_enabled: true,
        }
    }
}

impl ServerConfig {
    /// Loads a JSON config file and resolves relative directories against it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: ServerConfig =
            serde_json::from_reader(file).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        config.journal_dir = resolve_relative(&base, &config.journal_dir);
        config.ledger_dirs = config
            .ledger_dirs
            .iter()
            .map(|dir| resolve_relative(&base, dir))
            .collect();
        config.index_dirs = config
            .index_dirs
            .iter()
            .map(|dir| resolve_relative(&base, dir))
            .collect();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ledger_dirs.is_empty() {
            return Err(ConfigError::Invalid {
                reason: "at least one ledger directory is required".to_string(),
            });
        }
        if self.disk_usage_warn_threshold > self.disk_usage_threshold {
            return Err(ConfigError::Invalid {
                reason: "disk_usage_warn_threshold exceeds disk_usage_threshold".to_string(),
            });
        }
        if self.journal_queue_len == 0 {
            return Err(ConfigError::Invalid {
                reason: "journal_queue_len must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Identity under which this bookie registers and writes cookies.
    pub fn bookie_id(&self) -> String {
        format!("{}:{}", self.listen_address, self.bookie_port)
    }

    /// Registration root for writable bookies.
    pub fn available_path(&self) -> String {
        format!("{}/available", self.ledgers_root)
    }

    /// Registration root for read-only bookies; created lazily.
    pub fn readonly_path(&self) -> String {
        format!("{}/readonly", self.available_path())
    }

    pub fn cookie_path(&self) -> String {
        format!("{}/cookies/{}", self.ledgers_root, self.bookie_id())
    }

    pub fn instance_id_path(&self) -> String {
        format!("{}/INSTANCEID", self.ledgers_root)
    }
}

/// If `path` is relative, joins it to `base`; otherwise returns it unchanged.
pub fn resolve_relative(base: &Path, path: &Path) -> PathBuf {
    if path.is_relative() {
        base.join(path)
    } else {
        path.to_path_buf()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn load_resolves_relative_dirs_against_config_location() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("bookie.json");
        fs::write(
            &config_path,
            r#"{"journal_dir": "j", "ledger_dirs": ["l0", "/abs/l1"]}"#,
        )
        .unwrap();
        let config = ServerConfig::load(&config_path).unwrap();
        assert_eq!(config.journal_dir, dir.path().join("j"));
        assert_eq!(config.ledger_dirs[0], dir.path().join("l0"));
        assert_eq!(config.ledger_dirs[1], PathBuf::from("/abs/l1"));
    }

    #[test]
    fn validate_rejects_empty_ledger_dirs() {
        let config = ServerConfig {
            ledger_dirs: Vec::new(),
            ..ServerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn registration_paths_derive_from_root() {
        let config = ServerConfig::default();
        assert_eq!(config.available_path(), "/ledgers/available");
        assert_eq!(config.readonly_path(), "/ledgers/available/readonly");
        assert!(config.cookie_path().starts_with("/ledgers/cookies/"));
    }
}
