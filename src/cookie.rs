use crate::config::ServerConfig;
use crate::coordinator::{Coordinator, CoordinatorError};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Fixed name of the cookie file inside every data directory.
pub const VERSION_FILENAME: &str = "VERSION";

/// Current directory layout version.
pub const LAYOUT_VERSION: u32 = 3;

/// Identity record tying the on-disk layout to the cluster state.
///
/// Written once per new installation to every local directory and to the
/// coordinator; any later divergence is fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub layout_version: u32,
    pub instance_id: Option<String>,
    pub bookie_id: String,
    pub journal_dir: String,
    pub ledger_dirs: Vec<String>,
    pub index_dirs: Vec<String>,
}

impl Cookie {
    pub fn generate(config: &ServerConfig) -> Self {
        Self {
            layout_version: LAYOUT_VERSION,
            instance_id: None,
            bookie_id: config.bookie_id(),
            journal_dir: config.journal_dir.display().to_string(),
            ledger_dirs: config
                .ledger_dirs
                .iter()
                .map(|dir| dir.display().to_string())
                .collect(),
            index_dirs: config
                .index_dirs
                .iter()
                .map(|dir| dir.display().to_string())
                .collect(),
        }
    }

    pub fn with_instance_id(mut self, instance_id: Option<String>) -> Self {
        self.instance_id = instance_id;
        self
    }

    /// Field-by-field comparison; the first differing field is reported.
    pub fn verify(&self, other: &Cookie) -> Result<(), CookieError> {
        let fields = [
            ("layout_version", self.layout_version != other.layout_version),
            ("instance_id", self.instance_id != other.instance_id),
            ("bookie_id", self.bookie_id != other.bookie_id),
            ("journal_dir", self.journal_dir != other.journal_dir),
            ("ledger_dirs", self.ledger_dirs != other.ledger_dirs),
            ("index_dirs", self.index_dirs != other.index_dirs),
        ];
        for (field, differs) in fields {
            if differs {
                return Err(CookieError::Mismatch {
                    field: field.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn read_from_directory(dir: &Path) -> Result<Cookie, CookieError> {
        let path = dir.join(VERSION_FILENAME);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(CookieError::Missing { path })
            }
            Err(source) => return Err(CookieError::Io { path, source }),
        };
        serde_json::from_slice(&bytes).map_err(|source| CookieError::Corrupt { path, source })
    }

    /// Replaces `<dir>/VERSION` atomically, so a crash mid-write leaves
    /// either the old cookie or the new one, never a truncated file.
    pub fn write_to_directory(&self, dir: &Path) -> Result<(), CookieError> {
        let path = dir.join(VERSION_FILENAME);
        let tmp = dir.join(format!(".{VERSION_FILENAME}.tmp"));
        let payload = serde_json::to_vec_pretty(self).map_err(CookieError::Serialize)?;
        let write = || -> io::Result<()> {
            {
                let mut file = File::create(&tmp)?;
                file.write_all(&payload)?;
                file.sync_all()?;
            }
            fs::rename(&tmp, &path)?;
            File::open(dir)?.sync_all()
        };
        write().map_err(|source| CookieError::Io {
            path: path.clone(),
            source,
        })
    }

    pub fn read_from_coordinator(
        coordinator: &dyn Coordinator,
        config: &ServerConfig,
    ) -> Result<Option<Cookie>, CookieError> {
        match coordinator.read_node(&config.cookie_path())? {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|source| CookieError::Corrupt {
                    path: PathBuf::from(config.cookie_path()),
                    source,
                }),
        }
    }

    pub fn write_to_coordinator(
        &self,
        coordinator: &dyn Coordinator,
        config: &ServerConfig,
    ) -> Result<(), CookieError> {
        let payload = serde_json::to_vec(self).map_err(CookieError::Serialize)?;
        coordinator.set_node(&config.cookie_path(), &payload)?;
        Ok(())
    }
}

/// Verifies that the environment matches the first run: the coordinator
/// cookie, every directory cookie, and the generated master cookie must
/// agree. A wholly fresh environment is initialized by writing the master
/// cookie everywhere, then to the coordinator.
pub fn check_environment(
    config: &ServerConfig,
    coordinator: &dyn Coordinator,
    all_dirs: &[PathBuf],
) -> Result<(), CookieError> {
    let instance_id = match coordinator.read_node(&config.instance_id_path())? {
        Some(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        None => {
            warn!("event=instance_id_missing root={}", config.ledgers_root);
            None
        }
    };
    let master = Cookie::generate(config).with_instance_id(instance_id);

    let new_env = match Cookie::read_from_coordinator(coordinator, config)? {
        Some(remote) => {
            master.verify(&remote)?;
            false
        }
        None => true,
    };

    let mut missing_dirs = Vec::new();
    for dir in all_dirs {
        match Cookie::read_from_directory(dir) {
            Ok(local) => local.verify(&master)?,
            Err(CookieError::Missing { .. }) => missing_dirs.push(dir.clone()),
            Err(err) => return Err(err),
        }
    }

    if !new_env && !missing_dirs.is_empty() {
        error!(
            "event=cookie_missing_locally dirs={:?} coordinator_cookie=present",
            missing_dirs
        );
        return Err(CookieError::MissingInInitializedEnv { dirs: missing_dirs });
    }

    if new_env {
        for dir in all_dirs {
            master.write_to_directory(dir)?;
        }
        master.write_to_coordinator(coordinator, config)?;
        info!(
            "event=environment_initialized bookie={} dirs={}",
            master.bookie_id,
            all_dirs.len()
        );
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum CookieError {
    #[error("cookie missing at {path}")]
    Missing { path: PathBuf },
    #[error("cookie missing in initialized environment: {dirs:?}")]
    MissingInInitializedEnv { dirs: Vec<PathBuf> },
    #[error("cookie field {field} does not match")]
    Mismatch { field: String },
    #[error("cookie serialization failed: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("unreadable cookie at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("cookie I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::MemoryCoordinator;
    use tempfile::tempdir;

    fn config_for(dir: &Path) -> ServerConfig {
        ServerConfig {
            journal_dir: dir.join("journal"),
            ledger_dirs: vec![dir.join("ledgers")],
            ..ServerConfig::default()
        }
    }

    #[test]
    fn cookie_roundtrips_through_directory() {
        let dir = tempdir().unwrap();
        let config = config_for(dir.path());
        let cookie = Cookie::generate(&config);
        cookie.write_to_directory(dir.path()).unwrap();
        let loaded = Cookie::read_from_directory(dir.path()).unwrap();
        assert_eq!(cookie, loaded);
        // the staging file never outlives the rename
        assert!(!dir.path().join(format!(".{VERSION_FILENAME}.tmp")).exists());

        // rewriting replaces the cookie in place
        let mut updated = cookie.clone();
        updated.instance_id = Some("cluster-a".to_string());
        updated.write_to_directory(dir.path()).unwrap();
        assert_eq!(Cookie::read_from_directory(dir.path()).unwrap(), updated);
    }

    #[test]
    fn verify_reports_first_differing_field() {
        let dir = tempdir().unwrap();
        let config = config_for(dir.path());
        let cookie = Cookie::generate(&config);
        let mut other = cookie.clone();
        other.bookie_id = "10.0.0.9:3181".to_string();
        let err = cookie.verify(&other).unwrap_err();
        assert!(matches!(err, CookieError::Mismatch { field } if field == "bookie_id"));
    }

    #[test]
    fn fresh_environment_is_initialized_everywhere() {
        let dir = tempdir().unwrap();
        let config = config_for(dir.path());
        let coordinator = MemoryCoordinator::new();
        let dirs = vec![dir.path().to_path_buf()];
        check_environment(&config, &coordinator, &dirs).unwrap();
        assert!(dir.path().join(VERSION_FILENAME).exists());
        assert!(Cookie::read_from_coordinator(&coordinator, &config)
            .unwrap()
            .is_some());
        // second run verifies cleanly
        check_environment(&config, &coordinator, &dirs).unwrap();
    }

    #[test]
    fn missing_local_cookie_in_initialized_env_is_fatal() {
        let dir = tempdir().unwrap();
        let config = config_for(dir.path());
        let coordinator = MemoryCoordinator::new();
        let dirs = vec![dir.path().to_path_buf()];
        check_environment(&config, &coordinator, &dirs).unwrap();
        fs::remove_file(dir.path().join(VERSION_FILENAME)).unwrap();
        let err = check_environment(&config, &coordinator, &dirs).unwrap_err();
        assert!(matches!(err, CookieError::MissingInInitializedEnv { .. }));
    }

    #[test]
    fn instance_id_divergence_is_fatal() {
        let dir = tempdir().unwrap();
        let config = config_for(dir.path());
        let coordinator = MemoryCoordinator::new();
        let dirs = vec![dir.path().to_path_buf()];
        check_environment(&config, &coordinator, &dirs).unwrap();
        coordinator
            .set_node(&config.instance_id_path(), b"cluster-b")
            .unwrap();
        let err = check_environment(&config, &coordinator, &dirs).unwrap_err();
        assert!(matches!(err, CookieError::Mismatch { field } if field == "instance_id"));
    }
}
