//! Storage root resolution and project hashing.
//!
//! Layout:
//!
//! ```text
//! ~/.session-recorder/
//! └── tmp/
//!     └── {project-hash}/
//!         └── chats/
//!             ├── session-2026-01-04T10-00-00-3f2a9c1e.jsonl
//!             └── {session-id}.lock
//! ```

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use super::{ConfigError, ConfigResult};

/// Environment variable overriding the storage root.
pub const HOME_ENV_VAR: &str = "SESSION_RECORDER_HOME";

const DEFAULT_DIR_NAME: &str = ".session-recorder";

#[derive(Clone, Debug)]
pub struct StoragePaths {
    base_dir: PathBuf,
}

impl StoragePaths {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Resolve the root from `SESSION_RECORDER_HOME`, falling back to
    /// `~/.session-recorder`.
    pub fn from_env() -> ConfigResult<Self> {
        match std::env::var_os(HOME_ENV_VAR) {
            Some(dir) if !dir.is_empty() => Ok(Self::new(dir)),
            _ => {
                let base = directories::BaseDirs::new()
                    .ok_or(ConfigError::MissingHomeDir { var: HOME_ENV_VAR })?;
                Ok(Self::new(base.home_dir().join(DEFAULT_DIR_NAME)))
            }
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn project_dir(&self, project_root: &Path) -> PathBuf {
        self.base_dir.join("tmp").join(project_hash(project_root))
    }

    pub fn chats_dir(&self, project_root: &Path) -> PathBuf {
        self.project_dir(project_root).join("chats")
    }
}

/// Stable hash identifying a project root: lowercase hex SHA-256 of the
/// canonical path (the raw path if it cannot be canonicalized).
pub fn project_hash(project_root: &Path) -> String {
    let canonical =
        std::fs::canonicalize(project_root).unwrap_or_else(|_| project_root.to_path_buf());
    let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
