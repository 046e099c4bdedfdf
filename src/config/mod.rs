//! Recorder configuration and on-disk layout.
//!
//! ```rust,no_run
//! use session_recorder::config::{RecordingConfig, StoragePaths, new_session_id, project_hash};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let root = std::env::current_dir()?;
//! let paths = StoragePaths::from_env()?;
//! let config = RecordingConfig::builder()
//!     .session_id(new_session_id())
//!     .project_hash(project_hash(&root))
//!     .chats_dir(paths.chats_dir(&root))
//!     .provider("anthropic")
//!     .model("claude-sonnet-4-5")
//!     .build()?;
//! # Ok(())
//! # }
//! ```

mod paths;

pub use paths::{HOME_ENV_VAR, StoragePaths, project_hash};

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while building configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid value for {key}: {message}")]
    InvalidValue {
        /// The key with invalid value
        key: String,
        /// Error message
        message: String,
    },

    /// No home directory could be resolved and no override was given
    #[error("Could not determine home directory (set {var} to override)")]
    MissingHomeDir { var: &'static str },
}

/// Result type for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Sync mode for file operations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncMode {
    /// No explicit sync (OS buffering only).
    #[default]
    None,
    /// `sync_data` after every drain pass (safest, slowest).
    OnWrite,
}

/// Everything a [`SessionRecordingService`](crate::recording::SessionRecordingService)
/// needs to know about the session it records.
#[derive(Clone, Debug)]
pub struct RecordingConfig {
    pub session_id: String,
    pub project_hash: String,
    /// Per-project directory holding session files and lock files.
    pub chats_dir: PathBuf,
    pub workspace_dirs: Vec<String>,
    pub provider: String,
    pub model: String,
    pub sync_mode: SyncMode,
}

impl RecordingConfig {
    pub fn builder() -> RecordingConfigBuilder {
        RecordingConfigBuilder::default()
    }

    /// Same configuration, recording under another session ID (used on resume).
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }
}

/// Builder for RecordingConfig.
#[derive(Default)]
pub struct RecordingConfigBuilder {
    session_id: Option<String>,
    project_hash: Option<String>,
    chats_dir: Option<PathBuf>,
    workspace_dirs: Vec<String>,
    provider: Option<String>,
    model: Option<String>,
    sync_mode: Option<SyncMode>,
}

impl RecordingConfigBuilder {
    pub fn session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn project_hash(mut self, hash: impl Into<String>) -> Self {
        self.project_hash = Some(hash.into());
        self
    }

    pub fn chats_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.chats_dir = Some(dir.into());
        self
    }

    pub fn workspace_dirs<I, S>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.workspace_dirs = dirs.into_iter().map(Into::into).collect();
        self
    }

    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = Some(mode);
        self
    }

    pub fn build(self) -> ConfigResult<RecordingConfig> {
        let session_id = required("session_id", self.session_id)?;
        let project_hash = required("project_hash", self.project_hash)?;
        let chats_dir = self.chats_dir.ok_or_else(|| ConfigError::InvalidValue {
            key: "chats_dir".into(),
            message: "must be set".into(),
        })?;

        Ok(RecordingConfig {
            session_id,
            project_hash,
            chats_dir,
            workspace_dirs: self.workspace_dirs,
            provider: self.provider.unwrap_or_default(),
            model: self.model.unwrap_or_default(),
            sync_mode: self.sync_mode.unwrap_or_default(),
        })
    }
}

/// Fresh random session identifier.
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn required(key: &str, value: Option<String>) -> ConfigResult<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be a non-empty string".into(),
        }),
    }
}
