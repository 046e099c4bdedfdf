//! Project-scoped session management: discovery, retention, resume and the
//! command handlers built on them.

pub mod commands;
pub mod discovery;
pub mod resume;
pub mod retention;
pub mod shutdown;

pub use commands::{
    CommandContext, cleanup_command, continue_command, delete_session_command,
    list_sessions_command,
};
pub use discovery::{ResolveError, SessionSummary, list_sessions, resolve_session_ref};
pub use resume::{ResumeRequest, ResumeStage, ResumedSession, resume_session};
pub use retention::{CleanupReport, RetentionPolicy, cleanup_sessions};
pub use shutdown::{RecordingSession, install_shutdown_handler};

use std::path::PathBuf;

use thiserror::Error;

use crate::lock::LockError;
use crate::recording::RecordingError;
use crate::replay::ReplayError;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Replay(#[from] ReplayError),

    #[error(transparent)]
    Recording(#[from] RecordingError),

    #[error("Storage error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SessionError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SessionError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;
