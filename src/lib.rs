//! # session-recorder
//!
//! Event-sourced, append-only recording of conversational agent sessions.
//!
//! Every turn is appended to a per-session JSONL file in the background.
//! Sessions can be replayed to rebuild history, resumed with `--continue`,
//! listed and deleted, with a per-session lock file keeping two processes
//! from writing the same session.
//!
//! ## Recording a session
//!
//! ```rust,no_run
//! use session_recorder::{
//!     HistoryService, RecordingConfig, RecordingSession, SessionLockManager, StoragePaths,
//!     config::{new_session_id, project_hash},
//!     types::Content,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), session_recorder::Error> {
//!     let root = std::env::current_dir()?;
//!     let chats_dir = StoragePaths::from_env()?.chats_dir(&root);
//!     let config = RecordingConfig::builder()
//!         .session_id(new_session_id())
//!         .project_hash(project_hash(&root))
//!         .chats_dir(&chats_dir)
//!         .provider("anthropic")
//!         .model("claude-sonnet-4-5")
//!         .build()?;
//!
//!     let mut history = HistoryService::new();
//!     let locks = SessionLockManager::new(&chats_dir);
//!     let session = RecordingSession::start(config, &history, &locks)?;
//!
//!     history.add(Content::user("Fix the bug"));
//!     history.add(Content::model("Done."));
//!     session.integration().flush_at_turn_boundary().await?;
//!
//!     session.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Replaying
//!
//! ```rust,no_run
//! # async fn example(path: &std::path::Path) -> Result<(), session_recorder::Error> {
//! let result = session_recorder::replay_session(path, "project-hash").await?;
//! println!("{} items, last seq {}", result.history.len(), result.last_seq);
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod history;
pub mod integration;
pub mod lock;
pub mod observability;
pub mod recording;
pub mod replay;
pub mod session;
pub mod types;

pub use config::{ConfigError, RecordingConfig, RecordingConfigBuilder, StoragePaths, SyncMode};
pub use history::{HistoryObserver, HistoryService, Subscription};
pub use integration::RecordingIntegration;
pub use lock::{LockConfig, LockError, LockHandle, ReleaseOutcome, SessionLockManager};
pub use recording::{
    EventType, RecordEvent, RecorderState, RecordingError, SessionRecordLine,
    SessionRecordingService, Severity,
};
pub use replay::{
    ReplayError, ReplayOptions, ReplayResult, ReplayStats, SessionEventRecord, SessionHeader,
    SessionMetadata, read_session_header, replay_session, replay_session_sync,
    replay_session_with,
};
pub use session::{
    CleanupReport, RecordingSession, ResolveError, ResumeRequest, ResumedSession, RetentionPolicy,
    SessionError, SessionSummary, cleanup_sessions, list_sessions, resolve_session_ref,
    resume_session,
};

/// Error type for session-recorder operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid or incomplete configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Writing the session file failed.
    #[error(transparent)]
    Recording(#[from] RecordingError),

    /// The session file cannot be replayed.
    #[error(transparent)]
    Replay(#[from] ReplayError),

    /// Lock contention or lock file failure.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Discovery, resume or command failure.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// File system operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error category for unified error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid configuration or environment
    Configuration,
    /// Session held by another live process
    Contention,
    /// Session file unusable (missing header, wrong project)
    Corruption,
    /// File system failures
    Storage,
    /// Unknown or ambiguous session reference
    Reference,
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_) => ErrorCategory::Configuration,
            Error::Recording(_) | Error::Io(_) => ErrorCategory::Storage,
            Error::Replay(e) => replay_category(e),
            Error::Lock(e) => lock_category(e),
            Error::Session(e) => match e {
                SessionError::Resolve(_) => ErrorCategory::Reference,
                SessionError::Lock(e) => lock_category(e),
                SessionError::Replay(e) => replay_category(e),
                SessionError::Recording(_) | SessionError::Io { .. } => ErrorCategory::Storage,
            },
        }
    }

    /// Errors the user can act on; the command layer exits with status 1.
    pub fn is_user_error(&self) -> bool {
        self.category() != ErrorCategory::Storage
    }

    pub fn is_contention(&self) -> bool {
        self.category() == ErrorCategory::Contention
    }
}

fn replay_category(err: &ReplayError) -> ErrorCategory {
    match err {
        ReplayError::Io { .. } | ReplayError::TaskJoin(_) => ErrorCategory::Storage,
        ReplayError::EmptyFile { .. }
        | ReplayError::MissingSessionStart { .. }
        | ReplayError::ProjectHashMismatch { .. } => ErrorCategory::Corruption,
    }
}

fn lock_category(err: &LockError) -> ErrorCategory {
    match err {
        LockError::InUse { .. } => ErrorCategory::Contention,
        LockError::Io { .. } => ErrorCategory::Storage,
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let in_use: Error = LockError::InUse {
            session_id: "abc".into(),
            pid: Some(42),
        }
        .into();
        assert_eq!(in_use.category(), ErrorCategory::Contention);
        assert!(in_use.is_user_error());
        assert!(in_use.is_contention());

        let mismatch: Error = SessionError::Replay(ReplayError::ProjectHashMismatch {
            expected: "H".into(),
            found: "X".into(),
        })
        .into();
        assert_eq!(mismatch.category(), ErrorCategory::Corruption);

        let resolve: Error = SessionError::Resolve(ResolveError::NoSessions).into();
        assert_eq!(resolve.category(), ErrorCategory::Reference);

        let io: Error = std::io::Error::other("disk").into();
        assert_eq!(io.category(), ErrorCategory::Storage);
        assert!(!io.is_user_error());
    }

    #[test]
    fn test_error_display_is_transparent() {
        let err: Error = LockError::InUse {
            session_id: "abc".into(),
            pid: Some(42),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Session abc is in use by another process (pid 42)"
        );
    }
}
