//! Append-only session recording.
//!
//! [`SessionRecordingService`] accepts events synchronously and hands them to a
//! single background task that appends them to the session file. No file
//! exists until the first `content` event arrives; everything enqueued before
//! that is buffered in memory and flushed ahead of it.

pub mod envelope;
mod service;
mod writer;

pub use envelope::{
    CompressedPayload, ContentPayload, DirectoriesChangedPayload, EventType,
    ProviderSwitchPayload, RawRecordLine, RecordEvent, RewindPayload, SCHEMA_VERSION,
    SessionEventPayload, SessionRecordLine, SessionStartPayload, Severity,
};
pub use service::{
    SESSION_FILE_EXTENSION, SESSION_FILE_PREFIX, SessionRecordingService, session_file_name,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("Session write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Session writer task is no longer running")]
    WriterClosed,
}

pub type RecordingResult<T> = std::result::Result<T, RecordingError>;

/// Lifecycle of a recorder instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecorderState {
    /// No file yet; events are held in memory until the first content item.
    Buffering,
    /// File materialized; events drain to disk in the background.
    Recording,
    /// Unrecoverable write error (disk full, permissions); events are dropped.
    Disabled,
    /// Shut down explicitly; every call is a no-op.
    Disposed,
}

impl RecorderState {
    pub fn accepts_events(&self) -> bool {
        matches!(self, RecorderState::Buffering | RecorderState::Recording)
    }
}

/// Whether an I/O failure should disable recording instead of surfacing as an error.
///
/// Out-of-space and permission failures will not heal within the session, so
/// the recorder stops writing and the application keeps running.
pub(crate) fn is_disabling_error(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;

    matches!(
        err.kind(),
        ErrorKind::StorageFull
            | ErrorKind::QuotaExceeded
            | ErrorKind::PermissionDenied
            | ErrorKind::ReadOnlyFilesystem
    )
}
