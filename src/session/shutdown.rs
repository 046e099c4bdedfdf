//! Recording lifecycle for one running session and its exit path.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

use super::SessionResult;
use super::resume::ResumedSession;
use crate::config::RecordingConfig;
use crate::history::HistoryService;
use crate::integration::RecordingIntegration;
use crate::lock::{LockHandle, ReleaseOutcome, SessionLockManager};
use crate::recording::{RecordingResult, SessionRecordingService};

/// Exit status used after an interrupt-driven shutdown.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Recorder, history bridge and lock of the running session.
pub struct RecordingSession {
    recording: Arc<SessionRecordingService>,
    integration: Arc<RecordingIntegration>,
    lock: Mutex<Option<LockHandle>>,
}

impl RecordingSession {
    /// Start recording a new session into `history`.
    ///
    /// The lock is taken before anything else so a concurrent `--continue`
    /// cannot pick up the session; the data file appears only with the first
    /// content item.
    pub fn start(
        config: RecordingConfig,
        history: &HistoryService,
        locks: &SessionLockManager,
    ) -> SessionResult<Self> {
        let lock = locks.acquire(&config.session_id)?;
        let recording = Arc::new(SessionRecordingService::new(config));
        let integration = RecordingIntegration::new(recording.clone());
        integration.subscribe_to_history(history);

        Ok(Self {
            recording,
            integration,
            lock: Mutex::new(Some(lock)),
        })
    }

    /// Take over the recorder of a resumed session. Returns the seeded history.
    pub fn from_resumed(resumed: ResumedSession) -> (Self, HistoryService) {
        let session = Self {
            recording: resumed.recording,
            integration: resumed.integration,
            lock: Mutex::new(Some(resumed.lock)),
        };
        (session, resumed.history)
    }

    pub fn recording(&self) -> &Arc<SessionRecordingService> {
        &self.recording
    }

    pub fn integration(&self) -> &Arc<RecordingIntegration> {
        &self.integration
    }

    pub fn session_id(&self) -> &str {
        self.recording.session_id()
    }

    /// Flush, stop recording and release the lock. Safe to call repeatedly.
    ///
    /// The lock is released even when the flush fails; the flush error is
    /// returned.
    pub async fn close(&self) -> RecordingResult<()> {
        let flushed = self.recording.flush().await;
        if let Err(e) = &flushed {
            tracing::warn!(
                session_id = %self.session_id(),
                error = %e,
                "Final session flush failed"
            );
        }

        self.integration.unsubscribe();
        self.recording.dispose();

        let lock = self
            .lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut lock) = lock
            && let ReleaseOutcome::Failed(reason) = lock.release()
        {
            tracing::warn!(
                session_id = %self.session_id(),
                reason = %reason,
                "Session lock left behind on shutdown"
            );
        }

        flushed
    }

    pub fn is_closed(&self) -> bool {
        self.lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl std::fmt::Debug for RecordingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingSession")
            .field("session_id", &self.session_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// On Ctrl-C, close `session` within `timeout` and exit the process with
/// status 130. Everything is best effort.
pub fn install_shutdown_handler(session: Arc<RecordingSession>, timeout: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Could not listen for interrupt signal");
            return;
        }

        tracing::debug!(session_id = %session.session_id(), "Interrupted; closing session");
        match tokio::time::timeout(timeout, session.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Session not fully saved on exit"),
            Err(_) => tracing::warn!(?timeout, "Timed out saving session on exit"),
        }
        std::process::exit(INTERRUPTED_EXIT_CODE);
    })
}
