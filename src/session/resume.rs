//! `--continue`: reopen a recorded session and keep appending to it.
//!
//! Stages run strictly in order. Failing to lock or replay stops the flow
//! before any state is created; the lock is released on the way out.

use std::path::PathBuf;
use std::sync::Arc;

use super::SessionResult;
use super::discovery::{ResolveError, SessionSummary, list_sessions, resolve_session_ref};
use crate::config::RecordingConfig;
use crate::history::HistoryService;
use crate::integration::RecordingIntegration;
use crate::lock::{LockError, LockHandle, SessionLockManager};
use crate::recording::SessionRecordingService;
use crate::replay::{ReplayOptions, SessionEventRecord, SessionMetadata, replay_session_with};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResumeStage {
    Discover,
    LockAcquire,
    Replay,
    SeedHistory,
    ReconstructUi,
    ReopenForAppend,
    Recording,
}

impl std::fmt::Display for ResumeStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResumeStage::Discover => "discover",
            ResumeStage::LockAcquire => "lock_acquire",
            ResumeStage::Replay => "replay",
            ResumeStage::SeedHistory => "seed_history",
            ResumeStage::ReconstructUi => "reconstruct_ui",
            ResumeStage::ReopenForAppend => "reopen_for_append",
            ResumeStage::Recording => "recording",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug)]
pub struct ResumeRequest {
    /// Session reference; `None` picks the newest session not in use.
    pub reference: Option<String>,
    /// Current invocation's configuration. Its session ID is replaced by the
    /// resumed one; provider, model and workspace take precedence over the
    /// recorded values.
    pub config: RecordingConfig,
    pub replay_options: ReplayOptions,
}

impl ResumeRequest {
    pub fn new(config: RecordingConfig) -> Self {
        Self {
            reference: None,
            config,
            replay_options: ReplayOptions::default(),
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_replay_options(mut self, options: ReplayOptions) -> Self {
        self.replay_options = options;
        self
    }
}

/// Everything the host needs to continue a session.
#[derive(Debug)]
pub struct ResumedSession {
    pub session_id: String,
    pub file_path: PathBuf,
    pub history: HistoryService,
    /// Metadata as recorded, before the current configuration was applied.
    pub recorded_metadata: SessionMetadata,
    pub recording: Arc<SessionRecordingService>,
    pub integration: Arc<RecordingIntegration>,
    pub lock: LockHandle,
    pub session_events: Vec<SessionEventRecord>,
    pub warnings: Vec<String>,
    pub provider_switched: bool,
}

pub async fn resume_session(
    request: ResumeRequest,
    locks: &SessionLockManager,
) -> SessionResult<ResumedSession> {
    let config = &request.config;

    enter(ResumeStage::Discover);
    let sessions = list_sessions(&config.chats_dir, &config.project_hash)?;
    let target = select_session(request.reference.as_deref(), &sessions, locks)?.clone();

    enter(ResumeStage::LockAcquire);
    let lock = locks.acquire(&target.session_id)?;

    enter(ResumeStage::Replay);
    let replayed = replay_session_with(
        &target.file_path,
        &config.project_hash,
        &request.replay_options,
    )
    .await?;

    enter(ResumeStage::SeedHistory);
    let history = HistoryService::from_items(replayed.history);

    // The host renders `history` and `session_events`; nothing to do here.
    enter(ResumeStage::ReconstructUi);

    enter(ResumeStage::ReopenForAppend);
    let session_config = config.clone().with_session_id(&target.session_id);
    let recording = Arc::new(SessionRecordingService::new(session_config));
    recording.initialize_for_resume(&target.file_path, replayed.last_seq);
    let integration = RecordingIntegration::new(recording.clone());
    integration.subscribe_to_history(&history);

    let recorded = replayed.metadata;
    let provider_switched = recorded.provider != config.provider || recorded.model != config.model;
    if provider_switched {
        integration.record_provider_switch(&config.provider, &config.model);
    }
    if !config.workspace_dirs.is_empty() && recorded.workspace_dirs != config.workspace_dirs {
        integration.record_directories_changed(config.workspace_dirs.clone());
    }

    enter(ResumeStage::Recording);
    tracing::info!(
        session_id = %target.session_id,
        path = %target.file_path.display(),
        items = history.len(),
        last_seq = replayed.last_seq,
        provider_switched,
        "Resumed session"
    );

    Ok(ResumedSession {
        session_id: target.session_id,
        file_path: target.file_path,
        history,
        recorded_metadata: recorded,
        recording,
        integration,
        lock,
        session_events: replayed.session_events,
        warnings: replayed.warnings,
        provider_switched,
    })
}

fn enter(stage: ResumeStage) {
    tracing::debug!(%stage, "Resume stage");
}

fn select_session<'a>(
    reference: Option<&str>,
    sessions: &'a [SessionSummary],
    locks: &SessionLockManager,
) -> SessionResult<&'a SessionSummary> {
    if let Some(reference) = reference {
        return Ok(resolve_session_ref(reference, sessions)?);
    }

    let newest = sessions.first().ok_or(ResolveError::NoSessions)?;
    match sessions.iter().find(|s| !locks.is_locked(&s.session_id)) {
        Some(available) => Ok(available),
        None => Err(LockError::InUse {
            session_id: newest.session_id.clone(),
            pid: locks.owner_pid(&newest.session_id),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::RecordEvent;
    use crate::session::SessionError;
    use crate::types::Content;
    use tempfile::TempDir;

    fn config(dir: &TempDir, id: &str, provider: &str) -> RecordingConfig {
        RecordingConfig::builder()
            .session_id(id)
            .project_hash("H")
            .chats_dir(dir.path())
            .provider(provider)
            .model("m1")
            .build()
            .unwrap()
    }

    async fn record(dir: &TempDir, id: &str, texts: &[&str]) -> PathBuf {
        let service = SessionRecordingService::new(config(dir, id, "p1"));
        for text in texts {
            service.enqueue(RecordEvent::content(Content::user(*text)));
        }
        service.flush().await.unwrap();
        service.get_file_path().unwrap()
    }

    #[tokio::test]
    async fn test_resume_continues_sequence_and_history() {
        let dir = TempDir::new().unwrap();
        let path = record(&dir, "first-session", &["a", "b"]).await;
        let locks = SessionLockManager::new(dir.path());

        let mut resumed = resume_session(
            ResumeRequest::new(config(&dir, "fresh-id", "p1")),
            &locks,
        )
        .await
        .unwrap();

        assert_eq!(resumed.session_id, "first-session");
        assert_eq!(resumed.file_path, path);
        assert_eq!(resumed.history.len(), 2);
        assert!(!resumed.provider_switched);
        assert!(locks.is_locked("first-session"));

        resumed.history.add(Content::model("c"));
        resumed.integration.flush_at_turn_boundary().await.unwrap();

        let replayed = crate::replay::replay_session(&path, "H").await.unwrap();
        assert_eq!(replayed.history.len(), 3);
        assert_eq!(replayed.last_seq, 4);
    }

    #[tokio::test]
    async fn test_resume_records_provider_switch() {
        let dir = TempDir::new().unwrap();
        let path = record(&dir, "s1", &["a"]).await;
        let locks = SessionLockManager::new(dir.path());

        let resumed = resume_session(
            ResumeRequest::new(config(&dir, "new", "p2")).with_reference("s1"),
            &locks,
        )
        .await
        .unwrap();
        assert!(resumed.provider_switched);
        resumed.recording.flush().await.unwrap();

        let replayed = crate::replay::replay_session(&path, "H").await.unwrap();
        assert_eq!(replayed.metadata.provider, "p2");
        assert_eq!(replayed.last_seq, 3);
    }

    #[tokio::test]
    async fn test_resume_refuses_locked_session() {
        let dir = TempDir::new().unwrap();
        record(&dir, "s1", &["a"]).await;
        let locks = SessionLockManager::new(dir.path());
        let _held = locks.acquire("s1").unwrap();

        let err = resume_session(
            ResumeRequest::new(config(&dir, "new", "p1")).with_reference("s1"),
            &locks,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SessionError::Lock(LockError::InUse { .. })));

        let err = resume_session(ResumeRequest::new(config(&dir, "new", "p1")), &locks)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Lock(LockError::InUse { .. })));
    }

    #[tokio::test]
    async fn test_resume_without_sessions() {
        let dir = TempDir::new().unwrap();
        let locks = SessionLockManager::new(dir.path());

        let err = resume_session(ResumeRequest::new(config(&dir, "new", "p1")), &locks)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Resolve(ResolveError::NoSessions)));
    }

    #[tokio::test]
    async fn test_resume_surfaces_replay_warnings() {
        let dir = TempDir::new().unwrap();
        let path = record(&dir, "s1", &["a", "b"]).await;
        let contents = std::fs::read_to_string(&path).unwrap();
        let mut lines: Vec<&str> = contents.lines().collect();
        lines.insert(2, "{broken");
        std::fs::write(&path, format!("{}\n", lines.join("\n"))).unwrap();
        let locks = SessionLockManager::new(dir.path());

        let resumed = resume_session(ResumeRequest::new(config(&dir, "new", "p1")), &locks)
            .await
            .unwrap();

        assert_eq!(resumed.history.len(), 2);
        assert_eq!(resumed.warnings.len(), 1);
    }
}
