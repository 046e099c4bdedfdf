//! Session recorder front end.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};

use super::envelope::{EventType, RecordEvent, SessionRecordLine, SessionStartPayload};
use super::writer::{self, JsonlWriter, OpenMode, WriterCmd};
use super::{RecorderState, RecordingError, RecordingResult};
use crate::config::RecordingConfig;

pub const SESSION_FILE_PREFIX: &str = "session-";
pub const SESSION_FILE_EXTENSION: &str = "jsonl";

const SHORT_ID_LEN: usize = 8;

/// `session-<YYYY-MM-DDTHH-MM-SS>-<short id>.jsonl`, colons replaced for
/// filesystems that reject them.
pub fn session_file_name(session_id: &str, started_at: DateTime<Utc>) -> String {
    let short_id: String = session_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(SHORT_ID_LEN)
        .collect();
    format!(
        "{}{}-{}.{}",
        SESSION_FILE_PREFIX,
        started_at.format("%Y-%m-%dT%H-%M-%S"),
        short_id,
        SESSION_FILE_EXTENSION
    )
}

pub(super) struct RecorderInner {
    pub(super) state: RecorderState,
    seq: u64,
    /// Lines enqueued before materialization, in enqueue order.
    pending: Vec<SessionRecordLine>,
    pub(super) file_path: Option<PathBuf>,
    tx: Option<mpsc::UnboundedSender<WriterCmd>>,
    pub(super) disabled_notice: Option<String>,
}

impl RecorderInner {
    pub(super) fn new(tx: Option<mpsc::UnboundedSender<WriterCmd>>) -> Self {
        Self {
            state: RecorderState::Buffering,
            seq: 0,
            pending: Vec::new(),
            file_path: None,
            tx,
            disabled_notice: None,
        }
    }

    fn next_line(&mut self, event: RecordEvent) -> SessionRecordLine {
        self.seq += 1;
        SessionRecordLine::new(self.seq, event)
    }

    fn send(&mut self, cmd: WriterCmd) {
        let Some(tx) = self.tx.as_ref() else {
            return;
        };
        if tx.send(cmd).is_err() {
            tracing::warn!("Session writer task has exited; disabling recording");
            self.tx = None;
            self.state = RecorderState::Disabled;
            self.disabled_notice =
                Some("Session recording stopped unexpectedly; further turns are not saved.".into());
        }
    }
}

/// Append-only recorder for one session.
///
/// [`enqueue`](Self::enqueue) never blocks and never fails; durability is
/// obtained by awaiting [`flush`](Self::flush) at turn boundaries.
pub struct SessionRecordingService {
    config: RecordingConfig,
    shared: Arc<Mutex<RecorderInner>>,
}

impl SessionRecordingService {
    /// Create a recorder for a new session and spawn its writer task.
    ///
    /// The `session_start` line is buffered immediately; nothing touches the
    /// filesystem until the first `content` event.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: RecordingConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = RecorderInner::new(Some(tx));

        let start = inner.next_line(RecordEvent::SessionStart(SessionStartPayload {
            session_id: config.session_id.clone(),
            project_hash: config.project_hash.clone(),
            workspace_dirs: config.workspace_dirs.clone(),
            provider: config.provider.clone(),
            model: config.model.clone(),
            start_time: Utc::now(),
        }));
        inner.pending.push(start);

        let shared = Arc::new(Mutex::new(inner));
        let writer = JsonlWriter::new(config.session_id.clone(), shared.clone(), config.sync_mode);
        tokio::spawn(writer::run(writer, rx));

        Self { config, shared }
    }

    fn inner(&self) -> MutexGuard<'_, RecorderInner> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &RecordingConfig {
        &self.config
    }

    pub fn session_id(&self) -> &str {
        &self.config.session_id
    }

    /// Record an event. Silently ignored once disabled or disposed.
    pub fn enqueue(&self, event: RecordEvent) {
        let mut inner = self.inner();
        if !inner.state.accepts_events() {
            return;
        }

        let line = inner.next_line(event);
        match inner.state {
            RecorderState::Buffering if line.event_type() != EventType::Content => {
                inner.pending.push(line);
            }
            RecorderState::Buffering => self.materialize(&mut inner, line),
            _ => inner.send(WriterCmd::Append(vec![line])),
        }
    }

    fn materialize(&self, inner: &mut RecorderInner, trigger: SessionRecordLine) {
        let path = self
            .config
            .chats_dir
            .join(session_file_name(&self.config.session_id, trigger.ts));

        tracing::debug!(
            session_id = %self.config.session_id,
            path = %path.display(),
            buffered = inner.pending.len(),
            "Materializing session file"
        );

        let mut lines = std::mem::take(&mut inner.pending);
        lines.push(trigger);

        inner.file_path = Some(path.clone());
        inner.state = RecorderState::Recording;
        inner.send(WriterCmd::Open {
            path,
            mode: OpenMode::CreateNew,
        });
        inner.send(WriterCmd::Append(lines));
    }

    /// Wait until every line enqueued before this call has been appended.
    ///
    /// Returns the first non-disabling I/O error hit since the previous flush.
    /// Buffered lines of a session that has not materialized yet are not
    /// written by a flush.
    pub async fn flush(&self) -> RecordingResult<()> {
        let rx = {
            let mut inner = self.inner();
            if inner.state == RecorderState::Disposed {
                return Ok(());
            }
            let (ack, rx) = oneshot::channel();
            inner.send(WriterCmd::Flush { ack });
            rx
        };

        rx.await.map_err(|_| RecordingError::WriterClosed)?
    }

    /// Switch to appending to an existing session file.
    ///
    /// Drops the buffered `session_start`, continues numbering after
    /// `last_seq`, and moves any other buffered lines to the drain queue.
    /// A torn final line left by a crash is cut before the first append.
    pub fn initialize_for_resume(&self, file_path: impl Into<PathBuf>, last_seq: u64) {
        let file_path = file_path.into();
        let mut inner = self.inner();

        if inner.state != RecorderState::Buffering {
            tracing::warn!(
                session_id = %self.config.session_id,
                state = ?inner.state,
                "initialize_for_resume called after recording started; ignoring"
            );
            return;
        }

        let buffered = std::mem::take(&mut inner.pending);
        inner.seq = last_seq;
        let mut lines = Vec::with_capacity(buffered.len());
        for mut line in buffered {
            if line.event_type() == EventType::SessionStart {
                continue;
            }
            inner.seq += 1;
            line.seq = inner.seq;
            lines.push(line);
        }

        tracing::debug!(
            session_id = %self.config.session_id,
            path = %file_path.display(),
            last_seq,
            "Recorder reopened for append"
        );

        inner.file_path = Some(file_path.clone());
        inner.state = RecorderState::Recording;
        inner.send(WriterCmd::Open {
            path: file_path,
            mode: OpenMode::Resume,
        });
        if !lines.is_empty() {
            inner.send(WriterCmd::Append(lines));
        }
    }

    /// Stop accepting events. Lines not yet flushed are discarded.
    pub fn dispose(&self) {
        let mut inner = self.inner();
        if inner.state == RecorderState::Disposed {
            return;
        }
        inner.state = RecorderState::Disposed;
        inner.pending.clear();
        inner.tx = None;
        tracing::debug!(session_id = %self.config.session_id, "Recorder disposed");
    }

    /// True while events are still being accepted.
    pub fn is_active(&self) -> bool {
        self.inner().state.accepts_events()
    }

    pub fn state(&self) -> RecorderState {
        self.inner().state
    }

    /// Path of the session file once materialized. May change to an
    /// alternate name after the first write if the chosen name was taken.
    pub fn get_file_path(&self) -> Option<PathBuf> {
        self.inner().file_path.clone()
    }

    pub fn last_seq(&self) -> u64 {
        self.inner().seq
    }

    pub fn pending_buffer_len(&self) -> usize {
        self.inner().pending.len()
    }

    /// One-time advisory after the recorder disabled itself.
    pub fn take_disabled_notice(&self) -> Option<String> {
        self.inner().disabled_notice.take()
    }

    pub fn chats_dir(&self) -> &Path {
        &self.config.chats_dir
    }
}

impl Drop for SessionRecordingService {
    fn drop(&mut self) {
        // Closing the channel lets the writer finish queued lines and exit.
        self.inner().tx = None;
    }
}

impl std::fmt::Debug for SessionRecordingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner();
        f.debug_struct("SessionRecordingService")
            .field("session_id", &self.config.session_id)
            .field("state", &inner.state)
            .field("seq", &inner.seq)
            .field("file_path", &inner.file_path)
            .finish_non_exhaustive()
    }
}
