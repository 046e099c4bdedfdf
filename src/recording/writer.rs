//! Background drain task owning the session file handle.

use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

use super::envelope::SessionRecordLine;
use super::service::{RecorderInner, SESSION_FILE_EXTENSION};
use super::{RecorderState, RecordingError, RecordingResult, is_disabling_error};
use crate::config::SyncMode;

/// Alternate names tried when a new session's file name is already taken.
const MAX_NAME_ATTEMPTS: u32 = 16;

const TAIL_SCAN_CHUNK: usize = 8 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum OpenMode {
    /// Fresh session file. An existing file is never appended to.
    CreateNew,
    /// Existing session file. A torn final line is cut before the first append.
    Resume,
    /// File this writer has already opened once.
    Append,
}

pub(super) enum WriterCmd {
    /// Target file for subsequent appends (opened lazily on first write).
    Open { path: PathBuf, mode: OpenMode },
    Append(Vec<SessionRecordLine>),
    /// Respond once every command queued before this one has been processed.
    Flush {
        ack: oneshot::Sender<RecordingResult<()>>,
    },
}

pub(super) struct JsonlWriter {
    session_id: String,
    shared: Arc<Mutex<RecorderInner>>,
    sync_mode: SyncMode,
    path: Option<PathBuf>,
    mode: OpenMode,
    file: Option<tokio::fs::File>,
    failure: Option<RecordingError>,
}

/// Drain loop: one pass per wake-up, coalescing every append already queued
/// into a single write. Exits when all senders are gone.
pub(super) async fn run(mut writer: JsonlWriter, mut rx: mpsc::UnboundedReceiver<WriterCmd>) {
    let mut deferred: Option<WriterCmd> = None;

    loop {
        let cmd = match deferred.take() {
            Some(cmd) => cmd,
            None => match rx.recv().await {
                Some(cmd) => cmd,
                None => break,
            },
        };

        match cmd {
            WriterCmd::Open { path, mode } => {
                writer.path = Some(path);
                writer.mode = mode;
                writer.file = None;
            }
            WriterCmd::Append(mut lines) => {
                while let Ok(next) = rx.try_recv() {
                    match next {
                        WriterCmd::Append(more) => lines.extend(more),
                        other => {
                            deferred = Some(other);
                            break;
                        }
                    }
                }
                writer.drain_pass(lines).await;
            }
            WriterCmd::Flush { ack } => {
                let result = match writer.failure.take() {
                    Some(err) => Err(err),
                    None => Ok(()),
                };
                let _ = ack.send(result);
            }
        }
    }

    tracing::debug!(session_id = %writer.session_id, "Session writer stopped");
}

impl JsonlWriter {
    pub(super) fn new(
        session_id: impl Into<String>,
        shared: Arc<Mutex<RecorderInner>>,
        sync_mode: SyncMode,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            shared,
            sync_mode,
            path: None,
            mode: OpenMode::CreateNew,
            file: None,
            failure: None,
        }
    }

    fn state(&self) -> RecorderState {
        self.shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    async fn drain_pass(&mut self, lines: Vec<SessionRecordLine>) {
        if !self.state().accepts_events() {
            tracing::debug!(
                session_id = %self.session_id,
                dropped = lines.len(),
                "Dropping queued lines for inactive recorder"
            );
            return;
        }

        let mut buf = Vec::with_capacity(lines.len() * 256);
        for line in &lines {
            match line.to_json() {
                Ok(json) => {
                    buf.extend_from_slice(json.as_bytes());
                    buf.push(b'\n');
                }
                Err(e) => {
                    tracing::warn!(
                        session_id = %self.session_id,
                        seq = line.seq,
                        error = %e,
                        "Skipping unserializable session line"
                    );
                    self.failure.get_or_insert(RecordingError::Serialization(e));
                }
            }
        }

        if buf.is_empty() {
            return;
        }

        match self.append(&buf).await {
            Ok(()) => tracing::debug!(
                session_id = %self.session_id,
                lines = lines.len(),
                bytes = buf.len(),
                "Drained session lines"
            ),
            Err(e) => self.handle_io_error(e),
        }
    }

    async fn append(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        if self.file.is_none() {
            let file = self.open().await?;
            self.file = Some(file);
            self.mode = OpenMode::Append;
        }
        let Some(file) = self.file.as_mut() else {
            return Err(std::io::Error::other("session file not open"));
        };

        file.write_all(bytes).await?;
        file.flush().await?;
        if self.sync_mode == SyncMode::OnWrite {
            file.sync_data().await?;
        }
        Ok(())
    }

    async fn open(&mut self) -> std::io::Result<tokio::fs::File> {
        let path = self
            .path
            .clone()
            .ok_or_else(|| std::io::Error::other("session file path not set"))?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mode = self.mode;
        match mode {
            OpenMode::CreateNew => self.create_unique(&path).await,
            OpenMode::Resume => {
                let mut file = tokio::fs::OpenOptions::new()
                    .read(true)
                    .append(true)
                    .open(&path)
                    .await?;
                let removed = repair_torn_tail(&mut file).await?;
                if removed > 0 {
                    tracing::warn!(
                        session_id = %self.session_id,
                        path = %path.display(),
                        bytes = removed,
                        "Discarded torn final line before resuming"
                    );
                }
                Ok(file)
            }
            OpenMode::Append => {
                tokio::fs::OpenOptions::new()
                    .append(true)
                    .open(&path)
                    .await
            }
        }
    }

    /// Create the session file, moving to `<name>-<n>.jsonl` if another
    /// session already claimed the name.
    async fn create_unique(&mut self, path: &Path) -> std::io::Result<tokio::fs::File> {
        let mut candidate = path.to_path_buf();
        for attempt in 1..=MAX_NAME_ATTEMPTS {
            match tokio::fs::OpenOptions::new()
                .append(true)
                .create_new(true)
                .open(&candidate)
                .await
            {
                Ok(file) => {
                    if candidate != path {
                        tracing::info!(
                            session_id = %self.session_id,
                            path = %candidate.display(),
                            "Session file name taken; using alternate name"
                        );
                        self.shared
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .file_path = Some(candidate.clone());
                        self.path = Some(candidate);
                    }
                    return Ok(file);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    candidate = alternate_name(path, attempt);
                }
                Err(e) => return Err(e),
            }
        }

        Err(std::io::Error::new(
            ErrorKind::AlreadyExists,
            format!("no free session file name for {}", path.display()),
        ))
    }

    fn handle_io_error(&mut self, err: std::io::Error) {
        // Reopen on the next pass in case the handle is in a bad state.
        self.file = None;

        if !is_disabling_error(&err) {
            tracing::error!(
                session_id = %self.session_id,
                error = %err,
                "Session write failed"
            );
            self.failure = Some(RecordingError::Io(err));
            return;
        }

        let mut inner = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.state != RecorderState::Recording {
            return;
        }
        inner.state = RecorderState::Disabled;
        let notice = format!(
            "Session recording disabled: {}. This conversation will not be saved from here on.",
            err
        );
        tracing::warn!(
            session_id = %self.session_id,
            path = ?self.path,
            error = %err,
            "Disabling session recording"
        );
        inner.disabled_notice = Some(notice);
    }
}

fn alternate_name(path: &Path, n: u32) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{}-{}.{}", stem, n, SESSION_FILE_EXTENSION))
}

/// Cut a partial last line left behind by a crash so the next append starts
/// on a line of its own. Returns the number of bytes removed.
async fn repair_torn_tail(file: &mut tokio::fs::File) -> std::io::Result<u64> {
    let len = file.metadata().await?.len();
    let mut chunk = vec![0u8; TAIL_SCAN_CHUNK];
    let mut end = len;

    while end > 0 {
        let start = end.saturating_sub(TAIL_SCAN_CHUNK as u64);
        let n = (end - start) as usize;
        file.seek(SeekFrom::Start(start)).await?;
        file.read_exact(&mut chunk[..n]).await?;

        if let Some(pos) = chunk[..n].iter().rposition(|b| *b == b'\n') {
            let keep = start + pos as u64 + 1;
            if keep < len {
                file.set_len(keep).await?;
            }
            return Ok(len - keep);
        }
        end = start;
    }

    if len > 0 {
        file.set_len(0).await?;
    }
    Ok(len)
}
