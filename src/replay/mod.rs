//! Session file replay.
//!
//! Rebuilds conversation history and metadata from a session file. The reader
//! streams the file one line at a time and keeps one line of lookahead so it
//! can tell a torn final write (discarded silently) from corruption in the
//! middle of the file (skipped with a warning).
//!
//! Line order is authoritative; `seq` is only tracked for continuation.

mod header;

pub use header::{SessionHeader, read_session_header};

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::recording::{
    RawRecordLine, RecordEvent, SessionEventPayload, SessionStartPayload, Severity,
};
use crate::types::Content;

/// Default fraction of malformed lines above which a summary warning is added.
pub const DEFAULT_CORRUPTION_WARNING_RATIO: f64 = 0.5;

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("Failed to read session file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Session file {path} contains no records")]
    EmptyFile { path: PathBuf },

    #[error("Session file {path} does not start with session_start (found {first_type})")]
    MissingSessionStart { path: PathBuf, first_type: String },

    #[error("Session belongs to a different project (expected {expected}, found {found})")]
    ProjectHashMismatch { expected: String, found: String },

    #[error("Replay task failed: {0}")]
    TaskJoin(String),
}

pub type ReplayOutcome = std::result::Result<ReplayResult, ReplayError>;

#[derive(Clone, Debug)]
pub struct ReplayOptions {
    pub corruption_warning_ratio: f64,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            corruption_warning_ratio: DEFAULT_CORRUPTION_WARNING_RATIO,
        }
    }
}

/// Metadata as of the end of the file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionMetadata {
    pub session_id: String,
    pub project_hash: String,
    pub provider: String,
    pub model: String,
    pub workspace_dirs: Vec<String>,
}

impl From<&SessionStartPayload> for SessionMetadata {
    fn from(start: &SessionStartPayload) -> Self {
        Self {
            session_id: start.session_id.clone(),
            project_hash: start.project_hash.clone(),
            provider: start.provider.clone(),
            model: start.model.clone(),
            workspace_dirs: start.workspace_dirs.clone(),
        }
    }
}

/// An audit event recorded during the session. Never part of history.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionEventRecord {
    pub seq: u64,
    pub timestamp: Option<DateTime<Utc>>,
    pub severity: Severity,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Non-blank lines seen, including skipped ones.
    pub lines_read: usize,
    /// Malformed lines skipped in the middle of the file.
    pub skipped_lines: usize,
    pub unknown_events: usize,
    pub compressions: usize,
    /// Sum of `itemsCompressed` over every compression.
    pub items_compressed: usize,
    pub rewinds: usize,
    pub truncated_tail: bool,
}

#[derive(Clone, Debug)]
pub struct ReplayResult {
    pub file_path: PathBuf,
    pub history: Vec<Content>,
    pub metadata: SessionMetadata,
    pub last_seq: u64,
    pub session_events: Vec<SessionEventRecord>,
    pub warnings: Vec<String>,
    pub stats: ReplayStats,
}

/// Replay with default options on the blocking pool.
pub async fn replay_session(path: &Path, expected_project_hash: &str) -> ReplayOutcome {
    replay_session_with(path, expected_project_hash, &ReplayOptions::default()).await
}

pub async fn replay_session_with(
    path: &Path,
    expected_project_hash: &str,
    options: &ReplayOptions,
) -> ReplayOutcome {
    let path = path.to_path_buf();
    let expected = expected_project_hash.to_string();
    let options = options.clone();
    tokio::task::spawn_blocking(move || replay_session_sync(&path, &expected, &options))
        .await
        .map_err(|e| ReplayError::TaskJoin(e.to_string()))?
}

/// Blocking replay. Safe to call concurrently on the same file.
pub fn replay_session_sync(
    path: &Path,
    expected_project_hash: &str,
    options: &ReplayOptions,
) -> ReplayOutcome {
    let io_err = |source| ReplayError::Io {
        path: path.to_path_buf(),
        source,
    };

    let file = std::fs::File::open(path).map_err(io_err)?;
    let mut reader = BufReader::with_capacity(64 * 1024, file);
    let mut state = ReplayState::new(path, expected_project_hash);

    let mut buf = Vec::with_capacity(4096);
    let mut lookahead: Option<(usize, Vec<u8>)> = None;
    let mut line_no = 0usize;

    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf).map_err(io_err)?;
        if n == 0 {
            break;
        }
        line_no += 1;
        if buf.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        if let Some((prev_no, prev)) = lookahead.replace((line_no, buf.clone())) {
            state.apply(prev_no, &prev, false)?;
        }
    }
    if let Some((last_no, last)) = lookahead {
        state.apply(last_no, &last, true)?;
    }

    state.finish(options)
}

struct ReplayState<'a> {
    path: &'a Path,
    expected_project_hash: &'a str,
    started: bool,
    history: Vec<Content>,
    metadata: SessionMetadata,
    last_seq: u64,
    session_events: Vec<SessionEventRecord>,
    warnings: Vec<String>,
    stats: ReplayStats,
}

impl<'a> ReplayState<'a> {
    fn new(path: &'a Path, expected_project_hash: &'a str) -> Self {
        Self {
            path,
            expected_project_hash,
            started: false,
            history: Vec::new(),
            metadata: SessionMetadata::default(),
            last_seq: 0,
            session_events: Vec::new(),
            warnings: Vec::new(),
            stats: ReplayStats::default(),
        }
    }

    fn apply(&mut self, line_no: usize, bytes: &[u8], is_last: bool) -> Result<(), ReplayError> {
        self.stats.lines_read += 1;

        let raw = match RawRecordLine::parse(bytes) {
            Ok(raw) => raw,
            Err(e) if is_last => {
                tracing::debug!(
                    path = %self.path.display(),
                    line = line_no,
                    error = %e,
                    "Discarding truncated final line"
                );
                self.stats.truncated_tail = true;
                return Ok(());
            }
            Err(e) => {
                self.skip(line_no, &e.to_string());
                return Ok(());
            }
        };

        self.last_seq = self.last_seq.max(raw.seq);
        let seq = raw.seq;
        let timestamp = raw
            .ts
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc));
        let type_name = raw.event_type.clone();

        let event = match raw.into_event() {
            None => {
                if !self.started {
                    return Err(self.missing_start(&type_name));
                }
                self.stats.unknown_events += 1;
                self.warn(format!(
                    "Line {}: skipped unknown event type '{}'",
                    line_no, type_name
                ));
                return Ok(());
            }
            Some(Err(e)) => {
                if !self.started {
                    return Err(self.missing_start(&type_name));
                }
                self.skip(line_no, &format!("invalid {} payload: {}", type_name, e));
                return Ok(());
            }
            Some(Ok(event)) => event,
        };

        if !self.started {
            let RecordEvent::SessionStart(start) = &event else {
                return Err(self.missing_start(&type_name));
            };
            if start.project_hash != self.expected_project_hash {
                return Err(ReplayError::ProjectHashMismatch {
                    expected: self.expected_project_hash.to_string(),
                    found: start.project_hash.clone(),
                });
            }
            self.metadata = SessionMetadata::from(start);
            self.started = true;
            return Ok(());
        }

        match event {
            RecordEvent::SessionStart(_) => {
                self.warn(format!("Line {}: ignored repeated session_start", line_no));
            }
            RecordEvent::Content(p) => {
                if !p.content.is_empty() {
                    self.history.push(p.content);
                }
            }
            RecordEvent::Compressed(p) => {
                self.history.clear();
                if !p.summary.is_empty() {
                    self.history.push(p.summary);
                }
                self.stats.compressions += 1;
                self.stats.items_compressed += p.items_compressed;
            }
            RecordEvent::Rewind(p) => {
                let keep = self.history.len().saturating_sub(p.items_removed);
                self.history.truncate(keep);
                self.stats.rewinds += 1;
            }
            RecordEvent::ProviderSwitch(p) => {
                self.metadata.provider = p.provider;
                self.metadata.model = p.model;
            }
            RecordEvent::DirectoriesChanged(p) => {
                self.metadata.workspace_dirs = p.directories;
            }
            RecordEvent::SessionEvent(SessionEventPayload { severity, message }) => {
                self.session_events.push(SessionEventRecord {
                    seq,
                    timestamp,
                    severity,
                    message,
                });
            }
        }

        Ok(())
    }

    fn skip(&mut self, line_no: usize, reason: &str) {
        self.stats.skipped_lines += 1;
        self.warn(format!("Line {}: skipped malformed record ({})", line_no, reason));
    }

    fn warn(&mut self, message: String) {
        tracing::warn!(path = %self.path.display(), "{}", message);
        self.warnings.push(message);
    }

    fn missing_start(&self, found: &str) -> ReplayError {
        ReplayError::MissingSessionStart {
            path: self.path.to_path_buf(),
            first_type: found.to_string(),
        }
    }

    fn finish(mut self, options: &ReplayOptions) -> ReplayOutcome {
        if !self.started {
            return Err(ReplayError::EmptyFile {
                path: self.path.to_path_buf(),
            });
        }

        // Ratio over the body: header and a discarded torn tail don't count.
        let total = self
            .stats
            .lines_read
            .saturating_sub(1 + usize::from(self.stats.truncated_tail));
        if total > 0 {
            let ratio = self.stats.skipped_lines as f64 / total as f64;
            if ratio > options.corruption_warning_ratio {
                self.warn(format!(
                    "{} of {} lines could not be read; this session may be partially corrupted",
                    self.stats.skipped_lines, total
                ));
            }
        }

        tracing::debug!(
            path = %self.path.display(),
            items = self.history.len(),
            last_seq = self.last_seq,
            warnings = self.warnings.len(),
            "Replayed session"
        );

        Ok(ReplayResult {
            file_path: self.path.to_path_buf(),
            history: self.history,
            metadata: self.metadata,
            last_seq: self.last_seq,
            session_events: self.session_events,
            warnings: self.warnings,
            stats: self.stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::{SessionRecordLine, SessionStartPayload};
    use crate::types::Role;
    use std::io::Write;
    use tempfile::TempDir;

    fn start_event(hash: &str) -> RecordEvent {
        RecordEvent::SessionStart(SessionStartPayload {
            session_id: "abc".into(),
            project_hash: hash.into(),
            workspace_dirs: vec!["/work".into()],
            provider: "p1".into(),
            model: "m1".into(),
            start_time: Utc::now(),
        })
    }

    fn write_session(dir: &TempDir, events: Vec<RecordEvent>) -> PathBuf {
        let path = dir.path().join("session.jsonl");
        let mut file = std::fs::File::create(&path).unwrap();
        for (i, event) in events.into_iter().enumerate() {
            let line = SessionRecordLine::new(i as u64 + 1, event);
            writeln!(file, "{}", line.to_json().unwrap()).unwrap();
        }
        path
    }

    fn append_raw(path: &Path, raw: &str) {
        let mut file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(raw.as_bytes()).unwrap();
    }

    fn replay(path: &Path) -> ReplayOutcome {
        replay_session_sync(path, "H", &ReplayOptions::default())
    }

    #[test]
    fn test_example_scenario() {
        let dir = TempDir::new().unwrap();
        let path = write_session(
            &dir,
            vec![
                start_event("H"),
                RecordEvent::content(Content::user("hello")),
                RecordEvent::provider_switch("p2", "m2"),
                RecordEvent::content(Content::user("world")),
            ],
        );

        let result = replay(&path).unwrap();
        assert_eq!(
            result.history,
            vec![Content::user("hello"), Content::user("world")]
        );
        assert_eq!(result.metadata.provider, "p2");
        assert_eq!(result.metadata.model, "m2");
        assert_eq!(result.last_seq, 4);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_compression_collapses_history() {
        let dir = TempDir::new().unwrap();
        let path = write_session(
            &dir,
            vec![
                start_event("H"),
                RecordEvent::content(Content::user("a")),
                RecordEvent::content(Content::model("b")),
                RecordEvent::content(Content::user("c")),
                RecordEvent::compressed(Content::user("summary"), 3),
            ],
        );

        let result = replay(&path).unwrap();
        assert_eq!(result.history, vec![Content::user("summary")]);
        assert_eq!(result.stats.compressions, 1);
        assert_eq!(result.stats.items_compressed, 3);
    }

    #[test]
    fn test_rewind_clamps_to_empty() {
        let dir = TempDir::new().unwrap();
        let path = write_session(
            &dir,
            vec![
                start_event("H"),
                RecordEvent::content(Content::user("a")),
                RecordEvent::content(Content::model("b")),
                RecordEvent::rewind(1),
            ],
        );
        assert_eq!(replay(&path).unwrap().history, vec![Content::user("a")]);

        append_raw(
            &path,
            &format!(
                "{}\n",
                SessionRecordLine::new(5, RecordEvent::rewind(10))
                    .to_json()
                    .unwrap()
            ),
        );
        let result = replay(&path).unwrap();
        assert!(result.history.is_empty());
        assert_eq!(result.stats.rewinds, 2);
    }

    #[test]
    fn test_session_events_stay_out_of_history() {
        let dir = TempDir::new().unwrap();
        let path = write_session(
            &dir,
            vec![
                start_event("H"),
                RecordEvent::session_event(Severity::Warning, "quota low"),
                RecordEvent::content(Content::user("hi")),
                RecordEvent::directories_changed(vec!["/a".into(), "/b".into()]),
            ],
        );

        let result = replay(&path).unwrap();
        assert_eq!(result.history.len(), 1);
        assert_eq!(result.session_events.len(), 1);
        assert_eq!(result.session_events[0].severity, Severity::Warning);
        assert_eq!(result.session_events[0].seq, 2);
        assert!(result.session_events[0].timestamp.is_some());
        assert_eq!(result.metadata.workspace_dirs, vec!["/a", "/b"]);
    }

    #[test]
    fn test_truncated_tail_is_silent() {
        let dir = TempDir::new().unwrap();
        let path = write_session(
            &dir,
            vec![start_event("H"), RecordEvent::content(Content::user("a"))],
        );
        append_raw(&path, r#"{"v":1,"seq":3,"ts":"2026-"#);

        let result = replay(&path).unwrap();
        assert_eq!(result.history, vec![Content::user("a")]);
        assert!(result.warnings.is_empty());
        assert!(result.stats.truncated_tail);
        assert_eq!(result.last_seq, 2);
    }

    #[test]
    fn test_mid_file_garbage_is_one_warning() {
        let dir = TempDir::new().unwrap();
        let path = write_session(
            &dir,
            vec![start_event("H"), RecordEvent::content(Content::user("a"))],
        );
        append_raw(&path, "#### not json ####\n");
        append_raw(
            &path,
            &format!(
                "{}\n",
                SessionRecordLine::new(3, RecordEvent::content(Content::model("b")))
                    .to_json()
                    .unwrap()
            ),
        );

        let result = replay(&path).unwrap();
        assert_eq!(
            result.history,
            vec![Content::user("a"), Content::model("b")]
        );
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.stats.skipped_lines, 1);
    }

    #[test]
    fn test_unknown_event_type_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = write_session(
            &dir,
            vec![start_event("H"), RecordEvent::content(Content::user("a"))],
        );
        append_raw(
            &path,
            "{\"v\":2,\"seq\":3,\"ts\":\"2026-01-01T00:00:00Z\",\"type\":\"future_thing\",\"payload\":{}}\n",
        );

        let result = replay(&path).unwrap();
        assert_eq!(result.history.len(), 1);
        assert_eq!(result.stats.unknown_events, 1);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("future_thing"));
        assert_eq!(result.last_seq, 3);
    }

    #[test]
    fn test_missing_session_start_fails() {
        let dir = TempDir::new().unwrap();
        let path = write_session(&dir, vec![RecordEvent::content(Content::user("a"))]);

        let err = replay(&path).unwrap_err();
        assert!(matches!(err, ReplayError::MissingSessionStart { ref first_type, .. } if first_type == "content"));
    }

    #[test]
    fn test_project_hash_mismatch_fails() {
        let dir = TempDir::new().unwrap();
        let path = write_session(
            &dir,
            vec![start_event("OTHER"), RecordEvent::content(Content::user("a"))],
        );

        let err = replay(&path).unwrap_err();
        assert!(matches!(err, ReplayError::ProjectHashMismatch { .. }));
        assert!(err.to_string().contains("different project"));
    }

    #[test]
    fn test_empty_file_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.jsonl");
        std::fs::write(&path, "\n\n").unwrap();

        assert!(matches!(
            replay(&path).unwrap_err(),
            ReplayError::EmptyFile { .. }
        ));
    }

    #[test]
    fn test_corruption_summary_warning() {
        let dir = TempDir::new().unwrap();
        let path = write_session(&dir, vec![start_event("H")]);
        for _ in 0..3 {
            append_raw(&path, "garbage\n");
        }
        append_raw(
            &path,
            &format!(
                "{}\n",
                SessionRecordLine::new(2, RecordEvent::content(Content::user("a")))
                    .to_json()
                    .unwrap()
            ),
        );

        let result = replay(&path).unwrap();
        assert_eq!(result.stats.skipped_lines, 3);
        assert_eq!(result.warnings.len(), 4);
        assert!(result.warnings[3].contains("partially corrupted"));

        let strict = ReplayOptions {
            corruption_warning_ratio: 1.0,
        };
        let relaxed = replay_session_sync(&path, "H", &strict).unwrap();
        assert_eq!(relaxed.warnings.len(), 3);
    }

    #[test]
    fn test_corruption_ratio_ignores_header_and_torn_tail() {
        let dir = TempDir::new().unwrap();
        let path = write_session(&dir, vec![start_event("H")]);
        append_raw(&path, "garbage\n");
        append_raw(&path, "garbage\n");
        append_raw(
            &path,
            &format!(
                "{}\n",
                SessionRecordLine::new(4, RecordEvent::content(Content::user("a")))
                    .to_json()
                    .unwrap()
            ),
        );
        append_raw(&path, r#"{"v":1,"seq":5,"ts":"2026-"#);

        let result = replay(&path).unwrap();
        assert!(result.stats.truncated_tail);
        assert_eq!(result.stats.lines_read, 5);
        assert_eq!(result.stats.skipped_lines, 2);
        assert_eq!(result.warnings.len(), 3);
        assert!(result.warnings[2].contains("2 of 3 lines"));
    }

    #[test]
    fn test_empty_items_are_not_replayed() {
        let dir = TempDir::new().unwrap();
        let path = write_session(
            &dir,
            vec![
                start_event("H"),
                RecordEvent::content(Content::user("a")),
                RecordEvent::content(Content::new(Role::Model, vec![])),
            ],
        );
        assert_eq!(replay(&path).unwrap().history, vec![Content::user("a")]);

        let empty_summary = RecordEvent::compressed(Content::new(Role::Model, vec![]), 1);
        append_raw(
            &path,
            &format!(
                "{}\n",
                SessionRecordLine::new(4, empty_summary).to_json().unwrap()
            ),
        );
        let result = replay(&path).unwrap();
        assert!(result.history.is_empty());
        assert_eq!(result.stats.compressions, 1);
    }

    #[tokio::test]
    async fn test_async_replay_missing_file() {
        let err = replay_session(Path::new("/nonexistent/session.jsonl"), "H")
            .await
            .unwrap_err();
        assert!(matches!(err, ReplayError::Io { .. }));
    }
}
