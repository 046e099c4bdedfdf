//! Listing and resolving session files for one project.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::{SessionError, SessionResult};
use crate::recording::{SESSION_FILE_EXTENSION, SESSION_FILE_PREFIX};
use crate::replay::read_session_header;

const SHORT_ID_LEN: usize = 8;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("No sessions found for this project")]
    NoSessions,

    #[error("No session matches '{reference}'. Available: {}", available.join(", "))]
    NotFound {
        reference: String,
        available: Vec<String>,
    },

    #[error("'{reference}' matches multiple sessions: {}", matches.join(", "))]
    Ambiguous {
        reference: String,
        matches: Vec<String>,
    },
}

/// Listing entry built from the first line of a session file plus filesystem
/// metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSummary {
    /// 1-based position in the newest-first listing.
    pub index: usize,
    pub session_id: String,
    pub file_path: PathBuf,
    pub start_time: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub size_bytes: u64,
    pub provider: String,
    pub model: String,
}

impl SessionSummary {
    pub fn short_id(&self) -> &str {
        match self.session_id.char_indices().nth(SHORT_ID_LEN) {
            Some((end, _)) => &self.session_id[..end],
            None => &self.session_id,
        }
    }

    pub fn file_name(&self) -> String {
        self.file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

pub(crate) fn is_session_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.starts_with(SESSION_FILE_PREFIX)
        && path.extension().and_then(|e| e.to_str()) == Some(SESSION_FILE_EXTENSION)
}

/// Sessions of `project_hash` in `chats_dir`, newest first.
///
/// Reads only the `session_start` line of each file. Files from other
/// projects or without a valid header are left out. A missing directory is
/// an empty listing.
pub fn list_sessions(chats_dir: &Path, project_hash: &str) -> SessionResult<Vec<SessionSummary>> {
    let entries = match std::fs::read_dir(chats_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(SessionError::io(chats_dir, e)),
    };

    let mut sessions = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| SessionError::io(chats_dir, e))?;
        let path = entry.path();
        if !is_session_file(&path) {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let Some(header) = read_session_header(&path) else {
            tracing::debug!(path = %path.display(), "Skipping file without session header");
            continue;
        };
        if header.project_hash != project_hash {
            continue;
        }

        let last_modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or(header.start_time);

        sessions.push(SessionSummary {
            index: 0,
            session_id: header.session_id,
            file_path: path,
            start_time: header.start_time,
            last_modified,
            size_bytes: metadata.len(),
            provider: header.provider,
            model: header.model,
        });
    }

    sessions.sort_by(|a, b| {
        b.last_modified
            .cmp(&a.last_modified)
            .then_with(|| b.start_time.cmp(&a.start_time))
    });
    for (i, session) in sessions.iter_mut().enumerate() {
        session.index = i + 1;
    }

    Ok(sessions)
}

/// Resolve a user reference: exact ID, then unique ID prefix, then 1-based index.
pub fn resolve_session_ref<'a>(
    reference: &str,
    sessions: &'a [SessionSummary],
) -> Result<&'a SessionSummary, ResolveError> {
    if sessions.is_empty() {
        return Err(ResolveError::NoSessions);
    }
    let reference = reference.trim();

    if let Some(exact) = sessions.iter().find(|s| s.session_id == reference) {
        return Ok(exact);
    }

    if !reference.is_empty() {
        let matches: Vec<&SessionSummary> = sessions
            .iter()
            .filter(|s| s.session_id.starts_with(reference))
            .collect();
        match matches.as_slice() {
            [only] => return Ok(*only),
            [] => {}
            many => {
                return Err(ResolveError::Ambiguous {
                    reference: reference.to_string(),
                    matches: many.iter().map(|s| s.session_id.clone()).collect(),
                });
            }
        }
    }

    if let Ok(index) = reference.parse::<usize>()
        && (1..=sessions.len()).contains(&index)
    {
        return Ok(&sessions[index - 1]);
    }

    Err(ResolveError::NotFound {
        reference: reference.to_string(),
        available: sessions.iter().map(|s| s.session_id.clone()).collect(),
    })
}
