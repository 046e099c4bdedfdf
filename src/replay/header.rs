use std::io::{BufRead, BufReader};
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::recording::{RawRecordLine, RecordEvent};

/// Listing metadata taken from the `session_start` line alone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionHeader {
    pub session_id: String,
    pub project_hash: String,
    pub provider: String,
    pub model: String,
    pub workspace_dirs: Vec<String>,
    pub start_time: DateTime<Utc>,
}

/// Read the first non-blank line of a session file.
///
/// Returns `None` when the file cannot be read or does not open with a valid
/// `session_start`. Never reads past the first record.
pub fn read_session_header(path: &Path) -> Option<SessionHeader> {
    let file = std::fs::File::open(path).ok()?;
    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf).ok()?;
        if n == 0 {
            return None;
        }
        if !buf.iter().all(u8::is_ascii_whitespace) {
            break;
        }
    }

    let raw = RawRecordLine::parse(&buf).ok()?;
    match raw.into_event()?.ok()? {
        RecordEvent::SessionStart(start) => Some(SessionHeader {
            session_id: start.session_id,
            project_hash: start.project_hash,
            provider: start.provider,
            model: start.model,
            workspace_dirs: start.workspace_dirs,
            start_time: start.start_time,
        }),
        _ => None,
    }
}
