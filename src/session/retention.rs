//! Age/count retention for session files.
//!
//! Stale locks are cleared along the way, but a stale lock never selects a
//! session for deletion by itself; only the policy does.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{Duration, Utc};

use super::discovery::list_sessions;
use super::{SessionError, SessionResult};
use crate::lock::{LOCK_FILE_EXTENSION, LockError, SessionLockManager};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Delete sessions not modified within this window.
    pub max_age: Option<Duration>,
    /// Keep at most this many sessions, newest first.
    pub max_count: Option<usize>,
}

impl RetentionPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn max_age_days(self, days: i64) -> Self {
        self.max_age(Duration::days(days))
    }

    pub fn max_count(mut self, max_count: usize) -> Self {
        self.max_count = Some(max_count);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.max_age.is_none() && self.max_count.is_none()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: Vec<PathBuf>,
    pub stale_locks_removed: usize,
    pub skipped_active: usize,
}

/// Apply `policy` to the sessions of one project.
///
/// Sessions held by a live lock are never touched; each selected session is
/// locked while its file is deleted. Positions for
/// `max_count` are taken from the full newest-first listing, active sessions
/// included.
pub fn cleanup_sessions(
    chats_dir: &Path,
    project_hash: &str,
    policy: &RetentionPolicy,
    locks: &SessionLockManager,
) -> SessionResult<CleanupReport> {
    let sessions = list_sessions(chats_dir, project_hash)?;
    let now = Utc::now();
    let mut report = CleanupReport::default();

    for (position, session) in sessions.iter().enumerate() {
        if locks.is_locked(&session.session_id) {
            report.skipped_active += 1;
            continue;
        }
        if locks.remove_stale_lock(&session.session_id)? {
            report.stale_locks_removed += 1;
        }

        let too_old = policy
            .max_age
            .is_some_and(|max_age| now - session.last_modified > max_age);
        let over_count = policy.max_count.is_some_and(|max| position >= max);
        if !(too_old || over_count) {
            continue;
        }

        let mut lock = match locks.acquire(&session.session_id) {
            Ok(lock) => lock,
            Err(LockError::InUse { .. }) => {
                report.skipped_active += 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        let removed = std::fs::remove_file(&session.file_path);
        lock.release();

        match removed {
            Ok(()) => {
                tracing::info!(
                    session_id = %session.session_id,
                    path = %session.file_path.display(),
                    "Deleted expired session"
                );
                report.deleted.push(session.file_path.clone());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(SessionError::io(&session.file_path, e)),
        }
    }

    let known: HashSet<PathBuf> = sessions
        .iter()
        .map(|s| locks.lock_path(&s.session_id))
        .collect();
    report.stale_locks_removed += remove_orphaned_locks(locks, &known)?;

    tracing::debug!(
        deleted = report.deleted.len(),
        stale_locks_removed = report.stale_locks_removed,
        skipped_active = report.skipped_active,
        "Session cleanup finished"
    );
    Ok(report)
}

/// Stale lock files in the lock directory with no session file behind them.
fn remove_orphaned_locks(
    locks: &SessionLockManager,
    known: &HashSet<PathBuf>,
) -> SessionResult<usize> {
    let dir = locks.lock_dir();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(SessionError::io(dir, e)),
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(LOCK_FILE_EXTENSION)
            || known.contains(&path)
        {
            continue;
        }
        if locks.remove_stale_lock_at(&path)? {
            removed += 1;
        }
    }
    Ok(removed)
}
