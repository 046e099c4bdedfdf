//! `--list-sessions`, `--delete-session` and `--continue` handlers.
//!
//! Handlers write human-readable output to the given sinks and return the
//! process exit code: `0` on success, `1` on any resolution, lock or storage
//! failure.

use std::io::Write;
use std::path::PathBuf;

use super::discovery::{SessionSummary, list_sessions, resolve_session_ref};
use super::resume::{ResumeRequest, ResumedSession, resume_session};
use super::retention::{RetentionPolicy, cleanup_sessions};
use super::{SessionError, SessionResult};
use crate::lock::SessionLockManager;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;

/// Project scope shared by all handlers.
#[derive(Clone, Debug)]
pub struct CommandContext {
    pub chats_dir: PathBuf,
    pub project_hash: String,
    pub locks: SessionLockManager,
}

impl CommandContext {
    pub fn new(chats_dir: impl Into<PathBuf>, project_hash: impl Into<String>) -> Self {
        let chats_dir = chats_dir.into();
        Self {
            locks: SessionLockManager::new(&chats_dir),
            chats_dir,
            project_hash: project_hash.into(),
        }
    }

    pub fn with_locks(mut self, locks: SessionLockManager) -> Self {
        self.locks = locks;
        self
    }

    fn sessions(&self) -> SessionResult<Vec<SessionSummary>> {
        list_sessions(&self.chats_dir, &self.project_hash)
    }
}

pub fn list_sessions_command(ctx: &CommandContext, out: &mut dyn Write, err: &mut dyn Write) -> i32 {
    let sessions = match ctx.sessions() {
        Ok(sessions) => sessions,
        Err(e) => return fail(err, &e),
    };

    let written = if sessions.is_empty() {
        writeln!(out, "No sessions found for this project.")
    } else {
        write_table(out, &sessions, &ctx.locks)
    };
    match written {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => fail(err, &SessionError::io(&ctx.chats_dir, e)),
    }
}

fn write_table(
    out: &mut dyn Write,
    sessions: &[SessionSummary],
    locks: &SessionLockManager,
) -> std::io::Result<()> {
    writeln!(
        out,
        "{:>4}  {:<8}  {:<19}  {:<19}  {:<24}  {:>9}",
        "#", "ID", "Started", "Modified", "Provider/Model", "Size"
    )?;
    for session in sessions {
        let marker = if locks.is_locked(&session.session_id) {
            "  [active]"
        } else {
            ""
        };
        writeln!(
            out,
            "{:>4}  {:<8}  {:<19}  {:<19}  {:<24}  {:>9}{}",
            session.index,
            session.short_id(),
            session.start_time.format("%Y-%m-%d %H:%M:%S"),
            session.last_modified.format("%Y-%m-%d %H:%M:%S"),
            format!("{}/{}", session.provider, session.model),
            format_size(session.size_bytes),
            marker
        )?;
    }
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

/// Delete one session's data file.
///
/// Refuses while a live process holds the lock. The lock is held for the
/// duration of the delete; a stale one is taken over and removed.
pub fn delete_session_command(
    ctx: &CommandContext,
    reference: &str,
    out: &mut dyn Write,
    err: &mut dyn Write,
) -> i32 {
    match delete_session(ctx, reference) {
        Ok(session) => {
            let _ = writeln!(
                out,
                "Deleted session {} ({})",
                session.session_id,
                session.file_name()
            );
            EXIT_SUCCESS
        }
        Err(e) => fail(err, &e),
    }
}

fn delete_session(ctx: &CommandContext, reference: &str) -> SessionResult<SessionSummary> {
    let sessions = ctx.sessions()?;
    let session = resolve_session_ref(reference, &sessions)?.clone();

    // Hold the lock across the delete so a concurrent resume can't claim it.
    let mut lock = ctx.locks.acquire(&session.session_id)?;
    let removed = std::fs::remove_file(&session.file_path)
        .map_err(|e| SessionError::io(&session.file_path, e));
    lock.release();
    removed?;

    tracing::info!(
        session_id = %session.session_id,
        path = %session.file_path.display(),
        "Deleted session"
    );
    Ok(session)
}

/// Resume a session. On failure prints the error and returns the exit code.
pub async fn continue_command(
    ctx: &CommandContext,
    request: ResumeRequest,
    out: &mut dyn Write,
    err: &mut dyn Write,
) -> Result<ResumedSession, i32> {
    match resume_session(request, &ctx.locks).await {
        Ok(resumed) => {
            let _ = writeln!(
                out,
                "Resumed session {} ({} items)",
                resumed.session_id,
                resumed.history.len()
            );
            if resumed.provider_switched {
                let _ = writeln!(
                    out,
                    "Recorded with {}/{}; continuing with the current provider.",
                    resumed.recorded_metadata.provider, resumed.recorded_metadata.model
                );
            }
            for warning in &resumed.warnings {
                let _ = writeln!(err, "Warning: {}", warning);
            }
            Ok(resumed)
        }
        Err(e) => Err(fail(err, &e)),
    }
}

/// Apply a retention policy and print a one-line report.
pub fn cleanup_command(
    ctx: &CommandContext,
    policy: &RetentionPolicy,
    out: &mut dyn Write,
    err: &mut dyn Write,
) -> i32 {
    match cleanup_sessions(&ctx.chats_dir, &ctx.project_hash, policy, &ctx.locks) {
        Ok(report) => {
            let _ = writeln!(
                out,
                "Deleted {} session(s), removed {} stale lock(s), skipped {} active session(s).",
                report.deleted.len(),
                report.stale_locks_removed,
                report.skipped_active
            );
            EXIT_SUCCESS
        }
        Err(e) => fail(err, &e),
    }
}

fn fail(err: &mut dyn Write, error: &SessionError) -> i32 {
    tracing::debug!(error = %error, "Session command failed");
    let _ = writeln!(err, "Error: {}", error);
    EXIT_FAILURE
}
