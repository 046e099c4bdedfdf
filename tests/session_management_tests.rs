//! Locking, discovery, retention, resume and command handlers together.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use session_recorder::session::commands::{EXIT_FAILURE, EXIT_SUCCESS};
use session_recorder::session::{
    CommandContext, cleanup_command, delete_session_command, list_sessions_command,
};
use session_recorder::types::Content;
use session_recorder::{
    HistoryService, LockError, RecordEvent, RecordingConfig, RecordingSession, ResolveError,
    ResumeRequest, RetentionPolicy, SessionError, SessionLockManager, SessionRecordingService,
    cleanup_sessions, list_sessions, replay_session, resolve_session_ref, resume_session,
};
use tempfile::TempDir;

fn config(dir: &Path, session_id: &str) -> RecordingConfig {
    RecordingConfig::builder()
        .session_id(session_id)
        .project_hash("H")
        .chats_dir(dir)
        .provider("p1")
        .model("m1")
        .build()
        .unwrap()
}

async fn record(dir: &Path, session_id: &str, texts: &[&str]) -> PathBuf {
    let service = SessionRecordingService::new(config(dir, session_id));
    for text in texts {
        service.enqueue(RecordEvent::content(Content::user(*text)));
    }
    service.flush().await.unwrap();
    service.get_file_path().unwrap()
}

fn age(path: &Path, by: Duration) {
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() - by).unwrap();
}

fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

mod lock_tests {
    use super::*;

    #[test]
    fn test_independent_managers_contend() {
        let temp = TempDir::new().unwrap();
        let a = SessionLockManager::new(temp.path());
        let b = SessionLockManager::new(temp.path());

        let mut handle = a.acquire("s1").unwrap();
        assert!(matches!(b.acquire("s1"), Err(LockError::InUse { .. })));
        assert!(b.is_locked("s1"));

        a.release(&mut handle);
        assert!(b.acquire("s1").is_ok());
    }

    #[tokio::test]
    async fn test_is_locked_for_file_uses_header() {
        let temp = TempDir::new().unwrap();
        let path = record(temp.path(), "by-file", &["a"]).await;
        let locks = SessionLockManager::new(temp.path());

        assert!(!locks.is_locked_for_file(&path));
        let _handle = locks.acquire("by-file").unwrap();
        assert!(locks.is_locked_for_file(&path));
    }
}

mod discovery_tests {
    use super::*;

    #[tokio::test]
    async fn test_list_and_resolve() {
        let temp = TempDir::new().unwrap();
        let older = record(temp.path(), "aaaa1111-old", &["a"]).await;
        age(&older, Duration::from_secs(120));
        record(temp.path(), "bbbb2222-new", &["b"]).await;

        let sessions = list_sessions(temp.path(), "H").unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].session_id, "bbbb2222-new");
        assert!(list_sessions(temp.path(), "other").unwrap().is_empty());

        assert_eq!(
            resolve_session_ref("2", &sessions).unwrap().session_id,
            "aaaa1111-old"
        );
        assert_eq!(
            resolve_session_ref("bbbb", &sessions).unwrap().session_id,
            "bbbb2222-new"
        );
        assert!(matches!(
            resolve_session_ref("zzz", &sessions),
            Err(ResolveError::NotFound { .. })
        ));
    }
}

mod retention_tests {
    use super::*;

    #[tokio::test]
    async fn test_stale_lock_is_not_a_delete_reason() {
        let temp = TempDir::new().unwrap();
        let path = record(temp.path(), "crashed", &["keep me"]).await;
        let locks = SessionLockManager::new(temp.path());
        std::fs::write(locks.lock_path("crashed"), dead_pid().to_string()).unwrap();

        let report = cleanup_sessions(
            temp.path(),
            "H",
            &RetentionPolicy::new().max_age_days(7).max_count(10),
            &locks,
        )
        .unwrap();

        assert_eq!(report.stale_locks_removed, 1);
        assert!(report.deleted.is_empty());
        assert!(path.exists());
        assert!(!locks.lock_path("crashed").exists());
    }

    #[tokio::test]
    async fn test_cleanup_command_reports() {
        let temp = TempDir::new().unwrap();
        let old = record(temp.path(), "ancient", &["a"]).await;
        age(&old, DAY * 100);
        let fresh = record(temp.path(), "recent", &["b"]).await;
        let ctx = CommandContext::new(temp.path(), "H");

        let mut out = Vec::new();
        let mut err = Vec::new();
        let code = cleanup_command(
            &ctx,
            &RetentionPolicy::new().max_age_days(30),
            &mut out,
            &mut err,
        );

        assert_eq!(code, EXIT_SUCCESS);
        assert!(!old.exists());
        assert!(fresh.exists());
        assert!(String::from_utf8(out).unwrap().starts_with("Deleted 1 session(s)"));
    }
}

mod resume_tests {
    use super::*;

    #[tokio::test]
    async fn test_full_lifecycle() {
        let temp = TempDir::new().unwrap();
        let locks = SessionLockManager::new(temp.path());

        let mut history = HistoryService::new();
        let session =
            RecordingSession::start(config(temp.path(), "life"), &history, &locks).unwrap();
        history.add(Content::user("one"));
        history.add(Content::model("two"));
        session.integration().flush_at_turn_boundary().await.unwrap();
        let path = session.recording().get_file_path().unwrap();

        let busy = resume_session(ResumeRequest::new(config(temp.path(), "x")), &locks).await;
        assert!(matches!(
            busy,
            Err(SessionError::Lock(LockError::InUse { .. }))
        ));

        session.close().await.unwrap();

        let resumed = resume_session(
            ResumeRequest::new(config(temp.path(), "x")).with_reference("life"),
            &locks,
        )
        .await
        .unwrap();
        let (session, mut history) = RecordingSession::from_resumed(resumed);
        assert_eq!(history.items(), &[Content::user("one"), Content::model("two")]);

        history.add(Content::user("three"));
        session.close().await.unwrap();
        assert!(!locks.is_locked("life"));

        let replayed = replay_session(&path, "H").await.unwrap();
        assert_eq!(replayed.history.len(), 3);
        assert_eq!(replayed.last_seq, 4);
        assert_eq!(list_sessions(temp.path(), "H").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resume_after_crash_tail_keeps_new_turns() {
        use std::io::Write;

        let temp = TempDir::new().unwrap();
        let path = record(temp.path(), "crashy", &["a"]).await;
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"v":1,"seq":3,"ts":"2026-"#).unwrap();
        drop(file);

        let locks = SessionLockManager::new(temp.path());
        let resumed = resume_session(
            ResumeRequest::new(config(temp.path(), "x")).with_reference("crashy"),
            &locks,
        )
        .await
        .unwrap();
        let (session, mut history) = RecordingSession::from_resumed(resumed);
        history.add(Content::user("b"));
        history.add(Content::user("c"));
        session.close().await.unwrap();

        let replayed = replay_session(&path, "H").await.unwrap();
        assert_eq!(
            replayed.history,
            vec![Content::user("a"), Content::user("b"), Content::user("c")]
        );
        assert!(replayed.warnings.is_empty());
        assert!(!replayed.stats.truncated_tail);
        assert_eq!(replayed.last_seq, 4);
    }
}

mod command_tests {
    use super::*;

    #[tokio::test]
    async fn test_list_then_delete() {
        let temp = TempDir::new().unwrap();
        let path = record(temp.path(), "doomed-session", &["a"]).await;
        let ctx = CommandContext::new(temp.path(), "H");

        let mut out = Vec::new();
        let mut err = Vec::new();
        assert_eq!(list_sessions_command(&ctx, &mut out, &mut err), EXIT_SUCCESS);
        assert!(String::from_utf8(out).unwrap().contains("doomed-s"));

        let mut out = Vec::new();
        assert_eq!(
            delete_session_command(&ctx, "doomed", &mut out, &mut err),
            EXIT_SUCCESS
        );
        assert!(!path.exists());

        let mut err = Vec::new();
        assert_eq!(
            delete_session_command(&ctx, "doomed", &mut out, &mut err),
            EXIT_FAILURE
        );
        assert!(String::from_utf8(err).unwrap().contains("No sessions"));
    }

    #[tokio::test]
    async fn test_delete_clears_stale_lock() {
        let temp = TempDir::new().unwrap();
        let path = record(temp.path(), "orphan", &["a"]).await;
        let ctx = CommandContext::new(temp.path(), "H");
        std::fs::write(ctx.locks.lock_path("orphan"), dead_pid().to_string()).unwrap();

        let mut out = Vec::new();
        let mut err = Vec::new();
        assert_eq!(
            delete_session_command(&ctx, "orphan", &mut out, &mut err),
            EXIT_SUCCESS
        );
        assert!(!path.exists());
        assert!(!ctx.locks.lock_path("orphan").exists());
    }
}
