//! Cross-process advisory locks for session files.
//!
//! One lock file per session at `<chats_dir>/<session_id>.lock`, created with
//! `O_EXCL` and holding the owner's PID. The path depends only on the session
//! ID, so a lock can be taken before the data file exists.
//!
//! The owner also holds an exclusive `flock` on the file for as long as the
//! handle lives. Taking over or removing a stale lock first takes that flock
//! and checks the path still names the same file, so two processes can never
//! both claim one session.

use std::fs::File;
use std::io::{ErrorKind, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use thiserror::Error;

use crate::replay::read_session_header;

pub const LOCK_FILE_EXTENSION: &str = "lock";

/// Unheld locks older than this are stale even if their PID is alive (PID reuse).
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(48 * 60 * 60);

/// Window between creating a lock and writing its PID.
pub const DEFAULT_WRITE_GRACE: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Session {session_id} is in use by another process{}", owner_suffix(.pid))]
    InUse {
        session_id: String,
        pid: Option<u32>,
    },

    #[error("Lock file error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn owner_suffix(pid: &Option<u32>) -> String {
    pid.map(|p| format!(" (pid {})", p)).unwrap_or_default()
}

pub type LockResult<T> = std::result::Result<T, LockError>;

#[derive(Clone, Debug)]
pub struct LockConfig {
    pub stale_after: Duration,
    pub write_grace: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after: DEFAULT_STALE_AFTER,
            write_grace: DEFAULT_WRITE_GRACE,
        }
    }
}

/// Result of releasing a lock. Release never fails loudly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// Already released, removed externally, or taken over by another owner.
    AlreadyReleased,
    Failed(String),
}

impl ReleaseOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, ReleaseOutcome::Failed(_))
    }
}

#[derive(Clone, Debug)]
pub struct SessionLockManager {
    lock_dir: PathBuf,
    config: LockConfig,
}

impl SessionLockManager {
    pub fn new(lock_dir: impl Into<PathBuf>) -> Self {
        Self::with_config(lock_dir, LockConfig::default())
    }

    pub fn with_config(lock_dir: impl Into<PathBuf>, config: LockConfig) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            config,
        }
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    pub fn lock_path(&self, session_id: &str) -> PathBuf {
        let name: String = session_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.lock_dir
            .join(format!("{}.{}", name, LOCK_FILE_EXTENSION))
    }

    /// Take the lock for `session_id`, taking over a stale one.
    pub fn acquire(&self, session_id: &str) -> LockResult<LockHandle> {
        let path = self.lock_path(session_id);
        std::fs::create_dir_all(&self.lock_dir).map_err(|source| LockError::Io {
            path: self.lock_dir.clone(),
            source,
        })?;
        let in_use = |path: &Path| LockError::InUse {
            session_id: session_id.to_string(),
            pid: read_pid(path),
        };

        match create_lock_file(&path) {
            Ok(handle) => return Ok(handle.with_session(session_id)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Err(in_use(&path)),
            Err(source) => return Err(LockError::Io { path, source }),
        }

        if !self.check_stale(&path) {
            return Err(in_use(&path));
        }

        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };
        let Some(file) = self.claim_stale(&path).map_err(io_err)? else {
            return Err(in_use(&path));
        };

        tracing::warn!(
            session_id = %session_id,
            path = %path.display(),
            previous_owner = ?read_pid(&path),
            "Taking over stale session lock"
        );
        let handle = write_owner(file, &path).map_err(io_err)?;
        Ok(handle.with_session(session_id))
    }

    /// Idempotent best-effort release.
    pub fn release(&self, handle: &mut LockHandle) -> ReleaseOutcome {
        handle.release()
    }

    /// True when a live, non-stale lock exists for the session.
    pub fn is_locked(&self, session_id: &str) -> bool {
        let path = self.lock_path(session_id);
        path.exists() && !self.check_stale(&path)
    }

    /// Like [`is_locked`](Self::is_locked), keyed by data file path.
    pub fn is_locked_for_file(&self, data_path: &Path) -> bool {
        read_session_header(data_path)
            .map(|header| self.is_locked(&header.session_id))
            .unwrap_or(false)
    }

    /// Whether the lock at `lock_path` may be removed.
    ///
    /// A missing lock is not stale, and neither is one whose flock is held.
    /// Otherwise a lock is stale when it is older than `stale_after`, when
    /// its PID is not running, or when its content is unparsable past the
    /// write grace period.
    pub fn check_stale(&self, lock_path: &Path) -> bool {
        let Ok(mut file) = File::open(lock_path) else {
            return false;
        };
        if matches!(try_flock(&file), Ok(false)) {
            return false;
        }
        self.is_stale_file(&mut file).unwrap_or(false)
    }

    fn is_stale_file(&self, file: &mut File) -> std::io::Result<bool> {
        let age = file
            .metadata()?
            .modified()
            .ok()
            .and_then(|m| SystemTime::now().duration_since(m).ok())
            .unwrap_or_default();

        if age > self.config.stale_after {
            return Ok(true);
        }

        let mut content = String::new();
        file.rewind()?;
        file.read_to_string(&mut content)?;
        Ok(match content.trim().parse::<u32>().ok() {
            Some(pid) if pid == std::process::id() => false,
            Some(pid) => !process_alive(pid),
            None => age > self.config.write_grace,
        })
    }

    /// Open and flock the lock at `path` if it is still stale.
    ///
    /// `None` when another process holds it, it vanished or was replaced, or
    /// it is no longer stale. Owners hold the flock, so the verdict taken here
    /// cannot change until the returned file is dropped.
    fn claim_stale(&self, path: &Path) -> std::io::Result<Option<File>> {
        let mut file = match File::options().read(true).write(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        if !try_flock(&file)? || !same_file(&file, path)? {
            return Ok(None);
        }
        if !self.is_stale_file(&mut file)? {
            return Ok(None);
        }
        Ok(Some(file))
    }

    /// Remove the session's lock if stale. Returns whether a file was removed.
    ///
    /// Never touches the session's data file.
    pub fn remove_stale_lock(&self, session_id: &str) -> LockResult<bool> {
        self.remove_stale_lock_at(&self.lock_path(session_id))
    }

    /// Remove a lock file by path if stale (used for orphaned locks).
    pub(crate) fn remove_stale_lock_at(&self, lock_path: &Path) -> LockResult<bool> {
        if !self.check_stale(lock_path) {
            return Ok(false);
        }
        let io_err = |source| LockError::Io {
            path: lock_path.to_path_buf(),
            source,
        };
        let Some(file) = self.claim_stale(lock_path).map_err(io_err)? else {
            return Ok(false);
        };

        // Unlink while the flock is held; late openers see a different file.
        let removed = remove_lock_file(lock_path);
        drop(file);
        removed
    }

    pub fn owner_pid(&self, session_id: &str) -> Option<u32> {
        read_pid(&self.lock_path(session_id))
    }
}

fn remove_lock_file(path: &Path) -> LockResult<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::warn!(path = %path.display(), "Removed stale session lock");
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(source) => Err(LockError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn create_lock_file(path: &Path) -> std::io::Result<LockHandle> {
    let file = File::options()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)?;

    // Lost a race with a takeover of the brand-new file; leave it to them.
    if !try_flock(&file)? {
        return Err(ErrorKind::WouldBlock.into());
    }

    write_owner(file, path).inspect_err(|_| {
        let _ = std::fs::remove_file(path);
    })
}

/// Replace the lock content with this process's PID and wrap it in a handle.
fn write_owner(mut file: File, path: &Path) -> std::io::Result<LockHandle> {
    let pid = std::process::id();
    file.set_len(0)?;
    file.rewind()?;
    file.write_all(pid.to_string().as_bytes())?;

    tracing::debug!(path = %path.display(), pid, "Acquired session lock");
    Ok(LockHandle {
        session_id: String::new(),
        path: path.to_path_buf(),
        pid,
        file: Some(file),
    })
}

/// Non-blocking exclusive flock. `Ok(false)` when another open file holds it.
#[cfg(unix)]
fn try_flock(file: &File) -> std::io::Result<bool> {
    use rustix::fs::{FlockOperation, flock};
    use rustix::io::Errno;

    match flock(file, FlockOperation::NonBlockingLockExclusive) {
        Ok(()) => Ok(true),
        Err(Errno::WOULDBLOCK) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(unix))]
fn try_flock(_file: &File) -> std::io::Result<bool> {
    Ok(true)
}

/// Whether `path` still names the open `file`.
#[cfg(unix)]
fn same_file(file: &File, path: &Path) -> std::io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let open = file.metadata()?;
    match std::fs::metadata(path) {
        Ok(linked) => Ok(open.dev() == linked.dev() && open.ino() == linked.ino()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(not(unix))]
fn same_file(_file: &File, path: &Path) -> std::io::Result<bool> {
    Ok(path.exists())
}

fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use rustix::io::Errno;
    use rustix::process::{Pid, test_kill_process};

    let Some(pid) = i32::try_from(pid).ok().and_then(Pid::from_raw) else {
        return false;
    };
    match test_kill_process(pid) {
        Ok(()) => true,
        // Exists but owned by another user.
        Err(Errno::PERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

/// Ownership of one session lock. Released on drop if not released earlier.
#[derive(Debug)]
pub struct LockHandle {
    session_id: String,
    path: PathBuf,
    pid: u32,
    /// Open lock file carrying the flock; `None` once released.
    file: Option<File>,
}

impl LockHandle {
    fn with_session(mut self, session_id: &str) -> Self {
        self.session_id = session_id.to_string();
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_released(&self) -> bool {
        self.file.is_none()
    }

    /// Remove the lock file if it still names this process, then drop the
    /// flock.
    pub fn release(&mut self) -> ReleaseOutcome {
        let Some(file) = self.file.take() else {
            return ReleaseOutcome::AlreadyReleased;
        };
        let outcome = self.remove_if_owned();
        drop(file);
        outcome
    }

    fn remove_if_owned(&self) -> ReleaseOutcome {
        match read_pid(&self.path) {
            Some(pid) if pid == self.pid => {}
            Some(other) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    path = %self.path.display(),
                    owner = other,
                    "Session lock now owned by another process; leaving it"
                );
                return ReleaseOutcome::AlreadyReleased;
            }
            None if !self.path.exists() => return ReleaseOutcome::AlreadyReleased,
            None => {}
        }

        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!(session_id = %self.session_id, "Released session lock");
                ReleaseOutcome::Released
            }
            Err(e) if e.kind() == ErrorKind::NotFound => ReleaseOutcome::AlreadyReleased,
            Err(e) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    path = %self.path.display(),
                    error = %e,
                    "Failed to release session lock"
                );
                ReleaseOutcome::Failed(e.to_string())
            }
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn dead_pid() -> u32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    #[test]
    fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let manager = SessionLockManager::new(dir.path());

        let mut handle = manager.acquire("abc").unwrap();
        assert_eq!(handle.path(), dir.path().join("abc.lock"));
        assert!(manager.is_locked("abc"));
        assert_eq!(manager.owner_pid("abc"), Some(std::process::id()));

        assert_eq!(manager.release(&mut handle), ReleaseOutcome::Released);
        assert_eq!(manager.release(&mut handle), ReleaseOutcome::AlreadyReleased);
        assert!(!manager.is_locked("abc"));
    }

    #[test]
    fn test_second_acquire_is_in_use() {
        let dir = TempDir::new().unwrap();
        let first = SessionLockManager::new(dir.path());
        let second = SessionLockManager::new(dir.path());

        let _handle = first.acquire("abc").unwrap();
        let err = second.acquire("abc").unwrap_err();
        assert!(matches!(
            err,
            LockError::InUse { pid: Some(pid), .. } if pid == std::process::id()
        ));
        assert!(err.to_string().contains("in use"));
    }

    #[test]
    fn test_drop_releases() {
        let dir = TempDir::new().unwrap();
        let manager = SessionLockManager::new(dir.path());
        {
            let _handle = manager.acquire("abc").unwrap();
            assert!(manager.lock_path("abc").exists());
        }
        assert!(!manager.lock_path("abc").exists());
    }

    #[test]
    fn test_dead_pid_is_stale_and_reacquired() {
        let dir = TempDir::new().unwrap();
        let manager = SessionLockManager::new(dir.path());
        let path = manager.lock_path("abc");
        std::fs::write(&path, dead_pid().to_string()).unwrap();

        assert!(manager.check_stale(&path));
        assert!(!manager.is_locked("abc"));

        let handle = manager.acquire("abc").unwrap();
        assert_eq!(
            std::fs::read_to_string(handle.path()).unwrap(),
            std::process::id().to_string()
        );
    }

    #[test]
    fn test_age_ceiling_overrides_live_pid() {
        let dir = TempDir::new().unwrap();
        let manager = SessionLockManager::with_config(
            dir.path(),
            LockConfig {
                stale_after: Duration::from_secs(60),
                ..Default::default()
            },
        );
        let path = manager.lock_path("abc");
        std::fs::write(&path, "1").unwrap();
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(3600))
            .unwrap();

        assert!(manager.check_stale(&path));
    }

    #[test]
    fn test_unparsable_lock_respects_grace() {
        let dir = TempDir::new().unwrap();
        let manager = SessionLockManager::new(dir.path());
        let path = manager.lock_path("abc");
        std::fs::write(&path, "").unwrap();
        assert!(!manager.check_stale(&path));

        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(10))
            .unwrap();
        assert!(manager.check_stale(&path));
    }

    #[test]
    fn test_remove_stale_lock_only_when_stale() {
        let dir = TempDir::new().unwrap();
        let manager = SessionLockManager::new(dir.path());

        let _live = manager.acquire("live").unwrap();
        assert!(!manager.remove_stale_lock("live").unwrap());
        assert!(manager.lock_path("live").exists());

        std::fs::write(manager.lock_path("dead"), dead_pid().to_string()).unwrap();
        assert!(manager.remove_stale_lock("dead").unwrap());
        assert!(!manager.lock_path("dead").exists());
        assert!(!manager.remove_stale_lock("dead").unwrap());
    }

    #[test]
    fn test_stale_takeover_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let first = SessionLockManager::new(dir.path());
        let second = SessionLockManager::new(dir.path());
        std::fs::write(first.lock_path("abc"), dead_pid().to_string()).unwrap();

        let mut handle = first.acquire("abc").unwrap();
        assert!(matches!(second.acquire("abc"), Err(LockError::InUse { .. })));
        assert!(!second.remove_stale_lock("abc").unwrap());
        assert_eq!(second.owner_pid("abc"), Some(std::process::id()));

        assert_eq!(handle.release(), ReleaseOutcome::Released);
        assert!(!first.lock_path("abc").exists());
    }

    #[test]
    fn test_held_lock_survives_age_ceiling() {
        let dir = TempDir::new().unwrap();
        let manager = SessionLockManager::with_config(
            dir.path(),
            LockConfig {
                stale_after: Duration::from_secs(60),
                ..Default::default()
            },
        );
        let _handle = manager.acquire("abc").unwrap();
        let path = manager.lock_path("abc");
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(3600))
            .unwrap();

        assert!(!manager.check_stale(&path));
        assert!(!manager.remove_stale_lock("abc").unwrap());
        assert!(matches!(
            SessionLockManager::new(dir.path()).acquire("abc"),
            Err(LockError::InUse { .. })
        ));
        assert!(path.exists());
    }

    #[test]
    fn test_release_leaves_foreign_lock() {
        let dir = TempDir::new().unwrap();
        let manager = SessionLockManager::new(dir.path());
        let mut handle = manager.acquire("abc").unwrap();
        std::fs::write(handle.path(), "999999").unwrap();

        assert_eq!(handle.release(), ReleaseOutcome::AlreadyReleased);
        assert!(manager.lock_path("abc").exists());
    }

    #[test]
    fn test_lock_path_is_sanitized() {
        let manager = SessionLockManager::new("/locks");
        assert_eq!(
            manager.lock_path("../etc/passwd"),
            PathBuf::from("/locks/___etc_passwd.lock")
        );
    }
}
