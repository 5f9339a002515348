//! Directory lock serializing engine operations on one session.
//!
//! `create_dir` is atomic on every supported platform, so the lock directory
//! itself is the mutex. The holder writes `owner.json` inside it and keeps an
//! advisory fd lock on that file for as long as the guard lives. Waiters poll
//! until the configured bound and then give up with a retryable error; they
//! never block indefinitely.
//!
//! A lock is reclaimable when nobody holds the fd lock on its owner file and
//! either the owning PID is gone or the lock is older than the stale threshold.
//! Reclaiming renames the directory aside before removing it so two waiters
//! cannot both delete a freshly re-acquired lock.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use fd_lock::RwLock;
use phaseguard_utils::error::{ErrorCategory, UserFriendlyError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::process;
use std::thread;
use std::time::{Duration, Instant};

const OWNER_FILE: &str = "owner.json";

/// Seconds a lock directory without a readable owner file is given to finish
/// initialising before it is treated as abandoned.
const OWNERLESS_GRACE_SECS: i64 = 10;

/// Bounds for acquiring a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// Total time to keep polling before reporting contention
    pub wait: Duration,
    /// Delay between polls
    pub poll: Duration,
    /// Age after which an unheld lock is reclaimed
    pub stale_after: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            wait: Duration::from_millis(2000),
            poll: Duration::from_millis(50),
            stale_after: Duration::from_secs(3600),
        }
    }
}

/// Contents of `owner.json` inside the lock directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOwner {
    pub pid: u32,
    pub created_at: DateTime<Utc>,
    /// Session the holder is working on, for diagnostics
    pub holder: String,
    pub engine_version: String,
}

#[derive(thiserror::Error, Debug)]
pub enum LockError {
    #[error("Lock at '{path}' is held by PID {pid} (waited {waited_ms}ms)")]
    Contention {
        path: String,
        pid: u32,
        waited_ms: u64,
    },

    #[error("Lock owner file is corrupted or invalid: {reason}")]
    CorruptedLock { reason: String },

    #[error("Failed to acquire lock: {reason}")]
    AcquisitionFailed { reason: String },

    #[error("Failed to release lock: {reason}")]
    ReleaseFailed { reason: String },

    #[error("IO error during lock operation: {0}")]
    Io(#[from] io::Error),
}

impl LockError {
    /// Contention clears on its own; everything else needs attention.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Contention { .. })
    }
}

impl UserFriendlyError for LockError {
    fn user_message(&self) -> String {
        match self {
            Self::Contention { pid, .. } => {
                format!("Another phaseguard process (PID {pid}) is working on this session")
            }
            other => other.to_string(),
        }
    }

    fn context(&self) -> Option<String> {
        match self {
            Self::Contention { path, waited_ms, .. } => {
                Some(format!("Waited {waited_ms}ms for '{path}' to be released"))
            }
            _ => None,
        }
    }

    fn suggestions(&self) -> Vec<String> {
        match self {
            Self::Contention { .. } => vec![
                "Retry once the other operation finishes".to_string(),
                "Raise [lock] wait_ms in .phaseguard/config.toml for slow disks".to_string(),
            ],
            _ => vec!["Remove the .lock.d directory if no phaseguard process is running".to_string()],
        }
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Concurrency
    }
}

/// Held session lock. Released on drop.
pub struct SessionLock {
    dir: Utf8PathBuf,
    owner: LockOwner,
    /// Keeps the owner file open; the advisory lock lives as long as the handle.
    _fd_lock: Option<Box<RwLock<fs::File>>>,
    released: bool,
}

impl SessionLock {
    /// Acquire the lock directory `dir`, polling within `opts.wait`.
    pub fn acquire(dir: &Utf8Path, holder: &str, opts: &LockOptions) -> Result<Self, LockError> {
        if let Some(parent) = dir.parent() {
            phaseguard_utils::paths::ensure_dir_all(parent).map_err(|e| {
                LockError::AcquisitionFailed {
                    reason: format!("Failed to create '{parent}': {e}"),
                }
            })?;
        }

        let started = Instant::now();
        loop {
            match fs::create_dir(dir) {
                Ok(()) => return Self::finalize(dir, holder),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    match Self::inspect_existing(dir, opts.stale_after) {
                        Existing::Reclaimable(reason) => {
                            tracing::warn!(lock = %dir, %reason, "reclaiming stale lock");
                            Self::remove_stale(dir)?;
                            continue;
                        }
                        Existing::Gone => continue,
                        Existing::Held(pid) => {
                            let waited = started.elapsed();
                            if waited >= opts.wait {
                                return Err(LockError::Contention {
                                    path: dir.to_string(),
                                    pid,
                                    waited_ms: u64::try_from(waited.as_millis())
                                        .unwrap_or(u64::MAX),
                                });
                            }
                            let remaining = opts.wait.saturating_sub(waited);
                            thread::sleep(opts.poll.min(remaining).max(Duration::from_millis(1)));
                        }
                    }
                }
                Err(e) => {
                    return Err(LockError::AcquisitionFailed {
                        reason: format!("Failed to create lock directory '{dir}': {e}"),
                    });
                }
            }
        }
    }

    fn finalize(dir: &Utf8Path, holder: &str) -> Result<Self, LockError> {
        let owner = LockOwner {
            pid: process::id(),
            created_at: Utc::now(),
            holder: holder.to_string(),
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
        };
        let json = serde_json::to_string_pretty(&owner).map_err(|e| {
            LockError::AcquisitionFailed {
                reason: format!("Failed to serialize lock owner: {e}"),
            }
        })?;

        let file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(dir.join(OWNER_FILE))
            .map_err(|e| {
                let _ = fs::remove_dir(dir);
                LockError::AcquisitionFailed {
                    reason: format!("Failed to create owner file in '{dir}': {e}"),
                }
            })?;

        let mut rw_lock = Box::new(RwLock::new(file));
        {
            let guard = rw_lock.try_write().map_err(|e| LockError::AcquisitionFailed {
                reason: format!("Failed to lock owner file in '{dir}': {e}"),
            })?;
            let mut file_ref = &*guard;
            file_ref.write_all(json.as_bytes())?;
            file_ref.flush()?;
            file_ref.sync_all()?;
            // Held until the file handle closes with `_fd_lock`.
            std::mem::forget(guard);
        }

        tracing::debug!(lock = %dir, pid = owner.pid, "lock acquired");
        Ok(Self {
            dir: dir.to_path_buf(),
            owner,
            _fd_lock: Some(rw_lock),
            released: false,
        })
    }

    fn inspect_existing(dir: &Utf8Path, stale_after: Duration) -> Existing {
        let owner_path = dir.join(OWNER_FILE);
        let owner = match read_owner(&owner_path) {
            Ok(Some(owner)) => owner,
            Ok(None) | Err(_) => {
                if !dir.exists() {
                    return Existing::Gone;
                }
                let age = dir_age_secs(dir);
                return if age > OWNERLESS_GRACE_SECS {
                    Existing::Reclaimable(format!("owner file missing for {age}s"))
                } else {
                    Existing::Held(0)
                };
            }
        };

        if owner_file_is_held(&owner_path) {
            return Existing::Held(owner.pid);
        }

        let age = Utc::now()
            .signed_duration_since(owner.created_at)
            .num_seconds()
            .max(0);
        let stale_secs = i64::try_from(stale_after.as_secs()).unwrap_or(i64::MAX);
        if !is_process_running(owner.pid) {
            Existing::Reclaimable(format!("owner PID {} is not running", owner.pid))
        } else if age > stale_secs {
            Existing::Reclaimable(format!("lock is {age}s old"))
        } else {
            Existing::Held(owner.pid)
        }
    }

    /// Rename aside, then delete, so a concurrently re-created lock survives.
    fn remove_stale(dir: &Utf8Path) -> Result<(), LockError> {
        let stamp = Utc::now().timestamp_millis();
        let aside = Utf8PathBuf::from(format!("{dir}.stale.{stamp}.{}", process::id()));
        match fs::rename(dir, &aside) {
            Ok(()) => {
                let _ = fs::remove_dir_all(&aside);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LockError::AcquisitionFailed {
                reason: format!("Failed to move stale lock '{dir}' aside: {e}"),
            }),
        }
    }

    /// Owner of the lock at `dir`, if one exists.
    pub fn owner_of(dir: &Utf8Path) -> Result<Option<LockOwner>, LockError> {
        read_owner(&dir.join(OWNER_FILE))
    }

    #[must_use]
    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }

    #[must_use]
    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    /// Release explicitly, surfacing any cleanup failure.
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self._fd_lock.take();
        fs::remove_dir_all(&self.dir).map_err(|e| LockError::ReleaseFailed {
            reason: format!("Failed to remove '{}': {e}", self.dir),
        })
    }
}

impl std::fmt::Debug for SessionLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLock")
            .field("dir", &self.dir)
            .field("owner", &self.owner)
            .field("_fd_lock", &"<RwLock>")
            .finish()
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self._fd_lock.take();
        let _ = fs::remove_dir_all(&self.dir);
    }
}

enum Existing {
    Held(u32),
    Reclaimable(String),
    Gone,
}

fn read_owner(path: &Utf8Path) -> Result<Option<LockOwner>, LockError> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(LockError::Io(e)),
    };
    if content.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| LockError::CorruptedLock {
            reason: format!("Failed to parse '{path}': {e}"),
        })
}

fn owner_file_is_held(path: &Utf8Path) -> bool {
    let Ok(file) = fs::OpenOptions::new().read(true).write(true).open(path) else {
        return false;
    };
    let mut probe = RwLock::new(file);
    probe.try_write().is_err()
}

fn dir_age_secs(dir: &Utf8Path) -> i64 {
    fs::metadata(dir)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.elapsed().ok())
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

/// Check if a process with the given PID is still running
fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        if raw <= 0 {
            return false;
        }
        // kill(pid, 0) probes without signalling; EPERM means it exists.
        let rc = unsafe { libc::kill(raw, 0) };
        if rc == 0 {
            true
        } else {
            matches!(
                io::Error::last_os_error().raw_os_error(),
                Some(code) if code == libc::EPERM
            )
        }
    }

    #[cfg(windows)]
    {
        use winapi::um::handleapi::CloseHandle;
        use winapi::um::minwinbase::STILL_ACTIVE;
        use winapi::um::processthreadsapi::{GetExitCodeProcess, OpenProcess};
        use winapi::um::winnt::PROCESS_QUERY_LIMITED_INFORMATION;

        unsafe {
            let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
            if handle.is_null() {
                return false;
            }
            let mut exit_code: u32 = 0;
            let ok = GetExitCodeProcess(handle, &mut exit_code);
            CloseHandle(handle);
            ok != 0 && exit_code == STILL_ACTIVE
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn lock_dir(temp: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(temp.path().join("run").join(".lock.d")).unwrap()
    }

    fn quick() -> LockOptions {
        LockOptions {
            wait: Duration::from_millis(120),
            poll: Duration::from_millis(20),
            stale_after: Duration::from_secs(3600),
        }
    }

    #[test]
    fn test_acquire_and_release() {
        let temp = TempDir::new().unwrap();
        let dir = lock_dir(&temp);

        let lock = SessionLock::acquire(&dir, "fp/run", &quick()).unwrap();
        assert!(dir.join(OWNER_FILE).exists());
        let owner = SessionLock::owner_of(&dir).unwrap().unwrap();
        assert_eq!(owner.pid, process::id());
        assert_eq!(owner.holder, "fp/run");

        lock.release().unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn test_second_acquire_times_out_with_contention() {
        let temp = TempDir::new().unwrap();
        let dir = lock_dir(&temp);
        let _held = SessionLock::acquire(&dir, "a", &quick()).unwrap();

        let started = Instant::now();
        let err = SessionLock::acquire(&dir, "b", &quick()).unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, LockError::Contention { pid, .. } if pid == process::id()));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_drop_releases() {
        let temp = TempDir::new().unwrap();
        let dir = lock_dir(&temp);
        {
            let _lock = SessionLock::acquire(&dir, "a", &quick()).unwrap();
            assert!(dir.exists());
        }
        assert!(!dir.exists());
        SessionLock::acquire(&dir, "a", &quick()).unwrap();
    }

    #[test]
    fn test_dead_owner_is_reclaimed() {
        let temp = TempDir::new().unwrap();
        let dir = lock_dir(&temp);
        fs::create_dir_all(&dir).unwrap();
        let ghost = LockOwner {
            pid: 0x7FFF_FFF0,
            created_at: Utc::now() - chrono::Duration::hours(3),
            holder: "ghost".to_string(),
            engine_version: "0.0.0".to_string(),
        };
        fs::write(dir.join(OWNER_FILE), serde_json::to_string(&ghost).unwrap()).unwrap();

        let lock = SessionLock::acquire(&dir, "fresh", &quick()).unwrap();
        assert_eq!(lock.owner().holder, "fresh");
    }

    #[test]
    fn test_fresh_ownerless_dir_counts_as_held() {
        let temp = TempDir::new().unwrap();
        let dir = lock_dir(&temp);
        fs::create_dir_all(&dir).unwrap();
        let err = SessionLock::acquire(&dir, "x", &quick()).unwrap_err();
        assert!(matches!(err, LockError::Contention { pid: 0, .. }));
    }

    #[test]
    fn test_contention_message_is_actionable() {
        let err = LockError::Contention {
            path: "p".to_string(),
            pid: 42,
            waited_ms: 2000,
        };
        assert!(err.user_message().contains("PID 42"));
        assert_eq!(err.category(), ErrorCategory::Concurrency);
        assert!(!err.suggestions().is_empty());
    }
}
