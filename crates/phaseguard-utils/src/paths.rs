use camino::{Utf8Path, Utf8PathBuf};
use std::cell::RefCell;

use crate::types::SessionKey;

// Thread-local override used only in tests to avoid process-global env races.
thread_local! {
    static THREAD_HOME: RefCell<Option<Utf8PathBuf>> = const { RefCell::new(None) };
}

/// Environment variable that relocates the state root.
pub const HOME_ENV: &str = "PHASEGUARD_HOME";

/// Resolve phaseguard home:
/// 1) thread-local override (tests use this)
/// 2) env `PHASEGUARD_HOME`
/// 3) default ".phaseguard"
#[must_use]
pub fn phaseguard_home() -> Utf8PathBuf {
    if let Some(tl) = THREAD_HOME.with(|tl| tl.borrow().clone()) {
        return tl;
    }
    if let Ok(p) = std::env::var(HOME_ENV) {
        return Utf8PathBuf::from(p);
    }
    Utf8PathBuf::from(".phaseguard")
}

/// On-disk layout rooted at a phaseguard home.
///
/// ```text
/// <home>/
///   workspaces/<fingerprint>/runs/<run_id>/
///     session-state.json
///     rollout.json
///     evidence.jsonl
///     backups/
///     .lock.d/
///   workspaces/<fingerprint>/workspace-memory.json
///   workspaces/<fingerprint>/repo-cache/
///   engine/activation.json
///   engine/startup.json
///   engine/staged/<bundle>/
///   audit.jsonl
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    home: Utf8PathBuf,
}

impl Layout {
    #[must_use]
    pub fn new(home: impl Into<Utf8PathBuf>) -> Self {
        Self { home: home.into() }
    }

    /// Layout rooted at [`phaseguard_home`].
    #[must_use]
    pub fn from_env() -> Self {
        Self::new(phaseguard_home())
    }

    #[must_use]
    pub fn home(&self) -> &Utf8Path {
        &self.home
    }

    #[must_use]
    pub fn workspace_dir(&self, repo_fingerprint: &str) -> Utf8PathBuf {
        self.home.join("workspaces").join(repo_fingerprint)
    }

    #[must_use]
    pub fn run_dir(&self, key: &SessionKey) -> Utf8PathBuf {
        self.workspace_dir(&key.repo_fingerprint)
            .join("runs")
            .join(&key.run_id)
    }

    #[must_use]
    pub fn state_file(&self, key: &SessionKey) -> Utf8PathBuf {
        self.run_dir(key).join("session-state.json")
    }

    #[must_use]
    pub fn rollout_file(&self, key: &SessionKey) -> Utf8PathBuf {
        self.run_dir(key).join("rollout.json")
    }

    #[must_use]
    pub fn evidence_file(&self, key: &SessionKey) -> Utf8PathBuf {
        self.run_dir(key).join("evidence.jsonl")
    }

    #[must_use]
    pub fn backups_dir(&self, key: &SessionKey) -> Utf8PathBuf {
        self.run_dir(key).join("backups")
    }

    #[must_use]
    pub fn lock_dir(&self, key: &SessionKey) -> Utf8PathBuf {
        self.run_dir(key).join(".lock.d")
    }

    #[must_use]
    pub fn workspace_memory_file(&self, repo_fingerprint: &str) -> Utf8PathBuf {
        self.workspace_dir(repo_fingerprint)
            .join("workspace-memory.json")
    }

    #[must_use]
    pub fn repo_cache_dir(&self, repo_fingerprint: &str) -> Utf8PathBuf {
        self.workspace_dir(repo_fingerprint).join("repo-cache")
    }

    #[must_use]
    pub fn engine_dir(&self) -> Utf8PathBuf {
        self.home.join("engine")
    }

    #[must_use]
    pub fn activation_file(&self) -> Utf8PathBuf {
        self.engine_dir().join("activation.json")
    }

    #[must_use]
    pub fn startup_file(&self) -> Utf8PathBuf {
        self.engine_dir().join("startup.json")
    }

    #[must_use]
    pub fn staged_dir(&self) -> Utf8PathBuf {
        self.engine_dir().join("staged")
    }

    #[must_use]
    pub fn audit_file(&self) -> Utf8PathBuf {
        self.home.join("audit.jsonl")
    }
}

/// mkdir -p; treat `AlreadyExists` as success (removes TOCTTOU races)
pub fn ensure_dir_all<P: AsRef<std::path::Path>>(p: P) -> std::io::Result<()> {
    match std::fs::create_dir_all(&p) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

/// RAII guard for isolated home that clears thread-local state on drop
#[cfg(any(test, feature = "test-utils"))]
pub struct HomeGuard {
    inner: tempfile::TempDir,
}

#[cfg(any(test, feature = "test-utils"))]
impl HomeGuard {
    /// Home directory as a UTF-8 path.
    #[must_use]
    pub fn home(&self) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(self.inner.path().to_path_buf())
            .unwrap_or_else(|p| Utf8PathBuf::from(p.to_string_lossy().into_owned()))
    }

    #[must_use]
    pub fn layout(&self) -> Layout {
        Layout::new(self.home())
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl Drop for HomeGuard {
    fn drop(&mut self) {
        THREAD_HOME.with(|tl| *tl.borrow_mut() = None);
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl std::ops::Deref for HomeGuard {
    type Target = tempfile::TempDir;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// Test helper: give this test a unique home under the system temp dir.
///
/// Hold the `HomeGuard` for the test's duration so the directory stays alive.
#[cfg(any(test, feature = "test-utils"))]
#[must_use]
pub fn with_isolated_home() -> HomeGuard {
    let td = tempfile::TempDir::new().expect("create temp home");
    let p = Utf8PathBuf::from_path_buf(td.path().to_path_buf()).expect("utf-8 temp dir");
    THREAD_HOME.with(|tl| *tl.borrow_mut() = Some(p));
    HomeGuard { inner: td }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolated_home_overrides_default() {
        let guard = with_isolated_home();
        assert_eq!(phaseguard_home(), guard.home());
        drop(guard);
        assert_ne!(phaseguard_home().as_str(), "");
    }

    #[test]
    fn test_layout_paths_are_scoped_by_key() {
        let layout = Layout::new("/h");
        let key = SessionKey::new("fp1", "run-7").unwrap();
        assert_eq!(
            layout.state_file(&key).as_str(),
            "/h/workspaces/fp1/runs/run-7/session-state.json"
        );
        assert_eq!(
            layout.lock_dir(&key).as_str(),
            "/h/workspaces/fp1/runs/run-7/.lock.d"
        );
        assert_eq!(
            layout.workspace_memory_file("fp1").as_str(),
            "/h/workspaces/fp1/workspace-memory.json"
        );
        assert_eq!(layout.activation_file().as_str(), "/h/engine/activation.json");
        assert_eq!(layout.audit_file().as_str(), "/h/audit.jsonl");
    }

    #[test]
    fn test_ensure_dir_all_is_idempotent() {
        let guard = with_isolated_home();
        let dir = guard.home().join("a/b");
        ensure_dir_all(&dir).unwrap();
        ensure_dir_all(&dir).unwrap();
        assert!(dir.is_dir());
    }
}
