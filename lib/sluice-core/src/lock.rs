//! Run lock.
//!
//! Only one orchestration run may act on a host at a time. The lock is a marker file holding the owning process ID,
//! created exclusively on acquisition and removed when the returned [`RunLockGuard`] is dropped, so every exit path
//! (including an early return, a propagated error, or a cancelled future) releases it.

use std::{
    fs::{self, OpenOptions},
    io::{self, Write as _},
    path::{Path, PathBuf},
};

use snafu::{ResultExt as _, Snafu};
use tracing::{debug, warn};

/// Run lock error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum LockError {
    /// Another run already holds the lock.
    #[snafu(display(
        "another run is already in progress (owner: {}); wait for it to finish or remove '{}' if it is stale",
        owner,
        path.display()
    ))]
    AlreadyRunning {
        /// Identity recorded by the current owner.
        owner: String,

        /// Path to the lock marker.
        path: PathBuf,
    },

    /// The lock marker could not be created or inspected.
    #[snafu(display("failed to access lock file '{}': {}", path.display(), source))]
    Io {
        /// Path to the lock marker.
        path: PathBuf,

        /// Underlying I/O error.
        source: io::Error,
    },
}

/// Ownership token for an orchestration run.
///
/// Every operation that mutates the fleet or the registry requires a reference to the guard. Dropping it removes the
/// lock marker.
#[derive(Debug)]
pub struct RunLockGuard {
    path: PathBuf,
    owner: u32,
}

impl RunLockGuard {
    /// Acquires the run lock at the given path.
    ///
    /// A marker left behind by a process that no longer exists on this host is reclaimed with a warning.
    ///
    /// # Errors
    ///
    /// If a live process already holds the lock, `LockError::AlreadyRunning` is returned. If the marker cannot be created
    /// or read, `LockError::Io` is returned.
    pub fn acquire<P: Into<PathBuf>>(path: P) -> Result<Self, LockError> {
        let path = path.into();
        let owner = std::process::id();

        if try_create_marker(&path, owner)? {
            debug!(path = %path.display(), owner, "Acquired run lock.");
            return Ok(Self { path, owner });
        }

        let existing = read_owner(&path)?;
        if !owner_is_stale(&existing) {
            return AlreadyRunning { owner: existing, path }.fail();
        }

        warn!(path = %path.display(), stale_owner = %existing, "Reclaiming run lock left behind by a process that no longer exists.");
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context(Io { path }),
        }

        // Another invocation may have reclaimed it between the removal and here.
        if try_create_marker(&path, owner)? {
            debug!(path = %path.display(), owner, "Acquired run lock.");
            Ok(Self { path, owner })
        } else {
            let existing = read_owner(&path)?;
            AlreadyRunning { owner: existing, path }.fail()
        }
    }

    /// Returns the process ID recorded in the lock marker.
    pub fn owner(&self) -> u32 {
        self.owner
    }

    /// Returns the path of the lock marker.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Releases the lock.
    ///
    /// Equivalent to dropping the guard.
    pub fn release(self) {}
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Released run lock."),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %self.path.display(), "Run lock marker was already removed.")
            }
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove run lock marker."),
        }
    }
}

fn try_create_marker(path: &Path, owner: u32) -> Result<bool, LockError> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(e).context(Io { path }),
    };

    writeln!(file, "{}", owner).context(Io { path })?;
    file.sync_all().context(Io { path })?;
    Ok(true)
}

fn read_owner(path: &Path) -> Result<String, LockError> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(contents.trim().to_string()),
        // Released between our create attempt and the read.
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e).context(Io { path }),
    }
}

/// Returns `true` if the recorded owner is a PID that is known not to be running.
///
/// Owners that cannot be parsed, or hosts without `/proc`, are never considered stale.
fn owner_is_stale(owner: &str) -> bool {
    let Ok(pid) = owner.parse::<u32>() else {
        return false;
    };

    let procfs = Path::new("/proc/self");
    procfs.exists() && !Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn second_acquire_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sluice.lock");

        let guard = RunLockGuard::acquire(&path).unwrap();
        assert_eq!(guard.owner(), std::process::id());

        match RunLockGuard::acquire(&path) {
            Err(LockError::AlreadyRunning { owner, .. }) => assert_eq!(owner, std::process::id().to_string()),
            other => panic!("expected AlreadyRunning, got {:?}", other),
        }

        guard.release();
        assert!(!path.exists());

        let _guard = RunLockGuard::acquire(&path).unwrap();
    }

    #[test]
    fn released_on_early_return() {
        fn failing_run(path: &Path) -> Result<(), LockError> {
            let _guard = RunLockGuard::acquire(path)?;
            Err(LockError::Io {
                path: path.to_path_buf(),
                source: io::Error::other("boom"),
            })
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sluice.lock");

        assert!(failing_run(&path).is_err());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn released_when_run_is_interrupted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sluice.lock");

        let (acquired_tx, acquired_rx) = tokio::sync::oneshot::channel();
        let task_path = path.clone();
        let run = tokio::spawn(async move {
            let _guard = RunLockGuard::acquire(&task_path).unwrap();
            let _ = acquired_tx.send(());
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        acquired_rx.await.unwrap();
        assert!(matches!(
            RunLockGuard::acquire(&path),
            Err(LockError::AlreadyRunning { .. })
        ));

        run.abort();
        assert!(run.await.unwrap_err().is_cancelled());

        let _guard = RunLockGuard::acquire(&path).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn stale_marker_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sluice.lock");
        // Above the kernel's maximum PID, so it can never be alive.
        fs::write(&path, "4294967290\n").unwrap();

        let guard = RunLockGuard::acquire(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap().trim(), std::process::id().to_string());
        drop(guard);
    }

    #[test]
    fn unparseable_owner_is_not_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sluice.lock");
        fs::write(&path, "someone-else\n").unwrap();

        match RunLockGuard::acquire(&path) {
            Err(LockError::AlreadyRunning { owner, .. }) => assert_eq!(owner, "someone-else"),
            other => panic!("expected AlreadyRunning, got {:?}", other),
        }
        assert!(path.exists());
    }
}
