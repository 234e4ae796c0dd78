//! Component C1: cross-process, cross-user mutual exclusion over the
//! shared "device" workers require.
//!
//! Storage is a well-known lock file in a shared directory (machine-global
//! on the host; overridable via `FILEJOBROUTER_LOCK_DIR`). Acquisition
//! combines exclusive-creation semantics with an OS-level advisory file
//! lock (`fs2`, the same crate the teacher crate uses for its own
//! single-worker-per-job lock) held for the lifetime of ownership, plus
//! stale-owner reclamation by PID — the same pattern used by this kind of
//! single-instance guard elsewhere in the corpus.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::DeviceLockError;
use crate::paths::current_user;

#[derive(Debug, Serialize, Deserialize)]
struct OwnerInfo {
    pid: u32,
    user: String,
    timestamp: chrono::DateTime<chrono::Utc>,
}

/// Guard returned by [`DeviceLock::try_acquire`]. Dropping it releases the
/// lock, mirroring `release()` in the spec so callers cannot forget to
/// unlock on early returns.
pub struct DeviceLockGuard {
    file: File,
    path: PathBuf,
}

impl DeviceLockGuard {
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for DeviceLockGuard {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        // Best-effort: if unlink fails the next acquirer will apply
        // stale-owner reclamation.
        let _ = std::fs::remove_file(&self.path);
    }
}

pub struct DeviceLock {
    lock_path: PathBuf,
}

impl DeviceLock {
    /// `mutex_name` is the symbolic `MutexName` config field; it is turned
    /// into a deterministic lock filename under the shared lock directory.
    pub fn new(mutex_name: &str) -> Self {
        let dir = Self::lock_dir();
        let _ = std::fs::create_dir_all(&dir);
        Self {
            lock_path: dir.join(format!("{mutex_name}.lock")),
        }
    }

    fn lock_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("FILEJOBROUTER_LOCK_DIR") {
            return PathBuf::from(dir);
        }
        #[cfg(unix)]
        {
            PathBuf::from("/var/lock/filejobrouter")
        }
        #[cfg(windows)]
        {
            let base = std::env::var("PROGRAMDATA").unwrap_or_else(|_| "C:\\ProgramData".into());
            PathBuf::from(base).join("FileJobRouter").join("Locks")
        }
    }

    /// Repeatedly attempt to create-and-lock the lock file until `timeout`
    /// elapses. On contention, reads the stored owner PID; if that process
    /// no longer exists, the lock is stale and reclaimed.
    pub fn try_acquire(&self, timeout: Duration) -> Result<Option<DeviceLockGuard>, DeviceLockError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.attempt_once() {
                Ok(Some(guard)) => return Ok(Some(guard)),
                Ok(None) => {}
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    fn attempt_once(&self) -> Result<Option<DeviceLockGuard>, DeviceLockError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.lock_path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                self.write_owner(&file)?;
                Ok(Some(DeviceLockGuard {
                    file,
                    path: self.lock_path.clone(),
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if self.owner_is_stale(&file) {
                    drop(file);
                    let _ = std::fs::remove_file(&self.lock_path);
                }
                Ok(None)
            }
            Err(e) => Err(DeviceLockError::from(e)),
        }
    }

    fn write_owner(&self, mut file: &File) -> Result<(), DeviceLockError> {
        let owner = OwnerInfo {
            pid: std::process::id(),
            user: current_user(),
            timestamp: chrono::Utc::now(),
        };
        let json = serde_json::to_vec(&owner).unwrap_or_default();
        file.set_len(0)?;
        use std::io::Seek;
        file.seek(std::io::SeekFrom::Start(0))?;
        file.write_all(&json)?;
        file.flush()?;
        Ok(())
    }

    fn owner_is_stale(&self, file: &File) -> bool {
        let mut contents = String::new();
        let mut file = file.try_clone().ok();
        let Some(file) = file.as_mut() else {
            return false;
        };
        use std::io::Seek;
        if file.seek(std::io::SeekFrom::Start(0)).is_err() {
            return false;
        }
        if file.read_to_string(&mut contents).is_err() {
            return false;
        }
        let Ok(owner) = serde_json::from_str::<OwnerInfo>(&contents) else {
            return false;
        };
        !crate::process::process_is_alive(owner.pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn acquire_and_release_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        std::env::set_var("FILEJOBROUTER_LOCK_DIR", dir.path());
        let lock = DeviceLock::new("TestDevice");

        let guard = lock.try_acquire(Duration::from_millis(200)).unwrap();
        assert!(guard.is_some());
        let lock_path = dir.path().join("TestDevice.lock");
        assert!(lock_path.exists());

        guard.unwrap().release();
        assert!(!lock_path.exists());
        std::env::remove_var("FILEJOBROUTER_LOCK_DIR");
    }

    #[test]
    #[serial]
    fn second_acquire_times_out_while_first_holds() {
        let dir = tempfile::TempDir::new().unwrap();
        std::env::set_var("FILEJOBROUTER_LOCK_DIR", dir.path());
        let lock_a = DeviceLock::new("TestDevice2");
        let lock_b = DeviceLock::new("TestDevice2");

        let guard_a = lock_a.try_acquire(Duration::from_millis(200)).unwrap();
        assert!(guard_a.is_some());

        let guard_b = lock_b.try_acquire(Duration::from_millis(150)).unwrap();
        assert!(guard_b.is_none());

        drop(guard_a);
        std::env::remove_var("FILEJOBROUTER_LOCK_DIR");
    }

    #[test]
    #[serial]
    fn stale_owner_lock_is_reclaimed() {
        let dir = tempfile::TempDir::new().unwrap();
        std::env::set_var("FILEJOBROUTER_LOCK_DIR", dir.path());
        let lock_path = dir.path().join("StaleDevice.lock");
        let stale = OwnerInfo {
            pid: 999_999,
            user: "ghost".into(),
            timestamp: chrono::Utc::now(),
        };
        std::fs::write(&lock_path, serde_json::to_vec(&stale).unwrap()).unwrap();

        let lock = DeviceLock::new("StaleDevice");
        let guard = lock.try_acquire(Duration::from_secs(1)).unwrap();
        assert!(guard.is_some());
        std::env::remove_var("FILEJOBROUTER_LOCK_DIR");
    }
}
