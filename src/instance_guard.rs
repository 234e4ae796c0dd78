//! Component C6: ensures at most one dispatch engine runs per host.
//!
//! On startup, opens (creating if needed) `main.pid` under the day-local
//! log directory and acquires an exclusive file lock on it via `fs2`, the
//! same crate the teacher uses for its per-job lock file. If the lock is
//! already held, startup fails with a clear diagnostic; on success the
//! current PID is written and the file is released and removed on orderly
//! shutdown via `Drop`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use fs2::FileExt;

use crate::error::InstanceGuardError;

pub struct InstanceGuard {
    file: File,
    path: PathBuf,
}

impl InstanceGuard {
    pub fn acquire(log_dir: &std::path::Path) -> Result<Self, InstanceGuardError> {
        std::fs::create_dir_all(log_dir)?;
        let path = log_dir.join("main.pid");

        let mut file = OpenOptions::new().create(true).read(true).write(true).open(&path)?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == std::io::ErrorKind::WouldBlock {
                return Err(InstanceGuardError::AlreadyRunning(path));
            }
            return Err(InstanceGuardError::Io(e));
        }

        file.set_len(0)?;
        write!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { file, path })
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.path);
    }
}
