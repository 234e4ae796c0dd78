//! Component C2: durable, day-partitioned persistence of the job list.
//!
//! A single file per day at `queue/<yyyy-MM-dd>/queue.json` holds the
//! entire queue as a JSON array. Every `save` writes to a sibling temp file
//! with exclusive creation, fsyncs it, then renames it over the target in
//! one filesystem operation — the same atomic-rewrite shape the teacher
//! crate uses for its own artifact files, generalised here to a whole-file
//! rewrite instead of an append.
//!
//! Writers within the engine serialise through a process-internal `Mutex`;
//! cross-process safety is a defensive advisory lock on a sibling
//! `queue.lock` file (the Instance Guard is what actually enforces
//! single-writer).

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use fs2::FileExt;

use crate::error::QueueError;
use crate::job::{Job, JobStatus};
use crate::paths;

/// Bounded wait for the defensive cross-process advisory lock before giving
/// up and proceeding anyway (§4.2: "timing out logs a warning and
/// proceeds").
const LOCK_WAIT: Duration = Duration::from_millis(500);

pub struct QueueStore {
    base_dir: PathBuf,
    day: NaiveDate,
    write_lock: Mutex<()>,
}

impl QueueStore {
    pub fn new(base_dir: PathBuf, day: NaiveDate) -> Self {
        Self {
            base_dir,
            day,
            write_lock: Mutex::new(()),
        }
    }

    fn dir(&self) -> PathBuf {
        paths::queue_dir(&self.base_dir, self.day)
    }

    fn file(&self) -> PathBuf {
        paths::queue_file(&self.base_dir, self.day)
    }

    fn lock_file(&self) -> PathBuf {
        paths::queue_lock_file(&self.base_dir, self.day)
    }

    /// Best-effort cross-process advisory lock. Returns `None` (and logs a
    /// warning) rather than erroring out on timeout, per §4.2 — the Instance
    /// Guard, not this lock, is what actually enforces single-writer.
    fn with_cross_process_lock<T>(&self, f: impl FnOnce() -> T) -> T {
        let path = self.lock_file();
        let file = match OpenOptions::new().create(true).write(true).open(&path) {
            Ok(f) => f,
            Err(_) => return f(),
        };

        let deadline = Instant::now() + LOCK_WAIT;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    let result = f();
                    let _ = fs2::FileExt::unlock(&file);
                    return result;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        tracing::warn!("timed out waiting for queue advisory lock at {:?}", path);
                        return f();
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(_) => return f(),
            }
        }
    }

    /// Returns the current day's queue, creating an empty one if absent.
    pub fn load(&self) -> Vec<Job> {
        match self.try_load() {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::error!("queue load failed, returning empty queue: {e}");
                Vec::new()
            }
        }
    }

    fn try_load(&self) -> Result<Vec<Job>, QueueError> {
        let path = self.file();
        if !path.exists() {
            return Ok(Vec::new());
        }
        self.with_cross_process_lock(|| {
            let raw = fs::read_to_string(&path).map_err(|source| QueueError::Read {
                path: path.clone(),
                source,
            })?;
            if raw.trim().is_empty() {
                return Ok(Vec::new());
            }
            serde_json::from_str(&raw).map_err(|source| QueueError::Parse {
                path: path.clone(),
                source,
            })
        })
    }

    /// Persists the given list atomically, replacing the current file.
    /// Acquires the process-internal write lock itself; callers that already
    /// hold it (the load-modify-save sequences below) must go through
    /// [`Self::save_locked`] instead so the whole cycle stays serialised.
    pub fn save(&self, jobs: &[Job]) {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.save_locked(jobs);
    }

    /// Core of `save`, assuming the caller already holds `write_lock`. This
    /// is what makes `add`/`update`/`recover`'s load-modify-persist sequence
    /// atomic with respect to each other: the guard is held from the initial
    /// `load()` through this call, so no other writer can interleave a save
    /// between them (§4.2, §5: queue mutations serialise through the Queue
    /// Store's API).
    fn save_locked(&self, jobs: &[Job]) {
        if let Err(e) = self.try_save(jobs) {
            tracing::error!("queue save failed, change dropped: {e}");
        }
    }

    fn try_save(&self, jobs: &[Job]) -> Result<(), QueueError> {
        let dir = self.dir();
        fs::create_dir_all(&dir).map_err(|source| QueueError::Write {
            path: dir.clone(),
            source,
        })?;

        let path = self.file();
        let json = serde_json::to_vec(jobs).map_err(|source| QueueError::Parse {
            path: path.clone(),
            source,
        })?;

        self.with_cross_process_lock(|| atomic_write(&dir, &path, &json))
            .map_err(|source| QueueError::Write { path, source })
    }

    /// Returns the oldest `Pending` job by `created_at` ordering, without
    /// removing it from the queue.
    pub fn next_pending(&self) -> Option<Job> {
        let jobs = self.load();
        jobs.into_iter()
            .filter(|j| j.status == JobStatus::Pending)
            .min_by_key(|j| j.created_at)
    }

    /// Appends a new job unless an active job already exists for the same
    /// `input_path` (the duplicate-suppression invariant in §3). The write
    /// lock is held across the whole load-modify-save sequence so a
    /// concurrent `add`/`update`/`recover` cannot interleave and overwrite
    /// this job with a stale snapshot.
    pub fn add(&self, job: Job) -> bool {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut jobs = self.load();
        if jobs
            .iter()
            .any(|j| j.input_path == job.input_path && j.status.is_active())
        {
            return false;
        }
        jobs.push(job);
        self.save_locked(&jobs);
        true
    }

    /// Replaces the job matching `updated.id`, leaving the rest of the
    /// queue untouched. No-op if the id is unknown. Holds the write lock
    /// across the whole load-modify-save sequence, same rationale as `add`.
    pub fn update(&self, updated: Job) {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut jobs = self.load();
        if let Some(slot) = jobs.iter_mut().find(|j| j.id == updated.id) {
            *slot = updated;
        }
        self.save_locked(&jobs);
    }

    pub fn find(&self, id: &str) -> Option<Job> {
        self.load().into_iter().find(|j| j.id == id)
    }

    /// At startup, rewrites any `Processing` job to `Pending`, clearing
    /// `started_at` and annotating the recovery message (§4.2). Holds the
    /// write lock across the whole load-modify-save sequence, same
    /// rationale as `add`.
    pub fn recover(&self) {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut jobs = self.load();
        let mut changed = false;
        for job in jobs.iter_mut() {
            if job.status == JobStatus::Processing {
                job.status = JobStatus::Pending;
                job.started_at = None;
                job.error_message = Some("Recovered from previous session".to_string());
                changed = true;
            }
        }
        if changed {
            self.save_locked(&jobs);
        }
    }
}

/// Write `contents` to a sibling temp file (created exclusively), fsync it,
/// then rename it over `target`. Falls back to copy-over-and-delete-temp
/// if rename is unsupported across the target's filesystem.
fn atomic_write(dir: &Path, target: &Path, contents: &[u8]) -> io::Result<()> {
    let tmp_path = dir.join(format!(".tmp-{}-{}", std::process::id(), unique_suffix()));
    {
        let mut tmp = OpenOptions::new().create_new(true).write(true).open(&tmp_path)?;
        use std::io::Write;
        tmp.write_all(contents)?;
        tmp.sync_all()?;
    }

    match fs::rename(&tmp_path, target) {
        Ok(()) => Ok(()),
        Err(_) => {
            // Fallback: copy-over-and-delete-temp for filesystems where an
            // atomic rename across the given paths is unsupported.
            let result = fs::copy(&tmp_path, target).map(|_| ());
            let _ = fs::remove_file(&tmp_path);
            result
        }
    }
}

fn unique_suffix() -> u64 {
    static COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
    COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
}

#[allow(dead_code)]
pub fn queue_file_path(base: &Path, day: NaiveDate) -> PathBuf {
    paths::queue_file(base, day)
}
