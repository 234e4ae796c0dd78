//! Component C3: watches the tree, classifies files, debounces them to
//! stable state, and enqueues jobs.
//!
//! The platform watcher is the `notify` crate — the same dependency the
//! teacher crate already uses for its own (best-effort) file-change
//! detection in `pend wait`. Here it drives a small internal thread pool
//! that performs the stability debounce and classification, then hands
//! stable files to the Queue Store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};

use crate::config::WorkerMapping;
use crate::error::WatcherError;
use crate::job::Job;
use crate::paths;
use crate::queue::QueueStore;

const STABILITY_SAMPLES: u32 = 10;
const STABILITY_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);
const DEBOUNCE_WORKER_THREADS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Route {
        target_app: String,
        output_path: PathBuf,
    },
    SkipNoDefaultForRoot,
    SkipHiddenOrSystem,
}

pub struct Watcher {
    watch_directory: PathBuf,
    mappings: HashMap<String, WorkerMapping>,
    default_worker_for_root: Option<String>,
    ignore_hidden_and_system_files: bool,
    user: String,
    day: chrono::NaiveDate,
    queue: Arc<QueueStore>,
}

impl Watcher {
    pub fn new(
        watch_directory: PathBuf,
        mappings: HashMap<String, WorkerMapping>,
        default_worker_for_root: Option<String>,
        ignore_hidden_and_system_files: bool,
        user: String,
        day: chrono::NaiveDate,
        queue: Arc<QueueStore>,
    ) -> Self {
        Self {
            watch_directory,
            mappings,
            default_worker_for_root,
            ignore_hidden_and_system_files,
            user,
            day,
            queue,
        }
    }

    fn is_hidden_or_system(name: &str) -> bool {
        name.starts_with('.') || name.eq_ignore_ascii_case("Thumbs.db")
    }

    /// Classify a path already known to be a regular file.
    pub fn classify(&self, path: &Path) -> Classification {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        if self.ignore_hidden_and_system_files && Self::is_hidden_or_system(&file_name) {
            return Classification::SkipHiddenOrSystem;
        }

        let relative = path.strip_prefix(&self.watch_directory).unwrap_or(path);
        let components: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();

        if components.len() >= 2 {
            let c1 = &components[0];
            if let Some(mapping) = self.mappings.get(c1) {
                let sub_components = &components[1..components.len() - 1];
                let output_path = self.output_path_for(c1, mapping, sub_components, &file_name);
                return Classification::Route {
                    target_app: c1.clone(),
                    output_path,
                };
            }
        }

        if components.len() == 1 {
            if let Some(default) = &self.default_worker_for_root {
                if let Some(mapping) = self.mappings.get(default) {
                    let output_path = self.output_path_for(default, mapping, &[], &file_name);
                    return Classification::Route {
                        target_app: default.clone(),
                        output_path,
                    };
                }
            }
            return Classification::SkipNoDefaultForRoot;
        }

        Classification::SkipNoDefaultForRoot
    }

    /// `OUT/<yyyy-MM-dd>/w/<relative-subpath-below-c1>/<filename>` where
    /// `OUT/w` is the worker's configured `OutputDirectory`.
    fn output_path_for(
        &self,
        worker_key: &str,
        mapping: &WorkerMapping,
        sub_components: &[String],
        filename: &str,
    ) -> PathBuf {
        let configured = PathBuf::from(&mapping.output_directory);
        let out_base = configured.parent().map(Path::to_path_buf).unwrap_or_else(|| configured.clone());

        let mut path = out_base.join(paths::day_string(self.day)).join(worker_key);
        for component in sub_components {
            path = path.join(component);
        }
        path.join(filename)
    }

    /// Sample length twice with a short pause and attempt a shared-read
    /// open; the file is stable once two consecutive samples agree and the
    /// open succeeds. Bounded to `STABILITY_SAMPLES` attempts.
    fn wait_for_stable(path: &Path) -> bool {
        let mut previous_len: Option<u64> = None;

        for _ in 0..STABILITY_SAMPLES {
            let metadata = match std::fs::metadata(path) {
                Ok(m) => m,
                Err(_) => return false,
            };
            let len = metadata.len();

            let openable = std::fs::File::open(path).is_ok();

            if openable {
                if let Some(prev) = previous_len {
                    if prev == len {
                        return true;
                    }
                }
            }
            previous_len = Some(len);
            std::thread::sleep(STABILITY_SAMPLE_INTERVAL);
        }
        false
    }

    fn enqueue_if_stable(&self, path: PathBuf) {
        if !path.is_file() {
            return;
        }
        if !Self::wait_for_stable(&path) {
            tracing::warn!(?path, "file never stabilised, skipping");
            return;
        }

        match self.classify(&path) {
            Classification::Route { target_app, output_path } => {
                let job = Job::new(
                    new_job_id(),
                    path.to_string_lossy().to_string(),
                    output_path.to_string_lossy().to_string(),
                    target_app,
                    self.user.clone(),
                );
                if !self.queue.add(job) {
                    tracing::debug!(?path, "duplicate active job already present, skipping");
                }
            }
            Classification::SkipNoDefaultForRoot => {
                tracing::info!(?path, "file dropped in watch root with no default worker configured, skipping");
            }
            Classification::SkipHiddenOrSystem => {
                tracing::debug!(?path, "hidden or system file ignored");
            }
        }
    }

    /// Enumerate pre-existing files under the watch tree and feed them
    /// through the same classify/stabilise/enqueue path used for live
    /// events, so no work is lost across restarts.
    pub fn bootstrap(&self) {
        let mut stack = vec![self.watch_directory.clone()];
        while let Some(dir) = stack.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(e) => e,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    self.enqueue_if_stable(path);
                }
            }
        }
    }

    /// Runs the live watch loop until `cancel` is observed. Spawns a small
    /// pool of debounce worker threads that drain raw filesystem events so
    /// the `notify` callback thread itself never blocks on the stability
    /// sampling sleeps.
    pub fn run(self: Arc<Self>, cancel: Arc<std::sync::atomic::AtomicBool>) -> Result<(), WatcherError> {
        let (tx, rx): (Sender<PathBuf>, Receiver<PathBuf>) = mpsc::channel();
        let rx = Arc::new(std::sync::Mutex::new(rx));

        let mut handles = Vec::new();
        for _ in 0..DEBOUNCE_WORKER_THREADS {
            let rx = Arc::clone(&rx);
            let watcher = Arc::clone(&self);
            handles.push(std::thread::spawn(move || loop {
                let path = {
                    let rx = rx.lock().unwrap_or_else(|e| e.into_inner());
                    rx.recv_timeout(Duration::from_millis(250))
                };
                match path {
                    Ok(path) => watcher.enqueue_if_stable(path),
                    Err(mpsc::RecvTimeoutError::Timeout) => continue,
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }));
        }

        let event_tx = tx.clone();
        let mut fs_watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                if let Ok(event) = res {
                    if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        for path in event.paths {
                            let _ = event_tx.send(path);
                        }
                    }
                }
            },
            NotifyConfig::default(),
        )?;
        fs_watcher.watch(&self.watch_directory, RecursiveMode::Recursive)?;

        while !cancel.load(std::sync::atomic::Ordering::Relaxed) {
            std::thread::sleep(Duration::from_millis(200));
        }

        drop(fs_watcher);
        drop(tx);
        for handle in handles {
            let _ = handle.join();
        }
        Ok(())
    }
}

fn new_job_id() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("job-{nanos:x}-{}", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn watcher_with(
        dir: &Path,
        mappings: HashMap<String, WorkerMapping>,
        default_worker: Option<&str>,
    ) -> Watcher {
        let queue_dir = TempDir::new().unwrap();
        let queue = Arc::new(QueueStore::new(
            queue_dir.path().to_path_buf(),
            chrono::NaiveDate::from_ymd_opt(2026, 7, 28).unwrap(),
        ));
        Watcher::new(
            dir.to_path_buf(),
            mappings,
            default_worker.map(str::to_string),
            true,
            "alice".to_string(),
            chrono::NaiveDate::from_ymd_opt(2026, 7, 28).unwrap(),
            queue,
        )
    }

    fn abc_mapping() -> HashMap<String, WorkerMapping> {
        let mut m = HashMap::new();
        m.insert(
            "abc".to_string(),
            WorkerMapping {
                executable_path: "/bin/abc".to_string(),
                output_directory: "/out/abc".to_string(),
            },
        );
        m
    }

    #[test]
    fn classifies_subdirectory_happy_path() {
        let dir = TempDir::new().unwrap();
        let watcher = watcher_with(dir.path(), abc_mapping(), None);
        let path = dir.path().join("abc").join("sub").join("x.txt");

        match watcher.classify(&path) {
            Classification::Route { target_app, output_path } => {
                assert_eq!(target_app, "abc");
                assert_eq!(output_path, PathBuf::from("/out/2026-07-28/abc/sub/x.txt"));
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn classifies_root_file_with_default() {
        let dir = TempDir::new().unwrap();
        let watcher = watcher_with(dir.path(), abc_mapping(), Some("abc"));
        let path = dir.path().join("readme.md");

        match watcher.classify(&path) {
            Classification::Route { target_app, output_path } => {
                assert_eq!(target_app, "abc");
                assert_eq!(output_path, PathBuf::from("/out/2026-07-28/abc/readme.md"));
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn root_file_without_default_is_skipped() {
        let dir = TempDir::new().unwrap();
        let watcher = watcher_with(dir.path(), abc_mapping(), None);
        let path = dir.path().join("readme.md");
        assert_eq!(watcher.classify(&path), Classification::SkipNoDefaultForRoot);
    }

    #[test]
    fn hidden_files_are_skipped_when_option_set() {
        let dir = TempDir::new().unwrap();
        let watcher = watcher_with(dir.path(), abc_mapping(), None);
        let path = dir.path().join("abc").join(".hidden");
        assert_eq!(watcher.classify(&path), Classification::SkipHiddenOrSystem);

        let thumbs = dir.path().join("abc").join("Thumbs.db");
        assert_eq!(watcher.classify(&thumbs), Classification::SkipHiddenOrSystem);
    }

    #[test]
    fn unknown_first_component_falls_through_to_root_rules() {
        let dir = TempDir::new().unwrap();
        let watcher = watcher_with(dir.path(), abc_mapping(), None);
        let path = dir.path().join("unknownworker").join("x.txt");
        assert_eq!(watcher.classify(&path), Classification::SkipNoDefaultForRoot);
    }

    #[test]
    fn bootstrap_enqueues_preexisting_files() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("abc").join("sub")).unwrap();
        std::fs::write(dir.path().join("abc").join("sub").join("x.txt"), b"hello").unwrap();

        let queue_dir = TempDir::new().unwrap();
        let queue = Arc::new(QueueStore::new(
            queue_dir.path().to_path_buf(),
            chrono::NaiveDate::from_ymd_opt(2026, 7, 28).unwrap(),
        ));
        let watcher = Watcher::new(
            dir.path().to_path_buf(),
            abc_mapping(),
            None,
            true,
            "alice".to_string(),
            chrono::NaiveDate::from_ymd_opt(2026, 7, 28).unwrap(),
            Arc::clone(&queue),
        );

        watcher.bootstrap();

        let jobs = queue.load();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].target_app, "abc");
    }

    #[test]
    fn bootstrap_does_not_duplicate_active_job() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("abc")).unwrap();
        let file_path = dir.path().join("abc").join("x.txt");
        std::fs::write(&file_path, b"hello").unwrap();

        let queue_dir = TempDir::new().unwrap();
        let queue = Arc::new(QueueStore::new(
            queue_dir.path().to_path_buf(),
            chrono::NaiveDate::from_ymd_opt(2026, 7, 28).unwrap(),
        ));
        let watcher = Watcher::new(
            dir.path().to_path_buf(),
            abc_mapping(),
            None,
            true,
            "alice".to_string(),
            chrono::NaiveDate::from_ymd_opt(2026, 7, 28).unwrap(),
            Arc::clone(&queue),
        );

        watcher.bootstrap();
        watcher.bootstrap();

        assert_eq!(queue.load().len(), 1);
    }
}
