//! Component C4: the main dispatch loop.
//!
//! Picks the next pending job, serialises execution behind the Device
//! Lock, spawns the resolved worker binary with a wall-clock timeout
//! (`wait-timeout`, already a teacher dependency), captures its output,
//! applies the retry policy, and emits state transitions to the Notifier.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use wait_timeout::ChildExt;

use crate::config::{self, Config};
use crate::device_lock::DeviceLock;
use crate::error::ProcessorError;
use crate::job::{Job, JobStatus, JobSideRecord, USER_CHOICE};
use crate::notifier::{Notifier, NotifierCommand};
use crate::paths;
use crate::queue::QueueStore;

const IDLE_SLEEP: Duration = Duration::from_secs(5);
const DEVICE_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
const CONFIG_RELOAD_INTERVAL: Duration = Duration::from_secs(2);

pub struct Processor {
    queue: Arc<QueueStore>,
    device: Arc<DeviceLock>,
    notifier: Arc<Notifier>,
    config: Mutex<Config>,
    config_path: PathBuf,
    jobs_base: PathBuf,
    user: String,
    day: chrono::NaiveDate,
    cancel: Arc<AtomicBool>,
    retry_commands: Mutex<mpsc::Receiver<NotifierCommand>>,
    last_reload: Mutex<std::time::Instant>,
}

impl Processor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<QueueStore>,
        device: Arc<DeviceLock>,
        notifier: Arc<Notifier>,
        config: Config,
        config_path: PathBuf,
        jobs_base: PathBuf,
        user: String,
        day: chrono::NaiveDate,
        cancel: Arc<AtomicBool>,
        retry_commands: mpsc::Receiver<NotifierCommand>,
    ) -> Self {
        Self {
            queue,
            device,
            notifier,
            config: Mutex::new(config),
            config_path,
            jobs_base,
            user,
            day,
            cancel,
            retry_commands: Mutex::new(retry_commands),
            last_reload: Mutex::new(std::time::Instant::now()),
        }
    }

    /// Runs the dispatch loop until the cancellation token is observed.
    pub fn run(&self) {
        self.queue.recover();

        while !self.cancel.load(Ordering::Relaxed) {
            self.drain_retry_commands();

            match self.queue.next_pending() {
                Some(job) => self.dispatch(job),
                None => std::thread::sleep(IDLE_SLEEP),
            }
        }
    }

    fn drain_retry_commands(&self) {
        let rx = self.retry_commands.lock().unwrap_or_else(|e| e.into_inner());
        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                NotifierCommand::RetryJob(job_id) => self.handle_retry_command(&job_id),
            }
        }
    }

    /// UI-initiated retry (§4.4): verifies the job exists and is `Failed`,
    /// confirms `input_path` still exists, then requeues it.
    fn handle_retry_command(&self, job_id: &str) {
        let Some(mut job) = self.queue.find(job_id) else {
            tracing::warn!(job_id, "retry command for unknown job ignored");
            self.notifier.log_update(&format!("retry command for unknown job {job_id} ignored"));
            return;
        };

        if job.status != JobStatus::Failed {
            // A retry command on a non-Failed job is a no-op.
            return;
        }

        if !Path::new(&job.input_path).exists() {
            job.status = JobStatus::Failed;
            job.error_message = Some("Input file not found".to_string());
            self.persist_and_notify(&job);
            return;
        }

        job.status = JobStatus::Pending;
        job.started_at = None;
        job.completed_at = None;
        job.error_message = None;
        job.retry_count += 1;
        self.persist_and_notify(&job);
    }

    fn dispatch(&self, mut job: Job) {
        // a. Resolve target.
        if job.target_app == USER_CHOICE {
            let default = self.config.lock().unwrap_or_else(|e| e.into_inner()).default_worker_for_root.clone();
            let mapping_known = default
                .as_ref()
                .map(|d| self.config.lock().unwrap_or_else(|e| e.into_inner()).mappings.contains_key(d))
                .unwrap_or(false);

            match default.filter(|_| mapping_known) {
                Some(resolved) => {
                    job.target_app = resolved;
                }
                None => {
                    job.status = JobStatus::Failed;
                    job.error_message = Some("no default worker configured for user_choice job".to_string());
                    self.persist_and_notify(&job);
                    return;
                }
            }
        }

        let mapping = {
            let config = self.config.lock().unwrap_or_else(|e| e.into_inner());
            config.mappings.get(&job.target_app).cloned()
        };
        let Some(mapping) = mapping else {
            job.status = JobStatus::Failed;
            job.error_message = Some(format!("unknown target_app '{}'", job.target_app));
            self.persist_and_notify(&job);
            return;
        };

        if job.output_path.is_empty() {
            job.output_path = Path::new(&mapping.output_directory)
                .join(Path::new(&job.input_path).file_name().unwrap_or_default())
                .to_string_lossy()
                .to_string();
        }

        // b. Acquire device.
        let guard = match self.device.try_acquire(DEVICE_ACQUIRE_TIMEOUT) {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                tracing::info!(job_id = %job.id, "device busy, job remains pending");
                self.notifier.job_update(&job.id, job.status, "waiting for device");
                self.notifier.log_update(&format!("job {} waiting for device", job.id));
                return;
            }
            Err(e) => {
                tracing::error!("device lock error: {e}");
                self.notifier.log_update(&format!("device lock error: {e}"));
                return;
            }
        };

        // c. Mark Processing.
        job.status = JobStatus::Processing;
        job.started_at = Some(Utc::now());
        self.persist_and_notify(&job);

        // d. Reload tunables at most once every 2s of wall clock.
        let (timeout_seconds, max_retry_count) = self.maybe_reload_tunables();

        // e. Resolve binary.
        let (program, mut args_prefix) = match self.resolve_binary(&job.target_app, &mapping) {
            Ok(resolved) => resolved,
            Err(err) => {
                job.status = JobStatus::Failed;
                job.error_message = Some(err.to_string());
                guard.release();
                self.persist_and_notify(&job);
                return;
            }
        };

        // f. Spawn with stdout/stderr piped.
        args_prefix.push(job.input_path.clone());
        args_prefix.push(job.output_path.clone());

        if let Some(parent) = Path::new(&job.output_path).parent() {
            let _ = fs::create_dir_all(parent);
        }

        let child = spawn_worker_process(&program, &args_prefix);
        let mut child = match child {
            Ok(c) => c,
            Err(e) => {
                job.status = JobStatus::Failed;
                job.error_message = Some(format!("failed to spawn worker: {e}"));
                guard.release();
                self.persist_and_notify(&job);
                return;
            }
        };

        let (stdout, stderr) = drain_streams(&mut child);

        // g. Wait with timeout.
        let outcome = wait_with_timeout(&mut child, timeout_seconds, &self.cancel);

        let stderr_text = stderr.join().unwrap_or_default();
        let _ = stdout.join();

        guard.release();

        match outcome {
            WaitOutcome::Exited(status) => {
                let code = status.code().unwrap_or(-1);
                if code == 0 {
                    job.status = JobStatus::Completed;
                    job.completed_at = Some(Utc::now());
                    job.error_message = None;
                    if let Err(e) = fs::remove_file(&job.input_path) {
                        tracing::warn!(path = %job.input_path, "failed to delete input after success: {e}");
                        self.notifier
                            .log_update(&format!("failed to delete input {} after success: {e}", job.input_path));
                    }
                    self.persist_and_notify(&job);
                } else {
                    let trimmed = stderr_text.trim();
                    job.error_message = Some(if !trimmed.is_empty() {
                        format!("Worker stderr: {trimmed}")
                    } else {
                        format!("Worker process exited with code {code}")
                    });
                    job.retry_count += 1;
                    job.status = JobStatus::Failed;
                    job.completed_at = Some(Utc::now());
                    self.persist_and_notify(&job);
                }
            }
            WaitOutcome::TimedOut => {
                job.status = JobStatus::Timeout;
                job.error_message = Some("Process timed out".to_string());
                job.retry_count += 1;
                if job.retry_count <= max_retry_count {
                    tracing::warn!(job_id = %job.id, retry_count = job.retry_count, "worker timed out, retrying");
                    self.notifier.log_update(&format!(
                        "job {} timed out, retry {}/{}",
                        job.id, job.retry_count, max_retry_count
                    ));
                    job.status = JobStatus::Pending;
                    job.started_at = None;
                    job.completed_at = None;
                    job.error_message = None;
                } else {
                    tracing::warn!(job_id = %job.id, "worker timed out, retry cap exceeded");
                    self.notifier
                        .log_update(&format!("job {} timed out, retry cap exceeded, failing", job.id));
                    job.completed_at = Some(Utc::now());
                }
                self.persist_and_notify(&job);
            }
            WaitOutcome::Cancelled => {
                job.status = JobStatus::Failed;
                job.error_message = Some("Cancelled".to_string());
                job.completed_at = Some(Utc::now());
                self.persist_and_notify(&job);
            }
        }
    }

    fn maybe_reload_tunables(&self) -> (u64, u32) {
        let mut last = self.last_reload.lock().unwrap_or_else(|e| e.into_inner());
        if last.elapsed() >= CONFIG_RELOAD_INTERVAL {
            *last = std::time::Instant::now();
            let mut config = self.config.lock().unwrap_or_else(|e| e.into_inner());
            match config.reload_tunables(&self.config_path) {
                Ok(true) => tracing::info!("reloaded timeout_seconds/max_retry_count from config"),
                Ok(false) => {}
                Err(e) => tracing::warn!("failed to reload config tunables: {e}"),
            }
        }
        let config = self.config.lock().unwrap_or_else(|e| e.into_inner());
        (config.timeout_seconds, config.max_retry_count)
    }

    /// Prefer a native executable at `<base>` (`<base>.exe` on Windows);
    /// otherwise fall back to `<base>.dll` invoked through the
    /// externally-configured runtime launcher command.
    fn resolve_binary(
        &self,
        worker_key: &str,
        mapping: &config::WorkerMapping,
    ) -> Result<(String, Vec<String>), ProcessorError> {
        let base = config::resolve_executable_path(worker_key, mapping, &self.user, self.day);

        #[cfg(windows)]
        let native = format!("{base}.exe");
        #[cfg(not(windows))]
        let native = base.clone();

        if Path::new(&native).is_file() {
            return Ok((native, Vec::new()));
        }
        if native != base && Path::new(&base).is_file() {
            return Ok((base, Vec::new()));
        }

        let dll = format!("{base}.dll");
        if Path::new(&dll).is_file() {
            let launcher = std::env::var("FILEJOBROUTER_RUNTIME_LAUNCHER").unwrap_or_else(|_| "dotnet".to_string());
            return Ok((launcher, vec![dll]));
        }

        Err(ProcessorError::BinaryMissing {
            tried: vec![PathBuf::from(native), PathBuf::from(dll)],
        })
    }

    fn persist_and_notify(&self, job: &Job) {
        self.queue.update(job.clone());
        self.write_side_record(job);
        self.notifier.queue_update(&self.queue.load());
        self.notifier.job_update(&job.id, job.status, job.error_message.as_deref().unwrap_or(""));
    }

    fn write_side_record(&self, job: &Job) {
        let dir = paths::jobs_dir(&self.jobs_base, &self.user, self.day);
        if fs::create_dir_all(&dir).is_err() {
            return;
        }
        let path = paths::job_side_record_file(&self.jobs_base, &self.user, self.day, &job.id);
        let record = JobSideRecord::from(job);
        if let Ok(json) = serde_json::to_vec_pretty(&record) {
            let _ = fs::write(path, json);
        }
    }
}

enum WaitOutcome {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

fn wait_with_timeout(child: &mut Child, timeout_seconds: u64, cancel: &AtomicBool) -> WaitOutcome {
    let deadline = Duration::from_secs(timeout_seconds);
    let poll_interval = Duration::from_millis(200);
    let mut waited = Duration::ZERO;

    loop {
        if cancel.load(Ordering::Relaxed) {
            kill_process_tree(child);
            let _ = child.wait();
            return WaitOutcome::Cancelled;
        }

        let step = poll_interval.min(deadline.saturating_sub(waited).max(Duration::from_millis(1)));
        match child.wait_timeout(step) {
            Ok(Some(status)) => return WaitOutcome::Exited(status),
            Ok(None) => {
                waited += step;
                if waited >= deadline {
                    kill_process_tree(child);
                    let _ = child.wait();
                    return WaitOutcome::TimedOut;
                }
            }
            Err(_) => {
                kill_process_tree(child);
                return WaitOutcome::TimedOut;
            }
        }
    }
}

#[cfg(unix)]
fn kill_process_tree(child: &mut Child) {
    let pid = child.id() as libc::pid_t;
    unsafe {
        // The child was spawned in its own session (see
        // `spawn_worker_process`), so its pid doubles as its process group
        // id and a negative pid targets the whole group.
        libc::kill(-pid, libc::SIGKILL);
    }
    let _ = child.kill();
}

#[cfg(windows)]
fn kill_process_tree(child: &mut Child) {
    let _ = child.kill();
}

#[cfg(unix)]
fn spawn_worker_process(program: &str, args: &[String]) -> std::io::Result<Child> {
    use std::os::unix::process::CommandExt;
    let mut command = Command::new(program);
    command.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
    unsafe {
        command.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }
    command.spawn()
}

#[cfg(windows)]
fn spawn_worker_process(program: &str, args: &[String]) -> std::io::Result<Child> {
    use std::os::windows::process::CommandExt;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .creation_flags(CREATE_NEW_PROCESS_GROUP)
        .spawn()
}

struct JoinableDrain {
    handle: Option<std::thread::JoinHandle<String>>,
}

impl JoinableDrain {
    fn join(mut self) -> Option<String> {
        self.handle.take().and_then(|h| h.join().ok())
    }
}

/// Spawn reader threads draining stdout/stderr immediately so a worker that
/// fills its pipe buffer cannot deadlock against the wait below (§4.4.g).
fn drain_streams(child: &mut Child) -> (JoinableDrain, JoinableDrain) {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let stdout_handle = std::thread::spawn(move || read_all_lossy(stdout));
    let stderr_handle = std::thread::spawn(move || read_all_lossy(stderr));

    (
        JoinableDrain { handle: Some(stdout_handle) },
        JoinableDrain { handle: Some(stderr_handle) },
    )
}

fn read_all_lossy<R: Read>(reader: Option<R>) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::Notifier;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn test_day() -> chrono::NaiveDate {
        chrono::NaiveDate::from_ymd_opt(2026, 7, 28).unwrap()
    }

    fn make_processor(dir: &Path) -> (Processor, Arc<QueueStore>) {
        let queue = Arc::new(QueueStore::new(dir.join("queue"), test_day()));
        let device = Arc::new(DeviceLock::new("TestDevice"));
        let notifier = Arc::new(Notifier::disabled());
        let config = Config {
            watch_directory: dir.join("watch"),
            timeout_seconds: 2,
            max_retry_count: 1,
            log_directory: dir.join("logs"),
            jobs_directory: dir.join("jobs"),
            queue_base_directory: dir.join("queue"),
            mutex_name: "TestDevice".into(),
            mappings: HashMap::new(),
            ignore_hidden_and_system_files: true,
            default_worker_for_root: None,
        };
        let (_tx, rx) = mpsc::channel();
        let processor = Processor::new(
            Arc::clone(&queue),
            device,
            notifier,
            config,
            dir.join("config.json"),
            dir.join("jobs"),
            "alice".to_string(),
            test_day(),
            Arc::new(AtomicBool::new(false)),
            rx,
        );
        (processor, queue)
    }

    #[test]
    fn dispatch_fails_job_with_unknown_target_app() {
        let dir = TempDir::new().unwrap();
        let (processor, queue) = make_processor(dir.path());
        let job = Job::new(
            "job-1".into(),
            "/tmp/x.txt".into(),
            String::new(),
            "nope".into(),
            "alice".into(),
        );
        queue.add(job.clone());
        processor.dispatch(job);

        let stored = queue.find("job-1").unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.error_message.unwrap().contains("unknown target_app"));
    }

    #[test]
    fn retry_command_is_noop_on_non_failed_job() {
        let dir = TempDir::new().unwrap();
        let (processor, queue) = make_processor(dir.path());
        let mut job = Job::new(
            "job-2".into(),
            "/tmp/x.txt".into(),
            String::new(),
            "abc".into(),
            "alice".into(),
        );
        job.status = JobStatus::Pending;
        queue.add(job.clone());

        processor.handle_retry_command("job-2");

        let stored = queue.find("job-2").unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.retry_count, 0);
    }

    #[test]
    fn retry_command_on_missing_input_sets_failed_message() {
        let dir = TempDir::new().unwrap();
        let (processor, queue) = make_processor(dir.path());
        let mut job = Job::new(
            "job-3".into(),
            dir.path().join("missing.txt").to_string_lossy().to_string(),
            String::new(),
            "abc".into(),
            "alice".into(),
        );
        job.status = JobStatus::Failed;
        queue.add(job.clone());

        processor.handle_retry_command("job-3");

        let stored = queue.find("job-3").unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("Input file not found"));
    }

    #[test]
    fn retry_command_requeues_failed_job_with_existing_input() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("present.txt");
        std::fs::write(&input, b"data").unwrap();

        let (processor, queue) = make_processor(dir.path());
        let mut job = Job::new(
            "job-4".into(),
            input.to_string_lossy().to_string(),
            String::new(),
            "abc".into(),
            "alice".into(),
        );
        job.status = JobStatus::Failed;
        job.retry_count = 1;
        queue.add(job.clone());

        processor.handle_retry_command("job-4");

        let stored = queue.find("job-4").unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.retry_count, 2);
    }
}
