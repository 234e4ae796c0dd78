//! The process context (§9 "process context" redesign note): owns the
//! config, the six components, and the cancellation token that fans out
//! shutdown, and runs the threads described in §5.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::config::Config;
use crate::device_lock::DeviceLock;
use crate::error::EngineError;
use crate::instance_guard::InstanceGuard;
use crate::notifier::Notifier;
use crate::paths;
use crate::processor::Processor;
use crate::queue::QueueStore;
use crate::watcher::Watcher;

pub struct Engine {
    config: Config,
    config_path: PathBuf,
    day: chrono::NaiveDate,
    user: String,
    cancel: Arc<AtomicBool>,
    _instance_guard: InstanceGuard,
}

impl Engine {
    /// Acquires the Instance Guard and returns a value ready to `run()`,
    /// given an already-loaded config (the caller loads it first so it can
    /// initialise logging before any other startup step can fail). Any
    /// failure here is fatal startup error territory (§6/§7: exit code 1).
    pub fn bootstrap(config: Config, config_path: PathBuf) -> Result<Self, EngineError> {
        let day = paths::today();
        let user = paths::current_user();
        let log_dir = paths::log_dir(&config.log_directory, &user, day);

        let instance_guard = InstanceGuard::acquire(&log_dir)?;

        tracing::info!(%user, %day, "engine bootstrapped");

        Ok(Self {
            config,
            config_path,
            day,
            user,
            cancel: Arc::new(AtomicBool::new(false)),
            _instance_guard: instance_guard,
        })
    }

    pub fn cancellation_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Wires the six components together and runs until the cancellation
    /// token is observed, then tears everything down in order (§5).
    pub fn run(self) {
        let queue = Arc::new(QueueStore::new(self.config.queue_base_directory.clone(), self.day));
        let device = Arc::new(DeviceLock::new(&self.config.mutex_name));
        let (notifier, retry_rx) = Notifier::spawn(Arc::clone(&self.cancel));

        let watcher = Arc::new(Watcher::new(
            self.config.watch_directory.clone(),
            self.config.mappings.clone(),
            self.config.default_worker_for_root.clone(),
            self.config.ignore_hidden_and_system_files,
            self.user.clone(),
            self.day,
            Arc::clone(&queue),
        ));

        tracing::info!("bootstrapping watcher over pre-existing files");
        watcher.bootstrap();

        let watcher_cancel = Arc::clone(&self.cancel);
        let watcher_for_thread = Arc::clone(&watcher);
        let watcher_handle = std::thread::spawn(move || {
            if let Err(e) = watcher_for_thread.run(watcher_cancel) {
                tracing::error!("watcher stopped with error: {e}");
            }
        });

        let processor = Arc::new(Processor::new(
            Arc::clone(&queue),
            device,
            notifier,
            self.config.clone(),
            self.config_path.clone(),
            self.config.jobs_directory.clone(),
            self.user.clone(),
            self.day,
            Arc::clone(&self.cancel),
            retry_rx,
        ));

        let processor_handle = {
            let processor = Arc::clone(&processor);
            std::thread::spawn(move || processor.run())
        };

        tracing::info!("engine running, awaiting cancellation");
        let _ = processor_handle.join();
        let _ = watcher_handle.join();
        tracing::info!("engine shut down cleanly");
    }
}
