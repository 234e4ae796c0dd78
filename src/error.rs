//! Typed errors at each component boundary.
//!
//! The exceptions-as-control-flow shape of the source system becomes
//! explicit `Result<T, ComponentError>` here: catastrophic failures
//! propagate up to `main` and are mapped to the process exit codes in the
//! spec's external-interfaces section; per-job failures never propagate
//! this far — they are captured into `Job.error_message` by the Processor.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no config.json found in any ancestor of the running executable")]
    NotFound,
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum InstanceGuardError {
    #[error("another instance is already running (pid file: {0:?})")]
    AlreadyRunning(PathBuf),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum DeviceLockError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to read queue file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse queue file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write queue file {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Notify(#[from] notify::Error),
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("worker binary not found, tried: {tried:?}")]
    BinaryMissing { tried: Vec<PathBuf> },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("no reachable notifier endpoint configured")]
    NoEndpoint,
    #[error(transparent)]
    WebSocket(#[from] tungstenite::Error),
}

/// Top-level startup error, mapped to exit code 1 per the spec's process
/// exit codes (`0` normal shutdown, `1` fatal startup error).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    InstanceGuard(#[from] InstanceGuardError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
