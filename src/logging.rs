//! Structured logging setup (§B of the expanded spec).
//!
//! A `tracing-subscriber` registry with an `EnvFilter` (`FILEJOBROUTER_LOG`,
//! falling back to `info`) fans out to two layers: a human-readable stdout
//! layer for interactive runs, and a non-blocking rolling file writer rooted
//! at the day-local log directory, the same shape the pack's daemon crates
//! use (`tracing` + `tracing-appender`) rather than the teacher's bare
//! `println!` — `pend` is a short-lived CLI, this is a long-running daemon.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Must be kept alive for the lifetime of the process: dropping it stops the
/// background writer thread and silently truncates any buffered log lines.
pub fn init(log_dir: &Path) -> std::io::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "engine.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_env("FILEJOBROUTER_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = fmt::layer().with_target(false);
    let file_layer = fmt::layer().with_target(false).with_ansi(false).with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}
