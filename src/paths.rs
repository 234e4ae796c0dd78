//! Day-partitioned path computation shared by the Queue Store, Instance
//! Guard and job-side records.
//!
//! The "current day" for a running engine is fixed at startup (see §3 of
//! the spec: "the day in effect when the engine started") and threaded
//! through explicitly rather than recomputed from `Utc::now()` on every
//! call, so a run straddling midnight stays internally consistent.

use std::path::PathBuf;

use chrono::{NaiveDate, Utc};

/// Render a day as the `yyyy-MM-dd` partition name used throughout the
/// on-disk layout.
pub fn day_string(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

/// The day in effect right now, used exactly once at engine startup.
pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Best-effort lookup of the OS user under which the engine (and therefore
/// file intake) is running. Falls back to `"unknown"` rather than failing
/// outright — this is informational only and must never block dispatch.
pub fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

pub fn queue_dir(queue_base: &std::path::Path, day: NaiveDate) -> PathBuf {
    queue_base.join(day_string(day))
}

pub fn queue_file(queue_base: &std::path::Path, day: NaiveDate) -> PathBuf {
    queue_dir(queue_base, day).join("queue.json")
}

pub fn queue_lock_file(queue_base: &std::path::Path, day: NaiveDate) -> PathBuf {
    queue_dir(queue_base, day).join("queue.lock")
}

pub fn log_dir(log_base: &std::path::Path, user: &str, day: NaiveDate) -> PathBuf {
    log_base.join(user).join(day_string(day))
}

pub fn jobs_dir(jobs_base: &std::path::Path, user: &str, day: NaiveDate) -> PathBuf {
    jobs_base.join(user).join(day_string(day))
}

pub fn job_side_record_file(
    jobs_base: &std::path::Path,
    user: &str,
    day: NaiveDate,
    job_id: &str,
) -> PathBuf {
    jobs_dir(jobs_base, user, day).join(format!("{job_id}.json"))
}
