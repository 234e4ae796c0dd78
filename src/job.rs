//! The persistent `Job` record and its status machine.
//!
//! A [`Job`] is created by the Watcher, mutated exclusively by the
//! Processor, and serialised verbatim into the day's queue file. Field
//! names are `PascalCase` on the wire to match readers already in the
//! field (see the queue file format in the spec).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel `target_app` used for files dropped directly in the watch root
/// before a worker has been resolved. Modern behaviour resolves these via
/// `DefaultWorkerForRoot` only; the sentinel exists purely so that a job
/// record can be constructed before resolution happens.
pub const USER_CHOICE: &str = "user_choice";

/// Status transitions are monotonic along the edges documented in §3 of the
/// spec:
///
/// `Pending -> Processing -> {Completed, Failed, Timeout}`, plus
/// `{Failed, Timeout} -> Pending` on retry and `Processing -> Pending` on
/// crash recovery.
///
/// Serialised as the integer ordinal below to match readers already in the
/// field; see [`JobSideRecord`] for the string-named sibling used in the
/// per-job side record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JobStatus {
    Pending = 0,
    Processing = 1,
    Completed = 2,
    Failed = 3,
    Timeout = 4,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "Pending",
            JobStatus::Processing => "Processing",
            JobStatus::Completed => "Completed",
            JobStatus::Failed => "Failed",
            JobStatus::Timeout => "Timeout",
        }
    }

    /// Whether this status is one of the two "active" statuses used by the
    /// Watcher's duplicate-suppression rule.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Processing)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "InputPath")]
    pub input_path: String,
    #[serde(rename = "OutputPath")]
    pub output_path: String,
    #[serde(rename = "TargetApp")]
    pub target_app: String,
    #[serde(rename = "Status")]
    pub status: JobStatus,
    #[serde(rename = "CreatedAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "StartedAt", skip_serializing_if = "Option::is_none", default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(rename = "CompletedAt", skip_serializing_if = "Option::is_none", default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(rename = "RetryCount")]
    pub retry_count: u32,
    #[serde(rename = "ErrorMessage", skip_serializing_if = "Option::is_none", default)]
    pub error_message: Option<String>,
    #[serde(rename = "UserName")]
    pub user_name: String,
}

impl Job {
    /// Construct a brand-new `Pending` job as the Watcher would at intake
    /// time. `output_path` may be left empty when the target worker has not
    /// been resolved yet (root-level intake of `"user_choice"` jobs).
    pub fn new(
        id: String,
        input_path: String,
        output_path: String,
        target_app: String,
        user_name: String,
    ) -> Self {
        Self {
            id,
            input_path,
            output_path,
            target_app,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            error_message: None,
            user_name,
        }
    }
}

/// The per-job side record written under `jobs/<user>/<yyyy-MM-dd>/<id>.json`.
/// Unlike the queue file, `Status` is serialised as its string name here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSideRecord {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "InputPath")]
    pub input_path: String,
    #[serde(rename = "TargetApp")]
    pub target_app: String,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "ErrorMessage", skip_serializing_if = "Option::is_none", default)]
    pub error_message: Option<String>,
    #[serde(rename = "Username")]
    pub username: String,
}

impl From<&Job> for JobSideRecord {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            input_path: job.input_path.clone(),
            target_app: job.target_app.clone(),
            status: job.status.as_str().to_string(),
            timestamp: Utc::now(),
            error_message: job.error_message.clone(),
            username: job.user_name.clone(),
        }
    }
}

// `serde_repr` is not part of the teacher's dependency set; the dispatch
// engine needs integer-ordinal enum serialisation for the queue file while
// keeping a string form for the side record, so a small hand-rolled
// repr-serialisation pair stands in for the `serde_repr` derive macros.
mod repr_support {
    use super::JobStatus;
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    impl serde::Serialize for JobStatus {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.serialize_u8(*self as u8)
        }
    }

    struct JobStatusVisitor;

    impl<'de> Visitor<'de> for JobStatusVisitor {
        type Value = JobStatus;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("an integer 0..=4 representing a job status")
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            match v {
                0 => Ok(JobStatus::Pending),
                1 => Ok(JobStatus::Processing),
                2 => Ok(JobStatus::Completed),
                3 => Ok(JobStatus::Failed),
                4 => Ok(JobStatus::Timeout),
                other => Err(de::Error::custom(format!("invalid job status ordinal {other}"))),
            }
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            self.visit_u64(v as u64)
        }
    }

    impl<'de> serde::Deserialize<'de> for JobStatus {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_u64(JobStatusVisitor)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_ordinal_round_trips() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Timeout,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            let back: JobStatus = serde_json::from_str(&json).unwrap();
            assert_eq!(status, back);
        }
        assert_eq!(serde_json::to_string(&JobStatus::Pending).unwrap(), "0");
        assert_eq!(serde_json::to_string(&JobStatus::Timeout).unwrap(), "4");
    }

    #[test]
    fn job_round_trips_through_json() {
        let job = Job::new(
            "abc123".into(),
            "/w/abc/x.txt".into(),
            "/out/abc/x.txt".into(),
            "abc".into(),
            "alice".into(),
        );
        let json = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, job.id);
        assert_eq!(back.status, JobStatus::Pending);
        assert!(back.started_at.is_none());
    }

    #[test]
    fn active_status_classification() {
        assert!(JobStatus::Pending.is_active());
        assert!(JobStatus::Processing.is_active());
        assert!(!JobStatus::Completed.is_active());
        assert!(!JobStatus::Failed.is_active());
        assert!(!JobStatus::Timeout.is_active());
    }
}
