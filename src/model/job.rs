//! Job record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A job record as held by the job store.
///
/// `result` and `completed` are either both present or both absent, and the
/// same holds for `error` and `failed`. A record is never both completed and
/// failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Who submitted the expression.
    pub submitter: String,
    pub expression: String,
    pub result: Option<f64>,
    pub created: DateTime<Utc>,
    pub completed: Option<DateTime<Utc>>,
    /// Evaluation failure message, if the expression could not be computed.
    pub error: Option<String>,
    pub failed: Option<DateTime<Utc>>,
}

impl Job {
    pub fn status(&self) -> JobStatus {
        if self.completed.is_some() {
            JobStatus::Completed
        } else if self.failed.is_some() {
            JobStatus::Failed
        } else {
            JobStatus::Pending
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status() == JobStatus::Pending
    }
}

/// Newtype for job IDs. Assigned at creation, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(JobId)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Derived lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Submitted, no result recorded yet.
    Pending,
    /// Result recorded. Terminal.
    Completed,
    /// Expression could not be evaluated. Terminal.
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Parameters for creating a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub expression: String,
    pub submitter: String,
}

impl NewJob {
    pub fn new(expression: impl Into<String>, submitter: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            submitter: submitter.into(),
        }
    }
}
