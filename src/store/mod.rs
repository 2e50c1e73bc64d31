//! Job store: the durable ledger of submitted jobs.
//!
//! The store is the single source of truth for whether a job has completed.
//! Implementations: [`crate::db::Db`] (Postgres) and [`MemoryJobStore`].

pub mod memory;

pub use memory::MemoryJobStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{Job, JobId, NewJob};

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a pending job under a fresh identifier.
    ///
    /// On error the caller must not assume the job exists.
    async fn create_job(&self, new: NewJob) -> Result<JobId>;

    /// Point lookup. `Error::NotFound` for unknown identifiers.
    async fn get_job(&self, id: JobId) -> Result<Job>;

    /// Record the result of a pending job.
    ///
    /// Applying this to a job that already reached a terminal state returns
    /// the stored record unchanged: the first write wins and duplicates never
    /// fail. `Error::NotFound` for unknown identifiers.
    async fn complete_job(
        &self,
        id: JobId,
        result: f64,
        completed_at: DateTime<Utc>,
    ) -> Result<Job>;

    /// Record an evaluation failure for a pending job. Same idempotence as
    /// [`JobStore::complete_job`].
    async fn fail_job(&self, id: JobId, error: &str, failed_at: DateTime<Utc>) -> Result<Job>;

    /// Pending jobs created before `created_before`, oldest first.
    async fn pending_jobs(&self, created_before: DateTime<Utc>, limit: i64) -> Result<Vec<Job>>;
}
