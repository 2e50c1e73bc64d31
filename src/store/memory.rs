//! In-memory job store for tests and single-process runs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::JobStore;
use crate::error::{Error, Result};
use crate::model::{Job, JobId, NewJob};

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, new: NewJob) -> Result<JobId> {
        let id = JobId::new();
        let job = Job {
            id,
            submitter: new.submitter,
            expression: new.expression,
            result: None,
            created: Utc::now(),
            completed: None,
            error: None,
            failed: None,
        };
        self.jobs.write().await.insert(id, job);
        Ok(id)
    }

    async fn get_job(&self, id: JobId) -> Result<Job> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("job {id}")))
    }

    async fn complete_job(
        &self,
        id: JobId,
        result: f64,
        completed_at: DateTime<Utc>,
    ) -> Result<Job> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("job {id}")))?;
        if job.is_pending() {
            job.result = Some(result);
            job.completed = Some(completed_at);
        }
        Ok(job.clone())
    }

    async fn fail_job(&self, id: JobId, error: &str, failed_at: DateTime<Utc>) -> Result<Job> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("job {id}")))?;
        if job.is_pending() {
            job.error = Some(error.to_string());
            job.failed = Some(failed_at);
        }
        Ok(job.clone())
    }

    async fn pending_jobs(&self, created_before: DateTime<Utc>, limit: i64) -> Result<Vec<Job>> {
        let jobs = self.jobs.read().await;
        let mut pending: Vec<Job> = jobs
            .values()
            .filter(|job| job.is_pending() && job.created < created_before)
            .cloned()
            .collect();
        pending.sort_by_key(|job| job.created);
        pending.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(pending)
    }
}
