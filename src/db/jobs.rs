//! Job ledger operations on the `calculations` table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{Job, JobId, NewJob};
use crate::store::JobStore;

const JOB_COLUMNS: &str = "id, submitter, expression, result, created, completed, error, failed";

#[async_trait]
impl JobStore for super::Db {
    async fn create_job(&self, new: NewJob) -> Result<JobId> {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO calculations (id, submitter, expression) VALUES ($1, $2, $3)")
            .bind(id)
            .bind(&new.submitter)
            .bind(&new.expression)
            .execute(self.pool())
            .await?;
        Ok(JobId(id))
    }

    async fn get_job(&self, id: JobId) -> Result<Job> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM calculations WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(self.pool())
                .await?;

        row.map(Job::from)
            .ok_or_else(|| Error::NotFound(format!("job {id}")))
    }

    async fn complete_job(
        &self,
        id: JobId,
        result: f64,
        completed_at: DateTime<Utc>,
    ) -> Result<Job> {
        // Only a pending row is updated; a duplicate delivery falls through
        // to the lookup and gets the stored record back.
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "UPDATE calculations SET result = $1, completed = $2
             WHERE id = $3 AND completed IS NULL AND failed IS NULL
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(result)
        .bind(completed_at)
        .bind(id.0)
        .fetch_optional(self.pool())
        .await?;

        match row {
            Some(row) => Ok(row.into()),
            None => self.get_job(id).await,
        }
    }

    async fn fail_job(&self, id: JobId, error: &str, failed_at: DateTime<Utc>) -> Result<Job> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "UPDATE calculations SET error = $1, failed = $2
             WHERE id = $3 AND completed IS NULL AND failed IS NULL
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(error)
        .bind(failed_at)
        .bind(id.0)
        .fetch_optional(self.pool())
        .await?;

        match row {
            Some(row) => Ok(row.into()),
            None => self.get_job(id).await,
        }
    }

    async fn pending_jobs(&self, created_before: DateTime<Utc>, limit: i64) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM calculations
             WHERE completed IS NULL AND failed IS NULL AND created < $1
             ORDER BY created
             LIMIT $2"
        ))
        .bind(created_before)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(rows.into_iter().map(Job::from).collect())
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    submitter: String,
    expression: String,
    result: Option<f64>,
    created: DateTime<Utc>,
    completed: Option<DateTime<Utc>>,
    error: Option<String>,
    failed: Option<DateTime<Utc>>,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Self {
            id: JobId(row.id),
            submitter: row.submitter,
            expression: row.expression,
            result: row.result,
            created: row.created,
            completed: row.completed,
            error: row.error,
            failed: row.failed,
        }
    }
}
