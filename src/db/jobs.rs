//! Job documents with a version-guarded update.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{Job, JobId, JobStatus};
use crate::store::{CasOutcome, VersionedStore};

#[async_trait]
impl VersionedStore for super::Db {
    async fn create(&self, job: &Job) -> Result<u64> {
        let mut doc = job.clone();
        doc.version = 1;
        let rows_affected = sqlx::query(
            "INSERT INTO translation_jobs (id, version, status, doc, created_at, updated_at)
             VALUES ($1, 1, $2, $3, $4, $4)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(job.id.0)
        .bind(job.status.to_string())
        .bind(serde_json::to_value(&doc)?)
        .bind(job.created_at)
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(Error::InvalidInput(format!("job {} already exists", job.id)));
        }
        Ok(1)
    }

    async fn load(&self, id: JobId) -> Result<Job> {
        let row: Option<(i64, serde_json::Value)> =
            sqlx::query_as("SELECT version, doc FROM translation_jobs WHERE id = $1")
                .bind(id.0)
                .fetch_optional(self.pool())
                .await?;

        let (version, doc) = row.ok_or_else(|| Error::NotFound(format!("job {id}")))?;
        let mut job: Job = serde_json::from_value(doc)?;
        job.version = version as u64;
        Ok(job)
    }

    async fn compare_and_swap(
        &self,
        id: JobId,
        expected_version: u64,
        job: &Job,
    ) -> Result<CasOutcome> {
        let next = expected_version + 1;
        let mut doc = job.clone();
        doc.version = next;

        let updated: Option<(i64,)> = sqlx::query_as(
            "UPDATE translation_jobs SET version = $1, status = $2, doc = $3, updated_at = now()
             WHERE id = $4 AND version = $5
             RETURNING version",
        )
        .bind(next as i64)
        .bind(job.status.to_string())
        .bind(serde_json::to_value(&doc)?)
        .bind(id.0)
        .bind(expected_version as i64)
        .fetch_optional(self.pool())
        .await?;

        if let Some((version,)) = updated {
            return Ok(CasOutcome::Applied {
                version: version as u64,
            });
        }

        let current: Option<(i64,)> =
            sqlx::query_as("SELECT version FROM translation_jobs WHERE id = $1")
                .bind(id.0)
                .fetch_optional(self.pool())
                .await?;
        match current {
            Some((current,)) => Ok(CasOutcome::Conflict {
                current: current as u64,
            }),
            None => Err(Error::NotFound(format!("job {id}"))),
        }
    }
}

/// One row of the job listing.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: JobId,
    pub status: String,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl super::Db {
    /// Most recent jobs first, optionally filtered by status.
    pub async fn list_jobs(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<JobRow>> {
        let rows: Vec<(Uuid, String, i64, DateTime<Utc>, DateTime<Utc>)> = sqlx::query_as(
            "SELECT id, status, version, created_at, updated_at FROM translation_jobs
             WHERE ($1::text IS NULL OR status = $1)
             ORDER BY created_at DESC
             LIMIT $2",
        )
        .bind(status.map(|s| s.to_string()))
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, status, version, created_at, updated_at)| JobRow {
                id: JobId(id),
                status,
                version: version as u64,
                created_at,
                updated_at,
            })
            .collect())
    }
}
