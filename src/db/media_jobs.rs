//! Deferred media reconciliation jobs.

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::Repository;
use crate::errors::AppError;
use crate::models::MediaSet;

/// Attempts before a job is parked as failed.
pub const MAX_MEDIA_ATTEMPTS: i64 = 3;

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaJob {
    pub id: i64,
    pub site_id: i64,
    pub subsite_content_id: i64,
    pub media_set_hash: String,
    pub media_set: MediaSet,
    pub status: String,
    pub attempts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

const JOB_COLUMNS: &str =
    "id, site_id, subsite_content_id, media_set_hash, media_set, status, attempts, last_error";

impl Repository {
    /// Schedule a job unless an identical one is already pending.
    /// Returns the new job id, or `None` when deduplicated.
    pub async fn schedule_media_job(
        &self,
        site_id: i64,
        subsite_content_id: i64,
        media_set: &MediaSet,
    ) -> Result<Option<i64>, AppError> {
        let now = Utc::now().to_rfc3339();
        let row = sqlx::query(
            "INSERT INTO media_jobs (site_id, subsite_content_id, media_set_hash, media_set, status, attempts, created_at, updated_at) VALUES (?, ?, ?, ?, 'pending', 0, ?, ?) ON CONFLICT (site_id, subsite_content_id, media_set_hash) WHERE status = 'pending' DO NOTHING RETURNING id",
        )
        .bind(site_id)
        .bind(subsite_content_id)
        .bind(media_set.hash()?)
        .bind(serde_json::to_string(media_set)?)
        .bind(&now)
        .bind(&now)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|r| r.get("id")))
    }

    /// Claim the oldest pending job.
    pub async fn claim_media_job(&self) -> Result<Option<MediaJob>, AppError> {
        let row = sqlx::query(&format!(
            "UPDATE media_jobs SET status = 'running', attempts = attempts + 1, updated_at = ? WHERE id = (SELECT id FROM media_jobs WHERE status = 'pending' ORDER BY id LIMIT 1) RETURNING {}",
            JOB_COLUMNS
        ))
        .bind(Utc::now().to_rfc3339())
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    pub async fn complete_media_job(&self, id: i64) -> Result<(), AppError> {
        sqlx::query("UPDATE media_jobs SET status = 'done', last_error = NULL, updated_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Put a job back for another attempt, or park it once attempts run out.
    pub async fn fail_media_job(&self, job: &MediaJob, error: &str) -> Result<(), AppError> {
        let status = if job.attempts >= MAX_MEDIA_ATTEMPTS {
            "failed"
        } else {
            "pending"
        };
        let result = sqlx::query(
            "UPDATE media_jobs SET status = ?, last_error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status)
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(job.id)
        .execute(self.pool())
        .await;

        match result {
            Ok(_) => Ok(()),
            // An identical job was scheduled meanwhile; it supersedes this retry
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                sqlx::query("UPDATE media_jobs SET status = 'failed', last_error = ? WHERE id = ?")
                    .bind(error)
                    .bind(job.id)
                    .execute(self.pool())
                    .await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Return jobs left `running` by a previous process to the queue.
    pub async fn requeue_running_media_jobs(&self) -> Result<u64, AppError> {
        let result = sqlx::query(
            "UPDATE media_jobs SET status = 'pending' WHERE status = 'running' AND NOT EXISTS (SELECT 1 FROM media_jobs p WHERE p.status = 'pending' AND p.site_id = media_jobs.site_id AND p.subsite_content_id = media_jobs.subsite_content_id AND p.media_set_hash = media_jobs.media_set_hash)",
        )
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn list_media_jobs(&self, site_id: i64) -> Result<Vec<MediaJob>, AppError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM media_jobs WHERE site_id = ? ORDER BY id",
            JOB_COLUMNS
        ))
        .bind(site_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(job_from_row).collect()
    }
}

fn job_from_row(row: &SqliteRow) -> Result<MediaJob, AppError> {
    let media_set: String = row.get("media_set");
    Ok(MediaJob {
        id: row.get("id"),
        site_id: row.get("site_id"),
        subsite_content_id: row.get("subsite_content_id"),
        media_set_hash: row.get("media_set_hash"),
        media_set: serde_json::from_str(&media_set)?,
        status: row.get("status"),
        attempts: row.get("attempts"),
        last_error: row.get("last_error"),
    })
}
