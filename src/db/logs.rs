//! Sync log, synced-subsite projection, bulk bookkeeping and notification outbox.

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::Repository;
use crate::errors::AppError;
use crate::models::{SiteOutcome, SyncLogEntry, SyncedSubsiteData};

/// A queued notification.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxMessage {
    pub id: i64,
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
    pub created_at: String,
}

impl Repository {
    // ==================== SYNC LOG ====================

    /// Append one log row aggregating the outcomes of a fan-out.
    pub async fn append_sync_log(
        &self,
        content_id: i64,
        content_name: &str,
        outcomes: &[SiteOutcome],
    ) -> Result<i64, AppError> {
        let id = sqlx::query(
            "INSERT INTO sync_logs (content_id, content_name, site_outcomes, created_at) VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(content_id)
        .bind(content_name)
        .bind(serde_json::to_string(outcomes)?)
        .bind(Utc::now().to_rfc3339())
        .fetch_one(self.pool())
        .await?
        .get("id");
        Ok(id)
    }

    pub async fn list_sync_logs(
        &self,
        content_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<SyncLogEntry>, AppError> {
        let rows = sqlx::query(
            "SELECT id, content_id, content_name, site_outcomes, created_at FROM sync_logs WHERE (? IS NULL OR content_id = ?) ORDER BY id DESC LIMIT ?",
        )
        .bind(content_id)
        .bind(content_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(log_from_row).collect()
    }

    // ==================== SYNCED SUBSITE PROJECTION ====================

    /// Overwrite the latest reported outcome for a (content, site) pair.
    pub async fn upsert_synced_data(
        &self,
        central_content_id: i64,
        data: &SyncedSubsiteData,
    ) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO synced_subsite_data (central_content_id, site_id, outcome, updated_at) VALUES (?, ?, ?, ?) ON CONFLICT(central_content_id, site_id) DO UPDATE SET outcome = excluded.outcome, updated_at = excluded.updated_at",
        )
        .bind(central_content_id)
        .bind(data.site_id)
        .bind(serde_json::to_string(data)?)
        .bind(Utc::now().to_rfc3339())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn synced_data(
        &self,
        central_content_id: i64,
    ) -> Result<Vec<SyncedSubsiteData>, AppError> {
        let rows = sqlx::query(
            "SELECT outcome FROM synced_subsite_data WHERE central_content_id = ? ORDER BY site_id",
        )
        .bind(central_content_id)
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| {
                let raw: String = row.get("outcome");
                serde_json::from_str(&raw).map_err(AppError::from)
            })
            .collect()
    }

    // ==================== BULK BOOKKEEPING ====================

    pub async fn record_bulk_target(
        &self,
        content_id: i64,
        site_id: i64,
        subsite_row_id: i64,
    ) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO bulk_sync_targets (content_id, site_id, subsite_row_id) VALUES (?, ?, ?) ON CONFLICT(content_id, site_id) DO UPDATE SET subsite_row_id = excluded.subsite_row_id",
        )
        .bind(content_id)
        .bind(site_id)
        .bind(subsite_row_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// `(site_id, subsite_row_id)` pairs recorded by bulk fan-outs.
    pub async fn bulk_targets(&self, content_id: i64) -> Result<Vec<(i64, i64)>, AppError> {
        let rows = sqlx::query(
            "SELECT site_id, subsite_row_id FROM bulk_sync_targets WHERE content_id = ? ORDER BY site_id",
        )
        .bind(content_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get("site_id"), r.get("subsite_row_id")))
            .collect())
    }

    pub async fn clear_bulk_targets(&self, content_id: i64) -> Result<(), AppError> {
        sqlx::query("DELETE FROM bulk_sync_targets WHERE content_id = ?")
            .bind(content_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    // ==================== NOTIFICATION OUTBOX ====================

    pub async fn queue_notification(
        &self,
        recipients: &[String],
        subject: &str,
        body: &str,
    ) -> Result<i64, AppError> {
        let id = sqlx::query(
            "INSERT INTO notification_outbox (recipients, subject, body, created_at) VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(serde_json::to_string(recipients)?)
        .bind(subject)
        .bind(body)
        .bind(Utc::now().to_rfc3339())
        .fetch_one(self.pool())
        .await?
        .get("id");
        Ok(id)
    }

    pub async fn list_notifications(&self) -> Result<Vec<OutboxMessage>, AppError> {
        let rows = sqlx::query(
            "SELECT id, recipients, subject, body, created_at FROM notification_outbox ORDER BY id",
        )
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| {
                let recipients: String = row.get("recipients");
                Ok(OutboxMessage {
                    id: row.get("id"),
                    recipients: serde_json::from_str(&recipients)?,
                    subject: row.get("subject"),
                    body: row.get("body"),
                    created_at: row.get("created_at"),
                })
            })
            .collect()
    }
}

fn log_from_row(row: &SqliteRow) -> Result<SyncLogEntry, AppError> {
    let outcomes: String = row.get("site_outcomes");
    Ok(SyncLogEntry {
        id: row.get("id"),
        content_id: row.get("content_id"),
        content_name: row.get("content_name"),
        site_outcomes: serde_json::from_str(&outcomes)?,
        created_at: row.get("created_at"),
    })
}
