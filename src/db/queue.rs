//! Central and subsite queue persistence.
//!
//! Enqueue runs supersession, the central insert and the per-site fan-out inside one
//! write transaction.

use std::collections::BTreeMap;

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use super::{find_by_central_marker, subsite_queue_table, Repository};
use crate::errors::AppError;
use crate::models::{
    CentralQueueEntry, CentralSiteStatus, EnqueueResult, FanOutRow, NewCentralEntry, QueueStatus,
    SubsiteQueueEntry, SyncKind,
};

const CENTRAL_COLUMNS: &str = "id, content_id, content_type, target_sites, site_status, sync_kind, snapshot, compare_snapshot, author_id, created_at, modified_at";
const SUBSITE_COLUMNS: &str = "id, central_entry_id, central_content_id, content_type, local_content_id, status, sync_kind, approved_by, reject_reason, created_at, modified_at";

/// Extra fields written when a subsite row leaves `pending`.
#[derive(Debug, Clone, Default)]
pub struct RowTransition {
    pub local_content_id: Option<i64>,
    pub approved_by: Option<i64>,
    pub reject_reason: Option<String>,
}

impl Repository {
    // ==================== CENTRAL QUEUE ====================

    /// Record a sync intent, superseding every live entry for the same content and
    /// every pending row on the target sites.
    pub async fn enqueue(&self, new: &NewCentralEntry) -> Result<EnqueueResult, AppError> {
        let mut conn = self.begin_immediate().await?;
        let result = enqueue_in_tx(&mut conn, new).await;
        let result = Self::finish(&mut conn, result).await?;

        tracing::info!(
            "Enqueued {} for content {} as entry {} ({} rows, {} skipped)",
            new.sync_kind.as_str(),
            new.content_id,
            result.entry_id,
            result.rows.len(),
            result.skipped_sites.len()
        );
        Ok(result)
    }

    pub async fn get_central_entry(&self, id: i64) -> Result<Option<CentralQueueEntry>, AppError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM central_queue WHERE id = ?",
            CENTRAL_COLUMNS
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(central_from_row).transpose()
    }

    /// The single non-expired entry for a content id, if any.
    pub async fn latest_live_entry(
        &self,
        content_id: i64,
    ) -> Result<Option<CentralQueueEntry>, AppError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM central_queue WHERE content_id = ? AND sync_kind != 'expired' ORDER BY id DESC LIMIT 1",
            CENTRAL_COLUMNS
        ))
        .bind(content_id)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(central_from_row).transpose()
    }

    pub async fn list_central_entries(
        &self,
        content_id: Option<i64>,
    ) -> Result<Vec<CentralQueueEntry>, AppError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM central_queue WHERE (? IS NULL OR content_id = ?) ORDER BY id DESC",
            CENTRAL_COLUMNS
        ))
        .bind(content_id)
        .bind(content_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(central_from_row).collect()
    }

    // ==================== SUBSITE QUEUE ====================

    pub async fn get_subsite_row(
        &self,
        site_id: i64,
        row_id: i64,
    ) -> Result<Option<SubsiteQueueEntry>, AppError> {
        let mut conn = self.pool().acquire().await?;
        get_subsite_row(&mut conn, site_id, row_id).await
    }

    /// Newest row for a central content id on one subsite.
    pub async fn latest_subsite_row(
        &self,
        site_id: i64,
        central_content_id: i64,
    ) -> Result<Option<SubsiteQueueEntry>, AppError> {
        let mut conn = self.pool().acquire().await?;
        latest_subsite_row(&mut conn, site_id, central_content_id).await
    }

    /// Row created on a subsite for one central entry.
    pub async fn subsite_row_for_entry(
        &self,
        site_id: i64,
        central_entry_id: i64,
    ) -> Result<Option<SubsiteQueueEntry>, AppError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM {} WHERE central_entry_id = ? ORDER BY id DESC LIMIT 1",
            SUBSITE_COLUMNS,
            subsite_queue_table(site_id)
        ))
        .bind(central_entry_id)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref()
            .map(|r| subsite_from_row(site_id, r))
            .transpose()
    }

    pub async fn list_subsite_rows(
        &self,
        site_id: i64,
        status: Option<QueueStatus>,
    ) -> Result<Vec<SubsiteQueueEntry>, AppError> {
        let status = status.map(|s| s.as_str());
        let rows = sqlx::query(&format!(
            "SELECT {} FROM {} WHERE (? IS NULL OR status = ?) ORDER BY id DESC",
            SUBSITE_COLUMNS,
            subsite_queue_table(site_id)
        ))
        .bind(status)
        .bind(status)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(|r| subsite_from_row(site_id, r)).collect()
    }

    /// Move a pending row to a terminal status. Returns false if it was no longer pending.
    pub async fn transition_subsite_row(
        &self,
        site_id: i64,
        row_id: i64,
        to: QueueStatus,
        transition: &RowTransition,
    ) -> Result<bool, AppError> {
        let mut conn = self.pool().acquire().await?;
        transition_subsite_row(&mut conn, site_id, row_id, to, transition).await
    }

    /// Expire pending rows created by bulk fan-outs for sites outside `keep_sites`.
    pub async fn expire_bulk_rows_outside(
        &self,
        content_id: i64,
        keep_sites: &[i64],
    ) -> Result<usize, AppError> {
        let targets = self.bulk_targets(content_id).await?;
        let mut expired = 0;
        let mut conn = self.begin_immediate().await?;
        let result = async {
            for (site_id, row_id) in targets {
                if keep_sites.contains(&site_id) {
                    continue;
                }
                if transition_subsite_row(
                    &mut conn,
                    site_id,
                    row_id,
                    QueueStatus::Expired,
                    &RowTransition::default(),
                )
                .await?
                {
                    expired += 1;
                }
            }
            Ok::<_, AppError>(())
        }
        .await;
        Self::finish(&mut conn, result).await?;
        Ok(expired)
    }
}

/// Enqueue on a connection that already holds the write lock.
pub async fn enqueue_in_tx(
    conn: &mut SqliteConnection,
    new: &NewCentralEntry,
) -> Result<EnqueueResult, AppError> {
    let now = Utc::now().to_rfc3339();

    // Supersede live central entries
    let live = sqlx::query(
        "SELECT id, site_status FROM central_queue WHERE content_id = ? AND sync_kind != 'expired'",
    )
    .bind(new.content_id)
    .fetch_all(&mut *conn)
    .await?;

    for row in &live {
        let id: i64 = row.get("id");
        let raw: String = row.get("site_status");
        let mut statuses: BTreeMap<i64, CentralSiteStatus> = serde_json::from_str(&raw)?;
        for status in statuses.values_mut() {
            *status = CentralSiteStatus::Expired;
        }
        sqlx::query(
            "UPDATE central_queue SET sync_kind = 'expired', site_status = ?, modified_at = ? WHERE id = ?",
        )
        .bind(serde_json::to_string(&statuses)?)
        .bind(&now)
        .bind(id)
        .execute(&mut *conn)
        .await?;
        tracing::debug!("Central entry {} superseded", id);
    }

    let statuses: BTreeMap<i64, CentralSiteStatus> = new
        .target_sites
        .iter()
        .map(|site| (*site, CentralSiteStatus::Pending))
        .collect();

    let entry_id: i64 = sqlx::query(
        "INSERT INTO central_queue (content_id, content_type, target_sites, site_status, sync_kind, snapshot, compare_snapshot, author_id, created_at, modified_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(new.content_id)
    .bind(&new.content_type)
    .bind(serde_json::to_string(&new.target_sites)?)
    .bind(serde_json::to_string(&statuses)?)
    .bind(new.sync_kind.as_str())
    .bind(serde_json::to_string(&new.snapshot)?)
    .bind(serde_json::to_string(&new.compare_snapshot)?)
    .bind(new.author_id)
    .bind(&now)
    .bind(&now)
    .fetch_one(&mut *conn)
    .await?
    .get("id");

    let mut rows = Vec::new();
    let mut skipped_sites = Vec::new();

    for site_id in &new.target_sites {
        let table = subsite_queue_table(*site_id);

        sqlx::query(&format!(
            "UPDATE {} SET status = 'expired', modified_at = ? WHERE central_content_id = ? AND status = 'pending'",
            table
        ))
        .bind(&now)
        .bind(new.content_id)
        .execute(&mut *conn)
        .await?;

        let local_content_id = find_by_central_marker(conn, *site_id, new.content_id)
            .await?
            .map(|c| c.id)
            .unwrap_or(0);

        // Nothing to delete on a site that never received the object
        if new.sync_kind == SyncKind::Delete && local_content_id == 0 {
            skipped_sites.push(*site_id);
            continue;
        }

        let row_id: i64 = sqlx::query(&format!(
            "INSERT INTO {} (central_entry_id, central_content_id, content_type, local_content_id, status, sync_kind, created_at, modified_at) VALUES (?, ?, ?, ?, 'pending', ?, ?, ?) RETURNING id",
            table
        ))
        .bind(entry_id)
        .bind(new.content_id)
        .bind(&new.content_type)
        .bind(local_content_id)
        .bind(new.sync_kind.as_str())
        .bind(&now)
        .bind(&now)
        .fetch_one(&mut *conn)
        .await?
        .get("id");

        rows.push(FanOutRow {
            site_id: *site_id,
            row_id,
            local_content_id,
        });
    }

    Ok(EnqueueResult {
        entry_id,
        rows,
        skipped_sites,
    })
}

pub async fn get_subsite_row(
    conn: &mut SqliteConnection,
    site_id: i64,
    row_id: i64,
) -> Result<Option<SubsiteQueueEntry>, AppError> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM {} WHERE id = ?",
        SUBSITE_COLUMNS,
        subsite_queue_table(site_id)
    ))
    .bind(row_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref()
        .map(|r| subsite_from_row(site_id, r))
        .transpose()
}

pub async fn latest_subsite_row(
    conn: &mut SqliteConnection,
    site_id: i64,
    central_content_id: i64,
) -> Result<Option<SubsiteQueueEntry>, AppError> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM {} WHERE central_content_id = ? ORDER BY id DESC LIMIT 1",
        SUBSITE_COLUMNS,
        subsite_queue_table(site_id)
    ))
    .bind(central_content_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref()
        .map(|r| subsite_from_row(site_id, r))
        .transpose()
}

pub async fn transition_subsite_row(
    conn: &mut SqliteConnection,
    site_id: i64,
    row_id: i64,
    to: QueueStatus,
    transition: &RowTransition,
) -> Result<bool, AppError> {
    let result = sqlx::query(&format!(
        "UPDATE {} SET status = ?, local_content_id = COALESCE(?, local_content_id), approved_by = COALESCE(?, approved_by), reject_reason = COALESCE(?, reject_reason), modified_at = ? WHERE id = ? AND status = 'pending'",
        subsite_queue_table(site_id)
    ))
    .bind(to.as_str())
    .bind(transition.local_content_id)
    .bind(transition.approved_by)
    .bind(&transition.reject_reason)
    .bind(Utc::now().to_rfc3339())
    .bind(row_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

fn central_from_row(row: &SqliteRow) -> Result<CentralQueueEntry, AppError> {
    let target_sites: String = row.get("target_sites");
    let site_status: String = row.get("site_status");
    let sync_kind: String = row.get("sync_kind");
    let snapshot: String = row.get("snapshot");
    let compare: String = row.get("compare_snapshot");

    Ok(CentralQueueEntry {
        id: row.get("id"),
        content_id: row.get("content_id"),
        content_type: row.get("content_type"),
        target_sites: serde_json::from_str(&target_sites)?,
        site_status: serde_json::from_str(&site_status)?,
        sync_kind: parse_kind(&sync_kind)?,
        snapshot: serde_json::from_str(&snapshot)?,
        compare_snapshot: serde_json::from_str(&compare)?,
        author_id: row.get("author_id"),
        created_at: row.get("created_at"),
        modified_at: row.get("modified_at"),
    })
}

fn subsite_from_row(site_id: i64, row: &SqliteRow) -> Result<SubsiteQueueEntry, AppError> {
    let status: String = row.get("status");
    let sync_kind: String = row.get("sync_kind");

    Ok(SubsiteQueueEntry {
        id: row.get("id"),
        site_id,
        central_entry_id: row.get("central_entry_id"),
        central_content_id: row.get("central_content_id"),
        content_type: row.get("content_type"),
        local_content_id: row.get("local_content_id"),
        status: QueueStatus::from_str(&status)
            .ok_or_else(|| AppError::Internal(format!("Unknown queue status '{}'", status)))?,
        sync_kind: parse_kind(&sync_kind)?,
        approved_by: row.get("approved_by"),
        reject_reason: row.get("reject_reason"),
        created_at: row.get("created_at"),
        modified_at: row.get("modified_at"),
    })
}

fn parse_kind(raw: &str) -> Result<SyncKind, AppError> {
    SyncKind::from_str(raw)
        .ok_or_else(|| AppError::Internal(format!("Unknown sync kind '{}'", raw)))
}
