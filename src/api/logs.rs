//! Sync log and notification outbox endpoints.

use axum::extract::{Query, State};
use serde::Deserialize;

use super::{respond, ApiResult};
use crate::db::OutboxMessage;
use crate::models::SyncLogEntry;
use crate::AppState;

const DEFAULT_LOG_LIMIT: i64 = 100;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogQuery {
    pub content_id: Option<i64>,
    pub limit: Option<i64>,
}

/// GET /api/logs - Sync log rows, newest first.
pub async fn list_logs(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> ApiResult<Vec<SyncLogEntry>> {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, 1000);
    respond(state.repo.list_sync_logs(query.content_id, limit).await)
}

/// GET /api/notifications - Queued reviewer notifications.
pub async fn list_notifications(State(state): State<AppState>) -> ApiResult<Vec<OutboxMessage>> {
    respond(state.repo.list_notifications().await)
}
