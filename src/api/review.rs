//! Subsite review endpoints.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;

use super::{error, respond, ApiResult};
use crate::errors::AppError;
use crate::models::{
    ApproveRequest, PreviewResult, QueueStatus, RejectRequest, ReviewOutcome, SubsiteQueueEntry,
};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct QueueListQuery {
    pub status: Option<String>,
}

/// GET /api/sites/:site_id/queue - Rows of a subsite's queue, newest first.
///
/// Shows pending rows unless `status` names another one; `all` lists everything.
pub async fn list_queue(
    State(state): State<AppState>,
    Path(site_id): Path<i64>,
    Query(query): Query<QueueListQuery>,
) -> ApiResult<Vec<SubsiteQueueEntry>> {
    let status = match query.status.as_deref() {
        None | Some("") => Some(QueueStatus::Pending),
        Some("all") => None,
        Some(raw) => match QueueStatus::from_str(raw) {
            Some(status) => Some(status),
            None => return error(AppError::Validation(format!("Unknown status: {}", raw))),
        },
    };
    respond(state.review.list(site_id, status).await)
}

/// POST /api/sites/:site_id/queue/:row_id/approve - Apply a pending row.
pub async fn approve_row(
    State(state): State<AppState>,
    Path((site_id, row_id)): Path<(i64, i64)>,
    Json(request): Json<ApproveRequest>,
) -> ApiResult<ReviewOutcome> {
    respond(state.review.approve(site_id, row_id, request.reviewer_id).await)
}

/// POST /api/sites/:site_id/queue/:row_id/reject - Reject a pending row.
pub async fn reject_row(
    State(state): State<AppState>,
    Path((site_id, row_id)): Path<(i64, i64)>,
    Json(request): Json<RejectRequest>,
) -> ApiResult<ReviewOutcome> {
    respond(
        state
            .review
            .reject(site_id, row_id, request.reviewer_id, &request.reason)
            .await,
    )
}

/// GET /api/sites/:site_id/queue/:row_id/preview - Diff a row against the local object.
pub async fn preview_row(
    State(state): State<AppState>,
    Path((site_id, row_id)): Path<(i64, i64)>,
) -> ApiResult<PreviewResult> {
    respond(state.review.preview(site_id, row_id).await)
}
