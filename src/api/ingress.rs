//! Replication endpoints under `/sites/{site_id}/ccm/v1`.
//!
//! These sit behind the per-site key check. Subsites answer pushes and lifecycle
//! calls with a structured outcome; central accepts outcome reports.

use axum::{
    extract::{Path, State},
    Json,
};

use super::{error, respond, ApiResult};
use crate::errors::AppError;
use crate::models::{
    LifecycleAction, LifecycleRequest, PushOutcome, ReportOutcomeRequest, SyncPayload,
    SyncedSubsiteData,
};
use crate::AppState;

/// POST /sites/:site_id/ccm/v1/sync-post - Receive a push.
pub async fn sync_post(
    State(state): State<AppState>,
    Path(site_id): Path<i64>,
    Json(payload): Json<SyncPayload>,
) -> ApiResult<PushOutcome> {
    tracing::debug!(
        "Push of content {} (entry {:?}) to site {}",
        payload.central_content_id,
        payload.central_entry_id,
        site_id
    );
    respond(state.apply.receive(site_id, &payload).await)
}

/// POST /sites/:site_id/ccm/v1/trash-post - Trash a replica.
pub async fn trash_post(
    State(state): State<AppState>,
    Path(site_id): Path<i64>,
    Json(request): Json<LifecycleRequest>,
) -> ApiResult<PushOutcome> {
    lifecycle(state, site_id, LifecycleAction::Trash, request).await
}

/// POST /sites/:site_id/ccm/v1/untrash-post - Restore a trashed replica.
pub async fn untrash_post(
    State(state): State<AppState>,
    Path(site_id): Path<i64>,
    Json(request): Json<LifecycleRequest>,
) -> ApiResult<PushOutcome> {
    lifecycle(state, site_id, LifecycleAction::Untrash, request).await
}

/// POST /sites/:site_id/ccm/v1/delete-post - Permanently delete a replica.
pub async fn delete_post(
    State(state): State<AppState>,
    Path(site_id): Path<i64>,
    Json(request): Json<LifecycleRequest>,
) -> ApiResult<PushOutcome> {
    lifecycle(state, site_id, LifecycleAction::Delete, request).await
}

async fn lifecycle(
    state: AppState,
    site_id: i64,
    action: LifecycleAction,
    request: LifecycleRequest,
) -> ApiResult<PushOutcome> {
    if site_id == state.config.central_site_id {
        return error(AppError::Validation(format!(
            "The central site does not accept {}",
            action.endpoint()
        )));
    }
    respond(state.apply.lifecycle(site_id, action, &request).await)
}

/// POST /sites/:site_id/ccm/v1/update-synced-data - Record a subsite outcome on central.
pub async fn update_synced_data(
    State(state): State<AppState>,
    Path(site_id): Path<i64>,
    Json(report): Json<ReportOutcomeRequest>,
) -> ApiResult<SyncedSubsiteData> {
    if site_id != state.config.central_site_id {
        return error(AppError::NotFound(
            "Outcome reports are only accepted by the central site".to_string(),
        ));
    }
    if report.subsite_id != report.outcome.site_id {
        return error(AppError::Validation(
            "subsiteId does not match the reported outcome".to_string(),
        ));
    }

    match state
        .central
        .record_outcome(report.central_content_id, &report.outcome)
        .await
    {
        Ok(()) => respond(Ok(report.outcome)),
        Err(e) => error(e),
    }
}
