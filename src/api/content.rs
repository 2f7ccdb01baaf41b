//! Content endpoints: central editor saves, lifecycle changes and read views.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;

use super::{error, respond, ApiResult};
use crate::errors::AppError;
use crate::models::{
    CentralQueueEntry, ContentDetail, ContentObject, SaveContentRequest, SnapshotMode, SyncKind,
    SyncReport, SyncedSubsiteData,
};
use crate::sync::SaveResult;
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentListQuery {
    pub content_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CentralQueueQuery {
    pub content_id: Option<i64>,
}

/// Body of a manual sync; falls back to the object's selected sites.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualSyncRequest {
    #[serde(default)]
    pub target_sites: Option<Vec<i64>>,
}

/// POST /api/content - Create central content and replicate it.
pub async fn create_content(
    State(state): State<AppState>,
    Json(request): Json<SaveContentRequest>,
) -> ApiResult<SaveResult> {
    respond(state.central.save(None, &request).await)
}

/// PUT /api/content/:id - Update central content and replicate it.
pub async fn update_content(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<SaveContentRequest>,
) -> ApiResult<SaveResult> {
    respond(state.central.save(Some(id), &request).await)
}

/// POST /api/content/:id/sync - Replicate central content on demand.
pub async fn sync_content(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<ManualSyncRequest>,
) -> ApiResult<SyncReport> {
    let central = state.config.central_site_id;
    let content = match state.repo.get_content(id).await {
        Ok(Some(content)) if content.site_id == central => content,
        Ok(_) => return error(AppError::NotFound(format!("Central content {} not found", id))),
        Err(e) => return error(e),
    };

    let targets = match request.target_sites {
        Some(targets) => targets,
        None => match state.repo.content_detail(central, id).await {
            Ok(detail) => detail
                .meta
                .iter()
                .find(|m| m.key == crate::models::SELECTED_SITES_META)
                .and_then(|m| serde_json::from_value(m.value.clone()).ok())
                .unwrap_or_default(),
            Err(e) => return error(e),
        },
    };
    if targets.is_empty() {
        return error(AppError::Validation(
            "Please select at least one site to sync.".to_string(),
        ));
    }

    respond(
        state
            .central
            .sync_content(&content, &targets, SyncKind::Update, SnapshotMode::Single)
            .await,
    )
}

/// POST /api/content/:id/trash - Trash central content.
pub async fn trash_content(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<SyncReport> {
    respond(state.central.trash(id).await)
}

/// POST /api/content/:id/untrash - Restore trashed central content.
pub async fn untrash_content(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<SyncReport> {
    respond(state.central.untrash(id).await)
}

/// DELETE /api/content/:id - Permanently delete central content.
pub async fn delete_content(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<SyncReport> {
    respond(state.central.delete(id).await)
}

/// GET /api/content/:id/synced - Latest outcome per subsite.
pub async fn synced_status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Vec<SyncedSubsiteData>> {
    respond(state.repo.synced_data(id).await)
}

/// GET /api/queue - Central queue entries.
pub async fn list_central_queue(
    State(state): State<AppState>,
    Query(query): Query<CentralQueueQuery>,
) -> ApiResult<Vec<CentralQueueEntry>> {
    respond(state.repo.list_central_entries(query.content_id).await)
}

/// GET /api/sites/:site_id/content - Content objects of a site.
pub async fn list_site_content(
    State(state): State<AppState>,
    Path(site_id): Path<i64>,
    Query(query): Query<ContentListQuery>,
) -> ApiResult<Vec<ContentObject>> {
    respond(
        state
            .repo
            .list_content(site_id, query.content_type.as_deref())
            .await,
    )
}

/// GET /api/sites/:site_id/content/:id - One object with meta, terms and featured image.
pub async fn get_site_content(
    State(state): State<AppState>,
    Path((site_id, id)): Path<(i64, i64)>,
) -> ApiResult<ContentDetail> {
    respond(state.repo.content_detail(site_id, id).await)
}
