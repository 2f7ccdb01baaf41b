//! Bulk sync endpoint.

use axum::{extract::State, Json};

use super::{respond, ApiResult};
use crate::models::{BulkBatchReport, BulkSyncRequest};
use crate::AppState;

/// POST /api/bulk-sync - Process one batch of a bulk sync.
///
/// Clients call this with increasing `batchIndex` until `done` is true.
pub async fn bulk_sync(
    State(state): State<AppState>,
    Json(request): Json<BulkSyncRequest>,
) -> ApiResult<BulkBatchReport> {
    respond(state.bulk.run_batch(&request).await)
}
