//! Site registry, policy, user and attachment endpoints.

use axum::{
    extract::{Path, State},
    Json,
};

use super::{error, respond, success, ApiResult};
use crate::db::MediaJob;
use crate::errors::AppError;
use crate::models::{
    Attachment, CreateUserRequest, RegisterAttachmentRequest, RegisterSiteRequest, RegisteredSite,
    Site, SyncPolicy, UpdatePolicyRequest, User,
};
use crate::AppState;

/// GET /api/sites - List registered sites.
pub async fn list_sites(State(state): State<AppState>) -> ApiResult<Vec<Site>> {
    respond(state.repo.list_sites().await)
}

/// POST /api/sites - Register a site and return its key.
pub async fn register_site(
    State(state): State<AppState>,
    Json(request): Json<RegisterSiteRequest>,
) -> ApiResult<RegisteredSite> {
    if request.name.trim().is_empty() {
        return error(AppError::Validation("Site name is required".to_string()));
    }
    if matches!(request.id, Some(id) if id <= 0) {
        return error(AppError::Validation("Site id must be positive".to_string()));
    }
    respond(state.repo.register_site(&request).await)
}

/// GET /api/sites/:site_id/policy - Read a site's sync policy.
pub async fn get_policy(
    State(state): State<AppState>,
    Path(site_id): Path<i64>,
) -> ApiResult<SyncPolicy> {
    respond(state.repo.get_policy(site_id).await)
}

/// PUT /api/sites/:site_id/policy - Partially update a site's sync policy.
pub async fn update_policy(
    State(state): State<AppState>,
    Path(site_id): Path<i64>,
    Json(request): Json<UpdatePolicyRequest>,
) -> ApiResult<SyncPolicy> {
    let mut policy = match state.repo.get_policy(site_id).await {
        Ok(policy) => policy,
        Err(e) => return error(e),
    };
    policy.merge(&request);
    if policy.post_types.is_empty() {
        return error(AppError::Validation(
            "At least one content type must be replicated".to_string(),
        ));
    }

    match state.repo.save_policy(site_id, &policy).await {
        Ok(()) => {
            tracing::info!("Updated sync policy of site {}", site_id);
            success(policy)
        }
        Err(e) => error(e),
    }
}

/// POST /api/users - Create a network user.
pub async fn create_user(
    State(state): State<AppState>,
    Json(request): Json<CreateUserRequest>,
) -> ApiResult<User> {
    if request.login.trim().is_empty() || request.email.trim().is_empty() {
        return error(AppError::Validation(
            "Login and email are required".to_string(),
        ));
    }
    respond(state.repo.create_user(&request).await)
}

/// POST /api/sites/:site_id/attachments - Register an uploaded file.
pub async fn register_attachment(
    State(state): State<AppState>,
    Path(site_id): Path<i64>,
    Json(request): Json<RegisterAttachmentRequest>,
) -> ApiResult<Attachment> {
    let file_path = request.file_path.trim_matches('/').to_string();
    if file_path.is_empty() || file_path.split('/').any(|seg| seg.is_empty() || seg == "..") {
        return error(AppError::Validation(format!(
            "Invalid file path: {}",
            request.file_path
        )));
    }
    if let Err(e) = state.repo.require_site(site_id).await {
        return error(e);
    }

    let on_disk = state.config.uploads_dir(site_id).join(&file_path);
    match tokio::fs::try_exists(&on_disk).await {
        Ok(true) => {}
        Ok(false) => {
            return error(AppError::Validation(format!(
                "File {} does not exist in the upload root of site {}",
                file_path, site_id
            )))
        }
        Err(e) => return error(e.into()),
    }

    let url = format!("{}/{}", state.config.uploads_url(site_id), file_path);
    respond(
        state
            .repo
            .register_attachment(site_id, &file_path, &url, request.author_id)
            .await,
    )
}

/// GET /api/sites/:site_id/attachments - List a site's attachments.
pub async fn list_attachments(
    State(state): State<AppState>,
    Path(site_id): Path<i64>,
) -> ApiResult<Vec<Attachment>> {
    respond(state.repo.list_attachments(site_id).await)
}

/// GET /api/sites/:site_id/media-jobs - Media reconciliation jobs of a site.
pub async fn list_media_jobs(
    State(state): State<AppState>,
    Path(site_id): Path<i64>,
) -> ApiResult<Vec<MediaJob>> {
    respond(state.repo.list_media_jobs(site_id).await)
}
