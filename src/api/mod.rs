//! REST API module.
//!
//! Admin routes live under `/api`; replication endpoints live under each site's
//! `/sites/{site_id}/ccm/v1` root.

mod bulk;
mod content;
mod ingress;
mod logs;
mod review;
mod sites;

pub use bulk::*;
pub use content::*;
pub use ingress::*;
pub use logs::*;
pub use review::*;
pub use sites::*;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Success response envelope.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn new(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

/// Response type that can be either success or error.
pub type ApiResult<T> = Result<ApiResponse<T>, crate::errors::AppError>;

/// Create a successful API response.
pub fn success<T: Serialize>(data: T) -> ApiResult<T> {
    Ok(ApiResponse::new(data))
}

/// Create an error API response.
pub fn error<T: Serialize>(err: crate::errors::AppError) -> ApiResult<T> {
    Err(err)
}

/// Wrap a service result in the envelope.
pub fn respond<T: Serialize>(result: Result<T, crate::errors::AppError>) -> ApiResult<T> {
    match result {
        Ok(data) => success(data),
        Err(e) => error(e),
    }
}
