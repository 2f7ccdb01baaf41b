//! Replication transport between central and subsites.
//!
//! Every call carries the receiving site's shared secret and a bounded timeout.
//! Push failures come back as `failed` outcomes, never as errors; nothing retries.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::auth::API_KEY_HEADER;
use crate::config::Config;
use crate::db::Repository;
use crate::errors::{AppError, ErrorDetails};
use crate::models::{LifecycleAction, LifecycleRequest, PushOutcome, ReportOutcomeRequest, SyncPayload};

pub const PUSH_FAILED_MESSAGE: &str = "Error syncing to subsite.";

#[async_trait]
pub trait SubsiteTransport: Send + Sync {
    /// Deliver a payload to a subsite's `sync-post` endpoint.
    async fn push(&self, site_id: i64, payload: &SyncPayload) -> PushOutcome;

    /// Trash, restore or delete a replicated object on a subsite.
    async fn lifecycle(
        &self,
        site_id: i64,
        action: LifecycleAction,
        request: &LifecycleRequest,
    ) -> PushOutcome;

    /// Report an outcome back to the central site.
    async fn report_outcome(
        &self,
        central_site_id: i64,
        report: &ReportOutcomeRequest,
    ) -> Result<(), AppError>;
}

/// REST transport over `reqwest`.
pub struct HttpTransport {
    client: reqwest::Client,
    repo: Arc<Repository>,
    config: Arc<Config>,
}

/// Either envelope the ingress endpoints answer with.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    data: Option<T>,
    error: Option<ErrorDetails>,
}

impl HttpTransport {
    pub fn new(repo: Arc<Repository>, config: Arc<Config>) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(config.push_timeout)
            .build()?;
        Ok(Self {
            client,
            repo,
            config,
        })
    }

    async fn post<B, T>(&self, site_id: i64, endpoint: &str, body: &B) -> Result<T, String>
    where
        B: serde::Serialize + Sync,
        T: DeserializeOwned,
    {
        let key = match self.repo.get_site_key(site_id).await {
            Ok(Some(key)) => key,
            Ok(None) => return Err(format!("Site {} is not registered", site_id)),
            Err(e) => return Err(e.to_string()),
        };

        let url = format!("{}/{}", self.config.rest_url(site_id), endpoint);
        let response = self
            .client
            .post(&url)
            .header(API_KEY_HEADER, key)
            .json(body)
            .send()
            .await
            .map_err(|e| format!("Request to {} failed: {}", url, e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| format!("Reading response from {} failed: {}", url, e))?;

        if !status.is_success() {
            let detail = serde_json::from_str::<Envelope<serde_json::Value>>(&text)
                .ok()
                .and_then(|env| env.error)
                .map(|err| format!("{}: {}", err.code, err.message))
                .unwrap_or(text);
            return Err(format!("HTTP {} from {}: {}", status.as_u16(), url, detail));
        }

        let envelope: Envelope<T> = serde_json::from_str(&text)
            .map_err(|e| format!("Malformed response from {}: {}", url, e))?;
        match (envelope.success, envelope.data) {
            (true, Some(data)) => Ok(data),
            _ => Err(format!("Unexpected response from {}", url)),
        }
    }
}

#[async_trait]
impl SubsiteTransport for HttpTransport {
    async fn push(&self, site_id: i64, payload: &SyncPayload) -> PushOutcome {
        match self.post::<_, PushOutcome>(site_id, "sync-post", payload).await {
            Ok(outcome) => outcome,
            Err(detail) => {
                tracing::warn!(
                    "Push of content {} to site {} failed: {}",
                    payload.central_content_id,
                    site_id,
                    detail
                );
                PushOutcome::failed(site_id, PUSH_FAILED_MESSAGE, detail)
            }
        }
    }

    async fn lifecycle(
        &self,
        site_id: i64,
        action: LifecycleAction,
        request: &LifecycleRequest,
    ) -> PushOutcome {
        match self
            .post::<_, PushOutcome>(site_id, action.endpoint(), request)
            .await
        {
            Ok(outcome) => outcome,
            Err(detail) => {
                tracing::warn!("{} on site {} failed: {}", action.endpoint(), site_id, detail);
                PushOutcome::failed(site_id, PUSH_FAILED_MESSAGE, detail)
            }
        }
    }

    async fn report_outcome(
        &self,
        central_site_id: i64,
        report: &ReportOutcomeRequest,
    ) -> Result<(), AppError> {
        self.post::<_, serde_json::Value>(central_site_id, "update-synced-data", report)
            .await
            .map(|_| ())
            .map_err(AppError::Transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OutcomeStatus;

    #[tokio::test]
    async fn lifecycle_to_unregistered_site_fails_with_detail() {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = crate::db::init_database(&dir.path().join("transport.sqlite"))
            .await
            .unwrap();
        let repo = Arc::new(Repository::new(pool));
        let config = Arc::new(Config::from_env().unwrap());
        let transport = HttpTransport::new(repo, config).unwrap();

        let request = LifecycleRequest {
            subsite_post_id: Some(3),
            delete_on_subsite: true,
        };
        let outcome = transport.lifecycle(9, LifecycleAction::Trash, &request).await;

        assert!(!outcome.success);
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert_eq!(outcome.message, PUSH_FAILED_MESSAGE);
        assert_eq!(outcome.debug_message.as_deref(), Some("Site 9 is not registered"));
    }
}
