//! Central Content Manager backend
//!
//! Replicates content from a central site to subsites over REST, with per-site
//! approval queues, bulk fan-out and deferred media reconciliation.

mod api;
mod auth;
mod config;
mod db;
mod errors;
mod models;
mod notify;
mod snapshot;
mod sync;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::{Config, LogFormat};
use db::Repository;
use notify::{Notifier, OutboxNotifier};
use sync::{
    ApplyEngine, BulkSync, CentralSync, HttpTransport, MediaQueue, ReviewWorkflow,
    SubsiteTransport,
};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<Repository>,
    pub config: Arc<Config>,
    pub central: Arc<CentralSync>,
    pub apply: Arc<ApplyEngine>,
    pub review: Arc<ReviewWorkflow>,
    pub bulk: Arc<BulkSync>,
}

impl AppState {
    /// Wire the replication services together.
    pub fn new(
        repo: Arc<Repository>,
        config: Arc<Config>,
        transport: Arc<dyn SubsiteTransport>,
        notifier: Arc<dyn Notifier>,
        media: MediaQueue,
    ) -> Self {
        let central = Arc::new(CentralSync::new(
            repo.clone(),
            config.clone(),
            transport.clone(),
        ));
        let apply = Arc::new(ApplyEngine::new(repo.clone(), config.clone(), media));
        let review = Arc::new(ReviewWorkflow::new(
            repo.clone(),
            config.clone(),
            apply.clone(),
            transport,
            notifier,
        ));
        let bulk = Arc::new(BulkSync::new(repo.clone(), config.clone(), central.clone()));

        Self {
            repo,
            config,
            central,
            apply,
            review,
            bulk,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize logging
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let json_logs = config.log_format == LogFormat::Json;
    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json_logs).then(|| tracing_subscriber::fmt::layer()))
        .init();

    tracing::info!("Starting Central Content Manager backend");
    tracing::info!("Database path: {:?}", config.db_path);
    tracing::info!("Uploads root: {:?}", config.uploads_root);
    tracing::info!("Bind address: {}", config.bind_addr);
    tracing::info!("Central site: {}", config.central_site_id);

    // Warn if PSK is not configured
    if config.api_psk.is_none() {
        tracing::warn!("No API PSK configured (CCM_API_PSK). Admin authentication is disabled!");
    }

    // Initialize database
    let pool = db::init_database(&config.db_path).await?;
    let repo = Arc::new(Repository::new(pool));
    let config = Arc::new(config);

    let transport: Arc<dyn SubsiteTransport> =
        Arc::new(HttpTransport::new(repo.clone(), config.clone())?);
    let notifier: Arc<dyn Notifier> = Arc::new(OutboxNotifier::new(repo.clone()));

    // Media reconciliation runs in the background for the life of the process
    let media = MediaQueue::new(repo.clone());
    media.worker(config.clone()).spawn();

    let state = AppState::new(repo, config.clone(), transport, notifier, media);

    // Build router
    let app = create_router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Create the application router with all routes.
pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Clone PSK for the auth layer
    let psk = state.config.api_psk.clone();

    // Admin routes
    let api_routes = Router::new()
        // Registry
        .route("/sites", get(api::list_sites).post(api::register_site))
        .route("/sites/{site_id}/policy", get(api::get_policy).put(api::update_policy))
        .route("/users", post(api::create_user))
        .route(
            "/sites/{site_id}/attachments",
            get(api::list_attachments).post(api::register_attachment),
        )
        .route("/sites/{site_id}/media-jobs", get(api::list_media_jobs))
        // Content
        .route("/sites/{site_id}/content", get(api::list_site_content))
        .route("/sites/{site_id}/content/{id}", get(api::get_site_content))
        .route("/content", post(api::create_content))
        .route("/content/{id}", put(api::update_content).delete(api::delete_content))
        .route("/content/{id}/sync", post(api::sync_content))
        .route("/content/{id}/trash", post(api::trash_content))
        .route("/content/{id}/untrash", post(api::untrash_content))
        .route("/content/{id}/synced", get(api::synced_status))
        .route("/queue", get(api::list_central_queue))
        .route("/bulk-sync", post(api::bulk_sync))
        // Review
        .route("/sites/{site_id}/queue", get(api::list_queue))
        .route("/sites/{site_id}/queue/{row_id}/approve", post(api::approve_row))
        .route("/sites/{site_id}/queue/{row_id}/reject", post(api::reject_row))
        .route("/sites/{site_id}/queue/{row_id}/preview", get(api::preview_row))
        // Logs
        .route("/logs", get(api::list_logs))
        .route("/notifications", get(api::list_notifications))
        // Apply PSK auth middleware
        .layer(middleware::from_fn(move |req, next| {
            auth::psk_auth_layer(psk.clone(), req, next)
        }));

    // Replication endpoints, checked against the receiving site's key
    let ingress_routes = Router::new()
        .route("/sites/{site_id}/ccm/v1/sync-post", post(api::sync_post))
        .route("/sites/{site_id}/ccm/v1/trash-post", post(api::trash_post))
        .route("/sites/{site_id}/ccm/v1/untrash-post", post(api::untrash_post))
        .route("/sites/{site_id}/ccm/v1/delete-post", post(api::delete_post))
        .route(
            "/sites/{site_id}/ccm/v1/update-synced-data",
            post(api::update_synced_data),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::site_key_auth,
        ));

    // Health check (no auth required)
    let health_routes = Router::new().route("/health", get(health_check));

    Router::new()
        .nest("/api", api_routes)
        .merge(ingress_routes)
        .merge(health_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

/// Health check endpoint.
async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests;
