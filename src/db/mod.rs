//! Database module for SQLite persistence.
//!
//! SQLite is the source of truth for the network: registry, queues, content store,
//! sync log and media jobs. Per-subsite queue tables are created at site registration.

mod content;
mod logs;
mod media_jobs;
mod queue;
mod repository;

pub use content::*;
pub use logs::*;
pub use media_jobs::*;
pub use queue::*;
pub use repository::*;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::SqliteConnection;
use std::path::Path;
use std::str::FromStr;

/// Initialize the database connection pool and run migrations.
pub async fn init_database(db_path: &Path) -> Result<SqlitePool, sqlx::Error> {
    // Ensure the parent directory exists
    if let Some(parent) = db_path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }

    let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

    let options = SqliteConnectOptions::from_str(&db_url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .busy_timeout(std::time::Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;

    Ok(pool)
}

/// Name of the queue table that belongs to one subsite.
pub fn subsite_queue_table(site_id: i64) -> String {
    format!("site_{}_subsite_queue", site_id)
}

/// Create a subsite's queue table and its indexes if they don't exist.
pub async fn ensure_subsite_queue_table(
    conn: &mut SqliteConnection,
    site_id: i64,
) -> Result<(), sqlx::Error> {
    let table = subsite_queue_table(site_id);

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            central_entry_id INTEGER NOT NULL,
            central_content_id INTEGER NOT NULL,
            content_type TEXT NOT NULL,
            local_content_id INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            sync_kind TEXT NOT NULL,
            approved_by INTEGER,
            reject_reason TEXT,
            created_at TEXT NOT NULL,
            modified_at TEXT NOT NULL
        );
        "#
    ))
    .execute(&mut *conn)
    .await?;

    // The partial unique index keeps at most one pending row per central content id
    sqlx::query(&format!(
        r#"
        CREATE INDEX IF NOT EXISTS idx_{table}_content_status ON {table}(central_content_id, status);
        CREATE INDEX IF NOT EXISTS idx_{table}_entry ON {table}(central_entry_id);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_{table}_one_pending ON {table}(central_content_id) WHERE status = 'pending';
        "#
    ))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Run database migrations.
async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    // Network registry
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sites (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            admin_email TEXT,
            api_key TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS site_policies (
            site_id INTEGER PRIMARY KEY REFERENCES sites(id),
            approval_required INTEGER NOT NULL DEFAULT 0,
            delete_on_subsite INTEGER NOT NULL DEFAULT 0,
            sync_media INTEGER NOT NULL DEFAULT 1,
            sync_post_meta INTEGER NOT NULL DEFAULT 1,
            sync_users INTEGER NOT NULL DEFAULT 1,
            taxonomies TEXT,
            post_types TEXT NOT NULL DEFAULT '["post","page"]',
            content_queue_enabled INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            login TEXT NOT NULL UNIQUE,
            email TEXT NOT NULL,
            display_name TEXT
        );

        CREATE TABLE IF NOT EXISTS site_users (
            site_id INTEGER NOT NULL,
            user_id INTEGER NOT NULL,
            PRIMARY KEY (site_id, user_id)
        );
        "#,
    )
    .execute(pool)
    .await?;

    // Content store
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS content_objects (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            site_id INTEGER NOT NULL,
            content_type TEXT NOT NULL,
            title TEXT NOT NULL,
            slug TEXT NOT NULL,
            body TEXT NOT NULL,
            body_filtered TEXT NOT NULL,
            status TEXT NOT NULL,
            author_id INTEGER,
            created_at TEXT NOT NULL,
            modified_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS content_meta (
            content_id INTEGER NOT NULL REFERENCES content_objects(id) ON DELETE CASCADE,
            meta_key TEXT NOT NULL,
            meta_value TEXT NOT NULL,
            field_kind TEXT,
            PRIMARY KEY (content_id, meta_key)
        );

        CREATE TABLE IF NOT EXISTS terms (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            site_id INTEGER NOT NULL,
            taxonomy TEXT NOT NULL,
            name TEXT NOT NULL,
            slug TEXT NOT NULL,
            UNIQUE (site_id, taxonomy, slug)
        );

        CREATE TABLE IF NOT EXISTS content_terms (
            content_id INTEGER NOT NULL REFERENCES content_objects(id) ON DELETE CASCADE,
            term_id INTEGER NOT NULL REFERENCES terms(id),
            PRIMARY KEY (content_id, term_id)
        );

        CREATE TABLE IF NOT EXISTS attachments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            site_id INTEGER NOT NULL,
            file_path TEXT NOT NULL,
            url TEXT NOT NULL,
            author_id INTEGER,
            parent_id INTEGER,
            central_attachment_id INTEGER,
            created_at TEXT NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    // Replication state
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS central_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            content_id INTEGER NOT NULL,
            content_type TEXT NOT NULL,
            target_sites TEXT NOT NULL,
            site_status TEXT NOT NULL,
            sync_kind TEXT NOT NULL,
            snapshot TEXT NOT NULL,
            compare_snapshot TEXT NOT NULL,
            author_id INTEGER,
            created_at TEXT NOT NULL,
            modified_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sync_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            content_id INTEGER NOT NULL,
            content_name TEXT NOT NULL,
            site_outcomes TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS synced_subsite_data (
            central_content_id INTEGER NOT NULL,
            site_id INTEGER NOT NULL,
            outcome TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (central_content_id, site_id)
        );

        CREATE TABLE IF NOT EXISTS bulk_sync_targets (
            content_id INTEGER NOT NULL,
            site_id INTEGER NOT NULL,
            subsite_row_id INTEGER NOT NULL,
            PRIMARY KEY (content_id, site_id)
        );

        CREATE TABLE IF NOT EXISTS media_jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            site_id INTEGER NOT NULL,
            subsite_content_id INTEGER NOT NULL,
            media_set_hash TEXT NOT NULL,
            media_set TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS notification_outbox (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            recipients TEXT NOT NULL,
            subject TEXT NOT NULL,
            body TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes for common queries
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_content_site_type ON content_objects(site_id, content_type);
        CREATE INDEX IF NOT EXISTS idx_content_meta_key_value ON content_meta(meta_key, meta_value);
        CREATE INDEX IF NOT EXISTS idx_attachments_site_url ON attachments(site_id, url);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_attachments_central_ref
            ON attachments(site_id, central_attachment_id) WHERE central_attachment_id IS NOT NULL;
        CREATE INDEX IF NOT EXISTS idx_central_queue_content ON central_queue(content_id, sync_kind);
        CREATE INDEX IF NOT EXISTS idx_sync_logs_content ON sync_logs(content_id);
        CREATE INDEX IF NOT EXISTS idx_media_jobs_status ON media_jobs(status, id);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_media_jobs_pending
            ON media_jobs(site_id, subsite_content_id, media_set_hash) WHERE status = 'pending';
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
