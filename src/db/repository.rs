//! Database repository for the network registry and shared helpers.
//!
//! Queue, content, log and media job operations live in sibling modules as further
//! `impl Repository` blocks.

use chrono::Utc;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};

use super::ensure_subsite_queue_table;
use crate::errors::AppError;
use crate::models::{
    CreateUserRequest, RegisterSiteRequest, RegisteredSite, Site, SyncPolicy, User,
};

/// Database repository for all data operations.
#[derive(Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Acquire a connection and open a write transaction on it.
    ///
    /// `BEGIN IMMEDIATE` takes the write lock up front, so read-then-write sections
    /// never fail to upgrade under concurrent writers.
    pub async fn begin_immediate(&self) -> Result<PoolConnection<Sqlite>, AppError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        Ok(conn)
    }

    /// Commit on success, roll back on error.
    pub async fn finish<T>(
        conn: &mut SqliteConnection,
        result: Result<T, AppError>,
    ) -> Result<T, AppError> {
        match result {
            Ok(value) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                    tracing::error!("Rollback failed: {}", rollback);
                }
                Err(e)
            }
        }
    }

    // ==================== SITE OPERATIONS ====================

    pub async fn list_sites(&self) -> Result<Vec<Site>, AppError> {
        let rows = sqlx::query("SELECT id, name, admin_email, created_at FROM sites ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(site_from_row).collect())
    }

    pub async fn get_site(&self, id: i64) -> Result<Option<Site>, AppError> {
        let row = sqlx::query("SELECT id, name, admin_email, created_at FROM sites WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(site_from_row))
    }

    pub async fn require_site(&self, id: i64) -> Result<Site, AppError> {
        self.get_site(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Site {} not found", id)))
    }

    /// Register a site, generate its key once, and create its queue table.
    pub async fn register_site(
        &self,
        request: &RegisterSiteRequest,
    ) -> Result<RegisteredSite, AppError> {
        let now = Utc::now().to_rfc3339();
        let api_key = uuid::Uuid::new_v4().simple().to_string();

        let mut conn = self.begin_immediate().await?;
        let result = async {
            if let Some(id) = request.id {
                let existing = sqlx::query("SELECT id FROM sites WHERE id = ?")
                    .bind(id)
                    .fetch_optional(&mut *conn)
                    .await?;
                if existing.is_some() {
                    return Err(AppError::Validation(format!(
                        "Site {} is already registered",
                        id
                    )));
                }
            }

            let id: i64 = sqlx::query(
                "INSERT INTO sites (id, name, admin_email, api_key, created_at) VALUES (?, ?, ?, ?, ?) RETURNING id",
            )
            .bind(request.id)
            .bind(&request.name)
            .bind(&request.admin_email)
            .bind(&api_key)
            .bind(&now)
            .fetch_one(&mut *conn)
            .await?
            .get("id");

            insert_policy(&mut conn, id, &SyncPolicy::default()).await?;
            ensure_subsite_queue_table(&mut conn, id).await?;
            Ok::<_, AppError>(id)
        }
        .await;
        let id = Self::finish(&mut conn, result).await?;

        tracing::info!("Registered site {} ({})", id, request.name);

        Ok(RegisteredSite {
            site: Site {
                id,
                name: request.name.clone(),
                admin_email: request.admin_email.clone(),
                created_at: now,
            },
            api_key,
        })
    }

    /// Stored secret for a site, used by the ingress auth layer and outbound pushes.
    pub async fn get_site_key(&self, site_id: i64) -> Result<Option<String>, AppError> {
        let row = sqlx::query("SELECT api_key FROM sites WHERE id = ?")
            .bind(site_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("api_key")))
    }

    // ==================== POLICY OPERATIONS ====================

    pub async fn get_policy(&self, site_id: i64) -> Result<SyncPolicy, AppError> {
        let row = sqlx::query(
            "SELECT approval_required, delete_on_subsite, sync_media, sync_post_meta, sync_users, taxonomies, post_types, content_queue_enabled FROM site_policies WHERE site_id = ?",
        )
        .bind(site_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => policy_from_row(&row),
            None => Err(AppError::NotFound(format!(
                "No sync policy for site {}",
                site_id
            ))),
        }
    }

    pub async fn save_policy(&self, site_id: i64, policy: &SyncPolicy) -> Result<(), AppError> {
        let taxonomies = policy
            .taxonomies
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let post_types = serde_json::to_string(&policy.post_types)?;

        let result = sqlx::query(
            "UPDATE site_policies SET approval_required = ?, delete_on_subsite = ?, sync_media = ?, sync_post_meta = ?, sync_users = ?, taxonomies = ?, post_types = ?, content_queue_enabled = ? WHERE site_id = ?",
        )
        .bind(policy.approval_required as i32)
        .bind(policy.delete_on_subsite as i32)
        .bind(policy.sync_media as i32)
        .bind(policy.sync_post_meta as i32)
        .bind(policy.sync_users as i32)
        .bind(&taxonomies)
        .bind(&post_types)
        .bind(policy.content_queue_enabled as i32)
        .bind(site_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Site {} not found", site_id)));
        }
        Ok(())
    }

    // ==================== USER OPERATIONS ====================

    pub async fn create_user(&self, request: &CreateUserRequest) -> Result<User, AppError> {
        let mut conn = self.begin_immediate().await?;
        let result = async {
            let id: i64 = sqlx::query(
                "INSERT INTO users (login, email, display_name) VALUES (?, ?, ?) RETURNING id",
            )
            .bind(&request.login)
            .bind(&request.email)
            .bind(&request.display_name)
            .fetch_one(&mut *conn)
            .await?
            .get("id");

            for site_id in &request.sites {
                add_user_to_site(&mut conn, *site_id, id).await?;
            }
            Ok::<_, AppError>(id)
        }
        .await;
        let id = Self::finish(&mut conn, result).await?;

        Ok(User {
            id,
            login: request.login.clone(),
            email: request.email.clone(),
            display_name: request.display_name.clone(),
        })
    }

    pub async fn get_user(&self, id: i64) -> Result<Option<User>, AppError> {
        let mut conn = self.pool.acquire().await?;
        get_user(&mut conn, id).await
    }
}

async fn insert_policy(
    conn: &mut SqliteConnection,
    site_id: i64,
    policy: &SyncPolicy,
) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO site_policies (site_id, approval_required, delete_on_subsite, sync_media, sync_post_meta, sync_users, taxonomies, post_types, content_queue_enabled) VALUES (?, ?, ?, ?, ?, ?, NULL, ?, ?)",
    )
    .bind(site_id)
    .bind(policy.approval_required as i32)
    .bind(policy.delete_on_subsite as i32)
    .bind(policy.sync_media as i32)
    .bind(policy.sync_post_meta as i32)
    .bind(policy.sync_users as i32)
    .bind(serde_json::to_string(&policy.post_types)?)
    .bind(policy.content_queue_enabled as i32)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn get_user(conn: &mut SqliteConnection, id: i64) -> Result<Option<User>, AppError> {
    let row = sqlx::query("SELECT id, login, email, display_name FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.as_ref().map(user_from_row))
}

/// Resolve a user by login first, then by email.
pub async fn find_user_by_login_or_email(
    conn: &mut SqliteConnection,
    login: &str,
    email: &str,
) -> Result<Option<User>, AppError> {
    let by_login = sqlx::query("SELECT id, login, email, display_name FROM users WHERE login = ?")
        .bind(login)
        .fetch_optional(&mut *conn)
        .await?;
    if let Some(row) = by_login {
        return Ok(Some(user_from_row(&row)));
    }

    let by_email = sqlx::query(
        "SELECT id, login, email, display_name FROM users WHERE email = ? ORDER BY id LIMIT 1",
    )
    .bind(email)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(by_email.as_ref().map(user_from_row))
}

pub async fn add_user_to_site(
    conn: &mut SqliteConnection,
    site_id: i64,
    user_id: i64,
) -> Result<(), AppError> {
    sqlx::query("INSERT OR IGNORE INTO site_users (site_id, user_id) VALUES (?, ?)")
        .bind(site_id)
        .bind(user_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// ==================== ROW MAPPERS ====================

fn site_from_row(row: &SqliteRow) -> Site {
    Site {
        id: row.get("id"),
        name: row.get("name"),
        admin_email: row.get("admin_email"),
        created_at: row.get("created_at"),
    }
}

pub(crate) fn user_from_row(row: &SqliteRow) -> User {
    User {
        id: row.get("id"),
        login: row.get("login"),
        email: row.get("email"),
        display_name: row.get("display_name"),
    }
}

fn policy_from_row(row: &SqliteRow) -> Result<SyncPolicy, AppError> {
    let taxonomies: Option<String> = row.get("taxonomies");
    let post_types: String = row.get("post_types");

    Ok(SyncPolicy {
        approval_required: row.get::<i32, _>("approval_required") != 0,
        delete_on_subsite: row.get::<i32, _>("delete_on_subsite") != 0,
        sync_media: row.get::<i32, _>("sync_media") != 0,
        sync_post_meta: row.get::<i32, _>("sync_post_meta") != 0,
        sync_users: row.get::<i32, _>("sync_users") != 0,
        taxonomies: taxonomies
            .map(|raw| serde_json::from_str(&raw))
            .transpose()?,
        post_types: serde_json::from_str(&post_types)?,
        content_queue_enabled: row.get::<i32, _>("content_queue_enabled") != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_database;
    use crate::models::UpdatePolicyRequest;
    use tempfile::TempDir;

    async fn repo() -> (Repository, TempDir) {
        let dir = TempDir::new().unwrap();
        let pool = init_database(&dir.path().join("repo.sqlite")).await.unwrap();
        (Repository::new(pool), dir)
    }

    #[tokio::test]
    async fn registration_generates_key_and_default_policy() {
        let (repo, _dir) = repo().await;
        let registered = repo
            .register_site(&RegisterSiteRequest {
                id: Some(5),
                name: "Five".into(),
                admin_email: None,
            })
            .await
            .unwrap();

        assert_eq!(registered.site.id, 5);
        assert_eq!(registered.api_key.len(), 32);
        assert_eq!(
            repo.get_site_key(5).await.unwrap().as_deref(),
            Some(registered.api_key.as_str())
        );
        assert_eq!(repo.get_policy(5).await.unwrap(), SyncPolicy::default());

        let dup = repo
            .register_site(&RegisterSiteRequest {
                id: Some(5),
                name: "Again".into(),
                admin_email: None,
            })
            .await;
        assert!(matches!(dup, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn policy_round_trips() {
        let (repo, _dir) = repo().await;
        repo.register_site(&RegisterSiteRequest {
            id: Some(7),
            name: "Seven".into(),
            admin_email: None,
        })
        .await
        .unwrap();

        let mut policy = repo.get_policy(7).await.unwrap();
        policy.merge(&UpdatePolicyRequest {
            approval_required: Some(true),
            taxonomies: Some(vec!["category".into()]),
            ..Default::default()
        });
        repo.save_policy(7, &policy).await.unwrap();

        assert_eq!(repo.get_policy(7).await.unwrap(), policy);
    }

    #[tokio::test]
    async fn users_resolve_by_login_then_email() {
        let (repo, _dir) = repo().await;
        let alice = repo
            .create_user(&CreateUserRequest {
                login: "alice".into(),
                email: "alice@example.test".into(),
                display_name: None,
                sites: vec![],
            })
            .await
            .unwrap();

        let mut conn = repo.pool().acquire().await.unwrap();
        let by_email = find_user_by_login_or_email(&mut conn, "alice-renamed", "alice@example.test")
            .await
            .unwrap();
        assert_eq!(by_email.map(|u| u.id), Some(alice.id));

        let missing = find_user_by_login_or_email(&mut conn, "bob", "bob@example.test")
            .await
            .unwrap();
        assert!(missing.is_none());
    }
}
