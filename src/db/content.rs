//! Content store: objects, meta, terms and attachments.
//!
//! Functions take a connection so callers can compose them inside one write
//! transaction.

use std::collections::BTreeMap;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use super::Repository;
use crate::errors::AppError;
use crate::models::{
    slugify, Attachment, ContentDetail, ContentObject, FieldKind, MetaEntry, SaveContentRequest,
    Term, CENTRAL_POST_MARKER, DISABLE_SYNC_META, SELECTED_SITES_META, THUMBNAIL_META,
};

static SCRIPT_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>").expect("valid regex"));
static HTML_COMMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").expect("valid regex"));

const CONTENT_COLUMNS: &str = "id, site_id, content_type, title, slug, body, body_filtered, status, author_id, created_at, modified_at";
const ATTACHMENT_COLUMNS: &str =
    "id, site_id, file_path, url, author_id, parent_id, central_attachment_id, created_at";

/// Editor-facing save filter. Replicated bodies bypass it.
pub fn filter_body(body: &str) -> String {
    SCRIPT_TAG.replace_all(body, "").into_owned()
}

/// Rendered form of a body with block delimiters stripped.
pub fn render_body(body: &str) -> String {
    HTML_COMMENT.replace_all(body, "").trim().to_string()
}

/// Fields written when creating or updating a content object.
#[derive(Debug, Clone)]
pub struct ContentFields {
    pub content_type: String,
    pub title: String,
    pub slug: String,
    pub body: String,
    pub body_filtered: String,
    pub status: String,
    pub author_id: Option<i64>,
}

// ==================== CONTENT OBJECTS ====================

pub async fn get_content(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<ContentObject>, AppError> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM content_objects WHERE id = ?",
        CONTENT_COLUMNS
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.as_ref().map(content_from_row))
}

/// Load an object and check it belongs to the given site.
pub async fn require_content(
    conn: &mut SqliteConnection,
    site_id: i64,
    id: i64,
) -> Result<ContentObject, AppError> {
    match get_content(conn, id).await? {
        Some(content) if content.site_id == site_id => Ok(content),
        _ => Err(AppError::NotFound(format!(
            "Content {} not found on site {}",
            id, site_id
        ))),
    }
}

pub async fn insert_content(
    conn: &mut SqliteConnection,
    site_id: i64,
    fields: &ContentFields,
) -> Result<i64, AppError> {
    let now = Utc::now().to_rfc3339();
    let id = sqlx::query(
        "INSERT INTO content_objects (site_id, content_type, title, slug, body, body_filtered, status, author_id, created_at, modified_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(site_id)
    .bind(&fields.content_type)
    .bind(&fields.title)
    .bind(&fields.slug)
    .bind(&fields.body)
    .bind(&fields.body_filtered)
    .bind(&fields.status)
    .bind(fields.author_id)
    .bind(&now)
    .bind(&now)
    .fetch_one(&mut *conn)
    .await?
    .get("id");
    Ok(id)
}

pub async fn update_content(
    conn: &mut SqliteConnection,
    id: i64,
    fields: &ContentFields,
) -> Result<(), AppError> {
    let result = sqlx::query(
        "UPDATE content_objects SET content_type = ?, title = ?, slug = ?, body = ?, body_filtered = ?, status = ?, author_id = COALESCE(?, author_id), modified_at = ? WHERE id = ?",
    )
    .bind(&fields.content_type)
    .bind(&fields.title)
    .bind(&fields.slug)
    .bind(&fields.body)
    .bind(&fields.body_filtered)
    .bind(&fields.status)
    .bind(fields.author_id)
    .bind(Utc::now().to_rfc3339())
    .bind(id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound(format!("Content {} not found", id)));
    }
    Ok(())
}

pub async fn set_content_status(
    conn: &mut SqliteConnection,
    id: i64,
    status: &str,
) -> Result<(), AppError> {
    sqlx::query("UPDATE content_objects SET status = ?, modified_at = ? WHERE id = ?")
        .bind(status)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Write a body verbatim, skipping the editor save filter.
pub async fn update_body_unfiltered(
    conn: &mut SqliteConnection,
    id: i64,
    body: &str,
) -> Result<(), AppError> {
    sqlx::query("UPDATE content_objects SET body = ?, body_filtered = ? WHERE id = ?")
        .bind(body)
        .bind(render_body(body))
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Permanently delete an object with its meta and term links.
pub async fn delete_content(conn: &mut SqliteConnection, id: i64) -> Result<bool, AppError> {
    sqlx::query("DELETE FROM content_meta WHERE content_id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM content_terms WHERE content_id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    let result = sqlx::query("DELETE FROM content_objects WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Find the local object replicated from a central object.
pub async fn find_by_central_marker(
    conn: &mut SqliteConnection,
    site_id: i64,
    central_content_id: i64,
) -> Result<Option<ContentObject>, AppError> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM content_objects c WHERE c.site_id = ? AND EXISTS (SELECT 1 FROM content_meta m WHERE m.content_id = c.id AND m.meta_key = ? AND m.meta_value = ?) ORDER BY c.id LIMIT 1",
        prefixed_content_columns("c")
    ))
    .bind(site_id)
    .bind(CENTRAL_POST_MARKER)
    .bind(central_content_id.to_string())
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.as_ref().map(content_from_row))
}

// ==================== META ====================

pub async fn list_meta(
    conn: &mut SqliteConnection,
    content_id: i64,
) -> Result<Vec<MetaEntry>, AppError> {
    let rows = sqlx::query(
        "SELECT meta_key, meta_value, field_kind FROM content_meta WHERE content_id = ? ORDER BY meta_key",
    )
    .bind(content_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter().map(meta_from_row).collect()
}

pub async fn get_meta(
    conn: &mut SqliteConnection,
    content_id: i64,
    key: &str,
) -> Result<Option<serde_json::Value>, AppError> {
    let row = sqlx::query("SELECT meta_value FROM content_meta WHERE content_id = ? AND meta_key = ?")
        .bind(content_id)
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?;

    match row {
        Some(row) => {
            let raw: String = row.get("meta_value");
            Ok(Some(decode_meta(&raw)))
        }
        None => Ok(None),
    }
}

pub async fn set_meta(
    conn: &mut SqliteConnection,
    content_id: i64,
    key: &str,
    value: &serde_json::Value,
    kind: Option<FieldKind>,
) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO content_meta (content_id, meta_key, meta_value, field_kind) VALUES (?, ?, ?, ?) ON CONFLICT(content_id, meta_key) DO UPDATE SET meta_value = excluded.meta_value, field_kind = excluded.field_kind",
    )
    .bind(content_id)
    .bind(key)
    .bind(encode_meta(value))
    .bind(kind.map(|k| k.as_str()))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn delete_meta(
    conn: &mut SqliteConnection,
    content_id: i64,
    key: &str,
) -> Result<(), AppError> {
    sqlx::query("DELETE FROM content_meta WHERE content_id = ? AND meta_key = ?")
        .bind(content_id)
        .bind(key)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Remove every meta entry except the given site-local keys.
pub async fn clear_meta_except(
    conn: &mut SqliteConnection,
    content_id: i64,
    keep: &[&str],
) -> Result<(), AppError> {
    for entry in list_meta(conn, content_id).await? {
        if !keep.contains(&entry.key.as_str()) {
            delete_meta(conn, content_id, &entry.key).await?;
        }
    }
    Ok(())
}

/// Scalar meta is stored as its string form, everything else as JSON.
fn encode_meta(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn decode_meta(raw: &str) -> serde_json::Value {
    if raw.starts_with('{') || raw.starts_with('[') {
        if let Ok(value) = serde_json::from_str(raw) {
            return value;
        }
    }
    if let Ok(n) = raw.parse::<i64>() {
        return serde_json::Value::from(n);
    }
    serde_json::Value::String(raw.to_string())
}

// ==================== TERMS ====================

pub async fn find_term(
    conn: &mut SqliteConnection,
    site_id: i64,
    taxonomy: &str,
    slug: &str,
) -> Result<Option<Term>, AppError> {
    let row = sqlx::query(
        "SELECT id, site_id, taxonomy, name, slug FROM terms WHERE site_id = ? AND taxonomy = ? AND slug = ?",
    )
    .bind(site_id)
    .bind(taxonomy)
    .bind(slug)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.as_ref().map(term_from_row))
}

pub async fn get_term(conn: &mut SqliteConnection, id: i64) -> Result<Option<Term>, AppError> {
    let row = sqlx::query("SELECT id, site_id, taxonomy, name, slug FROM terms WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.as_ref().map(term_from_row))
}

/// Find a term by `(slug, taxonomy)` or create it.
pub async fn ensure_term(
    conn: &mut SqliteConnection,
    site_id: i64,
    taxonomy: &str,
    name: &str,
    slug: &str,
) -> Result<Term, AppError> {
    sqlx::query(
        "INSERT INTO terms (site_id, taxonomy, name, slug) VALUES (?, ?, ?, ?) ON CONFLICT(site_id, taxonomy, slug) DO NOTHING",
    )
    .bind(site_id)
    .bind(taxonomy)
    .bind(name)
    .bind(slug)
    .execute(&mut *conn)
    .await?;

    find_term(conn, site_id, taxonomy, slug)
        .await?
        .ok_or_else(|| AppError::Internal(format!("Term {}/{} vanished", taxonomy, slug)))
}

/// Replace an object's terms for one taxonomy.
pub async fn set_content_terms(
    conn: &mut SqliteConnection,
    content_id: i64,
    taxonomy: &str,
    term_ids: &[i64],
) -> Result<(), AppError> {
    sqlx::query(
        "DELETE FROM content_terms WHERE content_id = ? AND term_id IN (SELECT id FROM terms WHERE taxonomy = ?)",
    )
    .bind(content_id)
    .bind(taxonomy)
    .execute(&mut *conn)
    .await?;

    for term_id in term_ids {
        sqlx::query("INSERT OR IGNORE INTO content_terms (content_id, term_id) VALUES (?, ?)")
            .bind(content_id)
            .bind(term_id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

pub async fn terms_for_content(
    conn: &mut SqliteConnection,
    content_id: i64,
) -> Result<BTreeMap<String, Vec<Term>>, AppError> {
    let rows = sqlx::query(
        "SELECT t.id, t.site_id, t.taxonomy, t.name, t.slug FROM terms t JOIN content_terms ct ON ct.term_id = t.id WHERE ct.content_id = ? ORDER BY t.taxonomy, t.name",
    )
    .bind(content_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut grouped: BTreeMap<String, Vec<Term>> = BTreeMap::new();
    for row in &rows {
        let term = term_from_row(row);
        grouped.entry(term.taxonomy.clone()).or_default().push(term);
    }
    Ok(grouped)
}

// ==================== ATTACHMENTS ====================

pub async fn get_attachment(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<Attachment>, AppError> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM attachments WHERE id = ?",
        ATTACHMENT_COLUMNS
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.as_ref().map(attachment_from_row))
}

pub async fn find_attachment_by_url(
    conn: &mut SqliteConnection,
    site_id: i64,
    url: &str,
) -> Result<Option<Attachment>, AppError> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM attachments WHERE site_id = ? AND url = ? ORDER BY id LIMIT 1",
        ATTACHMENT_COLUMNS
    ))
    .bind(site_id)
    .bind(url)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.as_ref().map(attachment_from_row))
}

/// Subsite attachment mapped to a central attachment, if one exists.
pub async fn find_attachment_by_central_id(
    conn: &mut SqliteConnection,
    site_id: i64,
    central_attachment_id: i64,
) -> Result<Option<Attachment>, AppError> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM attachments WHERE site_id = ? AND central_attachment_id = ?",
        ATTACHMENT_COLUMNS
    ))
    .bind(site_id)
    .bind(central_attachment_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.as_ref().map(attachment_from_row))
}

/// Attachment fields for an insert.
#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub site_id: i64,
    pub file_path: String,
    pub url: String,
    pub author_id: Option<i64>,
    pub parent_id: Option<i64>,
    pub central_attachment_id: Option<i64>,
}

pub async fn insert_attachment(
    conn: &mut SqliteConnection,
    new: &NewAttachment,
) -> Result<Attachment, AppError> {
    let row = sqlx::query(&format!(
        "INSERT INTO attachments (site_id, file_path, url, author_id, parent_id, central_attachment_id, created_at) VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING {}",
        ATTACHMENT_COLUMNS
    ))
    .bind(new.site_id)
    .bind(&new.file_path)
    .bind(&new.url)
    .bind(new.author_id)
    .bind(new.parent_id)
    .bind(new.central_attachment_id)
    .bind(Utc::now().to_rfc3339())
    .fetch_one(&mut *conn)
    .await?;
    Ok(attachment_from_row(&row))
}

/// Insert a cross-referenced attachment unless one already exists, then return the
/// row that holds the mapping. The unique index decides the winner of a race.
pub async fn insert_cross_referenced_attachment(
    conn: &mut SqliteConnection,
    new: &NewAttachment,
    central_attachment_id: i64,
) -> Result<Attachment, AppError> {
    sqlx::query(
        "INSERT INTO attachments (site_id, file_path, url, author_id, parent_id, central_attachment_id, created_at) VALUES (?, ?, ?, ?, ?, ?, ?) ON CONFLICT (site_id, central_attachment_id) WHERE central_attachment_id IS NOT NULL DO NOTHING",
    )
    .bind(new.site_id)
    .bind(&new.file_path)
    .bind(&new.url)
    .bind(new.author_id)
    .bind(new.parent_id)
    .bind(central_attachment_id)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *conn)
    .await?;

    find_attachment_by_central_id(conn, new.site_id, central_attachment_id)
        .await?
        .ok_or_else(|| {
            AppError::Internal(format!(
                "Attachment mapping for central attachment {} vanished",
                central_attachment_id
            ))
        })
}

// ==================== EDITOR SAVES ====================

/// Create or update an object from an editor request on its own site.
///
/// Runs the editor save filter. Relational inputs keep their local ids; target sites
/// and the disable flag are stored as site-local meta.
pub async fn save_content(
    conn: &mut SqliteConnection,
    site_id: i64,
    existing_id: Option<i64>,
    request: &SaveContentRequest,
) -> Result<ContentObject, AppError> {
    let body = filter_body(&request.body);
    let fields = ContentFields {
        content_type: request.content_type.clone(),
        title: request.title.clone(),
        slug: request
            .slug
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| slugify(&request.title)),
        body_filtered: render_body(&body),
        body,
        status: request.status.clone(),
        author_id: request.author_id,
    };

    let id = match existing_id {
        Some(id) => {
            require_content(conn, site_id, id).await?;
            update_content(conn, id, &fields).await?;
            id
        }
        None => insert_content(conn, site_id, &fields).await?,
    };

    for (taxonomy, inputs) in &request.terms {
        let mut ids = Vec::with_capacity(inputs.len());
        for input in inputs {
            let slug = input
                .slug
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| slugify(&input.name));
            ids.push(ensure_term(conn, site_id, taxonomy, &input.name, &slug).await?.id);
        }
        set_content_terms(conn, id, taxonomy, &ids).await?;
    }

    for (key, value) in &request.meta {
        set_meta(conn, id, key, value, None).await?;
    }
    for (key, input) in &request.relational {
        set_meta(conn, id, key, &input.value, Some(input.kind)).await?;
    }

    if let Some(thumbnail) = request.featured_image_id {
        match get_attachment(conn, thumbnail).await? {
            Some(attachment) if attachment.site_id == site_id => {
                set_meta(conn, id, THUMBNAIL_META, &thumbnail.into(), None).await?;
            }
            _ => {
                return Err(AppError::Validation(format!(
                    "Attachment {} does not belong to site {}",
                    thumbnail, site_id
                )))
            }
        }
    }

    if let Some(targets) = &request.target_sites {
        set_meta(conn, id, SELECTED_SITES_META, &serde_json::json!(targets), None).await?;
    }
    if let Some(disabled) = request.disable_sync {
        let flag = if disabled { "yes" } else { "no" };
        set_meta(conn, id, DISABLE_SYNC_META, &flag.into(), None).await?;
    }

    require_content(conn, site_id, id).await
}

/// Whether the editor switched replication off for this object.
pub async fn is_sync_disabled(conn: &mut SqliteConnection, id: i64) -> Result<bool, AppError> {
    Ok(matches!(
        get_meta(conn, id, DISABLE_SYNC_META).await?,
        Some(serde_json::Value::String(flag)) if flag == "yes"
    ))
}

/// Subsites selected for an object.
pub async fn selected_sites(conn: &mut SqliteConnection, id: i64) -> Result<Vec<i64>, AppError> {
    Ok(match get_meta(conn, id, SELECTED_SITES_META).await? {
        Some(value) => serde_json::from_value(value).unwrap_or_default(),
        None => Vec::new(),
    })
}

impl Repository {
    pub async fn get_content(&self, id: i64) -> Result<Option<ContentObject>, AppError> {
        let mut conn = self.pool().acquire().await?;
        get_content(&mut conn, id).await
    }

    pub async fn content_detail(
        &self,
        site_id: i64,
        id: i64,
    ) -> Result<ContentDetail, AppError> {
        let mut conn = self.pool().acquire().await?;
        let content = require_content(&mut conn, site_id, id).await?;
        let meta = list_meta(&mut conn, id).await?;
        let terms = terms_for_content(&mut conn, id).await?;
        let featured_image = match meta.iter().find(|m| m.key == THUMBNAIL_META) {
            Some(entry) => match entry.value.as_i64() {
                Some(att) => get_attachment(&mut conn, att).await?,
                None => None,
            },
            None => None,
        };

        Ok(ContentDetail {
            content,
            meta,
            terms,
            featured_image,
        })
    }

    pub async fn list_content(
        &self,
        site_id: i64,
        content_type: Option<&str>,
    ) -> Result<Vec<ContentObject>, AppError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM content_objects WHERE site_id = ? AND (? IS NULL OR content_type = ?) ORDER BY id",
            CONTENT_COLUMNS
        ))
        .bind(site_id)
        .bind(content_type)
        .bind(content_type)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.iter().map(content_from_row).collect())
    }

    pub async fn find_by_central_marker(
        &self,
        site_id: i64,
        central_content_id: i64,
    ) -> Result<Option<ContentObject>, AppError> {
        let mut conn = self.pool().acquire().await?;
        find_by_central_marker(&mut conn, site_id, central_content_id).await
    }

    /// Register a file that already sits in the site's upload root.
    pub async fn register_attachment(
        &self,
        site_id: i64,
        file_path: &str,
        url: &str,
        author_id: Option<i64>,
    ) -> Result<Attachment, AppError> {
        let mut conn = self.pool().acquire().await?;
        insert_attachment(
            &mut conn,
            &NewAttachment {
                site_id,
                file_path: file_path.to_string(),
                url: url.to_string(),
                author_id,
                parent_id: None,
                central_attachment_id: None,
            },
        )
        .await
    }

    pub async fn list_attachments(&self, site_id: i64) -> Result<Vec<Attachment>, AppError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM attachments WHERE site_id = ? ORDER BY id",
            ATTACHMENT_COLUMNS
        ))
        .bind(site_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.iter().map(attachment_from_row).collect())
    }
}

// ==================== ROW MAPPERS ====================

fn prefixed_content_columns(prefix: &str) -> String {
    CONTENT_COLUMNS
        .split(", ")
        .map(|c| format!("{}.{}", prefix, c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn content_from_row(row: &SqliteRow) -> ContentObject {
    ContentObject {
        id: row.get("id"),
        site_id: row.get("site_id"),
        content_type: row.get("content_type"),
        title: row.get("title"),
        slug: row.get("slug"),
        body: row.get("body"),
        body_filtered: row.get("body_filtered"),
        status: row.get("status"),
        author_id: row.get("author_id"),
        created_at: row.get("created_at"),
        modified_at: row.get("modified_at"),
    }
}

fn meta_from_row(row: &SqliteRow) -> Result<MetaEntry, AppError> {
    let raw: String = row.get("meta_value");
    let kind: Option<String> = row.get("field_kind");
    Ok(MetaEntry {
        key: row.get("meta_key"),
        value: decode_meta(&raw),
        field_kind: kind.as_deref().and_then(FieldKind::from_str),
    })
}

fn term_from_row(row: &SqliteRow) -> Term {
    Term {
        id: row.get("id"),
        site_id: row.get("site_id"),
        taxonomy: row.get("taxonomy"),
        name: row.get("name"),
        slug: row.get("slug"),
    }
}

pub(crate) fn attachment_from_row(row: &SqliteRow) -> Attachment {
    Attachment {
        id: row.get("id"),
        site_id: row.get("site_id"),
        file_path: row.get("file_path"),
        url: row.get("url"),
        author_id: row.get("author_id"),
        parent_id: row.get("parent_id"),
        central_attachment_id: row.get("central_attachment_id"),
        created_at: row.get("created_at"),
    }
}
