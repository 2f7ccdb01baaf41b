//! Content snapshot builder.
//!
//! Reads a content object with its terms, meta and media, and produces the portable
//! [`ContentSnapshot`] plus the human-readable [`CompareSnapshot`]. Nothing is written.

mod relational;

pub use relational::*;

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::SqliteConnection;

use crate::config::Config;
use crate::db::{
    find_attachment_by_url, get_attachment, get_term, get_user, list_meta, terms_for_content,
};
use crate::errors::AppError;
use crate::models::{
    CompareSnapshot, ContentObject, ContentSnapshot, MediaRef, PortableUser, SizeHint,
    SnapshotMode, Term, TermInput, CENTRAL_POST_MARKER, DISABLE_SYNC_META, PRIMARY_CATEGORY_META,
    PRIMARY_CATEGORY_SLUG_META, SELECTED_SITES_META, THUMBNAIL_META, TRASH_STATUS_META,
};

/// Site-local meta that never leaves its site.
pub const META_DENYLIST: &[&str] = &[
    "_edit_lock",
    "_edit_last",
    THUMBNAIL_META,
    SELECTED_SITES_META,
    DISABLE_SYNC_META,
    "_synced_subsite_data",
    "_pingme",
    "_encloseme",
    CENTRAL_POST_MARKER,
    TRASH_STATUS_META,
];

static IMG_SRC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)<img[^>]+src="([^">]+)""#).expect("valid regex"));
static SIZE_SUFFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)-(\d+)x(\d+)\.(jpg|png|jpeg|gif)$").expect("valid regex")
});

/// Build the snapshot pair for one object on its own site.
pub async fn build_snapshot(
    conn: &mut SqliteConnection,
    config: &Config,
    content: &ContentObject,
    mode: SnapshotMode,
) -> Result<(ContentSnapshot, CompareSnapshot), AppError> {
    let author = match content.author_id {
        Some(id) => get_user(conn, id).await?.map(|u| PortableUser {
            login: u.login,
            email: u.email,
        }),
        None => None,
    };

    let mut compare = CompareSnapshot::default();
    compare.push("title", "Title", content.title.clone());
    compare.push("post_name", "Post Name", content.slug.clone());
    compare.push("content", "Content", content.body.clone());
    compare.push("post_status", "Post Status", content.status.clone());

    let mut taxonomy_terms = BTreeMap::new();
    for (taxonomy, terms) in terms_for_content(conn, content.id).await? {
        let names: Vec<&str> = terms.iter().map(|t| t.name.as_str()).collect();
        compare.push(format!("taxonomy:{}", taxonomy), taxonomy.clone(), names.join(", "));
        taxonomy_terms.insert(
            taxonomy,
            terms
                .iter()
                .map(|t| TermInput {
                    name: t.name.clone(),
                    slug: Some(t.slug.clone()),
                })
                .collect(),
        );
    }

    let meta = list_meta(conn, content.id).await?;

    let mut featured_image = None;
    if let Some(thumbnail) = meta
        .iter()
        .find(|m| m.key == THUMBNAIL_META)
        .and_then(|m| m.value.as_i64())
    {
        if let Some(attachment) = get_attachment(conn, thumbnail).await? {
            compare.push("featured_image_url", "Featured Image URL", attachment.url.clone());
            featured_image = Some(MediaRef {
                url: attachment.url,
                central_attachment_id: attachment.id,
                source_path: attachment.file_path,
                size_hints: None,
                author: author.clone(),
            });
        }
    }

    let mut meta_fields = BTreeMap::new();
    let mut relational_fields = BTreeMap::new();
    for entry in &meta {
        if META_DENYLIST.contains(&entry.key.as_str()) {
            continue;
        }
        match entry.field_kind {
            Some(kind) => {
                let field = portable_field(conn, content.site_id, kind, &entry.value).await?;
                let text = resolver_for(kind).compare_text(&field.refs);
                compare.push(format!("meta:{}", entry.key), entry.key.clone(), text);
                relational_fields.insert(entry.key.clone(), field);
            }
            None => {
                // Field-key references are site-local
                if matches!(&entry.value, serde_json::Value::String(s) if s.contains("field_")) {
                    continue;
                }
                if entry.key == PRIMARY_CATEGORY_META {
                    if let Some(term) = primary_category(conn, content.site_id, &entry.value).await? {
                        compare.push(
                            format!("meta:{}", PRIMARY_CATEGORY_SLUG_META),
                            "Yoast Primary Category",
                            term.name,
                        );
                        meta_fields.insert(PRIMARY_CATEGORY_SLUG_META.to_string(), term.slug.into());
                        continue;
                    }
                }
                compare.push(
                    format!("meta:{}", entry.key),
                    entry.key.clone(),
                    flatten_value(&entry.value),
                );
                meta_fields.insert(entry.key.clone(), entry.value.clone());
            }
        }
    }

    let content_media =
        collect_content_media(conn, config, content.site_id, &content.body, &author).await?;

    let snapshot = ContentSnapshot {
        title: content.title.clone(),
        slug: content.slug.clone(),
        body: content.body.clone(),
        body_filtered: content.body_filtered.clone(),
        status: content.status.clone(),
        author,
        taxonomy_terms,
        meta_fields,
        relational_fields,
        featured_image,
        content_media,
        mode,
    };

    Ok((snapshot, compare))
}

/// Resolve every upload reference in a body to a known attachment.
async fn collect_content_media(
    conn: &mut SqliteConnection,
    config: &Config,
    site_id: i64,
    body: &str,
    author: &Option<PortableUser>,
) -> Result<Vec<MediaRef>, AppError> {
    let uploads_url = config.uploads_url(site_id);
    let mut media: Vec<MediaRef> = Vec::new();

    for url in media_urls(body, &uploads_url) {
        if media.iter().any(|m| m.url == url) {
            continue;
        }
        let Some(source_path) = relative_upload_path(&url, &uploads_url) else {
            continue;
        };

        let full_url = strip_size_suffix(&url);
        let attachment = match find_attachment_by_url(conn, site_id, &full_url).await? {
            Some(a) => Some(a),
            None => find_attachment_by_url(conn, site_id, &url).await?,
        };

        if let Some(attachment) = attachment {
            media.push(MediaRef {
                url: url.clone(),
                central_attachment_id: attachment.id,
                source_path,
                size_hints: size_hint(&url),
                author: author.clone(),
            });
        }
    }

    Ok(media)
}

/// `<img src>` URLs under the given upload root, without query strings.
pub fn media_urls(body: &str, uploads_url: &str) -> Vec<String> {
    let prefix = format!("{}/", uploads_url);
    IMG_SRC
        .captures_iter(body)
        .filter_map(|caps| caps.get(1))
        .map(|m| strip_query(m.as_str()).to_string())
        .filter(|url| url.starts_with(&prefix))
        .collect()
}

pub fn strip_query(url: &str) -> &str {
    url.split(['?', '#']).next().unwrap_or(url)
}

/// Path of an upload URL relative to its upload root.
pub fn relative_upload_path(url: &str, uploads_url: &str) -> Option<String> {
    strip_query(url)
        .strip_prefix(uploads_url)
        .and_then(|rest| rest.strip_prefix('/'))
        .filter(|rest| !rest.is_empty() && !rest.split('/').any(|seg| seg == ".."))
        .map(str::to_string)
}

pub fn size_hint(url: &str) -> Option<SizeHint> {
    let caps = SIZE_SUFFIX.captures(strip_query(url))?;
    Some(SizeHint {
        width: caps.get(1)?.as_str().parse().ok()?,
        height: caps.get(2)?.as_str().parse().ok()?,
    })
}

/// `photo-300x200.jpg` → `photo.jpg`
pub fn strip_size_suffix(url: &str) -> String {
    SIZE_SUFFIX.replace(url, ".$3").into_owned()
}

/// Render a meta value for diffing; lists are flattened and comma-joined.
pub fn flatten_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        serde_json::Value::Array(items) => items
            .iter()
            .map(flatten_value)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(", "),
        serde_json::Value::Object(map) => map
            .values()
            .map(flatten_value)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}

/// Category a primary-category meta value points at on its own site.
async fn primary_category(
    conn: &mut SqliteConnection,
    site_id: i64,
    raw: &serde_json::Value,
) -> Result<Option<Term>, AppError> {
    let id = match raw {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    let Some(id) = id.filter(|id| *id > 0) else {
        return Ok(None);
    };
    Ok(get_term(conn, id)
        .await?
        .filter(|term| term.site_id == site_id && term.taxonomy == "category"))
}
