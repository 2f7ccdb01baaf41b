//! Content store models: objects, meta, terms, users and attachments.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{FieldKind, TermInput};

/// Statuses that never trigger replication on save.
pub const UNSYNCABLE_STATUSES: &[&str] = &["auto-draft", "pending", "private", "trash"];

pub const STATUS_TRASH: &str = "trash";

/// Status an object had before it was trashed.
pub const TRASH_STATUS_META: &str = "_trash_meta_status";

/// Marker meta linking a subsite object to its central origin.
pub const CENTRAL_POST_MARKER: &str = "_central_post_id";
pub const THUMBNAIL_META: &str = "_thumbnail_id";
/// SEO primary category, a site-local term id.
pub const PRIMARY_CATEGORY_META: &str = "_yoast_wpseo_primary_category";
/// Portable form of [`PRIMARY_CATEGORY_META`]: the category slug.
pub const PRIMARY_CATEGORY_SLUG_META: &str = "_yoast_wpseo_primary_category_slug";
pub const DISABLE_SYNC_META: &str = "_ccm_disable_sync";
pub const SELECTED_SITES_META: &str = "_ccm_selected_subsites";

/// A content object on any site.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentObject {
    pub id: i64,
    pub site_id: i64,
    pub content_type: String,
    pub title: String,
    pub slug: String,
    pub body: String,
    pub body_filtered: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_id: Option<i64>,
    pub created_at: String,
    pub modified_at: String,
}

/// One meta entry. Relational fields carry their kind and local ids as JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetaEntry {
    pub key: String,
    pub value: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field_kind: Option<FieldKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Term {
    pub id: i64,
    pub site_id: i64,
    pub taxonomy: String,
    pub name: String,
    pub slug: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub login: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserRequest {
    pub login: String,
    pub email: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Sites the user belongs to
    #[serde(default)]
    pub sites: Vec<i64>,
}

/// An uploaded file registered with a site.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: i64,
    pub site_id: i64,
    /// Path relative to the site's upload root
    pub file_path: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub central_attachment_id: Option<i64>,
    pub created_at: String,
}

/// Request body for registering a file already present in a site's upload root.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAttachmentRequest {
    pub file_path: String,
    #[serde(default)]
    pub author_id: Option<i64>,
}

/// A relational field as submitted by an editor: kind plus local id(s) or a link object.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationalInput {
    pub kind: FieldKind,
    pub value: serde_json::Value,
}

/// Request body for saving central content.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveContentRequest {
    #[serde(default = "default_content_type")]
    pub content_type: String,
    pub title: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub body: String,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub author_id: Option<i64>,
    #[serde(default)]
    pub terms: BTreeMap<String, Vec<TermInput>>,
    #[serde(default)]
    pub meta: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub relational: BTreeMap<String, RelationalInput>,
    #[serde(default)]
    pub featured_image_id: Option<i64>,
    /// Subsites this object replicates to
    #[serde(default)]
    pub target_sites: Option<Vec<i64>>,
    #[serde(default)]
    pub disable_sync: Option<bool>,
}

fn default_content_type() -> String {
    "post".to_string()
}

fn default_status() -> String {
    "publish".to_string()
}

/// Full view of a content object with its associations.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentDetail {
    pub content: ContentObject,
    pub meta: Vec<MetaEntry>,
    pub terms: BTreeMap<String, Vec<Term>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub featured_image: Option<Attachment>,
}

/// Normalize a title or name into a slug.
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut last_dash = true;
    for ch in input.chars().flat_map(char::to_lowercase) {
        if ch.is_alphanumeric() {
            slug.push(ch);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("Launch Day!  2024"), "launch-day-2024");
        assert_eq!(slugify("  --News--  "), "news");
    }
}
