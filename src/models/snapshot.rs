//! Portable content snapshot models.
//!
//! A snapshot carries no site-local ids except the central ids used as
//! cross-site natural keys.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Whether a snapshot was built for a single save or a bulk fan-out.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotMode {
    #[default]
    Single,
    Bulk,
}

/// User reference that survives the trip between sites.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortableUser {
    pub login: String,
    pub email: String,
}

/// Term reference resolved by `(slug, taxonomy)` on the receiving site.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortableTerm {
    pub name: String,
    pub slug: String,
    pub taxonomy: String,
}

/// A link field; the URL is rewritten from the central origin to the local one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortableLink {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub target: String,
}

/// Kind of a relational meta field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Taxonomy,
    User,
    Link,
    PostObject,
    Relationship,
    PageLink,
    File,
    Image,
    Gallery,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::Taxonomy => "taxonomy",
            FieldKind::User => "user",
            FieldKind::Link => "link",
            FieldKind::PostObject => "post_object",
            FieldKind::Relationship => "relationship",
            FieldKind::PageLink => "page_link",
            FieldKind::File => "file",
            FieldKind::Image => "image",
            FieldKind::Gallery => "gallery",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "taxonomy" => Some(FieldKind::Taxonomy),
            "user" => Some(FieldKind::User),
            "link" => Some(FieldKind::Link),
            "post_object" => Some(FieldKind::PostObject),
            "relationship" => Some(FieldKind::Relationship),
            "page_link" => Some(FieldKind::PageLink),
            "file" => Some(FieldKind::File),
            "image" => Some(FieldKind::Image),
            "gallery" => Some(FieldKind::Gallery),
            _ => None,
        }
    }

    /// Field kinds whose values point at attachments.
    pub fn is_attachment(&self) -> bool {
        matches!(self, FieldKind::File | FieldKind::Image | FieldKind::Gallery)
    }
}

/// One portable reference inside a relational field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "ref", rename_all = "snake_case")]
pub enum PortableRef {
    Term(PortableTerm),
    User(PortableUser),
    Link(PortableLink),
    #[serde(rename_all = "camelCase")]
    Post {
        central_id: i64,
        content_type: String,
        slug: String,
    },
    #[serde(rename_all = "camelCase")]
    Attachment { central_id: i64, url: String },
}

/// Relational meta field in portable form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelationalField {
    pub kind: FieldKind,
    /// Whether the source value was a list rather than a single reference
    pub multiple: bool,
    pub refs: Vec<PortableRef>,
}

/// Width/height hint parsed from a `-WxH.ext` upload suffix.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SizeHint {
    pub width: u32,
    pub height: u32,
}

/// A media reference keyed by its central attachment id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MediaRef {
    /// URL as it appears on the central site
    pub url: String,
    pub central_attachment_id: i64,
    /// Path of the referenced file relative to the central upload root
    pub source_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_hints: Option<SizeHint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<PortableUser>,
}

/// Term assignment input, used by snapshots and by content saves.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TermInput {
    pub name: String,
    #[serde(default)]
    pub slug: Option<String>,
}

/// Immutable portable copy of a content object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContentSnapshot {
    pub title: String,
    pub slug: String,
    pub body: String,
    pub body_filtered: String,
    pub status: String,
    #[serde(default)]
    pub author: Option<PortableUser>,
    #[serde(default)]
    pub taxonomy_terms: BTreeMap<String, Vec<TermInput>>,
    #[serde(default)]
    pub meta_fields: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub relational_fields: BTreeMap<String, RelationalField>,
    #[serde(default)]
    pub featured_image: Option<MediaRef>,
    #[serde(default)]
    pub content_media: Vec<MediaRef>,
    #[serde(default)]
    pub mode: SnapshotMode,
}

impl ContentSnapshot {
    /// Media that needs deferred reconciliation on the receiving site.
    pub fn media_set(&self, source_site_id: i64) -> MediaSet {
        MediaSet {
            source_site_id,
            featured_image: self.featured_image.clone(),
            content_media: self.content_media.clone(),
        }
    }
}

/// One human-readable field of a compare snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompareField {
    pub field: String,
    pub label: String,
    pub value: String,
}

/// Human-readable projection of a snapshot, used only for diffing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompareSnapshot {
    pub fields: Vec<CompareField>,
}

impl CompareSnapshot {
    pub fn push(&mut self, field: impl Into<String>, label: impl Into<String>, value: String) {
        self.fields.push(CompareField {
            field: field.into(),
            label: label.into(),
            value,
        });
    }

    pub fn get(&self, field: &str) -> Option<&CompareField> {
        self.fields.iter().find(|f| f.field == field)
    }
}

/// Media scheduled for reconciliation after an apply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MediaSet {
    pub source_site_id: i64,
    #[serde(default)]
    pub featured_image: Option<MediaRef>,
    #[serde(default)]
    pub content_media: Vec<MediaRef>,
}

impl MediaSet {
    pub fn is_empty(&self) -> bool {
        self.featured_image.is_none() && self.content_media.is_empty()
    }

    /// Stable dedupe key over the set's contents.
    pub fn hash(&self) -> Result<String, serde_json::Error> {
        let bytes = serde_json::to_vec(self)?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media(id: i64) -> MediaRef {
        MediaRef {
            url: format!("http://net.test/uploads/2024/05/img-{}.jpg", id),
            central_attachment_id: id,
            source_path: format!("2024/05/img-{}.jpg", id),
            size_hints: None,
            author: None,
        }
    }

    #[test]
    fn media_set_hash_is_stable_and_content_sensitive() {
        let a = MediaSet {
            source_site_id: 1,
            featured_image: Some(media(3)),
            content_media: vec![media(4)],
        };
        let b = a.clone();
        let c = MediaSet {
            content_media: vec![media(5)],
            ..a.clone()
        };

        assert_eq!(a.hash().unwrap(), b.hash().unwrap());
        assert_ne!(a.hash().unwrap(), c.hash().unwrap());
    }

    #[test]
    fn portable_refs_are_tagged() {
        let value = serde_json::to_value(PortableRef::Post {
            central_id: 9,
            content_type: "page".into(),
            slug: "about".into(),
        })
        .unwrap();
        assert_eq!(value["ref"], "post");
        assert_eq!(value["centralId"], 9);
    }
}
