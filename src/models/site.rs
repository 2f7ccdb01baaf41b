//! Network registry models: sites and their sync policies.

use serde::{Deserialize, Serialize};

/// A site in the network.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Site {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_email: Option<String>,
    pub created_at: String,
}

/// Request body for registering a site.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterSiteRequest {
    /// Explicit site id; allocated when absent
    #[serde(default)]
    pub id: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub admin_email: Option<String>,
}

/// Registration result. The key is only ever returned here.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredSite {
    pub site: Site,
    pub api_key: String,
}

/// Per-site replication settings.
///
/// Subsites read the approval, delete and field toggles; the central site reads
/// `post_types`, `content_queue_enabled` and `delete_on_subsite`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPolicy {
    pub approval_required: bool,
    pub delete_on_subsite: bool,
    pub sync_media: bool,
    pub sync_post_meta: bool,
    pub sync_users: bool,
    /// Taxonomies replicated to this site; `None` means all
    #[serde(default)]
    pub taxonomies: Option<Vec<String>>,
    pub post_types: Vec<String>,
    pub content_queue_enabled: bool,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            approval_required: false,
            delete_on_subsite: false,
            sync_media: true,
            sync_post_meta: true,
            sync_users: true,
            taxonomies: None,
            post_types: vec!["post".to_string(), "page".to_string()],
            content_queue_enabled: true,
        }
    }
}

impl SyncPolicy {
    pub fn allows_taxonomy(&self, taxonomy: &str) -> bool {
        match &self.taxonomies {
            Some(list) => list.iter().any(|t| t == taxonomy),
            None => true,
        }
    }

    pub fn allows_content_type(&self, content_type: &str) -> bool {
        self.post_types.iter().any(|t| t == content_type)
    }

    /// Apply a partial update.
    pub fn merge(&mut self, update: &UpdatePolicyRequest) {
        if let Some(v) = update.approval_required {
            self.approval_required = v;
        }
        if let Some(v) = update.delete_on_subsite {
            self.delete_on_subsite = v;
        }
        if let Some(v) = update.sync_media {
            self.sync_media = v;
        }
        if let Some(v) = update.sync_post_meta {
            self.sync_post_meta = v;
        }
        if let Some(v) = update.sync_users {
            self.sync_users = v;
        }
        if update.all_taxonomies == Some(true) {
            self.taxonomies = None;
        } else if let Some(v) = &update.taxonomies {
            self.taxonomies = Some(v.clone());
        }
        if let Some(v) = &update.post_types {
            self.post_types = v.clone();
        }
        if let Some(v) = update.content_queue_enabled {
            self.content_queue_enabled = v;
        }
    }
}

/// Request body for updating a site's policy.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePolicyRequest {
    #[serde(default)]
    pub approval_required: Option<bool>,
    #[serde(default)]
    pub delete_on_subsite: Option<bool>,
    #[serde(default)]
    pub sync_media: Option<bool>,
    #[serde(default)]
    pub sync_post_meta: Option<bool>,
    #[serde(default)]
    pub sync_users: Option<bool>,
    #[serde(default)]
    pub taxonomies: Option<Vec<String>>,
    /// Reset the taxonomy allowlist to all taxonomies
    #[serde(default)]
    pub all_taxonomies: Option<bool>,
    #[serde(default)]
    pub post_types: Option<Vec<String>>,
    #[serde(default)]
    pub content_queue_enabled: Option<bool>,
}
