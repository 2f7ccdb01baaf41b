//! Central and subsite queue models.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{CompareSnapshot, ContentSnapshot};

/// What a queue entry asks the receiving site to do.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncKind {
    Create,
    Update,
    Delete,
    /// Central entries superseded by a newer one
    Expired,
}

impl SyncKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncKind::Create => "create",
            SyncKind::Update => "update",
            SyncKind::Delete => "delete",
            SyncKind::Expired => "expired",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "create" => Some(SyncKind::Create),
            "update" => Some(SyncKind::Update),
            "delete" => Some(SyncKind::Delete),
            "expired" => Some(SyncKind::Expired),
            _ => None,
        }
    }
}

/// Per-site status recorded on a central entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CentralSiteStatus {
    Pending,
    Expired,
}

/// Status of a subsite queue row. Everything but `Pending` is terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum QueueStatus {
    Pending,
    Synced,
    ApprovedApplied,
    Rejected,
    Failed,
    Expired,
    Deleted,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Synced => "synced",
            QueueStatus::ApprovedApplied => "approved-applied",
            QueueStatus::Rejected => "rejected",
            QueueStatus::Failed => "failed",
            QueueStatus::Expired => "expired",
            QueueStatus::Deleted => "deleted",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(QueueStatus::Pending),
            "synced" => Some(QueueStatus::Synced),
            "approved-applied" => Some(QueueStatus::ApprovedApplied),
            "rejected" => Some(QueueStatus::Rejected),
            "failed" => Some(QueueStatus::Failed),
            "expired" => Some(QueueStatus::Expired),
            "deleted" => Some(QueueStatus::Deleted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, QueueStatus::Pending)
    }
}

/// One sync intent recorded on the central site.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CentralQueueEntry {
    pub id: i64,
    pub content_id: i64,
    pub content_type: String,
    pub target_sites: Vec<i64>,
    pub site_status: BTreeMap<i64, CentralSiteStatus>,
    pub sync_kind: SyncKind,
    pub snapshot: ContentSnapshot,
    pub compare_snapshot: CompareSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_id: Option<i64>,
    pub created_at: String,
    pub modified_at: String,
}

/// One row of a subsite's queue table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubsiteQueueEntry {
    pub id: i64,
    pub site_id: i64,
    pub central_entry_id: i64,
    pub central_content_id: i64,
    pub content_type: String,
    /// 0 until the local object exists
    pub local_content_id: i64,
    pub status: QueueStatus,
    pub sync_kind: SyncKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<String>,
    pub created_at: String,
    pub modified_at: String,
}

/// Input to an enqueue.
#[derive(Debug, Clone)]
pub struct NewCentralEntry {
    pub content_id: i64,
    pub content_type: String,
    pub target_sites: Vec<i64>,
    pub sync_kind: SyncKind,
    pub snapshot: ContentSnapshot,
    pub compare_snapshot: CompareSnapshot,
    pub author_id: Option<i64>,
}

/// A subsite row created by an enqueue.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FanOutRow {
    pub site_id: i64,
    pub row_id: i64,
    pub local_content_id: i64,
}

/// Result of an enqueue.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResult {
    pub entry_id: i64,
    pub rows: Vec<FanOutRow>,
    /// Delete intents for sites that never received the object
    pub skipped_sites: Vec<i64>,
}
