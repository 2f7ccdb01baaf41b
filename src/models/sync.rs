//! Replication protocol, sync log, bulk and review models.

use serde::{Deserialize, Serialize};

use super::{ContentSnapshot, SnapshotMode, SubsiteQueueEntry, SyncKind};

/// Outcome of one replication step on one site.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum OutcomeStatus {
    Synced,
    BulkSynced,
    QueuedForApproval,
    Skipped,
    Superseded,
    Approved,
    Rejected,
    Deleted,
    Trashed,
    Untrashed,
    Failed,
    PolicyDenied,
}

impl OutcomeStatus {
    /// Label shown in the sync log.
    pub fn label(&self) -> &'static str {
        match self {
            OutcomeStatus::Synced => "Synced",
            OutcomeStatus::BulkSynced => "Bulk Synced",
            OutcomeStatus::QueuedForApproval => "Pending Approval",
            OutcomeStatus::Skipped => "Skipped",
            OutcomeStatus::Superseded => "Superseded",
            OutcomeStatus::Approved => "Approved",
            OutcomeStatus::Rejected => "Rejected",
            OutcomeStatus::Deleted => "Deleted",
            OutcomeStatus::Trashed => "Trashed",
            OutcomeStatus::Untrashed => "Restored",
            OutcomeStatus::Failed => "Failed",
            OutcomeStatus::PolicyDenied => "Policy Denied",
        }
    }

    pub fn synced_for(mode: SnapshotMode) -> Self {
        match mode {
            SnapshotMode::Single => OutcomeStatus::Synced,
            SnapshotMode::Bulk => OutcomeStatus::BulkSynced,
        }
    }
}

/// Body of a push from central to a subsite.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPayload {
    /// Absent when the central content queue is disabled
    #[serde(default)]
    pub central_entry_id: Option<i64>,
    pub central_content_id: i64,
    pub content_type: String,
    pub sync_kind: SyncKind,
    #[serde(default)]
    pub disable_sync: bool,
    pub source_site_id: i64,
    pub source_url: String,
    pub snapshot: ContentSnapshot,
}

/// Structured answer to a push or lifecycle call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PushOutcome {
    pub success: bool,
    pub site_id: i64,
    pub status: OutcomeStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_content_id: Option<i64>,
}

impl PushOutcome {
    pub fn ok(site_id: i64, status: OutcomeStatus, message: impl Into<String>) -> Self {
        Self {
            success: true,
            site_id,
            status,
            message: message.into(),
            debug_message: None,
            local_content_id: None,
        }
    }

    pub fn failed(site_id: i64, message: impl Into<String>, debug: impl Into<String>) -> Self {
        Self {
            success: false,
            site_id,
            status: OutcomeStatus::Failed,
            message: message.into(),
            debug_message: Some(debug.into()),
            local_content_id: None,
        }
    }

    pub fn with_local_id(mut self, local_content_id: i64) -> Self {
        if local_content_id > 0 {
            self.local_content_id = Some(local_content_id);
        }
        self
    }
}

/// Body of the trash/untrash/delete lifecycle endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleRequest {
    #[serde(default)]
    pub subsite_post_id: Option<i64>,
    #[serde(default)]
    pub delete_on_subsite: bool,
}

/// Lifecycle actions propagated outside the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Trash,
    Untrash,
    Delete,
}

impl LifecycleAction {
    pub fn endpoint(&self) -> &'static str {
        match self {
            LifecycleAction::Trash => "trash-post",
            LifecycleAction::Untrash => "untrash-post",
            LifecycleAction::Delete => "delete-post",
        }
    }
}

/// Latest outcome reported for one (central content, subsite) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncedSubsiteData {
    pub site_id: i64,
    pub success: bool,
    pub status: OutcomeStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_content_id: Option<i64>,
    pub synced_at: String,
}

impl SyncedSubsiteData {
    pub fn from_outcome(outcome: &PushOutcome) -> Self {
        Self {
            site_id: outcome.site_id,
            success: outcome.success,
            status: outcome.status,
            message: outcome.message.clone(),
            local_content_id: outcome.local_content_id,
            synced_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Body of the central `update-synced-data` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportOutcomeRequest {
    pub central_content_id: i64,
    pub subsite_id: i64,
    pub outcome: SyncedSubsiteData,
}

/// One site's line in a sync log row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SiteOutcome {
    pub site_id: i64,
    pub sync_time: String,
    pub status: String,
    pub note: String,
}

impl SiteOutcome {
    pub fn from_outcome(outcome: &PushOutcome) -> Self {
        let note = match &outcome.debug_message {
            Some(debug) => format!("{} ({})", outcome.message, debug),
            None => outcome.message.clone(),
        };
        Self {
            site_id: outcome.site_id,
            sync_time: chrono::Utc::now().to_rfc3339(),
            status: outcome.status.label().to_string(),
            note,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLogEntry {
    pub id: i64,
    pub content_id: i64,
    pub content_name: String,
    pub site_outcomes: Vec<SiteOutcome>,
    pub created_at: String,
}

/// Result of a single-object sync from the central site.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<i64>,
    pub outcomes: Vec<PushOutcome>,
    pub skipped_sites: Vec<i64>,
}

/// Request body for one bulk batch.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkSyncRequest {
    #[serde(default)]
    pub selection: Vec<i64>,
    #[serde(default)]
    pub target_sites: Vec<i64>,
    #[serde(default)]
    pub batch_index: usize,
    #[serde(default)]
    pub batch_size: Option<usize>,
}

/// One line of bulk progress output.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkLogLine {
    pub content_id: i64,
    pub content_name: String,
    pub site_id: i64,
    pub site_name: String,
    pub status: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkBatchReport {
    pub logs: Vec<BulkLogLine>,
    /// 1-based index of the batch just processed
    pub current_batch: usize,
    pub total_batches: usize,
    pub posts_processed: usize,
    pub total_posts: usize,
    pub done: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproveRequest {
    pub reviewer_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectRequest {
    pub reviewer_id: i64,
    #[serde(default)]
    pub reason: String,
}

/// Result of a reviewer action.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewOutcome {
    pub row: SubsiteQueueEntry,
    pub message: String,
}

/// One line of a field diff.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiffLine {
    /// `equal`, `delete` or `insert`
    pub tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_line: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_line: Option<usize>,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffBlock {
    pub field: String,
    pub label: String,
    pub lines: Vec<DiffLine>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewResult {
    pub row_id: i64,
    pub sync_kind: SyncKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub blocks: Vec<DiffBlock>,
}
