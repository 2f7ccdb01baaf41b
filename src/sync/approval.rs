//! Subsite approval workflow.
//!
//! Reviewers approve or reject pending queue rows and preview what an approval
//! would change. Every decision is logged locally and reported to central.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use similar::{ChangeTag, TextDiff};

use super::apply::{applied_message, ApplyEngine, RowSource};
use super::transport::SubsiteTransport;
use crate::config::Config;
use crate::db::{Repository, RowTransition};
use crate::errors::AppError;
use crate::models::{
    CentralQueueEntry, CompareSnapshot, DiffBlock, DiffLine, OutcomeStatus, PreviewResult,
    PushOutcome, QueueStatus, ReportOutcomeRequest, ReviewOutcome, SiteOutcome, SnapshotMode,
    SubsiteQueueEntry, SyncKind, SyncedSubsiteData,
};
use crate::notify::{unique_recipients, Notification, Notifier};
use crate::snapshot::build_snapshot;

type RowKey = (i64, i64);

pub struct ReviewWorkflow {
    repo: Arc<Repository>,
    config: Arc<Config>,
    apply: Arc<ApplyEngine>,
    transport: Arc<dyn SubsiteTransport>,
    notifier: Arc<dyn Notifier>,
    in_flight: Arc<Mutex<HashSet<RowKey>>>,
}

/// Marks a row as being reviewed until dropped.
struct ReviewGuard {
    key: RowKey,
    in_flight: Arc<Mutex<HashSet<RowKey>>>,
}

impl Drop for ReviewGuard {
    fn drop(&mut self) {
        if let Ok(mut rows) = self.in_flight.lock() {
            rows.remove(&self.key);
        }
    }
}

impl ReviewWorkflow {
    pub fn new(
        repo: Arc<Repository>,
        config: Arc<Config>,
        apply: Arc<ApplyEngine>,
        transport: Arc<dyn SubsiteTransport>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            repo,
            config,
            apply,
            transport,
            notifier,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn claim(&self, site_id: i64, row_id: i64) -> Result<ReviewGuard, AppError> {
        let key = (site_id, row_id);
        let mut rows = self
            .in_flight
            .lock()
            .map_err(|_| AppError::Internal("Review lock poisoned".to_string()))?;
        if !rows.insert(key) {
            return Err(AppError::InvalidState {
                message: format!("Queue row {} is already being reviewed", row_id),
                current_status: QueueStatus::Pending.as_str().to_string(),
            });
        }
        Ok(ReviewGuard {
            key,
            in_flight: self.in_flight.clone(),
        })
    }

    /// Load a row that must still be pending, with its central entry.
    async fn pending_row(
        &self,
        site_id: i64,
        row_id: i64,
    ) -> Result<(SubsiteQueueEntry, CentralQueueEntry), AppError> {
        let row = self.require_row(site_id, row_id).await?;
        if row.status != QueueStatus::Pending {
            return Err(AppError::InvalidState {
                message: format!("Queue row {} is already {}", row_id, row.status.as_str()),
                current_status: row.status.as_str().to_string(),
            });
        }
        let entry = self.require_entry(&row).await?;
        Ok((row, entry))
    }

    async fn require_row(&self, site_id: i64, row_id: i64) -> Result<SubsiteQueueEntry, AppError> {
        self.repo.require_site(site_id).await?;
        self.repo
            .get_subsite_row(site_id, row_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Queue row {} not found on site {}", row_id, site_id)))
    }

    async fn require_entry(&self, row: &SubsiteQueueEntry) -> Result<CentralQueueEntry, AppError> {
        self.repo
            .get_central_entry(row.central_entry_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Central entry {} not found", row.central_entry_id)))
    }

    /// Pending rows, or rows of one status, for a subsite.
    pub async fn list(
        &self,
        site_id: i64,
        status: Option<QueueStatus>,
    ) -> Result<Vec<SubsiteQueueEntry>, AppError> {
        self.repo.require_site(site_id).await?;
        self.repo.list_subsite_rows(site_id, status).await
    }

    /// Apply a pending row.
    pub async fn approve(
        &self,
        site_id: i64,
        row_id: i64,
        reviewer_id: i64,
    ) -> Result<ReviewOutcome, AppError> {
        let _guard = self.claim(site_id, row_id)?;
        let (row, entry) = self.pending_row(site_id, row_id).await?;
        if self.repo.get_user(reviewer_id).await?.is_none() {
            return Err(AppError::Validation(format!("Reviewer {} not found", reviewer_id)));
        }
        let policy = self.repo.get_policy(site_id).await?;

        let (status, message, local_id) = if entry.sync_kind == SyncKind::Delete {
            if !policy.delete_on_subsite {
                return Err(AppError::Policy(super::apply::DELETE_NOT_ALLOWED.to_string()));
            }
            let message = self.apply.trash_row(&row, Some(reviewer_id)).await?;
            (OutcomeStatus::Deleted, message, row.local_content_id)
        } else {
            let source = RowSource {
                source_site_id: self.config.central_site_id,
                content_type: &entry.content_type,
                snapshot: &entry.snapshot,
            };
            let applied = self
                .apply
                .apply_row(&policy, &row, source, QueueStatus::ApprovedApplied, Some(reviewer_id))
                .await?;
            (OutcomeStatus::Approved, applied_message(applied), applied.local_content_id)
        };

        tracing::info!("Row {} on site {} approved by user {}", row_id, site_id, reviewer_id);
        let outcome = PushOutcome::ok(site_id, status, message).with_local_id(local_id);
        self.finish_review(&entry, &outcome).await?;

        Ok(ReviewOutcome {
            row: self.require_row(site_id, row_id).await?,
            message: message.to_string(),
        })
    }

    /// Reject a pending row with a reason. Nothing is applied.
    pub async fn reject(
        &self,
        site_id: i64,
        row_id: i64,
        reviewer_id: i64,
        reason: &str,
    ) -> Result<ReviewOutcome, AppError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(AppError::Validation("A rejection message is required".to_string()));
        }

        let _guard = self.claim(site_id, row_id)?;
        let (row, entry) = self.pending_row(site_id, row_id).await?;
        let reviewer = self
            .repo
            .get_user(reviewer_id)
            .await?
            .ok_or_else(|| AppError::Validation(format!("Reviewer {} not found", reviewer_id)))?;

        self.transition(&row, QueueStatus::Rejected, RowTransition {
            local_content_id: None,
            approved_by: Some(reviewer_id),
            reject_reason: Some(reason.to_string()),
        })
        .await?;

        let message = format!(
            "Changes to this post were rejected at subsite by {} with message: {}",
            reviewer.display_name.as_deref().unwrap_or(&reviewer.login),
            reason
        );
        tracing::info!("Row {} on site {} rejected by user {}", row_id, site_id, reviewer_id);

        let outcome = PushOutcome::ok(site_id, OutcomeStatus::Rejected, message.clone())
            .with_local_id(row.local_content_id);
        self.finish_review(&entry, &outcome).await?;
        self.notify_rejection(site_id, &entry, &message).await;

        Ok(ReviewOutcome {
            row: self.require_row(site_id, row_id).await?,
            message,
        })
    }

    /// Field-by-field diff between a row's snapshot and the local object.
    pub async fn preview(&self, site_id: i64, row_id: i64) -> Result<PreviewResult, AppError> {
        let row = self.require_row(site_id, row_id).await?;
        let entry = self.require_entry(&row).await?;

        if entry.sync_kind == SyncKind::Delete {
            return Ok(PreviewResult {
                row_id,
                sync_kind: entry.sync_kind,
                message: Some(format!(
                    "You have deleted this {}. Approving removes it from this site.",
                    entry.content_type
                )),
                blocks: Vec::new(),
            });
        }

        let mut conn = self.repo.pool().acquire().await?;
        let local = match row.local_content_id {
            0 => crate::db::find_by_central_marker(&mut conn, site_id, entry.content_id).await?,
            id => crate::db::get_content(&mut conn, id).await?,
        };
        let current = match local.filter(|c| c.site_id == site_id) {
            Some(content) => {
                let (_, compare) =
                    build_snapshot(&mut conn, &self.config, &content, SnapshotMode::Single).await?;
                self.normalize(compare, site_id)
            }
            None => CompareSnapshot::default(),
        };

        Ok(PreviewResult {
            row_id,
            sync_kind: entry.sync_kind,
            message: None,
            blocks: diff_fields(&current, &entry.compare_snapshot),
        })
    }

    /// Rewrite local URLs to their central form so only real changes show up.
    fn normalize(&self, mut compare: CompareSnapshot, site_id: i64) -> CompareSnapshot {
        let central = self.config.central_site_id;
        let swaps = [
            (self.config.uploads_url(site_id), self.config.uploads_url(central)),
            (self.config.site_url(site_id), self.config.site_url(central)),
        ];
        for field in &mut compare.fields {
            for (local, remote) in &swaps {
                field.value = field.value.replace(local.as_str(), remote);
            }
        }
        compare
    }

    async fn transition(
        &self,
        row: &SubsiteQueueEntry,
        to: QueueStatus,
        transition: RowTransition,
    ) -> Result<(), AppError> {
        let moved = self
            .repo
            .transition_subsite_row(row.site_id, row.id, to, &transition)
            .await?;
        if moved {
            return Ok(());
        }
        let current = self
            .repo
            .get_subsite_row(row.site_id, row.id)
            .await?
            .map(|r| r.status.as_str().to_string())
            .unwrap_or_default();
        Err(AppError::InvalidState {
            message: format!("Queue row {} changed during review", row.id),
            current_status: current,
        })
    }

    /// Log locally and tell central. Report failures are logged, not surfaced.
    async fn finish_review(&self, entry: &CentralQueueEntry, outcome: &PushOutcome) -> Result<(), AppError> {
        self.repo
            .append_sync_log(
                entry.content_id,
                &entry.snapshot.title,
                &[SiteOutcome::from_outcome(outcome)],
            )
            .await?;

        let report = ReportOutcomeRequest {
            central_content_id: entry.content_id,
            subsite_id: outcome.site_id,
            outcome: SyncedSubsiteData::from_outcome(outcome),
        };
        if let Err(e) = self
            .transport
            .report_outcome(self.config.central_site_id, &report)
            .await
        {
            tracing::warn!(
                "Reporting {} for content {} to central failed: {}",
                outcome.status.label(),
                entry.content_id,
                e
            );
        }
        Ok(())
    }

    async fn notify_rejection(&self, site_id: i64, entry: &CentralQueueEntry, message: &str) {
        let site = self.repo.get_site(site_id).await.ok().flatten();
        let central = self.repo.get_site(self.config.central_site_id).await.ok().flatten();
        let author_email = match entry.author_id {
            Some(id) => self.repo.get_user(id).await.ok().flatten().map(|u| u.email),
            None => None,
        };

        let recipients = unique_recipients(
            [
                author_email,
                site.as_ref().and_then(|s| s.admin_email.clone()),
                central.and_then(|s| s.admin_email),
            ]
            .into_iter()
            .chain(self.config.notify_emails.iter().cloned().map(Some)),
        );
        let site_name = site.map(|s| s.name).unwrap_or_else(|| format!("Site {}", site_id));

        let notification = Notification {
            recipients,
            subject: format!("{} - CCM - Change Rejected", site_name),
            body: format!(
                "{}\n\nPost: {} (central id {})\nSite: {}\n",
                message, entry.snapshot.title, entry.content_id, site_name
            ),
        };
        if let Err(e) = self.notifier.send(&notification).await {
            tracing::warn!("Rejection notice for content {} not sent: {}", entry.content_id, e);
        }
    }
}

/// Line diffs for every field that differs between two compare snapshots.
pub fn diff_fields(old: &CompareSnapshot, new: &CompareSnapshot) -> Vec<DiffBlock> {
    let mut blocks = Vec::new();

    for field in &new.fields {
        let before = old.get(&field.field).map(|f| f.value.as_str()).unwrap_or("");
        if before != field.value {
            blocks.push(diff_block(&field.field, &field.label, before, &field.value));
        }
    }
    for field in &old.fields {
        if new.get(&field.field).is_none() && !field.value.is_empty() {
            blocks.push(diff_block(&field.field, &field.label, &field.value, ""));
        }
    }
    blocks
}

fn diff_block(field: &str, label: &str, old: &str, new: &str) -> DiffBlock {
    let text_diff = TextDiff::from_lines(old, new);
    let lines = text_diff
        .iter_all_changes()
        .map(|change| {
            let tag = match change.tag() {
                ChangeTag::Equal => "equal",
                ChangeTag::Delete => "delete",
                ChangeTag::Insert => "insert",
            };
            DiffLine {
                tag: tag.to_string(),
                old_line: change.old_index().map(|i| i + 1),
                new_line: change.new_index().map(|i| i + 1),
                text: change.value().trim_end_matches('\n').to_string(),
            }
        })
        .collect();

    DiffBlock {
        field: field.to_string(),
        label: label.to_string(),
        lines,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compare(pairs: &[(&str, &str)]) -> CompareSnapshot {
        let mut snapshot = CompareSnapshot::default();
        for (field, value) in pairs {
            snapshot.push(*field, *field, value.to_string());
        }
        snapshot
    }

    #[test]
    fn identical_fields_produce_no_blocks() {
        let a = compare(&[("title", "Hello"), ("content", "one\ntwo")]);
        assert!(diff_fields(&a, &a.clone()).is_empty());
    }

    #[test]
    fn changed_lines_are_tagged() {
        let old = compare(&[("title", "Hello"), ("content", "one\ntwo\n")]);
        let new = compare(&[("title", "Hello"), ("content", "one\nthree\n")]);

        let blocks = diff_fields(&old, &new);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].field, "content");

        let tags: Vec<(&str, &str)> = blocks[0]
            .lines
            .iter()
            .map(|l| (l.tag.as_str(), l.text.as_str()))
            .collect();
        assert_eq!(tags, vec![("equal", "one"), ("delete", "two"), ("insert", "three")]);
    }

    #[test]
    fn fields_missing_on_either_side_show_up() {
        let old = compare(&[("taxonomy:category", "News")]);
        let new = compare(&[("meta:subtitle", "Fresh")]);

        let fields: Vec<String> = diff_fields(&old, &new).into_iter().map(|b| b.field).collect();
        assert_eq!(fields, vec!["meta:subtitle", "taxonomy:category"]);
    }
}
