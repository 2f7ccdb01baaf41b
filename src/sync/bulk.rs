//! Bulk fan-out of many central objects, one batch per request.

use std::collections::HashMap;
use std::sync::Arc;

use super::apply::SKIPPED_MESSAGE;
use super::central::CentralSync;
use crate::config::Config;
use crate::db::{is_sync_disabled, Repository};
use crate::errors::AppError;
use crate::models::{
    BulkBatchReport, BulkLogLine, BulkSyncRequest, OutcomeStatus, SnapshotMode, SyncKind,
    STATUS_TRASH,
};

pub struct BulkSync {
    repo: Arc<Repository>,
    config: Arc<Config>,
    central: Arc<CentralSync>,
}

impl BulkSync {
    pub fn new(repo: Arc<Repository>, config: Arc<Config>, central: Arc<CentralSync>) -> Self {
        Self {
            repo,
            config,
            central,
        }
    }

    /// Process batch `batch_index` of the selection and report progress.
    pub async fn run_batch(&self, request: &BulkSyncRequest) -> Result<BulkBatchReport, AppError> {
        if request.target_sites.is_empty() {
            return Err(AppError::Validation(
                "Please select at least one site to sync.".to_string(),
            ));
        }
        if request.selection.is_empty() {
            return Err(AppError::Validation(
                "Please select at least one post to sync.".to_string(),
            ));
        }
        self.central.validate_targets(&request.target_sites).await?;

        let size = request
            .batch_size
            .unwrap_or(self.config.bulk_batch_size)
            .max(1);
        let batches = partition(&request.selection, size);
        let Some(batch) = batches.get(request.batch_index) else {
            return Err(AppError::Validation(format!(
                "Batch {} is out of range ({} batches)",
                request.batch_index,
                batches.len()
            )));
        };

        let site_names: HashMap<i64, String> = self
            .repo
            .list_sites()
            .await?
            .into_iter()
            .map(|s| (s.id, s.name))
            .collect();

        let mut logs = Vec::new();
        for content_id in batch {
            logs.extend(self.sync_one(*content_id, &request.target_sites, &site_names).await?);
        }

        let total_posts = request.selection.len();
        let current_batch = request.batch_index + 1;
        tracing::info!(
            "Bulk batch {}/{} done ({} log lines)",
            current_batch,
            batches.len(),
            logs.len()
        );

        Ok(BulkBatchReport {
            logs,
            current_batch,
            total_batches: batches.len(),
            posts_processed: (current_batch * size).min(total_posts),
            total_posts,
            done: current_batch == batches.len(),
        })
    }

    async fn sync_one(
        &self,
        content_id: i64,
        targets: &[i64],
        site_names: &HashMap<i64, String>,
    ) -> Result<Vec<BulkLogLine>, AppError> {
        let line = |name: &str, site_id: i64, status: &str, message: &str| BulkLogLine {
            content_id,
            content_name: name.to_string(),
            site_id,
            site_name: site_names.get(&site_id).cloned().unwrap_or_default(),
            status: status.to_string(),
            message: message.to_string(),
        };

        let content = self
            .repo
            .get_content(content_id)
            .await?
            .filter(|c| c.site_id == self.config.central_site_id);
        let Some(content) = content else {
            return Ok(targets
                .iter()
                .map(|site| line("", *site, OutcomeStatus::Failed.label(), "Post not found!"))
                .collect());
        };

        let disabled = {
            let mut conn = self.repo.pool().acquire().await?;
            is_sync_disabled(&mut conn, content.id).await?
        };
        if disabled {
            return Ok(targets
                .iter()
                .map(|site| line(&content.title, *site, OutcomeStatus::Skipped.label(), SKIPPED_MESSAGE))
                .collect());
        }

        let kind = if content.status == STATUS_TRASH {
            SyncKind::Delete
        } else {
            SyncKind::Update
        };

        match self
            .central
            .sync_content(&content, targets, kind, SnapshotMode::Bulk)
            .await
        {
            Ok(report) => {
                let mut lines: Vec<BulkLogLine> = report
                    .outcomes
                    .iter()
                    .map(|o| line(&content.title, o.site_id, o.status.label(), &o.message))
                    .collect();
                lines.extend(report.skipped_sites.iter().map(|site| {
                    line(
                        &content.title,
                        *site,
                        OutcomeStatus::Skipped.label(),
                        "Nothing to delete on this site.",
                    )
                }));
                Ok(lines)
            }
            Err(e) => {
                tracing::warn!("Bulk sync of content {} failed: {}", content.id, e);
                Ok(targets
                    .iter()
                    .map(|site| line(&content.title, *site, OutcomeStatus::Failed.label(), &e.to_string()))
                    .collect())
            }
        }
    }
}

/// Split a selection into consecutive batches of `size`.
pub fn partition<T: Clone>(items: &[T], size: usize) -> Vec<Vec<T>> {
    items.chunks(size.max(1)).map(|chunk| chunk.to_vec()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_keeps_order_and_remainder() {
        assert_eq!(
            partition(&[1, 2, 3, 4, 5], 2),
            vec![vec![1, 2], vec![3, 4], vec![5]]
        );
        assert_eq!(partition(&[1, 2], 0), vec![vec![1], vec![2]]);
        assert!(partition::<i64>(&[], 3).is_empty());
    }
}
