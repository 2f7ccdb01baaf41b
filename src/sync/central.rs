//! Central side of replication.
//!
//! Editor saves and lifecycle changes on the central site turn into snapshots,
//! queue entries and concurrent pushes to every selected subsite.

use std::sync::Arc;

use tokio::task::JoinSet;

use super::transport::SubsiteTransport;
use crate::config::Config;
use crate::db::{
    delete_content, get_meta, is_sync_disabled, require_content, save_content, selected_sites,
    set_content_status, set_meta, Repository,
};
use crate::errors::AppError;
use crate::models::{
    ContentObject, LifecycleAction, LifecycleRequest, NewCentralEntry, OutcomeStatus, PushOutcome,
    SaveContentRequest, SiteOutcome, SnapshotMode, SyncKind, SyncPayload, SyncReport,
    SyncedSubsiteData, STATUS_TRASH, TRASH_STATUS_META, UNSYNCABLE_STATUSES,
};
use crate::snapshot::build_snapshot;

pub struct CentralSync {
    repo: Arc<Repository>,
    config: Arc<Config>,
    transport: Arc<dyn SubsiteTransport>,
}

/// Result of an editor save on the central site.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveResult {
    pub content: ContentObject,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncReport>,
}

impl CentralSync {
    pub fn new(
        repo: Arc<Repository>,
        config: Arc<Config>,
        transport: Arc<dyn SubsiteTransport>,
    ) -> Self {
        Self {
            repo,
            config,
            transport,
        }
    }

    fn central(&self) -> i64 {
        self.config.central_site_id
    }

    /// Save an object on the central site and replicate it when eligible.
    pub async fn save(
        &self,
        existing_id: Option<i64>,
        request: &SaveContentRequest,
    ) -> Result<SaveResult, AppError> {
        if request.title.trim().is_empty() {
            return Err(AppError::Validation("Title is required".to_string()));
        }
        if let Some(targets) = &request.target_sites {
            self.validate_targets(targets).await?;
        }

        let central = self.central();
        let mut conn = self.repo.begin_immediate().await?;
        let result = save_content(&mut conn, central, existing_id, request).await;
        let content = Repository::finish(&mut conn, result).await?;
        drop(conn);

        let kind = if existing_id.is_some() {
            SyncKind::Update
        } else {
            SyncKind::Create
        };
        let sync = self.sync_on_save(&content, kind).await?;
        Ok(SaveResult { content, sync })
    }

    /// Replicate after a save, if the object's type and status allow it.
    async fn sync_on_save(
        &self,
        content: &ContentObject,
        kind: SyncKind,
    ) -> Result<Option<SyncReport>, AppError> {
        let policy = self.repo.get_policy(self.central()).await?;
        if !policy.allows_content_type(&content.content_type) {
            tracing::debug!("Content type {} is not replicated", content.content_type);
            return Ok(None);
        }
        if UNSYNCABLE_STATUSES.contains(&content.status.as_str()) {
            tracing::debug!("Content {} has status {}; not replicated", content.id, content.status);
            return Ok(None);
        }

        let targets = {
            let mut conn = self.repo.pool().acquire().await?;
            selected_sites(&mut conn, content.id).await?
        };
        if targets.is_empty() {
            return Ok(None);
        }

        self.sync_content(content, &targets, kind, SnapshotMode::Single)
            .await
            .map(Some)
    }

    /// Snapshot an object, enqueue it for the target sites and push to each of them.
    pub async fn sync_content(
        &self,
        content: &ContentObject,
        targets: &[i64],
        kind: SyncKind,
        mode: SnapshotMode,
    ) -> Result<SyncReport, AppError> {
        if content.site_id != self.central() {
            return Err(AppError::Validation(format!(
                "Content {} does not belong to the central site",
                content.id
            )));
        }
        self.validate_targets(targets).await?;

        let (disabled, snapshot, compare) = {
            let mut conn = self.repo.pool().acquire().await?;
            let disabled = is_sync_disabled(&mut conn, content.id).await?;
            let (snapshot, compare) = build_snapshot(&mut conn, &self.config, content, mode).await?;
            (disabled, snapshot, compare)
        };

        let mut payload = SyncPayload {
            central_entry_id: None,
            central_content_id: content.id,
            content_type: content.content_type.clone(),
            sync_kind: kind,
            disable_sync: disabled,
            source_site_id: self.central(),
            source_url: self.config.site_url(self.central()),
            snapshot: snapshot.clone(),
        };

        // Disabled objects never touch the queue; subsites answer `skipped`
        if disabled {
            let outcomes = self.push_all(targets.to_vec(), payload).await;
            self.record(content, &outcomes).await?;
            return Ok(SyncReport {
                entry_id: None,
                outcomes,
                skipped_sites: Vec::new(),
            });
        }

        let policy = self.repo.get_policy(self.central()).await?;
        if !policy.content_queue_enabled {
            let outcomes = if kind == SyncKind::Delete {
                self.lifecycle_all(content.id, targets, LifecycleAction::Trash, true).await?
            } else {
                self.push_all(targets.to_vec(), payload).await
            };
            self.record(content, &outcomes).await?;
            return Ok(SyncReport {
                entry_id: None,
                outcomes,
                skipped_sites: Vec::new(),
            });
        }

        let enqueued = self
            .repo
            .enqueue(&NewCentralEntry {
                content_id: content.id,
                content_type: content.content_type.clone(),
                target_sites: targets.to_vec(),
                sync_kind: kind,
                snapshot,
                compare_snapshot: compare,
                author_id: content.author_id,
            })
            .await?;

        if mode == SnapshotMode::Bulk {
            for row in &enqueued.rows {
                self.repo
                    .record_bulk_target(content.id, row.site_id, row.row_id)
                    .await?;
            }
        }

        payload.central_entry_id = Some(enqueued.entry_id);
        let sites = enqueued.rows.iter().map(|r| r.site_id).collect();
        let outcomes = self.push_all(sites, payload).await;
        self.record(content, &outcomes).await?;

        Ok(SyncReport {
            entry_id: Some(enqueued.entry_id),
            outcomes,
            skipped_sites: enqueued.skipped_sites,
        })
    }

    /// Push one payload to many sites concurrently. Outcomes come back in site order.
    async fn push_all(&self, sites: Vec<i64>, payload: SyncPayload) -> Vec<PushOutcome> {
        let payload = Arc::new(payload);
        let mut tasks = JoinSet::new();
        for site_id in sites {
            let transport = self.transport.clone();
            let payload = payload.clone();
            tasks.spawn(async move { transport.push(site_id, &payload).await });
        }
        collect(tasks).await
    }

    /// Send a lifecycle call to every site holding a replica.
    async fn lifecycle_all(
        &self,
        content_id: i64,
        targets: &[i64],
        action: LifecycleAction,
        delete_on_subsite: bool,
    ) -> Result<Vec<PushOutcome>, AppError> {
        let mut tasks = JoinSet::new();
        for &site_id in targets {
            let Some(local) = self.repo.find_by_central_marker(site_id, content_id).await? else {
                continue;
            };
            let transport = self.transport.clone();
            let request = LifecycleRequest {
                subsite_post_id: Some(local.id),
                delete_on_subsite,
            };
            tasks.spawn(async move { transport.lifecycle(site_id, action, &request).await });
        }
        Ok(collect(tasks).await)
    }

    /// Log a fan-out and refresh the synced projection. Superseded outcomes carry
    /// nothing new and are left out.
    async fn record(&self, content: &ContentObject, outcomes: &[PushOutcome]) -> Result<(), AppError> {
        let live: Vec<&PushOutcome> = outcomes
            .iter()
            .filter(|o| o.status != OutcomeStatus::Superseded)
            .collect();
        if live.is_empty() {
            return Ok(());
        }

        for outcome in &live {
            self.repo
                .upsert_synced_data(content.id, &SyncedSubsiteData::from_outcome(outcome))
                .await?;
        }
        let lines: Vec<SiteOutcome> = live.iter().map(|o| SiteOutcome::from_outcome(o)).collect();
        self.repo
            .append_sync_log(content.id, &content.title, &lines)
            .await?;
        Ok(())
    }

    /// Store an outcome reported by a subsite after an asynchronous step.
    pub async fn record_outcome(
        &self,
        central_content_id: i64,
        data: &SyncedSubsiteData,
    ) -> Result<(), AppError> {
        let content = self.repo.get_content(central_content_id).await?;
        if content.map(|c| c.site_id) != Some(self.central()) {
            return Err(AppError::NotFound(format!(
                "Central content {} not found",
                central_content_id
            )));
        }
        self.repo.upsert_synced_data(central_content_id, data).await?;
        self.repo.clear_bulk_targets(central_content_id).await?;
        tracing::info!(
            "Recorded {} for content {} on site {}",
            data.status.label(),
            central_content_id,
            data.site_id
        );
        Ok(())
    }

    /// Trash a central object and propagate the delete intent.
    pub async fn trash(&self, content_id: i64) -> Result<SyncReport, AppError> {
        let central = self.central();
        let mut conn = self.repo.begin_immediate().await?;
        let result = async {
            let content = require_content(&mut conn, central, content_id).await?;
            if content.status != STATUS_TRASH {
                set_meta(&mut conn, content.id, TRASH_STATUS_META, &content.status.clone().into(), None).await?;
                set_content_status(&mut conn, content.id, STATUS_TRASH).await?;
            }
            let targets = selected_sites(&mut conn, content.id).await?;
            let disabled = is_sync_disabled(&mut conn, content.id).await?;
            let trashed = require_content(&mut conn, central, content_id).await?;
            Ok::<_, AppError>((trashed, targets, disabled))
        }
        .await;
        let (content, targets, disabled) = Repository::finish(&mut conn, result).await?;
        drop(conn);

        let expired = self.repo.expire_bulk_rows_outside(content.id, &targets).await?;
        if expired > 0 {
            tracing::info!("Expired {} bulk rows for trashed content {}", expired, content.id);
        }

        let policy = self.repo.get_policy(central).await?;
        if disabled || !policy.delete_on_subsite || targets.is_empty() {
            return Ok(SyncReport::default());
        }
        self.sync_content(&content, &targets, SyncKind::Delete, SnapshotMode::Single)
            .await
    }

    /// Restore a trashed central object and its replicas.
    pub async fn untrash(&self, content_id: i64) -> Result<SyncReport, AppError> {
        let central = self.central();
        let mut conn = self.repo.begin_immediate().await?;
        let result = async {
            let content = require_content(&mut conn, central, content_id).await?;
            if content.status != STATUS_TRASH {
                return Err(AppError::InvalidState {
                    message: format!("Content {} is not in the trash", content_id),
                    current_status: content.status,
                });
            }
            let previous = match get_meta(&mut conn, content.id, TRASH_STATUS_META).await? {
                Some(serde_json::Value::String(status)) if status != STATUS_TRASH => status,
                _ => "draft".to_string(),
            };
            set_content_status(&mut conn, content.id, &previous).await?;
            let targets = selected_sites(&mut conn, content.id).await?;
            Ok::<_, AppError>((content, targets))
        }
        .await;
        let (content, targets) = Repository::finish(&mut conn, result).await?;
        drop(conn);

        self.propagate_lifecycle(&content, &targets, LifecycleAction::Untrash).await
    }

    /// Permanently delete a central object after removing its replicas.
    pub async fn delete(&self, content_id: i64) -> Result<SyncReport, AppError> {
        let central = self.central();
        let content = {
            let mut conn = self.repo.pool().acquire().await?;
            require_content(&mut conn, central, content_id).await?
        };
        let targets = {
            let mut conn = self.repo.pool().acquire().await?;
            selected_sites(&mut conn, content.id).await?
        };

        let report = self
            .propagate_lifecycle(&content, &targets, LifecycleAction::Delete)
            .await?;

        let mut conn = self.repo.begin_immediate().await?;
        let result = delete_content(&mut conn, content.id).await;
        Repository::finish(&mut conn, result).await?;
        tracing::info!("Deleted central content {}", content.id);
        Ok(report)
    }

    async fn propagate_lifecycle(
        &self,
        content: &ContentObject,
        targets: &[i64],
        action: LifecycleAction,
    ) -> Result<SyncReport, AppError> {
        let policy = self.repo.get_policy(self.central()).await?;
        if !policy.delete_on_subsite || targets.is_empty() {
            return Ok(SyncReport::default());
        }
        let outcomes = self
            .lifecycle_all(content.id, targets, action, policy.delete_on_subsite)
            .await?;
        self.record(content, &outcomes).await?;
        Ok(SyncReport {
            entry_id: None,
            outcomes,
            skipped_sites: Vec::new(),
        })
    }

    /// Target sites must be registered subsites.
    pub async fn validate_targets(&self, targets: &[i64]) -> Result<(), AppError> {
        for site_id in targets {
            if *site_id == self.central() {
                return Err(AppError::Validation(
                    "The central site cannot be a sync target".to_string(),
                ));
            }
            if self.repo.get_site(*site_id).await?.is_none() {
                return Err(AppError::Validation(format!("Site {} is not registered", site_id)));
            }
        }
        Ok(())
    }
}

async fn collect(mut tasks: JoinSet<PushOutcome>) -> Vec<PushOutcome> {
    let mut outcomes = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => tracing::error!("Push task failed: {}", e),
        }
    }
    outcomes.sort_by_key(|o| o.site_id);
    outcomes
}
