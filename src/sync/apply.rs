//! Subsite apply engine.
//!
//! Receives pushes, checks them against the subsite queue, and creates, updates or
//! trashes the local object. Media is handed to the reconciliation queue.

use std::sync::Arc;

use sqlx::SqliteConnection;

use super::media::MediaQueue;
use crate::config::Config;
use crate::db::{
    add_user_to_site, clear_meta_except, delete_content, delete_meta, ensure_term,
    find_by_central_marker, find_term, find_user_by_login_or_email, get_content, get_meta,
    get_subsite_row, insert_content, latest_subsite_row, set_content_status, set_content_terms,
    set_meta, terms_for_content, transition_subsite_row, update_content, ContentFields,
    Repository, RowTransition,
};
use crate::errors::AppError;
use crate::models::{
    slugify, ContentObject, ContentSnapshot, LifecycleAction, LifecycleRequest, OutcomeStatus,
    PushOutcome, QueueStatus, SubsiteQueueEntry, SyncKind, SyncPayload, SyncPolicy,
    CENTRAL_POST_MARKER, PRIMARY_CATEGORY_META, PRIMARY_CATEGORY_SLUG_META, STATUS_TRASH,
    TRASH_STATUS_META, THUMBNAIL_META,
};
use crate::snapshot::{local_value, ResolveContext, META_DENYLIST};

pub const SKIPPED_MESSAGE: &str =
    "The sync setting for this post is disabled, so it will not be synchronized.";
pub const DELETE_NOT_ALLOWED: &str = "Delete action is not allowed on this subsite.";
pub const ALREADY_TRASHED: &str = "This post is already in Trash.";
pub const REMOVED_MESSAGE: &str = "Post successfully removed from subsite.";
pub const APPLY_FAILED_MESSAGE: &str = "Error applying content on subsite.";

/// Result of writing a snapshot to a subsite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedContent {
    pub local_content_id: i64,
    pub created: bool,
}

/// Where a queued row's content comes from.
#[derive(Debug, Clone, Copy)]
pub struct RowSource<'a> {
    pub source_site_id: i64,
    pub content_type: &'a str,
    pub snapshot: &'a ContentSnapshot,
}

pub struct ApplyEngine {
    repo: Arc<Repository>,
    config: Arc<Config>,
    media: MediaQueue,
}

impl ApplyEngine {
    pub fn new(repo: Arc<Repository>, config: Arc<Config>, media: MediaQueue) -> Self {
        Self {
            repo,
            config,
            media,
        }
    }

    /// Handle a push on a subsite.
    pub async fn receive(&self, site_id: i64, payload: &SyncPayload) -> Result<PushOutcome, AppError> {
        if site_id == self.config.central_site_id {
            return Err(AppError::Validation(
                "The central site does not accept pushes".to_string(),
            ));
        }

        if payload.disable_sync {
            let local = self
                .repo
                .find_by_central_marker(site_id, payload.central_content_id)
                .await?;
            tracing::info!(
                "Skipping content {} on site {}: sync disabled",
                payload.central_content_id,
                site_id
            );
            return Ok(PushOutcome::ok(site_id, OutcomeStatus::Skipped, SKIPPED_MESSAGE)
                .with_local_id(local.map(|c| c.id).unwrap_or(0)));
        }

        let policy = self.repo.get_policy(site_id).await?;

        let Some(entry_id) = payload.central_entry_id else {
            return self.receive_direct(site_id, &policy, payload).await;
        };

        let row = match self.repo.subsite_row_for_entry(site_id, entry_id).await? {
            Some(row) => row,
            None => {
                let newer = self
                    .repo
                    .latest_subsite_row(site_id, payload.central_content_id)
                    .await?
                    .filter(|latest| latest.central_entry_id > entry_id);
                if newer.is_some() {
                    return Ok(superseded(site_id));
                }
                return Err(AppError::NotFound(format!(
                    "No queue row for central entry {} on site {}",
                    entry_id, site_id
                )));
            }
        };

        let latest = self
            .repo
            .latest_subsite_row(site_id, row.central_content_id)
            .await?;
        if row.status == QueueStatus::Expired || latest.map(|l| l.id) != Some(row.id) {
            tracing::debug!("Row {} on site {} superseded", row.id, site_id);
            return Ok(superseded(site_id));
        }

        let mode = payload.snapshot.mode;
        match row.status {
            QueueStatus::Pending => {}
            QueueStatus::Synced | QueueStatus::ApprovedApplied => {
                return Ok(PushOutcome::ok(
                    site_id,
                    OutcomeStatus::synced_for(mode),
                    "Already applied.",
                )
                .with_local_id(row.local_content_id));
            }
            QueueStatus::Deleted => {
                return Ok(PushOutcome::ok(site_id, OutcomeStatus::Deleted, REMOVED_MESSAGE)
                    .with_local_id(row.local_content_id));
            }
            QueueStatus::Rejected => {
                return Ok(PushOutcome::ok(
                    site_id,
                    OutcomeStatus::Rejected,
                    "Rejected by a reviewer on the subsite.",
                ));
            }
            QueueStatus::Failed | QueueStatus::Expired => {
                let mut outcome = PushOutcome::failed(
                    site_id,
                    "Apply previously failed on the subsite.",
                    format!("Queue row {} is {}", row.id, row.status.as_str()),
                );
                outcome.local_content_id = Some(row.local_content_id).filter(|id| *id > 0);
                return Ok(outcome);
            }
        }

        if policy.approval_required {
            return Ok(PushOutcome::ok(
                site_id,
                OutcomeStatus::QueuedForApproval,
                "Changes are waiting for approval on the subsite.",
            )
            .with_local_id(row.local_content_id));
        }

        if row.sync_kind == SyncKind::Delete {
            return self.apply_delete_row(site_id, &policy, &row).await;
        }

        let source = RowSource {
            source_site_id: payload.source_site_id,
            content_type: &payload.content_type,
            snapshot: &payload.snapshot,
        };
        match self.apply_row(&policy, &row, source, QueueStatus::Synced, None).await {
            Ok(applied) => Ok(PushOutcome::ok(site_id, OutcomeStatus::synced_for(mode), applied_message(applied))
                .with_local_id(applied.local_content_id)),
            Err(AppError::InvalidState { current_status, .. }) => {
                tracing::info!(
                    "Row {} on site {} became {} before apply, discarding push",
                    row.id,
                    site_id,
                    current_status
                );
                Ok(superseded(site_id))
            }
            Err(e) => self.fail_row(&row, e).await,
        }
    }

    /// Pushes without a queue entry apply straight away.
    async fn receive_direct(
        &self,
        site_id: i64,
        policy: &SyncPolicy,
        payload: &SyncPayload,
    ) -> Result<PushOutcome, AppError> {
        if payload.sync_kind == SyncKind::Delete {
            let local = self
                .repo
                .find_by_central_marker(site_id, payload.central_content_id)
                .await?;
            return Ok(match local {
                Some(local) if policy.delete_on_subsite => {
                    let message = self.trash_local(site_id, local.id).await?;
                    PushOutcome::ok(site_id, OutcomeStatus::Deleted, message).with_local_id(local.id)
                }
                Some(_) => policy_denied(site_id),
                None => PushOutcome::ok(site_id, OutcomeStatus::Skipped, "Post not found!"),
            });
        }

        match self
            .apply_snapshot(
                site_id,
                policy,
                payload.source_site_id,
                payload.central_content_id,
                &payload.content_type,
                &payload.snapshot,
            )
            .await
        {
            Ok(applied) => Ok(PushOutcome::ok(
                site_id,
                OutcomeStatus::synced_for(payload.snapshot.mode),
                applied_message(applied),
            )
            .with_local_id(applied.local_content_id)),
            Err(e) => Ok(PushOutcome::failed(site_id, APPLY_FAILED_MESSAGE, e.to_string())),
        }
    }

    async fn apply_delete_row(
        &self,
        site_id: i64,
        policy: &SyncPolicy,
        row: &SubsiteQueueEntry,
    ) -> Result<PushOutcome, AppError> {
        if !policy.delete_on_subsite {
            return Ok(policy_denied(site_id));
        }

        match self.trash_row(row, None).await {
            Ok(message) => Ok(PushOutcome::ok(site_id, OutcomeStatus::Deleted, message)
                .with_local_id(row.local_content_id)),
            Err(AppError::InvalidState { .. }) => Ok(superseded(site_id)),
            Err(e) => self.fail_row(row, e).await,
        }
    }

    /// Mark a row `failed` after its apply errored. The error becomes the outcome.
    async fn fail_row(&self, row: &SubsiteQueueEntry, error: AppError) -> Result<PushOutcome, AppError> {
        tracing::warn!("Apply of row {} on site {} failed: {}", row.id, row.site_id, error);
        self.repo
            .transition_subsite_row(row.site_id, row.id, QueueStatus::Failed, &RowTransition::default())
            .await?;
        Ok(PushOutcome::failed(row.site_id, APPLY_FAILED_MESSAGE, error.to_string()))
    }

    /// Write a queued row's snapshot and move the row to `to` in one transaction.
    ///
    /// Fails with `InvalidState`, writing nothing, if the row stopped being the
    /// pending, newest row for its content.
    pub async fn apply_row(
        &self,
        policy: &SyncPolicy,
        row: &SubsiteQueueEntry,
        source: RowSource<'_>,
        to: QueueStatus,
        approved_by: Option<i64>,
    ) -> Result<AppliedContent, AppError> {
        let site_id = row.site_id;
        let source_url = self.config.site_url(source.source_site_id);
        let local_url = self.config.site_url(site_id);
        let ctx = ResolveContext {
            site_id,
            source_url: &source_url,
            local_url: &local_url,
        };

        let mut conn = self.repo.begin_immediate().await?;
        let result = async {
            ensure_current(&mut conn, row).await?;
            let applied = write_snapshot(
                &mut conn,
                &ctx,
                policy,
                row.central_content_id,
                source.content_type,
                source.snapshot,
            )
            .await?;
            let transition = RowTransition {
                local_content_id: Some(applied.local_content_id),
                approved_by,
                reject_reason: None,
            };
            close_row(&mut conn, row, to, &transition).await?;
            Ok::<_, AppError>(applied)
        }
        .await;
        let applied = Repository::finish(&mut conn, result).await?;
        drop(conn);

        // Row is committed by now
        if let Err(e) = self
            .after_apply(site_id, policy, source.source_site_id, row.central_content_id, source.snapshot, applied)
            .await
        {
            tracing::error!("Media for row {} on site {} not scheduled: {}", row.id, site_id, e);
        }
        Ok(applied)
    }

    /// Trash the local object behind a delete row and mark the row `deleted` in one
    /// transaction. Same staleness rule as [`ApplyEngine::apply_row`].
    pub async fn trash_row(
        &self,
        row: &SubsiteQueueEntry,
        approved_by: Option<i64>,
    ) -> Result<&'static str, AppError> {
        let mut conn = self.repo.begin_immediate().await?;
        let result = async {
            ensure_current(&mut conn, row).await?;
            let message = trash_in_tx(&mut conn, row.site_id, row.local_content_id).await?;
            let transition = RowTransition {
                approved_by,
                ..Default::default()
            };
            close_row(&mut conn, row, QueueStatus::Deleted, &transition).await?;
            Ok::<_, AppError>(message)
        }
        .await;
        Repository::finish(&mut conn, result).await
    }

    /// Trash a local object, remembering its status for a later restore.
    async fn trash_local(&self, site_id: i64, local_content_id: i64) -> Result<&'static str, AppError> {
        let mut conn = self.repo.begin_immediate().await?;
        let result = trash_in_tx(&mut conn, site_id, local_content_id).await;
        Repository::finish(&mut conn, result).await
    }

    /// Write a snapshot to a subsite: update or create the local object, remap its
    /// relations, then schedule media reconciliation.
    pub async fn apply_snapshot(
        &self,
        site_id: i64,
        policy: &SyncPolicy,
        source_site_id: i64,
        central_content_id: i64,
        content_type: &str,
        snapshot: &ContentSnapshot,
    ) -> Result<AppliedContent, AppError> {
        let source_url = self.config.site_url(source_site_id);
        let local_url = self.config.site_url(site_id);
        let ctx = ResolveContext {
            site_id,
            source_url: &source_url,
            local_url: &local_url,
        };

        let mut conn = self.repo.begin_immediate().await?;
        let result = write_snapshot(&mut conn, &ctx, policy, central_content_id, content_type, snapshot).await;
        let applied = Repository::finish(&mut conn, result).await?;
        drop(conn);

        self.after_apply(site_id, policy, source_site_id, central_content_id, snapshot, applied)
            .await?;
        Ok(applied)
    }

    /// Schedule media reconciliation once the apply is committed.
    async fn after_apply(
        &self,
        site_id: i64,
        policy: &SyncPolicy,
        source_site_id: i64,
        central_content_id: i64,
        snapshot: &ContentSnapshot,
        applied: AppliedContent,
    ) -> Result<(), AppError> {
        if policy.sync_media {
            let media_set = snapshot.media_set(source_site_id);
            self.media
                .schedule(site_id, applied.local_content_id, &media_set)
                .await?;
        }

        tracing::info!(
            "Applied content {} to site {} as {} ({})",
            central_content_id,
            site_id,
            applied.local_content_id,
            if applied.created { "created" } else { "updated" }
        );
        Ok(())
    }

    /// Trash, restore or delete a replicated object on request from central.
    pub async fn lifecycle(
        &self,
        site_id: i64,
        action: LifecycleAction,
        request: &LifecycleRequest,
    ) -> Result<PushOutcome, AppError> {
        let Some(local_id) = request.subsite_post_id.filter(|id| *id > 0) else {
            return Ok(PushOutcome::failed(site_id, "Post ID is missing.", "subsitePostId is required"));
        };
        if !request.delete_on_subsite {
            return Ok(policy_denied(site_id));
        }

        let mut conn = self.repo.begin_immediate().await?;
        let result = async {
            let Some(content) = get_content(&mut conn, local_id)
                .await?
                .filter(|c| c.site_id == site_id)
            else {
                return Ok(PushOutcome::failed(site_id, "Post not found!", format!("No content {} on site {}", local_id, site_id)));
            };

            let outcome = match action {
                LifecycleAction::Trash => {
                    let message = trash_in_tx(&mut conn, site_id, content.id).await?;
                    PushOutcome::ok(site_id, OutcomeStatus::Trashed, message)
                }
                LifecycleAction::Untrash => {
                    restore_in_tx(&mut conn, &content).await?;
                    PushOutcome::ok(site_id, OutcomeStatus::Untrashed, "Post successfully restored on subsite.")
                }
                LifecycleAction::Delete => {
                    delete_content(&mut conn, content.id).await?;
                    PushOutcome::ok(site_id, OutcomeStatus::Deleted, "Post permanently deleted from subsite.")
                }
            };
            Ok::<_, AppError>(outcome.with_local_id(content.id))
        }
        .await;
        Repository::finish(&mut conn, result).await
    }
}

fn superseded(site_id: i64) -> PushOutcome {
    PushOutcome::ok(
        site_id,
        OutcomeStatus::Superseded,
        "A newer change for this post has replaced this one.",
    )
}

fn stale_row(row: &SubsiteQueueEntry, current: Option<QueueStatus>) -> AppError {
    AppError::InvalidState {
        message: format!(
            "Queue row {} is no longer the pending change for content {}",
            row.id, row.central_content_id
        ),
        current_status: current
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|| "missing".to_string()),
    }
}

/// The row must still be pending and the newest row for its content.
async fn ensure_current(conn: &mut SqliteConnection, row: &SubsiteQueueEntry) -> Result<(), AppError> {
    let current = get_subsite_row(conn, row.site_id, row.id)
        .await?
        .map(|r| r.status);
    let latest = latest_subsite_row(conn, row.site_id, row.central_content_id)
        .await?
        .map(|r| r.id);
    match current {
        Some(QueueStatus::Pending) if latest == Some(row.id) => Ok(()),
        Some(QueueStatus::Pending) => Err(stale_row(row, Some(QueueStatus::Expired))),
        other => Err(stale_row(row, other)),
    }
}

async fn close_row(
    conn: &mut SqliteConnection,
    row: &SubsiteQueueEntry,
    to: QueueStatus,
    transition: &RowTransition,
) -> Result<(), AppError> {
    if transition_subsite_row(conn, row.site_id, row.id, to, transition).await? {
        Ok(())
    } else {
        let current = get_subsite_row(conn, row.site_id, row.id).await?.map(|r| r.status);
        Err(stale_row(row, current))
    }
}

fn policy_denied(site_id: i64) -> PushOutcome {
    PushOutcome {
        success: false,
        site_id,
        status: OutcomeStatus::PolicyDenied,
        message: DELETE_NOT_ALLOWED.to_string(),
        debug_message: None,
        local_content_id: None,
    }
}

pub fn applied_message(applied: AppliedContent) -> &'static str {
    if applied.created {
        "Post successfully created on the subsite."
    } else {
        "Post successfully updated on the subsite."
    }
}

async fn trash_in_tx(
    conn: &mut SqliteConnection,
    site_id: i64,
    local_content_id: i64,
) -> Result<&'static str, AppError> {
    let content = get_content(conn, local_content_id)
        .await?
        .filter(|c| c.site_id == site_id)
        .ok_or_else(|| AppError::NotFound("Post not found!".to_string()))?;

    if content.status == STATUS_TRASH {
        return Ok(ALREADY_TRASHED);
    }
    set_meta(conn, content.id, TRASH_STATUS_META, &content.status.clone().into(), None).await?;
    set_content_status(conn, content.id, STATUS_TRASH).await?;
    Ok(REMOVED_MESSAGE)
}

async fn restore_in_tx(conn: &mut SqliteConnection, content: &ContentObject) -> Result<(), AppError> {
    if content.status != STATUS_TRASH {
        return Ok(());
    }
    let previous = match get_meta(conn, content.id, TRASH_STATUS_META).await? {
        Some(serde_json::Value::String(status)) if status != STATUS_TRASH => status,
        _ => "draft".to_string(),
    };
    set_content_status(conn, content.id, &previous).await?;
    delete_meta(conn, content.id, TRASH_STATUS_META).await
}

async fn write_snapshot(
    conn: &mut SqliteConnection,
    ctx: &ResolveContext<'_>,
    policy: &SyncPolicy,
    central_content_id: i64,
    content_type: &str,
    snapshot: &ContentSnapshot,
) -> Result<AppliedContent, AppError> {
    let site_id = ctx.site_id;
    let existing = find_by_central_marker(conn, site_id, central_content_id).await?;

    let mut author_id = None;
    if policy.sync_users {
        if let Some(author) = &snapshot.author {
            if let Some(user) = find_user_by_login_or_email(conn, &author.login, &author.email).await? {
                add_user_to_site(conn, site_id, user.id).await?;
                author_id = Some(user.id);
            }
        }
    }

    let fields = ContentFields {
        content_type: content_type.to_string(),
        title: snapshot.title.clone(),
        slug: snapshot.slug.clone(),
        body: snapshot.body.clone(),
        body_filtered: snapshot.body_filtered.clone(),
        status: snapshot.status.clone(),
        author_id,
    };

    let (local_id, created) = match &existing {
        Some(content) => {
            update_content(conn, content.id, &fields).await?;
            (content.id, false)
        }
        None => (insert_content(conn, site_id, &fields).await?, true),
    };
    set_meta(conn, local_id, CENTRAL_POST_MARKER, &central_content_id.into(), None).await?;

    // Own term assignments: matched by slug, created when missing
    let current_terms = terms_for_content(conn, local_id).await?;
    for (taxonomy, inputs) in &snapshot.taxonomy_terms {
        if !policy.allows_taxonomy(taxonomy) {
            continue;
        }
        let mut ids = Vec::with_capacity(inputs.len());
        for input in inputs {
            let slug = input
                .slug
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| slugify(&input.name));
            ids.push(ensure_term(conn, site_id, taxonomy, &input.name, &slug).await?.id);
        }
        set_content_terms(conn, local_id, taxonomy, &ids).await?;
    }
    for taxonomy in current_terms.keys() {
        if policy.allows_taxonomy(taxonomy) && !snapshot.taxonomy_terms.contains_key(taxonomy) {
            set_content_terms(conn, local_id, taxonomy, &[]).await?;
        }
    }

    if policy.sync_post_meta {
        clear_meta_except(conn, local_id, META_DENYLIST).await?;
        for (key, value) in &snapshot.meta_fields {
            set_meta(conn, local_id, key, value, None).await?;
        }
        // Primary category travels as a slug; store the local term id when it exists
        if let Some(serde_json::Value::String(slug)) = snapshot.meta_fields.get(PRIMARY_CATEGORY_SLUG_META) {
            if let Some(term) = find_term(conn, site_id, "category", slug).await? {
                set_meta(conn, local_id, PRIMARY_CATEGORY_META, &term.id.into(), None).await?;
                delete_meta(conn, local_id, PRIMARY_CATEGORY_SLUG_META).await?;
            }
        }
        for (key, field) in &snapshot.relational_fields {
            if let Some(value) = local_value(conn, ctx, field).await? {
                set_meta(conn, local_id, key, &value, Some(field.kind)).await?;
            }
        }
    }

    if policy.sync_media && snapshot.featured_image.is_none() {
        delete_meta(conn, local_id, THUMBNAIL_META).await?;
    }

    Ok(AppliedContent {
        local_content_id: local_id,
        created,
    })
}
