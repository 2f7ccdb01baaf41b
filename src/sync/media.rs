//! Deferred media reconciliation.
//!
//! Applies schedule a job per (site, object, media set). A single background worker
//! copies the files into the subsite's upload root, registers cross-referenced
//! attachments, then rewrites the body and featured image in one write transaction.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::db::{
    find_attachment_by_central_id, find_user_by_login_or_email, get_attachment, get_content,
    insert_cross_referenced_attachment, set_meta, update_body_unfiltered, MediaJob, NewAttachment,
    Repository,
};
use crate::errors::AppError;
use crate::models::{MediaRef, MediaSet, THUMBNAIL_META};
use crate::snapshot::strip_query;

static IMAGE_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<!--\s*wp:image(\s+\{.*?\})?\s*-->(.*?)<!--\s*/wp:image\s*-->")
        .expect("valid regex")
});
static IMG_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<img\b[^>]*>").expect("valid regex"));
static ATTRIBUTE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([a-zA-Z_:][-a-zA-Z0-9_:.]*)\s*=\s*"([^"]*)""#).expect("valid regex")
});
static WP_IMAGE_CLASS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bwp-image-\d+\b").expect("valid regex"));

/// Block attributes carried over from the source block.
const KEPT_BLOCK_ATTRS: &[&str] = &["width", "height", "className", "align"];

/// A central upload resolved on the receiving site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMedia {
    pub attachment_id: i64,
    pub url: String,
}

/// Handle used by the apply engine to schedule reconciliation.
#[derive(Clone)]
pub struct MediaQueue {
    repo: Arc<Repository>,
    notify: Arc<Notify>,
}

impl MediaQueue {
    pub fn new(repo: Arc<Repository>) -> Self {
        Self {
            repo,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Schedule a job for a media set. Empty sets and pending duplicates are skipped.
    pub async fn schedule(
        &self,
        site_id: i64,
        content_id: i64,
        media_set: &MediaSet,
    ) -> Result<Option<i64>, AppError> {
        if media_set.is_empty() {
            return Ok(None);
        }
        let job = self
            .repo
            .schedule_media_job(site_id, content_id, media_set)
            .await?;
        match job {
            Some(id) => {
                tracing::debug!("Scheduled media job {} for content {} on site {}", id, content_id, site_id);
                self.notify.notify_one();
            }
            None => tracing::debug!(
                "Media job for content {} on site {} already pending",
                content_id,
                site_id
            ),
        }
        Ok(job)
    }

    /// Worker draining this queue.
    pub fn worker(&self, config: Arc<Config>) -> MediaWorker {
        MediaWorker {
            repo: self.repo.clone(),
            config,
            notify: self.notify.clone(),
        }
    }
}

pub struct MediaWorker {
    repo: Arc<Repository>,
    config: Arc<Config>,
    notify: Arc<Notify>,
}

impl MediaWorker {
    /// Run the worker until the runtime shuts down.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self) {
        match self.repo.requeue_running_media_jobs().await {
            Ok(0) => {}
            Ok(n) => tracing::info!("Requeued {} interrupted media jobs", n),
            Err(e) => tracing::error!("Failed to requeue media jobs: {}", e),
        }

        loop {
            match self.run_once().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => tracing::error!("Media worker error: {}", e),
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.config.media_poll_interval) => {}
            }
        }
    }

    /// Process one job. Returns false when the queue is empty.
    pub async fn run_once(&self) -> Result<bool, AppError> {
        let Some(job) = self.repo.claim_media_job().await? else {
            return Ok(false);
        };

        match reconcile(&self.repo, &self.config, &job).await {
            Ok(rewritten) => {
                tracing::info!(
                    "Media job {} done: {} references rewritten on content {} (site {})",
                    job.id,
                    rewritten,
                    job.subsite_content_id,
                    job.site_id
                );
                self.repo.complete_media_job(job.id).await?;
            }
            Err(e) => {
                tracing::warn!("Media job {} attempt {} failed: {}", job.id, job.attempts, e);
                self.repo.fail_media_job(&job, &e.to_string()).await?;
            }
        }
        Ok(true)
    }

    /// Process jobs until none are pending.
    pub async fn drain(&self) -> Result<usize, AppError> {
        let mut processed = 0;
        while self.run_once().await? {
            processed += 1;
        }
        Ok(processed)
    }
}

/// Reconcile one job. Returns the number of body references rewritten.
pub async fn reconcile(repo: &Repository, config: &Config, job: &MediaJob) -> Result<usize, AppError> {
    let site_id = job.site_id;
    let set = &job.media_set;

    if repo.get_content(job.subsite_content_id).await?.is_none() {
        tracing::debug!("Content {} is gone; nothing to reconcile", job.subsite_content_id);
        return Ok(0);
    }

    let refs = set.featured_image.iter().chain(set.content_media.iter());
    let mut resolved: HashMap<String, LocalMedia> = HashMap::new();
    for media in refs {
        if resolved.contains_key(&media.url) {
            continue;
        }
        match resolve_media(repo, config, site_id, set.source_site_id, job.subsite_content_id, media).await {
            Ok(local) => {
                resolved.insert(media.url.clone(), local);
            }
            Err(e) => tracing::warn!(
                "Could not resolve {} for content {} on site {}: {}",
                media.url,
                job.subsite_content_id,
                site_id,
                e
            ),
        }
    }

    let expected = set.content_media.len() + usize::from(set.featured_image.is_some());
    if expected > 0 && resolved.is_empty() {
        return Err(AppError::Storage(format!(
            "None of the {} media references could be resolved",
            expected
        )));
    }

    let central_uploads = config.uploads_url(set.source_site_id);
    let mut conn = repo.begin_immediate().await?;
    let result = async {
        // Re-read inside the transaction: a newer apply may have replaced the body
        let Some(content) = get_content(&mut conn, job.subsite_content_id).await? else {
            return Ok(0);
        };

        let (body, rewritten) = rewrite_body(&content.body, &central_uploads, |url| {
            resolved.get(url).cloned()
        });
        if rewritten > 0 {
            update_body_unfiltered(&mut conn, content.id, &body).await?;
        }

        if let Some(featured) = &set.featured_image {
            if let Some(local) = resolved.get(&featured.url) {
                set_meta(&mut conn, content.id, THUMBNAIL_META, &local.attachment_id.into(), None).await?;
            }
        }
        Ok::<_, AppError>(rewritten)
    }
    .await;
    Repository::finish(&mut conn, result).await
}

/// Find or create the local attachment for a central upload and make sure the
/// referenced file exists in the subsite's upload root.
async fn resolve_media(
    repo: &Repository,
    config: &Config,
    site_id: i64,
    source_site_id: i64,
    parent_id: i64,
    media: &MediaRef,
) -> Result<LocalMedia, AppError> {
    let central_dir = config.uploads_dir(source_site_id);
    let local_dir = config.uploads_dir(site_id);
    let local_uploads = config.uploads_url(site_id);

    let mut conn = repo.pool().acquire().await?;
    let attachment = match find_attachment_by_central_id(&mut conn, site_id, media.central_attachment_id).await? {
        Some(existing) => existing,
        None => {
            let file_path = match get_attachment(&mut conn, media.central_attachment_id).await? {
                Some(central) if central.site_id == source_site_id => central.file_path,
                _ => media.source_path.clone(),
            };
            copy_upload(&central_dir, &local_dir, &file_path).await?;

            let author_id = match &media.author {
                Some(author) => find_user_by_login_or_email(&mut conn, &author.login, &author.email)
                    .await?
                    .map(|u| u.id),
                None => None,
            };
            insert_cross_referenced_attachment(
                &mut conn,
                &NewAttachment {
                    site_id,
                    url: format!("{}/{}", local_uploads, file_path),
                    file_path,
                    author_id,
                    parent_id: Some(parent_id),
                    central_attachment_id: Some(media.central_attachment_id),
                },
                media.central_attachment_id,
            )
            .await?
        }
    };
    drop(conn);

    // Sized variants keep their own file next to the full-size one
    if media.source_path == attachment.file_path {
        return Ok(LocalMedia {
            attachment_id: attachment.id,
            url: attachment.url,
        });
    }
    match copy_upload(&central_dir, &local_dir, &media.source_path).await {
        Ok(()) => Ok(LocalMedia {
            attachment_id: attachment.id,
            url: format!("{}/{}", local_uploads, media.source_path),
        }),
        Err(e) => {
            tracing::warn!("Variant {} unavailable, using full size: {}", media.source_path, e);
            Ok(LocalMedia {
                attachment_id: attachment.id,
                url: attachment.url,
            })
        }
    }
}

/// Copy `relative` from one upload root to another unless it is already there.
async fn copy_upload(from_root: &Path, to_root: &Path, relative: &str) -> Result<(), AppError> {
    if relative.is_empty() || relative.split('/').any(|seg| seg == ".." || seg.is_empty()) {
        return Err(AppError::Storage(format!("Invalid upload path: {}", relative)));
    }
    let target = to_root.join(relative);
    if tokio::fs::try_exists(&target).await? {
        return Ok(());
    }
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let source = from_root.join(relative);
    tokio::fs::copy(&source, &target).await.map_err(|e| {
        AppError::Storage(format!("Copying {} failed: {}", source.display(), e))
    })?;
    Ok(())
}

/// Rewrite central upload references in a body.
///
/// Image blocks get a fresh attribute comment and `<img>` tag carrying the local
/// attachment id; other `<img>` tags only get their `src` swapped. Query strings,
/// alt text, inline styles and figure markup are kept. URLs the lookup does not
/// know are left alone. Returns the new body and the number of rewrites.
pub fn rewrite_body<F>(body: &str, central_uploads_url: &str, lookup: F) -> (String, usize)
where
    F: Fn(&str) -> Option<LocalMedia>,
{
    let prefix = format!("{}/", central_uploads_url);
    let resolve = |src: &str| -> Option<(LocalMedia, String)> {
        let bare = strip_query(src);
        if !bare.starts_with(&prefix) {
            return None;
        }
        let local = lookup(bare)?;
        let suffix = src[bare.len()..].to_string();
        Some((local, suffix))
    };

    let mut count = 0;
    let blocks_done = IMAGE_BLOCK.replace_all(body, |caps: &Captures| {
        let whole = caps.get(0).map_or("", |m| m.as_str());
        let inner = caps.get(2).map_or("", |m| m.as_str());
        let Some(img) = IMG_TAG.find(inner) else {
            return whole.to_string();
        };
        let attrs = attributes(img.as_str());
        let Some((local, suffix)) = attrs.get("src").and_then(|src| resolve(src.as_str())) else {
            return whole.to_string();
        };
        count += 1;

        let source_attrs: Map<String, Value> = caps
            .get(1)
            .and_then(|m| serde_json::from_str(m.as_str().trim()).ok())
            .unwrap_or_default();
        let mut block_attrs = Map::new();
        block_attrs.insert("id".to_string(), Value::from(local.attachment_id));
        for key in KEPT_BLOCK_ATTRS {
            if let Some(value) = source_attrs.get(*key) {
                block_attrs.insert(key.to_string(), value.clone());
            }
        }
        block_attrs.insert(
            "sizeSlug".to_string(),
            source_attrs
                .get("sizeSlug")
                .cloned()
                .unwrap_or_else(|| Value::from("full")),
        );
        block_attrs.insert(
            "linkDestination".to_string(),
            source_attrs
                .get("linkDestination")
                .cloned()
                .unwrap_or_else(|| Value::from("none")),
        );

        let mut tag = format!(
            r#"<img src="{}{}" alt="{}" class="wp-image-{}""#,
            local.url,
            suffix,
            attrs.get("alt").map(String::as_str).unwrap_or(""),
            local.attachment_id
        );
        if let Some(style) = attrs.get("style") {
            tag.push_str(&format!(r#" style="{}""#, style));
        }
        tag.push_str("/>");

        let new_inner = format!("{}{}{}", &inner[..img.start()], tag, &inner[img.end()..]);
        format!(
            "<!-- wp:image {} -->{}<!-- /wp:image -->",
            Value::Object(block_attrs),
            new_inner
        )
    });

    let mut bare_count = 0;
    let result = IMG_TAG.replace_all(&blocks_done, |caps: &Captures| {
        let tag = caps.get(0).map_or("", |m| m.as_str());
        let Some(src) = attribute_value(tag, "src") else {
            return tag.to_string();
        };
        let Some((local, suffix)) = resolve(src.as_str()) else {
            return tag.to_string();
        };
        bare_count += 1;

        let swapped = format!(
            "{}{}{}{}",
            &tag[..src.start()],
            local.url,
            suffix,
            &tag[src.end()..]
        );
        WP_IMAGE_CLASS
            .replace(&swapped, format!("wp-image-{}", local.attachment_id).as_str())
            .into_owned()
    });

    (result.into_owned(), count + bare_count)
}

/// Value of one double-quoted attribute, matching the name case-insensitively.
fn attribute_value<'t>(tag: &'t str, name: &str) -> Option<regex::Match<'t>> {
    ATTRIBUTE
        .captures_iter(tag)
        .find(|caps| caps.get(1).is_some_and(|key| key.as_str().eq_ignore_ascii_case(name)))
        .and_then(|caps| caps.get(2))
}

/// Double-quoted attributes of a tag, keys lowercased.
fn attributes(tag: &str) -> HashMap<String, String> {
    ATTRIBUTE
        .captures_iter(tag)
        .filter_map(|caps| {
            let key = caps.get(1)?.as_str().to_ascii_lowercase();
            let value = caps.get(2)?.as_str().to_string();
            Some((key, value))
        })
        .collect()
}
