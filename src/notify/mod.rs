//! Reviewer notifications.
//!
//! Delivery is fire-and-forget: callers log failures and carry on.

use std::sync::Arc;

use async_trait::async_trait;

use crate::db::Repository;
use crate::errors::AppError;

/// A message for one or more recipients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), AppError>;
}

/// Writes notifications to the outbox table for an external mailer to pick up.
pub struct OutboxNotifier {
    repo: Arc<Repository>,
}

impl OutboxNotifier {
    pub fn new(repo: Arc<Repository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl Notifier for OutboxNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), AppError> {
        if notification.recipients.is_empty() {
            return Ok(());
        }

        let id = self
            .repo
            .queue_notification(
                &notification.recipients,
                &notification.subject,
                &notification.body,
            )
            .await?;

        tracing::info!(
            outbox_id = id,
            recipients = notification.recipients.len(),
            "Queued notification: {}",
            notification.subject
        );
        Ok(())
    }
}

/// Deduplicate and drop empty addresses, keeping first-seen order.
pub fn unique_recipients<I>(candidates: I) -> Vec<String>
where
    I: IntoIterator<Item = Option<String>>,
{
    let mut out: Vec<String> = Vec::new();
    for email in candidates.into_iter().flatten() {
        let email = email.trim().to_string();
        if !email.is_empty() && !out.iter().any(|e| e.eq_ignore_ascii_case(&email)) {
            out.push(email);
        }
    }
    out
}
