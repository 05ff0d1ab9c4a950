// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Delivery of account e-mails (verification links, password resets).
//!
//! The service does not speak SMTP. It posts a JSON notification to a
//! webhook owned by the mail relay, which renders and sends the message.
//! Without a webhook, notifications are dropped with a warning and accounts
//! can still be verified by an administrator.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    VerifyEmail,
    PasswordReset,
}

/// One message for the mail relay. `token` is the secret the recipient
/// presents back to the service; it is never logged.
#[derive(Clone, Serialize)]
pub struct AccountNotification {
    pub kind: NotificationKind,
    pub principal_id: String,
    pub recipient: String,
    pub display_name: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for AccountNotification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountNotification")
            .field("kind", &self.kind)
            .field("principal_id", &self.principal_id)
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification request failed: {0}")]
    Request(String),

    #[error("notification webhook returned {0}")]
    Rejected(u16),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: AccountNotification) -> Result<(), NotifyError>;
}

/// Posts notifications as JSON to a mail relay webhook.
pub struct WebhookNotifier {
    url: String,
    http: Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| NotifyError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { url: url.into(), http })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, notification: AccountNotification) -> Result<(), NotifyError> {
        let response = self
            .http
            .post(&self.url)
            .json(&notification)
            .send()
            .await
            .map_err(|e| NotifyError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected(status.as_u16()));
        }
        debug!(principal_id = %notification.principal_id, kind = ?notification.kind, "Notification delivered");
        Ok(())
    }
}

/// Used when no webhook is configured.
pub struct DisabledNotifier;

#[async_trait]
impl Notifier for DisabledNotifier {
    async fn send(&self, notification: AccountNotification) -> Result<(), NotifyError> {
        warn!(
            principal_id = %notification.principal_id,
            kind = ?notification.kind,
            "No notification webhook configured, dropping account e-mail"
        );
        Ok(())
    }
}

/// Keeps every notification in memory.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<AccountNotification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<AccountNotification> {
        self.sent.lock().await.clone()
    }

    /// Token of the most recent notification of `kind` sent to `recipient`.
    pub async fn last_token(&self, kind: NotificationKind, recipient: &str) -> Option<String> {
        self.sent
            .lock()
            .await
            .iter()
            .rev()
            .find(|n| n.kind == kind && n.recipient == recipient)
            .map(|n| n.token.clone())
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: AccountNotification) -> Result<(), NotifyError> {
        self.sent.lock().await.push(notification);
        Ok(())
    }
}
