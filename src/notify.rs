use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::Notifiers;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ThresholdBreach,
    MaintenanceFailure,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub cluster: String,
    pub subject: String,
    pub body: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub raised_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        kind: NotificationKind,
        cluster: &str,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            cluster: cluster.to_string(),
            subject: subject.into(),
            body: body.into(),
            raised_at: Utc::now(),
        }
    }
}

/// Outbound alert channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;
    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Writes notifications to the log when no channel is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        warn!(
            kind = ?notification.kind,
            cluster = %notification.cluster,
            subject = %notification.subject,
            body = %notification.body,
            "notification"
        );
        Ok(())
    }
}

/// Posts notifications as JSON to a webhook endpoint.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build webhook client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        self.client
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .context("webhook request failed")?
            .error_for_status()
            .context("webhook rejected notification")?;
        Ok(())
    }
}

pub fn from_config(config: &Notifiers) -> Result<Arc<dyn Notifier>> {
    match &config.webhook_url {
        Some(url) => {
            info!("webhook notifications enabled");
            Ok(Arc::new(WebhookNotifier::new(url.clone(), config.webhook_timeout)?))
        }
        None => Ok(Arc::new(LogNotifier)),
    }
}

/// Sends in the background; delivery failures are logged and never reach the caller.
pub fn dispatch(notifier: Arc<dyn Notifier>, notification: Notification) {
    tokio::spawn(async move {
        if let Err(err) = notifier.send(&notification).await {
            warn!(
                channel = notifier.name(),
                subject = %notification.subject,
                error = ?err,
                "notification delivery failed"
            );
        }
    });
}
