//! Fire-and-forget delivery of backup events.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use keeper_types::BackupId;

use crate::config::NotificationsConfig;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Success,
    Failure,
    Warning,
    Summary,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Success => "success",
            EventKind::Failure => "failure",
            EventKind::Warning => "warning",
            EventKind::Summary => "summary",
        }
    }
}

/// Structured event data. Formatting is left to whoever receives it.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<BackupId>,
    pub at: DateTime<Utc>,
    pub details: serde_json::Value,
}

impl Event {
    pub fn new(kind: EventKind, backup_id: Option<BackupId>, details: serde_json::Value) -> Self {
        Self {
            kind,
            backup_id,
            at: Utc::now(),
            details,
        }
    }
}

/// A delivery channel. Implementations swallow their own failures.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, event: &Event);

    /// Check the channel is usable, without sending anything.
    async fn probe(&self) -> Result<(), String> {
        Ok(())
    }
}

pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, event: &Event) {
        let id = event.backup_id.as_ref().map(|i| i.as_str()).unwrap_or("-");
        match event.kind {
            EventKind::Failure => {
                tracing::error!(event = event.kind.as_str(), backup_id = %id, details = %event.details, "backup event")
            }
            EventKind::Warning => {
                tracing::warn!(event = event.kind.as_str(), backup_id = %id, details = %event.details, "backup event")
            }
            EventKind::Success | EventKind::Summary => {
                tracing::info!(event = event.kind.as_str(), backup_id = %id, details = %event.details, "backup event")
            }
        }
    }
}

/// POSTs each event as JSON.
pub struct WebhookNotifier {
    url: String,
    agent: ureq::Agent,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            agent: ureq::AgentBuilder::new().timeout(WEBHOOK_TIMEOUT).build(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn notify(&self, event: &Event) {
        let body = match serde_json::to_value(event) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode notification");
                return;
            }
        };
        let agent = self.agent.clone();
        let url = self.url.clone();
        let kind = event.kind;
        // Detached: callers never wait on the endpoint.
        tokio::task::spawn_blocking(move || match agent.post(&url).send_json(body) {
            Ok(_) => tracing::debug!(event = kind.as_str(), "webhook delivered"),
            Err(e) => tracing::warn!(event = kind.as_str(), error = %e, "webhook delivery failed"),
        });
    }

    async fn probe(&self) -> Result<(), String> {
        url_host(&self.url)
            .map(|_| ())
            .ok_or_else(|| format!("webhook url '{}' is not an http(s) url", self.url))
    }
}

fn url_host(url: &str) -> Option<&str> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let host = rest.split(['/', '?', '#']).next()?;
    (!host.is_empty()).then_some(host)
}

/// Fan-out over the configured channels, filtered by event kind.
#[derive(Clone)]
pub struct Notifications {
    channels: Vec<Arc<dyn Notifier>>,
    config: NotificationsConfig,
}

impl Notifications {
    pub fn new(channels: Vec<Arc<dyn Notifier>>, config: NotificationsConfig) -> Self {
        Self { channels, config }
    }

    pub fn from_config(config: &NotificationsConfig) -> Self {
        let mut channels: Vec<Arc<dyn Notifier>> = Vec::new();
        if config.log {
            channels.push(Arc::new(LogNotifier));
        }
        if let Some(url) = config.webhook_url.as_deref().filter(|u| !u.is_empty()) {
            channels.push(Arc::new(WebhookNotifier::new(url)));
        }
        Self::new(channels, config.clone())
    }

    fn wants(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::Success => self.config.on_success,
            EventKind::Failure => self.config.on_failure,
            EventKind::Warning => self.config.on_warning,
            EventKind::Summary => self.config.on_summary,
        }
    }

    pub async fn notify(&self, event: Event) {
        if !self.wants(event.kind) {
            return;
        }
        for channel in &self.channels {
            channel.notify(&event).await;
        }
    }

    pub async fn probe(&self) -> Vec<(String, Result<(), String>)> {
        let mut out = Vec::new();
        for channel in &self.channels {
            out.push((channel.name().to_string(), channel.probe().await));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::RecordingNotifier;

    #[tokio::test]
    async fn disabled_kinds_are_filtered() {
        let recorder = Arc::new(RecordingNotifier::default());
        let config = NotificationsConfig {
            on_success: false,
            ..NotificationsConfig::default()
        };
        let notifications = Notifications::new(vec![recorder.clone()], config);
        notifications
            .notify(Event::new(EventKind::Success, None, serde_json::json!({})))
            .await;
        notifications
            .notify(Event::new(EventKind::Failure, None, serde_json::json!({"error": "x"})))
            .await;
        let kinds: Vec<_> = recorder.events().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Failure]);
    }

    #[tokio::test]
    async fn webhook_does_not_wait_for_slow_endpoint() {
        // Accepts connections into the backlog but never answers.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());
        let notifier = WebhookNotifier::new(url);
        let event = Event::new(EventKind::Failure, None, serde_json::json!({"error": "x"}));

        let sent = tokio::time::timeout(Duration::from_secs(2), notifier.notify(&event)).await;
        assert!(sent.is_ok(), "notify blocked on the endpoint");
        drop(listener);
    }

    #[test]
    fn webhook_url_validation() {
        assert_eq!(url_host("https://hooks.example.com/x"), Some("hooks.example.com"));
        assert_eq!(url_host("http://10.0.0.1:8080"), Some("10.0.0.1:8080"));
        assert_eq!(url_host("ftp://x"), None);
        assert_eq!(url_host("https://"), None);
    }

    #[test]
    fn event_json_shape() {
        let id = BackupId::parse("backup-2024-01-01T00-00-00-000Z-0000abcd").unwrap();
        let event = Event::new(EventKind::Warning, Some(id), serde_json::json!({"warnings": ["r"]}));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "warning");
        assert_eq!(json["backup_id"], "backup-2024-01-01T00-00-00-000Z-0000abcd");
        assert_eq!(json["details"]["warnings"][0], "r");
    }
}
