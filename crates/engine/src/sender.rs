//! Channel-specific payload rendering and outbound delivery.
//!
//! Rendering is pure and unit-testable; the HTTP side lives behind the
//! `NotificationSender` trait so dispatcher tests can count outbound
//! calls without a network.

use std::time::Duration;

use async_trait::async_trait;
use ledger_core::{AlertEvent, AlertKind, ChannelKind, NotificationTask};
use serde_json::json;

const SENDGRID_URL: &str = "https://api.sendgrid.com/v3/mail/send";

#[derive(Debug, thiserror::Error)]
#[error("delivery failed: {0}")]
pub struct SendFailure(pub String);

#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, task: &NotificationTask, alert: &AlertEvent) -> Result<(), SendFailure>;
}

fn alert_title(kind: AlertKind) -> &'static str {
    match kind {
        AlertKind::ApproachingLimit => "Budget approaching limit",
        AlertKind::LimitExceeded => "Budget limit exceeded",
        AlertKind::UnusualActivity => "Unusual usage activity",
        AlertKind::SyncFailure => "Usage sync failure",
    }
}

fn theme_color(kind: AlertKind) -> &'static str {
    match kind {
        AlertKind::LimitExceeded => "cc0000",
        AlertKind::ApproachingLimit | AlertKind::UnusualActivity => "e8a317",
        AlertKind::SyncFailure => "5b5b5b",
    }
}

/// Body posted to the channel. Email renders the SendGrid envelope; the
/// generic webhook channel forwards the alert itself.
pub fn render_payload(
    task: &NotificationTask,
    alert: &AlertEvent,
    email_from: &str,
) -> serde_json::Value {
    let title = alert_title(alert.kind);
    match task.channel {
        ChannelKind::Slack => json!({
            "text": alert.message,
            "blocks": [{
                "type": "section",
                "text": {"type": "mrkdwn", "text": format!("*{title}*\n{}", alert.message)},
            }],
        }),
        ChannelKind::Discord => json!({
            "content": format!("**{title}**\n{}", alert.message),
        }),
        ChannelKind::Teams => json!({
            "@type": "MessageCard",
            "@context": "http://schema.org/extensions",
            "summary": title,
            "themeColor": theme_color(alert.kind),
            "title": title,
            "text": alert.message,
        }),
        ChannelKind::Email => json!({
            "personalizations": [{"to": [{"email": task.recipient}]}],
            "from": {"email": email_from},
            "subject": title,
            "content": [{"type": "text/plain", "value": alert.message}],
        }),
        ChannelKind::Webhook => json!({
            "event": "alert",
            "alert": alert,
        }),
    }
}

#[derive(Debug, Clone)]
pub struct HttpSenderConfig {
    pub send_timeout: Duration,
    pub email_from: String,
    /// SendGrid API key; email tasks fail rendering-side when unset.
    pub sendgrid_api_key: Option<String>,
}

pub struct HttpSender {
    client: reqwest::Client,
    config: HttpSenderConfig,
}

impl HttpSender {
    pub fn new(config: HttpSenderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl NotificationSender for HttpSender {
    async fn send(&self, task: &NotificationTask, alert: &AlertEvent) -> Result<(), SendFailure> {
        let payload = render_payload(task, alert, &self.config.email_from);
        let mut request = match task.channel {
            ChannelKind::Email => {
                let key = self
                    .config
                    .sendgrid_api_key
                    .as_deref()
                    .ok_or_else(|| SendFailure("no email provider key configured".to_string()))?;
                self.client.post(SENDGRID_URL).bearer_auth(key)
            }
            _ => self.client.post(&task.recipient),
        };
        request = request.timeout(self.config.send_timeout).json(&payload);

        let response = request
            .send()
            .await
            .map_err(|err| SendFailure(err.to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(SendFailure(format!("upstream returned {status}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_alert(kind: AlertKind) -> AlertEvent {
        AlertEvent {
            id: 1,
            account_id: 2,
            kind,
            threshold_pct: 80,
            observed_pct: None,
            message: "prod is approaching its monthly budget".to_string(),
            acknowledged: false,
            created_at: "2026-02-10T12:00:00+00:00".to_string(),
            last_triggered_at: "2026-02-10T12:00:00+00:00".to_string(),
        }
    }

    fn sample_task(channel: ChannelKind, recipient: &str) -> NotificationTask {
        NotificationTask {
            id: 1,
            alert_id: 1,
            user_id: 1,
            channel,
            recipient: recipient.to_string(),
            priority: 1,
            status: ledger_core::TaskStatus::Pending,
            attempts: 0,
            max_attempts: 3,
            last_error: None,
            sent_at: None,
            created_at: "2026-02-10T12:00:00+00:00".to_string(),
        }
    }

    #[test]
    fn slack_payload_has_text_and_blocks() {
        let alert = sample_alert(AlertKind::ApproachingLimit);
        let task = sample_task(ChannelKind::Slack, "https://hooks.slack.com/services/T/B/x");
        let payload = render_payload(&task, &alert, "alerts@example.com");
        assert_eq!(payload["text"], alert.message);
        assert!(payload["blocks"].is_array());
    }

    #[test]
    fn teams_payload_is_a_message_card() {
        let alert = sample_alert(AlertKind::LimitExceeded);
        let task = sample_task(ChannelKind::Teams, "https://t.webhook.office.com/x");
        let payload = render_payload(&task, &alert, "alerts@example.com");
        assert_eq!(payload["@type"], "MessageCard");
        assert_eq!(payload["themeColor"], "cc0000");
    }

    #[test]
    fn email_payload_addresses_the_recipient() {
        let alert = sample_alert(AlertKind::SyncFailure);
        let task = sample_task(ChannelKind::Email, "ops@example.com");
        let payload = render_payload(&task, &alert, "alerts@example.com");
        assert_eq!(
            payload["personalizations"][0]["to"][0]["email"],
            "ops@example.com"
        );
        assert_eq!(payload["from"]["email"], "alerts@example.com");
    }

    #[test]
    fn generic_webhook_forwards_the_alert() {
        let alert = sample_alert(AlertKind::UnusualActivity);
        let task = sample_task(ChannelKind::Webhook, "https://ops.example.com/hooks/usage");
        let payload = render_payload(&task, &alert, "alerts@example.com");
        assert_eq!(payload["event"], "alert");
        assert_eq!(payload["alert"]["message"], alert.message);
    }
}
