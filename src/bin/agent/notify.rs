//! Alerts through a chat bot webhook (`POST {url}/send`).

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{info, warn};

use seek_agent::error::NotificationFailure;
use seek_agent::{Notification, Notifier};

#[derive(Serialize)]
struct SendMessage<'a> {
    phone: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<&'a str>,
}

pub struct WebhookNotifier {
    client: Client,
    endpoint: String,
    default_recipient: Option<String>,
}

impl WebhookNotifier {
    pub fn new(client: Client, base_url: &str, default_recipient: Option<String>) -> Self {
        Self {
            client,
            endpoint: format!("{}/send", base_url.trim_end_matches('/')),
            default_recipient,
        }
    }

    async fn deliver(&self, notification: &Notification) -> Result<(), NotificationFailure> {
        let phone = notification
            .recipient
            .as_deref()
            .or(self.default_recipient.as_deref())
            .ok_or(NotificationFailure::NoRecipient)?;

        let response = self
            .client
            .post(&self.endpoint)
            .json(&SendMessage {
                phone,
                message: &notification.message,
                image: notification.attachment.as_deref(),
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotificationFailure::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        info!(phone, "alert delivered");
        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, notification: &Notification) -> bool {
        match self.deliver(notification).await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "alert not delivered");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_recipient_is_reported_as_not_delivered() {
        let notifier = WebhookNotifier::new(Client::new(), "http://127.0.0.1:9/", None);
        let delivered = notifier
            .send(&Notification {
                recipient: None,
                message: "RSI crossed".into(),
                attachment: None,
            })
            .await;
        assert!(!delivered);
    }

    #[test]
    fn payload_omits_missing_image() {
        let json = serde_json::to_value(SendMessage {
            phone: "+15550100",
            message: "hi",
            image: None,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"phone": "+15550100", "message": "hi"}));
    }
}
