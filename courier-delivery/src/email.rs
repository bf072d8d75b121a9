use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing;

use courier_core::config::DeliveryConfig;
use courier_core::{Channel, CourierError, Notification};

use crate::transport::{SendReceipt, Transport};

const RESEND_API_URL: &str = "https://api.resend.com";

fn html_escape(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '<' => "&lt;".to_string(),
            '>' => "&gt;".to_string(),
            '&' => "&amp;".to_string(),
            '"' => "&quot;".to_string(),
            '\'' => "&#x27;".to_string(),
            _ => c.to_string(),
        })
        .collect()
}

#[derive(Debug, Serialize)]
struct ResendEmailRequest {
    from: String,
    to: Vec<String>,
    subject: String,
    html: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResendEmailResponse {
    id: String,
}

/// Email transport backed by the Resend HTTP API.
pub struct ResendEmailTransport {
    client: reqwest::Client,
    api_key: String,
    from_email: String,
    base_url: String,
}

impl ResendEmailTransport {
    pub fn new(api_key: String, from_email: String, base_url: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            client,
            api_key,
            from_email,
            base_url: base_url.unwrap_or_else(|| RESEND_API_URL.to_string()),
        })
    }

    /// `None` when the Resend credentials are not configured.
    pub fn from_config(config: &DeliveryConfig) -> Result<Option<Self>> {
        match (&config.resend_api_key, &config.resend_from_email) {
            (Some(api_key), Some(from_email)) => {
                tracing::info!("Initializing Resend email transport");
                Self::new(api_key.clone(), from_email.clone(), None).map(Some)
            }
            _ => {
                tracing::warn!("Email transport disabled (missing Resend configuration)");
                Ok(None)
            }
        }
    }

    fn render_html(subject: &str, body: &str) -> String {
        format!(
            r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
</head>
<body style="font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, Arial, sans-serif; line-height: 1.6; color: #333; max-width: 600px; margin: 0 auto; padding: 20px;">
    <h1 style="margin: 0 0 16px 0; font-size: 22px; color: #212529;">{}</h1>
    <div style="font-size: 16px; color: #495057; white-space: pre-wrap;">{}</div>
</body>
</html>"#,
            html_escape(subject),
            html_escape(body)
        )
    }
}

#[async_trait]
impl Transport for ResendEmailTransport {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, notification: &Notification) -> Result<SendReceipt, CourierError> {
        let subject = notification.subject.as_deref().unwrap_or("Notification");

        let email_request = ResendEmailRequest {
            from: self.from_email.clone(),
            to: vec![notification.recipient.clone()],
            subject: subject.to_string(),
            html: Self::render_html(subject, &notification.body),
            text: Some(notification.body.clone()),
        };

        let response = self
            .client
            .post(format!("{}/emails", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&email_request)
            .send()
            .await
            .map_err(|e| CourierError::Transport(format!("Failed to send HTTP request to Resend: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(CourierError::Transport(format!(
                "Resend API returned error status {}: {}",
                status, error_text
            )));
        }

        let email_response: ResendEmailResponse = response.json().await.map_err(|e| {
            CourierError::Transport(format!("Failed to parse Resend API response: {}", e))
        })?;

        tracing::debug!(
            "Email for notification {} accepted by Resend (email_id: {})",
            notification.id,
            email_response.id
        );

        Ok(SendReceipt {
            provider_response: Some(format!("resend accepted {}", email_response.id)),
            provider_message_id: Some(email_response.id),
        })
    }

    async fn health_check(&self) -> bool {
        !self.api_key.is_empty() && !self.from_email.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use courier_core::{NotificationStatus, Priority};
    use serde_json::json;
    use uuid::Uuid;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn notification() -> Notification {
        let now = Utc::now();
        Notification {
            id: Uuid::new_v4(),
            channel: Channel::Email,
            priority: Priority::Normal,
            recipient: "ada@example.com".to_string(),
            subject: Some("Invoice <#42>".to_string()),
            body: "Your invoice is ready".to_string(),
            status: NotificationStatus::Processing,
            retry_count: 0,
            max_retries: 3,
            idempotency_key: None,
            correlation_id: None,
            scheduled_at: None,
            user_id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            error_message: None,
            provider_message_id: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_html_escape() {
        assert_eq!(html_escape("<b>\"Tom\" & 'Jerry'</b>"), "&lt;b&gt;&quot;Tom&quot; &amp; &#x27;Jerry&#x27;&lt;/b&gt;");
    }

    #[tokio::test]
    async fn test_send_returns_provider_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/emails"))
            .and(header("Authorization", "Bearer re_test"))
            .and(body_partial_json(json!({
                "from": "noreply@example.com",
                "to": ["ada@example.com"],
                "subject": "Invoice <#42>",
                "text": "Your invoice is ready",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "em_123" })))
            .expect(1)
            .mount(&server)
            .await;

        let transport = ResendEmailTransport::new(
            "re_test".to_string(),
            "noreply@example.com".to_string(),
            Some(server.uri()),
        )
        .unwrap();

        let receipt = transport.send(&notification()).await.unwrap();
        assert_eq!(receipt.provider_message_id.as_deref(), Some("em_123"));
    }

    #[tokio::test]
    async fn test_error_status_is_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/emails"))
            .respond_with(ResponseTemplate::new(422).set_body_string("invalid recipient"))
            .mount(&server)
            .await;

        let transport = ResendEmailTransport::new(
            "re_test".to_string(),
            "noreply@example.com".to_string(),
            Some(server.uri()),
        )
        .unwrap();

        let err = transport.send(&notification()).await.unwrap_err();
        assert!(matches!(err, CourierError::Transport(_)));
        assert!(err.to_string().contains("invalid recipient"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_unconfigured_transport_is_disabled() {
        assert!(ResendEmailTransport::from_config(&DeliveryConfig::default())
            .unwrap()
            .is_none());
    }
}
