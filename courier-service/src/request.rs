use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use courier_core::{
    Channel, CourierError, Notification, NotificationLog, NotificationStatus, Priority,
};

pub const MAX_RETRIES_LIMIT: i32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRequest {
    pub channel: Channel,
    pub recipient: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub template_data: HashMap<String, Value>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_retries: Option<i32>,
}

impl SendRequest {
    pub fn new(channel: Channel, recipient: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            channel,
            recipient: recipient.into(),
            subject: None,
            body: Some(body.into()),
            priority: Priority::default(),
            template_id: None,
            template_data: HashMap::new(),
            idempotency_key: None,
            correlation_id: None,
            scheduled_at: None,
            max_retries: None,
        }
    }

    /// Shape checks that need no storage access.
    pub fn validate(&self) -> Result<(), CourierError> {
        let recipient = self.recipient.trim();
        if recipient.is_empty() {
            return Err(CourierError::Validation("recipient is required".to_string()));
        }
        if self.channel == Channel::Email && !recipient.contains('@') {
            return Err(CourierError::Validation(format!(
                "invalid email recipient: {}",
                recipient
            )));
        }

        let has_body = self.body.as_deref().map_or(false, |b| !b.trim().is_empty());
        if !has_body && self.template_id.is_none() {
            return Err(CourierError::Validation(
                "either body or template_id is required".to_string(),
            ));
        }

        if let Some(max_retries) = self.max_retries {
            if !(0..=MAX_RETRIES_LIMIT).contains(&max_retries) {
                return Err(CourierError::Validation(format!(
                    "max_retries must be between 0 and {}",
                    MAX_RETRIES_LIMIT
                )));
            }
        }

        if self.idempotency_key.as_deref().map_or(false, |k| k.trim().is_empty()) {
            return Err(CourierError::Validation(
                "idempotency_key must not be blank".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SendResponse {
    pub id: Uuid,
    pub status: NotificationStatus,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub was_idempotent: bool,
}

impl SendResponse {
    pub(crate) fn created(notification: &Notification) -> Self {
        let message = match (notification.status, notification.scheduled_at) {
            (NotificationStatus::Pending, Some(at)) => format!("Notification scheduled for {}", at),
            _ => "Notification queued for delivery".to_string(),
        };
        Self {
            id: notification.id,
            status: notification.status,
            message,
            created_at: notification.created_at,
            was_idempotent: false,
        }
    }

    pub(crate) fn replayed(notification: &Notification) -> Self {
        Self {
            id: notification.id,
            status: notification.status,
            message: "Notification already exists for this idempotency key".to_string(),
            created_at: notification.created_at,
            was_idempotent: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchError {
    pub code: String,
    pub message: String,
}

impl From<&CourierError> for BatchError {
    fn from(err: &CourierError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchItemResult {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<SendResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<BatchError>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchResponse {
    pub results: Vec<BatchItemResult>,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationDetails {
    pub notification: Notification,
    pub logs: Vec<NotificationLog>,
}
