use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use courier_core::{Channel, Notification, NotificationStatus};

pub const NOTIFICATION_CREATED: &str = "notification.created";
pub const NOTIFICATION_SENT: &str = "notification.sent";
pub const NOTIFICATION_RETRYING: &str = "notification.retrying";
pub const NOTIFICATION_FAILED: &str = "notification.failed";
pub const NOTIFICATION_CANCELLED: &str = "notification.cancelled";

/// Body of a webhook delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event: String,
    pub notification_id: Uuid,
    pub status: NotificationStatus,
    pub channel: Channel,
    pub recipient: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub timestamp: DateTime<Utc>,
}

impl WebhookEvent {
    pub fn new(event: &str, notification: &Notification, timestamp: DateTime<Utc>) -> Self {
        Self {
            event: event.to_string(),
            notification_id: notification.id,
            status: notification.status,
            channel: notification.channel,
            recipient: notification.recipient.clone(),
            correlation_id: notification.correlation_id.clone(),
            provider_message_id: notification.provider_message_id.clone(),
            error_message: notification.error_message.clone(),
            retry_count: notification.retry_count,
            timestamp,
        }
    }
}
