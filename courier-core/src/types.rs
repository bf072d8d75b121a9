use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::CourierError;

/// Outbox message type for "this notification must reach the dispatch queue".
pub const NOTIFICATION_DISPATCH: &str = "notification.dispatch";

pub const DEFAULT_MAX_RETRIES: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    Sms,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(Channel::Email),
            "sms" => Ok(Channel::Sms),
            other => Err(CourierError::Validation(format!("unknown channel: {}", other))),
        }
    }
}

/// Declaration order is significant: `Ord` ranks `Critical` highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Drain order for dispatch workers.
    pub const DESCENDING: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(CourierError::Validation(format!("unknown priority: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Pending,
    Processing,
    Retrying,
    Failed,
    Sent,
    Delivered,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Processing => "processing",
            NotificationStatus::Retrying => "retrying",
            NotificationStatus::Failed => "failed",
            NotificationStatus::Sent => "sent",
            NotificationStatus::Delivered => "delivered",
        }
    }

    /// The complete transition graph. `Failed -> Retrying` is the explicit
    /// retry path and `Pending -> Failed` is cancellation.
    pub fn can_transition_to(self, next: NotificationStatus) -> bool {
        use NotificationStatus::*;

        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Failed)
                | (Processing, Sent)
                | (Processing, Retrying)
                | (Processing, Failed)
                | (Retrying, Sent)
                | (Retrying, Retrying)
                | (Retrying, Failed)
                | (Failed, Retrying)
                | (Sent, Delivered)
        )
    }

    /// Statuses in which a notification is waiting for a dispatch worker.
    pub fn is_dispatchable(self) -> bool {
        matches!(self, NotificationStatus::Processing | NotificationStatus::Retrying)
    }
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationStatus {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(NotificationStatus::Pending),
            "processing" => Ok(NotificationStatus::Processing),
            "retrying" => Ok(NotificationStatus::Retrying),
            "failed" => Ok(NotificationStatus::Failed),
            "sent" => Ok(NotificationStatus::Sent),
            "delivered" => Ok(NotificationStatus::Delivered),
            other => Err(CourierError::Validation(format!("unknown status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub channel: Channel,
    pub priority: Priority,
    pub recipient: String,
    pub subject: Option<String>,
    pub body: String,
    pub status: NotificationStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub idempotency_key: Option<String>,
    pub correlation_id: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub user_id: Uuid,
    pub subscription_id: Uuid,
    pub error_message: Option<String>,
    pub provider_message_id: Option<String>,
    /// Optimistic concurrency token, bumped by the store on every write.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Notification {
    /// Moves to `next` if the edge exists in the transition graph.
    pub fn transition(&mut self, next: NotificationStatus, now: DateTime<Utc>) -> Result<(), CourierError> {
        if !self.status.can_transition_to(next) {
            return Err(CourierError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn is_scheduled_after(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.map(|at| at > now).unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationLog {
    pub id: Uuid,
    pub notification_id: Uuid,
    pub status: NotificationStatus,
    pub message: String,
    pub provider_response: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NotificationLog {
    pub fn new(
        notification_id: Uuid,
        status: NotificationStatus,
        message: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            notification_id,
            status,
            message: message.into(),
            provider_response: None,
            created_at,
        }
    }

    pub fn with_provider_response(mut self, response: impl Into<String>) -> Self {
        self.provider_response = Some(response.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub message_type: String,
    pub aggregate_id: Uuid,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchPayload {
    pub notification_id: Uuid,
}

impl OutboxMessage {
    pub fn dispatch(notification_id: Uuid, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_type: NOTIFICATION_DISPATCH.to_string(),
            aggregate_id: notification_id,
            payload: serde_json::json!({ "notification_id": notification_id }),
            created_at,
            processed_at: None,
            attempts: 0,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Suspended,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Suspended => "suspended",
            SubscriptionStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "suspended" => Ok(SubscriptionStatus::Suspended),
            "expired" => Ok(SubscriptionStatus::Expired),
            other => Err(CourierError::Validation(format!(
                "unknown subscription status: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub api_key: String,
    pub user_id: Uuid,
    pub status: SubscriptionStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub daily_limit: i32,
    pub monthly_limit: i32,
    pub daily_used: i32,
    pub monthly_used: i32,
    pub last_reset_daily: DateTime<Utc>,
    pub last_reset_monthly: DateTime<Utc>,
    pub allow_email: bool,
    pub allow_sms: bool,
    pub version: i64,
}

impl Subscription {
    pub fn allows(&self, channel: Channel) -> bool {
        match channel {
            Channel::Email => self.allow_email,
            Channel::Sms => self.allow_sms,
        }
    }

    pub fn remaining_daily(&self) -> i32 {
        (self.daily_limit - self.daily_used).max(0)
    }

    pub fn remaining_monthly(&self) -> i32 {
        (self.monthly_limit - self.monthly_used).max(0)
    }
}

/// A subscription together with the owning user's active flag.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionRecord {
    pub subscription: Subscription,
    pub user_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub url: String,
    pub secret: String,
    /// Comma-delimited event names, or `*` for everything.
    pub events: String,
    pub is_active: bool,
    pub failure_count: i32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl WebhookSubscription {
    pub fn subscribes_to(&self, event: &str) -> bool {
        self.events
            .split(',')
            .map(str::trim)
            .any(|name| name == "*" || name == event)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationFilter {
    pub user_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    pub status: Option<NotificationStatus>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for NotificationFilter {
    fn default() -> Self {
        Self {
            user_id: None,
            subscription_id: None,
            status: None,
            limit: 50,
            offset: 0,
        }
    }
}
