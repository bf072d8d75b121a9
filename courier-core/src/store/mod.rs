//! Storage seams for the pipeline.
//!
//! Every write that the pipeline relies on for correctness is atomic at the
//! single-row level: status changes and usage counters are guarded by a
//! version token, webhook failure counters are incremented in place.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::CourierError;
use crate::types::{
    Notification, NotificationFilter, NotificationLog, OutboxMessage, Subscription,
    SubscriptionRecord, WebhookSubscription,
};

#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Writes the notification, its first log entry and its outbox record in
    /// one transaction. Fails with `DuplicateIdempotencyKey` when the key is
    /// already taken.
    async fn create(
        &self,
        notification: &Notification,
        log: &NotificationLog,
        outbox: &OutboxMessage,
    ) -> Result<(), CourierError>;

    async fn get_notification(&self, id: Uuid) -> Result<Option<Notification>, CourierError>;

    async fn find_by_idempotency_key(&self, key: &str)
        -> Result<Option<Notification>, CourierError>;

    async fn list(&self, filter: &NotificationFilter) -> Result<Vec<Notification>, CourierError>;

    async fn logs(&self, notification_id: Uuid) -> Result<Vec<NotificationLog>, CourierError>;

    /// Persists `notification` only if the stored version still equals
    /// `notification.version`, appending `log` and, when given, a new outbox
    /// record in the same write. Returns the stored row with its new version.
    async fn update(
        &self,
        notification: &Notification,
        log: &NotificationLog,
        outbox: Option<&OutboxMessage>,
    ) -> Result<Notification, CourierError>;

    /// Pending notifications whose release time is at or before `now`.
    async fn due_scheduled(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Notification>, CourierError>;
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Unprocessed messages of `message_type` with `attempts < max_attempts`,
    /// oldest first.
    async fn fetch_pending(
        &self,
        message_type: &str,
        limit: i64,
        max_attempts: i32,
    ) -> Result<Vec<OutboxMessage>, CourierError>;

    async fn mark_processed(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), CourierError>;

    async fn record_relay_failure(&self, id: Uuid, error: &str) -> Result<(), CourierError>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn find_by_api_key(
        &self,
        api_key: &str,
    ) -> Result<Option<SubscriptionRecord>, CourierError>;

    async fn get_subscription(&self, id: Uuid) -> Result<Option<SubscriptionRecord>, CourierError>;

    /// Writes the usage counters and reset markers if the stored version still
    /// equals `subscription.version`; `Conflict` otherwise.
    async fn update_usage(&self, subscription: &Subscription)
        -> Result<Subscription, CourierError>;
}

#[async_trait]
pub trait WebhookStore: Send + Sync {
    async fn active_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<WebhookSubscription>, CourierError>;

    async fn get_webhook(&self, id: Uuid) -> Result<Option<WebhookSubscription>, CourierError>;

    async fn record_success(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), CourierError>;

    /// Increments the failure count in place and deactivates the endpoint once
    /// the count reaches `threshold`. Returns the updated endpoint.
    async fn record_failure(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        threshold: i32,
    ) -> Result<WebhookSubscription, CourierError>;

    /// Marks the endpoint active and zeroes its failure count. `false` when
    /// the endpoint does not exist.
    async fn reactivate(&self, id: Uuid) -> Result<bool, CourierError>;
}

/// The four stores as trait objects, usually backed by one implementation.
#[derive(Clone)]
pub struct Stores {
    pub notifications: Arc<dyn NotificationStore>,
    pub outbox: Arc<dyn OutboxStore>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub webhooks: Arc<dyn WebhookStore>,
}

impl Stores {
    pub fn from_shared<S>(store: Arc<S>) -> Self
    where
        S: NotificationStore + OutboxStore + SubscriptionStore + WebhookStore + 'static,
    {
        Self {
            notifications: store.clone(),
            outbox: store.clone(),
            subscriptions: store.clone(),
            webhooks: store,
        }
    }
}
