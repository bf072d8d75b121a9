use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{NotificationStore, OutboxStore, SubscriptionStore, WebhookStore};
use crate::error::CourierError;
use crate::types::{
    Notification, NotificationFilter, NotificationLog, NotificationStatus, OutboxMessage,
    Subscription, SubscriptionRecord, WebhookSubscription,
};

#[derive(Default)]
struct State {
    notifications: HashMap<Uuid, Notification>,
    logs: Vec<NotificationLog>,
    outbox: Vec<OutboxMessage>,
    subscriptions: HashMap<Uuid, Subscription>,
    users: HashMap<Uuid, bool>,
    webhooks: HashMap<Uuid, WebhookSubscription>,
}

/// In-memory storage for tests and single-process deployments without a
/// database. Honours the same version checks as the Postgres store.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_subscription(&self, subscription: Subscription, user_active: bool) {
        let mut state = self.state.lock().await;
        state.users.insert(subscription.user_id, user_active);
        state.subscriptions.insert(subscription.id, subscription);
    }

    pub async fn set_user_active(&self, user_id: Uuid, active: bool) {
        self.state.lock().await.users.insert(user_id, active);
    }

    pub async fn insert_webhook(&self, webhook: WebhookSubscription) {
        self.state.lock().await.webhooks.insert(webhook.id, webhook);
    }

    pub async fn outbox_messages(&self) -> Vec<OutboxMessage> {
        self.state.lock().await.outbox.clone()
    }

    pub async fn notification_count(&self) -> usize {
        self.state.lock().await.notifications.len()
    }
}

impl State {
    fn record(&self, subscription: &Subscription) -> SubscriptionRecord {
        SubscriptionRecord {
            subscription: subscription.clone(),
            user_active: self.users.get(&subscription.user_id).copied().unwrap_or(false),
        }
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn create(
        &self,
        notification: &Notification,
        log: &NotificationLog,
        outbox: &OutboxMessage,
    ) -> Result<(), CourierError> {
        let mut state = self.state.lock().await;

        if let Some(key) = &notification.idempotency_key {
            let taken = state
                .notifications
                .values()
                .any(|n| n.idempotency_key.as_deref() == Some(key.as_str()));
            if taken {
                return Err(CourierError::DuplicateIdempotencyKey(key.clone()));
            }
        }

        state.notifications.insert(notification.id, notification.clone());
        state.logs.push(log.clone());
        state.outbox.push(outbox.clone());
        Ok(())
    }

    async fn get_notification(&self, id: Uuid) -> Result<Option<Notification>, CourierError> {
        Ok(self.state.lock().await.notifications.get(&id).cloned())
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Notification>, CourierError> {
        Ok(self
            .state
            .lock()
            .await
            .notifications
            .values()
            .find(|n| n.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn list(&self, filter: &NotificationFilter) -> Result<Vec<Notification>, CourierError> {
        let state = self.state.lock().await;
        let mut matching: Vec<Notification> = state
            .notifications
            .values()
            .filter(|n| filter.user_id.map_or(true, |id| n.user_id == id))
            .filter(|n| filter.subscription_id.map_or(true, |id| n.subscription_id == id))
            .filter(|n| filter.status.map_or(true, |status| n.status == status))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(matching
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .collect())
    }

    async fn logs(&self, notification_id: Uuid) -> Result<Vec<NotificationLog>, CourierError> {
        let state = self.state.lock().await;
        let mut logs: Vec<NotificationLog> = state
            .logs
            .iter()
            .filter(|log| log.notification_id == notification_id)
            .cloned()
            .collect();
        logs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(logs)
    }

    async fn update(
        &self,
        notification: &Notification,
        log: &NotificationLog,
        outbox: Option<&OutboxMessage>,
    ) -> Result<Notification, CourierError> {
        let mut state = self.state.lock().await;

        let stored = state
            .notifications
            .get_mut(&notification.id)
            .ok_or(CourierError::NotFound {
                entity: "notification",
                id: notification.id,
            })?;
        if stored.version != notification.version {
            return Err(CourierError::Conflict {
                entity: "notification",
                id: notification.id,
            });
        }

        let mut updated = notification.clone();
        updated.version += 1;
        *stored = updated.clone();

        state.logs.push(log.clone());
        if let Some(message) = outbox {
            state.outbox.push(message.clone());
        }
        Ok(updated)
    }

    async fn due_scheduled(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Notification>, CourierError> {
        let state = self.state.lock().await;
        let mut due: Vec<Notification> = state
            .notifications
            .values()
            .filter(|n| n.status == NotificationStatus::Pending)
            .filter(|n| n.scheduled_at.map_or(false, |at| at <= now))
            .cloned()
            .collect();
        due.sort_by_key(|n| n.scheduled_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }
}

#[async_trait]
impl OutboxStore for MemoryStore {
    async fn fetch_pending(
        &self,
        message_type: &str,
        limit: i64,
        max_attempts: i32,
    ) -> Result<Vec<OutboxMessage>, CourierError> {
        let state = self.state.lock().await;
        let mut pending: Vec<OutboxMessage> = state
            .outbox
            .iter()
            .filter(|m| {
                m.message_type == message_type
                    && m.processed_at.is_none()
                    && m.attempts < max_attempts
            })
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal timestamps.
        pending.sort_by_key(|m| m.created_at);
        pending.truncate(limit.max(0) as usize);
        Ok(pending)
    }

    async fn mark_processed(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), CourierError> {
        let mut state = self.state.lock().await;
        let message = state
            .outbox
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(CourierError::NotFound { entity: "outbox message", id })?;
        message.processed_at = Some(at);
        message.last_error = None;
        Ok(())
    }

    async fn record_relay_failure(&self, id: Uuid, error: &str) -> Result<(), CourierError> {
        let mut state = self.state.lock().await;
        let message = state
            .outbox
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(CourierError::NotFound { entity: "outbox message", id })?;
        message.attempts += 1;
        message.last_error = Some(error.to_string());
        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn find_by_api_key(
        &self,
        api_key: &str,
    ) -> Result<Option<SubscriptionRecord>, CourierError> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .find(|s| s.api_key == api_key)
            .map(|s| state.record(s)))
    }

    async fn get_subscription(&self, id: Uuid) -> Result<Option<SubscriptionRecord>, CourierError> {
        let state = self.state.lock().await;
        Ok(state.subscriptions.get(&id).map(|s| state.record(s)))
    }

    async fn update_usage(
        &self,
        subscription: &Subscription,
    ) -> Result<Subscription, CourierError> {
        let mut state = self.state.lock().await;
        let stored = state
            .subscriptions
            .get_mut(&subscription.id)
            .ok_or(CourierError::NotFound {
                entity: "subscription",
                id: subscription.id,
            })?;
        if stored.version != subscription.version {
            return Err(CourierError::Conflict {
                entity: "subscription",
                id: subscription.id,
            });
        }

        stored.daily_used = subscription.daily_used;
        stored.monthly_used = subscription.monthly_used;
        stored.last_reset_daily = subscription.last_reset_daily;
        stored.last_reset_monthly = subscription.last_reset_monthly;
        stored.version += 1;
        Ok(stored.clone())
    }
}

#[async_trait]
impl WebhookStore for MemoryStore {
    async fn active_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<WebhookSubscription>, CourierError> {
        let state = self.state.lock().await;
        Ok(state
            .webhooks
            .values()
            .filter(|w| w.subscription_id == subscription_id && w.is_active)
            .cloned()
            .collect())
    }

    async fn get_webhook(&self, id: Uuid) -> Result<Option<WebhookSubscription>, CourierError> {
        Ok(self.state.lock().await.webhooks.get(&id).cloned())
    }

    async fn record_success(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), CourierError> {
        let mut state = self.state.lock().await;
        let webhook = state
            .webhooks
            .get_mut(&id)
            .ok_or(CourierError::NotFound { entity: "webhook", id })?;
        webhook.failure_count = 0;
        webhook.last_success_at = Some(at);
        Ok(())
    }

    async fn record_failure(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        threshold: i32,
    ) -> Result<WebhookSubscription, CourierError> {
        let mut state = self.state.lock().await;
        let webhook = state
            .webhooks
            .get_mut(&id)
            .ok_or(CourierError::NotFound { entity: "webhook", id })?;
        webhook.failure_count += 1;
        webhook.last_failure_at = Some(at);
        if webhook.failure_count >= threshold {
            webhook.is_active = false;
        }
        Ok(webhook.clone())
    }

    async fn reactivate(&self, id: Uuid) -> Result<bool, CourierError> {
        let mut state = self.state.lock().await;
        match state.webhooks.get_mut(&id) {
            Some(webhook) => {
                webhook.is_active = true;
                webhook.failure_count = 0;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
