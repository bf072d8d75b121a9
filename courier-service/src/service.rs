use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;
use tracing;
use uuid::Uuid;

use courier_core::store::NotificationStore;
use courier_core::template::TemplateRenderer;
use courier_core::{
    CourierError, DispatchQueue, Notification, NotificationFilter, NotificationLog,
    NotificationStatus, OutboxMessage, Rejection, SharedClock, DEFAULT_MAX_RETRIES,
};
use courier_quota::QuotaValidator;
use courier_webhook::event::{NOTIFICATION_CANCELLED, NOTIFICATION_CREATED, NOTIFICATION_RETRYING};
use courier_webhook::{WebhookEvent, WebhookFanout};

use crate::request::{
    BatchError, BatchItemResult, BatchResponse, NotificationDetails, SendRequest, SendResponse,
};

pub const CANCELLED_REASON: &str = "Cancelled by user";

/// Rounds of `increment_usage` attempted in the background for a committed
/// send whose inline charge failed.
const DEFERRED_CHARGE_ROUNDS: u32 = 10;
const DEFERRED_CHARGE_BASE_DELAY: Duration = Duration::from_millis(500);
const DEFERRED_CHARGE_MAX_DELAY: Duration = Duration::from_secs(30);

/// Entry point for everything the API layer does with notifications.
pub struct NotificationService {
    notifications: Arc<dyn NotificationStore>,
    quota: Arc<QuotaValidator>,
    queue: Arc<DispatchQueue>,
    webhooks: Arc<WebhookFanout>,
    templates: Option<Arc<dyn TemplateRenderer>>,
    clock: SharedClock,
    charges: TaskTracker,
}

impl NotificationService {
    pub fn new(
        notifications: Arc<dyn NotificationStore>,
        quota: Arc<QuotaValidator>,
        queue: Arc<DispatchQueue>,
        webhooks: Arc<WebhookFanout>,
        clock: SharedClock,
    ) -> Self {
        Self {
            notifications,
            quota,
            queue,
            webhooks,
            templates: None,
            clock,
            charges: TaskTracker::new(),
        }
    }

    pub fn with_templates(mut self, templates: Arc<dyn TemplateRenderer>) -> Self {
        self.templates = Some(templates);
        self
    }

    pub async fn send(
        &self,
        user_id: Uuid,
        subscription_id: Uuid,
        request: SendRequest,
    ) -> Result<SendResponse, CourierError> {
        request.validate()?;

        if let Some(key) = &request.idempotency_key {
            if let Some(existing) = self.notifications.find_by_idempotency_key(key).await? {
                return self.replay(existing, subscription_id);
            }
        }

        self.quota
            .can_send(subscription_id, request.channel)
            .await?
            .into_result()?;

        let (subject, body) = self.render(&request).await?;

        let now = self.clock.now();
        let status = match request.scheduled_at {
            Some(at) if at > now => NotificationStatus::Pending,
            _ => NotificationStatus::Processing,
        };
        let notification = Notification {
            id: Uuid::new_v4(),
            channel: request.channel,
            priority: request.priority,
            recipient: request.recipient.trim().to_string(),
            subject,
            body,
            status,
            retry_count: 0,
            max_retries: request.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            idempotency_key: request.idempotency_key.clone(),
            correlation_id: request.correlation_id.clone(),
            scheduled_at: request.scheduled_at,
            user_id,
            subscription_id,
            error_message: None,
            provider_message_id: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };

        let log_message = match status {
            NotificationStatus::Pending => "Notification scheduled",
            _ => "Notification accepted for delivery",
        };
        let log = NotificationLog::new(notification.id, status, log_message, now);
        let outbox = OutboxMessage::dispatch(notification.id, now);

        match self.notifications.create(&notification, &log, &outbox).await {
            Ok(()) => {}
            Err(CourierError::DuplicateIdempotencyKey(key)) => {
                tracing::info!("Lost idempotency race on key {}, replaying winner", key);
                return match self.notifications.find_by_idempotency_key(&key).await? {
                    Some(existing) => self.replay(existing, subscription_id),
                    None => Err(CourierError::DuplicateIdempotencyKey(key)),
                };
            }
            Err(e) => return Err(e),
        }

        // The notification is durable and will be delivered from here on,
        // so the send succeeds even if the charge has to be finished later.
        if let Err(e) = self.quota.increment_usage(subscription_id).await {
            self.defer_charge(subscription_id, notification.id, e);
        }

        if status == NotificationStatus::Processing {
            self.queue.enqueue(notification.clone());
        }

        tracing::info!(
            "Accepted {} notification {} for subscription {} ({})",
            notification.channel,
            notification.id,
            subscription_id,
            status
        );
        self.announce(NOTIFICATION_CREATED, &notification).await;

        Ok(SendResponse::created(&notification))
    }

    pub async fn send_batch(
        &self,
        user_id: Uuid,
        subscription_id: Uuid,
        requests: Vec<SendRequest>,
    ) -> BatchResponse {
        let mut results = Vec::with_capacity(requests.len());
        let mut succeeded = 0;

        for (index, request) in requests.into_iter().enumerate() {
            match self.send(user_id, subscription_id, request).await {
                Ok(response) => {
                    succeeded += 1;
                    results.push(BatchItemResult {
                        index,
                        response: Some(response),
                        error: None,
                    });
                }
                Err(e) => {
                    tracing::debug!("Batch item {} rejected: {}", index, e);
                    results.push(BatchItemResult {
                        index,
                        response: None,
                        error: Some(BatchError::from(&e)),
                    });
                }
            }
        }

        let failed = results.len() - succeeded;
        BatchResponse {
            results,
            succeeded,
            failed,
        }
    }

    /// Cancels a notification that has not been released yet.
    pub async fn cancel(&self, id: Uuid) -> Result<bool, CourierError> {
        let Some(mut notification) = self.notifications.get_notification(id).await? else {
            return Ok(false);
        };
        if notification.status != NotificationStatus::Pending {
            return Ok(false);
        }

        let now = self.clock.now();
        notification.transition(NotificationStatus::Failed, now)?;
        notification.error_message = Some(CANCELLED_REASON.to_string());
        let log = NotificationLog::new(id, NotificationStatus::Failed, CANCELLED_REASON, now);

        let stored = match self.notifications.update(&notification, &log, None).await {
            Ok(stored) => stored,
            Err(CourierError::Conflict { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };

        tracing::info!("Cancelled notification {}", id);
        self.announce(NOTIFICATION_CANCELLED, &stored).await;
        Ok(true)
    }

    /// Sends a failed notification around again.
    pub async fn retry(&self, id: Uuid) -> Result<bool, CourierError> {
        let Some(mut notification) = self.notifications.get_notification(id).await? else {
            return Ok(false);
        };
        if notification.status != NotificationStatus::Failed {
            return Ok(false);
        }

        let now = self.clock.now();
        notification.transition(NotificationStatus::Retrying, now)?;
        notification.retry_count += 1;
        notification.error_message = None;
        let log = NotificationLog::new(id, NotificationStatus::Retrying, "Manual retry requested", now);
        let outbox = OutboxMessage::dispatch(id, now);

        let stored = match self.notifications.update(&notification, &log, Some(&outbox)).await {
            Ok(stored) => stored,
            Err(CourierError::Conflict { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };

        tracing::info!("Retrying notification {} (retry {})", id, stored.retry_count);
        self.queue.enqueue(stored.clone());
        self.announce(NOTIFICATION_RETRYING, &stored).await;
        Ok(true)
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<NotificationDetails>, CourierError> {
        let Some(notification) = self.notifications.get_notification(id).await? else {
            return Ok(None);
        };
        let logs = self.notifications.logs(id).await?;
        Ok(Some(NotificationDetails { notification, logs }))
    }

    pub async fn list(&self, filter: &NotificationFilter) -> Result<Vec<Notification>, CourierError> {
        self.notifications.list(filter).await
    }

    /// Waits for deferred usage charges to settle.
    pub async fn wait_idle(&self) {
        self.charges.close();
        self.charges.wait().await;
        self.charges.reopen();
    }

    pub fn pending_charges(&self) -> usize {
        self.charges.len()
    }

    fn defer_charge(&self, subscription_id: Uuid, notification_id: Uuid, error: CourierError) {
        if !error.is_retryable() {
            tracing::error!(
                "Usage for notification {} on subscription {} was not charged: {}",
                notification_id,
                subscription_id,
                error
            );
            return;
        }

        tracing::warn!(
            "Deferring usage charge for notification {} on subscription {}: {}",
            notification_id,
            subscription_id,
            error
        );
        let quota = self.quota.clone();
        self.charges.spawn(async move {
            let mut delay = DEFERRED_CHARGE_BASE_DELAY;
            for round in 1..=DEFERRED_CHARGE_ROUNDS {
                tokio::time::sleep(delay).await;
                match quota.increment_usage(subscription_id).await {
                    Ok(_) => {
                        tracing::info!(
                            "Charged deferred usage for notification {} (round {})",
                            notification_id,
                            round
                        );
                        return;
                    }
                    Err(e) if e.is_retryable() => {
                        tracing::warn!(
                            "Deferred charge for notification {} failed (round {}/{}): {}",
                            notification_id,
                            round,
                            DEFERRED_CHARGE_ROUNDS,
                            e
                        );
                        delay = (delay * 2).min(DEFERRED_CHARGE_MAX_DELAY);
                    }
                    Err(e) => {
                        tracing::error!(
                            "Deferred charge for notification {} abandoned: {}",
                            notification_id,
                            e
                        );
                        return;
                    }
                }
            }
            tracing::error!(
                "Usage for notification {} on subscription {} was not charged after {} rounds",
                notification_id,
                subscription_id,
                DEFERRED_CHARGE_ROUNDS
            );
        });
    }

    fn replay(&self, existing: Notification, subscription_id: Uuid) -> Result<SendResponse, CourierError> {
        if existing.subscription_id != subscription_id {
            return Err(CourierError::Validation(
                "idempotency key is already used by another subscription".to_string(),
            ));
        }
        tracing::debug!("Idempotent replay of notification {}", existing.id);
        Ok(SendResponse::replayed(&existing))
    }

    async fn render(&self, request: &SendRequest) -> Result<(Option<String>, String), CourierError> {
        let Some(template_id) = &request.template_id else {
            return Ok((request.subject.clone(), request.body.clone().unwrap_or_default()));
        };

        let rendered = match &self.templates {
            Some(templates) => templates.render(template_id, &request.template_data).await?,
            None => None,
        };
        let rendered = rendered.ok_or_else(|| Rejection::TemplateNotFound(template_id.clone()))?;

        Ok((rendered.subject.or_else(|| request.subject.clone()), rendered.body))
    }

    async fn announce(&self, event: &str, notification: &Notification) {
        let event = WebhookEvent::new(event, notification, self.clock.now());
        self.webhooks
            .dispatch_event(notification.subscription_id, &event)
            .await;
    }
}
