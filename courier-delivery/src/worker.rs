use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing;

use courier_core::store::NotificationStore;
use courier_core::{
    CourierError, DispatchQueue, Notification, NotificationLog, NotificationStatus, OutboxMessage,
    SharedClock,
};
use courier_webhook::event::{NOTIFICATION_FAILED, NOTIFICATION_RETRYING, NOTIFICATION_SENT};
use courier_webhook::{WebhookEvent, WebhookFanout};

use crate::transport::{SendReceipt, TransportRegistry};

/// Drains the dispatch queue and records each delivery outcome.
pub struct DispatchWorker {
    notifications: Arc<dyn NotificationStore>,
    queue: Arc<DispatchQueue>,
    transports: Arc<TransportRegistry>,
    webhooks: Arc<WebhookFanout>,
    clock: SharedClock,
    send_timeout: Duration,
}

impl DispatchWorker {
    pub fn new(
        notifications: Arc<dyn NotificationStore>,
        queue: Arc<DispatchQueue>,
        transports: Arc<TransportRegistry>,
        webhooks: Arc<WebhookFanout>,
        clock: SharedClock,
        send_timeout: Duration,
    ) -> Self {
        Self {
            notifications,
            queue,
            transports,
            webhooks,
            clock,
            send_timeout,
        }
    }

    pub async fn run(&self, worker_id: usize, cancel: CancellationToken) -> Result<()> {
        tracing::info!("Starting dispatch worker {}", worker_id);

        loop {
            let notification = tokio::select! {
                _ = cancel.cancelled() => break,
                notification = self.queue.next() => notification,
            };

            let id = notification.id;
            match self.process(notification).await {
                Ok(Some(status)) => {
                    tracing::debug!("Worker {} moved notification {} to {}", worker_id, id, status)
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!("Worker {} failed to process notification {}: {}", worker_id, id, e)
                }
            }
        }

        tracing::info!("Dispatch worker {} stopped", worker_id);
        Ok(())
    }

    /// Attempts delivery of one queued notification. Returns the new status,
    /// or `None` when the item was stale or another worker got there first.
    pub async fn process(&self, queued: Notification) -> Result<Option<NotificationStatus>, CourierError> {
        // The queue may hold a stale copy or a duplicate from the outbox relay.
        let Some(mut notification) = self.notifications.get_notification(queued.id).await? else {
            tracing::warn!("Queued notification {} no longer exists", queued.id);
            return Ok(None);
        };
        if !notification.status.is_dispatchable() {
            tracing::debug!(
                "Skipping notification {} in status {}",
                notification.id,
                notification.status
            );
            return Ok(None);
        }

        let outcome = self.send(&notification).await;
        let now = self.clock.now();

        let (log, outbox, event) = match outcome {
            Ok(receipt) => {
                notification.transition(NotificationStatus::Sent, now)?;
                notification.provider_message_id = receipt.provider_message_id.clone();
                notification.error_message = None;
                let mut log = NotificationLog::new(
                    notification.id,
                    NotificationStatus::Sent,
                    "Sent to provider",
                    now,
                );
                if let Some(response) = receipt.provider_response {
                    log = log.with_provider_response(response);
                }
                (log, None, NOTIFICATION_SENT)
            }
            Err(e) if notification.retry_count < notification.max_retries => {
                notification.transition(NotificationStatus::Retrying, now)?;
                notification.retry_count += 1;
                notification.error_message = Some(e.to_string());
                let log = NotificationLog::new(
                    notification.id,
                    NotificationStatus::Retrying,
                    format!(
                        "Send failed (attempt {} of {}): {}",
                        notification.retry_count,
                        notification.max_retries + 1,
                        e
                    ),
                    now,
                );
                let outbox = OutboxMessage::dispatch(notification.id, now);
                (log, Some(outbox), NOTIFICATION_RETRYING)
            }
            Err(e) => {
                notification.transition(NotificationStatus::Failed, now)?;
                notification.error_message = Some(e.to_string());
                let log = NotificationLog::new(
                    notification.id,
                    NotificationStatus::Failed,
                    format!("Send failed permanently: {}", e),
                    now,
                );
                (log, None, NOTIFICATION_FAILED)
            }
        };

        let stored = match self.notifications.update(&notification, &log, outbox.as_ref()).await {
            Ok(stored) => stored,
            Err(CourierError::Conflict { .. }) => {
                tracing::warn!(
                    "Notification {} was updated concurrently, dropping this attempt",
                    notification.id
                );
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        match stored.status {
            NotificationStatus::Sent => tracing::info!("Notification {} sent", stored.id),
            NotificationStatus::Retrying => tracing::warn!(
                "Notification {} will be retried ({}/{})",
                stored.id,
                stored.retry_count,
                stored.max_retries
            ),
            _ => tracing::error!(
                "Notification {} failed: {}",
                stored.id,
                stored.error_message.as_deref().unwrap_or("unknown error")
            ),
        }

        self.webhooks
            .dispatch_event(stored.subscription_id, &WebhookEvent::new(event, &stored, now))
            .await;
        Ok(Some(stored.status))
    }

    async fn send(&self, notification: &Notification) -> Result<SendReceipt, CourierError> {
        let transport = self.transports.get(notification.channel).ok_or_else(|| {
            CourierError::Transport(format!("no transport registered for {}", notification.channel))
        })?;

        match tokio::time::timeout(self.send_timeout, transport.send(notification)).await {
            Ok(result) => result,
            Err(_) => Err(CourierError::Transport(format!(
                "send timed out after {}s",
                self.send_timeout.as_secs()
            ))),
        }
    }
}
