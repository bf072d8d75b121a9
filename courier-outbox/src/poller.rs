use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing;

use courier_core::config::OutboxConfig;
use courier_core::store::{NotificationStore, OutboxStore};
use courier_core::{
    DispatchPayload, DispatchQueue, OutboxMessage, SharedClock, NOTIFICATION_DISPATCH,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    pub enqueued: usize,
    /// Marked processed without an enqueue because the notification had
    /// already left the dispatchable states.
    pub finalized: usize,
    pub failed: usize,
}

impl RelayOutcome {
    pub fn total(&self) -> usize {
        self.enqueued + self.finalized + self.failed
    }
}

enum Handled {
    Enqueued,
    Finalized,
}

/// Turns durable outbox records into dispatch queue entries. This is the
/// path that recovers work lost between a committed write and an in-memory
/// enqueue, for example across a restart.
pub struct OutboxRelay {
    outbox: Arc<dyn OutboxStore>,
    notifications: Arc<dyn NotificationStore>,
    queue: Arc<DispatchQueue>,
    clock: SharedClock,
    config: OutboxConfig,
}

impl OutboxRelay {
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        notifications: Arc<dyn NotificationStore>,
        queue: Arc<DispatchQueue>,
        clock: SharedClock,
        config: OutboxConfig,
    ) -> Self {
        Self {
            outbox,
            notifications,
            queue,
            clock,
            config,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        tracing::info!(
            "Starting outbox relay (every {}s, batch {})",
            self.config.poll_interval_secs,
            self.config.batch_size
        );

        loop {
            let wait = match self.process_batch().await {
                Ok(outcome) => {
                    if outcome.total() > 0 {
                        tracing::debug!("Outbox relay cycle: {:?}", outcome);
                    }
                    Duration::from_secs(self.config.poll_interval_secs)
                }
                Err(e) => {
                    tracing::error!("Error in outbox relay: {}", e);
                    Duration::from_secs(self.config.error_backoff_secs)
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        tracing::info!("Outbox relay stopped");
        Ok(())
    }

    /// One relay cycle over the oldest eligible dispatch records. Records of
    /// other types are never fetched, so they cannot crowd out the batch.
    pub async fn process_batch(&self) -> Result<RelayOutcome> {
        let messages = self
            .outbox
            .fetch_pending(NOTIFICATION_DISPATCH, self.config.batch_size, self.config.max_attempts)
            .await?;

        let mut outcome = RelayOutcome::default();
        if messages.is_empty() {
            return Ok(outcome);
        }
        tracing::debug!("Found {} unprocessed outbox messages", messages.len());

        for message in messages {
            match self.relay(&message).await {
                Ok(Handled::Enqueued) => {
                    self.outbox.mark_processed(message.id, self.clock.now()).await?;
                    outcome.enqueued += 1;
                }
                Ok(Handled::Finalized) => {
                    self.outbox.mark_processed(message.id, self.clock.now()).await?;
                    outcome.finalized += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to relay outbox message {} (attempt {}): {}",
                        message.id,
                        message.attempts + 1,
                        e
                    );
                    self.outbox.record_relay_failure(message.id, &e.to_string()).await?;
                    outcome.failed += 1;
                }
            }
        }

        Ok(outcome)
    }

    async fn relay(&self, message: &OutboxMessage) -> Result<Handled> {
        let payload: DispatchPayload = serde_json::from_value(message.payload.clone())?;
        let notification = self
            .notifications
            .get_notification(payload.notification_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("notification {} not found", payload.notification_id))?;

        if !notification.status.is_dispatchable() {
            tracing::debug!(
                "Notification {} is {}, nothing to dispatch",
                notification.id,
                notification.status
            );
            return Ok(Handled::Finalized);
        }

        self.queue.enqueue(notification);
        Ok(Handled::Enqueued)
    }
}
