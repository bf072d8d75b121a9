use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing;

use courier_core::config::SchedulerConfig;
use courier_core::store::NotificationStore;
use courier_core::{
    CourierError, DispatchQueue, NotificationLog, NotificationStatus, OutboxMessage, SharedClock,
};

/// Moves future-dated notifications into the dispatch queue once their
/// release time has passed.
pub struct ScheduledReleasePoller {
    notifications: Arc<dyn NotificationStore>,
    queue: Arc<DispatchQueue>,
    clock: SharedClock,
    config: SchedulerConfig,
}

impl ScheduledReleasePoller {
    pub fn new(
        notifications: Arc<dyn NotificationStore>,
        queue: Arc<DispatchQueue>,
        clock: SharedClock,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            notifications,
            queue,
            clock,
            config,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        tracing::info!(
            "Starting scheduled release poller (every {}s)",
            self.config.poll_interval_secs
        );

        loop {
            let wait = match self.release_due().await {
                Ok(released) => {
                    if released > 0 {
                        tracing::info!("Released {} scheduled notifications", released);
                    }
                    Duration::from_secs(self.config.poll_interval_secs)
                }
                Err(e) => {
                    tracing::error!("Error in scheduled release poller: {}", e);
                    Duration::from_secs(self.config.error_backoff_secs)
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        tracing::info!("Scheduled release poller stopped");
        Ok(())
    }

    /// Releases every due notification in one batch and returns how many
    /// reached the queue.
    pub async fn release_due(&self) -> Result<usize> {
        let now = self.clock.now();
        let due = self
            .notifications
            .due_scheduled(now, self.config.batch_size)
            .await?;

        let mut released = 0;
        for mut notification in due {
            let id = notification.id;
            if let Err(e) = notification.transition(NotificationStatus::Processing, now) {
                tracing::warn!("Cannot release notification {}: {}", id, e);
                continue;
            }

            let log = NotificationLog::new(
                id,
                NotificationStatus::Processing,
                "Released at scheduled time",
                now,
            );
            // The outbox record keeps the release durable if the process
            // stops before a worker picks the item up.
            let outbox = OutboxMessage::dispatch(id, now);

            match self.notifications.update(&notification, &log, Some(&outbox)).await {
                Ok(stored) => {
                    self.queue.enqueue(stored);
                    released += 1;
                }
                Err(CourierError::Conflict { .. }) => {
                    tracing::debug!("Notification {} changed before release, skipping", id);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(released)
    }
}
