use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;
use tracing;
use uuid::Uuid;

use courier_core::config::WebhookConfig;
use courier_core::store::WebhookStore;
use courier_core::{CourierError, SharedClock, WebhookSubscription};

use crate::event::WebhookEvent;
use crate::signature::{
    compute_signature, EVENT_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER, WEBHOOK_ID_HEADER,
};

struct Delivery {
    webhooks: Arc<dyn WebhookStore>,
    client: reqwest::Client,
    clock: SharedClock,
    failure_threshold: i32,
}

/// Delivers signed event callbacks to the endpoints registered for a
/// subscription. Each endpoint is delivered in its own task; outcomes only
/// reach the endpoint's failure counter, never the caller.
pub struct WebhookFanout {
    delivery: Arc<Delivery>,
    tracker: TaskTracker,
}

impl WebhookFanout {
    pub fn new(webhooks: Arc<dyn WebhookStore>, clock: SharedClock, config: &WebhookConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            delivery: Arc::new(Delivery {
                webhooks,
                client,
                clock,
                failure_threshold: config.failure_threshold,
            }),
            tracker: TaskTracker::new(),
        })
    }

    pub async fn dispatch_event(&self, subscription_id: Uuid, event: &WebhookEvent) {
        let endpoints = match self.delivery.webhooks.active_for_subscription(subscription_id).await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                tracing::error!(
                    "Failed to load webhooks for subscription {}: {}",
                    subscription_id,
                    e
                );
                return;
            }
        };

        let matching: Vec<WebhookSubscription> = endpoints
            .into_iter()
            .filter(|endpoint| endpoint.subscribes_to(&event.event))
            .collect();
        if matching.is_empty() {
            return;
        }

        let body: Arc<str> = match serde_json::to_string(event) {
            Ok(body) => body.into(),
            Err(e) => {
                tracing::error!("Failed to serialize webhook event {}: {}", event.event, e);
                return;
            }
        };

        tracing::debug!(
            "Dispatching {} for notification {} to {} endpoint(s)",
            event.event,
            event.notification_id,
            matching.len()
        );
        for endpoint in matching {
            let delivery = self.delivery.clone();
            let body = body.clone();
            let event_name = event.event.clone();
            self.tracker
                .spawn(async move { delivery.deliver(endpoint, &event_name, &body).await });
        }
    }

    /// Puts a disabled endpoint back into rotation with a clean failure count.
    pub async fn reactivate(&self, endpoint_id: Uuid) -> Result<bool, CourierError> {
        let found = self.delivery.webhooks.reactivate(endpoint_id).await?;
        if found {
            tracing::info!("Reactivated webhook {}", endpoint_id);
        }
        Ok(found)
    }

    /// Resolves once every delivery spawned so far has finished.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }
}

impl Delivery {
    async fn deliver(&self, endpoint: WebhookSubscription, event_name: &str, body: &str) {
        let timestamp = self.clock.now().timestamp();
        let signature = compute_signature(&endpoint.secret, timestamp, body.as_bytes());

        let outcome = self
            .client
            .post(&endpoint.url)
            .header("Content-Type", "application/json")
            .header(SIGNATURE_HEADER, signature)
            .header(TIMESTAMP_HEADER, timestamp.to_string())
            .header(WEBHOOK_ID_HEADER, endpoint.id.to_string())
            .header(EVENT_HEADER, event_name)
            .body(body.to_string())
            .send()
            .await;

        let failure = match outcome {
            Ok(response) if response.status().is_success() => None,
            Ok(response) => Some(format!("endpoint returned {}", response.status())),
            Err(e) if e.is_timeout() => Some("request timed out".to_string()),
            Err(e) => Some(format!("request failed: {}", e)),
        };

        let now = self.clock.now();
        match failure {
            None => {
                tracing::debug!("Webhook {} accepted {}", endpoint.id, event_name);
                if let Err(e) = self.webhooks.record_success(endpoint.id, now).await {
                    tracing::error!("Failed to record success for webhook {}: {}", endpoint.id, e);
                }
            }
            Some(reason) => {
                tracing::warn!(
                    "Webhook {} delivery of {} to {} failed: {}",
                    endpoint.id,
                    event_name,
                    endpoint.url,
                    reason
                );
                match self
                    .webhooks
                    .record_failure(endpoint.id, now, self.failure_threshold)
                    .await
                {
                    Ok(updated) if !updated.is_active && endpoint.is_active => {
                        tracing::warn!(
                            "Disabled webhook {} after {} consecutive failures",
                            endpoint.id,
                            updated.failure_count
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!("Failed to record failure for webhook {}: {}", endpoint.id, e);
                    }
                }
            }
        }
    }
}
