use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use courier_core::config::{OutboxConfig, QuotaConfig, SchedulerConfig, WebhookConfig};
use courier_core::store::{NotificationStore, OutboxStore, SubscriptionStore};
use courier_core::template::{Template, TemplateRegistry};
use courier_core::{
    Channel, CourierError, DispatchQueue, ManualClock, MemoryStore, Notification,
    NotificationFilter, NotificationLog, NotificationStatus, OutboxMessage, Priority, Rejection,
    SharedClock, Subscription, SubscriptionRecord, SubscriptionStatus, NOTIFICATION_DISPATCH,
};
use courier_delivery::{DispatchWorker, SendReceipt, Transport, TransportRegistry};
use courier_outbox::{OutboxRelay, ScheduledReleasePoller};
use courier_quota::QuotaValidator;
use courier_service::{NotificationService, SendRequest};
use courier_webhook::WebhookFanout;

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 15, 10, 0, 0).unwrap()
}

fn subscription(daily_limit: i32) -> Subscription {
    Subscription {
        id: Uuid::new_v4(),
        api_key: format!("sk_{}", Uuid::new_v4().simple()),
        user_id: Uuid::new_v4(),
        status: SubscriptionStatus::Active,
        expires_at: None,
        daily_limit,
        monthly_limit: 1000,
        daily_used: 0,
        monthly_used: 0,
        last_reset_daily: start(),
        last_reset_monthly: start(),
        allow_email: true,
        allow_sms: false,
        version: 0,
    }
}

struct Pipeline {
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    queue: Arc<DispatchQueue>,
    webhooks: Arc<WebhookFanout>,
    service: NotificationService,
    subscription: Subscription,
}

impl Pipeline {
    async fn new(daily_limit: i32) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::with_notifications(store.clone(), store, daily_limit).await
    }

    async fn with_notifications(
        store: Arc<MemoryStore>,
        notifications: Arc<dyn NotificationStore>,
        daily_limit: i32,
    ) -> Self {
        Self::build(store.clone(), notifications, store, daily_limit).await
    }

    async fn build(
        store: Arc<MemoryStore>,
        notifications: Arc<dyn NotificationStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        daily_limit: i32,
    ) -> Self {
        let clock = Arc::new(ManualClock::new(start()));
        let shared: SharedClock = clock.clone();
        let queue = Arc::new(DispatchQueue::new());
        let quota = Arc::new(QuotaValidator::new(
            subscriptions,
            shared.clone(),
            QuotaConfig::default(),
        ));
        let webhooks = Arc::new(
            WebhookFanout::new(store.clone(), shared.clone(), &WebhookConfig::default()).unwrap(),
        );

        let templates = Arc::new(TemplateRegistry::new());
        templates.register(Template {
            id: "welcome".to_string(),
            subject: Some("Welcome, {{name}}".to_string()),
            body: "Hi {{name}}, your plan is {{plan}}.".to_string(),
        });

        let service = NotificationService::new(
            notifications,
            quota,
            queue.clone(),
            webhooks.clone(),
            shared,
        )
        .with_templates(templates);

        let subscription = subscription(daily_limit);
        store.insert_subscription(subscription.clone(), true).await;

        Self {
            store,
            clock,
            queue,
            webhooks,
            service,
            subscription,
        }
    }

    async fn send(&self, request: SendRequest) -> Result<courier_service::SendResponse, CourierError> {
        self.service
            .send(self.subscription.user_id, self.subscription.id, request)
            .await
    }

    async fn usage(&self) -> (i32, i32) {
        let record = self
            .store
            .get_subscription(self.subscription.id)
            .await
            .unwrap()
            .unwrap();
        (record.subscription.daily_used, record.subscription.monthly_used)
    }

    fn relay(&self) -> OutboxRelay {
        OutboxRelay::new(
            self.store.clone(),
            self.store.clone(),
            self.queue.clone(),
            self.clock.clone(),
            OutboxConfig::default(),
        )
    }

    fn worker(&self, transport: Arc<dyn Transport>) -> DispatchWorker {
        let mut registry = TransportRegistry::new();
        registry.register(transport);
        DispatchWorker::new(
            self.store.clone(),
            self.queue.clone(),
            Arc::new(registry),
            self.webhooks.clone(),
            self.clock.clone(),
            Duration::from_secs(5),
        )
    }
}

fn email(body: &str) -> SendRequest {
    SendRequest::new(Channel::Email, "ada@example.com", body)
}

struct AcceptingTransport {
    calls: AtomicUsize,
}

#[async_trait]
impl Transport for AcceptingTransport {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, notification: &Notification) -> Result<SendReceipt, CourierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(SendReceipt {
            provider_message_id: Some(format!("prov-{}", notification.id)),
            provider_response: None,
        })
    }

    async fn health_check(&self) -> bool {
        true
    }
}

#[tokio::test]
async fn test_immediate_send_persists_and_enqueues() {
    let p = Pipeline::new(10).await;
    let mut request = email("Your order shipped");
    request.priority = Priority::High;
    request.correlation_id = Some("order-7".to_string());

    let response = p.send(request).await.unwrap();
    assert_eq!(response.status, NotificationStatus::Processing);
    assert!(!response.was_idempotent);
    assert_eq!(response.created_at, start());

    let stored = p.store.get_notification(response.id).await.unwrap().unwrap();
    assert_eq!(stored.max_retries, 3);
    assert_eq!(stored.correlation_id.as_deref(), Some("order-7"));
    assert_eq!(p.queue.depth_of(Priority::High), 1);
    assert_eq!(p.store.logs(response.id).await.unwrap().len(), 1);

    let outbox = p.store.outbox_messages().await;
    assert_eq!(outbox.len(), 1);
    assert_eq!(outbox[0].aggregate_id, response.id);
    assert_eq!(p.usage().await, (1, 1));
}

#[tokio::test]
async fn test_idempotent_replay_has_no_side_effects() {
    let p = Pipeline::new(10).await;
    let mut request = email("Password reset");
    request.idempotency_key = Some("reset-123".to_string());

    let first = p.send(request.clone()).await.unwrap();
    let second = p.send(request).await.unwrap();

    assert_eq!(first.id, second.id);
    assert!(second.was_idempotent);
    assert_eq!(p.store.notification_count().await, 1);
    assert_eq!(p.queue.depth(), 1);
    assert_eq!(p.usage().await, (1, 1));
}

#[tokio::test]
async fn test_idempotency_key_is_not_shared_across_subscriptions() {
    let p = Pipeline::new(10).await;
    let mut request = email("Password reset");
    request.idempotency_key = Some("reset-123".to_string());
    p.send(request.clone()).await.unwrap();

    let other = subscription(10);
    p.store.insert_subscription(other.clone(), true).await;
    let err = p
        .service
        .send(other.user_id, other.id, request)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "validation_error");
}

/// Hides existing idempotency keys from the first lookup so the unique
/// constraint catches the duplicate instead.
struct RacingStore {
    inner: Arc<MemoryStore>,
    blind: AtomicBool,
}

#[async_trait]
impl NotificationStore for RacingStore {
    async fn create(
        &self,
        notification: &Notification,
        log: &NotificationLog,
        outbox: &OutboxMessage,
    ) -> Result<(), CourierError> {
        self.inner.create(notification, log, outbox).await
    }

    async fn get_notification(&self, id: Uuid) -> Result<Option<Notification>, CourierError> {
        self.inner.get_notification(id).await
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Notification>, CourierError> {
        if self.blind.swap(false, Ordering::SeqCst) {
            return Ok(None);
        }
        self.inner.find_by_idempotency_key(key).await
    }

    async fn list(&self, filter: &NotificationFilter) -> Result<Vec<Notification>, CourierError> {
        self.inner.list(filter).await
    }

    async fn logs(&self, notification_id: Uuid) -> Result<Vec<NotificationLog>, CourierError> {
        self.inner.logs(notification_id).await
    }

    async fn update(
        &self,
        notification: &Notification,
        log: &NotificationLog,
        outbox: Option<&OutboxMessage>,
    ) -> Result<Notification, CourierError> {
        self.inner.update(notification, log, outbox).await
    }

    async fn due_scheduled(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Notification>, CourierError> {
        self.inner.due_scheduled(now, limit).await
    }
}

#[tokio::test]
async fn test_lost_idempotency_race_replays_winner() {
    let store = Arc::new(MemoryStore::new());
    let racing = Arc::new(RacingStore {
        inner: store.clone(),
        blind: AtomicBool::new(false),
    });
    let p = Pipeline::with_notifications(store, racing.clone(), 10).await;

    let mut request = email("Receipt");
    request.idempotency_key = Some("receipt-9".to_string());
    let winner = p.send(request.clone()).await.unwrap();

    racing.blind.store(true, Ordering::SeqCst);
    let loser = p.send(request).await.unwrap();

    assert_eq!(loser.id, winner.id);
    assert!(loser.was_idempotent);
    assert_eq!(p.store.notification_count().await, 1);
    assert_eq!(p.usage().await, (1, 1));
}

/// Loses the version check on the first `conflicts` usage writes.
struct ContendedUsage {
    inner: Arc<MemoryStore>,
    conflicts: AtomicUsize,
}

#[async_trait]
impl SubscriptionStore for ContendedUsage {
    async fn find_by_api_key(&self, api_key: &str) -> Result<Option<SubscriptionRecord>, CourierError> {
        self.inner.find_by_api_key(api_key).await
    }

    async fn get_subscription(&self, id: Uuid) -> Result<Option<SubscriptionRecord>, CourierError> {
        self.inner.get_subscription(id).await
    }

    async fn update_usage(&self, subscription: &Subscription) -> Result<Subscription, CourierError> {
        let remaining = self.conflicts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.conflicts.store(remaining - 1, Ordering::SeqCst);
            return Err(CourierError::Conflict {
                entity: "subscription",
                id: subscription.id,
            });
        }
        self.inner.update_usage(subscription).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_committed_send_succeeds_when_charge_is_contended() {
    let store = Arc::new(MemoryStore::new());
    let contended = Arc::new(ContendedUsage {
        inner: store.clone(),
        // Outlasts the inline attempts so the charge has to be deferred.
        conflicts: AtomicUsize::new(QuotaConfig::default().max_increment_attempts as usize + 2),
    });
    let p = Pipeline::build(store.clone(), store, contended.clone(), 10).await;

    let response = p.send(email("Invoice ready")).await.unwrap();
    assert_eq!(response.status, NotificationStatus::Processing);
    assert!(!response.was_idempotent);
    assert_eq!(p.store.notification_count().await, 1);
    assert_eq!(p.queue.depth(), 1);
    assert_eq!(p.usage().await, (0, 0));
    assert_eq!(p.service.pending_charges(), 1);

    p.service.wait_idle().await;
    assert_eq!(contended.conflicts.load(Ordering::SeqCst), 0);
    assert_eq!(p.usage().await, (1, 1));
    assert_eq!(p.service.pending_charges(), 0);

    // The relay still sees exactly one item to deliver.
    let outcome = p.relay().process_batch().await.unwrap();
    assert_eq!(outcome.enqueued, 1);
    assert_eq!(p.store.notification_count().await, 1);
}

#[tokio::test]
async fn test_daily_quota_and_rollover() {
    let p = Pipeline::new(2).await;
    p.send(email("one")).await.unwrap();
    p.send(email("two")).await.unwrap();

    let err = p.send(email("three")).await.unwrap_err();
    assert!(matches!(
        err,
        CourierError::Rejected(Rejection::DailyLimitExceeded { limit: 2 })
    ));
    assert_eq!(p.store.notification_count().await, 2);

    p.clock.set(Utc.with_ymd_and_hms(2024, 3, 16, 0, 0, 0).unwrap());
    p.send(email("three, again")).await.unwrap();
    assert_eq!(p.usage().await, (1, 3));
}

#[tokio::test]
async fn test_rejections_leave_no_trace() {
    let p = Pipeline::new(10).await;

    let err = p.send(SendRequest::new(Channel::Email, "nobody", "hi")).await.unwrap_err();
    assert_eq!(err.code(), "validation_error");

    let err = p
        .send(SendRequest::new(Channel::Sms, "+15550100", "hi"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "channel_not_allowed");

    let mut templated = email("");
    templated.body = None;
    templated.template_id = Some("missing".to_string());
    let err = p.send(templated).await.unwrap_err();
    assert_eq!(err.code(), "template_not_found");

    assert_eq!(p.store.notification_count().await, 0);
    assert!(p.store.outbox_messages().await.is_empty());
    assert_eq!(p.queue.depth(), 0);
    assert_eq!(p.usage().await, (0, 0));
}

#[tokio::test]
async fn test_template_rendering() {
    let p = Pipeline::new(10).await;
    let mut request = email("");
    request.body = None;
    request.template_id = Some("welcome".to_string());
    request.template_data = HashMap::from([
        ("name".to_string(), json!("Ada")),
        ("plan".to_string(), json!("pro")),
    ]);

    let response = p.send(request).await.unwrap();
    let stored = p.store.get_notification(response.id).await.unwrap().unwrap();
    assert_eq!(stored.subject.as_deref(), Some("Welcome, Ada"));
    assert_eq!(stored.body, "Hi Ada, your plan is pro.");
}

#[tokio::test]
async fn test_scheduled_notification_waits_for_release() {
    let p = Pipeline::new(10).await;
    let mut request = email("Meeting in 15 minutes");
    request.scheduled_at = Some(start() + ChronoDuration::hours(1));

    let response = p.send(request).await.unwrap();
    assert_eq!(response.status, NotificationStatus::Pending);
    assert_eq!(p.queue.depth(), 0);
    // Quota is charged at acceptance time.
    assert_eq!(p.usage().await, (1, 1));

    // The relay does not dispatch pending notifications.
    let outcome = p.relay().process_batch().await.unwrap();
    assert_eq!(outcome.finalized, 1);
    assert_eq!(p.queue.depth(), 0);

    let poller = ScheduledReleasePoller::new(
        p.store.clone(),
        p.queue.clone(),
        p.clock.clone(),
        SchedulerConfig::default(),
    );
    assert_eq!(poller.release_due().await.unwrap(), 0);

    p.clock.advance(ChronoDuration::hours(1));
    assert_eq!(poller.release_due().await.unwrap(), 1);
    assert_eq!(p.queue.dequeue_next().unwrap().id, response.id);
}

#[tokio::test]
async fn test_cancel_and_retry_state_machine() {
    let p = Pipeline::new(10).await;

    let immediate = p.send(email("now")).await.unwrap();
    assert!(!p.service.cancel(immediate.id).await.unwrap());
    assert!(!p.service.retry(immediate.id).await.unwrap());

    let mut later = email("later");
    later.scheduled_at = Some(start() + ChronoDuration::days(1));
    let scheduled = p.send(later).await.unwrap();

    assert!(p.service.cancel(scheduled.id).await.unwrap());
    assert!(!p.service.cancel(scheduled.id).await.unwrap());

    let details = p.service.get_by_id(scheduled.id).await.unwrap().unwrap();
    assert_eq!(details.notification.status, NotificationStatus::Failed);
    assert_eq!(details.notification.error_message.as_deref(), Some("Cancelled by user"));
    assert_eq!(details.logs.len(), 2);
    assert_eq!(details.logs[1].message, "Cancelled by user");

    let depth_before = p.queue.depth();
    assert!(p.service.retry(scheduled.id).await.unwrap());
    let retried = p.store.get_notification(scheduled.id).await.unwrap().unwrap();
    assert_eq!(retried.status, NotificationStatus::Retrying);
    assert_eq!(retried.retry_count, 1);
    assert!(retried.error_message.is_none());
    assert_eq!(p.queue.depth(), depth_before + 1);

    assert!(!p.service.retry(scheduled.id).await.unwrap());
    assert!(!p.service.cancel(Uuid::new_v4()).await.unwrap());
    assert!(!p.service.retry(Uuid::new_v4()).await.unwrap());
}

#[tokio::test]
async fn test_outbox_recovers_dropped_enqueue() {
    let p = Pipeline::new(10).await;
    let response = p.send(email("Your code is 4242")).await.unwrap();

    // Simulate a restart: the in-memory queue entry is gone.
    assert!(p.queue.dequeue_next().is_some());
    assert_eq!(p.queue.depth(), 0);

    let outcome = p.relay().process_batch().await.unwrap();
    assert_eq!(outcome.enqueued, 1);

    let transport = Arc::new(AcceptingTransport {
        calls: AtomicUsize::new(0),
    });
    let worker = p.worker(transport.clone());
    let queued = p.queue.dequeue_next().unwrap();
    assert_eq!(queued.id, response.id);
    assert_eq!(worker.process(queued.clone()).await.unwrap(), Some(NotificationStatus::Sent));

    // A duplicate delivered by both paths is sent only once.
    assert_eq!(worker.process(queued).await.unwrap(), None);
    assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

    let stored = p.store.get_notification(response.id).await.unwrap().unwrap();
    assert_eq!(stored.status, NotificationStatus::Sent);
    assert_eq!(stored.provider_message_id, Some(format!("prov-{}", response.id)));
    assert!(p.store.fetch_pending(NOTIFICATION_DISPATCH, 100, 5).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_batch_reports_per_index() {
    let p = Pipeline::new(10).await;
    let requests = vec![
        email("first"),
        SendRequest::new(Channel::Sms, "+15550100", "not allowed"),
        SendRequest::new(Channel::Email, "", "no recipient"),
        email("fourth"),
    ];

    let batch = p
        .service
        .send_batch(p.subscription.user_id, p.subscription.id, requests)
        .await;

    assert_eq!(batch.succeeded, 2);
    assert_eq!(batch.failed, 2);
    assert!(batch.results[0].response.is_some());
    assert_eq!(batch.results[1].error.as_ref().unwrap().code, "channel_not_allowed");
    assert_eq!(batch.results[2].error.as_ref().unwrap().code, "validation_error");
    assert_eq!(batch.results[3].index, 3);
    assert!(batch.results[3].response.is_some());
}

#[tokio::test]
async fn test_list_filters() {
    let p = Pipeline::new(10).await;
    p.send(email("one")).await.unwrap();
    let mut later = email("two");
    later.scheduled_at = Some(start() + ChronoDuration::hours(3));
    p.send(later).await.unwrap();

    let all = p
        .service
        .list(&NotificationFilter {
            subscription_id: Some(p.subscription.id),
            ..NotificationFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(all.len(), 2);

    let pending = p
        .service
        .list(&NotificationFilter {
            status: Some(NotificationStatus::Pending),
            ..NotificationFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].body, "two");

    let page = p
        .service
        .list(&NotificationFilter {
            limit: 1,
            ..NotificationFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(page.len(), 1);
}
