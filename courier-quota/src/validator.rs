use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing;
use uuid::Uuid;

use courier_core::config::QuotaConfig;
use courier_core::store::SubscriptionStore;
use courier_core::{Channel, CourierError, Rejection, SharedClock, Subscription, SubscriptionStatus};

use crate::cache::{CachedSubscription, SubscriptionCache};
use crate::period;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub user_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    #[serde(skip)]
    pub error: Option<Rejection>,
    pub allow_email: bool,
    pub allow_sms: bool,
    pub remaining_daily: i32,
    pub remaining_monthly: i32,
}

impl ValidationResult {
    fn rejected(error: Rejection) -> Self {
        Self {
            valid: false,
            user_id: None,
            subscription_id: None,
            error: Some(error),
            allow_email: false,
            allow_sms: false,
            remaining_daily: 0,
            remaining_monthly: 0,
        }
    }

    fn for_subscription(cached: &CachedSubscription, live: &Subscription) -> Self {
        Self {
            valid: true,
            user_id: Some(cached.user_id),
            subscription_id: Some(cached.subscription_id),
            error: None,
            allow_email: cached.allow_email,
            allow_sms: cached.allow_sms,
            remaining_daily: live.remaining_daily(),
            remaining_monthly: live.remaining_monthly(),
        }
    }

    fn fail(mut self, error: Rejection) -> Self {
        self.valid = false;
        self.error = Some(error);
        self
    }

    /// Converts a rejected result into an error for callers that only care
    /// about pass/fail.
    pub fn into_result(self) -> Result<Self, CourierError> {
        match self.error {
            Some(rejection) => Err(rejection.into()),
            None => Ok(self),
        }
    }

    pub fn error_code(&self) -> Option<&'static str> {
        self.error.as_ref().map(Rejection::code)
    }
}

/// Credential validation and per-period send quotas.
pub struct QuotaValidator {
    subscriptions: Arc<dyn SubscriptionStore>,
    cache: SubscriptionCache,
    clock: SharedClock,
    config: QuotaConfig,
}

impl QuotaValidator {
    pub fn new(subscriptions: Arc<dyn SubscriptionStore>, clock: SharedClock, config: QuotaConfig) -> Self {
        let ttl = chrono::Duration::seconds(config.cache_ttl_secs as i64);
        Self {
            subscriptions,
            cache: SubscriptionCache::new(ttl),
            clock,
            config,
        }
    }

    /// Authenticates `api_key` and reports remaining quota. Domain failures
    /// come back as an invalid result; only storage problems are errors.
    pub async fn validate(&self, api_key: &str) -> Result<ValidationResult, CourierError> {
        if api_key.trim().is_empty() {
            return Ok(ValidationResult::rejected(Rejection::MissingApiKey));
        }

        let now = self.clock.now();
        let (cached, live) = match self.cache.get_by_key(api_key, now) {
            Some(cached) => {
                let Some(record) = self.subscriptions.get_subscription(cached.subscription_id).await? else {
                    self.cache.invalidate(cached.subscription_id);
                    return Ok(ValidationResult::rejected(Rejection::SubscriptionNotFound));
                };
                (cached, record.subscription)
            }
            None => {
                let Some(record) = self.subscriptions.find_by_api_key(api_key).await? else {
                    tracing::debug!("Rejected unknown API key");
                    return Ok(ValidationResult::rejected(Rejection::InvalidApiKey));
                };
                let cached = CachedSubscription::from(&record);
                self.cache.insert(cached.clone(), now);
                (cached, record.subscription)
            }
        };

        self.check(&cached, live, None, now).await
    }

    /// Same checks as [`validate`](Self::validate) for a subscription the
    /// caller has already authenticated, plus the channel permission.
    pub async fn can_send(
        &self,
        subscription_id: Uuid,
        channel: Channel,
    ) -> Result<ValidationResult, CourierError> {
        let now = self.clock.now();
        let Some(record) = self.subscriptions.get_subscription(subscription_id).await? else {
            self.cache.invalidate(subscription_id);
            return Ok(ValidationResult::rejected(Rejection::SubscriptionNotFound));
        };

        let cached = match self.cache.get_by_id(subscription_id, now) {
            Some(cached) => cached,
            None => {
                let cached = CachedSubscription::from(&record);
                self.cache.insert(cached.clone(), now);
                cached
            }
        };

        self.check(&cached, record.subscription, Some(channel), now).await
    }

    async fn check(
        &self,
        cached: &CachedSubscription,
        mut live: Subscription,
        channel: Option<Channel>,
        now: DateTime<Utc>,
    ) -> Result<ValidationResult, CourierError> {
        let result = ValidationResult::for_subscription(cached, &live);

        if cached.status != SubscriptionStatus::Active {
            return Ok(result.fail(Rejection::SubscriptionInactive(cached.status)));
        }
        if cached.expires_at.map_or(false, |at| at <= now) {
            return Ok(result.fail(Rejection::SubscriptionExpired));
        }
        if !cached.user_active {
            return Ok(result.fail(Rejection::UserInactive));
        }
        if let Some(channel) = channel {
            if !cached.allows(channel) {
                return Ok(result.fail(Rejection::ChannelNotAllowed(channel)));
            }
        }

        if period::apply_resets(&mut live, now) {
            live = self.persist_reset(live).await?;
        }

        let result = ValidationResult::for_subscription(cached, &live);
        if live.remaining_daily() <= 0 {
            return Ok(result.fail(Rejection::DailyLimitExceeded {
                limit: live.daily_limit,
            }));
        }
        if live.remaining_monthly() <= 0 {
            return Ok(result.fail(Rejection::MonthlyLimitExceeded {
                limit: live.monthly_limit,
            }));
        }

        Ok(result)
    }

    /// A conflicting writer has already applied the same reset or a newer
    /// increment, so losing the version check is fine.
    async fn persist_reset(&self, reset: Subscription) -> Result<Subscription, CourierError> {
        match self.subscriptions.update_usage(&reset).await {
            Ok(stored) => {
                tracing::info!("Reset usage counters for subscription {}", stored.id);
                Ok(stored)
            }
            Err(CourierError::Conflict { .. }) => Ok(reset),
            Err(e) => Err(e),
        }
    }

    /// Adds one send to the daily and monthly counters. Lost version races
    /// redo the whole read-modify-write with a growing delay.
    pub async fn increment_usage(&self, subscription_id: Uuid) -> Result<Subscription, CourierError> {
        let attempts = self.config.max_increment_attempts.max(1);

        for attempt in 1..=attempts {
            let record = self
                .subscriptions
                .get_subscription(subscription_id)
                .await?
                .ok_or(CourierError::NotFound {
                    entity: "subscription",
                    id: subscription_id,
                })?;

            let mut subscription = record.subscription;
            period::apply_resets(&mut subscription, self.clock.now());
            subscription.daily_used += 1;
            subscription.monthly_used += 1;

            match self.subscriptions.update_usage(&subscription).await {
                Ok(stored) => return Ok(stored),
                Err(CourierError::Conflict { .. }) if attempt < attempts => {
                    let delay = self.config.increment_base_delay_ms * attempt as u64;
                    tracing::warn!(
                        "Usage update conflict for subscription {} (attempt {}/{}), retrying in {}ms",
                        subscription_id,
                        attempt,
                        attempts,
                        delay
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => {
                    if matches!(e, CourierError::Conflict { .. }) {
                        tracing::error!(
                            "Giving up on usage update for subscription {} after {} attempts",
                            subscription_id,
                            attempts
                        );
                    }
                    return Err(e);
                }
            }
        }

        Err(CourierError::Conflict {
            entity: "subscription",
            id: subscription_id,
        })
    }

    pub fn invalidate(&self, subscription_id: Uuid) {
        self.cache.invalidate(subscription_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use courier_core::{ManualClock, MemoryStore, SubscriptionRecord};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 31, 9, 0, 0).unwrap()
    }

    fn subscription(api_key: &str, daily_limit: i32, monthly_limit: i32) -> Subscription {
        Subscription {
            id: Uuid::new_v4(),
            api_key: api_key.to_string(),
            user_id: Uuid::new_v4(),
            status: SubscriptionStatus::Active,
            expires_at: None,
            daily_limit,
            monthly_limit,
            daily_used: 0,
            monthly_used: 0,
            last_reset_daily: start(),
            last_reset_monthly: start(),
            allow_email: true,
            allow_sms: false,
            version: 0,
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        validator: Arc<QuotaValidator>,
    }

    fn fixture_with(store: Arc<MemoryStore>, subscriptions: Arc<dyn SubscriptionStore>, config: QuotaConfig) -> Fixture {
        let clock = Arc::new(ManualClock::new(start()));
        let validator = Arc::new(QuotaValidator::new(subscriptions, clock.clone(), config));
        Fixture { store, clock, validator }
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        fixture_with(store.clone(), store, QuotaConfig::default())
    }

    #[tokio::test]
    async fn test_valid_key_reports_remaining() {
        let f = fixture();
        let sub = subscription("sk_test", 10, 100);
        f.store.insert_subscription(sub.clone(), true).await;

        let result = f.validator.validate("sk_test").await.unwrap();
        assert!(result.valid);
        assert_eq!(result.subscription_id, Some(sub.id));
        assert_eq!(result.user_id, Some(sub.user_id));
        assert!(result.allow_email);
        assert!(!result.allow_sms);
        assert_eq!(result.remaining_daily, 10);
        assert_eq!(result.remaining_monthly, 100);
    }

    #[tokio::test]
    async fn test_rejection_reasons() {
        let f = fixture();

        let result = f.validator.validate("  ").await.unwrap();
        assert_eq!(result.error, Some(Rejection::MissingApiKey));

        let result = f.validator.validate("sk_unknown").await.unwrap();
        assert_eq!(result.error, Some(Rejection::InvalidApiKey));

        let mut suspended = subscription("sk_suspended", 10, 100);
        suspended.status = SubscriptionStatus::Suspended;
        f.store.insert_subscription(suspended, true).await;
        let result = f.validator.validate("sk_suspended").await.unwrap();
        assert_eq!(
            result.error,
            Some(Rejection::SubscriptionInactive(SubscriptionStatus::Suspended))
        );

        let mut expired = subscription("sk_expired", 10, 100);
        expired.expires_at = Some(start() - ChronoDuration::days(1));
        f.store.insert_subscription(expired, true).await;
        let result = f.validator.validate("sk_expired").await.unwrap();
        assert_eq!(result.error, Some(Rejection::SubscriptionExpired));

        f.store.insert_subscription(subscription("sk_orphan", 10, 100), false).await;
        let result = f.validator.validate("sk_orphan").await.unwrap();
        assert_eq!(result.error, Some(Rejection::UserInactive));
        assert_eq!(result.error_code(), Some("user_inactive"));
    }

    #[tokio::test]
    async fn test_can_send_checks_channel() {
        let f = fixture();
        let sub = subscription("sk_test", 10, 100);
        f.store.insert_subscription(sub.clone(), true).await;

        assert!(f.validator.can_send(sub.id, Channel::Email).await.unwrap().valid);
        let result = f.validator.can_send(sub.id, Channel::Sms).await.unwrap();
        assert_eq!(result.error, Some(Rejection::ChannelNotAllowed(Channel::Sms)));
        assert!(result.into_result().is_err());

        let result = f.validator.can_send(Uuid::new_v4(), Channel::Email).await.unwrap();
        assert_eq!(result.error, Some(Rejection::SubscriptionNotFound));
    }

    #[tokio::test]
    async fn test_daily_quota_rolls_over_at_midnight() {
        let f = fixture();
        let sub = subscription("sk_test", 2, 100);
        f.store.insert_subscription(sub.clone(), true).await;

        f.validator.increment_usage(sub.id).await.unwrap();
        f.validator.increment_usage(sub.id).await.unwrap();
        let result = f.validator.validate("sk_test").await.unwrap();
        assert_eq!(result.error, Some(Rejection::DailyLimitExceeded { limit: 2 }));
        assert_eq!(result.remaining_daily, 0);

        f.clock.set(Utc.with_ymd_and_hms(2024, 1, 31, 23, 59, 59).unwrap());
        assert!(!f.validator.validate("sk_test").await.unwrap().valid);

        f.clock.set(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
        let result = f.validator.validate("sk_test").await.unwrap();
        assert!(result.valid);
        assert_eq!(result.remaining_daily, 2);
        // A new month started at the same instant.
        assert_eq!(result.remaining_monthly, 100);

        let stored = f.store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.subscription.daily_used, 0);
    }

    #[tokio::test]
    async fn test_monthly_quota_survives_daily_reset() {
        let f = fixture();
        let mut sub = subscription("sk_test", 10, 3);
        sub.last_reset_daily = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
        sub.last_reset_monthly = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        f.clock.set(Utc.with_ymd_and_hms(2024, 1, 10, 9, 0, 0).unwrap());
        f.store.insert_subscription(sub.clone(), true).await;

        for _ in 0..3 {
            f.validator.increment_usage(sub.id).await.unwrap();
        }

        f.clock.advance(ChronoDuration::days(1));
        let result = f.validator.validate("sk_test").await.unwrap();
        assert_eq!(result.error, Some(Rejection::MonthlyLimitExceeded { limit: 3 }));
        assert_eq!(result.remaining_daily, 10);

        f.clock.set(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 1).unwrap());
        assert!(f.validator.validate("sk_test").await.unwrap().valid);
    }

    #[tokio::test]
    async fn test_cached_fields_until_invalidated() {
        let f = fixture();
        let sub = subscription("sk_test", 10, 100);
        f.store.insert_subscription(sub.clone(), true).await;
        assert!(f.validator.validate("sk_test").await.unwrap().valid);

        let mut suspended = sub.clone();
        suspended.status = SubscriptionStatus::Suspended;
        f.store.insert_subscription(suspended, true).await;
        assert!(f.validator.validate("sk_test").await.unwrap().valid);

        f.validator.invalidate(sub.id);
        let result = f.validator.validate("sk_test").await.unwrap();
        assert_eq!(
            result.error,
            Some(Rejection::SubscriptionInactive(SubscriptionStatus::Suspended))
        );
    }

    #[tokio::test]
    async fn test_counters_are_never_cached() {
        let f = fixture();
        let sub = subscription("sk_test", 10, 100);
        f.store.insert_subscription(sub.clone(), true).await;
        assert_eq!(f.validator.validate("sk_test").await.unwrap().remaining_daily, 10);

        f.validator.increment_usage(sub.id).await.unwrap();
        assert_eq!(f.validator.validate("sk_test").await.unwrap().remaining_daily, 9);
    }

    /// Yields between the read and the write so concurrent increments
    /// interleave and lose version checks.
    struct ContendedStore {
        inner: Arc<MemoryStore>,
    }

    #[async_trait]
    impl SubscriptionStore for ContendedStore {
        async fn find_by_api_key(
            &self,
            api_key: &str,
        ) -> Result<Option<SubscriptionRecord>, CourierError> {
            self.inner.find_by_api_key(api_key).await
        }

        async fn get_subscription(&self, id: Uuid) -> Result<Option<SubscriptionRecord>, CourierError> {
            let record = self.inner.get_subscription(id).await;
            tokio::task::yield_now().await;
            record
        }

        async fn update_usage(&self, subscription: &Subscription) -> Result<Subscription, CourierError> {
            self.inner.update_usage(subscription).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_increments_are_not_lost() {
        const TASKS: usize = 8;
        let store = Arc::new(MemoryStore::new());
        let contended = Arc::new(ContendedStore { inner: store.clone() });
        let config = QuotaConfig {
            max_increment_attempts: TASKS as u32,
            ..QuotaConfig::default()
        };
        let f = fixture_with(store, contended, config);
        let sub = subscription("sk_test", 100, 1000);
        f.store.insert_subscription(sub.clone(), true).await;

        let id = sub.id;
        let handles: Vec<_> = (0..TASKS)
            .map(|_| {
                let validator = f.validator.clone();
                tokio::spawn(async move { validator.increment_usage(id).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stored = f.store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.subscription.daily_used, TASKS as i32);
        assert_eq!(stored.subscription.monthly_used, TASKS as i32);
        assert_eq!(stored.subscription.version, TASKS as i64);
    }

    struct AlwaysConflicting {
        inner: Arc<MemoryStore>,
    }

    #[async_trait]
    impl SubscriptionStore for AlwaysConflicting {
        async fn find_by_api_key(
            &self,
            api_key: &str,
        ) -> Result<Option<SubscriptionRecord>, CourierError> {
            self.inner.find_by_api_key(api_key).await
        }

        async fn get_subscription(&self, id: Uuid) -> Result<Option<SubscriptionRecord>, CourierError> {
            self.inner.get_subscription(id).await
        }

        async fn update_usage(&self, subscription: &Subscription) -> Result<Subscription, CourierError> {
            Err(CourierError::Conflict {
                entity: "subscription",
                id: subscription.id,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_increment_gives_up_with_retryable_conflict() {
        let store = Arc::new(MemoryStore::new());
        let conflicting = Arc::new(AlwaysConflicting { inner: store.clone() });
        let f = fixture_with(store, conflicting, QuotaConfig::default());
        let sub = subscription("sk_test", 100, 1000);
        f.store.insert_subscription(sub.clone(), true).await;

        let started = tokio::time::Instant::now();
        let err = f.validator.increment_usage(sub.id).await.unwrap_err();
        assert!(matches!(err, CourierError::Conflict { .. }));
        assert!(err.is_retryable());
        // 50ms after the first attempt, 100ms after the second.
        assert!(started.elapsed() >= Duration::from_millis(150));
    }
}
