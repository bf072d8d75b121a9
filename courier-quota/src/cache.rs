//! Subscription cache for credential validation.
//!
//! Entries hold only the fields that change through explicit administrative
//! action (status, expiry, permitted channels, owner active flag). Usage
//! counters are never cached; the validator re-reads them on every call.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use courier_core::{Channel, SubscriptionRecord, SubscriptionStatus};

#[derive(Debug, Clone, PartialEq)]
pub struct CachedSubscription {
    pub subscription_id: Uuid,
    pub user_id: Uuid,
    pub api_key: String,
    pub status: SubscriptionStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub allow_email: bool,
    pub allow_sms: bool,
    pub user_active: bool,
}

impl CachedSubscription {
    pub fn allows(&self, channel: Channel) -> bool {
        match channel {
            Channel::Email => self.allow_email,
            Channel::Sms => self.allow_sms,
        }
    }
}

impl From<&SubscriptionRecord> for CachedSubscription {
    fn from(record: &SubscriptionRecord) -> Self {
        let sub = &record.subscription;
        Self {
            subscription_id: sub.id,
            user_id: sub.user_id,
            api_key: sub.api_key.clone(),
            status: sub.status,
            expires_at: sub.expires_at,
            allow_email: sub.allow_email,
            allow_sms: sub.allow_sms,
            user_active: record.user_active,
        }
    }
}

struct CachedEntry {
    value: CachedSubscription,
    expires_at: DateTime<Utc>,
}

/// TTL cache addressable by API key and by subscription id.
pub struct SubscriptionCache {
    by_key: DashMap<String, Uuid>,
    by_id: DashMap<Uuid, CachedEntry>,
    ttl: Duration,
}

impl SubscriptionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            by_key: DashMap::new(),
            by_id: DashMap::new(),
            ttl,
        }
    }

    pub fn get_by_id(&self, id: Uuid, now: DateTime<Utc>) -> Option<CachedSubscription> {
        let entry = self.by_id.get(&id)?;
        if entry.expires_at > now {
            return Some(entry.value.clone());
        }
        drop(entry);
        self.invalidate(id);
        None
    }

    pub fn get_by_key(&self, api_key: &str, now: DateTime<Utc>) -> Option<CachedSubscription> {
        let id = *self.by_key.get(api_key)?;
        self.get_by_id(id, now)
    }

    pub fn insert(&self, value: CachedSubscription, now: DateTime<Utc>) {
        self.by_key.insert(value.api_key.clone(), value.subscription_id);
        self.by_id.insert(
            value.subscription_id,
            CachedEntry {
                value,
                expires_at: now + self.ttl,
            },
        );
    }

    pub fn invalidate(&self, id: Uuid) {
        if let Some((_, entry)) = self.by_id.remove(&id) {
            self.by_key.remove(&entry.value.api_key);
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
