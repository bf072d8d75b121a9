use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use std::sync::Arc;
use uuid::Uuid;

use super::{NotificationStore, OutboxStore, SubscriptionStore, WebhookStore};
use crate::db::{DbConnection, DbPool};
use crate::error::CourierError;
use crate::schema::{
    notification_logs, notifications, outbox_messages, subscriptions, users,
    webhook_subscriptions,
};
use crate::types::{
    Notification, NotificationFilter, NotificationLog, NotificationStatus, OutboxMessage,
    Subscription, SubscriptionRecord, WebhookSubscription,
};

impl From<DieselError> for CourierError {
    fn from(err: DieselError) -> Self {
        CourierError::Storage(err.to_string())
    }
}

#[derive(Queryable, Selectable, Insertable)]
#[diesel(table_name = notifications)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct NotificationRow {
    id: Uuid,
    channel: String,
    priority: String,
    recipient: String,
    subject: Option<String>,
    body: String,
    status: String,
    retry_count: i32,
    max_retries: i32,
    idempotency_key: Option<String>,
    correlation_id: Option<String>,
    scheduled_at: Option<DateTime<Utc>>,
    user_id: Uuid,
    subscription_id: Uuid,
    error_message: Option<String>,
    provider_message_id: Option<String>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<&Notification> for NotificationRow {
    fn from(n: &Notification) -> Self {
        Self {
            id: n.id,
            channel: n.channel.as_str().to_string(),
            priority: n.priority.as_str().to_string(),
            recipient: n.recipient.clone(),
            subject: n.subject.clone(),
            body: n.body.clone(),
            status: n.status.as_str().to_string(),
            retry_count: n.retry_count,
            max_retries: n.max_retries,
            idempotency_key: n.idempotency_key.clone(),
            correlation_id: n.correlation_id.clone(),
            scheduled_at: n.scheduled_at,
            user_id: n.user_id,
            subscription_id: n.subscription_id,
            error_message: n.error_message.clone(),
            provider_message_id: n.provider_message_id.clone(),
            version: n.version,
            created_at: n.created_at,
            updated_at: n.updated_at,
        }
    }
}

impl TryFrom<NotificationRow> for Notification {
    type Error = CourierError;

    fn try_from(row: NotificationRow) -> Result<Self, Self::Error> {
        Ok(Notification {
            id: row.id,
            channel: row.channel.parse()?,
            priority: row.priority.parse()?,
            recipient: row.recipient,
            subject: row.subject,
            body: row.body,
            status: row.status.parse()?,
            retry_count: row.retry_count,
            max_retries: row.max_retries,
            idempotency_key: row.idempotency_key,
            correlation_id: row.correlation_id,
            scheduled_at: row.scheduled_at,
            user_id: row.user_id,
            subscription_id: row.subscription_id,
            error_message: row.error_message,
            provider_message_id: row.provider_message_id,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Queryable, Selectable, Insertable)]
#[diesel(table_name = notification_logs)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct NotificationLogRow {
    id: Uuid,
    notification_id: Uuid,
    status: String,
    message: String,
    provider_response: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<&NotificationLog> for NotificationLogRow {
    fn from(log: &NotificationLog) -> Self {
        Self {
            id: log.id,
            notification_id: log.notification_id,
            status: log.status.as_str().to_string(),
            message: log.message.clone(),
            provider_response: log.provider_response.clone(),
            created_at: log.created_at,
        }
    }
}

impl TryFrom<NotificationLogRow> for NotificationLog {
    type Error = CourierError;

    fn try_from(row: NotificationLogRow) -> Result<Self, Self::Error> {
        Ok(NotificationLog {
            id: row.id,
            notification_id: row.notification_id,
            status: row.status.parse()?,
            message: row.message,
            provider_response: row.provider_response,
            created_at: row.created_at,
        })
    }
}

#[derive(Queryable, Selectable, Insertable)]
#[diesel(table_name = outbox_messages)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct OutboxRow {
    id: Uuid,
    message_type: String,
    aggregate_id: Uuid,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    attempts: i32,
    last_error: Option<String>,
}

impl From<&OutboxMessage> for OutboxRow {
    fn from(m: &OutboxMessage) -> Self {
        Self {
            id: m.id,
            message_type: m.message_type.clone(),
            aggregate_id: m.aggregate_id,
            payload: m.payload.clone(),
            created_at: m.created_at,
            processed_at: m.processed_at,
            attempts: m.attempts,
            last_error: m.last_error.clone(),
        }
    }
}

impl From<OutboxRow> for OutboxMessage {
    fn from(row: OutboxRow) -> Self {
        OutboxMessage {
            id: row.id,
            message_type: row.message_type,
            aggregate_id: row.aggregate_id,
            payload: row.payload,
            created_at: row.created_at,
            processed_at: row.processed_at,
            attempts: row.attempts,
            last_error: row.last_error,
        }
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = subscriptions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct SubscriptionRow {
    id: Uuid,
    api_key: String,
    user_id: Uuid,
    status: String,
    expires_at: Option<DateTime<Utc>>,
    daily_limit: i32,
    monthly_limit: i32,
    daily_used: i32,
    monthly_used: i32,
    last_reset_daily: DateTime<Utc>,
    last_reset_monthly: DateTime<Utc>,
    allow_email: bool,
    allow_sms: bool,
    version: i64,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = CourierError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Subscription {
            id: row.id,
            api_key: row.api_key,
            user_id: row.user_id,
            status: row.status.parse()?,
            expires_at: row.expires_at,
            daily_limit: row.daily_limit,
            monthly_limit: row.monthly_limit,
            daily_used: row.daily_used,
            monthly_used: row.monthly_used,
            last_reset_daily: row.last_reset_daily,
            last_reset_monthly: row.last_reset_monthly,
            allow_email: row.allow_email,
            allow_sms: row.allow_sms,
            version: row.version,
        })
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = webhook_subscriptions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct WebhookRow {
    id: Uuid,
    subscription_id: Uuid,
    url: String,
    secret: String,
    events: String,
    is_active: bool,
    failure_count: i32,
    last_success_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<WebhookRow> for WebhookSubscription {
    fn from(row: WebhookRow) -> Self {
        WebhookSubscription {
            id: row.id,
            subscription_id: row.subscription_id,
            url: row.url,
            secret: row.secret,
            events: row.events,
            is_active: row.is_active,
            failure_count: row.failure_count,
            last_success_at: row.last_success_at,
            last_failure_at: row.last_failure_at,
            created_at: row.created_at,
        }
    }
}

fn record_from((row, user_active): (SubscriptionRow, bool)) -> Result<SubscriptionRecord, CourierError> {
    Ok(SubscriptionRecord {
        subscription: row.try_into()?,
        user_active,
    })
}

/// Postgres-backed implementation of every store trait.
#[derive(Clone)]
pub struct PgStore {
    pool: Arc<DbPool>,
}

impl PgStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<DbConnection, CourierError> {
        self.pool.get().await.map_err(CourierError::storage)
    }
}

#[async_trait]
impl NotificationStore for PgStore {
    async fn create(
        &self,
        notification: &Notification,
        log: &NotificationLog,
        outbox: &OutboxMessage,
    ) -> Result<(), CourierError> {
        let row = NotificationRow::from(notification);
        let log_row = NotificationLogRow::from(log);
        let outbox_row = OutboxRow::from(outbox);
        let mut conn = self.conn().await?;

        conn.transaction::<_, DieselError, _>(|conn| {
            async move {
                diesel::insert_into(notifications::table)
                    .values(&row)
                    .execute(conn)
                    .await?;
                diesel::insert_into(notification_logs::table)
                    .values(&log_row)
                    .execute(conn)
                    .await?;
                diesel::insert_into(outbox_messages::table)
                    .values(&outbox_row)
                    .execute(conn)
                    .await?;
                Ok(())
            }
            .scope_boxed()
        })
        .await
        .map_err(|err| match (err, &notification.idempotency_key) {
            (DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _), Some(key)) => {
                CourierError::DuplicateIdempotencyKey(key.clone())
            }
            (err, _) => err.into(),
        })
    }

    async fn get_notification(&self, id: Uuid) -> Result<Option<Notification>, CourierError> {
        let mut conn = self.conn().await?;
        notifications::table
            .find(id)
            .select(NotificationRow::as_select())
            .first(&mut conn)
            .await
            .optional()?
            .map(Notification::try_from)
            .transpose()
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Notification>, CourierError> {
        let mut conn = self.conn().await?;
        notifications::table
            .filter(notifications::idempotency_key.eq(key))
            .select(NotificationRow::as_select())
            .first(&mut conn)
            .await
            .optional()?
            .map(Notification::try_from)
            .transpose()
    }

    async fn list(&self, filter: &NotificationFilter) -> Result<Vec<Notification>, CourierError> {
        let mut conn = self.conn().await?;
        let mut query = notifications::table.into_boxed();
        if let Some(user_id) = filter.user_id {
            query = query.filter(notifications::user_id.eq(user_id));
        }
        if let Some(subscription_id) = filter.subscription_id {
            query = query.filter(notifications::subscription_id.eq(subscription_id));
        }
        if let Some(status) = filter.status {
            query = query.filter(notifications::status.eq(status.as_str()));
        }

        let rows: Vec<NotificationRow> = query
            .order(notifications::created_at.desc())
            .limit(filter.limit)
            .offset(filter.offset)
            .select(NotificationRow::as_select())
            .load(&mut conn)
            .await?;
        rows.into_iter().map(Notification::try_from).collect()
    }

    async fn logs(&self, notification_id: Uuid) -> Result<Vec<NotificationLog>, CourierError> {
        let mut conn = self.conn().await?;
        let rows: Vec<NotificationLogRow> = notification_logs::table
            .filter(notification_logs::notification_id.eq(notification_id))
            .order(notification_logs::created_at.asc())
            .select(NotificationLogRow::as_select())
            .load(&mut conn)
            .await?;
        rows.into_iter().map(NotificationLog::try_from).collect()
    }

    async fn update(
        &self,
        notification: &Notification,
        log: &NotificationLog,
        outbox: Option<&OutboxMessage>,
    ) -> Result<Notification, CourierError> {
        let id = notification.id;
        let expected = notification.version;
        let status = notification.status.as_str();
        let retry_count = notification.retry_count;
        let error_message = notification.error_message.clone();
        let provider_message_id = notification.provider_message_id.clone();
        let updated_at = notification.updated_at;
        let log_row = NotificationLogRow::from(log);
        let outbox_row = outbox.map(OutboxRow::from);
        let mut conn = self.conn().await?;

        let changed = conn
            .transaction::<_, DieselError, _>(|conn| {
                async move {
                    let changed = diesel::update(
                        notifications::table
                            .filter(notifications::id.eq(id))
                            .filter(notifications::version.eq(expected)),
                    )
                    .set((
                        notifications::status.eq(status),
                        notifications::retry_count.eq(retry_count),
                        notifications::error_message.eq(error_message),
                        notifications::provider_message_id.eq(provider_message_id),
                        notifications::version.eq(expected + 1),
                        notifications::updated_at.eq(updated_at),
                    ))
                    .execute(conn)
                    .await?;
                    if changed == 0 {
                        return Ok(false);
                    }

                    diesel::insert_into(notification_logs::table)
                        .values(&log_row)
                        .execute(conn)
                        .await?;
                    if let Some(outbox_row) = outbox_row {
                        diesel::insert_into(outbox_messages::table)
                            .values(&outbox_row)
                            .execute(conn)
                            .await?;
                    }
                    Ok(true)
                }
                .scope_boxed()
            })
            .await?;

        if !changed {
            return Err(CourierError::Conflict {
                entity: "notification",
                id,
            });
        }

        let mut stored = notification.clone();
        stored.version = expected + 1;
        Ok(stored)
    }

    async fn due_scheduled(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Notification>, CourierError> {
        let mut conn = self.conn().await?;
        let rows: Vec<NotificationRow> = notifications::table
            .filter(notifications::status.eq(NotificationStatus::Pending.as_str()))
            .filter(notifications::scheduled_at.is_not_null())
            .filter(notifications::scheduled_at.le(now))
            .order(notifications::scheduled_at.asc())
            .limit(limit)
            .select(NotificationRow::as_select())
            .load(&mut conn)
            .await?;
        rows.into_iter().map(Notification::try_from).collect()
    }
}

#[async_trait]
impl OutboxStore for PgStore {
    async fn fetch_pending(
        &self,
        message_type: &str,
        limit: i64,
        max_attempts: i32,
    ) -> Result<Vec<OutboxMessage>, CourierError> {
        let mut conn = self.conn().await?;
        let rows: Vec<OutboxRow> = outbox_messages::table
            .filter(outbox_messages::message_type.eq(message_type))
            .filter(outbox_messages::processed_at.is_null())
            .filter(outbox_messages::attempts.lt(max_attempts))
            .order(outbox_messages::created_at.asc())
            .limit(limit)
            .select(OutboxRow::as_select())
            .load(&mut conn)
            .await?;
        Ok(rows.into_iter().map(OutboxMessage::from).collect())
    }

    async fn mark_processed(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), CourierError> {
        let mut conn = self.conn().await?;
        diesel::update(outbox_messages::table.find(id))
            .set((
                outbox_messages::processed_at.eq(Some(at)),
                outbox_messages::last_error.eq(None::<String>),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn record_relay_failure(&self, id: Uuid, error: &str) -> Result<(), CourierError> {
        let mut conn = self.conn().await?;
        diesel::update(outbox_messages::table.find(id))
            .set((
                outbox_messages::attempts.eq(outbox_messages::attempts + 1),
                outbox_messages::last_error.eq(Some(error)),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for PgStore {
    async fn find_by_api_key(
        &self,
        api_key: &str,
    ) -> Result<Option<SubscriptionRecord>, CourierError> {
        let mut conn = self.conn().await?;
        subscriptions::table
            .inner_join(users::table)
            .filter(subscriptions::api_key.eq(api_key))
            .select((SubscriptionRow::as_select(), users::is_active))
            .first::<(SubscriptionRow, bool)>(&mut conn)
            .await
            .optional()?
            .map(record_from)
            .transpose()
    }

    async fn get_subscription(&self, id: Uuid) -> Result<Option<SubscriptionRecord>, CourierError> {
        let mut conn = self.conn().await?;
        subscriptions::table
            .inner_join(users::table)
            .filter(subscriptions::id.eq(id))
            .select((SubscriptionRow::as_select(), users::is_active))
            .first::<(SubscriptionRow, bool)>(&mut conn)
            .await
            .optional()?
            .map(record_from)
            .transpose()
    }

    async fn update_usage(
        &self,
        subscription: &Subscription,
    ) -> Result<Subscription, CourierError> {
        let mut conn = self.conn().await?;
        let row = diesel::update(
            subscriptions::table
                .filter(subscriptions::id.eq(subscription.id))
                .filter(subscriptions::version.eq(subscription.version)),
        )
        .set((
            subscriptions::daily_used.eq(subscription.daily_used),
            subscriptions::monthly_used.eq(subscription.monthly_used),
            subscriptions::last_reset_daily.eq(subscription.last_reset_daily),
            subscriptions::last_reset_monthly.eq(subscription.last_reset_monthly),
            subscriptions::version.eq(subscription.version + 1),
        ))
        .returning(SubscriptionRow::as_returning())
        .get_result(&mut conn)
        .await
        .optional()?;

        match row {
            Some(row) => row.try_into(),
            None => Err(CourierError::Conflict {
                entity: "subscription",
                id: subscription.id,
            }),
        }
    }
}

#[async_trait]
impl WebhookStore for PgStore {
    async fn active_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<WebhookSubscription>, CourierError> {
        let mut conn = self.conn().await?;
        let rows: Vec<WebhookRow> = webhook_subscriptions::table
            .filter(webhook_subscriptions::subscription_id.eq(subscription_id))
            .filter(webhook_subscriptions::is_active.eq(true))
            .select(WebhookRow::as_select())
            .load(&mut conn)
            .await?;
        Ok(rows.into_iter().map(WebhookSubscription::from).collect())
    }

    async fn get_webhook(&self, id: Uuid) -> Result<Option<WebhookSubscription>, CourierError> {
        let mut conn = self.conn().await?;
        let row = webhook_subscriptions::table
            .find(id)
            .select(WebhookRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(row.map(WebhookSubscription::from))
    }

    async fn record_success(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), CourierError> {
        let mut conn = self.conn().await?;
        diesel::update(webhook_subscriptions::table.find(id))
            .set((
                webhook_subscriptions::failure_count.eq(0),
                webhook_subscriptions::last_success_at.eq(Some(at)),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn record_failure(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        threshold: i32,
    ) -> Result<WebhookSubscription, CourierError> {
        let mut conn = self.conn().await?;
        // Right-hand sides see the pre-update row, so the new count is
        // failure_count + 1.
        let row = diesel::update(webhook_subscriptions::table.find(id))
            .set((
                webhook_subscriptions::failure_count.eq(webhook_subscriptions::failure_count + 1),
                webhook_subscriptions::last_failure_at.eq(Some(at)),
                webhook_subscriptions::is_active.eq(webhook_subscriptions::is_active
                    .and(webhook_subscriptions::failure_count.lt(threshold - 1))),
            ))
            .returning(WebhookRow::as_returning())
            .get_result(&mut conn)
            .await
            .optional()?;

        row.map(WebhookSubscription::from)
            .ok_or(CourierError::NotFound { entity: "webhook", id })
    }

    async fn reactivate(&self, id: Uuid) -> Result<bool, CourierError> {
        let mut conn = self.conn().await?;
        let changed = diesel::update(webhook_subscriptions::table.find(id))
            .set((
                webhook_subscriptions::is_active.eq(true),
                webhook_subscriptions::failure_count.eq(0),
            ))
            .execute(&mut conn)
            .await?;
        Ok(changed > 0)
    }
}
