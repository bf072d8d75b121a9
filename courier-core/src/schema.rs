use diesel::{allow_tables_to_appear_in_same_query, joinable, table};

table! {
    notifications (id) {
        id -> Uuid,
        channel -> Text,
        priority -> Text,
        recipient -> Text,
        subject -> Nullable<Text>,
        body -> Text,
        status -> Text,
        retry_count -> Integer,
        max_retries -> Integer,
        idempotency_key -> Nullable<Text>,
        correlation_id -> Nullable<Text>,
        scheduled_at -> Nullable<Timestamptz>,
        user_id -> Uuid,
        subscription_id -> Uuid,
        error_message -> Nullable<Text>,
        provider_message_id -> Nullable<Text>,
        version -> BigInt,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

table! {
    notification_logs (id) {
        id -> Uuid,
        notification_id -> Uuid,
        status -> Text,
        message -> Text,
        provider_response -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

table! {
    outbox_messages (id) {
        id -> Uuid,
        message_type -> Text,
        aggregate_id -> Uuid,
        payload -> Jsonb,
        created_at -> Timestamptz,
        processed_at -> Nullable<Timestamptz>,
        attempts -> Integer,
        last_error -> Nullable<Text>,
    }
}

table! {
    users (id) {
        id -> Uuid,
        is_active -> Bool,
    }
}

table! {
    subscriptions (id) {
        id -> Uuid,
        api_key -> Text,
        user_id -> Uuid,
        status -> Text,
        expires_at -> Nullable<Timestamptz>,
        daily_limit -> Integer,
        monthly_limit -> Integer,
        daily_used -> Integer,
        monthly_used -> Integer,
        last_reset_daily -> Timestamptz,
        last_reset_monthly -> Timestamptz,
        allow_email -> Bool,
        allow_sms -> Bool,
        version -> BigInt,
    }
}

table! {
    webhook_subscriptions (id) {
        id -> Uuid,
        subscription_id -> Uuid,
        url -> Text,
        secret -> Text,
        events -> Text,
        is_active -> Bool,
        failure_count -> Integer,
        last_success_at -> Nullable<Timestamptz>,
        last_failure_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
    }
}

joinable!(notification_logs -> notifications (notification_id));
joinable!(subscriptions -> users (user_id));

allow_tables_to_appear_in_same_query!(
    notifications,
    notification_logs,
    outbox_messages,
    users,
    subscriptions,
    webhook_subscriptions,
);
