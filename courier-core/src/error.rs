use thiserror::Error;
use uuid::Uuid;

use crate::types::{Channel, NotificationStatus, SubscriptionStatus};

/// Domain-rule violations. These carry a stable code for API clients and are
/// never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("API key is required")]
    MissingApiKey,

    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("Subscription not found")]
    SubscriptionNotFound,

    #[error("Subscription is {0}")]
    SubscriptionInactive(SubscriptionStatus),

    #[error("Subscription has expired")]
    SubscriptionExpired,

    #[error("User account is inactive")]
    UserInactive,

    #[error("Daily limit of {limit} notifications reached")]
    DailyLimitExceeded { limit: i32 },

    #[error("Monthly limit of {limit} notifications reached")]
    MonthlyLimitExceeded { limit: i32 },

    #[error("{0} notifications are not allowed for this subscription")]
    ChannelNotAllowed(Channel),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),
}

impl Rejection {
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::MissingApiKey => "missing_api_key",
            Rejection::InvalidApiKey => "invalid_api_key",
            Rejection::SubscriptionNotFound => "subscription_not_found",
            Rejection::SubscriptionInactive(_) => "subscription_inactive",
            Rejection::SubscriptionExpired => "subscription_expired",
            Rejection::UserInactive => "user_inactive",
            Rejection::DailyLimitExceeded { .. } => "daily_limit_exceeded",
            Rejection::MonthlyLimitExceeded { .. } => "monthly_limit_exceeded",
            Rejection::ChannelNotAllowed(_) => "channel_not_allowed",
            Rejection::TemplateNotFound(_) => "template_not_found",
        }
    }
}

#[derive(Debug, Error)]
pub enum CourierError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Rejected(#[from] Rejection),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition {
        from: NotificationStatus,
        to: NotificationStatus,
    },

    #[error("Concurrent update conflict on {entity} {id}")]
    Conflict { entity: &'static str, id: Uuid },

    #[error("Idempotency key already used: {0}")]
    DuplicateIdempotencyKey(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl CourierError {
    pub fn storage(err: impl std::fmt::Display) -> Self {
        CourierError::Storage(err.to_string())
    }

    /// Whether the caller may reasonably repeat the operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CourierError::Conflict { .. } | CourierError::Storage(_) | CourierError::Transport(_)
        )
    }

    pub fn code(&self) -> &'static str {
        match self {
            CourierError::Validation(_) => "validation_error",
            CourierError::Rejected(rejection) => rejection.code(),
            CourierError::InvalidTransition { .. } => "invalid_transition",
            CourierError::Conflict { .. } => "concurrency_conflict",
            CourierError::DuplicateIdempotencyKey(_) => "duplicate_idempotency_key",
            CourierError::NotFound { .. } => "not_found",
            CourierError::Storage(_) => "storage_error",
            CourierError::Transport(_) => "transport_error",
        }
    }
}
