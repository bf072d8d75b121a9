pub mod cache;
pub mod period;
pub mod validator;

pub use cache::{CachedSubscription, SubscriptionCache};
pub use validator::{QuotaValidator, ValidationResult};
