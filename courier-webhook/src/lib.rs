pub mod event;
pub mod fanout;
pub mod signature;

pub use event::WebhookEvent;
pub use fanout::WebhookFanout;
pub use signature::{compute_signature, verify_signature};
