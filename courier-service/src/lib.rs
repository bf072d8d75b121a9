pub mod request;
pub mod service;

pub use request::{BatchItemResult, BatchResponse, NotificationDetails, SendRequest, SendResponse};
pub use service::NotificationService;
