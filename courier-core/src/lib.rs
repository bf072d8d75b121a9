pub mod clock;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod queue;
pub mod schema;
pub mod store;
pub mod template;
pub mod types;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::Config;
pub use context::CourierContext;
pub use db::DbPool;
pub use error::{CourierError, Rejection};
pub use queue::{DispatchQueue, QueueDepth};
pub use store::{MemoryStore, PgStore, Stores};
pub use types::*;
