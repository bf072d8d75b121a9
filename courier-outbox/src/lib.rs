pub mod poller;
pub mod scheduler;

pub use poller::{OutboxRelay, RelayOutcome};
pub use scheduler::ScheduledReleasePoller;
