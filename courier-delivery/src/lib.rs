pub mod email;
pub mod transport;
pub mod worker;

pub use email::ResendEmailTransport;
pub use transport::{SendReceipt, Transport, TransportRegistry};
pub use worker::DispatchWorker;
