pub mod error;
pub mod health;
pub mod message;
pub mod validation;

pub use error::ProtocolError;
pub use health::{HealthState, HealthStatus};
pub use message::{BusMessage, IncomingMessage, OutgoingMessage, meta};
