use thiserror::Error;

/// Everything that can go wrong turning bytes into a [`crate::BusMessage`]
/// or back.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("message failed shape validation: {0}")]
    Schema(String),

    #[error("could not serialize message: {0}")]
    Serialize(String),
}
