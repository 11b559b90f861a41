//! Errors raised while a persona joins a chat or produces a reply.

use std::fmt;

#[derive(Debug)]
pub enum BotError {
    /// The completion service failed or returned nothing usable.
    Completion(String),
    /// Speech synthesis failed.
    Speech(String),
    /// The platform rejected an outgoing message or signal.
    Delivery(String),
    /// The join factory could not build a persona.
    Join(String),
    /// The persona was shut down while the operation was in flight.
    Cancelled,
}

impl fmt::Display for BotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BotError::Completion(e) => write!(f, "completion error: {e}"),
            BotError::Speech(e) => write!(f, "speech error: {e}"),
            BotError::Delivery(e) => write!(f, "delivery error: {e}"),
            BotError::Join(e) => write!(f, "join error: {e}"),
            BotError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for BotError {}
