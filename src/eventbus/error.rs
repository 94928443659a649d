use std::time::Duration;

use thiserror::Error;

use super::broker::BrokerError;
use super::duration::DurationParseError;

/// Errors raised by the event bus layer
#[derive(Debug, Error)]
pub enum EventBusError {
    #[error("retry attempt {attempt} is outside the retry ladder (1..={ladder_len})")]
    MaxRetryExceeded { attempt: u32, ladder_len: usize },

    #[error("Failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode envelope: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Failed to decode event payload: {0}")]
    Payload(#[source] serde_json::Error),

    #[error("Invalid retry delay: {0}")]
    InvalidDelay(#[from] DurationParseError),

    #[error("Publish to {topic} not acknowledged within {timeout:?}")]
    Timeout { topic: String, timeout: Duration },

    #[error("Operation cancelled by shutdown")]
    Cancelled,

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl EventBusError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EventBusError::Cancelled)
    }
}

/// Outcome of a handler invocation that did not succeed
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler observed shutdown; the message is left uncommitted
    #[error("handler cancelled by shutdown")]
    Cancelled,

    /// The handler failed; the message is escalated to retry or DLQ
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn failed(err: impl Into<anyhow::Error>) -> Self {
        HandlerError::Failed(err.into())
    }
}
