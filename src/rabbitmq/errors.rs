// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use std::time::Duration;
use thiserror::Error;
use tokio::time::error::Elapsed;

/// Caller mistakes. Raised synchronously, before any broker interaction.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UsageError {
    #[error("invalid message id `{0}`: expected 1-128 characters of [A-Za-z0-9:_-]")]
    InvalidMessageId(String),

    #[error("{0} handler is closed")]
    HandlerClosed(String),

    #[error("no response listener registered for {0} handler")]
    NoListener(String),

    #[error("{0} messages do not expect a reply")]
    ReplyNotExpected(String),

    #[error("correlation id `{0}` already has a pending request")]
    DuplicateCorrelationId(String),

    #[error("no message receiver set on consumer for queue `{0}`")]
    NoReceiver(String),
}

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error(transparent)]
    Usage(#[from] UsageError),

    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("no channel available on connection {connection} within {waited:?}")]
    PoolExhausted { connection: usize, waited: Duration },

    #[error("broker connectivity lost after {attempts} reconnect attempts")]
    ConnectivityLost { attempts: u32 },

    #[error("{0} is not open")]
    NotOpen(String),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("publish of `{correlation_id}` rejected after {attempts} attempts")]
    PublishRejected { correlation_id: String, attempts: u32 },

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("no response for `{correlation_id}` after {elapsed:?}")]
    ResponseTimeout { correlation_id: String, elapsed: Duration },

    #[error("request `{correlation_id}` closed before a response arrived: {reason}")]
    RequestClosed { correlation_id: String, reason: String },

    #[error("Timeout: {0}")]
    TimeoutError(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl RabbitMQError {
    /// True for programming errors, as opposed to operational failures.
    pub fn is_usage_error(&self) -> bool {
        matches!(self, RabbitMQError::Usage(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            RabbitMQError::ResponseTimeout { .. } | RabbitMQError::TimeoutError(_)
        )
    }
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

// Converting from lapin errors
impl From<LapinError> for RabbitMQError {
    fn from(error: LapinError) -> Self {
        // Use string representation for classification
        let error_text = error.to_string();
        let lowered = error_text.to_lowercase();

        if lowered.contains("connection") || lowered.contains("io error") || lowered.contains("heartbeat") {
            RabbitMQError::ConnectionError(error_text)
        } else if lowered.contains("channel") {
            RabbitMQError::ChannelError(error_text)
        } else if lowered.contains("publish") {
            RabbitMQError::PublishError(error_text)
        } else if lowered.contains("consume") {
            RabbitMQError::ConsumeError(error_text)
        } else if lowered.contains("ack") {
            RabbitMQError::AckError(error_text)
        } else {
            RabbitMQError::Unknown(error_text)
        }
    }
}

impl From<Elapsed> for RabbitMQError {
    fn from(_: Elapsed) -> Self {
        RabbitMQError::TimeoutError("operation timed out".to_string())
    }
}
