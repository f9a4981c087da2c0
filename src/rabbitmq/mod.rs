// src/rabbitmq/mod.rs
// RabbitMQ plumbing behind the ticket gateway

pub mod errors;
pub mod amqp_client;      // Broker seam traits and their lapin implementations
pub mod channel_manager;
pub mod connection;       // Connection pool with reconnect

pub mod consumer;
pub mod publisher;
pub mod send_result;

pub mod handler;
pub mod rate_limiter;
pub mod request_response; // Correlation registry
pub mod tokio_exec;
pub mod topology;

#[cfg(test)]
pub mod mock;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::{AmqpConnector, LapinConnector};
pub use connection::{ConnectionPool, PoolEvent};
pub use errors::{RabbitMQError, Result, UsageError};
pub use handler::{MessageHandler, ResponseListener};
pub use send_result::{SendOutcome, SendResult};
pub use topology::HandlerDescriptor;
