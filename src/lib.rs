//! Request/reply gateway between a bookmaker and a betting trading service
//! over RabbitMQ.

pub mod config;
pub mod gateway;
pub mod message;
pub mod rabbitmq;

pub use config::GatewayConfig;
pub use gateway::TicketGateway;
pub use message::{MessageKind, OutboundRequest, ResponseEnvelope};
pub use rabbitmq::{MessageHandler, RabbitMQError, ResponseListener, UsageError};
