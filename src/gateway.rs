//! The gateway a bookmaker application talks to: one connection pool and one
//! handler per message kind, all built from a single `GatewayConfig`.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::config::GatewayConfig;
use crate::message::{MessageKind, OutboundRequest, ResponseEnvelope};
use crate::rabbitmq::{
    AmqpConnector, ConnectionPool, HandlerDescriptor, LapinConnector, MessageHandler, PoolEvent,
    ResponseListener, Result, UsageError,
};

pub struct TicketGateway {
    pool: Arc<ConnectionPool>,
    handlers: HashMap<MessageKind, MessageHandler>,
}

impl TicketGateway {
    /// Connects to the configured cluster with lapin.
    pub async fn connect(config: GatewayConfig) -> Result<Self> {
        Self::connect_with(config, Arc::new(LapinConnector)).await
    }

    pub async fn connect_with(config: GatewayConfig, connector: Arc<dyn AmqpConnector>) -> Result<Self> {
        let pool = Arc::new(ConnectionPool::new(
            config.cluster.clone(),
            connector,
            &config.connection,
            config.producer.wait_for_publish_confirmations,
        ));

        let mut handlers = HashMap::new();
        for kind in MessageKind::ALL {
            let descriptor = HandlerDescriptor::for_kind(kind, &config);
            match MessageHandler::open(descriptor, pool.clone(), &config).await {
                Ok(handler) => {
                    handlers.insert(kind, handler);
                }
                Err(e) => {
                    error!(kind = %kind, error = %e, "Failed to open handler, closing gateway");
                    close_all(handlers.values()).await;
                    let _ = pool.close().await;
                    return Err(e);
                }
            }
        }

        info!(address = %config.cluster.address(), node_id = config.cluster.node_id, "Ticket gateway connected");
        Ok(Self { pool, handlers })
    }

    pub fn handler(&self, kind: MessageKind) -> &MessageHandler {
        // Every kind is opened by connect_with.
        &self.handlers[&kind]
    }

    /// Sets the listener for a reply kind. Fire-and-forget kinds have no replies to listen to.
    pub fn set_listener(&self, kind: MessageKind, listener: Arc<dyn ResponseListener>) -> Result<()> {
        if !kind.expects_reply() {
            return Err(UsageError::ReplyNotExpected(kind.as_str().to_string()).into());
        }
        self.handler(kind).set_listener(listener);
        Ok(())
    }

    pub async fn send(&self, kind: MessageKind, request: OutboundRequest) -> Result<()> {
        self.handler(kind).send(request).await
    }

    pub async fn send_blocking(&self, kind: MessageKind, request: OutboundRequest) -> Result<ResponseEnvelope> {
        self.handler(kind).send_blocking(request).await
    }

    /// Connection pool events, e.g. to alert on `ConnectivityLost`.
    pub fn events(&self) -> broadcast::Receiver<PoolEvent> {
        self.pool.subscribe()
    }

    /// Leaves the failed state after connectivity was lost and reconnects.
    pub async fn recover(&self) -> Result<()> {
        self.pool.recover().await
    }

    /// Closes every handler, then the connection pool.
    pub async fn close(&self) -> Result<()> {
        close_all(self.handlers.values()).await;
        self.pool.close().await?;
        info!("Ticket gateway closed");
        Ok(())
    }
}

async fn close_all<'a>(handlers: impl Iterator<Item = &'a MessageHandler>) {
    let closing = handlers.map(|handler| async move {
        if let Err(e) = handler.close().await {
            error!(kind = %handler.kind(), error = %e, "Handler did not close cleanly");
        }
    });
    join_all(closing).await;
}
