// Smoke tests against a real RabbitMQ broker.
// Configure it through TICKET_GATEWAY_* variables (or .env) and run with
// `cargo test -- --ignored`.

use std::sync::Arc;

use ticket_gateway::{
    GatewayConfig, MessageKind, OutboundRequest, ResponseEnvelope, ResponseListener, TicketGateway,
};
use tokio::sync::mpsc;

struct Forward(mpsc::UnboundedSender<ResponseEnvelope>);

impl ResponseListener for Forward {
    fn on_response(&self, response: ResponseEnvelope) {
        let _ = self.0.send(response);
    }
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn gateway_connects_and_publishes() {
    let config = GatewayConfig::from_env().expect("TICKET_GATEWAY_* variables must be set");
    let gateway = TicketGateway::connect(config).await.expect("broker reachable");

    for kind in MessageKind::ALL {
        assert!(gateway.handler(kind).is_open(), "{} handler not open", kind);
    }

    let id = format!("smoke-{}", uuid::Uuid::new_v4());
    gateway
        .send(MessageKind::TicketAck, OutboundRequest::new(id, br#"{"ack":true}"#.to_vec()))
        .await
        .expect("fire-and-forget publish");

    let (tx, _rx) = mpsc::unbounded_channel();
    gateway
        .set_listener(MessageKind::Ticket, Arc::new(Forward(tx)))
        .expect("ticket accepts a listener");

    gateway.close().await.expect("clean close");
}
