//! Exchange/queue layout per message kind, built from the virtual host and node id.

use std::time::Duration;

use crate::config::GatewayConfig;
use crate::message::MessageKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeType {
    Fanout,
    Topic,
}

impl From<ExchangeType> for lapin::ExchangeKind {
    fn from(kind: ExchangeType) -> Self {
        match kind {
            ExchangeType::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeType::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

/// Static addressing for one side (publish or reply) of a message kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeBinding {
    pub exchange_name: String,
    pub exchange_type: ExchangeType,
    pub routing_key: String,
    /// Empty on the publish side.
    pub queue_name: String,
    pub durable_exchange: bool,
    pub durable_queue: bool,
}

impl ExchangeBinding {
    pub fn publish(exchange_name: String, exchange_type: ExchangeType, routing_key: &str) -> Self {
        Self {
            exchange_name,
            exchange_type,
            routing_key: routing_key.to_string(),
            queue_name: String::new(),
            durable_exchange: true,
            durable_queue: false,
        }
    }

    pub fn reply(exchange_name: String, routing_key: String, queue_name: String) -> Self {
        Self {
            exchange_name,
            exchange_type: ExchangeType::Topic,
            routing_key,
            queue_name,
            durable_exchange: true,
            durable_queue: true,
        }
    }
}

/// Everything that differs between message kinds. Immutable once built.
#[derive(Debug, Clone)]
pub struct HandlerDescriptor {
    pub kind: MessageKind,
    pub publish: ExchangeBinding,
    pub reply: Option<ExchangeBinding>,
    pub timeout: Duration,
    pub messages_per_second: u32,
    pub timeout_callback_enabled: bool,
}

impl HandlerDescriptor {
    pub fn for_kind(kind: MessageKind, config: &GatewayConfig) -> Self {
        let cluster = &config.cluster;
        let vhost = cluster.virtual_host.trim_start_matches('/');
        let node = cluster.node_id;
        let exchange = |suffix: &str| format!("{}-{}", vhost, suffix);
        let queue = |purpose: &str| format!("{}-{}-node{}", cluster.username, purpose, node);

        let (publish, reply) = match kind {
            MessageKind::Ticket => (
                ExchangeBinding::publish(exchange("Submit"), ExchangeType::Fanout, "ticket"),
                Some(ExchangeBinding::reply(
                    exchange("Confirm"),
                    format!("node{}.ticket.confirm", node),
                    queue("Confirm"),
                )),
            ),
            MessageKind::Cancel => (
                ExchangeBinding::publish(exchange("Control"), ExchangeType::Topic, "cancel"),
                Some(ExchangeBinding::reply(
                    exchange("Reply"),
                    format!("node{}.cancel.confirm", node),
                    queue("Reply"),
                )),
            ),
            MessageKind::ReofferCancel => (
                ExchangeBinding::publish(exchange("Control"), ExchangeType::Topic, "cancel.reoffer"),
                None,
            ),
            MessageKind::TicketAck => (
                ExchangeBinding::publish(exchange("Ack"), ExchangeType::Topic, "ack.ticket"),
                None,
            ),
            MessageKind::CancelAck => (
                ExchangeBinding::publish(exchange("Ack"), ExchangeType::Topic, "ack.cancel"),
                None,
            ),
            MessageKind::Cashout => (
                ExchangeBinding::publish(exchange("Control"), ExchangeType::Topic, "ticket.cashout"),
                Some(ExchangeBinding::reply(
                    exchange("Reply"),
                    format!("node{}.ticket.cashout", node),
                    queue("Reply-cashout"),
                )),
            ),
            MessageKind::NonSrSettle => (
                ExchangeBinding::publish(exchange("Control"), ExchangeType::Topic, "ticket.nonsrsettle"),
                Some(ExchangeBinding::reply(
                    exchange("Reply"),
                    format!("node{}.ticket.nonsrsettle", node),
                    queue("Reply-nonsrsettle"),
                )),
            ),
        };

        Self {
            kind,
            publish,
            reply,
            timeout: config.timeouts.for_kind(kind),
            messages_per_second: config.limits.messages_per_second,
            timeout_callback_enabled: config.limits.timeout_callback_enabled,
        }
    }

    pub fn expects_reply(&self) -> bool {
        self.reply.is_some()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_rate(mut self, messages_per_second: u32) -> Self {
        self.messages_per_second = messages_per_second;
        self
    }

    pub fn with_timeout_callback(mut self, enabled: bool) -> Self {
        self.timeout_callback_enabled = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::mock::test_config;
    use std::collections::HashSet;

    #[test]
    fn ticket_kind_uses_fanout_submit_and_confirm_queue() {
        let descriptor = HandlerDescriptor::for_kind(MessageKind::Ticket, &test_config());
        assert_eq!(descriptor.publish.exchange_name, "bookmaker-Submit");
        assert_eq!(descriptor.publish.exchange_type, ExchangeType::Fanout);

        let reply = descriptor.reply.unwrap();
        assert_eq!(reply.exchange_name, "bookmaker-Confirm");
        assert_eq!(reply.routing_key, "node3.ticket.confirm");
        assert_eq!(reply.queue_name, "bookmaker-Confirm-node3");
    }

    #[test]
    fn control_kinds_share_exchange_but_not_routing() {
        let config = test_config();
        let cancel = HandlerDescriptor::for_kind(MessageKind::Cancel, &config);
        let reoffer = HandlerDescriptor::for_kind(MessageKind::ReofferCancel, &config);
        let cashout = HandlerDescriptor::for_kind(MessageKind::Cashout, &config);
        let settle = HandlerDescriptor::for_kind(MessageKind::NonSrSettle, &config);

        for d in [&cancel, &reoffer, &cashout, &settle] {
            assert_eq!(d.publish.exchange_name, "bookmaker-Control");
            assert_eq!(d.publish.exchange_type, ExchangeType::Topic);
        }
        assert_eq!(cancel.publish.routing_key, "cancel");
        assert_eq!(reoffer.publish.routing_key, "cancel.reoffer");
        assert_eq!(cashout.publish.routing_key, "ticket.cashout");
        assert_eq!(settle.publish.routing_key, "ticket.nonsrsettle");
        assert!(reoffer.reply.is_none());
    }

    #[test]
    fn every_reply_kind_gets_its_own_queue() {
        let config = test_config();
        let queues: HashSet<String> = MessageKind::ALL
            .iter()
            .filter_map(|kind| HandlerDescriptor::for_kind(*kind, &config).reply)
            .map(|reply| reply.queue_name)
            .collect();
        assert_eq!(queues.len(), 4);
    }

    #[test]
    fn ack_kinds_are_fire_and_forget() {
        let config = test_config();
        let ack = HandlerDescriptor::for_kind(MessageKind::TicketAck, &config);
        let cancel_ack = HandlerDescriptor::for_kind(MessageKind::CancelAck, &config);
        assert_eq!(ack.publish.exchange_name, "bookmaker-Ack");
        assert_eq!(ack.publish.routing_key, "ack.ticket");
        assert_eq!(cancel_ack.publish.routing_key, "ack.cancel");
        assert!(!ack.expects_reply());
        assert!(!cancel_ack.expects_reply());
    }
}
