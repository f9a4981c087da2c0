use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Header carrying the routing key the trading service should reply on.
pub const REPLY_ROUTING_KEY_HEADER: &str = "replyRoutingKey";

const MAX_MESSAGE_ID_LEN: usize = 128;

/// Every message kind the gateway can send.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    Ticket,
    Cancel,
    ReofferCancel,
    TicketAck,
    CancelAck,
    Cashout,
    NonSrSettle,
}

impl MessageKind {
    pub const ALL: [MessageKind; 7] = [
        MessageKind::Ticket,
        MessageKind::Cancel,
        MessageKind::ReofferCancel,
        MessageKind::TicketAck,
        MessageKind::CancelAck,
        MessageKind::Cashout,
        MessageKind::NonSrSettle,
    ];

    /// Prefix used in correlation ids and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Ticket => "ticket",
            MessageKind::Cancel => "cancel",
            MessageKind::ReofferCancel => "reoffer-cancel",
            MessageKind::TicketAck => "ticket-ack",
            MessageKind::CancelAck => "cancel-ack",
            MessageKind::Cashout => "cashout",
            MessageKind::NonSrSettle => "non-sr-settle",
        }
    }

    pub fn expects_reply(&self) -> bool {
        matches!(
            self,
            MessageKind::Ticket | MessageKind::Cancel | MessageKind::Cashout | MessageKind::NonSrSettle
        )
    }

    pub fn correlation_id(&self, message_id: &str) -> String {
        format!("{}:{}", self.as_str(), message_id)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown message kind `{}`", s))
    }
}

/// What a caller hands to a handler: an id plus an already serialized payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundRequest {
    pub message_id: String,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
}

impl OutboundRequest {
    pub fn new(message_id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            message_id: message_id.into(),
            payload: payload.into(),
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Checks the id syntax: 1-128 characters of `[A-Za-z0-9:_-]`.
pub fn is_valid_message_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_MESSAGE_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == ':' || c == '_' || c == '-')
}

/// A message as handed to the producer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    pub correlation_id: String,
    pub payload: Vec<u8>,
    pub routing_key: String,
    pub reply_routing_key: Option<String>,
    pub headers: HashMap<String, String>,
}

impl OutboundMessage {
    pub fn new(
        correlation_id: impl Into<String>,
        payload: Vec<u8>,
        routing_key: impl Into<String>,
        headers: HashMap<String, String>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            payload,
            routing_key: routing_key.into(),
            reply_routing_key: None,
            headers,
        }
    }

    /// Stamps the reply routing key into the headers as well.
    pub fn with_reply_routing_key(mut self, reply_routing_key: impl Into<String>) -> Self {
        let key = reply_routing_key.into();
        self.headers
            .insert(REPLY_ROUTING_KEY_HEADER.to_string(), key.clone());
        self.reply_routing_key = Some(key);
        self
    }
}

/// A reply as received from the broker. The payload is left undecoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseEnvelope {
    pub kind: MessageKind,
    pub correlation_id: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
}

impl ResponseEnvelope {
    /// The message id part of the correlation id.
    pub fn message_id(&self) -> &str {
        self.correlation_id
            .split_once(':')
            .map(|(_, id)| id)
            .unwrap_or(&self.correlation_id)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}
