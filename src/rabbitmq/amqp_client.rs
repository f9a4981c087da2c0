// src/rabbitmq/amqp_client.rs
//
// The broker seam. Pools, producers and consumers only talk to these traits;
// `LapinConnector` is the production implementation.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
        ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

use super::errors::Result;
use super::topology::ExchangeBinding;
use crate::config::ClusterDescriptor;
use crate::message::OutboundMessage;

const JSON_CONTENT_TYPE: &str = "application/json";
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Broker verdict on a single publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Acked,
    Nacked,
    /// Confirms were not awaited for this publish.
    Unconfirmed,
}

/// A delivery stripped of broker types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub correlation_id: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub redelivered: bool,
}

pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery>>;

#[async_trait]
pub trait AmqpConnector: Send + Sync {
    async fn connect(&self, cluster: &ClusterDescriptor, name: &str) -> Result<Arc<dyn AmqpConnection>>;
}

#[async_trait]
pub trait AmqpConnection: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait AmqpChannel: Send + Sync {
    fn id(&self) -> u16;

    fn is_open(&self) -> bool;

    async fn enable_confirms(&self) -> Result<()>;

    async fn set_prefetch(&self, prefetch_count: u16) -> Result<()>;

    async fn declare_exchange(&self, binding: &ExchangeBinding) -> Result<()>;

    /// Declares the reply exchange and queue, then binds them.
    async fn declare_queue(&self, binding: &ExchangeBinding, exclusive: bool) -> Result<()>;

    async fn publish(
        &self,
        exchange: &str,
        message: &OutboundMessage,
        persistent: bool,
        await_confirm: bool,
    ) -> Result<PublishOutcome>;

    async fn consume(&self, queue: &str, consumer_tag: &str, exclusive: bool) -> Result<DeliveryStream>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Connects with lapin using the cluster's AMQP URI.
#[derive(Debug, Default, Clone)]
pub struct LapinConnector;

#[async_trait]
impl AmqpConnector for LapinConnector {
    async fn connect(&self, cluster: &ClusterDescriptor, name: &str) -> Result<Arc<dyn AmqpConnection>> {
        let properties = ConnectionProperties::default()
            .with_connection_name(LongString::from(name.to_string()));
        let connection = Connection::connect(&cluster.amqp_uri(), properties).await?;
        debug!(address = %cluster.address(), name, "lapin connection established");
        Ok(Arc::new(LapinConnection { connection }))
    }
}

pub struct LapinConnection {
    connection: Connection,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>> {
        let channel = self.connection.create_channel().await?;
        Ok(Arc::new(LapinChannel { channel }))
    }

    async fn close(&self) -> Result<()> {
        if self.connection.status().connected() {
            self.connection.close(0, "Closing connection").await?;
        }
        Ok(())
    }
}

pub struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn id(&self) -> u16 {
        self.channel.id()
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn enable_confirms(&self) -> Result<()> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        Ok(())
    }

    async fn set_prefetch(&self, prefetch_count: u16) -> Result<()> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn declare_exchange(&self, binding: &ExchangeBinding) -> Result<()> {
        self.channel
            .exchange_declare(
                &binding.exchange_name,
                binding.exchange_type.into(),
                ExchangeDeclareOptions {
                    durable: binding.durable_exchange,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, binding: &ExchangeBinding, exclusive: bool) -> Result<()> {
        self.declare_exchange(binding).await?;

        self.channel
            .queue_declare(
                &binding.queue_name,
                QueueDeclareOptions {
                    durable: binding.durable_queue,
                    exclusive,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        self.channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        message: &OutboundMessage,
        persistent: bool,
        await_confirm: bool,
    ) -> Result<PublishOutcome> {
        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_correlation_id(ShortString::from(message.correlation_id.clone()))
            .with_timestamp(chrono::Utc::now().timestamp() as u64)
            .with_headers(to_field_table(&message.headers));
        if persistent {
            properties = properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.payload,
                properties,
            )
            .await?;

        if !await_confirm {
            return Ok(PublishOutcome::Unconfirmed);
        }

        Ok(match confirm.await? {
            Confirmation::Ack(_) => PublishOutcome::Acked,
            Confirmation::Nack(_) => PublishOutcome::Nacked,
            Confirmation::NotRequested => PublishOutcome::Unconfirmed,
        })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str, exclusive: bool) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    exclusive,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(consumer
            .map(|delivery| delivery.map(from_delivery).map_err(Into::into))
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..BasicNackOptions::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.channel.status().connected() {
            self.channel.close(0, "Closing channel").await?;
        }
        Ok(())
    }
}

fn to_field_table(headers: &HashMap<String, String>) -> FieldTable {
    let btree: BTreeMap<ShortString, AMQPValue> = headers
        .iter()
        .map(|(key, value)| {
            (
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            )
        })
        .collect();
    FieldTable::from(btree)
}

fn header_text(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(text) => Some(String::from_utf8_lossy(text.as_bytes()).into_owned()),
        AMQPValue::ShortString(text) => Some(text.as_str().to_string()),
        AMQPValue::Boolean(flag) => Some(flag.to_string()),
        AMQPValue::LongInt(number) => Some(number.to_string()),
        AMQPValue::LongLongInt(number) => Some(number.to_string()),
        AMQPValue::LongUInt(number) => Some(number.to_string()),
        _ => None,
    }
}

fn from_delivery(delivery: Delivery) -> InboundDelivery {
    let headers = delivery
        .properties
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(key, value)| header_text(value).map(|text| (key.as_str().to_string(), text)))
                .collect()
        })
        .unwrap_or_default();

    InboundDelivery {
        delivery_tag: delivery.delivery_tag,
        routing_key: delivery.routing_key.as_str().to_string(),
        correlation_id: delivery
            .properties
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str().to_string()),
        headers,
        body: delivery.data,
        redelivered: delivery.redelivered,
    }
}
