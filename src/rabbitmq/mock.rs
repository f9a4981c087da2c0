//! In-memory broker behind the `AmqpConnector` seam, for tests.
//!
//! Records publishes, scripts confirm outcomes and connect failures, routes
//! deliveries to consumers, redelivers on nack-with-requeue and refuses a
//! second consumer on an exclusive queue.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use tokio::sync::watch;
use tokio::time::Instant;

use super::amqp_client::{
    AmqpChannel, AmqpConnection, AmqpConnector, DeliveryStream, InboundDelivery, PublishOutcome,
};
use super::errors::{RabbitMQError, Result};
use super::topology::ExchangeBinding;
use crate::config::{ClusterDescriptor, GatewayConfig};
use crate::message::OutboundMessage;

pub fn test_config() -> GatewayConfig {
    GatewayConfig::new(ClusterDescriptor {
        username: "bookmaker".to_string(),
        password: "secret".to_string(),
        virtual_host: "/bookmaker".to_string(),
        use_ssl: false,
        host: "localhost".to_string(),
        port: 5672,
        prefetch_count: 10,
        node_id: 3,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub correlation_id: String,
    pub headers: HashMap<String, String>,
    pub payload: Vec<u8>,
    pub persistent: bool,
    pub published_at: Instant,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    routing_key: String,
    correlation_id: Option<String>,
    body: Vec<u8>,
    redelivered: bool,
}

struct Subscription {
    channel_id: u16,
    sender: UnboundedSender<Result<InboundDelivery>>,
}

#[derive(Default)]
struct MockQueue {
    exclusive: bool,
    subscriptions: Vec<Subscription>,
    backlog: VecDeque<StoredMessage>,
    next_subscription: usize,
}

#[derive(Default)]
struct BrokerState {
    epoch: u64,
    connect_failures: u32,
    connect_attempts: u32,
    next_channel_id: u16,
    channels_created: usize,
    confirm_channels: HashSet<u16>,
    scripted_nacks: u32,
    published: Vec<PublishedMessage>,
    exchanges: HashSet<String>,
    queues: HashMap<String, MockQueue>,
    next_tag: u64,
    unacked: HashMap<u64, (String, StoredMessage)>,
    acked: Vec<StoredMessage>,
}

impl BrokerState {
    fn dispatch(&mut self, queue_name: &str, message: StoredMessage) {
        let queue = self.queues.entry(queue_name.to_string()).or_default();
        queue.subscriptions.retain(|s| !s.sender.is_closed());
        if queue.subscriptions.is_empty() {
            queue.backlog.push_back(message);
            return;
        }

        let slot = queue.next_subscription % queue.subscriptions.len();
        queue.next_subscription = queue.next_subscription.wrapping_add(1);
        self.next_tag += 1;
        let tag = self.next_tag;
        let delivery = InboundDelivery {
            delivery_tag: tag,
            routing_key: message.routing_key.clone(),
            correlation_id: message.correlation_id.clone(),
            headers: HashMap::new(),
            body: message.body.clone(),
            redelivered: message.redelivered,
        };
        if queue.subscriptions[slot].sender.unbounded_send(Ok(delivery)).is_ok() {
            self.unacked.insert(tag, (queue_name.to_string(), message));
        } else {
            queue.backlog.push_back(message);
        }
    }

    fn drop_subscriptions(&mut self, channel_id: Option<u16>) {
        for queue in self.queues.values_mut() {
            queue
                .subscriptions
                .retain(|s| channel_id.is_some_and(|id| s.channel_id != id));
        }
    }
}

/// Shared handle to one in-memory broker. Clones see the same state.
#[derive(Clone)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
    confirms_paused: Arc<watch::Sender<bool>>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    pub fn new() -> Self {
        let (confirms_paused, _) = watch::channel(false);
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            confirms_paused: Arc::new(confirms_paused),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }

    pub fn connector(&self) -> Arc<dyn AmqpConnector> {
        Arc::new(self.clone())
    }

    /// A live connection, bypassing connect scripting.
    pub fn connection(&self) -> Arc<dyn AmqpConnection> {
        let epoch = self.lock().epoch;
        Arc::new(MockConnection {
            broker: self.clone(),
            epoch,
            closed: AtomicBool::new(false),
        })
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.lock().connect_failures = count;
    }

    pub fn connect_attempts(&self) -> u32 {
        self.lock().connect_attempts
    }

    /// Simulates a network failure: every connection and channel dies and
    /// delivery streams end.
    pub fn drop_connections(&self) {
        let mut state = self.lock();
        state.epoch += 1;
        state.drop_subscriptions(None);
        let orphaned: Vec<(String, StoredMessage)> = state.unacked.drain().map(|(_, v)| v).collect();
        for (queue, mut message) in orphaned {
            message.redelivered = true;
            state.queues.entry(queue).or_default().backlog.push_back(message);
        }
    }

    pub fn channels_created(&self) -> usize {
        self.lock().channels_created
    }

    pub fn confirms_enabled(&self, channel_id: u16) -> bool {
        self.lock().confirm_channels.contains(&channel_id)
    }

    pub fn nack_next_publishes(&self, count: u32) {
        self.lock().scripted_nacks = count;
    }

    /// Publishes stay unconfirmed until `resume_confirms`.
    pub fn pause_confirms(&self) {
        self.confirms_paused.send_replace(true);
    }

    pub fn resume_confirms(&self) {
        self.confirms_paused.send_replace(false);
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    pub fn publish_count(&self) -> usize {
        self.lock().published.len()
    }

    pub fn exchange_declared(&self, name: &str) -> bool {
        self.lock().exchanges.contains(name)
    }

    /// Exclusive flag of a declared queue.
    pub fn queue_exclusive(&self, name: &str) -> Option<bool> {
        self.lock().queues.get(name).map(|q| q.exclusive)
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.subscriptions.iter().filter(|s| !s.sender.is_closed()).count())
            .unwrap_or(0)
    }

    /// Puts a message on a queue as the trading service would.
    pub fn deliver(&self, queue: &str, routing_key: &str, correlation_id: Option<&str>, body: &[u8]) {
        let message = StoredMessage {
            routing_key: routing_key.to_string(),
            correlation_id: correlation_id.map(str::to_string),
            body: body.to_vec(),
            redelivered: false,
        };
        self.lock().dispatch(queue, message);
    }

    pub fn acked_count(&self) -> usize {
        self.lock().acked.len()
    }

    pub fn acked_correlation_ids(&self) -> Vec<Option<String>> {
        self.lock().acked.iter().map(|m| m.correlation_id.clone()).collect()
    }

    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }
}

#[async_trait]
impl AmqpConnector for MockBroker {
    async fn connect(&self, _cluster: &ClusterDescriptor, _name: &str) -> Result<Arc<dyn AmqpConnection>> {
        {
            let mut state = self.lock();
            state.connect_attempts += 1;
            if state.connect_failures > 0 {
                state.connect_failures -= 1;
                return Err(RabbitMQError::ConnectionError("connection refused".to_string()));
            }
        }
        Ok(self.connection())
    }
}

struct MockConnection {
    broker: MockBroker,
    epoch: u64,
    closed: AtomicBool,
}

#[async_trait]
impl AmqpConnection for MockConnection {
    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.broker.lock().epoch == self.epoch
    }

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>> {
        if !self.is_connected() {
            return Err(RabbitMQError::ConnectionError("connection is closed".to_string()));
        }
        let mut state = self.broker.lock();
        state.next_channel_id += 1;
        state.channels_created += 1;
        Ok(Arc::new(MockChannel {
            broker: self.broker.clone(),
            id: state.next_channel_id,
            epoch: self.epoch,
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MockChannel {
    broker: MockBroker,
    id: u16,
    epoch: u64,
    closed: AtomicBool,
}

impl MockChannel {
    fn check_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(RabbitMQError::ChannelError(format!("channel {} is closed", self.id)))
        }
    }
}

#[async_trait]
impl AmqpChannel for MockChannel {
    fn id(&self) -> u16 {
        self.id
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.broker.lock().epoch == self.epoch
    }

    async fn enable_confirms(&self) -> Result<()> {
        self.check_open()?;
        self.broker.lock().confirm_channels.insert(self.id);
        Ok(())
    }

    async fn set_prefetch(&self, _prefetch_count: u16) -> Result<()> {
        self.check_open()
    }

    async fn declare_exchange(&self, binding: &ExchangeBinding) -> Result<()> {
        self.check_open()?;
        self.broker.lock().exchanges.insert(binding.exchange_name.clone());
        Ok(())
    }

    async fn declare_queue(&self, binding: &ExchangeBinding, exclusive: bool) -> Result<()> {
        self.declare_exchange(binding).await?;
        let mut state = self.broker.lock();
        state.queues.entry(binding.queue_name.clone()).or_default().exclusive = exclusive;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        message: &OutboundMessage,
        persistent: bool,
        await_confirm: bool,
    ) -> Result<PublishOutcome> {
        self.check_open()?;
        let nacked = {
            let mut state = self.broker.lock();
            state.published.push(PublishedMessage {
                exchange: exchange.to_string(),
                routing_key: message.routing_key.clone(),
                correlation_id: message.correlation_id.clone(),
                headers: message.headers.clone(),
                payload: message.payload.clone(),
                persistent,
                published_at: Instant::now(),
            });
            if state.scripted_nacks > 0 {
                state.scripted_nacks -= 1;
                true
            } else {
                false
            }
        };

        if !await_confirm {
            return Ok(PublishOutcome::Unconfirmed);
        }
        let mut paused = self.broker.confirms_paused.subscribe();
        let _ = paused.wait_for(|paused| !*paused).await;
        Ok(if nacked {
            PublishOutcome::Nacked
        } else {
            PublishOutcome::Acked
        })
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str, exclusive: bool) -> Result<DeliveryStream> {
        self.check_open()?;
        let (sender, receiver) = unbounded();
        let mut state = self.broker.lock();
        let entry = state.queues.entry(queue.to_string()).or_default();
        entry.subscriptions.retain(|s| !s.sender.is_closed());
        if !entry.subscriptions.is_empty() && (exclusive || entry.exclusive) {
            return Err(RabbitMQError::ConsumeError(format!(
                "ACCESS_REFUSED - queue '{}' in exclusive use",
                queue
            )));
        }
        entry.subscriptions.push(Subscription {
            channel_id: self.id,
            sender,
        });

        let backlog: Vec<StoredMessage> = entry.backlog.drain(..).collect();
        for message in backlog {
            state.dispatch(queue, message);
        }
        Ok(receiver.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.check_open()?;
        let mut state = self.broker.lock();
        match state.unacked.remove(&delivery_tag) {
            Some((_, message)) => {
                state.acked.push(message);
                Ok(())
            }
            None => Err(RabbitMQError::AckError(format!("unknown delivery tag {}", delivery_tag))),
        }
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.check_open()?;
        let mut state = self.broker.lock();
        let (queue, mut message) = state
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| RabbitMQError::AckError(format!("unknown delivery tag {}", delivery_tag)))?;
        // Without a dead-letter exchange a rejected message is gone.
        if requeue {
            message.redelivered = true;
            state.dispatch(&queue, message);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.broker.lock().drop_subscriptions(Some(self.id));
        }
        Ok(())
    }
}
