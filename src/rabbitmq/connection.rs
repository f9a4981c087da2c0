use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{error, info, warn};

use super::amqp_client::{AmqpConnection, AmqpConnector};
use super::channel_manager::{ChannelConfig, ChannelPool, PooledChannel};
use super::errors::{RabbitMQError, Result};
use crate::config::{ClusterDescriptor, ConnectionSettings};

/// Reconnect policy: bounded attempts with exponential backoff and jitter.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl From<&ConnectionSettings> for ReconnectPolicy {
    fn from(settings: &ConnectionSettings) -> Self {
        Self {
            max_attempts: settings.reconnect_attempts.max(1),
            initial_delay: Duration::from_millis(settings.reconnect_delay_ms),
            max_delay: Duration::from_millis(settings.reconnect_max_delay_ms),
        }
    }
}

/// Lifecycle notifications for producers and consumers bound to pooled channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// Channels of this connection are stale and must be re-acquired.
    ChannelsInvalidated { connection: usize, generation: u64 },
    Reconnected { connection: usize },
    ConnectivityLost { attempts: u32 },
}

#[derive(Clone)]
enum SlotState {
    Disconnected,
    Connecting,
    Connected(Arc<dyn AmqpConnection>),
}

struct ConnectionSlot {
    index: usize,
    state: watch::Sender<SlotState>,
    channels: ChannelPool,
}

struct PoolShared {
    cluster: ClusterDescriptor,
    connector: Arc<dyn AmqpConnector>,
    policy: ReconnectPolicy,
    acquire_timeout: Duration,
    slots: Vec<ConnectionSlot>,
    next_slot: AtomicUsize,
    failed: AtomicBool,
    closed: AtomicBool,
    events: broadcast::Sender<PoolEvent>,
}

/// Physical broker connections for one cluster, each with its own channel pool.
///
/// Lost connections are re-established by a background task per connection.
/// Callers wait for it at most the channel acquire timeout.
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    pub fn new(
        cluster: ClusterDescriptor,
        connector: Arc<dyn AmqpConnector>,
        settings: &ConnectionSettings,
        confirm_mode: bool,
    ) -> Self {
        let channel_config = ChannelConfig {
            concurrency: settings.channels_per_connection.max(1),
            confirm_mode,
            acquire_timeout: settings.channel_acquire_timeout(),
        };
        let slots = (0..settings.connections.max(1))
            .map(|index| ConnectionSlot {
                index,
                state: watch::Sender::new(SlotState::Disconnected),
                channels: ChannelPool::new(index, channel_config.clone()),
            })
            .collect();
        let (events, _) = broadcast::channel(64);

        Self {
            shared: Arc::new(PoolShared {
                cluster,
                connector,
                policy: ReconnectPolicy::from(settings),
                acquire_timeout: settings.channel_acquire_timeout(),
                slots,
                next_slot: AtomicUsize::new(0),
                failed: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                events,
            }),
        }
    }

    pub fn cluster(&self) -> &ClusterDescriptor {
        &self.shared.cluster
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.shared.events.subscribe()
    }

    /// True once reconnection gave up. Cleared by a successful `recover`.
    pub fn is_failed(&self) -> bool {
        self.shared.failed.load(Ordering::SeqCst)
    }

    /// Checks out a channel, round-robin across connections.
    ///
    /// A dead connection is reconnected in the background. Waiting for it
    /// fails with `PoolExhausted` after the channel acquire timeout, and with
    /// `ConnectivityLost` once reconnection has been exhausted.
    pub async fn acquire_channel(&self) -> Result<PooledChannel> {
        let shared = &self.shared;
        shared.check_usable()?;

        let index = shared.next_slot.fetch_add(1, Ordering::Relaxed) % shared.slots.len();
        let connection = shared.ensure_connected(index).await?;
        shared.slots[index].channels.acquire(&connection).await
    }

    pub fn release(&self, channel: PooledChannel) {
        drop(channel);
    }

    /// Drops every connection and reconnects, clearing a previous fatal state.
    pub async fn recover(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::SeqCst) {
            return Err(RabbitMQError::NotOpen("connection pool".to_string()));
        }
        info!(address = %shared.cluster.address(), "Recovering broker connections");
        shared.failed.store(false, Ordering::SeqCst);

        for slot in &shared.slots {
            let mut previous = None;
            let claimed = slot.state.send_if_modified(|state| {
                if matches!(state, SlotState::Connecting) {
                    return false;
                }
                previous = Some(std::mem::replace(state, SlotState::Connecting));
                true
            });
            if !claimed {
                continue;
            }
            if let Some(SlotState::Connected(old)) = previous {
                if let Err(e) = old.close().await {
                    warn!(connection = slot.index, error = %e, "Failed to close connection during recovery");
                }
            }
            shared.invalidate(slot);
            match shared.establish_connection(slot.index).await {
                Ok(connection) => {
                    slot.state.send_replace(SlotState::Connected(connection));
                }
                Err(e) => {
                    slot.state.send_replace(SlotState::Disconnected);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Closes every connection. Pooled channels become stale.
    pub async fn close(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for slot in &shared.slots {
            let previous = slot.state.send_replace(SlotState::Disconnected);
            shared.invalidate(slot);
            if let SlotState::Connected(connection) = previous {
                info!(connection = slot.index, "Closing RabbitMQ connection gracefully");
                connection.close().await?;
            }
        }
        Ok(())
    }
}

impl PoolShared {
    fn check_usable(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RabbitMQError::NotOpen("connection pool".to_string()));
        }
        if self.failed.load(Ordering::SeqCst) {
            return Err(RabbitMQError::ConnectivityLost {
                attempts: self.policy.max_attempts,
            });
        }
        Ok(())
    }

    async fn ensure_connected(self: &Arc<Self>, index: usize) -> Result<Arc<dyn AmqpConnection>> {
        let slot = &self.slots[index];
        let mut changes = slot.state.subscribe();
        let deadline = Instant::now() + self.acquire_timeout;

        loop {
            self.check_usable()?;

            let mut live = None;
            let mut lost = false;
            let start = slot.state.send_if_modified(|state| match state {
                SlotState::Connected(connection) if connection.is_connected() => {
                    live = Some(connection.clone());
                    false
                }
                SlotState::Connecting => false,
                SlotState::Connected(_) => {
                    lost = true;
                    *state = SlotState::Connecting;
                    true
                }
                SlotState::Disconnected => {
                    *state = SlotState::Connecting;
                    true
                }
            });
            if let Some(connection) = live {
                return Ok(connection);
            }
            if lost {
                warn!(connection = index, "Broker connection lost");
                self.invalidate(slot);
            }
            if start {
                tokio::spawn(reconnect(self.clone(), index));
            }

            match timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(RabbitMQError::NotOpen("connection pool".to_string())),
                Err(_) => {
                    return Err(RabbitMQError::PoolExhausted {
                        connection: index,
                        waited: self.acquire_timeout,
                    })
                }
            }
        }
    }

    fn invalidate(&self, slot: &ConnectionSlot) {
        let generation = slot.channels.invalidate();
        let _ = self.events.send(PoolEvent::ChannelsInvalidated {
            connection: slot.index,
            generation,
        });
    }

    async fn establish_connection(&self, index: usize) -> Result<Arc<dyn AmqpConnection>> {
        let name = format!("ticket-gateway-{}", index);
        let mut delay = self.policy.initial_delay;
        let mut attempts = 0;

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(RabbitMQError::NotOpen("connection pool".to_string()));
            }
            info!(connection = index, address = %self.cluster.address(), "Attempting to connect to RabbitMQ");

            match self.connector.connect(&self.cluster, &name).await {
                Ok(connection) => {
                    info!(connection = index, "Successfully connected to RabbitMQ");
                    if attempts > 0 {
                        let _ = self.events.send(PoolEvent::Reconnected { connection: index });
                    }
                    return Ok(connection);
                }
                Err(err) => {
                    attempts += 1;
                    error!(
                        connection = index,
                        "Failed to connect to RabbitMQ (attempt {}/{}): {}",
                        attempts,
                        self.policy.max_attempts,
                        err
                    );

                    if attempts >= self.policy.max_attempts {
                        error!("Max reconnection attempts reached. Giving up.");
                        self.failed.store(true, Ordering::SeqCst);
                        let _ = self.events.send(PoolEvent::ConnectivityLost { attempts });
                        return Err(RabbitMQError::ConnectivityLost { attempts });
                    }

                    let jitter = (rand::random::<f64>() * 0.3 - 0.15) * delay.as_millis() as f64;
                    let sleep_time = Duration::from_millis((delay.as_millis() as f64 + jitter).max(0.0) as u64);
                    info!("Waiting {}ms before next reconnect attempt", sleep_time.as_millis());
                    sleep(sleep_time).await;

                    delay = std::cmp::min(delay * 2, self.policy.max_delay);
                }
            }
        }
    }
}

/// Background reconnect of one slot. Waiters are woken by the state change.
async fn reconnect(shared: Arc<PoolShared>, index: usize) {
    let slot = &shared.slots[index];
    let next = match shared.establish_connection(index).await {
        Ok(connection) => SlotState::Connected(connection),
        Err(_) => SlotState::Disconnected,
    };
    slot.state.send_replace(next);

    // Closed while connecting.
    if shared.closed.load(Ordering::SeqCst) {
        if let SlotState::Connected(connection) = slot.state.send_replace(SlotState::Disconnected) {
            let _ = connection.close().await;
        }
    }
}
