use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use super::amqp_client::{AmqpChannel, AmqpConnection};
use super::errors::{RabbitMQError, Result};

/// Configuration options for the channels of one connection
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Upper bound on channels open at once on the connection
    pub concurrency: usize,

    /// Whether new channels are put in publisher-confirm mode
    pub confirm_mode: bool,

    /// How long `acquire` waits for a free channel
    pub acquire_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            confirm_mode: true,
            acquire_timeout: Duration::from_secs(2),
        }
    }
}

struct IdleChannel {
    index: usize,
    generation: u64,
    inner: Arc<dyn AmqpChannel>,
}

struct PoolState {
    idle: Vec<IdleChannel>,
    free_indices: BTreeSet<usize>,
    generation: u64,
}

struct Shared {
    connection_index: usize,
    config: ChannelConfig,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn give_back(&self, index: usize, generation: u64, inner: Arc<dyn AmqpChannel>) {
        let mut state = self.lock();
        if generation == state.generation && inner.is_open() {
            state.idle.push(IdleChannel { index, generation, inner });
        } else {
            debug!(
                connection = self.connection_index,
                channel_index = index,
                "Discarding stale channel on return"
            );
            state.free_indices.insert(index);
        }
    }
}

/// Indexed channels for one connection, created on demand.
#[derive(Clone)]
pub struct ChannelPool {
    shared: Arc<Shared>,
}

impl ChannelPool {
    pub fn new(connection_index: usize, config: ChannelConfig) -> Self {
        debug!(
            connection = connection_index,
            concurrency = config.concurrency,
            confirm = config.confirm_mode,
            "Creating channel pool"
        );

        let concurrency = config.concurrency.max(1);
        Self {
            shared: Arc::new(Shared {
                connection_index,
                permits: Arc::new(Semaphore::new(concurrency)),
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    free_indices: (0..concurrency).collect(),
                    generation: 0,
                }),
                config,
            }),
        }
    }

    /// Checks out a channel, reusing an idle one or opening a new one on `connection`.
    ///
    /// Waits at most `acquire_timeout` for a slot before failing with `PoolExhausted`.
    pub async fn acquire(&self, connection: &Arc<dyn AmqpConnection>) -> Result<PooledChannel> {
        let shared = &self.shared;
        let waited = shared.config.acquire_timeout;
        let permit = match tokio::time::timeout(waited, shared.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(RabbitMQError::ChannelError("channel pool closed".to_string())),
            Err(_) => {
                warn!(connection = shared.connection_index, "Channel pool exhausted");
                return Err(RabbitMQError::PoolExhausted {
                    connection: shared.connection_index,
                    waited,
                });
            }
        };

        let (index, generation) = {
            let mut state = shared.lock();
            let current = state.generation;
            while let Some(idle) = state.idle.pop() {
                if idle.generation == current && idle.inner.is_open() {
                    return Ok(PooledChannel::new(shared.clone(), idle.index, current, idle.inner, permit));
                }
                state.free_indices.insert(idle.index);
            }
            // The permit guarantees a free index exists.
            let index = state
                .free_indices
                .pop_first()
                .ok_or_else(|| RabbitMQError::ChannelError("no free channel index".to_string()))?;
            (index, current)
        };

        match self.open_channel(connection).await {
            Ok(inner) => {
                info!(
                    connection = shared.connection_index,
                    channel_index = index,
                    channel_id = inner.id(),
                    "Channel created and configured"
                );
                Ok(PooledChannel::new(shared.clone(), index, generation, inner, permit))
            }
            Err(err) => {
                shared.lock().free_indices.insert(index);
                Err(err)
            }
        }
    }

    async fn open_channel(&self, connection: &Arc<dyn AmqpConnection>) -> Result<Arc<dyn AmqpChannel>> {
        let inner = connection.create_channel().await?;
        if self.shared.config.confirm_mode {
            inner.enable_confirms().await?;
        }
        Ok(inner)
    }

    /// Returns a channel to the pool. Same as dropping it.
    pub fn release(&self, channel: PooledChannel) {
        drop(channel);
    }

    /// Marks every channel of the current connection stale and drops idle ones.
    ///
    /// Checked-out channels are discarded when they come back.
    pub fn invalidate(&self) -> u64 {
        let mut state = self.shared.lock();
        state.generation += 1;
        let stale: Vec<IdleChannel> = state.idle.drain(..).collect();
        for idle in &stale {
            state.free_indices.insert(idle.index);
        }
        debug!(
            connection = self.shared.connection_index,
            generation = state.generation,
            dropped = stale.len(),
            "Channels invalidated"
        );
        state.generation
    }

    pub fn generation(&self) -> u64 {
        self.shared.lock().generation
    }

    pub fn idle_count(&self) -> usize {
        self.shared.lock().idle.len()
    }

    pub fn in_use(&self) -> usize {
        self.shared.config.concurrency.max(1) - self.shared.permits.available_permits()
    }

    pub fn concurrency(&self) -> usize {
        self.shared.config.concurrency.max(1)
    }
}

/// A checked-out channel. Goes back to its pool on drop.
pub struct PooledChannel {
    shared: Arc<Shared>,
    index: usize,
    generation: u64,
    inner: Arc<dyn AmqpChannel>,
    _permit: OwnedSemaphorePermit,
}

impl PooledChannel {
    fn new(
        shared: Arc<Shared>,
        index: usize,
        generation: u64,
        inner: Arc<dyn AmqpChannel>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            shared,
            index,
            generation,
            inner,
            _permit: permit,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn connection_index(&self) -> usize {
        self.shared.connection_index
    }

    pub fn channel(&self) -> &Arc<dyn AmqpChannel> {
        &self.inner
    }

    /// True while the broker channel is open and no recycle happened since checkout.
    pub fn is_valid(&self) -> bool {
        self.channel().is_open() && self.generation == self.shared.lock().generation
    }
}

impl std::ops::Deref for PooledChannel {
    type Target = dyn AmqpChannel;

    fn deref(&self) -> &Self::Target {
        self.channel().as_ref()
    }
}

impl Drop for PooledChannel {
    fn drop(&mut self) {
        self.shared
            .give_back(self.index, self.generation, self.inner.clone());
    }
}
