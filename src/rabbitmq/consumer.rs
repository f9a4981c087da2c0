use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::amqp_client::{DeliveryStream, InboundDelivery};
use super::channel_manager::PooledChannel;
use super::connection::{ConnectionPool, PoolEvent};
use super::errors::{Result, UsageError};
use super::topology::ExchangeBinding;
use crate::config::ConsumerSettings;

/// What the receiver wants done with a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    ConsumedSuccessfully,
    Requeue,
}

/// Gets every delivery of a consumer. Called on the consumer's task, so it
/// must not block.
pub trait MessageReceiver: Send + Sync {
    fn consume(
        &self,
        body: &[u8],
        routing_key: &str,
        correlation_id: Option<&str>,
        headers: &HashMap<String, String>,
    ) -> ConsumeOutcome;

    /// The delivery was requeued too often. It is acked after this returns.
    fn after_limit_reached(&self, body: &[u8], routing_key: &str, correlation_id: Option<&str>);
}

struct ConsumerInner {
    binding: ExchangeBinding,
    pool: Arc<ConnectionPool>,
    settings: ConsumerSettings,
    prefetch: u16,
    resubscribe_delay: Duration,
    receiver: RwLock<Option<Arc<dyn MessageReceiver>>>,
    attempts: Mutex<HashMap<String, u32>>,
    open: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Subscribes to one reply queue and feeds a `MessageReceiver`.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

impl Consumer {
    pub fn new(
        binding: ExchangeBinding,
        pool: Arc<ConnectionPool>,
        settings: ConsumerSettings,
        prefetch: u16,
        resubscribe_delay: Duration,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(ConsumerInner {
                binding,
                pool,
                settings,
                prefetch,
                resubscribe_delay,
                receiver: RwLock::new(None),
                attempts: Mutex::new(HashMap::new()),
                open: AtomicBool::new(false),
                shutdown,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.inner.binding.queue_name
    }

    pub fn set_message_received_handler(&self, receiver: Arc<dyn MessageReceiver>) {
        *self
            .inner
            .receiver
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(receiver);
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Declares and binds the queue, then starts `concurrency` subscriptions.
    pub async fn open(&self) -> Result<()> {
        if self.inner.receiver().is_none() {
            return Err(UsageError::NoReceiver(self.inner.binding.queue_name.clone()).into());
        }
        if self.inner.open.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.shutdown.send_replace(false);

        let subscriptions = self.inner.subscriptions();
        if subscriptions < self.inner.settings.concurrency {
            warn!(
                queue = %self.inner.binding.queue_name,
                concurrency = self.inner.settings.concurrency,
                "Exclusive queue allows a single subscription"
            );
        }
        for index in 0..subscriptions {
            let (channel, stream) = match self.inner.subscribe(index).await {
                Ok(subscription) => subscription,
                Err(e) => {
                    self.close().await;
                    return Err(e);
                }
            };
            let inner = self.inner.clone();
            let task = tokio::spawn(async move { inner.run(index, channel, stream).await });
            self.inner.lock_tasks().push(task);
        }

        info!(
            queue = %self.inner.binding.queue_name,
            exclusive = self.inner.settings.exclusive,
            subscriptions,
            "Consumer opened"
        );
        Ok(())
    }

    /// Cancels subscriptions and waits for in-progress deliveries.
    pub async fn close(&self) {
        self.inner.open.store(false, Ordering::SeqCst);
        self.inner.shutdown.send_replace(true);

        let tasks: Vec<JoinHandle<()>> = self.inner.lock_tasks().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!(queue = %self.inner.binding.queue_name, error = %e, "Consumer task failed");
            }
        }
        // Deliveries not settled here come back to whoever subscribes next.
        self.inner.lock_attempts().clear();
        debug!(queue = %self.inner.binding.queue_name, "Consumer closed");
    }
}

impl ConsumerInner {
    fn receiver(&self) -> Option<Arc<dyn MessageReceiver>> {
        self.receiver
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// The broker refuses a second consumer on an exclusive queue.
    fn subscriptions(&self) -> usize {
        if self.settings.exclusive {
            1
        } else {
            self.settings.concurrency.max(1)
        }
    }

    #[cfg(test)]
    fn tracked_attempts(&self) -> usize {
        self.lock_attempts().len()
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn subscribe(&self, index: usize) -> Result<(PooledChannel, DeliveryStream)> {
        let channel = self.pool.acquire_channel().await?;
        channel.set_prefetch(self.prefetch).await?;
        channel
            .declare_queue(&self.binding, self.settings.exclusive)
            .await?;

        let tag = format!("{}-{}-{}", self.binding.queue_name, index, Uuid::new_v4());
        let stream = channel
            .consume(&self.binding.queue_name, &tag, self.settings.exclusive)
            .await?;
        debug!(
            queue = %self.binding.queue_name,
            consumer_tag = %tag,
            channel_index = channel.index(),
            "Subscribed"
        );
        Ok((channel, stream))
    }

    /// Keeps trying to subscribe until it works or the consumer closes.
    async fn resubscribe(&self, index: usize) -> Option<(PooledChannel, DeliveryStream)> {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                return None;
            }
            match self.subscribe(index).await {
                Ok(subscription) => {
                    info!(queue = %self.binding.queue_name, "Resubscribed to queue");
                    return Some(subscription);
                }
                Err(e) => {
                    warn!(
                        queue = %self.binding.queue_name,
                        error = %e,
                        "Resubscribe failed, retrying in {:?}",
                        self.resubscribe_delay
                    );
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.resubscribe_delay) => {}
                _ = stopped(&mut shutdown) => return None,
            }
        }
    }

    async fn run(&self, index: usize, mut channel: PooledChannel, mut stream: DeliveryStream) {
        let mut shutdown = self.shutdown.subscribe();
        let mut events = self.pool.subscribe();

        loop {
            let lost = tokio::select! {
                _ = stopped(&mut shutdown) => break,
                next = stream.next() => match next {
                    Some(Ok(delivery)) => {
                        self.handle_delivery(&channel, delivery).await;
                        false
                    }
                    Some(Err(e)) => {
                        error!(queue = %self.binding.queue_name, error = %e, "Error receiving message");
                        !channel.is_valid()
                    }
                    None => true,
                },
                event = events.recv() => match event {
                    Ok(PoolEvent::ChannelsInvalidated { connection, .. }) => {
                        connection == channel.connection_index() && !channel.is_valid()
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => !channel.is_valid(),
                    _ => false,
                },
            };

            if !lost {
                continue;
            }
            warn!(queue = %self.binding.queue_name, "Subscription lost, resubscribing");
            if let Err(e) = channel.close().await {
                debug!(queue = %self.binding.queue_name, error = %e, "Closing lost channel failed");
            }
            drop(channel);

            match self.resubscribe(index).await {
                Some((next_channel, next_stream)) => {
                    channel = next_channel;
                    stream = next_stream;
                }
                None => return,
            }
        }

        if let Err(e) = channel.close().await {
            debug!(queue = %self.binding.queue_name, error = %e, "Closing consumer channel failed");
        }
    }

    async fn handle_delivery(&self, channel: &PooledChannel, delivery: InboundDelivery) {
        let Some(receiver) = self.receiver() else {
            warn!(queue = %self.binding.queue_name, "No receiver set, requeueing delivery");
            if let Err(e) = channel.nack(delivery.delivery_tag, true).await {
                error!(error = %e, "Failed to negatively acknowledge message");
            }
            return;
        };

        let outcome = receiver.consume(
            &delivery.body,
            &delivery.routing_key,
            delivery.correlation_id.as_deref(),
            &delivery.headers,
        );
        let key = attempt_key(&delivery);

        let acked = match outcome {
            ConsumeOutcome::ConsumedSuccessfully => {
                self.lock_attempts().remove(&key);
                channel.ack(delivery.delivery_tag).await
            }
            ConsumeOutcome::Requeue => {
                let attempts = {
                    let mut counts = self.lock_attempts();
                    let count = counts.entry(key.clone()).or_insert(0);
                    if !delivery.redelivered {
                        *count = 0;
                    }
                    *count += 1;
                    *count
                };

                if attempts > self.settings.max_retry_count {
                    self.lock_attempts().remove(&key);
                    error!(
                        queue = %self.binding.queue_name,
                        correlation_id = ?delivery.correlation_id,
                        attempts,
                        "Delivery requeued too often, giving up on it"
                    );
                    receiver.after_limit_reached(
                        &delivery.body,
                        &delivery.routing_key,
                        delivery.correlation_id.as_deref(),
                    );
                    channel.ack(delivery.delivery_tag).await
                } else {
                    debug!(
                        queue = %self.binding.queue_name,
                        correlation_id = ?delivery.correlation_id,
                        attempts,
                        redelivered = delivery.redelivered,
                        "Requeueing delivery"
                    );
                    channel.nack(delivery.delivery_tag, true).await
                }
            }
        };

        if let Err(e) = acked {
            error!(queue = %self.binding.queue_name, error = %e, "Failed to settle delivery");
        }
    }

    fn lock_attempts(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        self.attempts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Resolves once shutdown is signalled. The `watch::Ref` never outlives it.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Redeliveries of the same message map to the same key.
fn attempt_key(delivery: &InboundDelivery) -> String {
    match &delivery.correlation_id {
        Some(id) => id.clone(),
        None => {
            let mut hasher = DefaultHasher::new();
            delivery.routing_key.hash(&mut hasher);
            delivery.body.hash(&mut hasher);
            format!("body:{:016x}", hasher.finish())
        }
    }
}
