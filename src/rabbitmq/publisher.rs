use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Semaphore};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::amqp_client::PublishOutcome;
use super::connection::ConnectionPool;
use super::errors::{RabbitMQError, Result};
use super::rate_limiter::RateLimiter;
use super::send_result::{SendOutcome, SendResult};
use super::topology::ExchangeBinding;
use crate::config::ProducerSettings;
use crate::message::OutboundMessage;

struct ProducerInner {
    name: String,
    binding: ExchangeBinding,
    pool: Arc<ConnectionPool>,
    settings: ProducerSettings,
    buffer: Arc<Semaphore>,
    limiter: Option<RateLimiter>,
    open: AtomicBool,
}

/// Publishes onto one exchange. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Producer {
    inner: Arc<ProducerInner>,
}

impl Producer {
    pub fn new(
        name: impl Into<String>,
        binding: ExchangeBinding,
        pool: Arc<ConnectionPool>,
        settings: ProducerSettings,
    ) -> Self {
        Self::build(name.into(), binding, pool, settings, None)
    }

    /// A producer whose broker publishes, resends included, never exceed
    /// `messages_per_second`.
    pub fn rate_limited(
        name: impl Into<String>,
        binding: ExchangeBinding,
        pool: Arc<ConnectionPool>,
        settings: ProducerSettings,
        messages_per_second: u32,
    ) -> Self {
        let limiter = RateLimiter::new(messages_per_second);
        Self::build(name.into(), binding, pool, settings, Some(limiter))
    }

    fn build(
        name: String,
        binding: ExchangeBinding,
        pool: Arc<ConnectionPool>,
        settings: ProducerSettings,
        limiter: Option<RateLimiter>,
    ) -> Self {
        let buffer = Arc::new(Semaphore::new(settings.max_buffer_size.max(1)));
        Self {
            inner: Arc::new(ProducerInner {
                name,
                binding,
                pool,
                settings,
                buffer,
                limiter,
                open: AtomicBool::new(false),
            }),
        }
    }

    /// Declares the exchange and starts accepting sends.
    pub async fn open(&self) -> Result<()> {
        let channel = self.inner.pool.acquire_channel().await?;
        channel.declare_exchange(&self.inner.binding).await?;
        self.inner.open.store(true, Ordering::SeqCst);
        info!(
            producer = %self.inner.name,
            exchange = %self.inner.binding.exchange_name,
            "Producer opened"
        );
        Ok(())
    }

    /// Stops accepting sends and waits for in-flight publishes to settle.
    pub async fn close(&self) -> Result<()> {
        if !self.inner.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let capacity = self.capacity() as u32;
        let wait = self.inner.settings.confirm_timeout();
        match timeout(wait, self.inner.buffer.acquire_many(capacity)).await {
            Ok(Ok(_drained)) => debug!(producer = %self.inner.name, "All publishes settled"),
            Ok(Err(_)) => {}
            Err(_) => warn!(
                producer = %self.inner.name,
                in_flight = self.in_flight(),
                "Closing producer with unsettled publishes"
            ),
        }
        info!(producer = %self.inner.name, "Producer closed");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn exchange(&self) -> &str {
        &self.inner.binding.exchange_name
    }

    /// Resends allowed after the first publish of a message.
    pub fn max_retry_count(&self) -> u32 {
        self.inner.settings.max_retry_count
    }

    fn capacity(&self) -> usize {
        self.inner.settings.max_buffer_size.max(1)
    }

    pub fn in_flight(&self) -> usize {
        self.capacity() - self.inner.buffer.available_permits()
    }

    pub async fn send_async(
        &self,
        correlation_id: &str,
        payload: Vec<u8>,
        routing_key: &str,
        headers: HashMap<String, String>,
    ) -> Result<SendResult> {
        self.send_message(OutboundMessage::new(correlation_id, payload, routing_key, headers))
            .await
    }

    /// Like `send_async`, also stamping the `replyRoutingKey` header.
    pub async fn send_async_with_reply(
        &self,
        correlation_id: &str,
        payload: Vec<u8>,
        routing_key: &str,
        headers: HashMap<String, String>,
        reply_routing_key: &str,
    ) -> Result<SendResult> {
        let message = OutboundMessage::new(correlation_id, payload, routing_key, headers)
            .with_reply_routing_key(reply_routing_key);
        self.send_message(message).await
    }

    pub async fn send_message(&self, message: OutboundMessage) -> Result<SendResult> {
        self.dispatch(Arc::new(message), 1).await
    }

    /// Publishes the message of `previous` again.
    ///
    /// Past `max_retry_count` resends the result is abandoned without touching
    /// the broker.
    pub async fn resend(&self, previous: &SendResult) -> Result<SendResult> {
        if previous.attempt() > self.max_retry_count() {
            error!(
                producer = %self.inner.name,
                correlation_id = %previous.correlation_id(),
                attempts = previous.attempt(),
                "Retry limit reached, message abandoned"
            );
            return Ok(SendResult::abandoned(
                previous.shared_message(),
                self.clone(),
                previous.attempt(),
            ));
        }
        debug!(
            producer = %self.inner.name,
            correlation_id = %previous.correlation_id(),
            attempt = previous.attempt() + 1,
            "Resending message"
        );
        self.dispatch(previous.shared_message(), previous.attempt() + 1).await
    }

    async fn dispatch(&self, message: Arc<OutboundMessage>, attempt: u32) -> Result<SendResult> {
        if !self.is_open() {
            return Err(RabbitMQError::NotOpen(format!("{} producer", self.inner.name)));
        }
        let permit = self
            .inner
            .buffer
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RabbitMQError::NotOpen(format!("{} producer", self.inner.name)))?;

        let (state, observed) = watch::channel(SendOutcome::Pending);
        let result = SendResult::new(message.clone(), self.clone(), attempt, observed);

        let producer = self.clone();
        tokio::spawn(async move {
            let outcome = producer.publish(&message).await;
            match &outcome {
                SendOutcome::Confirmed => debug!(
                    producer = %producer.inner.name,
                    correlation_id = %message.correlation_id,
                    attempt,
                    "Publish confirmed"
                ),
                other => warn!(
                    producer = %producer.inner.name,
                    correlation_id = %message.correlation_id,
                    attempt,
                    outcome = ?other,
                    "Publish not confirmed"
                ),
            }
            state.send_replace(outcome);
            drop(permit);
        });

        Ok(result)
    }

    async fn publish(&self, message: &OutboundMessage) -> SendOutcome {
        let channel = match self.inner.pool.acquire_channel().await {
            Ok(channel) => channel,
            Err(e) => return SendOutcome::Errored(e.to_string()),
        };

        // Paced right at the broker call, so a stalled pool cannot release a burst.
        if let Some(limiter) = &self.inner.limiter {
            limiter.acquire().await;
        }

        let settings = &self.inner.settings;
        let await_confirm = settings.wait_for_publish_confirmations;
        let publish = channel.publish(
            &self.inner.binding.exchange_name,
            message,
            settings.persistent,
            await_confirm,
        );

        let published = if await_confirm {
            timeout(settings.confirm_timeout(), publish)
                .await
                .map_err(RabbitMQError::from)
                .and_then(|published| published)
        } else {
            publish.await
        };

        match published {
            Ok(PublishOutcome::Acked) | Ok(PublishOutcome::Unconfirmed) => SendOutcome::Confirmed,
            Ok(PublishOutcome::Nacked) => SendOutcome::Rejected,
            Err(e) => SendOutcome::Errored(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::REPLY_ROUTING_KEY_HEADER;
    use crate::rabbitmq::mock::{test_config, MockBroker};
    use crate::rabbitmq::topology::ExchangeType;
    use std::time::Duration;

    fn binding() -> ExchangeBinding {
        ExchangeBinding::publish("bookmaker-Control".to_string(), ExchangeType::Topic, "cancel")
    }

    async fn open_producer(broker: &MockBroker, settings: ProducerSettings) -> Producer {
        let config = test_config();
        let pool = Arc::new(ConnectionPool::new(
            config.cluster,
            broker.connector(),
            &config.connection,
            settings.wait_for_publish_confirmations,
        ));
        let producer = Producer::new("cancel", binding(), pool, settings);
        producer.open().await.unwrap();
        producer
    }

    #[tokio::test]
    async fn open_declares_exchange_and_close_refuses_sends() {
        let broker = MockBroker::new();
        let producer = open_producer(&broker, ProducerSettings::default()).await;
        assert!(broker.exchange_declared("bookmaker-Control"));

        producer.close().await.unwrap();
        let err = producer
            .send_async("cancel:1", b"{}".to_vec(), "cancel", HashMap::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RabbitMQError::NotOpen(_)));
        assert_eq!(broker.publish_count(), 0);
    }

    #[tokio::test]
    async fn acked_publish_confirms_the_result() {
        let broker = MockBroker::new();
        let producer = open_producer(&broker, ProducerSettings::default()).await;

        let result = producer
            .send_async_with_reply("cancel:1", b"{}".to_vec(), "cancel", HashMap::new(), "node3.cancel.confirm")
            .await
            .unwrap();
        assert_eq!(result.get().await, SendOutcome::Confirmed);
        assert!(result.is_done());
        assert!(!result.is_rejected());
        assert_eq!(result.attempt(), 1);

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].exchange, "bookmaker-Control");
        assert_eq!(published[0].routing_key, "cancel");
        assert!(published[0].persistent);
        assert_eq!(
            published[0].headers.get(REPLY_ROUTING_KEY_HEADER).map(String::as_str),
            Some("node3.cancel.confirm")
        );
    }

    #[tokio::test]
    async fn nack_rejects_the_result() {
        let broker = MockBroker::new();
        broker.nack_next_publishes(1);
        let producer = open_producer(&broker, ProducerSettings::default()).await;

        let result = producer
            .send_async("cancel:1", b"{}".to_vec(), "cancel", HashMap::new())
            .await
            .unwrap();
        assert_eq!(result.get().await, SendOutcome::Rejected);
        assert!(result.is_rejected());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_confirm_errors_after_confirm_timeout() {
        let broker = MockBroker::new();
        broker.pause_confirms();
        let mut settings = ProducerSettings::default();
        settings.confirm_timeout_ms = 500;
        let producer = open_producer(&broker, settings).await;

        let result = producer
            .send_async("cancel:1", b"{}".to_vec(), "cancel", HashMap::new())
            .await
            .unwrap();
        assert!(matches!(result.get().await, SendOutcome::Errored(_)));
        assert!(matches!(result.error(), Some(RabbitMQError::PublishError(_))));
    }

    #[tokio::test]
    async fn without_confirms_the_written_frame_completes_the_result() {
        let broker = MockBroker::new();
        broker.pause_confirms();
        let mut settings = ProducerSettings::default();
        settings.wait_for_publish_confirmations = false;
        settings.persistent = false;
        let producer = open_producer(&broker, settings).await;

        let result = producer
            .send_async("cancel:1", b"{}".to_vec(), "cancel", HashMap::new())
            .await
            .unwrap();
        assert_eq!(result.get().await, SendOutcome::Confirmed);
        assert!(!broker.published()[0].persistent);
    }

    #[tokio::test]
    async fn resend_past_the_ceiling_is_abandoned_without_publishing() {
        let broker = MockBroker::new();
        broker.nack_next_publishes(10);
        let mut settings = ProducerSettings::default();
        settings.max_retry_count = 2;
        let producer = open_producer(&broker, settings).await;

        let mut result = producer
            .send_async("cancel:1", b"{}".to_vec(), "cancel", HashMap::new())
            .await
            .unwrap();
        while result.get().await == SendOutcome::Rejected {
            result = producer.resend(&result).await.unwrap();
        }

        assert_eq!(result.get().await, SendOutcome::Abandoned);
        assert!(matches!(
            result.error(),
            Some(RabbitMQError::PublishRejected { attempts: 3, .. })
        ));
        assert_eq!(result.attempt(), 3);
        assert_eq!(broker.publish_count(), 3, "one publish plus two resends");
        assert!(result.is_rejected());
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_publishes_are_bounded_by_the_buffer() {
        let broker = MockBroker::new();
        broker.pause_confirms();
        let mut settings = ProducerSettings::default();
        settings.max_buffer_size = 2;
        let producer = open_producer(&broker, settings).await;

        let first = producer.send_async("cancel:1", vec![], "cancel", HashMap::new()).await.unwrap();
        let _second = producer.send_async("cancel:2", vec![], "cancel", HashMap::new()).await.unwrap();
        assert_eq!(producer.in_flight(), 2);

        let blocked = producer.send_async("cancel:3", vec![], "cancel", HashMap::new());
        assert!(tokio::time::timeout(Duration::from_millis(100), blocked).await.is_err());

        broker.resume_confirms();
        assert_eq!(first.get().await, SendOutcome::Confirmed);
        let third = producer.send_async("cancel:3", vec![], "cancel", HashMap::new()).await.unwrap();
        assert_eq!(third.get().await, SendOutcome::Confirmed);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_producer_paces_broker_publishes() {
        let broker = MockBroker::new();
        let config = test_config();
        let pool = Arc::new(ConnectionPool::new(
            config.cluster,
            broker.connector(),
            &config.connection,
            true,
        ));
        let producer = Producer::rate_limited("cancel", binding(), pool, ProducerSettings::default(), 40);
        producer.open().await.unwrap();

        let start = tokio::time::Instant::now();
        let mut results = Vec::new();
        for i in 0..5 {
            let id = format!("cancel:{}", i);
            results.push(producer.send_async(&id, vec![], "cancel", HashMap::new()).await.unwrap());
        }
        for result in &results {
            assert_eq!(result.get().await, SendOutcome::Confirmed);
        }

        // Five publishes at 40/s need four full intervals.
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(broker.publish_count(), 5);
    }
}
