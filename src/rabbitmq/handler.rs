//! One request/reply engine, parameterised per message kind by a
//! `HandlerDescriptor`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::connection::ConnectionPool;
use super::consumer::{ConsumeOutcome, Consumer, MessageReceiver};
use super::errors::{Result, UsageError};
use super::publisher::Producer;
use super::request_response::{CorrelationRegistry, PendingRequest, ResolveOutcome, TimeoutCallback};
use super::send_result::SendResultSupervisor;
use super::tokio_exec::{CallbackExecutor, CallbackSlot};
use super::topology::HandlerDescriptor;
use crate::config::GatewayConfig;
use crate::message::{is_valid_message_id, MessageKind, OutboundMessage, OutboundRequest, ResponseEnvelope};

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Receives replies of asynchronously sent requests. Runs on the handler's
/// callback thread, one call at a time, in the order replies arrived.
pub trait ResponseListener: Send + Sync {
    fn on_response(&self, response: ResponseEnvelope);

    /// Only called when timeout callbacks are enabled.
    fn on_response_timed_out(&self, _request: OutboundRequest) {}
}

struct HandlerInner {
    descriptor: HandlerDescriptor,
    producer: Producer,
    consumer: Option<Consumer>,
    supervisor: SendResultSupervisor,
    registry: Arc<CorrelationRegistry>,
    executor: CallbackExecutor,
    listener: RwLock<Option<Arc<dyn ResponseListener>>>,
    open: AtomicBool,
}

#[derive(Clone)]
pub struct MessageHandler {
    inner: Arc<HandlerInner>,
}

impl MessageHandler {
    /// Declares the kind's topology and starts its producer, supervisor and,
    /// for reply kinds, the reply consumer.
    pub async fn open(
        descriptor: HandlerDescriptor,
        pool: Arc<ConnectionPool>,
        config: &GatewayConfig,
    ) -> Result<Self> {
        let kind = descriptor.kind;
        let producer = Producer::rate_limited(
            kind.as_str(),
            descriptor.publish.clone(),
            pool.clone(),
            config.producer.clone(),
            descriptor.messages_per_second,
        );
        let consumer = descriptor.reply.clone().map(|reply| {
            Consumer::new(
                reply,
                pool.clone(),
                config.consumer.clone(),
                config.cluster.prefetch_count,
                RESUBSCRIBE_DELAY,
            )
        });

        let inner = Arc::new(HandlerInner {
            registry: CorrelationRegistry::new(kind.as_str()),
            executor: CallbackExecutor::new(kind.as_str(), config.limits.callback_queue_size)?,
            supervisor: SendResultSupervisor::new(kind.as_str()),
            listener: RwLock::new(None),
            open: AtomicBool::new(false),
            descriptor,
            producer,
            consumer,
        });

        inner.producer.open().await?;
        inner.supervisor.open();
        if let Some(consumer) = &inner.consumer {
            consumer.set_message_received_handler(Arc::new(ReplyReceiver {
                kind,
                handler: Arc::downgrade(&inner),
            }));
            if let Err(e) = consumer.open().await {
                inner.supervisor.close();
                inner.producer.close().await?;
                inner.executor.shutdown().await;
                return Err(e);
            }
        }
        inner.open.store(true, Ordering::SeqCst);
        info!(kind = %kind, exchange = %inner.descriptor.publish.exchange_name, "Message handler opened");

        Ok(Self { inner })
    }

    pub fn kind(&self) -> MessageKind {
        self.inner.descriptor.kind
    }

    pub fn descriptor(&self) -> &HandlerDescriptor {
        &self.inner.descriptor
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.registry.pending_count()
    }

    pub fn set_listener(&self, listener: Arc<dyn ResponseListener>) {
        *self
            .inner
            .listener
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(listener);
    }

    /// Publishes without waiting for the reply. For reply kinds the reply
    /// later reaches the listener.
    pub async fn send(&self, request: OutboundRequest) -> Result<()> {
        let inner = &self.inner;
        let correlation_id = inner.check_request(&request)?;
        let expects_reply = inner.descriptor.expects_reply();
        if expects_reply && inner.listener().is_none() {
            return Err(UsageError::NoListener(inner.kind_name()).into());
        }

        if expects_reply {
            inner.registry.register(
                &correlation_id,
                request.clone(),
                inner.descriptor.timeout,
                self.timeout_callback(),
            )?;
        }
        inner.publish(&correlation_id, request).await
    }

    /// Publishes and waits for the reply, at most the kind's timeout.
    pub async fn send_blocking(&self, request: OutboundRequest) -> Result<ResponseEnvelope> {
        let inner = &self.inner;
        let correlation_id = inner.check_request(&request)?;
        if !inner.descriptor.expects_reply() {
            return Err(UsageError::ReplyNotExpected(inner.kind_name()).into());
        }

        let wait = inner.registry.register_blocking(
            &correlation_id,
            request.clone(),
            inner.descriptor.timeout,
        )?;
        inner.publish(&correlation_id, request).await?;
        wait.wait().await
    }

    /// Matches a reply against the pending requests. Unknown or late replies
    /// are logged and dropped.
    pub fn response_received(&self, response: ResponseEnvelope) -> ConsumeOutcome {
        self.inner.response_received(response)
    }

    /// Stops new sends, gives pending requests up to the kind's timeout to
    /// complete, then force-closes the rest and releases resources.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let pending = inner.registry.pending_count();
        if pending > 0 {
            warn!(
                kind = %inner.descriptor.kind,
                pending,
                "Closing handler with pending requests, waiting up to {:?}",
                inner.descriptor.timeout
            );
            if !inner.registry.wait_until_drained(inner.descriptor.timeout).await {
                let forced = inner.registry.cancel_all("handler closed");
                warn!(kind = %inner.descriptor.kind, forced, "Pending requests force-closed");
            }
        }

        if let Some(consumer) = &inner.consumer {
            consumer.close().await;
        }
        inner.supervisor.close();
        inner.producer.close().await?;
        inner.executor.shutdown().await;
        info!(kind = %inner.descriptor.kind, "Message handler closed");
        Ok(())
    }

    fn timeout_callback(&self) -> Option<TimeoutCallback> {
        if !self.inner.descriptor.timeout_callback_enabled {
            return None;
        }
        let handler = Arc::downgrade(&self.inner);
        Some(Box::new(move |pending: PendingRequest| {
            if let Some(inner) = handler.upgrade() {
                inner.dispatch_timeout(pending);
            }
        }))
    }
}

impl HandlerInner {
    fn kind_name(&self) -> String {
        self.descriptor.kind.as_str().to_string()
    }

    fn listener(&self) -> Option<Arc<dyn ResponseListener>> {
        self.listener
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Misuse checks, in order, before anything touches the broker.
    fn check_request(&self, request: &OutboundRequest) -> Result<String> {
        if !is_valid_message_id(&request.message_id) {
            return Err(UsageError::InvalidMessageId(request.message_id.clone()).into());
        }
        if !self.open.load(Ordering::SeqCst) {
            return Err(UsageError::HandlerClosed(self.kind_name()).into());
        }
        let correlation_id = self.descriptor.kind.correlation_id(&request.message_id);
        if self.registry.contains(&correlation_id) {
            return Err(UsageError::DuplicateCorrelationId(correlation_id).into());
        }
        Ok(correlation_id)
    }

    async fn publish(&self, correlation_id: &str, request: OutboundRequest) -> Result<()> {
        let mut message = OutboundMessage::new(
            correlation_id,
            request.payload,
            self.descriptor.publish.routing_key.as_str(),
            request.headers,
        );
        if let Some(reply) = &self.descriptor.reply {
            message = message.with_reply_routing_key(reply.routing_key.as_str());
        }

        let result = match self.producer.send_message(message).await {
            Ok(result) => result,
            Err(e) => {
                self.registry.discard(correlation_id);
                return Err(e);
            }
        };
        debug!(kind = %self.descriptor.kind, correlation_id, "Message published");

        if let Err(e) = self.supervisor.handle_send_result(result) {
            warn!(kind = %self.descriptor.kind, correlation_id, error = %e, "Send result not supervised");
        }
        Ok(())
    }

    fn response_received(&self, response: ResponseEnvelope) -> ConsumeOutcome {
        let correlation_id = response.correlation_id.clone();

        // Listener replies claim a callback slot before resolving. Blocking
        // callers never use the queue.
        let slot = if self.registry.awaits_listener(&correlation_id) {
            match self.executor.try_reserve() {
                Some(slot) => Some(slot),
                None => {
                    warn!(
                        kind = %self.descriptor.kind,
                        correlation_id = %correlation_id,
                        "Callback queue full, requeueing reply"
                    );
                    return ConsumeOutcome::Requeue;
                }
            }
        } else {
            None
        };

        match self.registry.resolve(&correlation_id, response) {
            ResolveOutcome::WokeWaiter => {}
            ResolveOutcome::ForListener(response) => self.deliver_to_listener(slot, response),
            ResolveOutcome::NotPending(_) => warn!(
                kind = %self.descriptor.kind,
                correlation_id = %correlation_id,
                "Reply for unknown or expired request dropped"
            ),
        }
        ConsumeOutcome::ConsumedSuccessfully
    }

    fn deliver_to_listener(&self, slot: Option<CallbackSlot>, response: ResponseEnvelope) {
        let Some(listener) = self.listener() else {
            warn!(
                kind = %self.descriptor.kind,
                correlation_id = %response.correlation_id,
                "Reply arrived but no listener is set"
            );
            return;
        };
        let correlation_id = response.correlation_id.clone();
        let job = move || listener.on_response(response);
        let queued = match slot {
            Some(slot) => {
                slot.run(job);
                true
            }
            // Registered between the check and the resolve.
            None => self.executor.try_submit(job),
        };
        if !queued {
            error!(
                kind = %self.descriptor.kind,
                correlation_id = %correlation_id,
                "Reply resolved but the callback queue is unavailable"
            );
        }
    }

    fn dispatch_timeout(&self, pending: PendingRequest) {
        let Some(listener) = self.listener() else {
            return;
        };
        let request = pending.request;
        if !self.executor.try_submit(move || listener.on_response_timed_out(request)) {
            warn!(
                kind = %self.descriptor.kind,
                correlation_id = %pending.correlation_id,
                "Timeout callback dropped, callback queue unavailable"
            );
        }
    }
}

/// Feeds reply deliveries into the owning handler.
struct ReplyReceiver {
    kind: MessageKind,
    handler: Weak<HandlerInner>,
}

impl MessageReceiver for ReplyReceiver {
    fn consume(
        &self,
        body: &[u8],
        routing_key: &str,
        correlation_id: Option<&str>,
        headers: &HashMap<String, String>,
    ) -> ConsumeOutcome {
        let Some(correlation_id) = correlation_id else {
            warn!(kind = %self.kind, routing_key, "Reply without correlation id dropped");
            return ConsumeOutcome::ConsumedSuccessfully;
        };
        let Some(handler) = self.handler.upgrade() else {
            return ConsumeOutcome::Requeue;
        };

        handler.response_received(ResponseEnvelope {
            kind: self.kind,
            correlation_id: correlation_id.to_string(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
            headers: headers.clone(),
        })
    }

    fn after_limit_reached(&self, _body: &[u8], routing_key: &str, correlation_id: Option<&str>) {
        warn!(
            kind = %self.kind,
            routing_key,
            correlation_id = ?correlation_id,
            "Reply dropped after repeated requeues"
        );
    }
}

impl std::fmt::Debug for MessageHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageHandler")
            .field("kind", &self.inner.descriptor.kind)
            .field("open", &self.is_open())
            .field("pending", &self.pending_count())
            .finish()
    }
}
