//! Correlation of outbound requests with their replies.
//!
//! Every outstanding request is one map entry keyed by correlation id, with a
//! timer on the runtime. Removing the entry from the map is what resolves it,
//! so a response, the timer and a forced close can race and only one wins.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use super::errors::{RabbitMQError, Result, UsageError};
use crate::message::{OutboundRequest, ResponseEnvelope};

/// Called with the original request when an asynchronous request times out.
pub type TimeoutCallback = Box<dyn FnOnce(PendingRequest) + Send>;

/// An outstanding request as handed back on expiry or forced close.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub correlation_id: String,
    pub request: OutboundRequest,
    pub created_at: Instant,
    pub deadline: Instant,
}

/// How a blocking wait ended.
#[derive(Debug)]
pub enum Resolution {
    Response(ResponseEnvelope),
    TimedOut { elapsed: Duration },
    Closed { reason: String },
}

/// Result of offering a response to the registry.
#[derive(Debug)]
pub enum ResolveOutcome {
    /// A blocking caller received the response.
    WokeWaiter,
    /// The request was sent asynchronously; the response belongs to the listener.
    ForListener(ResponseEnvelope),
    /// Nothing pending under that id: unknown, late or duplicate.
    NotPending(ResponseEnvelope),
}

impl ResolveOutcome {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, ResolveOutcome::NotPending(_))
    }
}

enum Waiter {
    Blocking(oneshot::Sender<Resolution>),
    Listener(Option<TimeoutCallback>),
}

struct Entry {
    token: u64,
    pending: PendingRequest,
    waiter: Waiter,
    timer: Option<JoinHandle<()>>,
}

/// Receiving end of a blocking request.
pub struct PendingWait {
    correlation_id: String,
    receiver: oneshot::Receiver<Resolution>,
}

impl PendingWait {
    /// Waits for the registry to resolve the request.
    pub async fn wait(self) -> Result<ResponseEnvelope> {
        match self.receiver.await {
            Ok(Resolution::Response(response)) => Ok(response),
            Ok(Resolution::TimedOut { elapsed }) => Err(RabbitMQError::ResponseTimeout {
                correlation_id: self.correlation_id,
                elapsed,
            }),
            Ok(Resolution::Closed { reason }) => Err(RabbitMQError::RequestClosed {
                correlation_id: self.correlation_id,
                reason,
            }),
            Err(_) => Err(RabbitMQError::RequestClosed {
                correlation_id: self.correlation_id,
                reason: "registry dropped".to_string(),
            }),
        }
    }
}

/// Outstanding requests of one handler.
pub struct CorrelationRegistry {
    name: String,
    entries: Mutex<HashMap<String, Entry>>,
    next_token: AtomicU64,
    pending: watch::Sender<usize>,
}

impl CorrelationRegistry {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let (pending, _) = watch::channel(0);
        Arc::new(Self {
            name: name.into(),
            entries: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            pending,
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.lock().contains_key(correlation_id)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    /// True when `correlation_id` is pending and its response goes to the
    /// listener rather than to a blocking caller.
    pub fn awaits_listener(&self, correlation_id: &str) -> bool {
        matches!(
            self.lock().get(correlation_id).map(|entry| &entry.waiter),
            Some(Waiter::Listener(_))
        )
    }

    /// Registers an asynchronous request. The response goes to the listener;
    /// `on_timeout`, when given, runs if the timer wins.
    pub fn register(
        self: &Arc<Self>,
        correlation_id: &str,
        request: OutboundRequest,
        timeout: Duration,
        on_timeout: Option<TimeoutCallback>,
    ) -> Result<()> {
        self.insert(correlation_id, request, timeout, Waiter::Listener(on_timeout))
    }

    /// Registers a request whose caller waits on the returned handle.
    pub fn register_blocking(
        self: &Arc<Self>,
        correlation_id: &str,
        request: OutboundRequest,
        timeout: Duration,
    ) -> Result<PendingWait> {
        let (sender, receiver) = oneshot::channel();
        self.insert(correlation_id, request, timeout, Waiter::Blocking(sender))?;
        Ok(PendingWait {
            correlation_id: correlation_id.to_string(),
            receiver,
        })
    }

    fn insert(
        self: &Arc<Self>,
        correlation_id: &str,
        request: OutboundRequest,
        timeout: Duration,
        waiter: Waiter,
    ) -> Result<()> {
        let mut entries = self.lock();
        if entries.contains_key(correlation_id) {
            return Err(UsageError::DuplicateCorrelationId(correlation_id.to_string()).into());
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let created_at = Instant::now();
        let deadline = created_at + timeout;

        let registry = Arc::downgrade(self);
        let id = correlation_id.to_string();
        let timer = tokio::spawn(async move {
            sleep_until(deadline).await;
            if let Some(registry) = registry.upgrade() {
                registry.expire(&id, token);
            }
        });

        entries.insert(
            correlation_id.to_string(),
            Entry {
                token,
                pending: PendingRequest {
                    correlation_id: correlation_id.to_string(),
                    request,
                    created_at,
                    deadline,
                },
                waiter,
                timer: Some(timer),
            },
        );
        self.pending.send_replace(entries.len());
        debug!(registry = %self.name, correlation_id, ?timeout, "Request registered");
        Ok(())
    }

    fn remove(&self, correlation_id: &str, token: Option<u64>) -> Option<Entry> {
        let mut entries = self.lock();
        if let Some(token) = token {
            if entries.get(correlation_id).map(|e| e.token) != Some(token) {
                return None;
            }
        }
        let entry = entries.remove(correlation_id);
        self.pending.send_replace(entries.len());
        entry
    }

    /// Hands `response` to whoever waits for it. Exactly one resolution per
    /// registration; anything later is `NotPending`.
    pub fn resolve(&self, correlation_id: &str, response: ResponseEnvelope) -> ResolveOutcome {
        let Some(mut entry) = self.remove(correlation_id, None) else {
            return ResolveOutcome::NotPending(response);
        };
        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }
        debug!(
            registry = %self.name,
            correlation_id,
            elapsed = ?entry.pending.created_at.elapsed(),
            "Response matched pending request"
        );

        match entry.waiter {
            Waiter::Blocking(sender) => {
                if sender.send(Resolution::Response(response)).is_err() {
                    debug!(registry = %self.name, correlation_id, "Blocking caller went away");
                }
                ResolveOutcome::WokeWaiter
            }
            Waiter::Listener(_) => ResolveOutcome::ForListener(response),
        }
    }

    /// Timer path. Only expires the registration the timer was started for.
    fn expire(&self, correlation_id: &str, token: u64) {
        let Some(entry) = self.remove(correlation_id, Some(token)) else {
            return;
        };
        let elapsed = entry.pending.created_at.elapsed();
        warn!(registry = %self.name, correlation_id, ?elapsed, "Response timed out");

        match entry.waiter {
            Waiter::Blocking(sender) => {
                let _ = sender.send(Resolution::TimedOut { elapsed });
            }
            Waiter::Listener(Some(on_timeout)) => on_timeout(entry.pending),
            Waiter::Listener(None) => {}
        }
    }

    /// Drops a registration whose publish never happened. No one is notified.
    pub fn discard(&self, correlation_id: &str) -> bool {
        match self.remove(correlation_id, None) {
            Some(mut entry) => {
                if let Some(timer) = entry.timer.take() {
                    timer.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Force-resolves everything still pending. Blocking callers see
    /// `RequestClosed`; listeners are not called.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let drained: Vec<Entry> = {
            let mut entries = self.lock();
            let drained = entries.drain().map(|(_, entry)| entry).collect();
            self.pending.send_replace(0);
            drained
        };

        let count = drained.len();
        for mut entry in drained {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            if let Waiter::Blocking(sender) = entry.waiter {
                let _ = sender.send(Resolution::Closed {
                    reason: reason.to_string(),
                });
            }
        }
        if count > 0 {
            info!(registry = %self.name, count, reason, "Pending requests force-closed");
        }
        count
    }

    /// Waits until nothing is pending, at most `timeout`. True when drained.
    pub async fn wait_until_drained(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.subscribe();
        let drained = tokio::time::timeout(timeout, pending.wait_for(|count| *count == 0)).await;
        matches!(drained, Ok(Ok(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;
    use std::sync::atomic::AtomicUsize;

    fn request(id: &str) -> OutboundRequest {
        OutboundRequest::new(id, b"{}".to_vec())
    }

    fn response(correlation_id: &str) -> ResponseEnvelope {
        ResponseEnvelope {
            kind: MessageKind::Ticket,
            correlation_id: correlation_id.to_string(),
            routing_key: "node3.ticket.confirm".to_string(),
            body: br#"{"status":"accepted"}"#.to_vec(),
            headers: HashMap::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn response_wakes_blocking_caller() {
        let registry = CorrelationRegistry::new("ticket");
        let wait = registry
            .register_blocking("ticket:1", request("1"), Duration::from_secs(15))
            .unwrap();

        let outcome = registry.resolve("ticket:1", response("ticket:1"));
        assert!(matches!(outcome, ResolveOutcome::WokeWaiter));
        assert_eq!(wait.wait().await.unwrap().correlation_id, "ticket:1");
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_wait_times_out_at_the_deadline() {
        let registry = CorrelationRegistry::new("ticket");
        let start = Instant::now();
        let wait = registry
            .register_blocking("ticket:1", request("1"), Duration::from_millis(50))
            .unwrap();

        let err = wait.wait().await.unwrap_err();
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(50));
        assert!(waited < Duration::from_millis(60));
        match err {
            RabbitMQError::ResponseTimeout { correlation_id, elapsed } => {
                assert_eq!(correlation_id, "ticket:1");
                assert!(elapsed >= Duration::from_millis(50));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn late_response_after_timeout_is_not_pending() {
        let registry = CorrelationRegistry::new("ticket");
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        registry
            .register(
                "ticket:1",
                request("1"),
                Duration::from_millis(50),
                Some(Box::new(move |pending: PendingRequest| {
                    assert_eq!(pending.request.message_id, "1");
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(51)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!registry.resolve("ticket:1", response("ticket:1")).is_resolved());
    }

    #[tokio::test(start_paused = true)]
    async fn response_cancels_the_timeout_callback() {
        let registry = CorrelationRegistry::new("ticket");
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        registry
            .register(
                "ticket:1",
                request("1"),
                Duration::from_millis(50),
                Some(Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();

        assert!(matches!(
            registry.resolve("ticket:1", response("ticket:1")),
            ResolveOutcome::ForListener(_)
        ));
        assert!(!registry.resolve("ticket:1", response("ticket:1")).is_resolved());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn racing_resolvers_resolve_once() {
        let registry = CorrelationRegistry::new("ticket");
        let fired = Arc::new(AtomicUsize::new(0));
        for i in 0..50 {
            let counter = fired.clone();
            let id = format!("ticket:{}", i);
            registry
                .register(
                    &id,
                    request(&i.to_string()),
                    Duration::from_millis(10),
                    Some(Box::new(move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    })),
                )
                .unwrap();
        }

        let resolvers: Vec<_> = (0..50)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    let id = format!("ticket:{}", i);
                    usize::from(registry.resolve(&id, response(&id)).is_resolved())
                })
            })
            .collect();

        let mut resolved_by_response = 0;
        for resolver in resolvers {
            resolved_by_response += resolver.await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(resolved_by_response + fired.load(Ordering::SeqCst), 50);
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reports_who_awaits_the_response() {
        let registry = CorrelationRegistry::new("ticket");
        registry
            .register("ticket:async", request("async"), Duration::from_secs(1), None)
            .unwrap();
        let _wait = registry
            .register_blocking("ticket:blocking", request("blocking"), Duration::from_secs(1))
            .unwrap();

        assert!(registry.awaits_listener("ticket:async"));
        assert!(!registry.awaits_listener("ticket:blocking"));
        assert!(!registry.awaits_listener("ticket:unknown"));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_pending_id_is_a_usage_error() {
        let registry = CorrelationRegistry::new("cancel");
        registry
            .register("cancel:1", request("1"), Duration::from_secs(1), None)
            .unwrap();
        let err = registry
            .register("cancel:1", request("1"), Duration::from_secs(1), None)
            .unwrap_err();
        assert!(err.is_usage_error());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timer_does_not_expire_a_newer_registration() {
        let registry = CorrelationRegistry::new("ticket");
        registry
            .register("ticket:1", request("1"), Duration::from_millis(50), None)
            .unwrap();
        assert!(registry.discard("ticket:1"));

        let wait = registry
            .register_blocking("ticket:1", request("1"), Duration::from_millis(500))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(registry.contains("ticket:1"));

        registry.resolve("ticket:1", response("ticket:1"));
        assert!(wait.wait().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_closes_blocking_callers() {
        let registry = CorrelationRegistry::new("cashout");
        let first = registry
            .register_blocking("cashout:1", request("1"), Duration::from_secs(60))
            .unwrap();
        let second = registry
            .register_blocking("cashout:2", request("2"), Duration::from_secs(60))
            .unwrap();
        registry
            .register("cashout:3", request("3"), Duration::from_secs(60), None)
            .unwrap();

        assert_eq!(registry.cancel_all("handler closed"), 3);
        for wait in [first, second] {
            assert!(matches!(
                wait.wait().await,
                Err(RabbitMQError::RequestClosed { .. })
            ));
        }
        assert!(registry.wait_until_drained(Duration::from_millis(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_wait_gives_up_after_timeout() {
        let registry = CorrelationRegistry::new("cashout");
        registry
            .register("cashout:1", request("1"), Duration::from_secs(60), None)
            .unwrap();
        assert!(!registry.wait_until_drained(Duration::from_secs(1)).await);
        assert_eq!(registry.pending_count(), 1);
    }
}
