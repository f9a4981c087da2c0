//! Publish outcomes and the supervisor that resends failed publishes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::errors::{RabbitMQError, Result};
use super::publisher::Producer;
use crate::message::OutboundMessage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Pending,
    Confirmed,
    /// Broker nacked the publish.
    Rejected,
    Errored(String),
    /// Retry ceiling reached; never published again.
    Abandoned,
}

/// Handle on one publish attempt of one message.
#[derive(Clone)]
pub struct SendResult {
    message: Arc<OutboundMessage>,
    producer: Producer,
    attempt: u32,
    state: watch::Receiver<SendOutcome>,
}

impl SendResult {
    pub(crate) fn new(
        message: Arc<OutboundMessage>,
        producer: Producer,
        attempt: u32,
        state: watch::Receiver<SendOutcome>,
    ) -> Self {
        Self {
            message,
            producer,
            attempt,
            state,
        }
    }

    pub(crate) fn abandoned(message: Arc<OutboundMessage>, producer: Producer, attempt: u32) -> Self {
        let (_, state) = watch::channel(SendOutcome::Abandoned);
        Self::new(message, producer, attempt, state)
    }

    pub fn correlation_id(&self) -> &str {
        &self.message.correlation_id
    }

    pub fn content(&self) -> &[u8] {
        &self.message.payload
    }

    pub fn routing_key(&self) -> &str {
        &self.message.routing_key
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.message.headers
    }

    pub fn message(&self) -> &OutboundMessage {
        &self.message
    }

    pub(crate) fn shared_message(&self) -> Arc<OutboundMessage> {
        self.message.clone()
    }

    pub fn producer(&self) -> &Producer {
        &self.producer
    }

    /// 1 for the first publish, incremented by every resend.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn outcome(&self) -> SendOutcome {
        self.state.borrow().clone()
    }

    pub fn is_done(&self) -> bool {
        *self.state.borrow() != SendOutcome::Pending
    }

    pub fn is_rejected(&self) -> bool {
        matches!(
            *self.state.borrow(),
            SendOutcome::Rejected | SendOutcome::Abandoned
        )
    }

    /// The failure behind a terminal outcome, `None` while pending or once confirmed.
    pub fn error(&self) -> Option<RabbitMQError> {
        match &*self.state.borrow() {
            SendOutcome::Pending | SendOutcome::Confirmed => None,
            SendOutcome::Errored(reason) => Some(RabbitMQError::PublishError(reason.clone())),
            SendOutcome::Rejected | SendOutcome::Abandoned => Some(RabbitMQError::PublishRejected {
                correlation_id: self.message.correlation_id.clone(),
                attempts: self.attempt,
            }),
        }
    }

    /// Waits for a terminal outcome.
    pub async fn get(&self) -> SendOutcome {
        let mut state = self.state.clone();
        let outcome = match state.wait_for(|outcome| *outcome != SendOutcome::Pending).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => SendOutcome::Errored("publish task ended without an outcome".to_string()),
        };
        outcome
    }
}

impl std::fmt::Debug for SendResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendResult")
            .field("correlation_id", &self.message.correlation_id)
            .field("routing_key", &self.message.routing_key)
            .field("attempt", &self.attempt)
            .field("outcome", &*self.state.borrow())
            .finish()
    }
}

/// Where supervision of one message stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisionState {
    Waiting(u32),
    Resending(u32),
    Confirmed,
    Abandoned,
    Closed,
}

impl SupervisionState {
    /// Transition out of `Waiting(attempt)` once the outcome is known.
    pub fn on_outcome(self, outcome: &SendOutcome, max_retry_count: u32) -> Self {
        match (self, outcome) {
            (SupervisionState::Waiting(_), SendOutcome::Confirmed) => SupervisionState::Confirmed,
            (SupervisionState::Waiting(_), SendOutcome::Abandoned) => SupervisionState::Abandoned,
            (SupervisionState::Waiting(attempt), SendOutcome::Rejected | SendOutcome::Errored(_)) => {
                if attempt > max_retry_count {
                    SupervisionState::Abandoned
                } else {
                    SupervisionState::Resending(attempt + 1)
                }
            }
            (state, _) => state,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SupervisionState::Confirmed | SupervisionState::Abandoned | SupervisionState::Closed
        )
    }
}

struct SupervisorInner {
    name: String,
    open: AtomicBool,
    closed: watch::Sender<bool>,
    outstanding: AtomicUsize,
}

/// Waits on every `SendResult` off the caller's task and resends failures
/// through the producer that made them.
#[derive(Clone)]
pub struct SendResultSupervisor {
    inner: Arc<SupervisorInner>,
}

impl SendResultSupervisor {
    pub fn new(name: impl Into<String>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(SupervisorInner {
                name: name.into(),
                open: AtomicBool::new(false),
                closed,
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    pub fn open(&self) {
        self.inner.closed.send_replace(false);
        self.inner.open.store(true, Ordering::SeqCst);
    }

    /// Abandons outstanding waits. Nothing is resent afterwards.
    pub fn close(&self) {
        if !self.inner.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let outstanding = self.inner.outstanding.load(Ordering::SeqCst);
        if outstanding > 0 {
            warn!(
                supervisor = %self.inner.name,
                outstanding,
                "Closing supervisor, abandoning outstanding send results"
            );
        }
        self.inner.closed.send_replace(true);
        info!(supervisor = %self.inner.name, "Send result supervisor closed");
    }

    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    /// Starts supervising `result`. The returned handle yields the final state.
    pub fn handle_send_result(&self, result: SendResult) -> Result<JoinHandle<SupervisionState>> {
        if !self.inner.open.load(Ordering::SeqCst) {
            return Err(RabbitMQError::NotOpen(format!("{} supervisor", self.inner.name)));
        }
        self.inner.outstanding.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.clone();
        Ok(tokio::spawn(async move {
            let state = supervise(&inner, result).await;
            inner.outstanding.fetch_sub(1, Ordering::SeqCst);
            state
        }))
    }
}

async fn supervise(inner: &SupervisorInner, mut result: SendResult) -> SupervisionState {
    let mut closed = inner.closed.subscribe();
    let mut state = SupervisionState::Waiting(result.attempt());

    while !state.is_terminal() {
        state = match state {
            SupervisionState::Waiting(_) => {
                let outcome = tokio::select! {
                    outcome = result.get() => Some(outcome),
                    _ = async { let _ = closed.wait_for(|is_closed| *is_closed).await; } => None,
                };
                match outcome {
                    Some(outcome) => state.on_outcome(&outcome, result.producer().max_retry_count()),
                    None => SupervisionState::Closed,
                }
            }
            SupervisionState::Resending(_) if *closed.borrow() => SupervisionState::Closed,
            SupervisionState::Resending(_) => match result.producer().resend(&result).await {
                Ok(next) => {
                    result = next;
                    SupervisionState::Waiting(result.attempt())
                }
                Err(e) => {
                    error!(
                        supervisor = %inner.name,
                        correlation_id = %result.correlation_id(),
                        error = %e,
                        "Resend failed"
                    );
                    SupervisionState::Abandoned
                }
            },
            terminal => terminal,
        };
    }

    match state {
        SupervisionState::Confirmed => debug!(
            supervisor = %inner.name,
            correlation_id = %result.correlation_id(),
            attempt = result.attempt(),
            "Message delivered"
        ),
        SupervisionState::Abandoned => error!(
            supervisor = %inner.name,
            routing_key = %result.routing_key(),
            error = %result.error().unwrap_or_else(|| RabbitMQError::PublishRejected {
                correlation_id: result.correlation_id().to_string(),
                attempts: result.attempt(),
            }),
            "Message could not be delivered and was abandoned"
        ),
        _ => warn!(
            supervisor = %inner.name,
            correlation_id = %result.correlation_id(),
            "Stopped supervising message on close"
        ),
    }
    state
}
