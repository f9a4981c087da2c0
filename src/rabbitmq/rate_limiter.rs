use std::sync::Mutex;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tracing::trace;

const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// Outbound publish pacing for one handler.
///
/// Leaky bucket with a bucket size of one: every permit is scheduled one
/// interval after the previous, so a half-open one-second window never holds
/// more than `messages_per_second` permits. Callers wait, nothing is dropped.
pub struct RateLimiter {
    messages_per_second: u32,
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(messages_per_second: u32) -> Self {
        let rate = u64::from(messages_per_second.max(1));
        Self {
            messages_per_second: messages_per_second.max(1),
            interval: Duration::from_nanos(NANOS_PER_SECOND.div_ceil(rate)),
            next_slot: Mutex::new(None),
        }
    }

    pub fn messages_per_second(&self) -> u32 {
        self.messages_per_second
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Waits until the caller may publish.
    pub async fn acquire(&self) {
        let slot = self.reserve(Instant::now());
        if slot > Instant::now() {
            trace!(wait = ?(slot - Instant::now()), "Rate limit reached, delaying publish");
            sleep_until(slot).await;
        }
    }

    fn reserve(&self, now: Instant) -> Instant {
        let mut next = self.next_slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let slot = match *next {
            Some(scheduled) if scheduled > now => scheduled,
            _ => now,
        };
        *next = Some(slot + self.interval);
        slot
    }
}
