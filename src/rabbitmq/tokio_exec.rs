use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;
use std::thread;

use tokio::sync::mpsc::{self, error::TrySendError, OwnedPermit};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use super::errors::{RabbitMQError, Result};

type Job = Box<dyn FnOnce() + Send>;

/// Runs listener callbacks in submission order on one dedicated thread,
/// off the runtime's worker threads.
pub struct CallbackExecutor {
    name: String,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    finished: Mutex<Option<oneshot::Receiver<()>>>,
}

/// A reserved queue slot. Dropping it gives the slot back.
pub struct CallbackSlot {
    permit: OwnedPermit<Job>,
}

impl CallbackSlot {
    pub fn run(self, job: impl FnOnce() + Send + 'static) {
        self.permit.send(Box::new(job));
    }
}

impl CallbackExecutor {
    pub fn new(name: impl Into<String>, capacity: usize) -> Result<Self> {
        let name = name.into();
        let (sender, mut receiver) = mpsc::channel::<Job>(capacity.max(1));
        let (done, finished) = oneshot::channel();

        let thread_name = format!("{}-callbacks", name);
        let worker_name = name.clone();
        thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                while let Some(job) = receiver.blocking_recv() {
                    if catch_unwind(AssertUnwindSafe(job)).is_err() {
                        error!(executor = %worker_name, "Listener callback panicked");
                    }
                }
                debug!(executor = %worker_name, "Callback thread finished");
                let _ = done.send(());
            })
            .map_err(|e| RabbitMQError::Unknown(format!("failed to start callback thread: {}", e)))?;

        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            finished: Mutex::new(Some(finished)),
        })
    }

    fn sender(&self) -> Option<mpsc::Sender<Job>> {
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Reserves a queue slot without waiting. `None` when the queue is full
    /// or the executor is shut down.
    pub fn try_reserve(&self) -> Option<CallbackSlot> {
        let sender = self.sender()?;
        match sender.try_reserve_owned() {
            Ok(permit) => Some(CallbackSlot { permit }),
            Err(TrySendError::Full(_)) => {
                warn!(executor = %self.name, "Callback queue full");
                None
            }
            Err(TrySendError::Closed(_)) => None,
        }
    }

    /// Queues `job` without waiting. False when it could not be queued.
    pub fn try_submit(&self, job: impl FnOnce() + Send + 'static) -> bool {
        match self.try_reserve() {
            Some(slot) => {
                slot.run(job);
                true
            }
            None => false,
        }
    }

    /// Stops accepting jobs and waits for queued ones to finish.
    pub async fn shutdown(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(sender);

        let finished = self
            .finished
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(finished) = finished {
            let _ = finished.await;
        }
    }
}
