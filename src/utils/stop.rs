//! Cooperative stop signal.
//!
//! Shared between the worker loops and in-flight transfers: Ctrl+C stops the
//! whole process, and a clone handed to `send_file` acts as the cancel handle
//! for that transfer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// An async-aware cancellation flag.
///
/// Clones share the same state; stopping any clone wakes every waiter.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    shared: Arc<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal all waiters. Idempotent.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Resolve once the signal fires; immediately if it already has.
    pub async fn wait(&self) {
        while !self.is_stopped() {
            let notified = self.shared.notify.notified();
            // Re-check after registering, or a stop() between the loop test
            // and notified() would be lost.
            if self.is_stopped() {
                break;
            }
            notified.await;
        }
    }
}
