//! A cloneable per-conversation handle: cancellation and the in-flight guard.

use parking_lot::Mutex;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio_util::sync::CancellationToken;

/// A cloneable handle for poking a session from external code.
///
/// All fields are `Arc`-wrapped, so cloning is cheap.
#[derive(Clone)]
pub struct SessionHandle {
    cancel: Arc<Mutex<CancellationToken>>,
    in_flight: Arc<AtomicBool>,
    idle_notify: Arc<tokio::sync::Notify>,
}

impl SessionHandle {
    pub fn new() -> Self {
        Self {
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
            in_flight: Arc::new(AtomicBool::new(false)),
            idle_notify: Arc::new(tokio::sync::Notify::new()),
        }
    }

    /// Abort the in-flight generation, short-circuiting backoff delays and
    /// the network call.
    pub fn abort(&self) {
        self.cancel.lock().cancel();
    }

    /// Get the current cancellation token
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    /// Install a fresh token before a new generation begins
    pub(crate) fn reset_cancel(&self) {
        *self.cancel.lock() = CancellationToken::new();
    }

    /// Whether a generation is currently in flight
    pub fn is_generating(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Claim the per-conversation generation slot. Returns `None` if a
    /// generation is already in flight.
    pub(crate) fn begin_generation(&self) -> Option<InFlightGuard> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlightGuard {
                handle: self.clone(),
            })
    }

    /// Wait until no generation is in flight
    pub async fn wait_for_idle(&self) {
        loop {
            let notified = self.idle_notify.notified();
            if !self.is_generating() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Released on drop so every exit path from generation (success, failure,
/// cancellation, panic) clears the reentrancy lock.
pub(crate) struct InFlightGuard {
    handle: SessionHandle,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.handle.in_flight.store(false, Ordering::Release);
        self.handle.idle_notify.notify_waiters();
    }
}
