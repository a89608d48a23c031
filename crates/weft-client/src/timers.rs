//! Keyed one-shot timer registry.
//!
//! The engine schedules every timer through this registry. The
//! invariant: at most one pending timer per key. Scheduling a key
//! replaces (and aborts) whatever was pending for it; cancellation is
//! O(1) and idempotent.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Keys identifying the engine's scheduled timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TimerKey {
    /// `SETUP` response budget.
    SetupTimeout,
    /// `AUTH_STATE` response budget.
    AuthStateTimeout,
    /// Outbound keepalive cadence.
    Keepalive,
    /// Peer-liveness budget.
    Timeout,
    /// Reconnect backoff.
    Reconnect,
}

/// Registry of pending one-shot timers, one slot per [`TimerKey`].
#[derive(Debug, Default)]
pub(crate) struct TimerRegistry {
    timers: Mutex<HashMap<TimerKey, JoinHandle<()>>>,
}

impl TimerRegistry {
    pub(crate) fn new() -> Self {
        Self {
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Run `action` after `delay`, replacing any pending timer for the
    /// same key.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn schedule(
        &self,
        key: TimerKey,
        delay: Duration,
        action: impl FnOnce() + Send + 'static,
    ) {
        // The map lock is held across the spawn so a zero-delay timer
        // cannot fire and reschedule its key before the handle lands.
        let mut timers = self.timers.lock().expect("timer lock poisoned");
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action();
        });
        if let Some(previous) = timers.insert(key, handle) {
            previous.abort();
        }
    }

    /// Cancel the pending timer for `key`, if any.
    pub(crate) fn cancel(&self, key: TimerKey) -> bool {
        let mut timers = self.timers.lock().expect("timer lock poisoned");
        match timers.remove(&key) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every pending timer.
    pub(crate) fn cancel_all(&self) {
        let mut timers = self.timers.lock().expect("timer lock poisoned");
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }

    /// Returns `true` if a timer for `key` is scheduled and has not
    /// fired yet.
    #[cfg(test)]
    pub(crate) fn is_pending(&self, key: TimerKey) -> bool {
        let timers = self.timers.lock().expect("timer lock poisoned");
        timers.get(&key).is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for TimerRegistry {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
