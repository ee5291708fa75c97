/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Connection counter: a non-negative integer with a broadcast-on-zero
//! condition, powering graceful shutdown.
//!
//! Invariant: `counter == 1 + active_sessions` always; `counter >= 0` always.
//! The `1` represents the listener's own reference; graceful shutdown
//! releases it and waits for the remainder to drain.

use tokio::sync::Notify;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

pub struct ConnectionCounter {
    value: AtomicI64,
    zero: Notify,
}

impl ConnectionCounter {
    /// Starts at 1, representing the listener.
    pub fn new() -> Self {
        Self { value: AtomicI64::new(1), zero: Notify::new() }
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }

    /// Increment on each accepted milter connection.
    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrement on each connection close (or on listener shutdown, to
    /// release its own reference). Notifies any graceful-shutdown waiter
    /// once the counter reaches zero.
    pub fn decrement(&self) {
        let prev = self.value.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev >= 1, "connection counter invariant violated: went negative");
        if prev - 1 == 0 {
            self.zero.notify_waiters();
        }
    }

    /// Wait until the counter reaches zero, or `timeout` elapses. Returns
    /// `true` if it reached zero, `false` on timeout (caller logs and
    /// proceeds anyway rather than hang shutdown indefinitely).
    pub async fn wait_for_zero(&self, timeout: Duration) -> bool {
        // Capture the notification future *before* checking the value: a
        // `decrement()` landing between the check and the `notified()` call
        // would otherwise be missed until the timeout elapsed. `Notify` is
        // built to make this ordering race-free — a `notify_waiters()` that
        // fires after `notified()` was obtained is never lost, even if it
        // happens before the future is first polled.
        let notified = self.zero.notified();
        if self.get() == 0 {
            return true;
        }
        tokio::select! {
            _ = notified => self.get() == 0,
            _ = tokio::time::sleep(timeout) => self.get() == 0,
        }
    }
}

impl Default for ConnectionCounter {
    fn default() -> Self {
        Self::new()
    }
}
