/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Bounded pool of DNS resolver handles. Serialized by a single
//! mutex held only around slot manipulation, never during resolver
//! construction/destruction, so a slow `TokioAsyncResolver::tokio_from_system_conf`
//! call never blocks other sessions acquiring/releasing.

use std::sync::Arc;
use std::time::Duration;

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use parking_lot::Mutex;

/// A borrowed resolver handle. On drop it is *not* automatically returned —
/// callers explicitly `release` it back to the pool at session close — a
/// bare RAII guard would make the "construct on demand, destroy on
/// overflow" accounting implicit and harder to audit.
pub type Resolver = Arc<TokioAsyncResolver>;

/// Fixed-capacity stack of idle resolver handles.
pub struct ResolverPool {
    idle: Mutex<Vec<Resolver>>,
    capacity: usize,
    timeout: Duration,
    retries: usize,
}

impl ResolverPool {
    pub fn new(capacity: usize, timeout: Duration, retries: usize) -> Self {
        Self { idle: Mutex::new(Vec::with_capacity(capacity)), capacity, timeout, retries }
    }

    /// Pop an idle resolver, or construct a fresh one on demand. Returns
    /// `None` only on resolver-construction failure; callers must treat
    /// `None` as retryable tempfail.
    pub fn acquire(&self) -> Option<Resolver> {
        if let Some(r) = self.idle.lock().pop() {
            return Some(r);
        }
        self.construct()
    }

    /// Return a resolver to the idle stack if there is room, else let it
    /// drop (destroying it).
    pub fn release(&self, resolver: Resolver) {
        let mut idle = self.idle.lock();
        if idle.len() < self.capacity {
            idle.push(resolver);
        }
    }

    pub fn idle_len(&self) -> usize {
        self.idle.lock().len()
    }

    fn construct(&self) -> Option<Resolver> {
        let mut opts = ResolverOpts::default();
        opts.timeout = self.timeout;
        opts.attempts = self.retries;
        TokioAsyncResolver::tokio(ResolverConfig::default(), opts)
            .ok()
            .map(Arc::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_constructs_on_demand_when_idle_empty() {
        let pool = ResolverPool::new(2, Duration::from_secs(5), 2);
        assert_eq!(pool.idle_len(), 0);
        let r = pool.acquire().expect("resolver construction should succeed");
        assert_eq!(pool.idle_len(), 0);
        pool.release(r);
        assert_eq!(pool.idle_len(), 1);
    }

    #[test]
    fn release_beyond_capacity_is_discarded() {
        let pool = ResolverPool::new(1, Duration::from_secs(5), 2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        pool.release(a);
        assert_eq!(pool.idle_len(), 1);
        pool.release(b); // capacity is 1, this one is dropped, not queued
        assert_eq!(pool.idle_len(), 1);
    }

    #[test]
    fn acquire_reuses_released_handle_before_constructing() {
        let pool = ResolverPool::new(4, Duration::from_secs(5), 2);
        let r = pool.acquire().unwrap();
        pool.release(r);
        assert_eq!(pool.idle_len(), 1);
        let _ = pool.acquire().unwrap();
        assert_eq!(pool.idle_len(), 0);
    }
}
