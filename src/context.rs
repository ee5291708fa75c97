/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Context Manager: the ref-counted, immutable "active configuration"
//! every session holds a reference to for its whole lifetime, atomically
//! swappable under RELOAD.
//!
//! Readers never take a lock after the initial `current()` call: the
//! payload is reached through [`arc_swap::ArcSwap`], an atomic pointer
//! with a ref-counted payload. A `tokio::sync::Mutex` serializes
//! concurrent RELOAD attempts and is the only thing `reload()` waits on
//! with a timeout — acquiring the write lock with a timeout rather than
//! blocking indefinitely, without making ordinary reads pay for a lock
//! at all.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::config::{Config, RejectAction};
use crate::digest::HashAlgo;
use crate::dkim::DkimPolicy;
use crate::error::{Result, Status};
use crate::psl::Index as PslIndex;
use crate::resolver::ResolverPool;
use crate::stats::Statistics;

/// A single CIDR exclusion entry. The
/// source structures this as a radix tree; exclusion lists are small in
/// practice, so a flat `Vec` scan is the idiomatic choice here — the
/// contract (`contains(ip)`) is what callers depend on, not the storage
/// shape.
#[derive(Debug, Clone, Copy)]
struct CidrBlock {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrBlock {
    fn parse(s: &str) -> Option<Self> {
        let (net, len) = match s.split_once('/') {
            Some((n, l)) => (n, l.parse().ok()?),
            None => (s, if s.contains(':') { 128 } else { 32 }),
        };
        Some(Self { network: net.parse().ok()?, prefix_len: len })
    }

    fn contains(&self, ip: IpAddr) -> bool {
        match (ip, self.network) {
            (IpAddr::V4(a), IpAddr::V4(b)) => {
                let bits = (self.prefix_len as u32).min(32);
                let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
                (u32::from(a) & mask) == (u32::from(b) & mask)
            }
            (IpAddr::V6(a), IpAddr::V6(b)) => {
                let bits = (self.prefix_len as u32).min(128);
                let mask = if bits == 0 { 0 } else { u128::MAX << (128 - bits) };
                (u128::from(a) & mask) == (u128::from(b) & mask)
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExclusionTree {
    blocks: Vec<CidrBlock>,
}

impl ExclusionTree {
    pub fn parse(entries: &[String]) -> Result<Self> {
        let mut blocks = Vec::with_capacity(entries.len());
        for e in entries {
            blocks.push(
                CidrBlock::parse(e)
                    .ok_or_else(|| Status::Config(format!("invalid exclusion CIDR {e:?}")))?,
            );
        }
        Ok(Self { blocks })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.blocks.iter().any(|b| b.contains(ip))
    }
}

/// Compiled DMARC settings.
#[derive(Debug, Clone)]
pub struct DmarcSettings {
    pub enable: bool,
    pub reject_action: RejectAction,
    pub reject_reply_code: String,
    pub reject_enhanced_status: String,
    pub reject_message: String,
}

/// Compiled SPF/Sender-ID policy: just the enable flags, since mechanism
/// evaluation is an external collaborator.
#[derive(Debug, Clone, Copy)]
pub struct SpfPolicy {
    pub spf_enable: bool,
    pub sender_id_enable: bool,
}

/// The immutable, reference-counted "active configuration". Every
/// in-flight session holds one `Arc<AuthContext>` for its full lifetime.
pub struct AuthContext {
    pub spf_policy: SpfPolicy,
    pub dkim_enable: bool,
    pub dkim_policy: DkimPolicy,
    pub dkim_adsp_enable: bool,
    pub dkim_atps_enable: bool,
    pub dkim_atps_hash_algo: HashAlgo,
    pub psl: PslIndex,
    pub dmarc: DmarcSettings,
    pub resolver_pool: Arc<ResolverPool>,
    pub exclusion: ExclusionTree,
    pub authserv_id: String,
    /// Unreloadable: transplanted into every reload candidate.
    pub stats: Arc<Statistics>,
    pub config_file: String,
}

impl AuthContext {
    /// Build a fresh context from a configuration snapshot, run under no
    /// lock. `stats` is transplanted from the
    /// previous context by the caller when this is a reload candidate;
    /// pass a fresh one at startup.
    pub fn build(cfg: &Config, stats: Arc<Statistics>, exclusion_entries: &[String]) -> Result<Self> {
        let psl = match &cfg.public_suffix_list_path {
            Some(path) => PslIndex::from_path(std::path::Path::new(path))?,
            None => PslIndex::parse("")?,
        };

        Ok(Self {
            spf_policy: SpfPolicy { spf_enable: cfg.spf_enable, sender_id_enable: cfg.sender_id_enable },
            dkim_enable: cfg.dkim_enable,
            dkim_policy: DkimPolicy {
                signheader_limit: cfg.dkim_signheader_limit,
                clock_skew: cfg.dkim_clock_skew,
                accept_expired: cfg.dkim_accept_expired,
                accept_future: cfg.dkim_accept_future,
                keep_leading_space: true,
                min_rsa_key_bits: cfg.dkim_min_rsa_key_bits,
            },
            dkim_adsp_enable: cfg.dkim_adsp_enable,
            dkim_atps_enable: cfg.dkim_atps_enable,
            dkim_atps_hash_algo: {
                if cfg.dkim_atps_hash_algo != HashAlgo::Sha1 {
                    tracing::warn!("dkim_atps_hash_algo is not sha1; RFC 6541 specifies sha1 for ATPS delegation lookups");
                }
                cfg.dkim_atps_hash_algo
            },
            psl,
            dmarc: DmarcSettings {
                enable: cfg.dmarc_enable,
                reject_action: cfg.dmarc_reject_action,
                reject_reply_code: cfg.dmarc_reject_reply_code.clone(),
                reject_enhanced_status: cfg.dmarc_reject_enhanced_status.clone(),
                reject_message: cfg.dmarc_reject_message.clone(),
            },
            resolver_pool: Arc::new(ResolverPool::new(
                cfg.resolver_pool_size,
                cfg.resolver_timeout,
                cfg.resolver_retry_count,
            )),
            exclusion: ExclusionTree::parse(exclusion_entries)?,
            authserv_id: cfg.authserv_id.clone(),
            stats,
            config_file: cfg.config_file.clone(),
        })
    }
}

/// Owns the global "current context" slot and serializes RELOAD attempts.
pub struct ContextManager {
    current: ArcSwap<AuthContext>,
    reload_lock: tokio::sync::Mutex<()>,
    lock_timeout: Duration,
}

impl ContextManager {
    pub fn new(initial: AuthContext, lock_timeout: Duration) -> Self {
        Self {
            current: ArcSwap::new(Arc::new(initial)),
            reload_lock: tokio::sync::Mutex::new(()),
            lock_timeout,
        }
    }

    /// A session takes this once, at `connect`, and holds the `Arc` for
    /// its entire lifetime without re-reading the global slot.
    pub fn current(&self) -> Arc<AuthContext> {
        self.current.load_full()
    }

    /// Reload the active configuration. `build_candidate` receives the
    /// currently-active context (to transplant unreloadable fields from)
    /// and must produce a complete replacement. Any error — including a
    /// lock-acquisition timeout, or another reloader having already
    /// swapped the slot — aborts with the running context unchanged.
    pub async fn reload<F>(&self, build_candidate: F) -> Result<()>
    where
        F: FnOnce(&AuthContext) -> Result<AuthContext>,
    {
        let old = self.current.load_full();
        let candidate = build_candidate(&old)?;

        let _guard = tokio::time::timeout(self.lock_timeout, self.reload_lock.lock())
            .await
            .map_err(|_| Status::System("context reload lock timed out".into()))?;

        // Sanity check per spec: only swap if nothing else already did.
        let previous = self.current.compare_and_swap(&old, Arc::new(candidate));
        if !Arc::ptr_eq(&*previous, &old) {
            return Err(Status::System("context was replaced concurrently, reload aborted".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_config() -> Config {
        Config::load_from_str_for_tests(
            "authserv_id: mx.test\n\
             resolver_pool_size: 1\n",
        )
    }

    #[test]
    fn exclusion_tree_matches_cidr_block() {
        let tree = ExclusionTree::parse(&["192.0.2.0/24".to_string()]).unwrap();
        assert!(tree.contains("192.0.2.5".parse().unwrap()));
        assert!(!tree.contains("198.51.100.1".parse().unwrap()));
    }

    #[test]
    fn exclusion_tree_matches_single_host_without_prefix() {
        let tree = ExclusionTree::parse(&["203.0.113.9".to_string()]).unwrap();
        assert!(tree.contains("203.0.113.9".parse().unwrap()));
        assert!(!tree.contains("203.0.113.10".parse().unwrap()));
    }

    #[tokio::test]
    async fn reload_swaps_the_visible_context() {
        let cfg = test_config();
        let stats = Arc::new(Statistics::new());
        let ctx = AuthContext::build(&cfg, stats.clone(), &[]).unwrap();
        let mgr = ContextManager::new(ctx, Duration::from_secs(1));

        assert_eq!(mgr.current().authserv_id, "mx.test");

        mgr.reload(|old| {
            let mut cfg2 = test_config();
            cfg2.authserv_id = "mx.reloaded".to_string();
            AuthContext::build(&cfg2, old.stats.clone(), &[])
        })
        .await
        .unwrap();

        assert_eq!(mgr.current().authserv_id, "mx.reloaded");
    }

    #[tokio::test]
    async fn reload_transplants_the_stats_handle() {
        let cfg = test_config();
        let stats = Arc::new(Statistics::new());
        let ctx = AuthContext::build(&cfg, stats.clone(), &[]).unwrap();
        let mgr = ContextManager::new(ctx, Duration::from_secs(1));

        mgr.reload(|old| AuthContext::build(&test_config(), old.stats.clone(), &[])).await.unwrap();

        assert!(Arc::ptr_eq(&mgr.current().stats, &stats));
    }
}
