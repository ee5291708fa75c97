/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! DKIM Verifier orchestration (RFC 6376 §6): scans stored headers for
//! `DKIM-Signature` occurrences, verifies each as an independent frame, and
//! answers per-author ADSP/ATPS policy queries.

pub mod adsp;
pub mod atps;
pub mod frame;
pub mod key;

use std::collections::HashMap;
use std::time::Duration;

use crate::canon::canon_header;
use crate::digest::{Digester, HashAlgo, PublicKey, VerifyOutcome};
use crate::error::{Result, Score, Status};
use crate::resolver::Resolver;

use frame::SignatureFrame;
use key::{KeyError, KeyRecord};

/// Compiled DKIM verification policy.
#[derive(Debug, Clone)]
pub struct DkimPolicy {
    pub signheader_limit: usize,
    pub clock_skew: Duration,
    pub accept_expired: bool,
    pub accept_future: bool,
    pub keep_leading_space: bool,
    pub min_rsa_key_bits: usize,
}

impl Default for DkimPolicy {
    fn default() -> Self {
        Self {
            signheader_limit: 5,
            clock_skew: Duration::from_secs(300),
            accept_expired: false,
            accept_future: false,
            keep_leading_space: true,
            min_rsa_key_bits: key::MIN_RSA_KEY_BITS,
        }
    }
}

/// One result per DKIM-Signature occurrence.
#[derive(Debug, Clone)]
pub struct FrameResult {
    pub score: Score,
    pub status: Status,
    pub sdid: String,
    pub selector: String,
    pub auid: Option<String>,
    pub key_bits: Option<usize>,
    pub testing: bool,
}

enum FrameSlot {
    /// Parsed and sane; actively accumulating body bytes.
    Active { frame: SignatureFrame, digester: Digester },
    /// Parse or sanity failure recorded up front; contributes a fixed
    /// result without further processing.
    Failed(FrameResult),
}

pub struct Verifier {
    policy: DkimPolicy,
    slots: Vec<FrameSlot>,
    /// Signature frames beyond `signheader_limit` that were ignored.
    excess_signatures: usize,
    results: Vec<FrameResult>,
    verified: bool,
}

/// `New` construction outcome.
pub enum NewOutcome {
    NoSignHeader,
    Verifier(Verifier),
}

impl Verifier {
    /// Scan `headers` for `DKIM-Signature` occurrences, parse and
    /// sanity-check each, up to `policy.signheader_limit`.
    pub fn new(policy: DkimPolicy, headers: &[(String, String)], now_unix: i64) -> Result<NewOutcome> {
        let skew = policy.clock_skew.as_secs() as i64;
        let mut slots = Vec::new();
        let mut excess_signatures = 0usize;

        for (name, value) in headers {
            if !name.eq_ignore_ascii_case("dkim-signature") {
                continue;
            }
            if slots.len() >= policy.signheader_limit {
                excess_signatures += 1;
                continue;
            }
            let slot = match SignatureFrame::parse(value) {
                Ok(frame) => match frame.sanity_check(now_unix, skew, policy.accept_expired, policy.accept_future) {
                    Ok(()) => {
                        let digester = Digester::new(
                            frame.algorithm.hash,
                            frame.canon.header,
                            frame.canon.body,
                            frame.body_limit,
                        );
                        FrameSlot::Active { frame, digester }
                    }
                    Err(status) => FrameSlot::Failed(failed_result(&frame.sdid, &frame.selector, frame.auid.clone(), status)),
                },
                Err(status) => FrameSlot::Failed(failed_result("", "", None, status)),
            };
            slots.push(slot);
        }

        if slots.is_empty() && excess_signatures == 0 {
            return Ok(NewOutcome::NoSignHeader);
        }

        Ok(NewOutcome::Verifier(Verifier {
            policy,
            slots,
            excess_signatures,
            results: Vec::new(),
            verified: false,
        }))
    }

    /// Feed one raw body chunk into every still-active frame's digester.
    pub fn update_body(&mut self, chunk: &[u8]) -> Result<()> {
        for slot in &mut self.slots {
            if let FrameSlot::Active { digester, .. } = slot {
                digester.update_body(chunk)?;
            }
        }
        Ok(())
    }

    pub fn frame_count(&self) -> usize {
        self.slots.len()
    }

    pub fn frame_result(&self, i: usize) -> Option<&FrameResult> {
        self.results.get(i)
    }

    pub fn excess_signatures(&self) -> usize {
        self.excess_signatures
    }

    /// Run key fetch + digest + verify for every active frame (RFC 6376
    /// §6.1, §6.1.3). `headers` must be the same slice passed to `new`.
    pub async fn verify(&mut self, resolver: &Resolver, headers: &[(String, String)]) {
        if self.verified {
            return;
        }
        self.verified = true;

        let slots = std::mem::take(&mut self.slots);
        let mut results = Vec::with_capacity(slots.len());

        for slot in slots {
            let result = match slot {
                FrameSlot::Failed(r) => r,
                FrameSlot::Active { frame, digester } => {
                verify_one(&frame, digester, resolver, headers, self.policy.keep_leading_space, self.policy.min_rsa_key_bits).await
            }
            };
            results.push(result);
        }

        self.results = results;
    }

    pub fn results(&self) -> &[FrameResult] {
        &self.results
    }

    /// `SessionResult`: a coarse overall score across all frames — PASS if
    /// any frame passed, FAIL if at least one frame exists and none
    /// passed, NONE if there were no signatures at all.
    pub fn session_result(&self) -> Score {
        if self.results.is_empty() {
            return Score::None;
        }
        if self.results.iter().any(|r| r.score == Score::Pass) {
            return Score::Pass;
        }
        if self.results.iter().any(|r| r.score == Score::TempError) {
            return Score::TempError;
        }
        if self.results.iter().any(|r| r.score == Score::PermError) {
            return Score::PermError;
        }
        Score::Fail
    }
}

fn failed_result(sdid: &str, selector: &str, auid: Option<String>, status: Status) -> FrameResult {
    let score = if status.is_temp_error() { Score::TempError } else { Score::PermError };
    FrameResult {
        score,
        status,
        sdid: sdid.to_string(),
        selector: selector.to_string(),
        auid,
        key_bits: None,
        testing: false,
    }
}

async fn verify_one(
    frame: &SignatureFrame,
    digester: Digester,
    resolver: &Resolver,
    headers: &[(String, String)],
    keep_leading_space: bool,
    min_rsa_key_bits: usize,
) -> FrameResult {
    let sig_hash_name = match frame.algorithm.hash {
        HashAlgo::Sha1 => "sha1",
        HashAlgo::Sha256 => "sha256",
    };

    let record: KeyRecord = match key::fetch(resolver, &frame.selector, &frame.sdid).await {
        Ok(r) => r,
        Err(e) => return key_error_result(frame, e),
    };

    if let Err(e) = key::check_compatible(&record, frame.algorithm.key, sig_hash_name, frame.auid.as_deref(), &frame.sdid, min_rsa_key_bits) {
        return key_error_result(frame, e);
    }

    let body_hash = digester.finalize_body_hash();
    if body_hash != frame.body_hash {
        return FrameResult {
            score: Score::Fail,
            status: Status::Permanent("BodyHashMismatch".into()),
            sdid: frame.sdid.clone(),
            selector: frame.selector.clone(),
            auid: frame.auid.clone(),
            key_bits: key_bits(&record.public_key),
            testing: record.testing,
        };
    }

    let mut header_digester = Digester::new(frame.algorithm.hash, frame.canon.header, frame.canon.body, frame.body_limit);
    for name in selected_headers(headers, &frame.signed_headers) {
        let canonical = canon_header(frame.canon.header, &name.0, &name.1, keep_leading_space);
        header_digester.feed_header(&format!("{canonical}\r\n"));
    }
    let elided = match frame::elide_b_tag(&frame.raw_value) {
        Ok(s) => s,
        Err(_) => String::new(),
    };
    let canonical_sig = canon_header(frame.canon.header, "DKIM-Signature", &elided, keep_leading_space);
    header_digester.feed_signature_header(&canonical_sig);
    let header_hash = header_digester.into_header_hash();

    let outcome = crate::digest::verify_signature(frame.algorithm.hash, &header_hash, &frame.signature, &record.public_key);
    match outcome {
        Ok(true) => FrameResult {
            score: Score::Pass,
            status: Status::Ok,
            sdid: frame.sdid.clone(),
            selector: frame.selector.clone(),
            auid: frame.auid.clone(),
            key_bits: key_bits(&record.public_key),
            testing: record.testing,
        },
        Ok(false) => FrameResult {
            score: Score::Fail,
            status: Status::Permanent("SignatureMismatch".into()),
            sdid: frame.sdid.clone(),
            selector: frame.selector.clone(),
            auid: frame.auid.clone(),
            key_bits: key_bits(&record.public_key),
            testing: record.testing,
        },
        Err(status) => FrameResult {
            score: Score::PermError,
            status,
            sdid: frame.sdid.clone(),
            selector: frame.selector.clone(),
            auid: frame.auid.clone(),
            key_bits: key_bits(&record.public_key),
            testing: record.testing,
        },
    }
}

fn key_error_result(frame: &SignatureFrame, err: KeyError) -> FrameResult {
    let (score, status) = match err {
        KeyError::NoKeyForSignature => (Score::PermError, Status::Permanent("NO_KEY_FOR_SIGNATURE".into())),
        KeyError::MultipleDnsRr => (Score::PermError, Status::Permanent("MULTIPLE_DNSRR".into())),
        KeyError::KeyRevoked => (Score::PermError, Status::Permanent("KEY_REVOKED".into())),
        KeyError::KeyIncompatible(msg) => (Score::PermError, Status::Permanent(msg)),
        KeyError::Temporary(msg) => (Score::TempError, Status::Temporary(msg)),
    };
    FrameResult {
        score,
        status,
        sdid: frame.sdid.clone(),
        selector: frame.selector.clone(),
        auid: frame.auid.clone(),
        key_bits: None,
        testing: false,
    }
}

fn key_bits(pk: &PublicKey) -> Option<usize> {
    match pk {
        PublicKey::Rsa(k) => {
            use rsa::traits::PublicKeyParts;
            Some(k.n().bits())
        }
        PublicKey::Ed25519(_) => Some(256),
    }
}

/// Select headers for a signature's `h=` list, bottom-most remaining
/// instance first (RFC 6376 §5.4).
fn selected_headers(headers: &[(String, String)], h_list: &[String]) -> Vec<(String, String)> {
    let mut by_name: HashMap<String, Vec<&(String, String)>> = HashMap::new();
    for pair in headers {
        by_name.entry(pair.0.to_ascii_lowercase()).or_default().push(pair);
    }
    for v in by_name.values_mut() {
        v.reverse();
    }

    let mut cursor: HashMap<String, usize> = HashMap::new();
    let mut out = Vec::with_capacity(h_list.len());
    for name in h_list {
        let idx = cursor.entry(name.clone()).or_insert(0);
        if let Some(candidates) = by_name.get(name) {
            if let Some(pair) = candidates.get(*idx) {
                out.push((*pair).clone());
            }
        }
        *idx += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_fixture() -> Vec<(String, String)> {
        vec![
            ("From".into(), "alice@example.com".into()),
            ("To".into(), "bob@example.org".into()),
            ("Subject".into(), "hi".into()),
        ]
    }

    #[test]
    fn selected_headers_consumes_bottom_most_instance_first() {
        let headers = vec![
            ("From".to_string(), "first".to_string()),
            ("From".to_string(), "second".to_string()),
        ];
        let h_list = vec!["from".to_string(), "from".to_string()];
        let selected = selected_headers(&headers, &h_list);
        assert_eq!(selected[0].1, "second");
        assert_eq!(selected[1].1, "first");
    }

    #[test]
    fn selected_headers_contributes_nothing_for_missing_names() {
        let headers = headers_fixture();
        let h_list = vec!["cc".to_string()];
        assert!(selected_headers(&headers, &h_list).is_empty());
    }

    #[test]
    fn new_returns_no_sign_header_when_absent() {
        let headers = headers_fixture();
        let outcome = Verifier::new(DkimPolicy::default(), &headers, 1_700_000_000).unwrap();
        assert!(matches!(outcome, NewOutcome::NoSignHeader));
    }

    #[test]
    fn new_respects_signheader_limit() {
        let mut headers = headers_fixture();
        for _ in 0..7 {
            headers.push((
                "DKIM-Signature".into(),
                "v=1; a=rsa-sha256; d=example.com; s=sel; h=from; bh=AAAA; b=BBBB".into(),
            ));
        }
        let mut policy = DkimPolicy::default();
        policy.signheader_limit = 5;
        let outcome = Verifier::new(policy, &headers, 1_700_000_000).unwrap();
        match outcome {
            NewOutcome::Verifier(v) => {
                assert_eq!(v.frame_count(), 5);
                assert_eq!(v.excess_signatures(), 2);
            }
            NewOutcome::NoSignHeader => panic!("expected a verifier"),
        }
    }

    #[test]
    fn session_result_is_none_with_no_signatures() {
        let headers = headers_fixture();
        let outcome = Verifier::new(DkimPolicy::default(), &headers, 1_700_000_000).unwrap();
        match outcome {
            NewOutcome::Verifier(v) => assert_eq!(v.session_result(), Score::None),
            NewOutcome::NoSignHeader => {}
        }
    }
}
