/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Session state machine: the milter-callback-shaped orchestrator
//! that drives every other component in order —
//! `NEG -> CONN -> HELO -> ENVFROM -> HEADER* -> EOH -> BODY* -> EOM -> CLOSED`,
//! with `ABORT` resetting per-message state at any point after `ENVFROM`.
//!
//! [`Session`] itself holds no indymilter types; the milter transport glue
//! lives in `main.rs` and translates indymilter's callback arguments into
//! calls against this module's plain-Rust API. That keeps the orchestration
//! logic testable without a running milter connection.

use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::auth_results::{self, Builder, Clause};
use crate::config::RejectAction;
use crate::context::{AuthContext, DmarcSettings};
use crate::counter::ConnectionCounter;
use crate::dkim::adsp::{self, AdspScore};
use crate::dkim::atps::{self, AtpsScore};
use crate::dkim::{self, NewOutcome};
use crate::dmarc::{AlignedDkim, Aligner, Policy as DmarcPolicy};
use crate::error::{Result, Score, Status};
use crate::resolver::Resolver;
use crate::spf::{self, BasicSpfEngine, Scope, SpfEvaluator};

use std::sync::Arc;

/// The envelope-from mailbox, or the null reverse path (`MAIL FROM:<>`).
#[derive(Debug, Clone, Default)]
pub struct EnvelopeFrom {
    pub mailbox: Option<String>,
}

impl EnvelopeFrom {
    /// Parse the milter `envfrom` callback's argument list: the first
    /// element is the bracketed address (`<user@example.com>` or `<>`),
    /// any remaining elements are ESMTP `MAIL FROM` parameters and are
    /// ignored; ESMTP parameter parsing is out of scope.
    pub fn parse(args: &[String]) -> Self {
        let raw = args.first().map(String::as_str).unwrap_or("<>");
        let inner = raw.trim_start_matches('<').trim_end_matches('>').trim();
        if inner.is_empty() {
            Self { mailbox: None }
        } else {
            Self { mailbox: Some(inner.to_string()) }
        }
    }

    pub fn domain(&self) -> Option<&str> {
        self.mailbox.as_deref().and_then(|m| m.rsplit_once('@').map(|(_, d)| d))
    }
}

/// What the milter should tell the MTA to do with the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    Reject { code: String },
    TempFail { code: String },
    Discard,
}

/// What `connect()` tells the caller to do before any further callback
/// fires: excluded connections (IP-exclusion tree match) skip
/// authentication entirely and are accepted unconditionally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectAction {
    Proceed,
    SkipExcluded,
}

/// Negotiated milter capabilities this filter asks for: it only ever
/// adds/changes headers and replies to `EOM`, never touches recipients or
/// the body.
#[derive(Debug, Clone, Copy)]
pub struct Negotiation {
    pub add_headers: bool,
    pub change_headers: bool,
}

pub fn negotiate() -> Negotiation {
    Negotiation { add_headers: true, change_headers: true }
}

/// The result of `eom()`: the rendered Authentication-Results header, the
/// indices of every forged copy to delete first, and the final verdict.
/// Callers must remove high indices first so earlier ones don't shift
/// underneath them.
#[derive(Debug, Clone)]
pub struct EomOutcome {
    pub header_name: &'static str,
    pub header_value: String,
    pub remove_forged_ar: Vec<usize>,
    pub verdict: Verdict,
}

/// Per-connection state, reset at each `ENVFROM` for the per-message
/// portion.
pub struct Session {
    ctx: Arc<AuthContext>,
    conn_counter: Arc<ConnectionCounter>,
    client_ip: Option<IpAddr>,
    helo: Option<String>,
    resolver: Option<Resolver>,

    envfrom: Option<EnvelopeFrom>,
    headers: Vec<(String, String)>,
    /// 1-based *occurrence* ordinals (ascending, among `Authentication-Results`
    /// headers only — the indexing `chgheader`/`change_header` uses, per
    /// milter convention, is "the Nth header with this name", not a
    /// position in the full header list) of every incoming
    /// `Authentication-Results` header whose `authserv-id` matches ours. A
    /// message can carry more than one forged copy, and every one of them
    /// must be stripped, not just the last seen.
    forged_ar_indices: Vec<u32>,
    /// Running count of `Authentication-Results` occurrences seen so far
    /// this message, used to compute the ordinal above.
    ar_seen: u32,
    dkim_verifier: Option<dkim::Verifier>,
}

impl Session {
    /// `CONN` predecessor: allocate session state and account for the new
    /// connection in the shared counter.
    pub fn new(ctx: Arc<AuthContext>, conn_counter: Arc<ConnectionCounter>) -> Self {
        conn_counter.increment();
        Self {
            ctx,
            conn_counter,
            client_ip: None,
            helo: None,
            resolver: None,
            envfrom: None,
            headers: Vec::new(),
            forged_ar_indices: Vec::new(),
            ar_seen: 0,
            dkim_verifier: None,
        }
    }

    /// `CONN`: record the peer address and check the exclusion tree before
    /// acquiring a resolver, so excluded connections never touch the pool.
    pub fn connect(&mut self, client_ip: Option<IpAddr>) -> ConnectAction {
        self.client_ip = client_ip;
        if let Some(ip) = client_ip {
            if self.ctx.exclusion.contains(ip) {
                return ConnectAction::SkipExcluded;
            }
        }
        self.resolver = self.ctx.resolver_pool.acquire();
        if self.resolver.is_none() {
            warn!("resolver pool exhausted, DNS-dependent checks will tempfail");
        }
        ConnectAction::Proceed
    }

    /// `HELO`: only the first HELO/EHLO in a connection is kept — a second
    /// HELO after STARTTLS re-negotiation doesn't overwrite the one SPF
    /// already keyed its evaluation on.
    pub fn helo(&mut self, helo: &str) {
        if self.helo.is_none() {
            self.helo = Some(helo.to_ascii_lowercase());
        }
    }

    /// `ENVFROM`: begin a new message, resetting all per-message state.
    pub fn envfrom(&mut self, args: &[String]) {
        self.reset_per_message();
        self.envfrom = Some(EnvelopeFrom::parse(args));
    }

    fn reset_per_message(&mut self) {
        self.envfrom = None;
        self.headers.clear();
        self.forged_ar_indices.clear();
        self.ar_seen = 0;
        self.dkim_verifier = None;
    }

    /// `HEADER`: store the header in declaration order, and flag (by
    /// occurrence ordinal) every incoming `Authentication-Results` header
    /// whose `authserv-id` matches ours — a forgery attempt to be stripped
    /// before we add our own (RFC 8601 §5, `CompareAuthservId`-style
    /// removal). A message can
    /// carry more than one such header; all of them are recorded. Only this
    /// one header name is ever a removal candidate, so an existing
    /// `ARC-Seal`/`ARC-Message-Signature`/`ARC-Authentication-Results` chain
    /// is stored and passed through untouched like any other header.
    pub fn header(&mut self, name: &str, value: &str) {
        if name.eq_ignore_ascii_case(auth_results::Builder::field_name()) {
            self.ar_seen += 1;
            if auth_results::compare_authserv_id(value, &self.ctx.authserv_id) {
                self.forged_ar_indices.push(self.ar_seen);
            }
        }
        self.headers.push((name.to_string(), value.to_string()));
    }

    /// `EOH`: headers are complete; construct the DKIM verifier now that
    /// every `DKIM-Signature` occurrence is known.
    pub fn eoh(&mut self) -> Result<()> {
        if !self.ctx.dkim_enable {
            return Ok(());
        }
        match dkim::Verifier::new(self.ctx.dkim_policy.clone(), &self.headers, now_unix())? {
            NewOutcome::NoSignHeader => {}
            NewOutcome::Verifier(v) => self.dkim_verifier = Some(v),
        }
        Ok(())
    }

    /// `BODY`: feed one chunk into every active DKIM frame's digester.
    pub fn body(&mut self, chunk: &[u8]) -> Result<()> {
        if let Some(verifier) = &mut self.dkim_verifier {
            verifier.update_body(chunk)?;
        }
        Ok(())
    }

    /// `ABORT`: the MTA gave up on this message (another RCPT loop, a
    /// client disconnect mid-DATA). Reset per-message state; the
    /// connection itself, and its resolver/counter accounting, survive.
    pub fn abort(&mut self) {
        self.reset_per_message();
    }

    /// `CLOSE`: release the resolver back to the pool and account for the
    /// connection's end.
    pub fn close(&mut self) {
        if let Some(resolver) = self.resolver.take() {
            self.ctx.resolver_pool.release(resolver);
        }
        self.conn_counter.decrement();
    }

    fn resolver(&self) -> Result<&Resolver> {
        self.resolver.as_ref().ok_or_else(|| Status::System("no resolver acquired for this session".into()))
    }

    /// `EOM`: run every enabled mechanism in spec order, assemble the
    /// Authentication-Results header, and derive the final verdict.
    pub async fn eom(&mut self) -> Result<EomOutcome> {
        let mut builder = Builder::new(self.ctx.authserv_id.clone());
        let mut aligned_dkim: Vec<(String, bool)> = Vec::new();

        self.evaluate_spf(&mut builder).await?;
        self.evaluate_sender_id(&mut builder).await?;
        self.evaluate_dkim(&mut builder, &mut aligned_dkim).await?;

        let author_domains = extract_mailbox_domains(&self.from_header_value());

        if self.ctx.dkim_adsp_enable {
            self.evaluate_adsp(&mut builder, &author_domains, &aligned_dkim).await?;
        }
        if self.ctx.dkim_atps_enable {
            self.evaluate_atps(&mut builder, &author_domains, &aligned_dkim).await?;
        }

        let verdict = if self.ctx.dmarc.enable {
            self.evaluate_dmarc(&mut builder, &author_domains, &aligned_dkim).await?
        } else {
            Verdict::Continue
        };

        if !matches!(verdict, Verdict::Continue) {
            info!(?verdict, "dmarc policy enforcement");
        }

        Ok(EomOutcome {
            header_name: Builder::field_name(),
            header_value: builder.build(),
            remove_forged_ar: self.forged_ar_indices.clone(),
            verdict,
        })
    }

    fn from_header_value(&self) -> String {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("from"))
            .map(|(_, v)| v.clone())
            .unwrap_or_default()
    }

    /// SPF readiness rule: HELO must be set; with a null
    /// reverse-path, HELO must additionally be a real FQDN, otherwise the
    /// check reports `permerror` without ever contacting the resolver.
    async fn evaluate_spf(&self, builder: &mut Builder) -> Result<()> {
        if !self.ctx.spf_policy.spf_enable {
            return Ok(());
        }
        let Some(helo) = self.helo.clone() else {
            self.ctx.stats.record_spf(Score::None);
            builder.append(Clause::new("spf", Score::None));
            return Ok(());
        };

        let envfrom = self.envfrom.clone().unwrap_or_default();
        let score = match &envfrom.mailbox {
            Some(mailbox) => {
                let Some(ip) = self.client_ip else {
                    self.ctx.stats.record_spf(Score::TempError);
                    builder.append(Clause::new("spf", Score::TempError));
                    return Ok(());
                };
                let resolver = self.resolver()?;
                let mut engine = BasicSpfEngine::new(resolver);
                engine.set_ip(ip);
                engine.set_sender(mailbox);
                engine.set_helo(&helo);
                match engine.eval(Scope::MailFrom).await {
                    Ok(score) => score,
                    Err(status) => mechanism_score_or_escalate(status)?,
                }
            }
            None if !spf::helo_is_real_fqdn(&helo) => Score::PermError,
            None => {
                let Some(ip) = self.client_ip else {
                    self.ctx.stats.record_spf(Score::TempError);
                    builder.append(Clause::new("spf", Score::TempError));
                    return Ok(());
                };
                let resolver = self.resolver()?;
                let mut engine = BasicSpfEngine::new(resolver);
                engine.set_ip(ip);
                engine.set_sender(&format!("postmaster@{helo}"));
                engine.set_helo(&helo);
                match engine.eval(Scope::Helo).await {
                    Ok(score) => score,
                    Err(status) => mechanism_score_or_escalate(status)?,
                }
            }
        };

        self.ctx.stats.record_spf(score);
        let clause = match &envfrom.mailbox {
            Some(mailbox) => Clause::new("spf", score).with_property("smtp", "mailfrom", mailbox.clone()),
            None => Clause::new("spf", score).with_property("smtp", "helo", helo),
        };
        builder.append(clause);
        Ok(())
    }

    /// Sender-ID PRA check (RFC 4406), gated on its own enable flag since
    /// it is rarely wanted alongside plain SPF.
    async fn evaluate_sender_id(&self, builder: &mut Builder) -> Result<()> {
        if !self.ctx.spf_policy.sender_id_enable {
            return Ok(());
        }
        let Some(helo) = self.helo.clone() else {
            self.ctx.stats.record_sender_id(Score::None);
            builder.append(Clause::new("sender-id", Score::None));
            return Ok(());
        };
        let Some(pra) = spf::extract_pra(&self.headers) else {
            self.ctx.stats.record_sender_id(Score::None);
            builder.append(Clause::new("sender-id", Score::None));
            return Ok(());
        };
        let Some(ip) = self.client_ip else {
            self.ctx.stats.record_sender_id(Score::TempError);
            builder.append(Clause::new("sender-id", Score::TempError));
            return Ok(());
        };

        let resolver = self.resolver()?;
        let mut engine = BasicSpfEngine::new(resolver);
        engine.set_ip(ip);
        engine.set_sender(&pra);
        engine.set_helo(&helo);
        let score = match engine.eval(Scope::Pra).await {
            Ok(score) => score,
            Err(status) => mechanism_score_or_escalate(status)?,
        };

        self.ctx.stats.record_sender_id(score);
        builder.append(Clause::new("sender-id", score).with_property("header", "from", pra));
        Ok(())
    }

    /// DKIM verification (RFC 6376 §6): run every frame, append one clause
    /// per signature, and collect alignment-relevant (sdid, passed) pairs
    /// for the ADSP/ATPS/DMARC stages downstream.
    async fn evaluate_dkim(
        &mut self,
        builder: &mut Builder,
        aligned_dkim: &mut Vec<(String, bool)>,
    ) -> Result<()> {
        if !self.ctx.dkim_enable {
            return Ok(());
        }
        let Some(verifier) = &mut self.dkim_verifier else {
            self.ctx.stats.record_dkim(Score::None);
            builder.append(Clause::new("dkim", Score::None));
            return Ok(());
        };

        let resolver = self.resolver.as_ref().ok_or_else(|| Status::System("no resolver acquired for this session".into()))?;
        verifier.verify(resolver, &self.headers).await;

        let session_score = verifier.session_result();
        self.ctx.stats.record_dkim(session_score);

        for result in verifier.results() {
            aligned_dkim.push((result.sdid.clone(), result.score == Score::Pass));
            let mut clause = Clause::new("dkim", result.score)
                .with_property("header", "d", result.sdid.clone());
            if let Some(auid) = &result.auid {
                clause = clause.with_property("header", "i", auid.clone());
            }
            if result.score != Score::Pass && result.score != Score::None {
                clause = clause.with_reason(result.status.to_string());
            }
            builder.append(clause);
        }
        Ok(())
    }

    /// ADSP (RFC 5617): one check per author domain, only when no
    /// DKIM signature already aligns with it.
    async fn evaluate_adsp(
        &self,
        builder: &mut Builder,
        author_domains: &[String],
        aligned_dkim: &[(String, bool)],
    ) -> Result<()> {
        let resolver = self.resolver()?;
        for domain in author_domains {
            let any_aligned_pass = aligned_dkim.iter().any(|(sdid, passed)| *passed && sdid.eq_ignore_ascii_case(domain));

            // ADSP/ATPS errors are per-author: a DNS hiccup or malformed
            // record for one author domain never aborts the others.
            let mx_exists = match mx_exists(resolver, domain).await {
                Ok(v) => v,
                Err(_) => {
                    self.ctx.stats.record_dkim_adsp(AdspScore::TempError);
                    builder.append(
                        Clause::new_raw("dkim-adsp", AdspScore::TempError.to_string())
                            .with_property("header", "from", domain.clone()),
                    );
                    continue;
                }
            };
            let practice = match adsp::fetch_practice(resolver, domain).await {
                Ok(p) => Some(p),
                Err(Status::Info(_)) => None,
                Err(Status::Temporary(_)) => {
                    self.ctx.stats.record_dkim_adsp(AdspScore::TempError);
                    builder.append(
                        Clause::new_raw("dkim-adsp", AdspScore::TempError.to_string())
                            .with_property("header", "from", domain.clone()),
                    );
                    continue;
                }
                Err(Status::Permanent(_)) => {
                    self.ctx.stats.record_dkim_adsp(AdspScore::PermError);
                    builder.append(
                        Clause::new_raw("dkim-adsp", AdspScore::PermError.to_string())
                            .with_property("header", "from", domain.clone()),
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };
            let score = adsp::score(mx_exists, practice, any_aligned_pass);
            self.ctx.stats.record_dkim_adsp(score);
            builder.append(Clause::new_raw("dkim-adsp", score.to_string()).with_property("header", "from", domain.clone()));
        }
        Ok(())
    }

    /// ATPS (draft-kucherawy-dkim-atps): for every author domain not already
    /// aligned, check whether it has delegated to any of this message's
    /// signing domains.
    async fn evaluate_atps(
        &self,
        builder: &mut Builder,
        author_domains: &[String],
        aligned_dkim: &[(String, bool)],
    ) -> Result<()> {
        let resolver = self.resolver()?;
        let hash_algo = self.ctx.dkim_atps_hash_algo;
        for domain in author_domains {
            if aligned_dkim.iter().any(|(sdid, passed)| *passed && sdid.eq_ignore_ascii_case(domain)) {
                continue;
            }
            let mut best = AtpsScore::Fail;
            for (sdid, _) in aligned_dkim {
                match atps::check_delegation(resolver, sdid, domain, hash_algo).await {
                    Ok(AtpsScore::Pass) => {
                        best = AtpsScore::Pass;
                        break;
                    }
                    Ok(AtpsScore::TempError) => best = AtpsScore::TempError,
                    Ok(AtpsScore::Fail) => {}
                    // ADSP/ATPS errors are per-author: a failed lookup for
                    // one candidate SDID never aborts the whole session.
                    Err(Status::Temporary(_)) => best = AtpsScore::TempError,
                    Err(Status::Permanent(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            self.ctx.stats.record_dkim_atps(best);
            builder.append(Clause::new_raw("dkim-atps", best.to_string()).with_property("header", "from", domain.clone()));
        }
        Ok(())
    }

    /// DMARC (RFC 7489): evaluate every author mailbox's domain
    /// independently, combine by strictest policy/score, render one
    /// `dmarc=` clause, and map the combined result to a verdict.
    async fn evaluate_dmarc(
        &self,
        builder: &mut Builder,
        author_domains: &[String],
        aligned_dkim: &[(String, bool)],
    ) -> Result<Verdict> {
        if author_domains.is_empty() {
            self.ctx.stats.record_dmarc(Score::None);
            builder.append(Clause::new("dmarc", Score::None));
            return Ok(Verdict::Continue);
        }

        let resolver = self.resolver()?;
        let aligner = Aligner::new(&self.ctx.psl);
        let dkim_for_check: Vec<AlignedDkim> =
            aligned_dkim.iter().map(|(sdid, passed)| AlignedDkim { sdid, passed: *passed }).collect();
        let spf_domain = self.envfrom.as_ref().and_then(|e| e.domain());

        let mut combined_score = Score::None;
        let mut combined_policy = DmarcPolicy::None;
        let mut any_record = false;

        for domain in author_domains {
            // DMARC record discovery can DNS-temperror or hit a malformed
            // record for one author domain; that scores this domain's
            // contribution without aborting the others or the whole message.
            let record = match aligner.discover(resolver, domain).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(Status::Temporary(_)) => {
                    any_record = true;
                    combined_score = combine_dmarc_score(combined_score, Score::TempError);
                    continue;
                }
                Err(Status::Permanent(_)) => {
                    any_record = true;
                    combined_score = combine_dmarc_score(combined_score, Score::PermError);
                    continue;
                }
                Err(e) => return Err(e),
            };
            any_record = true;
            let score = aligner.check(&record, domain, &dkim_for_check, spf_domain);
            let failed = score == Score::Fail;
            let policy = aligner.receiver_policy(&record, domain, failed, true);
            combined_score = combine_dmarc_score(combined_score, score);
            combined_policy = combined_policy.strictest(policy);
        }

        if !any_record {
            self.ctx.stats.record_dmarc(Score::None);
            builder.append(Clause::new("dmarc", Score::None));
            return Ok(Verdict::Continue);
        }

        self.ctx.stats.record_dmarc(combined_score);
        let from_domain = author_domains.first().cloned().unwrap_or_default();
        builder.append(Clause::new("dmarc", combined_score).with_property("header", "from", from_domain));

        if combined_policy == DmarcPolicy::Reject {
            Ok(verdict_for_reject_action(self.ctx.dmarc.reject_action, &self.ctx.dmarc))
        } else {
            Ok(Verdict::Continue)
        }
    }
}

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

/// Crude `addr-spec` extraction across a comma-separated address list: look
/// for each `<...>` mailbox, falling back to bare `user@domain` tokens —
/// mirrors [`crate::spf::extract_pra`]'s single-mailbox extraction, widened
/// to return every mailbox in a `From:` header (RFC 5322's full grammar is
/// out of scope).
fn split_mailbox_list(value: &str) -> Vec<String> {
    let mut mailboxes = Vec::new();
    let bytes = value.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'<' {
            if let Some(end) = value[i..].find('>') {
                let inner = &value[i + 1..i + end];
                if inner.contains('@') {
                    mailboxes.push(inner.trim().to_string());
                }
                i += end + 1;
                continue;
            }
        }
        i += 1;
    }
    if mailboxes.is_empty() {
        for token in value.split(',') {
            let token = token.trim().trim_matches(|c| c == '"' || c == '\'');
            if token.contains('@') && !token.contains('<') {
                mailboxes.push(token.to_string());
            }
        }
    }
    mailboxes
}

/// Extract the distinct, lower-cased domains from a `From:` header's
/// mailbox list.
fn extract_mailbox_domains(from_header_value: &str) -> Vec<String> {
    let mut domains = Vec::new();
    for mailbox in split_mailbox_list(from_header_value) {
        if let Some((_, domain)) = mailbox.rsplit_once('@') {
            let domain = domain.to_ascii_lowercase();
            if !domains.contains(&domain) {
                domains.push(domain);
            }
        }
    }
    domains
}

/// Combine two DMARC evaluation scores across multiple author mailboxes:
/// any Fail dominates, then any Pass, else None (RFC 7489 §5.6.1's
/// multiple-aligned-identifier guidance, extended to TempError/PermError
/// priority).
fn combine_dmarc_score(a: Score, b: Score) -> Score {
    match (a, b) {
        (Score::Fail, _) | (_, Score::Fail) => Score::Fail,
        (Score::Pass, _) | (_, Score::Pass) => Score::Pass,
        (Score::TempError, _) | (_, Score::TempError) => Score::TempError,
        (Score::PermError, _) | (_, Score::PermError) => Score::PermError,
        _ => Score::None,
    }
}

/// Turn a mechanism-scoped error into its RFC 8601 result token instead of
/// letting it escalate out of `eom()` — only a true session-scope failure
/// (`System`/`Config`) still propagates as a `Result::Err`.
fn mechanism_score_or_escalate(status: Status) -> Result<Score> {
    status.to_mechanism_score().ok_or(status)
}

/// Map the configured `dmarc_reject_action` to a milter verdict, rendering
/// the reply-code triple the config carries.
fn verdict_for_reject_action(action: RejectAction, settings: &DmarcSettings) -> Verdict {
    let code = format!("{} {} {}", settings.reject_reply_code, settings.reject_enhanced_status, settings.reject_message);
    match action {
        RejectAction::Reject => Verdict::Reject { code },
        RejectAction::Tempfail => Verdict::TempFail { code },
        RejectAction::Discard => Verdict::Discard,
        RejectAction::None => Verdict::Continue,
    }
}

/// Whether `domain` resolves at all, for ADSP's NXDOMAIN branch. Mirrors
/// the reduced error handling the rest of this
/// crate uses for negative DNS answers: anything else is a temporary error.
async fn mx_exists(resolver: &Resolver, domain: &str) -> Result<bool> {
    match resolver.mx_lookup(domain.to_string()).await {
        Ok(_) => Ok(true),
        Err(e) => {
            use hickory_resolver::error::ResolveErrorKind;
            match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Ok(false),
                _ => Err(Status::Temporary(format!("MX lookup failed for {domain}: {e}"))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_from_parses_null_reverse_path() {
        let ef = EnvelopeFrom::parse(&["<>".to_string()]);
        assert!(ef.mailbox.is_none());
    }

    #[test]
    fn envelope_from_parses_mailbox_and_strips_brackets() {
        let ef = EnvelopeFrom::parse(&["<alice@example.org>".to_string(), "SIZE=1024".to_string()]);
        assert_eq!(ef.mailbox.as_deref(), Some("alice@example.org"));
        assert_eq!(ef.domain(), Some("example.org"));
    }

    #[test]
    fn envelope_from_defaults_to_null_when_args_empty() {
        let ef = EnvelopeFrom::parse(&[]);
        assert!(ef.mailbox.is_none());
    }

    #[test]
    fn split_mailbox_list_extracts_bracketed_addresses() {
        let value = "Alice <alice@example.org>, \"Bob B\" <bob@example.com>";
        let mailboxes = split_mailbox_list(value);
        assert_eq!(mailboxes, vec!["alice@example.org", "bob@example.com"]);
    }

    #[test]
    fn split_mailbox_list_falls_back_to_bare_addr_spec() {
        let mailboxes = split_mailbox_list("alice@example.org, bob@example.com");
        assert_eq!(mailboxes, vec!["alice@example.org", "bob@example.com"]);
    }

    #[test]
    fn extract_mailbox_domains_dedupes_and_lowercases() {
        let domains = extract_mailbox_domains("Alice <alice@Example.org>, Other <x@EXAMPLE.ORG>");
        assert_eq!(domains, vec!["example.org"]);
    }

    #[test]
    fn combine_dmarc_score_prefers_fail_over_pass() {
        assert_eq!(combine_dmarc_score(Score::Pass, Score::Fail), Score::Fail);
        assert_eq!(combine_dmarc_score(Score::Fail, Score::Pass), Score::Fail);
        assert_eq!(combine_dmarc_score(Score::Pass, Score::Pass), Score::Pass);
        assert_eq!(combine_dmarc_score(Score::None, Score::None), Score::None);
    }

    #[test]
    fn verdict_for_reject_action_renders_reply_code_triple() {
        let settings = DmarcSettings {
            enable: true,
            reject_action: RejectAction::Reject,
            reject_reply_code: "550".to_string(),
            reject_enhanced_status: "5.7.1".to_string(),
            reject_message: "rejected".to_string(),
        };
        match verdict_for_reject_action(RejectAction::Reject, &settings) {
            Verdict::Reject { code } => assert_eq!(code, "550 5.7.1 rejected"),
            other => panic!("expected Reject, got {other:?}"),
        }
    }

    #[test]
    fn verdict_for_reject_action_maps_each_action() {
        let settings = DmarcSettings {
            enable: true,
            reject_action: RejectAction::None,
            reject_reply_code: "550".to_string(),
            reject_enhanced_status: "5.7.1".to_string(),
            reject_message: "rejected".to_string(),
        };
        assert!(matches!(verdict_for_reject_action(RejectAction::Tempfail, &settings), Verdict::TempFail { .. }));
        assert!(matches!(verdict_for_reject_action(RejectAction::Discard, &settings), Verdict::Discard));
        assert!(matches!(verdict_for_reject_action(RejectAction::None, &settings), Verdict::Continue));
    }

    fn test_context() -> Arc<AuthContext> {
        let cfg = crate::config::Config::load_from_str_for_tests("authserv_id: mx.test\nresolver_pool_size: 1\n");
        let stats = Arc::new(crate::stats::Statistics::new());
        Arc::new(AuthContext::build(&cfg, stats, &[]).unwrap())
    }

    #[test]
    fn new_and_close_track_the_connection_counter() {
        let counter = Arc::new(ConnectionCounter::new());
        let mut session = Session::new(test_context(), counter.clone());
        assert_eq!(counter.get(), 2);
        session.close();
        assert_eq!(counter.get(), 1);
    }

    #[test]
    fn connect_skips_excluded_ips_without_acquiring_a_resolver() {
        let cfg = crate::config::Config::load_from_str_for_tests(
            "authserv_id: mx.test\nresolver_pool_size: 1\n",
        );
        let stats = Arc::new(crate::stats::Statistics::new());
        let ctx = Arc::new(AuthContext::build(&cfg, stats, &["192.0.2.0/24".to_string()]).unwrap());
        let counter = Arc::new(ConnectionCounter::new());
        let mut session = Session::new(ctx, counter);

        let action = session.connect(Some("192.0.2.5".parse().unwrap()));
        assert_eq!(action, ConnectAction::SkipExcluded);
        assert!(session.resolver.is_none());
    }

    #[test]
    fn first_helo_wins_over_a_later_one() {
        let mut session = Session::new(test_context(), Arc::new(ConnectionCounter::new()));
        session.helo("first.example.org");
        session.helo("second.example.org");
        assert_eq!(session.helo.as_deref(), Some("first.example.org"));
    }

    #[test]
    fn envfrom_resets_headers_collected_from_a_prior_message() {
        let mut session = Session::new(test_context(), Arc::new(ConnectionCounter::new()));
        session.header("Subject", "first message");
        session.envfrom(&["<alice@example.org>".to_string()]);
        assert!(session.headers.is_empty());
        assert_eq!(session.envfrom.as_ref().unwrap().mailbox.as_deref(), Some("alice@example.org"));
    }

    #[test]
    fn header_flags_a_forged_authentication_results_header() {
        let mut session = Session::new(test_context(), Arc::new(ConnectionCounter::new()));
        session.envfrom(&["<alice@example.org>".to_string()]);
        session.header("Authentication-Results", "mx.test; spf=pass");
        session.header("Subject", "hi");
        assert_eq!(session.forged_ar_indices, vec![1]);
    }

    #[test]
    fn header_flags_every_forged_authentication_results_header() {
        // A message can carry more than one forged copy; all
        // of them must be recorded, not just the last, by their 1-based
        // occurrence ordinal among same-named headers.
        let mut session = Session::new(test_context(), Arc::new(ConnectionCounter::new()));
        session.envfrom(&["<alice@example.org>".to_string()]);
        session.header("Authentication-Results", "mx.test; spf=pass");
        session.header("Subject", "hi");
        session.header("Authentication-Results", "mx.test; dkim=fail");
        assert_eq!(session.forged_ar_indices, vec![1, 2]);
    }

    #[test]
    fn header_does_not_flag_a_different_authservid() {
        let mut session = Session::new(test_context(), Arc::new(ConnectionCounter::new()));
        session.envfrom(&["<alice@example.org>".to_string()]);
        session.header("Authentication-Results", "elsewhere.example.net; spf=pass");
        assert!(session.forged_ar_indices.is_empty());
    }

    #[test]
    fn abort_clears_per_message_state_but_keeps_the_connection_open() {
        let mut session = Session::new(test_context(), Arc::new(ConnectionCounter::new()));
        session.helo("mail.example.org");
        session.envfrom(&["<alice@example.org>".to_string()]);
        session.header("Subject", "hi");
        session.abort();
        assert!(session.headers.is_empty());
        assert!(session.envfrom.is_none());
        assert_eq!(session.helo.as_deref(), Some("mail.example.org"));
    }
}
