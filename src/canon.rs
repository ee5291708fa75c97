/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Stream-oriented header and body canonicalization (RFC 6376 §3.4).
//!
//! Body canonicalization must be correct across arbitrarily split input
//! chunks: after each `Body(chunk)` call, committed output bytes are final,
//! a pending run of CRLFs and an optional pending WSP are held back, and a
//! trailing lone CR is held back until the next byte disambiguates it.
//! `Finalize` flushes that state and applies the trailing-CRLF rule.

/// Header/body canonicalization algorithm selection (RFC 6376 §3.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Simple,
    Relaxed,
}

impl Algorithm {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "simple" => Some(Algorithm::Simple),
            "relaxed" => Some(Algorithm::Relaxed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Simple => "simple",
            Algorithm::Relaxed => "relaxed",
        }
    }
}

/// `h=` / `c=` pair: header algorithm and body algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Canonicalization {
    pub header: Algorithm,
    pub body: Algorithm,
}

impl Canonicalization {
    pub fn simple_simple() -> Self {
        Self { header: Algorithm::Simple, body: Algorithm::Simple }
    }

    /// Parse the `c=` tag, e.g. `relaxed/simple`. A bare algorithm name
    /// (`c=relaxed`) sets the header algorithm and defaults body to simple,
    /// per RFC 6376 §3.5.
    pub fn parse(s: &str) -> Option<Self> {
        match s.split_once('/') {
            Some((h, b)) => Some(Self { header: Algorithm::parse(h)?, body: Algorithm::parse(b)? }),
            None => Some(Self { header: Algorithm::parse(s)?, body: Algorithm::Simple }),
        }
    }
}

/// Canonicalize one header per RFC 6376 §3.4.1 (simple) / §3.4.2 (relaxed).
///
/// `keep_leading_space` mirrors the milter `HDR_LEADSPC` negotiation: when
/// the MTA delivered header values with the separating space already
/// stripped, simple canonicalization must not re-insert one.
pub fn canon_header(algo: Algorithm, name: &str, value: &str, keep_leading_space: bool) -> String {
    match algo {
        Algorithm::Simple => {
            // Byte-exact, with one normalization: a bare LF is promoted to CRLF.
            let mut out = String::with_capacity(name.len() + value.len() + 4);
            out.push_str(name);
            out.push(':');
            if keep_leading_space && !value.starts_with(' ') {
                out.push(' ');
            }
            out.push_str(value);
            promote_bare_lf(&out)
        }
        Algorithm::Relaxed => {
            let mut out = String::with_capacity(name.len() + value.len());
            out.push_str(&name.to_ascii_lowercase());
            out.push(':');
            out.push_str(collapse_wsp(value.trim()).as_str());
            out
        }
    }
}

/// Promote bare `\n` (not preceded by `\r`) to `\r\n`. Stored header values
/// are expected to already be CRLF-terminated; this guards the rare case of
/// a value carrying a bare LF (e.g. synthesized headers).
fn promote_bare_lf(s: &str) -> String {
    if !s.contains('\n') || s.contains("\r\n") && !s.bytes().enumerate().any(|(i, b)| {
        b == b'\n' && (i == 0 || s.as_bytes()[i - 1] != b'\r')
    }) {
        return s.to_string();
    }
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() + 8);
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'\n' && (i == 0 || bytes[i - 1] != b'\r') {
            out.push(b'\r');
        }
        out.push(b);
    }
    String::from_utf8(out).unwrap_or_else(|_| s.to_string())
}

/// Collapse runs of WSP (space/tab) to a single space, dropping CR/LF
/// (header values arrive unfolded already).
fn collapse_wsp(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut last_was_wsp = false;
    for c in value.chars() {
        match c {
            '\r' | '\n' => continue,
            ' ' | '\t' => {
                if !last_was_wsp {
                    out.push(' ');
                    last_was_wsp = true;
                }
            }
            _ => {
                out.push(c);
                last_was_wsp = false;
            }
        }
    }
    out
}

/// Streaming body canonicalizer. Owns the sliding state described in spec
/// §3 "Canonicalizer state": a count of deferred CRLFs, a deferred-WSP
/// flag, the last byte seen, and running input/output octet counts.
pub struct BodyCanon {
    algo: Algorithm,
    /// Bytes already committed to output, pushed through the digest by the
    /// caller as they are produced.
    pending_crlfs: u32,
    /// Relaxed only: a WSP run seen mid-line, not yet known to be
    /// intra-line (emit) or trailing (drop).
    pending_wsp: bool,
    /// True if the byte immediately preceding the current position was an
    /// unpaired CR, held back to see whether an LF follows.
    pending_cr: bool,
    /// True once any non-CRLF byte has been committed (body is non-empty).
    any_output: bool,
    input_octets: u64,
    output_octets: u64,
    finalized: bool,
}

impl BodyCanon {
    pub fn new(algo: Algorithm) -> Self {
        Self {
            algo,
            pending_crlfs: 0,
            pending_wsp: false,
            pending_cr: false,
            any_output: false,
            input_octets: 0,
            output_octets: 0,
            finalized: false,
        }
    }

    pub fn input_octets(&self) -> u64 {
        self.input_octets
    }

    pub fn output_octets(&self) -> u64 {
        self.output_octets
    }

    /// Feed a chunk, returning the bytes that can be safely committed now
    /// (i.e. are not part of a still-ambiguous trailing run).
    pub fn update(&mut self, chunk: &[u8]) -> Vec<u8> {
        assert!(!self.finalized, "IMPLERROR: BodyCanon::update after finalize");
        self.input_octets += chunk.len() as u64;
        let mut out = Vec::with_capacity(chunk.len());

        // Reconstruct the stream by re-prepending a held-back CR so the
        // line scanner below sees a uniform byte sequence; the CR is
        // re-deferred at the end if the chunk still ends on one.
        let mut buf: Vec<u8> = Vec::with_capacity(chunk.len() + 1);
        if self.pending_cr {
            buf.push(b'\r');
            self.pending_cr = false;
        }
        buf.extend_from_slice(chunk);

        let mut i = 0;
        while i < buf.len() {
            let b = buf[i];
            if b == b'\r' {
                if i + 1 < buf.len() {
                    if buf[i + 1] == b'\n' {
                        // A confirmed line ending: any WSP held so far was
                        // trailing *this* line and is dropped here, not
                        // deferred alongside the CRLF count — otherwise WSP
                        // arriving on the next line would be conflated with
                        // it and wrongly dropped too (see
                        // `flush_before_ordinary`).
                        self.pending_wsp = false;
                        self.pending_crlfs += 1;
                        i += 2;
                        continue;
                    } else {
                        // Lone CR not at end of chunk: not a line ending,
                        // treat as an ordinary byte.
                        self.flush_before_ordinary(&mut out);
                        out.push(b'\r');
                        self.any_output = true;
                        i += 1;
                        continue;
                    }
                } else {
                    // CR at the very end of the chunk: defer classification.
                    self.pending_cr = true;
                    i += 1;
                    continue;
                }
            }
            if b == b' ' || b == b'\t' {
                match self.algo {
                    Algorithm::Simple => {
                        self.flush_before_ordinary(&mut out);
                        out.push(b);
                        self.any_output = true;
                    }
                    Algorithm::Relaxed => {
                        // Hold a single pending-WSP marker; runs collapse
                        // to one space. Whether it survives depends on what
                        // comes next: a line ending clears it (trailing WSP
                        // dropped, see above); an ordinary byte flushes it
                        // as a single SP — trailing WSP never survives a
                        // line end, but leading/intra-line WSP is kept.
                        self.pending_wsp = true;
                    }
                }
                i += 1;
                continue;
            }
            // Ordinary byte: flush any pending CRLFs/WSP first.
            self.flush_before_ordinary(&mut out);
            out.push(b);
            self.any_output = true;
            i += 1;
        }

        self.output_octets += out.len() as u64;
        out
    }

    /// Emit any held CRLF run as that many literal CRLFs, then (relaxed
    /// only) a single SP if WSP is still pending. By the time this runs,
    /// `pending_wsp` can only hold WSP that occurred *after* the last
    /// confirmed line ending (trailing WSP is cleared the moment a CRLF is
    /// recognized, see `update`), so it always represents intra-line or
    /// leading WSP on the current line and must be kept, collapsed to one
    /// SP — never dropped here.
    fn flush_before_ordinary(&mut self, out: &mut Vec<u8>) {
        for _ in 0..self.pending_crlfs {
            out.push(b'\r');
            out.push(b'\n');
        }
        self.pending_crlfs = 0;
        if self.algo == Algorithm::Relaxed && self.pending_wsp {
            out.push(b' ');
            self.pending_wsp = false;
        }
    }

    /// Flush remaining state and apply the trailing-CRLF policy (RFC 6376
    /// §3.4.3, §3.4.4): an empty body canonicalizes to exactly `\r\n`; a body
    /// already ending in CRLF(s) collapses to a single trailing CRLF; a
    /// body not ending in CRLF gets exactly one appended (relaxed only
    /// does so when the body is non-empty after WSP reduction).
    pub fn finalize(&mut self) -> Vec<u8> {
        assert!(!self.finalized, "IMPLERROR: BodyCanon::finalize called twice");
        self.finalized = true;

        // Any pending lone CR with nothing following is an ordinary
        // trailing byte, not a line ending.
        let mut trailing_cr = Vec::new();
        if self.pending_cr {
            trailing_cr.push(b'\r');
            self.any_output = true;
        }

        let mut out = Vec::new();
        match self.algo {
            Algorithm::Simple => {
                if !self.any_output {
                    out.extend_from_slice(b"\r\n");
                } else {
                    out.extend_from_slice(&trailing_cr);
                    out.extend_from_slice(b"\r\n");
                }
            }
            Algorithm::Relaxed => {
                // Trailing WSP before EOF is dropped, same as before a CRLF.
                self.pending_wsp = false;
                if self.any_output || !trailing_cr.is_empty() {
                    out.extend_from_slice(&trailing_cr);
                    out.extend_from_slice(b"\r\n");
                }
                // An empty relaxed body also gets the CRLF terminator.
                if !self.any_output && trailing_cr.is_empty() {
                    out.extend_from_slice(b"\r\n");
                }
            }
        }
        self.pending_crlfs = 0;
        self.output_octets += out.len() as u64;
        out
    }
}

/// One-shot convenience wrapper for tests and the signer: canonicalize an
/// entire body in a single call.
pub fn canon_body_all(algo: Algorithm, body: &[u8]) -> Vec<u8> {
    let mut bc = BodyCanon::new(algo);
    let mut out = bc.update(body);
    out.extend(bc.finalize());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_header_is_byte_exact() {
        let v = canon_header(Algorithm::Simple, "Subject", " Hello  World \r\n", true);
        assert_eq!(v, "Subject: Hello  World \r\n");
    }

    #[test]
    fn relaxed_header_lowercases_and_collapses() {
        let v = canon_header(Algorithm::Relaxed, "SUBJECT", "  Hello   World  ", true);
        assert_eq!(v, "subject:Hello World");
    }

    #[test]
    fn relaxed_header_strips_colon_wsp() {
        // value already has no leading colon-space per stored-header model;
        // collapse_wsp still trims ends.
        let v = canon_header(Algorithm::Relaxed, "X-Test", "a  b\tc  ", true);
        assert_eq!(v, "x-test:a b c");
    }

    #[test]
    fn empty_body_simple_is_single_crlf() {
        assert_eq!(canon_body_all(Algorithm::Simple, b""), b"\r\n");
    }

    #[test]
    fn trailing_crlf_run_collapses_to_one_simple() {
        let body = b"hello\r\n\r\n\r\n";
        assert_eq!(canon_body_all(Algorithm::Simple, body), b"hello\r\n");
    }

    #[test]
    fn missing_trailing_crlf_gets_appended_simple() {
        let body = b"hello";
        assert_eq!(canon_body_all(Algorithm::Simple, body), b"hello\r\n");
    }

    #[test]
    fn relaxed_strips_trailing_wsp_and_collapses_intraline() {
        let body = b"a  b\t c  \r\nsecond  \r\n\r\n";
        let out = canon_body_all(Algorithm::Relaxed, body);
        assert_eq!(out, b"a b c\r\nsecond\r\n");
    }

    #[test]
    fn relaxed_leading_wsp_on_a_line_is_collapsed_not_dropped() {
        // WSP after a line ending is intra-line WSP on the *new* line, not
        // a continuation of the trailing WSP that was just stripped from
        // the line before it -- it must survive as a single SP.
        let out = canon_body_all(Algorithm::Relaxed, b"x \r\n  y\r\n");
        assert_eq!(out, b"x\r\n y\r\n");
    }

    #[test]
    fn relaxed_wsp_only_blank_line_still_collapses_away() {
        let out = canon_body_all(Algorithm::Relaxed, b"x \r\n \r\ny\r\n");
        assert_eq!(out, b"x\r\n\r\ny\r\n");
    }

    #[test]
    fn relaxed_empty_body_is_single_crlf() {
        assert_eq!(canon_body_all(Algorithm::Relaxed, b""), b"\r\n");
    }

    #[test]
    fn relaxed_all_whitespace_body_canonicalizes_to_empty_plus_crlf() {
        // An all-WSP/CRLF body reduces to nothing but still gets the
        // terminator, matching "ensure CRLF for empty output" policy.
        assert_eq!(canon_body_all(Algorithm::Relaxed, b"   \r\n\r\n"), b"\r\n");
    }

    /// Property: chunking never changes the canonicalized output, for a
    /// representative set of bodies and split points.
    #[test]
    fn chunking_is_invariant_for_body_canon() {
        let bodies: &[&[u8]] = &[
            b"",
            b"hello world\r\n",
            b"line one  \r\nline two\t\r\n\r\n\r\n",
            b"no trailing newline",
            b"trailing cr only\r",
            b"a\r\nb\r \nc\r\n",
        ];
        for algo in [Algorithm::Simple, Algorithm::Relaxed] {
            for body in bodies {
                let whole = canon_body_all(algo, body);
                for split in 0..=body.len() {
                    let (a, b) = body.split_at(split);
                    let mut bc = BodyCanon::new(algo);
                    let mut out = bc.update(a);
                    out.extend(bc.update(b));
                    out.extend(bc.finalize());
                    assert_eq!(
                        out, whole,
                        "split at {split} diverged for {algo:?} on {body:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn wsp_straddling_crlf_boundary_across_chunks_is_dropped() {
        // "a  " | "\r\n" -- trailing WSP must still be recognized as
        // trailing even though the CRLF arrives in the next chunk.
        let mut bc = BodyCanon::new(Algorithm::Relaxed);
        let mut out = bc.update(b"a  ");
        out.extend(bc.update(b"\r\nb\r\n"));
        out.extend(bc.finalize());
        assert_eq!(out, b"a\r\nb\r\n");
    }

    #[test]
    fn lone_cr_straddling_chunk_boundary_resolves_to_crlf() {
        let mut bc = BodyCanon::new(Algorithm::Simple);
        let mut out = bc.update(b"hello\r");
        out.extend(bc.update(b"\nworld\r\n"));
        out.extend(bc.finalize());
        assert_eq!(out, b"hello\r\nworld\r\n");
    }
}
