/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Authentication-Results builder (RFC 8601): accumulates
//! `method=result` clauses with properties and comments into a folded
//! header value, and extracts an incoming header's `authserv-id` so
//! forged copies can be found and removed.

use std::fmt::Write as _;

use crate::error::Score;

/// Soft line-length cap the builder folds against, matching common MTA
/// practice of folding long header lines around 76-80 characters.
const FOLD_WIDTH: usize = 78;

/// One `ptype.property=value` clause appended to a method-spec.
#[derive(Debug, Clone)]
pub struct Property {
    pub ptype: &'static str,
    pub property: &'static str,
    pub value: String,
}

/// A single `method=result` clause plus its optional reason, comment, and
/// properties (RFC 8601 §2.2).
#[derive(Debug, Clone)]
pub struct Clause {
    pub method: &'static str,
    pub result: String,
    pub reason: Option<String>,
    pub comment: Option<String>,
    pub properties: Vec<Property>,
}

impl Clause {
    pub fn new(method: &'static str, result: Score) -> Self {
        Self { method, result: result.to_string(), reason: None, comment: None, properties: Vec::new() }
    }

    /// Like [`Clause::new`], but for mechanisms whose result vocabulary
    /// isn't the common [`Score`] set (`dkim-adsp`'s `unknown`/`discardable`,
    /// `dkim-atps`'s plain `pass`/`fail`/`temperror`).
    pub fn new_raw(method: &'static str, result: impl Into<String>) -> Self {
        Self { method, result: result.into(), reason: None, comment: None, properties: Vec::new() }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_property(mut self, ptype: &'static str, property: &'static str, value: impl Into<String>) -> Self {
        self.properties.push(Property { ptype, property, value: value.into() });
        self
    }

    fn render(&self) -> String {
        let mut out = String::new();
        write!(out, "{}={}", self.method, self.result).unwrap();
        if let Some(reason) = &self.reason {
            write!(out, " reason=\"{}\"", escape_comment(reason)).unwrap();
        }
        if let Some(comment) = &self.comment {
            write!(out, " ({})", escape_comment(comment)).unwrap();
        }
        for p in &self.properties {
            if p.ptype.is_empty() {
                write!(out, " {}={}", p.property, p.value).unwrap();
            } else {
                write!(out, " {}.{}={}", p.ptype, p.property, p.value).unwrap();
            }
        }
        out
    }
}

fn escape_comment(s: &str) -> String {
    s.replace('\\', "\\\\").replace(')', "\\)").replace('(', "\\(")
}

/// Growable buffer tracking a "pre-folding" hint: appending produces
/// whitespace strategically so consumers can fold the header at
/// well-defined points (RFC 8601 §2.3).
pub struct Builder {
    authserv_id: String,
    clauses: Vec<Clause>,
}

impl Builder {
    pub fn new(authserv_id: impl Into<String>) -> Self {
        Self { authserv_id: authserv_id.into(), clauses: Vec::new() }
    }

    pub fn append(&mut self, clause: Clause) {
        self.clauses.push(clause);
    }

    /// Render the complete field body (everything after `Authentication-Results:`),
    /// folding a new line before each method-spec that would push the
    /// current line past [`FOLD_WIDTH`].
    pub fn build(&self) -> String {
        if self.clauses.is_empty() {
            return format!("{}; none", self.authserv_id);
        }

        let mut out = self.authserv_id.clone();
        let mut line_len = out.len();

        for clause in &self.clauses {
            let rendered = clause.render();
            out.push(';');
            line_len += 1;
            // +1 for the separating space that follows.
            if line_len + 1 + rendered.len() > FOLD_WIDTH {
                out.push_str("\r\n\t");
                line_len = 8; // a tab is treated as a small fixed indent.
            } else {
                out.push(' ');
                line_len += 1;
            }
            out.push_str(&rendered);
            line_len += rendered.len();
        }
        out
    }

    /// Field name this builder produces (`Authentication-Results`).
    pub fn field_name() -> &'static str {
        "Authentication-Results"
    }
}

/// Parse a received `Authentication-Results` value well enough to extract
/// its `authserv-id` token — the first non-CFWS token, optionally followed
/// by a version integer — and compare it case-insensitively with
/// `hostname` (RFC 8601 §5's forged-header guidance).
pub fn compare_authserv_id(raw_value: &str, hostname: &str) -> bool {
    match extract_authserv_id(raw_value) {
        Some(id) => id.eq_ignore_ascii_case(hostname),
        None => false,
    }
}

fn extract_authserv_id(raw_value: &str) -> Option<&str> {
    let trimmed = raw_value.trim_start();
    // authserv-id ends at the first ';' or whitespace (a following version
    // integer, if present, is whitespace-separated and ignored here).
    let end = trimmed
        .find(|c: char| c == ';' || c.is_whitespace())
        .unwrap_or(trimmed.len());
    let id = &trimmed[..end];
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_builder_renders_none() {
        let b = Builder::new("mx.example.net");
        assert_eq!(b.build(), "mx.example.net; none");
    }

    #[test]
    fn single_clause_renders_method_equals_result() {
        let mut b = Builder::new("mx.example.net");
        b.append(
            Clause::new("spf", Score::Pass)
                .with_property("smtp", "mailfrom", "alice@example.org"),
        );
        assert_eq!(b.build(), "mx.example.net; spf=pass smtp.mailfrom=alice@example.org");
    }

    #[test]
    fn reason_is_quoted() {
        let mut b = Builder::new("mx.example.net");
        b.append(Clause::new("dkim", Score::Fail).with_reason("body hash did not verify"));
        assert_eq!(b.build(), "mx.example.net; dkim=fail reason=\"body hash did not verify\"");
    }

    #[test]
    fn long_header_folds_before_a_new_method_spec() {
        let mut b = Builder::new("mx.example.net");
        for _ in 0..5 {
            b.append(
                Clause::new("dkim", Score::Pass)
                    .with_property("header", "i", "@really-quite-long-example-domain.example.com"),
            );
        }
        let rendered = b.build();
        assert!(rendered.contains("\r\n\t"), "expected a fold: {rendered:?}");
    }

    #[test]
    fn compare_authserv_id_matches_case_insensitively() {
        assert!(compare_authserv_id("mx.example.net; spf=pass", "MX.Example.NET"));
    }

    #[test]
    fn compare_authserv_id_rejects_mismatch() {
        assert!(!compare_authserv_id("forged.example.com; spf=pass", "mx.example.net"));
    }

    #[test]
    fn compare_authserv_id_handles_leading_version_integer() {
        assert!(compare_authserv_id("mx.example.net 1; spf=pass", "mx.example.net"));
    }
}
