/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Status taxonomy shared by every component.
//!
//! The source this crate is descended from uses a single large status enum
//! partitioned by category (OK / INFO / SYSERR / TMPERR / PERMFAIL / POLICY /
//! CFGERR / WARN) so call sites can branch on the category rather than the
//! exact variant. `Status` preserves that partitioning; `is_critical` and
//! `is_perm_fail` are the group predicates call sites use instead of
//! matching every arm.

use std::fmt;

/// A categorized outcome. Every fallible operation in this crate resolves to
/// one of these categories.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Status {
    /// Digest matched / record legitimately absent.
    #[error("ok")]
    Ok,
    /// Informational, not a failure (e.g. "no DKIM signatures present").
    #[error("{0}")]
    Info(String),
    /// Memory, library, socket, or lock-timeout failure. Session reply: TEMPFAIL.
    #[error("system error: {0}")]
    System(String),
    /// DNS SERVFAIL/REFUSED/resolver exhaustion. Session reply: TEMPFAIL or a
    /// mechanism-scoped `temperror`.
    #[error("temporary error: {0}")]
    Temporary(String),
    /// Protocol-level violation: bad syntax, unsupported algorithm, hash
    /// mismatch, domain mismatch, expired signature. Scored `permerror`/`fail`.
    #[error("permanent error: {0}")]
    Permanent(String),
    /// Policy-level condition: too many signatures, forged-header removal.
    #[error("policy: {0}")]
    Policy(String),
    /// Missing PSL file, undecodable config. Detected at startup or RELOAD.
    #[error("configuration error: {0}")]
    Config(String),
    /// Non-fatal but noteworthy (duplicate PSL entry, discarded malformed TXT).
    #[error("warning: {0}")]
    Warn(String),
}

impl Status {
    /// A session-scope failure serious enough that the whole message gets
    /// TEMPFAIL regardless of what any one mechanism scored.
    pub fn is_critical(&self) -> bool {
        matches!(self, Status::System(_))
    }

    pub fn is_temp_error(&self) -> bool {
        matches!(self, Status::Temporary(_))
    }

    pub fn is_perm_fail(&self) -> bool {
        matches!(self, Status::Permanent(_))
    }

    pub fn is_policy(&self) -> bool {
        matches!(self, Status::Policy(_))
    }

    /// Map a category to the RFC 8601 result token it produces when the
    /// failure is scoped to one mechanism rather than the whole session —
    /// `Temporary`/`Permanent`/`Policy` become a scored clause instead of
    /// aborting `eom()`. `None` for the categories that must still escalate
    /// (`System`, `Config`, and the non-error `Ok`/`Info`/`Warn` variants,
    /// which a mechanism should never actually return as an `Err`).
    pub fn to_mechanism_score(&self) -> Option<Score> {
        match self {
            Status::Temporary(_) => Some(Score::TempError),
            Status::Permanent(_) => Some(Score::PermError),
            Status::Policy(_) => Some(Score::Policy),
            _ => None,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Status>;

/// The coarse result of one authentication mechanism, independent of its
/// category error. This is what ends up as the `result` token in an
/// Authentication-Results clause (RFC 8601 §2.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Score {
    Pass,
    Fail,
    None,
    Neutral,
    Policy,
    TempError,
    PermError,
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Score::Pass => "pass",
            Score::Fail => "fail",
            Score::None => "none",
            Score::Neutral => "neutral",
            Score::Policy => "policy",
            Score::TempError => "temperror",
            Score::PermError => "permerror",
        })
    }
}
