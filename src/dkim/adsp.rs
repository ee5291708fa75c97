/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Author Domain Signing Practices lookup (RFC 5617, historical —
//! superseded by DMARC but still queried by this crate's policy layer as a
//! legacy fallback).

use std::fmt;

use crate::error::{Result, Status};
use crate::resolver::Resolver;
use crate::taglist::{self, Separator, TagTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdspPractice {
    Unknown,
    All,
    Discardable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdspScore {
    Pass,
    Unknown,
    Fail,
    Discard,
    NxDomain,
    TempError,
    PermError,
}

impl fmt::Display for AdspScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AdspScore::Pass => "pass",
            AdspScore::Unknown => "unknown",
            AdspScore::Fail => "fail",
            AdspScore::Discard => "discard",
            AdspScore::NxDomain => "nxdomain",
            AdspScore::TempError => "temperror",
            AdspScore::PermError => "permerror",
        })
    }
}

/// Query `_adsp._domainkey.<author_domain>` and parse the ADSP record. The
/// first tag must be `dkim=` (RFC 5617 §4.2.1).
pub async fn fetch_practice(resolver: &Resolver, author_domain: &str) -> Result<AdspPractice> {
    let name = format!("_adsp._domainkey.{author_domain}");
    let lookup = resolver.txt_lookup(name.clone()).await.map_err(|e| {
        use hickory_resolver::error::ResolveErrorKind;
        match e.kind() {
            ResolveErrorKind::NoRecordsFound { .. } => Status::Info("no ADSP record".into()),
            _ => Status::Temporary(format!("ADSP lookup failed for {name}: {e}")),
        }
    })?;

    let raw: String = lookup
        .iter()
        .next()
        .map(|txt| txt.txt_data().iter().flat_map(|d| String::from_utf8_lossy(d).into_owned().chars().collect::<Vec<_>>()).collect())
        .ok_or_else(|| Status::Info("no ADSP record".into()))?;

    let tags = taglist::parse(&raw, Separator::Wsp)?;
    let table = TagTable::build(&tags);
    if table.first_name != Some("dkim") {
        return Err(Status::Permanent("ADSP record's first tag is not dkim=".into()));
    }
    match table.require("dkim")? {
        "unknown" => Ok(AdspPractice::Unknown),
        "all" => Ok(AdspPractice::All),
        "discardable" => Ok(AdspPractice::Discardable),
        other => Err(Status::Permanent(format!("unrecognized ADSP practice {other:?}"))),
    }
}

/// Map (author domain MX existence, ADSP practice, whether any PASS
/// signature aligns with the author domain) to the ADSP score (RFC 5617
/// §4.3).
pub fn score(mx_exists: bool, practice: Option<AdspPractice>, any_aligned_pass: bool) -> AdspScore {
    if !mx_exists {
        return AdspScore::NxDomain;
    }
    if any_aligned_pass {
        return AdspScore::Pass;
    }
    match practice {
        None | Some(AdspPractice::Unknown) => AdspScore::Unknown,
        Some(AdspPractice::All) => AdspScore::Fail,
        Some(AdspPractice::Discardable) => AdspScore::Discard,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_prefers_aligned_pass_over_practice() {
        assert_eq!(score(true, Some(AdspPractice::All), true), AdspScore::Pass);
    }

    #[test]
    fn score_maps_all_practice_to_fail_without_alignment() {
        assert_eq!(score(true, Some(AdspPractice::All), false), AdspScore::Fail);
    }

    #[test]
    fn score_maps_discardable_practice_to_discard() {
        assert_eq!(score(true, Some(AdspPractice::Discardable), false), AdspScore::Discard);
    }

    #[test]
    fn score_maps_missing_record_to_unknown() {
        assert_eq!(score(true, None, false), AdspScore::Unknown);
    }

    #[test]
    fn score_reports_nxdomain_when_author_domain_does_not_resolve() {
        assert_eq!(score(false, Some(AdspPractice::All), false), AdspScore::NxDomain);
    }

    #[test]
    fn adsp_record_must_start_with_dkim_tag() {
        let tags = taglist::parse("t=y; dkim=all", Separator::Wsp).unwrap();
        let table = TagTable::build(&tags);
        assert_ne!(table.first_name, Some("dkim"));
    }

    #[test]
    fn display_renders_rfc5617_tokens() {
        assert_eq!(AdspScore::Discard.to_string(), "discard");
        assert_eq!(AdspScore::NxDomain.to_string(), "nxdomain");
    }
}
