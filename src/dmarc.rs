/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! DMARC record discovery and alignment (RFC 7489).

use rand::Rng as _;

use crate::error::{Result, Score, Status};
use crate::psl::Index as PslIndex;
use crate::resolver::Resolver;
use crate::taglist::{self, Separator, TagTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignMode {
    Strict,
    Relaxed,
}

impl AlignMode {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "s" => Some(Self::Strict),
            "r" => Some(Self::Relaxed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    None,
    Quarantine,
    Reject,
}

impl Policy {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "quarantine" => Some(Self::Quarantine),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }

    /// One-step downgrade used by `pct=` sampling (RFC 7489 §6.7).
    pub fn downgrade(self) -> Self {
        match self {
            Policy::Reject => Policy::Quarantine,
            Policy::Quarantine => Policy::None,
            Policy::None => Policy::None,
        }
    }

    /// Combine this session's per-mailbox outcomes by the strictest
    /// applicable policy across multiple From-mailbox domains.
    pub fn strictest(self, other: Self) -> Self {
        use Policy::*;
        match (self, other) {
            (Reject, _) | (_, Reject) => Reject,
            (Quarantine, _) | (_, Quarantine) => Quarantine,
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Record {
    pub align_dkim: AlignMode,
    pub align_spf: AlignMode,
    pub policy: Policy,
    pub subdomain_policy: Policy,
    pub percent: u8,
}

impl Record {
    fn parse(raw: &str) -> Result<Self> {
        let tags = taglist::parse(raw, Separator::Fws)?;
        let table = TagTable::build(&tags);
        if table.first_name != Some("v") || table.get("v") != Some("DMARC1") {
            return Err(Status::Permanent("DMARC record must start with v=DMARC1".into()));
        }
        let policy = Policy::parse(table.require("p")?)
            .ok_or_else(|| Status::Permanent("invalid p= policy".into()))?;
        let subdomain_policy = match table.get("sp") {
            Some(sp) => Policy::parse(sp).ok_or_else(|| Status::Permanent("invalid sp= policy".into()))?,
            None => policy,
        };
        let align_dkim = table.get("adkim").map(AlignMode::parse).unwrap_or(Some(AlignMode::Relaxed))
            .ok_or_else(|| Status::Permanent("invalid adkim=".into()))?;
        let align_spf = table.get("aspf").map(AlignMode::parse).unwrap_or(Some(AlignMode::Relaxed))
            .ok_or_else(|| Status::Permanent("invalid aspf=".into()))?;
        let percent = match table.get("pct") {
            Some(p) => p.parse::<u8>().map_err(|_| Status::Permanent("invalid pct=".into()))?,
            None => 100,
        };
        if percent > 100 {
            return Err(Status::Permanent("pct= out of range".into()));
        }

        Ok(Self { align_dkim, align_spf, policy, subdomain_policy, percent })
    }
}

/// One verified DKIM signature's alignment-relevant fields (SDID + pass).
pub struct AlignedDkim<'a> {
    pub sdid: &'a str,
    pub passed: bool,
}

pub struct Aligner<'a> {
    psl: &'a PslIndex,
}

impl<'a> Aligner<'a> {
    pub fn new(psl: &'a PslIndex) -> Self {
        Self { psl }
    }

    /// Query `_dmarc.<author-domain>`, falling back to
    /// `_dmarc.<organizational-domain>` if the author domain differs from
    /// it and has no record of its own (RFC 7489 §6.6.3).
    pub async fn discover(&self, resolver: &Resolver, author_domain: &str) -> Result<Option<Record>> {
        if let Some(record) = self.query(resolver, author_domain).await? {
            return Ok(Some(record));
        }
        if let Some(org_domain) = self.psl.organizational_domain(author_domain) {
            if org_domain != author_domain.to_ascii_lowercase() {
                return self.query(resolver, &org_domain).await;
            }
        }
        Ok(None)
    }

    async fn query(&self, resolver: &Resolver, domain: &str) -> Result<Option<Record>> {
        let name = format!("_dmarc.{domain}");
        let lookup = resolver.txt_lookup(name.clone()).await;
        let lookup = match lookup {
            Ok(l) => l,
            Err(e) => {
                use hickory_resolver::error::ResolveErrorKind;
                return match e.kind() {
                    ResolveErrorKind::NoRecordsFound { .. } => Ok(None),
                    _ => Err(Status::Temporary(format!("DMARC lookup failed for {name}: {e}"))),
                };
            }
        };

        let candidates: Vec<String> = lookup
            .iter()
            .map(|txt| txt.txt_data().iter().flat_map(|d| String::from_utf8_lossy(d).into_owned().chars().collect::<Vec<_>>()).collect())
            .filter(|s: &String| s.trim_start().starts_with("v=DMARC1"))
            .collect();

        match candidates.len() {
            0 => Ok(None),
            _ => Record::parse(&candidates[0]).map(Some),
        }
    }

    /// `Check`: run the strict pass, then (if the record allows relaxed
    /// alignment) the relaxed pass, against the given author domain
    /// (RFC 7489 §3.1).
    pub fn check(&self, record: &Record, author_domain: &str, dkim: &[AlignedDkim], spf_domain: Option<&str>) -> Score {
        let author_domain = author_domain.to_ascii_lowercase();

        let strict_aligned = dkim.iter().any(|d| d.passed && d.sdid.eq_ignore_ascii_case(&author_domain))
            || spf_domain.map(|d| d.eq_ignore_ascii_case(&author_domain)).unwrap_or(false);
        if strict_aligned {
            return Score::Pass;
        }

        let author_org = self.psl.organizational_domain(&author_domain);
        let relaxed_aligned = (record.align_dkim == AlignMode::Relaxed
            && dkim.iter().any(|d| d.passed && self.orgs_match(d.sdid, author_org.as_deref())))
            || (record.align_spf == AlignMode::Relaxed
                && spf_domain.map(|d| self.orgs_match(d, author_org.as_deref())).unwrap_or(false));

        if relaxed_aligned {
            Score::Pass
        } else {
            Score::Fail
        }
    }

    fn orgs_match(&self, domain: &str, author_org: Option<&str>) -> bool {
        match (self.psl.organizational_domain(domain), author_org) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            _ => false,
        }
    }

    /// `ReceiverPolicy`: the record's policy — or its `sp=` subdomain
    /// policy when `author_domain` is a subdomain of the organizational
    /// domain that published this record, per RFC 7489 §6.3 — downgraded
    /// by one step if `pct=` sampling excludes this message.
    pub fn receiver_policy(&self, record: &Record, author_domain: &str, failed: bool, apply_sampling: bool) -> Policy {
        if !failed {
            return Policy::None;
        }
        let base_policy = match self.psl.organizational_domain(author_domain) {
            Some(org) if !org.eq_ignore_ascii_case(author_domain) => record.subdomain_policy,
            _ => record.policy,
        };
        if apply_sampling && record.percent < 100 {
            let roll: u8 = rand::rng().random_range(0..100);
            if roll >= record.percent {
                return base_policy.downgrade();
            }
        }
        base_policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn psl() -> PslIndex {
        PslIndex::parse("com\n").unwrap()
    }

    #[test]
    fn parses_minimal_record_with_defaults() {
        let r = Record::parse("v=DMARC1; p=reject").unwrap();
        assert_eq!(r.policy, Policy::Reject);
        assert_eq!(r.subdomain_policy, Policy::Reject);
        assert_eq!(r.align_dkim, AlignMode::Relaxed);
        assert_eq!(r.percent, 100);
    }

    #[test]
    fn rejects_record_without_v_dmarc1_first() {
        assert!(Record::parse("p=reject; v=DMARC1").unwrap_err().is_perm_fail());
    }

    #[test]
    fn subdomain_policy_defaults_to_policy_when_absent() {
        let r = Record::parse("v=DMARC1; p=quarantine; sp=none").unwrap();
        assert_eq!(r.subdomain_policy, Policy::None);
    }

    #[test]
    fn strict_pass_requires_exact_domain_match() {
        let idx = psl();
        let aligner = Aligner::new(&idx);
        let record = Record::parse("v=DMARC1; p=reject; adkim=s; aspf=s").unwrap();
        let dkim = vec![AlignedDkim { sdid: "example.com", passed: true }];
        assert_eq!(aligner.check(&record, "example.com", &dkim, None), Score::Pass);
        assert_eq!(aligner.check(&record, "sub.example.com", &dkim, None), Score::Fail);
    }

    #[test]
    fn relaxed_pass_allows_organizational_domain_match() {
        let idx = psl();
        let aligner = Aligner::new(&idx);
        let record = Record::parse("v=DMARC1; p=reject; adkim=r").unwrap();
        let dkim = vec![AlignedDkim { sdid: "mail.example.com", passed: true }];
        assert_eq!(aligner.check(&record, "example.com", &dkim, None), Score::Pass);
    }

    #[test]
    fn spf_alignment_also_satisfies_check() {
        let idx = psl();
        let aligner = Aligner::new(&idx);
        let record = Record::parse("v=DMARC1; p=reject; aspf=s").unwrap();
        assert_eq!(aligner.check(&record, "example.com", &[], Some("example.com")), Score::Pass);
    }

    #[test]
    fn policy_downgrade_steps_down_one_level() {
        assert_eq!(Policy::Reject.downgrade(), Policy::Quarantine);
        assert_eq!(Policy::Quarantine.downgrade(), Policy::None);
        assert_eq!(Policy::None.downgrade(), Policy::None);
    }

    #[test]
    fn strictest_combines_multi_from_outcomes() {
        assert_eq!(Policy::Reject.strictest(Policy::None), Policy::Reject);
        assert_eq!(Policy::Quarantine.strictest(Policy::None), Policy::Quarantine);
        assert_eq!(Policy::None.strictest(Policy::None), Policy::None);
    }

    #[test]
    fn receiver_policy_without_sampling_applies_full_pct_unconditionally() {
        let idx = psl();
        let aligner = Aligner::new(&idx);
        let record = Record::parse("v=DMARC1; p=reject").unwrap();
        assert_eq!(aligner.receiver_policy(&record, "example.com", true, false), Policy::Reject);
        assert_eq!(aligner.receiver_policy(&record, "example.com", false, true), Policy::None);
    }

    #[test]
    fn receiver_policy_uses_subdomain_policy_for_a_subdomain_author() {
        let idx = psl();
        let aligner = Aligner::new(&idx);
        let record = Record::parse("v=DMARC1; p=reject; sp=none").unwrap();
        assert_eq!(aligner.receiver_policy(&record, "example.com", true, false), Policy::Reject);
        assert_eq!(aligner.receiver_policy(&record, "sub.example.com", true, false), Policy::None);
    }
}
