/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Generic tag-list parser: `name *WSP "=" *WSP value *(*WSP ";" *WSP name "=" value)`.
//!
//! Shared by DKIM-Signature, DKIM public-key TXT records, ADSP, ATPS, and
//! DMARC TXT records — every one of those call sites builds a
//! `TagTable` instead of hand-rolling `split(';')`.

use std::collections::HashMap;

use crate::error::{Result, Status};

/// One parsed `name=value` tag, retaining its ordinal position (1-based)
/// among the tags seen so far, since some records require the first tag
/// to be a specific name (ADSP requires the first tag to be `dkim=`).
#[derive(Debug, Clone)]
pub struct Tag<'a> {
    pub name: &'a str,
    pub value: &'a str,
    pub ordinal: usize,
}

/// Whether token separators must be strict WSP (space/tab only, as ADSP
/// requires) or may be folding whitespace (FWS, as DKIM-Signature permits,
/// since its raw value has already had folding removed by the caller but
/// may still carry embedded CRLF-WSP sequences from the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Separator {
    Wsp,
    Fws,
}

/// Parse `raw` into an ordered map of tag name -> raw tag value (untrimmed
/// of nothing further; callers trim/decode per-tag). Duplicate tag names
/// are a hard parse error (`TAG_DUPLICATED`); unknown tag names are kept
/// in the map so callers can decide whether to ignore them (DKIM
/// extensibility requires unknown tags be skipped silently by the
/// *caller*, not dropped by the parser).
pub fn parse<'a>(raw: &'a str, sep: Separator) -> Result<Vec<Tag<'a>>> {
    let mut tags = Vec::new();
    let mut seen = HashMap::new();
    let mut ordinal = 0usize;

    for part in split_tags(raw, sep) {
        let part = part.trim_matches(|c: char| matches!(c, ' ' | '\t' | '\r' | '\n'));
        if part.is_empty() {
            continue;
        }
        let Some((name, value)) = part.split_once('=') else {
            return Err(Status::Permanent(format!("malformed tag (no '='): {part:?}")));
        };
        let name = name.trim_matches(|c: char| matches!(c, ' ' | '\t' | '\r' | '\n'));
        let value = match sep {
            Separator::Wsp => value.trim_matches(|c: char| c == ' ' || c == '\t'),
            Separator::Fws => value.trim_matches(|c: char| matches!(c, ' ' | '\t' | '\r' | '\n')),
        };
        if name.is_empty() {
            return Err(Status::Permanent("malformed tag: empty name".into()));
        }
        ordinal += 1;
        if seen.insert(name.to_string(), ()).is_some() {
            return Err(Status::Permanent(format!("TAG_DUPLICATED: {name}")));
        }
        tags.push(Tag { name, value, ordinal });
    }

    Ok(tags)
}

/// Split on `;` but not inside folding whitespace peculiarities — at this
/// layer the input is assumed already unfolded (CRLF-WSP removed) by the
/// header-store / relaxed-canonicalization step, so a plain split on `;`
/// is correct for both separator modes. Kept as its own function so a
/// future FWS-sensitive record type has a single seam to change.
fn split_tags(raw: &str, _sep: Separator) -> Vec<&str> {
    raw.split(';').collect()
}

/// A lightweight lookup table over parsed tags, with "required tag
/// present" validation, used after [`parse`].
pub struct TagTable<'a> {
    by_name: HashMap<&'a str, &'a str>,
    pub first_name: Option<&'a str>,
}

impl<'a> TagTable<'a> {
    pub fn build(tags: &[Tag<'a>]) -> Self {
        let mut by_name = HashMap::new();
        for t in tags {
            by_name.insert(t.name, t.value);
        }
        Self { by_name, first_name: tags.first().map(|t| t.name) }
    }

    pub fn get(&self, name: &str) -> Option<&'a str> {
        self.by_name.get(name).copied()
    }

    pub fn require(&self, name: &str) -> Result<&'a str> {
        self.get(name)
            .ok_or_else(|| Status::Permanent(format!("missing required tag {name:?}")))
    }

    /// Verify every tag in `required` is present; used after construction
    /// once the full required-tag set for a record type is known.
    pub fn check_required(&self, required: &[&str]) -> Result<()> {
        for name in required {
            if !self.by_name.contains_key(name) {
                return Err(Status::Permanent(format!("missing required tag {name:?}")));
            }
        }
        Ok(())
    }
}
