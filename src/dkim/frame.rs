/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! DKIM-Signature header parsing and per-frame sanity checks (RFC 6376
//! §3.5, §3.6). A "frame" is one DKIM-Signature occurrence, reduced to its
//! typed tags plus the decoded `bh=`/`b=` bytes.

use base64::Engine as _;

use crate::canon::Canonicalization;
use crate::digest::SignatureAlgorithm;
use crate::error::{Result, Status};
use crate::taglist::{self, Separator, TagTable};

#[derive(Debug, Clone)]
pub struct SignatureFrame {
    /// The exact header value this frame was parsed from, kept so the
    /// digest step can re-canonicalize *this* signature's own header (with
    /// `b=` elided) rather than risk picking up a different DKIM-Signature
    /// occurrence when a message carries more than one.
    pub raw_value: String,
    pub algorithm: SignatureAlgorithm,
    pub canon: Canonicalization,
    /// `d=`, lowercased.
    pub sdid: String,
    /// `s=`, verbatim (selectors are case-sensitive per RFC 6376 §3.1).
    pub selector: String,
    /// `h=`, lowercased, in the order listed (left-to-right signing order).
    pub signed_headers: Vec<String>,
    pub body_hash: Vec<u8>,
    pub signature: Vec<u8>,
    /// `i=`, the Agent/User Identifier, if present.
    pub auid: Option<String>,
    /// `l=`, the canonicalized-body byte limit, if present.
    pub body_limit: Option<u64>,
    /// `t=`, signature timestamp.
    pub timestamp: Option<i64>,
    /// `x=`, expiration.
    pub expiration: Option<i64>,
    /// `q=`, defaults to `dns/txt` when absent.
    pub query_methods: String,
}

impl SignatureFrame {
    /// Parse one DKIM-Signature header value (already unfolded) into a
    /// frame. Failures here are always PERMFAIL: a malformed signature
    /// never produces a temporary-error frame.
    pub fn parse(raw_value: &str) -> Result<Self> {
        let tags = taglist::parse(raw_value, Separator::Fws)?;
        let table = TagTable::build(&tags);
        table.check_required(&["v", "a", "b", "bh", "d", "h", "s"])?;

        let version = table.require("v")?;
        if version != "1" {
            return Err(Status::Permanent(format!("unsupported DKIM-Signature version {version:?}")));
        }

        let algorithm = SignatureAlgorithm::parse(table.require("a")?)
            .ok_or_else(|| Status::Permanent(format!("unsupported signature algorithm {:?}", table.require("a")?)))?;

        let canon = match table.get("c") {
            Some(c) => Canonicalization::parse(c)
                .ok_or_else(|| Status::Permanent(format!("unsupported canonicalization {c:?}")))?,
            None => Canonicalization::simple_simple(),
        };

        let sdid = table.require("d")?.trim().to_ascii_lowercase();
        if sdid.is_empty() {
            return Err(Status::Permanent("empty d= domain".into()));
        }
        let selector = table.require("s")?.trim().to_string();

        let signed_headers: Vec<String> = table
            .require("h")?
            .split(':')
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        if !signed_headers.iter().any(|h| h == "from") {
            return Err(Status::Permanent("h= does not include From".into()));
        }

        let body_hash = decode_base64(table.require("bh")?, "bh")?;
        let signature = decode_base64(table.require("b")?, "b")?;

        let auid = match table.get("i") {
            Some(i) => Some(decode_auid(i)?),
            None => None,
        };
        if let Some(ref auid) = auid {
            let auid_domain = auid.rsplit_once('@').map(|(_, d)| d.to_ascii_lowercase());
            if let Some(auid_domain) = auid_domain {
                if auid_domain != sdid && !auid_domain.ends_with(&format!(".{sdid}")) {
                    return Err(Status::Permanent(format!(
                        "DOMAIN_MISMATCH: i= domain {auid_domain:?} is not d= {sdid:?} or a subdomain of it"
                    )));
                }
            }
        }

        let body_limit = match table.get("l") {
            Some(l) => Some(l.parse::<u64>().map_err(|_| Status::Permanent(format!("malformed l= {l:?}")))?),
            None => None,
        };
        let timestamp = match table.get("t") {
            Some(t) => Some(t.parse::<i64>().map_err(|_| Status::Permanent(format!("malformed t= {t:?}")))?),
            None => None,
        };
        let expiration = match table.get("x") {
            Some(x) => Some(x.parse::<i64>().map_err(|_| Status::Permanent(format!("malformed x= {x:?}")))?),
            None => None,
        };
        let query_methods = table.get("q").unwrap_or("dns/txt").to_string();

        Ok(Self {
            raw_value: raw_value.to_string(),
            algorithm,
            canon,
            sdid,
            selector,
            signed_headers,
            body_hash,
            signature,
            auid,
            body_limit,
            timestamp,
            expiration,
            query_methods,
        })
    }

    /// Sanity checks that do not require DNS (RFC 6376 §3.5).
    /// `now`, `skew_tolerance` are Unix seconds.
    pub fn sanity_check(
        &self,
        now: i64,
        skew_tolerance: i64,
        accept_expired: bool,
        accept_future: bool,
    ) -> Result<()> {
        if let Some(x) = self.expiration {
            if !accept_expired && now > x + skew_tolerance {
                return Err(Status::Permanent("SIGNATURE_EXPIRED".into()));
            }
        }
        if let Some(t) = self.timestamp {
            if !accept_future && t > now + skew_tolerance {
                return Err(Status::Permanent("SIGNATURE_TIMESTAMP_IN_FUTURE".into()));
            }
        }
        if let (Some(t), Some(x)) = (self.timestamp, self.expiration) {
            if x < t {
                return Err(Status::Permanent("malformed signature: x= precedes t=".into()));
            }
        }
        Ok(())
    }
}

/// Splice the `b=` tag's value out of a raw DKIM-Signature header value,
/// leaving everything else byte-for-byte unchanged, per RFC 6376 §3.5 /
/// §3.7 ("the value of the 'b=' tag... is treated as though it were an
/// empty string"). Distinguishes `b=` from `bh=` by requiring the tag name
/// to be exactly one byte.
pub fn elide_b_tag(raw: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut start = 0usize;
    let mut found = false;

    loop {
        let seg_end = match raw[start..].find(';') {
            Some(i) => start + i,
            None => raw.len(),
        };
        let segment = &raw[start..seg_end];
        let lead_ws = segment.len() - segment.trim_start().len();
        let body = &segment[lead_ws..];

        if !found && body.starts_with('b') {
            let after_name = &body[1..];
            let ws_after_name = after_name.len() - after_name.trim_start().len();
            if ws_after_name < after_name.len() && after_name.as_bytes()[ws_after_name] == b'=' {
                let eq_pos = lead_ws + 1 + ws_after_name;
                out.push_str(&segment[..=eq_pos]);
                found = true;
                if seg_end == raw.len() {
                    break;
                }
                out.push(';');
                start = seg_end + 1;
                continue;
            }
        }
        out.push_str(segment);
        if seg_end == raw.len() {
            break;
        }
        out.push(';');
        start = seg_end + 1;
    }

    if !found {
        return Err(Status::Permanent("could not locate b= tag for elision".into()));
    }
    Ok(out)
}

fn decode_base64(s: &str, tag: &str) -> Result<Vec<u8>> {
    let cleaned: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(cleaned.as_bytes())
        .map_err(|e| Status::Permanent(format!("malformed base64 in {tag}=: {e}")))
}

/// `i=` is a `dkim-quoted-printable` local-part (optional) plus `@domain`.
/// Quoted-printable decoding of the local-part is cosmetic for alignment
/// purposes (only the domain half matters to this crate), so only `=XX`
/// escapes are unescaped; everything else passes through.
fn decode_auid(raw: &str) -> Result<String> {
    if !raw.contains('@') {
        return Err(Status::Permanent("malformed i= (no '@')".into()));
    }
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '=' {
            let hi = chars.next();
            let lo = chars.next();
            match (hi, lo) {
                (Some(hi), Some(lo)) => {
                    let byte = u8::from_str_radix(&format!("{hi}{lo}"), 16)
                        .map_err(|_| Status::Permanent("malformed i= quoted-printable escape".into()))?;
                    out.push(byte as char);
                }
                _ => return Err(Status::Permanent("truncated i= quoted-printable escape".into())),
            }
        } else {
            out.push(c);
        }
    }
    Ok(out)
}
