/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Authorized Third-Party Signatures lookup (draft-kucherawy-dkim-atps,
//! historical). No crate in this workspace's stack covers
//! RFC 4648 base32, and the alphabet/padding choice is pinned by the
//! ATPS draft, so it is implemented directly here rather than pulled in
//! as a one-call dependency.

use std::fmt;

use sha2::{Digest as _, Sha256};
use sha1::Sha1;

use crate::digest::HashAlgo;
use crate::error::{Result, Status};
use crate::resolver::Resolver;

const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// RFC 4648 base32 without padding (the ATPS draft specifies the selector
/// is formed without `=` padding characters).
fn base32_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() * 8 + 4) / 5);
    let mut buf: u32 = 0;
    let mut bits = 0u32;
    for &byte in data {
        buf = (buf << 8) | byte as u32;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((buf >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((buf << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

/// `base32(hash(sdid))._atps.<author-domain>` per the ATPS draft.
fn atps_query_name(sdid: &str, author_domain: &str, hash_algo: HashAlgo) -> String {
    let digest = match hash_algo {
        HashAlgo::Sha1 => {
            let mut h = Sha1::new();
            sha2::Digest::update(&mut h, sdid.as_bytes());
            sha2::Digest::finalize(h).to_vec()
        }
        HashAlgo::Sha256 => {
            let mut h = Sha256::new();
            h.update(sdid.as_bytes());
            h.finalize().to_vec()
        }
    };
    format!("{}._atps.{}", base32_encode(&digest), author_domain)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtpsScore {
    Pass,
    Fail,
    TempError,
}

impl fmt::Display for AtpsScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AtpsScore::Pass => "pass",
            AtpsScore::Fail => "fail",
            AtpsScore::TempError => "temperror",
        })
    }
}

/// Check whether `author_domain` has delegated signing authority to `sdid`
/// via ATPS: a TXT record containing `v=ATPS1` at the
/// computed query name is the delegation.
pub async fn check_delegation(
    resolver: &Resolver,
    sdid: &str,
    author_domain: &str,
    hash_algo: HashAlgo,
) -> Result<AtpsScore> {
    let name = atps_query_name(sdid, author_domain, hash_algo);
    let lookup = resolver.txt_lookup(name.clone()).await.map_err(|e| {
        use hickory_resolver::error::ResolveErrorKind;
        match e.kind() {
            ResolveErrorKind::NoRecordsFound { .. } => Status::Ok,
            _ => Status::Temporary(format!("ATPS lookup failed for {name}: {e}")),
        }
    });

    let lookup = match lookup {
        Ok(l) => l,
        Err(Status::Ok) => return Ok(AtpsScore::Fail),
        Err(e) => return Err(e),
    };

    let delegated = lookup.iter().any(|txt| {
        let joined: String = txt.txt_data().iter().flat_map(|d| String::from_utf8_lossy(d).into_owned().chars().collect::<Vec<_>>()).collect();
        joined.trim() == "v=ATPS1"
    });

    Ok(if delegated { AtpsScore::Pass } else { AtpsScore::Fail })
}
