/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Hash-and-verify engine: canonicalized header/body bytes in, a verdict
//! against a declared `bh=`/`b=` out. Dispatches to RSA or Ed25519 per the
//! signature's algorithm tag (RFC 6376 §3.3, RFC 8463).

use ed25519_dalek::{Signature as EdSignature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rsa::{pkcs1v15::Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest as _, Sha256};

use crate::canon::{Algorithm as CanonAlgorithm, BodyCanon};
use crate::error::{Result, Status};

/// Global crypto-library init hook.
///
/// `rsa`/`sha1`/`sha2`/`ed25519-dalek` need no explicit library-wide
/// initialization, unlike an OpenSSL-backed implementation would. Kept as
/// a documented no-op call site so `main.rs` has somewhere to call at
/// startup, and so a future backend needing real init doesn't have to
/// invent the call site too.
pub fn init() {}

/// Hash algorithm named by the `a=` tag (`rsa-sha1`, `rsa-sha256`,
/// `ed25519-sha256`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgo {
    Sha1,
    Sha256,
}

impl HashAlgo {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" => Some(Self::Sha1),
            "sha256" => Some(Self::Sha256),
            _ => None,
        }
    }
}

/// Public-key algorithm named by the `a=`/`k=` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgo {
    Rsa,
    Ed25519,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureAlgorithm {
    pub key: KeyAlgo,
    pub hash: HashAlgo,
}

impl SignatureAlgorithm {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rsa-sha1" => Some(Self { key: KeyAlgo::Rsa, hash: HashAlgo::Sha1 }),
            "rsa-sha256" => Some(Self { key: KeyAlgo::Rsa, hash: HashAlgo::Sha256 }),
            "ed25519-sha256" => Some(Self { key: KeyAlgo::Ed25519, hash: HashAlgo::Sha256 }),
            _ => None,
        }
    }
}

/// Either a SHA-1 or SHA-256 running context, picked at construction time.
enum HashCtx {
    Sha1(sha1::Sha1),
    Sha256(Sha256),
}

impl HashCtx {
    fn new(algo: HashAlgo) -> Self {
        match algo {
            HashAlgo::Sha1 => HashCtx::Sha1(Sha1::new()),
            HashAlgo::Sha256 => HashCtx::Sha256(Sha256::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            HashCtx::Sha1(h) => sha2::Digest::update(h, data),
            HashCtx::Sha256(h) => h.update(data),
        }
    }

    fn finalize(self) -> Vec<u8> {
        match self {
            HashCtx::Sha1(h) => sha2::Digest::finalize(h).to_vec(),
            HashCtx::Sha256(h) => h.finalize().to_vec(),
        }
    }
}

/// Result of verifying one signature's digest and cryptographic signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    DigestMatch,
    BodyHashMismatch,
    SignatureMismatch,
}

/// A public key as recovered from DNS, already typed to match the
/// signature's declared key algorithm.
pub enum PublicKey {
    Rsa(RsaPublicKey),
    Ed25519(VerifyingKey),
}

/// A private key, used only by the signing path kept for test fixtures.
pub enum PrivateKey {
    Rsa(RsaPrivateKey),
    Ed25519(SigningKey),
}

/// Streaming digester: owns independent header/body hash contexts, the
/// body canonicalizer, and the `l=` truncation boundary.
pub struct Digester {
    hash_algo: HashAlgo,
    body_canon: BodyCanon,
    body_hash: HashCtx,
    header_hash: HashCtx,
    body_limit: Option<u64>,
    body_hashed_octets: u64,
}

impl Digester {
    pub fn new(
        hash_algo: HashAlgo,
        header_canon: CanonAlgorithm,
        body_canon: CanonAlgorithm,
        body_limit: Option<u64>,
    ) -> Self {
        let _ = header_canon; // header canonicalization is applied by the caller per-header
        Self {
            hash_algo,
            body_canon: BodyCanon::new(body_canon),
            body_hash: HashCtx::new(hash_algo),
            header_hash: HashCtx::new(hash_algo),
            body_limit,
            body_hashed_octets: 0,
        }
    }

    /// Feed a raw body chunk. Canonicalizes first, then truncates to
    /// exactly `body_limit` canonicalized octets if one is configured;
    /// any appended trailing CRLF that would exceed the limit is dropped
    /// at `finalize_body`, not here.
    pub fn update_body(&mut self, chunk: &[u8]) -> Result<()> {
        let canon = self.body_canon.update(chunk);
        self.feed_body_canon(&canon)
    }

    fn feed_body_canon(&mut self, canon: &[u8]) -> Result<()> {
        let take = match self.body_limit {
            Some(limit) if self.body_hashed_octets >= limit => 0,
            Some(limit) => {
                let remaining = limit - self.body_hashed_octets;
                (canon.len() as u64).min(remaining) as usize
            }
            None => canon.len(),
        };
        if take > canon.len() {
            return Err(Status::System("IMPLERROR: canonicalizer overrun past declared limit".into()));
        }
        self.body_hash.update(&canon[..take]);
        self.body_hashed_octets += take as u64;
        Ok(())
    }

    /// Flush the canonicalizer and return the final body hash bytes.
    pub fn finalize_body_hash(mut self) -> Vec<u8> {
        let tail = self.body_canon.finalize();
        let _ = self.feed_body_canon(&tail);
        self.body_hash.finalize()
    }

    /// Feed one already-canonicalized header line (with trailing CRLF, per
    /// the chosen header algorithm) into the header hash.
    pub fn feed_header(&mut self, canonical_line: &str) {
        self.header_hash.update(canonical_line.as_bytes());
    }

    /// Feed the DKIM-Signature header itself with `b=` elided and no
    /// trailing CRLF (RFC 6376 §3.7, the DKIM-Signature hash input step).
    pub fn feed_signature_header(&mut self, canonical_line_no_crlf: &str) {
        self.header_hash.update(canonical_line_no_crlf.as_bytes());
    }

    pub fn into_header_hash(self) -> Vec<u8> {
        self.header_hash.finalize()
    }

    pub fn hash_algo(&self) -> HashAlgo {
        self.hash_algo
    }
}

/// Verify `header_hash` against `signature` using `public_key`. Returns
/// `SignatureMismatch` on a cryptographically-sound "no", and `Status::System`
/// on a library/format error.
pub fn verify_signature(
    hash_algo: HashAlgo,
    header_hash: &[u8],
    signature: &[u8],
    public_key: &PublicKey,
) -> Result<bool> {
    match public_key {
        PublicKey::Rsa(pk) => {
            // RSASSA-PKCS1-v1.5 over the *already-computed* header hash: the
            // `b=` signature is produced by padding+exponentiating the hash
            // directly, not by hashing it a second time. `Pkcs1v15Sign`
            // operates on a prehashed digest for exactly this reason.
            let ok = match hash_algo {
                HashAlgo::Sha1 => pk.verify(Pkcs1v15Sign::new::<Sha1>(), header_hash, signature).is_ok(),
                HashAlgo::Sha256 => pk.verify(Pkcs1v15Sign::new::<Sha256>(), header_hash, signature).is_ok(),
            };
            Ok(ok)
        }
        PublicKey::Ed25519(pk) => {
            if signature.len() != 64 {
                return Err(Status::Permanent(format!(
                    "ed25519 signature must be 64 bytes, got {}",
                    signature.len()
                )));
            }
            let mut raw = [0u8; 64];
            raw.copy_from_slice(signature);
            let sig = EdSignature::from_bytes(&raw);
            Ok(pk.verify(header_hash, &sig).is_ok())
        }
    }
}

/// Sign `header_hash` with `private_key` (symmetric to [`verify_signature`],
/// kept for the sign/verify-inverse test property).
pub fn sign_digest(hash_algo: HashAlgo, header_hash: &[u8], private_key: &PrivateKey) -> Result<Vec<u8>> {
    match private_key {
        PrivateKey::Rsa(sk) => {
            // Plain (unblinded) PKCS1v15 signing: deterministic, so no RNG
            // is needed here, which keeps this test fixture clear of the
            // `rand`/`rsa`-internal `rand_core` version pinning.
            let sig = match hash_algo {
                HashAlgo::Sha1 => sk.sign(Pkcs1v15Sign::new::<Sha1>(), header_hash),
                HashAlgo::Sha256 => sk.sign(Pkcs1v15Sign::new::<Sha256>(), header_hash),
            }
            .map_err(|e| Status::System(format!("rsa sign failed: {e}")))?;
            Ok(sig)
        }
        PrivateKey::Ed25519(sk) => Ok(sk.sign(header_hash).to_bytes().to_vec()),
    }
}
