// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Opaque refresh and action tokens.
//!
//! 32 random bytes, base64url without padding. Only the SHA-256 hex digest
//! is persisted.

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Duration, Utc};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::storage::RefreshTokenRecord;

const TOKEN_BYTES: usize = 32;

/// A new refresh token and the record to persist for it.
#[derive(Debug, Clone)]
pub struct NewRefreshToken {
    pub token: String,
    pub record: RefreshTokenRecord,
}

#[derive(Debug, thiserror::Error)]
#[error("system random number generator failed")]
pub struct RandomUnavailable;

pub fn hash_token(token: &str) -> String {
    Sha256::digest(token.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// 32 random bytes, base64url without padding.
pub fn random_token(rng: &SystemRandom) -> Result<String, RandomUnavailable> {
    let mut bytes = [0u8; TOKEN_BYTES];
    rng.fill(&mut bytes).map_err(|_| RandomUnavailable)?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

/// Mint a refresh token. A fresh family is started when `family_id` is `None`.
pub fn mint(
    rng: &SystemRandom,
    principal_id: &str,
    family_id: Option<&str>,
    now: DateTime<Utc>,
    lifetime: Duration,
) -> Result<NewRefreshToken, RandomUnavailable> {
    let token = random_token(rng)?;
    let record = RefreshTokenRecord {
        token_hash: hash_token(&token),
        principal_id: principal_id.to_string(),
        family_id: family_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        issued_at: now,
        expires_at: now + lifetime,
        revoked: false,
        replaced_by: None,
    };
    Ok(NewRefreshToken { token, record })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_token_is_43_chars_and_hash_matches() {
        let rng = SystemRandom::new();
        let now = Utc::now();
        let minted = mint(&rng, "p-1", None, now, Duration::days(1)).unwrap();

        assert_eq!(minted.token.len(), 43);
        assert_eq!(minted.record.token_hash, hash_token(&minted.token));
        assert_eq!(minted.record.expires_at - minted.record.issued_at, Duration::days(1));
        assert_ne!(minted.record.token_hash, minted.token);
    }

    #[test]
    fn family_is_kept_when_given() {
        let rng = SystemRandom::new();
        let minted = mint(&rng, "p-1", Some("family-9"), Utc::now(), Duration::hours(1)).unwrap();
        assert_eq!(minted.record.family_id, "family-9");

        let fresh_a = mint(&rng, "p-1", None, Utc::now(), Duration::hours(1)).unwrap();
        let fresh_b = mint(&rng, "p-1", None, Utc::now(), Duration::hours(1)).unwrap();
        assert_ne!(fresh_a.record.family_id, fresh_b.record.family_id);
        assert_ne!(fresh_a.token, fresh_b.token);
    }

    #[test]
    fn hash_is_lowercase_hex_sha256() {
        assert_eq!(
            hash_token("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
