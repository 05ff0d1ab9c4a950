// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Offline access token verification.
//!
//! No network or store access: a token is accepted iff its signature
//! verifies against one of the configured public keys (newest first) and
//! `now < exp`.
//!
//! ## Check order
//!
//! 1. Exactly three non-empty segments, else `Malformed`.
//! 2. Signature over `header.payload`, else `InvalidSignature`.
//! 3. Header and payload parse, algorithm and issuer match, else `Malformed`.
//! 4. `now >= exp` is `Expired`; `iat` too far in the future is `NotYetValid`.
//!
//! The signature is checked before anything is decoded, so tampering with
//! any byte of a well-formed token surfaces as `InvalidSignature`.

use std::sync::Arc;

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Utc};
use jsonwebtoken::{crypto, decode_header};

use super::claims::{Claims, VerifiedToken, WireClaims, ACCESS_TOKEN_TYPE};
use super::error::TokenError;
use super::keys::{KeyMaterial, VerifyingKey};

/// Clock skew tolerated on `iat` (seconds). `exp` is never extended.
const CLOCK_SKEW_LEEWAY: i64 = 60;

#[derive(Clone)]
pub struct TokenVerifier {
    keys: Arc<KeyMaterial>,
    issuer: String,
}

impl TokenVerifier {
    pub fn new(keys: Arc<KeyMaterial>, issuer: impl Into<String>) -> Self {
        Self {
            keys,
            issuer: issuer.into(),
        }
    }

    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<VerifiedToken, TokenError> {
        let mut segments = token.split('.');
        let (Some(header), Some(payload), Some(signature), None) =
            (segments.next(), segments.next(), segments.next(), segments.next())
        else {
            return Err(TokenError::Malformed);
        };
        if header.is_empty() || payload.is_empty() || signature.is_empty() {
            return Err(TokenError::Malformed);
        }

        let signed = &token[..header.len() + 1 + payload.len()];
        let key = self.matching_key(signature, signed.as_bytes())?;

        let parsed_header = decode_header(token).map_err(|_| TokenError::Malformed)?;
        if parsed_header.alg != key.algorithm() {
            return Err(TokenError::Malformed);
        }

        let payload = Base64UrlUnpadded::decode_vec(payload).map_err(|_| TokenError::Malformed)?;
        let wire: WireClaims = serde_json::from_slice(&payload).map_err(|_| TokenError::Malformed)?;
        if wire.token_type != ACCESS_TOKEN_TYPE || wire.iss != self.issuer {
            return Err(TokenError::Malformed);
        }

        let now_ts = now.timestamp();
        if now_ts >= wire.exp {
            return Err(TokenError::Expired);
        }
        if wire.iat > now_ts + CLOCK_SKEW_LEEWAY {
            return Err(TokenError::NotYetValid);
        }

        let issued_at = DateTime::from_timestamp(wire.iat, 0).ok_or(TokenError::Malformed)?;
        let expires_at = DateTime::from_timestamp(wire.exp, 0).ok_or(TokenError::Malformed)?;
        Ok(VerifiedToken {
            subject: wire.sub,
            claims: Claims {
                role: wire.role,
                scope: wire.scope,
                display_name: wire.user_name,
            },
            issuer: wire.iss,
            token_id: wire.jti,
            issued_at,
            expires_at,
        })
    }

    fn matching_key(&self, signature: &str, message: &[u8]) -> Result<&VerifyingKey, TokenError> {
        self.keys
            .verifying_keys()
            .iter()
            .find(|key| {
                matches!(
                    crypto::verify(signature, message, key.decoding_key(), key.algorithm()),
                    Ok(true)
                )
            })
            .ok_or(TokenError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Role, TokenSigner};
    use crate::testutil::{ed25519_keys, issuer_keys, rotated_keys, rotation_set_keys, verifying_only_keys};
    use proptest::prelude::*;
    use std::time::Duration;

    const ISSUER: &str = "patientenakte-auth";

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn minutes(n: i64) -> chrono::Duration {
        chrono::Duration::minutes(n)
    }

    fn alice_claims() -> Claims {
        Claims::for_role(Role::Patient).with_display_name("Alice")
    }

    #[test]
    fn verify_returns_issued_claims() {
        let keys = issuer_keys();
        let signer = TokenSigner::new(Arc::clone(&keys), ISSUER, Duration::from_secs(900));
        let verifier = TokenVerifier::new(keys, ISSUER);

        let token = signer.issue("alice", &alice_claims(), t0()).unwrap();
        let verified = verifier.verify(token.as_str(), t0()).unwrap();

        assert_eq!(verified.subject, "alice");
        assert_eq!(verified.claims, alice_claims());
        assert_eq!(verified.token_id, token.token_id);
        assert_eq!(verified.expires_at, t0() + minutes(15));
    }

    #[test]
    fn eddsa_tokens_round_trip() {
        let keys = ed25519_keys();
        let signer = TokenSigner::new(Arc::clone(&keys), ISSUER, Duration::from_secs(900));
        let verifier = TokenVerifier::new(keys, ISSUER);

        let token = signer.issue("alice", &alice_claims(), t0()).unwrap();
        assert_eq!(verifier.verify(token.as_str(), t0()).unwrap().claims, alice_claims());
    }

    #[test]
    fn alice_token_expires_after_fifteen_minutes() {
        let keys = issuer_keys();
        let signer = TokenSigner::new(Arc::clone(&keys), ISSUER, Duration::from_secs(15 * 60));
        let verifier = TokenVerifier::new(keys, ISSUER);
        let token = signer.issue("alice", &alice_claims(), t0()).unwrap();

        assert!(verifier.verify(token.as_str(), t0() + minutes(14)).is_ok());
        assert!(verifier
            .verify(token.as_str(), t0() + minutes(15) - chrono::Duration::seconds(1))
            .is_ok());
        assert_eq!(
            verifier.verify(token.as_str(), t0() + minutes(15)).unwrap_err(),
            TokenError::Expired
        );
        assert_eq!(
            verifier.verify(token.as_str(), t0() + minutes(16)).unwrap_err(),
            TokenError::Expired
        );
    }

    #[test]
    fn token_from_the_future_is_not_yet_valid() {
        let keys = issuer_keys();
        let signer = TokenSigner::new(Arc::clone(&keys), ISSUER, Duration::from_secs(900));
        let verifier = TokenVerifier::new(keys, ISSUER);
        let token = signer.issue("alice", &alice_claims(), t0() + minutes(5)).unwrap();

        assert_eq!(verifier.verify(token.as_str(), t0()).unwrap_err(), TokenError::NotYetValid);
        // Within the skew leeway
        assert!(verifier.verify(token.as_str(), t0() + minutes(4) + chrono::Duration::seconds(30)).is_ok());
    }

    #[test]
    fn structurally_broken_tokens_are_malformed() {
        let verifier = TokenVerifier::new(issuer_keys(), ISSUER);
        for token in ["", "abc", "a.b", "a.b.c.d", "a..c", ".b.c", "a.b."] {
            assert_eq!(verifier.verify(token, t0()).unwrap_err(), TokenError::Malformed, "{token:?}");
        }
    }

    #[test]
    fn token_signed_by_unknown_key_is_rejected() {
        let signer = TokenSigner::new(rotated_keys(), ISSUER, Duration::from_secs(900));
        let verifier = TokenVerifier::new(issuer_keys(), ISSUER);
        let token = signer.issue("alice", &alice_claims(), t0()).unwrap();
        assert_eq!(verifier.verify(token.as_str(), t0()).unwrap_err(), TokenError::InvalidSignature);
    }

    #[test]
    fn rotation_set_accepts_old_and_new_keys() {
        let old = TokenSigner::new(issuer_keys(), ISSUER, Duration::from_secs(900));
        let new = TokenSigner::new(rotated_keys(), ISSUER, Duration::from_secs(900));
        let verifier = TokenVerifier::new(rotation_set_keys(), ISSUER);

        for signer in [&old, &new] {
            let token = signer.issue("alice", &alice_claims(), t0()).unwrap();
            assert_eq!(verifier.verify(token.as_str(), t0()).unwrap().subject, "alice");
        }
    }

    #[test]
    fn verifier_without_signing_key_still_verifies() {
        let signer = TokenSigner::new(issuer_keys(), ISSUER, Duration::from_secs(900));
        let verifier = TokenVerifier::new(verifying_only_keys(), ISSUER);
        let token = signer.issue("alice", &alice_claims(), t0()).unwrap();
        assert!(verifier.verify(token.as_str(), t0()).is_ok());
    }

    #[test]
    fn foreign_issuer_is_malformed() {
        let keys = issuer_keys();
        let signer = TokenSigner::new(Arc::clone(&keys), "someone-else", Duration::from_secs(900));
        let verifier = TokenVerifier::new(keys, ISSUER);
        let token = signer.issue("alice", &alice_claims(), t0()).unwrap();
        assert_eq!(verifier.verify(token.as_str(), t0()).unwrap_err(), TokenError::Malformed);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn any_single_byte_mutation_is_rejected(position in any::<prop::sample::Index>(), replacement in 0x21u8..0x7f) {
            let keys = issuer_keys();
            let signer = TokenSigner::new(Arc::clone(&keys), ISSUER, Duration::from_secs(900));
            let verifier = TokenVerifier::new(keys, ISSUER);
            let token = signer.issue("alice", &alice_claims(), t0()).unwrap();

            let mut bytes = token.as_str().as_bytes().to_vec();
            let index = position.index(bytes.len());
            prop_assume!(bytes[index] != replacement);
            let touches_separator = bytes[index] == b'.' || replacement == b'.';
            bytes[index] = replacement;
            let mutated = String::from_utf8(bytes).unwrap();

            let expected = if touches_separator { TokenError::Malformed } else { TokenError::InvalidSignature };
            prop_assert_eq!(verifier.verify(&mutated, t0()).unwrap_err(), expected);
        }
    }
}
