// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Social identity provider assertions.
//!
//! The provider hands the client a signed ID token. It is accepted when the
//! signature verifies against the provider's published keys and issuer,
//! audience and expiry check out. Only `sub` identifies the person; e-mail
//! and name are informational.

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tracing::warn;

use super::error::LoginError;
use super::jwks::JwksManager;
use crate::config::SocialProviderConfig;

/// Clock skew tolerance (60 seconds).
const CLOCK_SKEW_LEEWAY: u64 = 60;

/// Identity asserted by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocialIdentity {
    pub provider: String,
    pub subject: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProviderClaims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

enum KeySource {
    Jwks(JwksManager),
    Static { key: DecodingKey, algorithm: Algorithm },
}

pub struct SocialAssertionVerifier {
    provider: String,
    issuer: String,
    audience: Option<String>,
    keys: KeySource,
}

impl SocialAssertionVerifier {
    pub fn from_config(config: &SocialProviderConfig) -> Self {
        Self {
            provider: config.name.clone(),
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            keys: KeySource::Jwks(JwksManager::new(config.jwks_url.clone())),
        }
    }

    /// Verifier pinned to a single provider key.
    pub fn with_static_key(
        provider: impl Into<String>,
        issuer: impl Into<String>,
        audience: Option<String>,
        key: DecodingKey,
        algorithm: Algorithm,
    ) -> Self {
        Self {
            provider: provider.into(),
            issuer: issuer.into(),
            audience,
            keys: KeySource::Static { key, algorithm },
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub async fn verify(&self, assertion: &str) -> Result<SocialIdentity, LoginError> {
        let header = decode_header(assertion).map_err(|_| reject("malformed assertion"))?;

        let (key, algorithm) = match &self.keys {
            KeySource::Jwks(jwks) => jwks.decoding_key(header.kid.as_deref()).await.map_err(|e| {
                warn!(provider = %self.provider, error = %e, "Provider key lookup failed");
                reject("no usable provider key")
            })?,
            KeySource::Static { key, algorithm } => (key.clone(), *algorithm),
        };
        if header.alg != algorithm {
            return Err(reject("unexpected algorithm"));
        }

        let mut validation = Validation::new(algorithm);
        validation.leeway = CLOCK_SKEW_LEEWAY;
        validation.set_issuer(&[&self.issuer]);
        match &self.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        let data = decode::<ProviderClaims>(assertion, &key, &validation).map_err(|e| {
            reject(match e.kind() {
                ErrorKind::ExpiredSignature => "assertion expired",
                ErrorKind::InvalidSignature => "invalid signature",
                ErrorKind::InvalidIssuer => "issuer mismatch",
                ErrorKind::InvalidAudience => "audience mismatch",
                ErrorKind::ImmatureSignature => "assertion not yet valid",
                _ => "malformed assertion",
            })
        })?;

        let claims = data.claims;
        if claims.sub.trim().is_empty() {
            return Err(reject("empty subject"));
        }

        Ok(SocialIdentity {
            provider: self.provider.clone(),
            subject: claims.sub,
            email: claims.email,
            display_name: claims.name,
        })
    }
}

fn reject(reason: &str) -> LoginError {
    LoginError::SocialAssertionRejected(reason.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{provider_assertion, provider_verifier, PROVIDER_ISSUER};
    use chrono::Utc;

    #[tokio::test]
    async fn valid_assertion_yields_identity() {
        let assertion = provider_assertion("google-123", PROVIDER_ISSUER, Utc::now().timestamp() + 300);
        let identity = provider_verifier().verify(&assertion).await.unwrap();
        assert_eq!(identity.provider, "google");
        assert_eq!(identity.subject, "google-123");
        assert_eq!(identity.email.as_deref(), Some("google-123@example.org"));
    }

    #[tokio::test]
    async fn expired_assertion_is_rejected() {
        let assertion = provider_assertion("google-123", PROVIDER_ISSUER, Utc::now().timestamp() - 600);
        let err = provider_verifier().verify(&assertion).await.unwrap_err();
        assert!(matches!(err, LoginError::SocialAssertionRejected(reason) if reason == "assertion expired"));
    }

    #[tokio::test]
    async fn foreign_issuer_is_rejected() {
        let assertion = provider_assertion("google-123", "https://evil.example", Utc::now().timestamp() + 300);
        let err = provider_verifier().verify(&assertion).await.unwrap_err();
        assert!(matches!(err, LoginError::SocialAssertionRejected(reason) if reason == "issuer mismatch"));
    }

    #[tokio::test]
    async fn tampered_or_garbage_assertion_is_rejected() {
        let assertion = provider_assertion("google-123", PROVIDER_ISSUER, Utc::now().timestamp() + 300);
        let mut tampered = assertion.clone();
        tampered.push('x');
        assert!(provider_verifier().verify(&tampered).await.is_err());
        assert!(provider_verifier().verify("not-a-jwt").await.is_err());
    }
}
