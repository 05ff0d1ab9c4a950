// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Access token issuance.
//!
//! Tokens are compact JWS with `iat = now` and `exp = iat + lifetime`,
//! signed with the key material's signing key and tagged with its `kid`.
//! A lifetime whose `exp` is not a representable instant is refused before
//! anything is signed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, Header};
use tracing::error;
use uuid::Uuid;

use super::claims::{AccessToken, Claims, WireClaims, ACCESS_TOKEN_TYPE};
use super::error::TokenError;
use super::keys::KeyMaterial;

pub struct TokenSigner {
    keys: Arc<KeyMaterial>,
    issuer: String,
    lifetime_secs: i64,
}

impl TokenSigner {
    pub fn new(keys: Arc<KeyMaterial>, issuer: impl Into<String>, lifetime: Duration) -> Self {
        Self {
            keys,
            issuer: issuer.into(),
            lifetime_secs: i64::try_from(lifetime.as_secs()).unwrap_or(i64::MAX / 2),
        }
    }

    pub fn lifetime(&self) -> chrono::Duration {
        chrono::Duration::try_seconds(self.lifetime_secs).unwrap_or(chrono::Duration::MAX)
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Whether a signing key was loaded.
    pub fn is_available(&self) -> bool {
        self.keys.can_sign()
    }

    /// Sign an access token for `subject` valid from `now` for the configured lifetime.
    pub fn issue(&self, subject: &str, claims: &Claims, now: DateTime<Utc>) -> Result<AccessToken, TokenError> {
        let key = self.keys.signing_key().ok_or(TokenError::SigningUnavailable)?;

        let iat = now.timestamp();
        let exp = iat.saturating_add(self.lifetime_secs);
        let (Some(issued_at), Some(expires_at)) = (DateTime::from_timestamp(iat, 0), DateTime::from_timestamp(exp, 0))
        else {
            error!(lifetime_secs = self.lifetime_secs, "Access token lifetime out of range");
            return Err(TokenError::InvalidLifetime);
        };
        let wire = WireClaims {
            sub: subject.to_string(),
            iat,
            exp,
            iss: self.issuer.clone(),
            jti: Uuid::new_v4().to_string(),
            token_type: ACCESS_TOKEN_TYPE.to_string(),
            role: claims.role,
            scope: claims.scope.clone(),
            user_name: claims.display_name.clone(),
        };

        let mut header = Header::new(key.algorithm());
        header.kid = Some(key.kid().to_string());

        let token = encode(&header, &wire, key.encoding_key()).map_err(|e| {
            error!(kid = key.kid(), error = %e, "Failed to sign access token");
            TokenError::SigningUnavailable
        })?;

        Ok(AccessToken {
            token,
            subject: wire.sub,
            token_id: wire.jti,
            issued_at,
            expires_at,
        })
    }
}
