// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Access token claims and the authenticated user representation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::roles::Role;

/// Value of the `token_type` claim on access tokens.
pub(crate) const ACCESS_TOKEN_TYPE: &str = "access";

/// Authorization claims carried by an access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Claims {
    pub role: Role,
    pub scope: Vec<String>,
    /// Convenience copy of the display name for downstream UIs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl Claims {
    /// Claims with the role's default scopes.
    pub fn for_role(role: Role) -> Self {
        Self {
            role,
            scope: role.default_scopes(),
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }
}

/// JWT payload as it appears on the wire.
///
/// Fields must exist for serde JWT deserialization; unknown claims are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WireClaims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub jti: String,
    pub token_type: String,
    pub role: Role,
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
}

/// A freshly issued, signed access token.
#[derive(Debug, Clone)]
pub struct AccessToken {
    /// Compact JWS serialization.
    pub token: String,
    pub subject: String,
    pub token_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn as_str(&self) -> &str {
        &self.token
    }

    /// Seconds of validity left at `now`.
    pub fn expires_in(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds().max(0)
    }
}

/// Claims of a token whose signature and lifetime have been checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedToken {
    pub subject: String,
    pub claims: Claims,
    pub issuer: String,
    pub token_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Authenticated user information extracted from a verified token.
///
/// This is the type handlers use to represent the caller.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AuthenticatedUser {
    /// Principal id (`sub` claim)
    pub user_id: String,

    pub role: Role,

    pub scope: Vec<String>,

    /// Token expiration (Unix timestamp, not serialized)
    #[serde(skip)]
    pub expires_at: i64,
}

impl AuthenticatedUser {
    pub fn from_verified(token: VerifiedToken) -> Self {
        Self {
            user_id: token.subject,
            role: token.claims.role,
            scope: token.claims.scope,
            expires_at: token.expires_at.timestamp(),
        }
    }

    /// Check if the user has the required role.
    pub fn has_role(&self, required: Role) -> bool {
        self.role.has_privilege(required)
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scope.iter().any(|s| s == scope)
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}
