// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # API Data Models
//!
//! Request and response bodies of the REST API. All types derive
//! `ToSchema` for the OpenAPI document.
//!
//! ## Model Categories
//!
//! - **Sessions**: login, social login, refresh and logout
//! - **Principals**: registration, profile and admin state changes
//! - **Account recovery**: e-mail verification and password reset

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::{IssuedSession, Role};
use crate::storage::{AccountState, Principal};

// =============================================================================
// Sessions
// =============================================================================

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct LoginRequest {
    /// E-mail address used at registration
    pub identifier: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct SocialLoginRequest {
    /// ID token issued by the social identity provider
    pub assertion: String,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// Tokens returned by login and refresh.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TokenResponse {
    pub access_token: String,
    /// Always `Bearer`
    pub token_type: String,
    /// Seconds until the access token expires
    pub expires_in: i64,
    pub refresh_token: String,
    pub refresh_expires_at: DateTime<Utc>,
    pub principal: PrincipalResponse,
}

impl From<IssuedSession> for TokenResponse {
    fn from(session: IssuedSession) -> Self {
        Self {
            expires_in: session.access_token.expires_in(session.access_token.issued_at),
            access_token: session.access_token.token,
            token_type: "Bearer".to_string(),
            refresh_token: session.refresh_token,
            refresh_expires_at: session.refresh_expires_at,
            principal: session.principal.into(),
        }
    }
}

// =============================================================================
// Principals
// =============================================================================

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct RegisterRequest {
    pub identifier: String,
    pub display_name: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct UpdateProfileRequest {
    pub display_name: String,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct SetAccountStateRequest {
    /// `active` or `locked`
    pub state: AccountState,
}

/// Public view of a principal. Never carries credential material.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PrincipalResponse {
    pub id: String,
    pub identifier: String,
    pub display_name: String,
    pub role: Role,
    pub state: AccountState,
    /// `password` or the social provider name
    pub provider: String,
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Principal> for PrincipalResponse {
    fn from(principal: Principal) -> Self {
        Self {
            provider: principal.auth.provider_name().to_string(),
            id: principal.id,
            identifier: principal.identifier,
            display_name: principal.display_name,
            role: principal.role,
            state: principal.state,
            revision: principal.revision,
            created_at: principal.created_at,
            updated_at: principal.updated_at,
        }
    }
}

// =============================================================================
// Account recovery
// =============================================================================

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct VerifyEmailRequest {
    /// Token from the verification e-mail
    pub token: String,
}

/// Identifier of the account a verification or reset e-mail is requested for.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct IdentifierRequest {
    pub identifier: String,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct PasswordResetCheckRequest {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PasswordResetCheckResponse {
    pub valid: bool,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct SetNewPasswordRequest {
    /// Token from the password reset e-mail
    pub token: String,
    pub password: String,
}
