// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Authentication errors.
//!
//! Three layers:
//! - [`TokenError`]: outcome of signing or verifying an access token.
//! - [`LoginError`]: why a login, refresh or social assertion was refused.
//! - [`AuthError`]: what an HTTP caller sees. Every credential failure
//!   collapses to `authentication_failed` so responses do not reveal
//!   whether an account exists or is locked. Rejected bearer tokens get
//!   the same answer; the precise reason is only logged.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::storage::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("token is malformed")]
    Malformed,
    #[error("token signature is invalid")]
    InvalidSignature,
    #[error("token has expired")]
    Expired,
    #[error("token is not yet valid")]
    NotYetValid,
    #[error("signing key unavailable")]
    SigningUnavailable,
    /// The configured lifetime pushes `exp` outside the representable range.
    #[error("token lifetime out of range")]
    InvalidLifetime,
}

#[derive(Debug, thiserror::Error)]
pub enum LoginError {
    #[error("unknown principal")]
    UnknownPrincipal,
    #[error("account is locked")]
    AccountLocked,
    #[error("account is pending verification")]
    PendingVerification,
    #[error("bad credentials")]
    BadCredentials,
    /// Password login attempted on an account linked to a social provider.
    #[error("account signs in through {0}")]
    ProviderMismatch(String),
    #[error("social assertion rejected: {0}")]
    SocialAssertionRejected(String),
    #[error("social login is not configured")]
    SocialLoginDisabled,
    #[error("refresh token is invalid")]
    InvalidRefreshToken,
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("password hashing failed: {0}")]
    Hashing(String),
}

/// Authentication error type returned to HTTP callers.
#[derive(Debug)]
pub enum AuthError {
    /// No authorization header present
    MissingAuthHeader,
    /// Invalid authorization header format
    InvalidAuthHeader,
    /// Credentials or bearer token refused
    AuthenticationFailed,
    /// Token issuance is disabled (no signing key)
    SigningUnavailable,
    /// Social login is not configured on this instance
    SocialLoginDisabled,
    InsufficientPermissions,
    InternalError(String),
}

#[derive(Serialize)]
struct AuthErrorBody {
    error: String,
    error_code: String,
}

impl AuthError {
    pub fn error_code(&self) -> &'static str {
        match self {
            AuthError::MissingAuthHeader => "missing_auth_header",
            AuthError::InvalidAuthHeader => "invalid_auth_header",
            AuthError::AuthenticationFailed => "authentication_failed",
            AuthError::SigningUnavailable => "signing_unavailable",
            AuthError::SocialLoginDisabled => "social_login_disabled",
            AuthError::InsufficientPermissions => "insufficient_permissions",
            AuthError::InternalError(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AuthError::MissingAuthHeader
            | AuthError::InvalidAuthHeader
            | AuthError::AuthenticationFailed => StatusCode::UNAUTHORIZED,
            AuthError::InsufficientPermissions => StatusCode::FORBIDDEN,
            AuthError::SocialLoginDisabled => StatusCode::NOT_FOUND,
            AuthError::SigningUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            AuthError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::MissingAuthHeader => write!(f, "Authorization header is required"),
            AuthError::InvalidAuthHeader => {
                write!(f, "Invalid authorization header format (expected 'Bearer <token>')")
            }
            AuthError::AuthenticationFailed => write!(f, "Invalid credentials"),
            AuthError::SigningUnavailable => write!(f, "Token issuance is temporarily unavailable"),
            AuthError::SocialLoginDisabled => write!(f, "Social login is not enabled"),
            AuthError::InsufficientPermissions => {
                write!(f, "Insufficient permissions for this operation")
            }
            // Details stay in the logs
            AuthError::InternalError(_) => write!(f, "Internal authentication error"),
        }
    }
}

impl std::error::Error for AuthError {}

impl From<TokenError> for AuthError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::Malformed | TokenError::InvalidSignature | TokenError::Expired | TokenError::NotYetValid => {
                AuthError::AuthenticationFailed
            }
            TokenError::SigningUnavailable => AuthError::SigningUnavailable,
            TokenError::InvalidLifetime => AuthError::InternalError(e.to_string()),
        }
    }
}

impl From<LoginError> for AuthError {
    fn from(e: LoginError) -> Self {
        match e {
            LoginError::UnknownPrincipal
            | LoginError::AccountLocked
            | LoginError::PendingVerification
            | LoginError::BadCredentials
            | LoginError::ProviderMismatch(_)
            | LoginError::SocialAssertionRejected(_)
            | LoginError::InvalidRefreshToken => AuthError::AuthenticationFailed,
            LoginError::SocialLoginDisabled => AuthError::SocialLoginDisabled,
            LoginError::Token(TokenError::SigningUnavailable) => AuthError::SigningUnavailable,
            LoginError::Token(other) => AuthError::InternalError(other.to_string()),
            LoginError::Store(e) => AuthError::InternalError(e.to_string()),
            LoginError::Hashing(msg) => AuthError::InternalError(msg),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if let AuthError::InternalError(detail) = &self {
            tracing::error!(error = %detail, "Authentication internal error");
        }
        let body = Json(AuthErrorBody {
            error: self.to_string(),
            error_code: self.error_code().to_string(),
        });
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_of(response: Response) -> serde_json::Value {
        let body_bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body_bytes).unwrap()
    }

    #[tokio::test]
    async fn missing_auth_returns_401() {
        let response = AuthError::MissingAuthHeader.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_of(response).await["error_code"], "missing_auth_header");
    }

    #[tokio::test]
    async fn login_failures_are_indistinguishable() {
        let failures = [
            LoginError::UnknownPrincipal,
            LoginError::AccountLocked,
            LoginError::PendingVerification,
            LoginError::BadCredentials,
            LoginError::ProviderMismatch("google".to_string()),
        ];
        let mut bodies = Vec::new();
        for failure in failures {
            let response = AuthError::from(failure).into_response();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            bodies.push(body_of(response).await);
        }
        assert!(bodies.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(bodies[0]["error_code"], "authentication_failed");
    }

    #[tokio::test]
    async fn signing_unavailable_fails_closed_with_503() {
        let response = AuthError::from(LoginError::Token(TokenError::SigningUnavailable)).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn internal_error_hides_detail() {
        let response = AuthError::InternalError("redb exploded".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_of(response).await;
        assert!(!body["error"].as_str().unwrap().contains("redb"));
    }

    #[tokio::test]
    async fn rejected_bearer_tokens_are_indistinguishable() {
        let rejections = [
            TokenError::Malformed,
            TokenError::InvalidSignature,
            TokenError::Expired,
            TokenError::NotYetValid,
        ];
        let mut bodies = Vec::new();
        for rejection in rejections {
            let response = AuthError::from(rejection).into_response();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            bodies.push(body_of(response).await);
        }
        assert!(bodies.windows(2).all(|pair| pair[0] == pair[1]));

        // Same body a failed login gets
        let login = body_of(AuthError::from(LoginError::BadCredentials).into_response()).await;
        assert_eq!(bodies[0], login);
    }
}
