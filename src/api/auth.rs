// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Registration and session endpoints.
//!
//! Every credential failure answers `401 authentication_failed`; the reason
//! only appears in the server logs.

use axum::{extract::State, http::StatusCode, Json};

use crate::{
    auth::{AuthError, Role},
    error::ApiError,
    models::{
        IdentifierRequest, LoginRequest, PasswordResetCheckRequest, PasswordResetCheckResponse, PrincipalResponse,
        RefreshRequest, RegisterRequest, SetNewPasswordRequest, SocialLoginRequest, TokenResponse,
        VerifyEmailRequest,
    },
    state::AppState,
};

/// Register a password account.
///
/// The account starts in `pending_verification` and cannot log in until the
/// token mailed to the identifier is presented at `/v1/auth/verify`. An
/// administrator can also verify it directly.
#[utoipa::path(
    post,
    path = "/v1/auth/register",
    tag = "Auth",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Account created", body = PrincipalResponse),
        (status = 409, description = "Identifier already registered"),
        (status = 422, description = "Invalid identifier, display name or password")
    )
)]
pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<PrincipalResponse>), ApiError> {
    let principal = state
        .accounts
        .register(&request.identifier, &request.display_name, &request.password, Role::Patient)
        .await?;
    Ok((StatusCode::CREATED, Json(principal.into())))
}

/// Log in with identifier and password.
#[utoipa::path(
    post,
    path = "/v1/auth/login",
    tag = "Auth",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Tokens issued", body = TokenResponse),
        (status = 401, description = "Authentication failed"),
        (status = 503, description = "Token issuance unavailable")
    )
)]
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<TokenResponse>, AuthError> {
    let session = state
        .sessions
        .login_with_password(&request.identifier, &request.password)
        .await?;
    Ok(Json(session.into()))
}

/// Log in with an ID token from the configured social provider.
///
/// The first login provisions an account.
#[utoipa::path(
    post,
    path = "/v1/auth/social",
    tag = "Auth",
    request_body = SocialLoginRequest,
    responses(
        (status = 200, description = "Tokens issued", body = TokenResponse),
        (status = 401, description = "Authentication failed"),
        (status = 404, description = "Social login not enabled"),
        (status = 503, description = "Token issuance unavailable")
    )
)]
pub async fn social_login(
    State(state): State<AppState>,
    Json(request): Json<SocialLoginRequest>,
) -> Result<Json<TokenResponse>, AuthError> {
    let session = state.sessions.login_with_social_assertion(&request.assertion).await?;
    Ok(Json(session.into()))
}

/// Exchange a refresh token for a new token pair.
#[utoipa::path(
    post,
    path = "/v1/auth/refresh",
    tag = "Auth",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "Tokens issued", body = TokenResponse),
        (status = 401, description = "Refresh token invalid, expired or reused")
    )
)]
pub async fn refresh(
    State(state): State<AppState>,
    Json(request): Json<RefreshRequest>,
) -> Result<Json<TokenResponse>, AuthError> {
    let session = state.sessions.refresh(&request.refresh_token).await?;
    Ok(Json(session.into()))
}

#[utoipa::path(
    post,
    path = "/v1/auth/logout",
    tag = "Auth",
    request_body = RefreshRequest,
    responses(
        (status = 204, description = "Refresh token revoked")
    )
)]
pub async fn logout(
    State(state): State<AppState>,
    Json(request): Json<RefreshRequest>,
) -> Result<StatusCode, AuthError> {
    state.sessions.logout(&request.refresh_token).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Activate an account with the token from its verification e-mail.
#[utoipa::path(
    post,
    path = "/v1/auth/verify",
    tag = "Auth",
    request_body = VerifyEmailRequest,
    responses(
        (status = 200, description = "Account verified", body = PrincipalResponse),
        (status = 400, description = "Token invalid, expired or already used"),
        (status = 409, description = "Account is not awaiting verification")
    )
)]
pub async fn verify_email(
    State(state): State<AppState>,
    Json(request): Json<VerifyEmailRequest>,
) -> Result<Json<PrincipalResponse>, ApiError> {
    let principal = state.accounts.confirm_verification(&request.token).await?;
    Ok(Json(principal.into()))
}

/// Send a new verification e-mail.
///
/// Always accepted, so the response does not reveal whether the identifier
/// is registered.
#[utoipa::path(
    post,
    path = "/v1/auth/verify/resend",
    tag = "Auth",
    request_body = IdentifierRequest,
    responses(
        (status = 202, description = "Accepted")
    )
)]
pub async fn resend_verification(
    State(state): State<AppState>,
    Json(request): Json<IdentifierRequest>,
) -> Result<StatusCode, ApiError> {
    state.accounts.request_verification(&request.identifier).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Send a password reset e-mail. Always accepted.
#[utoipa::path(
    post,
    path = "/v1/auth/password-reset",
    tag = "Auth",
    request_body = IdentifierRequest,
    responses(
        (status = 202, description = "Accepted")
    )
)]
pub async fn request_password_reset(
    State(state): State<AppState>,
    Json(request): Json<IdentifierRequest>,
) -> Result<StatusCode, ApiError> {
    state.accounts.request_password_reset(&request.identifier).await?;
    Ok(StatusCode::ACCEPTED)
}

#[utoipa::path(
    post,
    path = "/v1/auth/password-reset/check",
    tag = "Auth",
    request_body = PasswordResetCheckRequest,
    responses(
        (status = 200, description = "Whether the token can still be used", body = PasswordResetCheckResponse)
    )
)]
pub async fn check_password_reset(
    State(state): State<AppState>,
    Json(request): Json<PasswordResetCheckRequest>,
) -> Result<Json<PasswordResetCheckResponse>, ApiError> {
    let valid = state.accounts.check_password_reset_token(&request.token).await?;
    Ok(Json(PasswordResetCheckResponse { valid }))
}

/// Set a new password with a reset token. Every session of the account ends.
#[utoipa::path(
    post,
    path = "/v1/auth/password-reset/confirm",
    tag = "Auth",
    request_body = SetNewPasswordRequest,
    responses(
        (status = 204, description = "Password changed"),
        (status = 400, description = "Token invalid, expired or already used"),
        (status = 422, description = "Password rejected by policy")
    )
)]
pub async fn confirm_password_reset(
    State(state): State<AppState>,
    Json(request): Json<SetNewPasswordRequest>,
) -> Result<StatusCode, ApiError> {
    state.accounts.reset_password(&request.token, &request.password).await?;
    Ok(StatusCode::NO_CONTENT)
}
