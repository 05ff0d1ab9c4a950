// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_swagger_ui::SwaggerUi;

use crate::{
    models::{
        IdentifierRequest, LoginRequest, PasswordResetCheckRequest, PasswordResetCheckResponse, PrincipalResponse,
        RefreshRequest, RegisterRequest, SetAccountStateRequest, SetNewPasswordRequest, SocialLoginRequest,
        TokenResponse, UpdateProfileRequest, VerifyEmailRequest,
    },
    state::AppState,
    storage::AccountState,
};

pub mod admin;
pub mod auth;
pub mod health;
pub mod users;

pub fn router(state: AppState) -> Router {
    let v1_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/auth/social", post(auth::social_login))
        .route("/auth/refresh", post(auth::refresh))
        .route("/auth/logout", post(auth::logout))
        .route("/auth/verify", post(auth::verify_email))
        .route("/auth/verify/resend", post(auth::resend_verification))
        .route("/auth/password-reset", post(auth::request_password_reset))
        .route("/auth/password-reset/check", post(auth::check_password_reset))
        .route("/auth/password-reset/confirm", post(auth::confirm_password_reset))
        .route(
            "/users/me",
            get(users::get_current_user)
                .put(users::update_current_user)
                .delete(users::delete_current_user),
        )
        .route(
            "/admin/principals/{principal_id}",
            get(admin::get_principal).delete(admin::delete_principal),
        )
        .route("/admin/principals/{principal_id}/verify", post(admin::verify_principal))
        .route("/admin/principals/{principal_id}/state", put(admin::set_principal_state));

    Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .nest("/v1", v1_routes)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        health::liveness,
        health::readiness,
        auth::register,
        auth::login,
        auth::social_login,
        auth::refresh,
        auth::logout,
        auth::verify_email,
        auth::resend_verification,
        auth::request_password_reset,
        auth::check_password_reset,
        auth::confirm_password_reset,
        users::get_current_user,
        users::update_current_user,
        users::delete_current_user,
        admin::get_principal,
        admin::verify_principal,
        admin::set_principal_state,
        admin::delete_principal
    ),
    components(
        schemas(
            LoginRequest,
            SocialLoginRequest,
            RefreshRequest,
            TokenResponse,
            RegisterRequest,
            UpdateProfileRequest,
            SetAccountStateRequest,
            PrincipalResponse,
            VerifyEmailRequest,
            IdentifierRequest,
            PasswordResetCheckRequest,
            PasswordResetCheckResponse,
            SetNewPasswordRequest,
            AccountState,
            crate::auth::Role,
            health::ReadyResponse,
            health::HealthChecks,
            health::HealthResponse
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Health", description = "Liveness and readiness probes"),
        (name = "Auth", description = "Registration, verification, login, password reset and token refresh"),
        (name = "Users", description = "Self-service profile"),
        (name = "Admin", description = "Account administration")
    )
)]
struct ApiDoc;
