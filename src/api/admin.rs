// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Admin-only account management.
//!
//! Every change here is an identity mutation and is propagated to
//! dependent services.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use tracing::info;

use crate::{
    auth::AdminOnly,
    error::ApiError,
    models::{PrincipalResponse, SetAccountStateRequest},
    state::AppState,
};

#[utoipa::path(
    get,
    path = "/v1/admin/principals/{principal_id}",
    tag = "Admin",
    security(("bearer" = [])),
    params(("principal_id" = String, Path, description = "Principal id")),
    responses(
        (status = 200, description = "Principal", body = PrincipalResponse),
        (status = 403, description = "Admin role required"),
        (status = 404, description = "Principal not found")
    )
)]
pub async fn get_principal(
    AdminOnly(_admin): AdminOnly,
    State(state): State<AppState>,
    Path(principal_id): Path<String>,
) -> Result<Json<PrincipalResponse>, ApiError> {
    Ok(Json(state.accounts.get(&principal_id).await?.into()))
}

/// Confirm a pending registration.
#[utoipa::path(
    post,
    path = "/v1/admin/principals/{principal_id}/verify",
    tag = "Admin",
    security(("bearer" = [])),
    params(("principal_id" = String, Path, description = "Principal id")),
    responses(
        (status = 200, description = "Account active", body = PrincipalResponse),
        (status = 403, description = "Admin role required"),
        (status = 404, description = "Principal not found"),
        (status = 409, description = "Account is not pending verification")
    )
)]
pub async fn verify_principal(
    AdminOnly(admin): AdminOnly,
    State(state): State<AppState>,
    Path(principal_id): Path<String>,
) -> Result<Json<PrincipalResponse>, ApiError> {
    let principal = state.accounts.verify_account(&principal_id).await?;
    info!(admin_id = %admin.user_id, principal_id = %principal.id, "Account verified by admin");
    Ok(Json(principal.into()))
}

/// Lock or unlock an account.
#[utoipa::path(
    put,
    path = "/v1/admin/principals/{principal_id}/state",
    tag = "Admin",
    security(("bearer" = [])),
    params(("principal_id" = String, Path, description = "Principal id")),
    request_body = SetAccountStateRequest,
    responses(
        (status = 200, description = "State changed", body = PrincipalResponse),
        (status = 403, description = "Admin role required"),
        (status = 404, description = "Principal not found"),
        (status = 409, description = "Transition not allowed")
    )
)]
pub async fn set_principal_state(
    AdminOnly(admin): AdminOnly,
    State(state): State<AppState>,
    Path(principal_id): Path<String>,
    Json(request): Json<SetAccountStateRequest>,
) -> Result<Json<PrincipalResponse>, ApiError> {
    let principal = state
        .accounts
        .set_account_state(&principal_id, request.state)
        .await?;
    info!(
        admin_id = %admin.user_id,
        principal_id = %principal.id,
        state = ?principal.state,
        "Account state changed by admin"
    );
    Ok(Json(principal.into()))
}

#[utoipa::path(
    delete,
    path = "/v1/admin/principals/{principal_id}",
    tag = "Admin",
    security(("bearer" = [])),
    params(("principal_id" = String, Path, description = "Principal id")),
    responses(
        (status = 204, description = "Principal deleted"),
        (status = 403, description = "Admin role required"),
        (status = 404, description = "Principal not found")
    )
)]
pub async fn delete_principal(
    AdminOnly(admin): AdminOnly,
    State(state): State<AppState>,
    Path(principal_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.accounts.delete_principal(&principal_id).await?;
    info!(admin_id = %admin.user_id, principal_id = %principal_id, "Principal deleted by admin");
    Ok(StatusCode::NO_CONTENT)
}
