// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Self-service endpoints for the authenticated principal.

use axum::{extract::State, http::StatusCode, Json};

use crate::{
    auth::Auth,
    error::ApiError,
    models::{PrincipalResponse, UpdateProfileRequest},
    state::AppState,
};

/// Get the current principal.
#[utoipa::path(
    get,
    path = "/v1/users/me",
    tag = "Users",
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Principal", body = PrincipalResponse),
        (status = 401, description = "Unauthorized - invalid or missing token"),
        (status = 404, description = "Principal deleted")
    )
)]
pub async fn get_current_user(
    Auth(user): Auth,
    State(state): State<AppState>,
) -> Result<Json<PrincipalResponse>, ApiError> {
    let principal = state.accounts.get(&user.user_id).await?;
    Ok(Json(principal.into()))
}

/// Change the current principal's display name.
#[utoipa::path(
    put,
    path = "/v1/users/me",
    tag = "Users",
    security(("bearer" = [])),
    request_body = UpdateProfileRequest,
    responses(
        (status = 200, description = "Updated principal", body = PrincipalResponse),
        (status = 401, description = "Unauthorized - invalid or missing token"),
        (status = 422, description = "Invalid display name")
    )
)]
pub async fn update_current_user(
    Auth(user): Auth,
    State(state): State<AppState>,
    Json(request): Json<UpdateProfileRequest>,
) -> Result<Json<PrincipalResponse>, ApiError> {
    let principal = state
        .accounts
        .update_display_name(&user.user_id, &request.display_name)
        .await?;
    Ok(Json(principal.into()))
}

/// Delete the current principal.
///
/// Dependent services receive a tombstone and drop the account.
#[utoipa::path(
    delete,
    path = "/v1/users/me",
    tag = "Users",
    security(("bearer" = [])),
    responses(
        (status = 204, description = "Principal deleted"),
        (status = 401, description = "Unauthorized - invalid or missing token")
    )
)]
pub async fn delete_current_user(Auth(user): Auth, State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.accounts.delete_principal(&user.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
