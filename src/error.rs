// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::accounts::AccountError;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, message)
    }

    pub fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    }
}

impl From<AccountError> for ApiError {
    fn from(e: AccountError) -> Self {
        match e {
            AccountError::IdentifierTaken => ApiError::conflict(e.to_string()),
            AccountError::InvalidTransition { .. } => ApiError::conflict(e.to_string()),
            AccountError::InvalidIdentifier | AccountError::InvalidDisplayName | AccountError::WeakPassword(_) => {
                ApiError::unprocessable(e.to_string())
            }
            AccountError::NotFound => ApiError::not_found(e.to_string()),
            AccountError::InvalidToken => ApiError::bad_request(e.to_string()),
            AccountError::Hashing(_) | AccountError::TokenIssuance(_) | AccountError::Store(_) => {
                tracing::error!(error = %e, "Account operation failed");
                ApiError::internal()
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::password::PolicyViolation;
    use crate::storage::{AccountState, StoreError};
    use axum::body::to_bytes;

    #[test]
    fn account_errors_map_to_status() {
        assert_eq!(ApiError::from(AccountError::IdentifierTaken).status, StatusCode::CONFLICT);
        assert_eq!(
            ApiError::from(AccountError::WeakPassword(PolicyViolation::TooShort(8))).status,
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(ApiError::from(AccountError::NotFound).status, StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::from(AccountError::InvalidTransition {
                from: AccountState::Active,
                to: AccountState::Active
            })
            .status,
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn action_token_errors() {
        let invalid = ApiError::from(AccountError::InvalidToken);
        assert_eq!(invalid.status, StatusCode::BAD_REQUEST);
        assert_eq!(invalid.message, "invalid or expired token");

        let issuance = ApiError::from(AccountError::TokenIssuance("rng unavailable".to_string()));
        assert_eq!(issuance.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(issuance.message, "internal error");
    }

    #[test]
    fn store_failures_do_not_leak_details() {
        let err = ApiError::from(AccountError::Store(StoreError::NotFound("db path /secret".to_string())));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "internal error");
    }

    #[tokio::test]
    async fn into_response_returns_json_body() {
        let response = ApiError::bad_request("bad data").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body_bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8(body_bytes.to_vec()).unwrap();
        assert_eq!(body, r#"{"error":"bad data"}"#);
    }
}
