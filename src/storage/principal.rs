// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Principal records owned by the credential store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;
use utoipa::ToSchema;

use crate::auth::Role;

/// Lifecycle state of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AccountState {
    Active,
    Locked,
    PendingVerification,
    /// Terminal. Kept as a tombstone so the revision sequence stays monotonic.
    Deleted,
}

impl AccountState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AccountState::Deleted)
    }
}

/// How a principal proves who they are.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthMaterial {
    /// Argon2id PHC string; carries algorithm, parameters and salt.
    Password { hash: String },
    /// Subject id issued by an external identity provider.
    Social { provider: String, subject: String },
}

impl AuthMaterial {
    pub fn provider_name(&self) -> &str {
        match self {
            AuthMaterial::Password { .. } => "password",
            AuthMaterial::Social { provider, .. } => provider,
        }
    }
}

/// An authenticable account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    /// Login identifier: a normalized e-mail address, or `provider:subject`
    /// verbatim for social principals.
    pub identifier: String,
    pub display_name: String,
    pub role: Role,
    pub state: AccountState,
    pub auth: AuthMaterial,
    /// Incremented on every identity-relevant mutation.
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a principal. Id and revision are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewPrincipal {
    pub identifier: String,
    pub display_name: String,
    pub role: Role,
    pub state: AccountState,
    pub auth: AuthMaterial,
}

/// Normalize a login identifier: NFKC, trimmed, lowercase.
///
/// Visually identical identifiers must map to the same account.
pub fn normalize_identifier(raw: &str) -> String {
    raw.trim().nfkc().collect::<String>().to_lowercase()
}

/// Identifier given to a principal provisioned from a social identity.
///
/// Provider subjects are opaque and case-sensitive, so this is stored as is.
pub fn social_identifier(provider: &str, subject: &str) -> String {
    format!("{provider}:{subject}")
}

/// Key used in the social link index.
pub(crate) fn social_link_key(provider: &str, subject: &str) -> String {
    format!("{provider}|{subject}")
}
