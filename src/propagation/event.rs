// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Identity change events as they travel over the exchange.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::Role;
use crate::storage::{AccountState, Principal};

/// Fields dependent services project into their local caches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySnapshot {
    pub display_name: String,
    pub account_state: AccountState,
    pub role: Role,
}

/// A post-mutation snapshot of one principal.
///
/// Revisions for a principal are strictly increasing; the revision is the
/// only ordering key consumers rely on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityChangeEvent {
    pub event_id: Uuid,
    pub principal_id: String,
    pub revision: u64,
    pub snapshot: IdentitySnapshot,
    pub emitted_at: DateTime<Utc>,
}

impl IdentityChangeEvent {
    /// Build the event describing `principal` as it is now.
    pub fn from_principal(principal: &Principal, emitted_at: DateTime<Utc>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            principal_id: principal.id.clone(),
            revision: principal.revision,
            snapshot: IdentitySnapshot {
                display_name: principal.display_name.clone(),
                account_state: principal.state,
                role: principal.role,
            },
            emitted_at,
        }
    }

    /// Routing key on the topic exchange.
    pub fn routing_key(&self) -> &str {
        &self.principal_id
    }

    pub fn is_tombstone(&self) -> bool {
        self.snapshot.account_state == AccountState::Deleted
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

#[cfg(test)]
pub(crate) fn test_event(principal_id: &str, revision: u64, display_name: &str) -> IdentityChangeEvent {
    IdentityChangeEvent {
        event_id: Uuid::new_v4(),
        principal_id: principal_id.to_string(),
        revision,
        snapshot: IdentitySnapshot {
            display_name: display_name.to_string(),
            account_state: AccountState::Active,
            role: Role::Patient,
        },
        emitted_at: Utc::now(),
    }
}
