// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::path::PathBuf;
use std::sync::Arc;

use crate::accounts::AccountService;
use crate::auth::{SessionService, TokenVerifier};
use crate::storage::CredentialStore;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub accounts: Arc<AccountService>,
    pub sessions: Arc<SessionService>,
    pub verifier: TokenVerifier,
    /// Directory holding the redb files, reported by the health check.
    pub data_dir: Option<PathBuf>,
}

impl AppState {
    pub fn new(accounts: Arc<AccountService>, sessions: Arc<SessionService>, verifier: TokenVerifier) -> Self {
        Self {
            accounts,
            sessions,
            verifier,
            data_dir: None,
        }
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(data_dir.into());
        self
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        self.accounts.store()
    }
}
