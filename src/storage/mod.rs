// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Storage Module
//!
//! Embedded ACID storage backed by redb (pure Rust).
//!
//! ## Databases
//!
//! ```text
//! $DATA_DIR/
//!   credentials.redb     # CredentialStore: principals, indexes, outbox, refresh and action tokens
//!   identity-cache.redb  # LocalIdentityCache (consumer side only)
//! ```
//!
//! Every identity-relevant mutation bumps the principal's revision and stages
//! the resulting event in the outbox inside the same write transaction.
//!
//! redb calls block on disk I/O and on the single-writer lock. Async callers
//! go through [`run_blocking`] so a slow commit never parks a runtime worker.

pub mod action_tokens;
pub mod credential_store;
pub mod identity_cache;
pub mod locks;
pub mod outbox;
pub mod principal;
pub mod refresh_tokens;

pub use action_tokens::{ActionPurpose, ActionTokenRecord};
pub use credential_store::{CredentialStore, MutationReceipt};
pub use identity_cache::{ApplyOutcome, LocalIdentityCache, LocalIdentityEntry};
pub use locks::{PrincipalGuard, PrincipalLocks};
pub use outbox::{OutboxEntry, OutboxStatus};
pub use principal::{normalize_identifier, social_identifier, AccountState, AuthMaterial, NewPrincipal, Principal};
pub use refresh_tokens::{RefreshTokenRecord, RotateOutcome};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("identifier already registered: {0}")]
    IdentifierTaken(String),

    #[error("social identity already linked: {0}")]
    SocialLinkTaken(String),

    #[error("action token is unknown, expired or already used")]
    ActionTokenInvalid,

    #[error("storage task failed: {0}")]
    Task(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Run a synchronous store operation on the blocking pool.
pub async fn run_blocking<T, E, F>(op: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: From<StoreError> + Send + 'static,
{
    match tokio::task::spawn_blocking(op).await {
        Ok(result) => result,
        Err(e) => Err(StoreError::Task(e.to_string()).into()),
    }
}
