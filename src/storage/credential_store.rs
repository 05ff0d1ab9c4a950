// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Credential store backed by redb.
//!
//! ## Table Layout
//!
//! - `principals`: principal id → serialized Principal
//! - `identifier_index`: identifier → principal id
//! - `social_index`: `provider|subject` → principal id
//! - `outbox`: `principal_id|revision` → serialized OutboxEntry (see `outbox.rs`)
//! - `refresh_tokens` and its indexes (see `refresh_tokens.rs`)
//! - `action_tokens` and its expiry index (see `action_tokens.rs`)
//!
//! Reads run in MVCC read transactions and never block on writers, so login
//! throughput is unaffected by concurrent mutations.

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use uuid::Uuid;

use super::action_tokens::{self, ActionPurpose};
use super::outbox::{stage_event, OutboxEntry, OUTBOX};
use super::principal::{normalize_identifier, social_link_key, AuthMaterial, NewPrincipal, Principal};
use super::refresh_tokens;
use super::{StoreError, StoreResult};
use crate::propagation::IdentityChangeEvent;

// =============================================================================
// Table Definitions
// =============================================================================

const PRINCIPALS: TableDefinition<&str, &[u8]> = TableDefinition::new("principals");

const IDENTIFIER_INDEX: TableDefinition<&str, &str> = TableDefinition::new("identifier_index");

const SOCIAL_INDEX: TableDefinition<&str, &str> = TableDefinition::new("social_index");

/// Staged events younger than this are left to the inline publisher.
const DEFAULT_PENDING_GRACE_SECS: i64 = 60;

/// Result of a committed mutation: the new state and the event staged for it.
#[derive(Debug, Clone)]
pub struct MutationReceipt {
    pub principal: Principal,
    pub event: IdentityChangeEvent,
}

/// Durable store of principals and their pending identity events.
pub struct CredentialStore {
    pub(super) db: Database,
    pending_grace: Duration,
}

impl CredentialStore {
    /// Open (or create) the store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Pre-create all tables so later read transactions don't fail
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(PRINCIPALS)?;
            let _ = write_txn.open_table(IDENTIFIER_INDEX)?;
            let _ = write_txn.open_table(SOCIAL_INDEX)?;
            let _ = write_txn.open_table(OUTBOX)?;
        }
        refresh_tokens::create_tables(&write_txn)?;
        action_tokens::create_tables(&write_txn)?;
        write_txn.commit()?;

        Ok(Self {
            db,
            pending_grace: Duration::seconds(DEFAULT_PENDING_GRACE_SECS),
        })
    }

    /// How long a freshly staged event is left alone by the outbox sweeper.
    pub fn with_pending_grace(mut self, grace: Duration) -> Self {
        self.pending_grace = grace;
        self
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Look up a principal by id. Tombstoned principals are returned as-is.
    pub fn get(&self, id: &str) -> StoreResult<Option<Principal>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PRINCIPALS)?;
        match table.get(id)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Look up a live principal by login identifier (normalized here).
    pub fn find_by_identifier(&self, identifier: &str) -> StoreResult<Option<Principal>> {
        let normalized = normalize_identifier(identifier);
        self.find_through_index(IDENTIFIER_INDEX, &normalized)
    }

    /// Look up a live principal by linked social identity.
    pub fn find_by_social(&self, provider: &str, subject: &str) -> StoreResult<Option<Principal>> {
        self.find_through_index(SOCIAL_INDEX, &social_link_key(provider, subject))
    }

    fn find_through_index(
        &self,
        index: TableDefinition<'static, &'static str, &'static str>,
        key: &str,
    ) -> StoreResult<Option<Principal>> {
        let read_txn = self.db.begin_read()?;
        let index_table = read_txn.open_table(index)?;
        let id = match index_table.get(key)? {
            Some(value) => value.value().to_string(),
            None => return Ok(None),
        };
        let principals = read_txn.open_table(PRINCIPALS)?;
        match principals.get(id.as_str())? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Number of principal records, tombstones included.
    pub fn count(&self) -> StoreResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PRINCIPALS)?;
        Ok(table.len()?)
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Create a principal at revision 1 and stage its creation event.
    ///
    /// Password identifiers are normalized. Social identifiers are kept
    /// verbatim since provider subjects are case-sensitive.
    pub fn create(&self, new: NewPrincipal, now: DateTime<Utc>) -> StoreResult<MutationReceipt> {
        let identifier = match &new.auth {
            AuthMaterial::Password { .. } => normalize_identifier(&new.identifier),
            AuthMaterial::Social { .. } => new.identifier,
        };
        let principal = Principal {
            id: Uuid::new_v4().to_string(),
            identifier,
            display_name: new.display_name,
            role: new.role,
            state: new.state,
            auth: new.auth,
            revision: 1,
            created_at: now,
            updated_at: now,
        };
        let event = IdentityChangeEvent::from_principal(&principal, now);
        let json = serde_json::to_vec(&principal)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut identifiers = write_txn.open_table(IDENTIFIER_INDEX)?;
            if identifiers.get(principal.identifier.as_str())?.is_some() {
                return Err(StoreError::IdentifierTaken(principal.identifier));
            }
            identifiers.insert(principal.identifier.as_str(), principal.id.as_str())?;

            if let AuthMaterial::Social { provider, subject } = &principal.auth {
                let link = social_link_key(provider, subject);
                let mut socials = write_txn.open_table(SOCIAL_INDEX)?;
                if socials.get(link.as_str())?.is_some() {
                    return Err(StoreError::SocialLinkTaken(link));
                }
                socials.insert(link.as_str(), principal.id.as_str())?;
            }

            let mut principals = write_txn.open_table(PRINCIPALS)?;
            principals.insert(principal.id.as_str(), json.as_slice())?;

            stage_event(&write_txn, &OutboxEntry::pending(event.clone(), now, self.pending_grace))?;
        }
        write_txn.commit()?;

        Ok(MutationReceipt { principal, event })
    }

    /// Apply `change` to a live principal, bump its revision and stage the event.
    ///
    /// Read, change, revision bump and outbox write share one write transaction;
    /// if `change` fails nothing is written. Id, identifier and creation time
    /// are immutable. Setting the state to `Deleted` releases the identifier
    /// and social link while the record stays as a tombstone.
    pub fn mutate<F, E>(&self, id: &str, now: DateTime<Utc>, change: F) -> Result<MutationReceipt, E>
    where
        F: FnOnce(&mut Principal) -> Result<(), E>,
        E: From<StoreError>,
    {
        let write_txn = self.db.begin_write().map_err(StoreError::from)?;
        let receipt = self.apply_mutation(&write_txn, id, now, change)?;
        write_txn.commit().map_err(StoreError::from)?;
        Ok(receipt)
    }

    /// Consume a one-time action token and apply `change` to its principal.
    ///
    /// The token is removed in the same transaction as the mutation, so a
    /// token redeems at most once and a failed `change` leaves it usable.
    pub fn redeem_and_mutate<F, E>(
        &self,
        token_hash: &str,
        purpose: ActionPurpose,
        now: DateTime<Utc>,
        change: F,
    ) -> Result<MutationReceipt, E>
    where
        F: FnOnce(&mut Principal) -> Result<(), E>,
        E: From<StoreError>,
    {
        let write_txn = self.db.begin_write().map_err(StoreError::from)?;
        let record = action_tokens::take_live(&write_txn, token_hash, purpose, now)?;
        let receipt = self.apply_mutation(&write_txn, &record.principal_id, now, change)?;
        write_txn.commit().map_err(StoreError::from)?;
        Ok(receipt)
    }

    fn apply_mutation<F, E>(
        &self,
        write_txn: &redb::WriteTransaction,
        id: &str,
        now: DateTime<Utc>,
        change: F,
    ) -> Result<MutationReceipt, E>
    where
        F: FnOnce(&mut Principal) -> Result<(), E>,
        E: From<StoreError>,
    {
        let mut principals = write_txn.open_table(PRINCIPALS).map_err(StoreError::from)?;
        let bytes = principals
            .get(id)
            .map_err(StoreError::from)?
            .map(|value| value.value().to_vec())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let before: Principal = serde_json::from_slice(&bytes).map_err(StoreError::from)?;
        if before.state.is_terminal() {
            return Err(StoreError::NotFound(id.to_string()).into());
        }

        let mut principal = before.clone();
        change(&mut principal)?;
        principal.id = before.id.clone();
        principal.identifier = before.identifier.clone();
        principal.created_at = before.created_at;
        principal.revision = before.revision + 1;
        principal.updated_at = now;

        if principal.state.is_terminal() {
            self.release_indexes(write_txn, &before)?;
        }

        let json = serde_json::to_vec(&principal).map_err(StoreError::from)?;
        principals
            .insert(principal.id.as_str(), json.as_slice())
            .map_err(StoreError::from)?;

        let event = IdentityChangeEvent::from_principal(&principal, now);
        stage_event(write_txn, &OutboxEntry::pending(event.clone(), now, self.pending_grace))?;
        Ok(MutationReceipt { principal, event })
    }

    fn release_indexes(&self, write_txn: &redb::WriteTransaction, principal: &Principal) -> StoreResult<()> {
        let mut identifiers = write_txn.open_table(IDENTIFIER_INDEX)?;
        identifiers.remove(principal.identifier.as_str())?;
        if let AuthMaterial::Social { provider, subject } = &principal.auth {
            let mut socials = write_txn.open_table(SOCIAL_INDEX)?;
            socials.remove(social_link_key(provider, subject).as_str())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::storage::AccountState;
    use tempfile::TempDir;

    fn temp_store() -> (CredentialStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::open(&dir.path().join("credentials.redb")).unwrap();
        (store, dir)
    }

    fn alice() -> NewPrincipal {
        NewPrincipal {
            identifier: "Alice@Example.org".to_string(),
            display_name: "Alice".to_string(),
            role: Role::Patient,
            state: AccountState::Active,
            auth: AuthMaterial::Password {
                hash: "$argon2id$placeholder".to_string(),
            },
        }
    }

    #[test]
    fn create_assigns_revision_one_and_stages_event() {
        let (store, _dir) = temp_store();
        let receipt = store.create(alice(), Utc::now()).unwrap();

        assert_eq!(receipt.principal.revision, 1);
        assert_eq!(receipt.principal.identifier, "alice@example.org");
        assert_eq!(receipt.event.revision, 1);
        assert_eq!(receipt.event.principal_id, receipt.principal.id);
        assert_eq!(store.outbox_len().unwrap(), 1);
    }

    #[test]
    fn create_rejects_duplicate_identifier() {
        let (store, _dir) = temp_store();
        store.create(alice(), Utc::now()).unwrap();

        let err = store.create(alice(), Utc::now()).unwrap_err();
        assert!(matches!(err, StoreError::IdentifierTaken(_)));
        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(store.outbox_len().unwrap(), 1);
    }

    #[test]
    fn lookups_by_identifier_and_social_link() {
        let (store, _dir) = temp_store();
        let created = store.create(alice(), Utc::now()).unwrap().principal;
        let found = store.find_by_identifier("  ALICE@example.org").unwrap().unwrap();
        assert_eq!(found.id, created.id);

        let social = NewPrincipal {
            identifier: "google:42".to_string(),
            display_name: "Bob".to_string(),
            role: Role::Patient,
            state: AccountState::Active,
            auth: AuthMaterial::Social {
                provider: "google".to_string(),
                subject: "42".to_string(),
            },
        };
        let bob = store.create(social, Utc::now()).unwrap().principal;
        assert_eq!(store.find_by_social("google", "42").unwrap().unwrap().id, bob.id);
        assert!(store.find_by_social("google", "43").unwrap().is_none());
    }

    #[test]
    fn social_identifiers_differing_in_case_are_distinct_principals() {
        let (store, _dir) = temp_store();
        let social = |subject: &str| NewPrincipal {
            identifier: format!("google:{subject}"),
            display_name: subject.to_string(),
            role: Role::Patient,
            state: AccountState::Active,
            auth: AuthMaterial::Social {
                provider: "google".to_string(),
                subject: subject.to_string(),
            },
        };

        let upper = store.create(social("AbC"), Utc::now()).unwrap().principal;
        let lower = store.create(social("abc"), Utc::now()).unwrap().principal;

        assert_ne!(upper.id, lower.id);
        assert_eq!(upper.identifier, "google:AbC");
        assert_eq!(lower.identifier, "google:abc");
        assert_eq!(store.find_by_social("google", "AbC").unwrap().unwrap().id, upper.id);
        assert_eq!(store.find_by_social("google", "abc").unwrap().unwrap().id, lower.id);
    }

    #[test]
    fn mutate_bumps_revision_and_keeps_immutable_fields() {
        let (store, _dir) = temp_store();
        let created = store.create(alice(), Utc::now()).unwrap().principal;

        let receipt = store
            .mutate::<_, StoreError>(&created.id, Utc::now(), |p| {
                p.display_name = "Alice A.".to_string();
                p.identifier = "mallory@example.org".to_string();
                Ok(())
            })
            .unwrap();

        assert_eq!(receipt.principal.revision, 2);
        assert_eq!(receipt.principal.identifier, "alice@example.org");
        assert_eq!(receipt.event.snapshot.display_name, "Alice A.");
        assert_eq!(store.get(&created.id).unwrap().unwrap().revision, 2);
        assert_eq!(store.outbox_len().unwrap(), 2);
    }

    #[test]
    fn failed_change_writes_nothing() {
        let (store, _dir) = temp_store();
        let created = store.create(alice(), Utc::now()).unwrap().principal;

        let result = store.mutate(&created.id, Utc::now(), |p| {
            p.display_name = "changed".to_string();
            Err(StoreError::NotFound("refused".to_string()))
        });
        assert!(result.is_err());

        let stored = store.get(&created.id).unwrap().unwrap();
        assert_eq!(stored.revision, 1);
        assert_eq!(stored.display_name, "Alice");
        assert_eq!(store.outbox_len().unwrap(), 1);
    }

    #[test]
    fn deletion_releases_identifier_and_freezes_record() {
        let (store, _dir) = temp_store();
        let created = store.create(alice(), Utc::now()).unwrap().principal;

        let receipt = store
            .mutate::<_, StoreError>(&created.id, Utc::now(), |p| {
                p.state = AccountState::Deleted;
                Ok(())
            })
            .unwrap();
        assert!(receipt.event.is_tombstone());
        assert_eq!(receipt.event.revision, 2);

        assert!(store.find_by_identifier("alice@example.org").unwrap().is_none());
        let err = store
            .mutate::<_, StoreError>(&created.id, Utc::now(), |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        // Identifier can be registered again by a new principal
        let again = store.create(alice(), Utc::now()).unwrap().principal;
        assert_ne!(again.id, created.id);
    }

    #[test]
    fn mutate_unknown_principal_is_not_found() {
        let (store, _dir) = temp_store();
        let err = store
            .mutate::<_, StoreError>("nope", Utc::now(), |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
