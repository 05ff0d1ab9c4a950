// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Local identity cache for dependent services.
//!
//! A denormalized projection of principals, written only by the identity
//! change consumer. The revision guard and the write share one redb write
//! transaction, so concurrent workers cannot regress an entry. An LRU sits
//! in front for hot reads.
//!
//! ## Table Layout
//!
//! - `identity_cache`: principal id → serialized LocalIdentityEntry

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use lru::LruCache;
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};

use super::{AccountState, StoreResult};
use crate::auth::Role;
use crate::propagation::IdentityChangeEvent;

const IDENTITY_CACHE: TableDefinition<&str, &[u8]> = TableDefinition::new("identity_cache");

const DEFAULT_LRU_CAPACITY: usize = 4096;

/// Cached view of one principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalIdentityEntry {
    pub principal_id: String,
    pub display_name: String,
    pub account_state: AccountState,
    pub role: Role,
    pub last_applied_revision: u64,
    pub updated_at: DateTime<Utc>,
}

impl LocalIdentityEntry {
    fn from_event(event: &IdentityChangeEvent, now: DateTime<Utc>) -> Self {
        Self {
            principal_id: event.principal_id.clone(),
            display_name: event.snapshot.display_name.clone(),
            account_state: event.snapshot.account_state,
            role: event.snapshot.role,
            last_applied_revision: event.revision,
            updated_at: now,
        }
    }

    /// Tombstones stay cached so stale updates cannot resurrect the entry.
    pub fn is_tombstone(&self) -> bool {
        self.account_state == AccountState::Deleted
    }
}

/// What the revision guard decided for one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied { revision: u64 },
    /// `revision <= last_applied_revision`; nothing was written.
    Stale { last_applied_revision: u64 },
}

pub struct LocalIdentityCache {
    db: Database,
    hot: Mutex<LruCache<String, LocalIdentityEntry>>,
}

impl LocalIdentityCache {
    pub fn open(path: &Path) -> StoreResult<Self> {
        Self::open_with_capacity(path, DEFAULT_LRU_CAPACITY)
    }

    pub fn open_with_capacity(path: &Path, capacity: usize) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(IDENTITY_CACHE)?;
        }
        write_txn.commit()?;

        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            db,
            hot: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Apply `event` unless it is not newer than what is stored.
    ///
    /// Returns only after the write is committed.
    pub fn apply(&self, event: &IdentityChangeEvent, now: DateTime<Utc>) -> StoreResult<ApplyOutcome> {
        let write_txn = self.db.begin_write()?;
        let applied = {
            let mut table = write_txn.open_table(IDENTITY_CACHE)?;
            let existing = table
                .get(event.principal_id.as_str())?
                .map(|value| value.value().to_vec());
            if let Some(bytes) = existing {
                let current: LocalIdentityEntry = serde_json::from_slice(&bytes)?;
                if event.revision <= current.last_applied_revision {
                    return Ok(ApplyOutcome::Stale {
                        last_applied_revision: current.last_applied_revision,
                    });
                }
            }
            let entry = LocalIdentityEntry::from_event(event, now);
            let json = serde_json::to_vec(&entry)?;
            table.insert(entry.principal_id.as_str(), json.as_slice())?;
            entry
        };
        write_txn.commit()?;

        let revision = applied.last_applied_revision;
        self.remember(applied);
        Ok(ApplyOutcome::Applied { revision })
    }

    pub fn get(&self, principal_id: &str) -> StoreResult<Option<LocalIdentityEntry>> {
        if let Ok(mut hot) = self.hot.lock() {
            if let Some(entry) = hot.get(principal_id) {
                return Ok(Some(entry.clone()));
            }
        }

        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(IDENTITY_CACHE)?;
        let entry: Option<LocalIdentityEntry> = match table.get(principal_id)? {
            Some(value) => Some(serde_json::from_slice(value.value())?),
            None => None,
        };
        if let Some(entry) = &entry {
            self.remember(entry.clone());
        }
        Ok(entry)
    }

    pub fn len(&self) -> StoreResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(IDENTITY_CACHE)?;
        Ok(table.len()?)
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Workers commit concurrently, so never let an older revision replace a newer one.
    fn remember(&self, entry: LocalIdentityEntry) {
        if let Ok(mut hot) = self.hot.lock() {
            let newer = hot
                .peek(&entry.principal_id)
                .is_none_or(|cached| cached.last_applied_revision < entry.last_applied_revision);
            if newer {
                hot.put(entry.principal_id.clone(), entry);
            }
        }
    }
}
