// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Transactional outbox for identity change events.
//!
//! Events are staged in the same write transaction as the mutation that
//! produced them, so a committed mutation always has a deliverable event.
//! Entries leave the outbox only once the exchange has confirmed delivery.
//!
//! Keys are `principal_id|revision` with the revision zero-padded, so a
//! forward scan yields each principal's events in revision order.

use chrono::{DateTime, Duration, Utc};
use redb::{ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};

use super::credential_store::CredentialStore;
use super::StoreResult;
use crate::propagation::IdentityChangeEvent;

pub(super) const OUTBOX: TableDefinition<&str, &[u8]> = TableDefinition::new("outbox");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Staged with its mutation; the inline publisher has not given up yet.
    Pending,
    /// Inline delivery exhausted its retries; owned by the sweeper.
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub event: IdentityChangeEvent,
    pub status: OutboxStatus,
    /// Delivery attempts made so far, inline and swept.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// The sweeper ignores the entry until this instant.
    pub next_attempt_at: DateTime<Utc>,
}

impl OutboxEntry {
    pub fn pending(event: IdentityChangeEvent, now: DateTime<Utc>, grace: Duration) -> Self {
        Self {
            event,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: now,
            next_attempt_at: now + grace,
        }
    }

    pub fn key(&self) -> String {
        outbox_key(&self.event.principal_id, self.event.revision)
    }
}

pub fn outbox_key(principal_id: &str, revision: u64) -> String {
    format!("{principal_id}|{revision:020}")
}

/// Write `entry` as part of an enclosing mutation transaction.
pub(super) fn stage_event(write_txn: &WriteTransaction, entry: &OutboxEntry) -> StoreResult<()> {
    let json = serde_json::to_vec(entry)?;
    let mut table = write_txn.open_table(OUTBOX)?;
    table.insert(entry.key().as_str(), json.as_slice())?;
    Ok(())
}

impl CredentialStore {
    /// Entries whose `next_attempt_at` has passed, in key order.
    pub fn outbox_due(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<OutboxEntry>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(OUTBOX)?;

        let mut due = Vec::new();
        for item in table.iter()? {
            let (_, value) = item?;
            let entry: OutboxEntry = serde_json::from_slice(value.value())?;
            if entry.next_attempt_at <= now {
                due.push(entry);
                if due.len() >= limit {
                    break;
                }
            }
        }
        Ok(due)
    }

    pub fn outbox_get(&self, principal_id: &str, revision: u64) -> StoreResult<Option<OutboxEntry>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(OUTBOX)?;
        match table.get(outbox_key(principal_id, revision).as_str())? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Remove a delivered entry. Returns whether it was still present.
    pub fn outbox_complete(&self, principal_id: &str, revision: u64) -> StoreResult<bool> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(OUTBOX)?;
            let removed = table.remove(outbox_key(principal_id, revision).as_str())?.is_some();
            removed
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// Record failed attempts and hand the entry to the sweeper.
    ///
    /// A no-op when the entry was completed concurrently.
    pub fn outbox_defer(
        &self,
        principal_id: &str,
        revision: u64,
        attempts_made: u32,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let key = outbox_key(principal_id, revision);
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(OUTBOX)?;
            let existing = table.get(key.as_str())?.map(|value| value.value().to_vec());
            if let Some(bytes) = existing {
                let mut entry: OutboxEntry = serde_json::from_slice(&bytes)?;
                entry.status = OutboxStatus::Deferred;
                entry.attempts = entry.attempts.saturating_add(attempts_made);
                entry.last_error = Some(error.to_string());
                entry.next_attempt_at = next_attempt_at;
                let json = serde_json::to_vec(&entry)?;
                table.insert(key.as_str(), json.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Drop an entry that can never be delivered.
    pub fn outbox_discard(&self, principal_id: &str, revision: u64) -> StoreResult<bool> {
        self.outbox_complete(principal_id, revision)
    }

    pub fn outbox_len(&self) -> StoreResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(OUTBOX)?;
        Ok(table.len()?)
    }
}
