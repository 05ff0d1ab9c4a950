// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Refresh token records.
//!
//! Only the SHA-256 of a refresh token is stored. Tokens issued from one
//! login share a `family_id`; presenting an already-rotated token revokes
//! the whole family.
//!
//! ## Table Layout
//!
//! - `refresh_tokens`: sha256(token) → serialized RefreshTokenRecord
//! - `refresh_families`: family id ⇒ token hashes (multimap)
//! - `refresh_principals`: principal id ⇒ token hashes (multimap)
//! - `refresh_expiry`: `{expires_at:020}|{hash}` → hash, for pruning
//!
//! Records stay until they expire, revoked or not, so a replayed token is
//! still recognised as reuse. [`CredentialStore::prune_refresh_tokens`]
//! removes them afterwards.

use chrono::{DateTime, Utc};
use redb::{
    MultimapTableDefinition, ReadableDatabase, ReadableMultimapTable, ReadableTable, ReadableTableMetadata,
    TableDefinition, WriteTransaction,
};
use serde::{Deserialize, Serialize};

use super::credential_store::CredentialStore;
use super::StoreResult;

const REFRESH_TOKENS: TableDefinition<&str, &[u8]> = TableDefinition::new("refresh_tokens");

const REFRESH_FAMILIES: MultimapTableDefinition<&str, &str> = MultimapTableDefinition::new("refresh_families");

const REFRESH_PRINCIPALS: MultimapTableDefinition<&str, &str> = MultimapTableDefinition::new("refresh_principals");

const REFRESH_EXPIRY: TableDefinition<&str, &str> = TableDefinition::new("refresh_expiry");

pub(super) fn create_tables(write_txn: &WriteTransaction) -> StoreResult<()> {
    let _ = write_txn.open_table(REFRESH_TOKENS)?;
    let _ = write_txn.open_multimap_table(REFRESH_FAMILIES)?;
    let _ = write_txn.open_multimap_table(REFRESH_PRINCIPALS)?;
    let _ = write_txn.open_table(REFRESH_EXPIRY)?;
    Ok(())
}

/// Sortable expiry key. Timestamps before the epoch clamp to zero.
pub(super) fn expiry_key(expires_at: DateTime<Utc>, token_hash: &str) -> String {
    format!("{:020}|{}", expires_at.timestamp().max(0), token_hash)
}

/// Upper bound covering every expiry key at or before `now`.
pub(super) fn expiry_cutoff(now: DateTime<Utc>) -> String {
    format!("{:020}|~", now.timestamp().max(0))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTokenRecord {
    pub token_hash: String,
    pub principal_id: String,
    pub family_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    /// Hash of the token that replaced this one on rotation.
    pub replaced_by: Option<String>,
}

/// Outcome of an atomic rotation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotateOutcome {
    /// The presented token was live; `previous` is its record before rotation.
    Rotated { previous: RefreshTokenRecord },
    Unknown,
    Expired,
    /// The token was already rotated or revoked. Its family is now revoked.
    Reused { family_id: String },
}

impl CredentialStore {
    pub fn put_refresh_token(&self, record: &RefreshTokenRecord) -> StoreResult<()> {
        let write_txn = self.db.begin_write()?;
        insert_record(&write_txn, record)?;
        write_txn.commit()?;
        Ok(())
    }

    pub fn get_refresh_token(&self, token_hash: &str) -> StoreResult<Option<RefreshTokenRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(REFRESH_TOKENS)?;
        match table.get(token_hash)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Number of stored refresh token records, revoked ones included.
    pub fn refresh_token_count(&self) -> StoreResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(REFRESH_TOKENS)?;
        Ok(table.len()?)
    }

    /// Replace `presented_hash` with `replacement` in one transaction.
    ///
    /// `replacement.family_id` is overwritten with the presented token's family.
    pub fn rotate_refresh_token(
        &self,
        presented_hash: &str,
        mut replacement: RefreshTokenRecord,
        now: DateTime<Utc>,
    ) -> StoreResult<RotateOutcome> {
        let write_txn = self.db.begin_write()?;
        let Some(mut record) = read_record(&write_txn, presented_hash)? else {
            return Ok(RotateOutcome::Unknown);
        };

        let outcome = if record.revoked || record.replaced_by.is_some() {
            let family_id = record.family_id.clone();
            revoke_family(&write_txn, &family_id)?;
            RotateOutcome::Reused { family_id }
        } else if record.expires_at <= now {
            RotateOutcome::Expired
        } else {
            let previous = record.clone();
            replacement.family_id = record.family_id.clone();
            replacement.principal_id = record.principal_id.clone();
            record.replaced_by = Some(replacement.token_hash.clone());

            write_record(&write_txn, &record)?;
            insert_record(&write_txn, &replacement)?;
            RotateOutcome::Rotated { previous }
        };
        write_txn.commit()?;
        Ok(outcome)
    }

    /// Revoke a single token. Returns whether it existed.
    pub fn revoke_refresh_token(&self, token_hash: &str) -> StoreResult<bool> {
        let write_txn = self.db.begin_write()?;
        let found = match read_record(&write_txn, token_hash)? {
            Some(mut record) => {
                record.revoked = true;
                write_record(&write_txn, &record)?;
                true
            }
            None => false,
        };
        write_txn.commit()?;
        Ok(found)
    }

    /// Revoke every refresh token held by a principal. Returns how many were live.
    pub fn revoke_principal_refresh_tokens(&self, principal_id: &str) -> StoreResult<usize> {
        let write_txn = self.db.begin_write()?;
        let hashes = index_members(&write_txn, REFRESH_PRINCIPALS, principal_id)?;
        let revoked = revoke_hashes(&write_txn, &hashes)?;
        write_txn.commit()?;
        Ok(revoked)
    }

    /// Delete records that expired at or before `now`, with their index entries.
    pub fn prune_refresh_tokens(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let write_txn = self.db.begin_write()?;
        let expired: Vec<(String, String)> = {
            let expiry = write_txn.open_table(REFRESH_EXPIRY)?;
            let cutoff = expiry_cutoff(now);
            let mut entries = Vec::new();
            for item in expiry.range::<&str>(..=cutoff.as_str())? {
                let (key, hash) = item?;
                entries.push((key.value().to_string(), hash.value().to_string()));
            }
            entries
        };

        let mut removed = 0;
        for (key, hash) in &expired {
            write_txn.open_table(REFRESH_EXPIRY)?.remove(key.as_str())?;
            let Some(record) = read_record(&write_txn, hash)? else {
                continue;
            };
            write_txn.open_table(REFRESH_TOKENS)?.remove(hash.as_str())?;
            write_txn
                .open_multimap_table(REFRESH_FAMILIES)?
                .remove(record.family_id.as_str(), hash.as_str())?;
            write_txn
                .open_multimap_table(REFRESH_PRINCIPALS)?
                .remove(record.principal_id.as_str(), hash.as_str())?;
            removed += 1;
        }
        write_txn.commit()?;
        Ok(removed)
    }
}

fn read_record(write_txn: &WriteTransaction, token_hash: &str) -> StoreResult<Option<RefreshTokenRecord>> {
    let table = write_txn.open_table(REFRESH_TOKENS)?;
    let bytes = table.get(token_hash)?.map(|value| value.value().to_vec());
    match bytes {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

fn write_record(write_txn: &WriteTransaction, record: &RefreshTokenRecord) -> StoreResult<()> {
    let json = serde_json::to_vec(record)?;
    let mut table = write_txn.open_table(REFRESH_TOKENS)?;
    table.insert(record.token_hash.as_str(), json.as_slice())?;
    Ok(())
}

/// Write a new record and its index entries.
fn insert_record(write_txn: &WriteTransaction, record: &RefreshTokenRecord) -> StoreResult<()> {
    write_record(write_txn, record)?;
    let hash = record.token_hash.as_str();
    write_txn
        .open_multimap_table(REFRESH_FAMILIES)?
        .insert(record.family_id.as_str(), hash)?;
    write_txn
        .open_multimap_table(REFRESH_PRINCIPALS)?
        .insert(record.principal_id.as_str(), hash)?;
    write_txn
        .open_table(REFRESH_EXPIRY)?
        .insert(expiry_key(record.expires_at, hash).as_str(), hash)?;
    Ok(())
}

fn index_members(
    write_txn: &WriteTransaction,
    index: MultimapTableDefinition<'static, &'static str, &'static str>,
    key: &str,
) -> StoreResult<Vec<String>> {
    let table = write_txn.open_multimap_table(index)?;
    let mut members = Vec::new();
    for item in table.get(key)? {
        members.push(item?.value().to_string());
    }
    Ok(members)
}

fn revoke_family(write_txn: &WriteTransaction, family_id: &str) -> StoreResult<usize> {
    let hashes = index_members(write_txn, REFRESH_FAMILIES, family_id)?;
    revoke_hashes(write_txn, &hashes)
}

fn revoke_hashes(write_txn: &WriteTransaction, hashes: &[String]) -> StoreResult<usize> {
    let mut revoked = 0;
    for hash in hashes {
        if let Some(mut record) = read_record(write_txn, hash)? {
            if !record.revoked {
                record.revoked = true;
                write_record(write_txn, &record)?;
                revoked += 1;
            }
        }
    }
    Ok(revoked)
}
