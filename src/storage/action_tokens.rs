// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! One-time action tokens for e-mail verification and password reset.
//!
//! Like refresh tokens, only the SHA-256 of the token is stored. A token is
//! bound to one principal and one purpose and is deleted when redeemed (see
//! [`CredentialStore::redeem_and_mutate`]) or pruned after expiry.
//!
//! ## Table Layout
//!
//! - `action_tokens`: sha256(token) → serialized ActionTokenRecord
//! - `action_expiry`: `{expires_at:020}|{hash}` → hash

use chrono::{DateTime, Utc};
use redb::{ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};

use super::credential_store::CredentialStore;
use super::refresh_tokens::{expiry_cutoff, expiry_key};
use super::{StoreError, StoreResult};

const ACTION_TOKENS: TableDefinition<&str, &[u8]> = TableDefinition::new("action_tokens");

const ACTION_EXPIRY: TableDefinition<&str, &str> = TableDefinition::new("action_expiry");

pub(super) fn create_tables(write_txn: &WriteTransaction) -> StoreResult<()> {
    let _ = write_txn.open_table(ACTION_TOKENS)?;
    let _ = write_txn.open_table(ACTION_EXPIRY)?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionPurpose {
    EmailVerification,
    PasswordReset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionTokenRecord {
    pub token_hash: String,
    pub principal_id: String,
    pub purpose: ActionPurpose,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ActionTokenRecord {
    fn redeemable(&self, purpose: ActionPurpose, now: DateTime<Utc>) -> bool {
        self.purpose == purpose && self.expires_at > now
    }
}

impl CredentialStore {
    pub fn put_action_token(&self, record: &ActionTokenRecord) -> StoreResult<()> {
        let json = serde_json::to_vec(record)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut tokens = write_txn.open_table(ACTION_TOKENS)?;
            tokens.insert(record.token_hash.as_str(), json.as_slice())?;
            let mut expiry = write_txn.open_table(ACTION_EXPIRY)?;
            expiry.insert(
                expiry_key(record.expires_at, &record.token_hash).as_str(),
                record.token_hash.as_str(),
            )?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// The record behind `token_hash` if it is live and issued for `purpose`.
    pub fn peek_action_token(
        &self,
        token_hash: &str,
        purpose: ActionPurpose,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ActionTokenRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ACTION_TOKENS)?;
        let record: Option<ActionTokenRecord> = match table.get(token_hash)? {
            Some(value) => Some(serde_json::from_slice(value.value())?),
            None => None,
        };
        Ok(record.filter(|r| r.redeemable(purpose, now)))
    }

    /// Delete expired tokens. Returns how many were removed.
    pub fn prune_action_tokens(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut expiry = write_txn.open_table(ACTION_EXPIRY)?;
            let mut tokens = write_txn.open_table(ACTION_TOKENS)?;
            let cutoff = expiry_cutoff(now);
            let mut expired = Vec::new();
            for item in expiry.range::<&str>(..=cutoff.as_str())? {
                let (key, hash) = item?;
                expired.push((key.value().to_string(), hash.value().to_string()));
            }
            for (key, hash) in &expired {
                expiry.remove(key.as_str())?;
                tokens.remove(hash.as_str())?;
            }
            expired.len()
        };
        write_txn.commit()?;
        Ok(removed)
    }
}

/// Remove a live token inside an enclosing transaction and return its record.
///
/// Unknown, expired and wrong-purpose tokens all yield `ActionTokenInvalid`.
pub(super) fn take_live(
    write_txn: &WriteTransaction,
    token_hash: &str,
    purpose: ActionPurpose,
    now: DateTime<Utc>,
) -> StoreResult<ActionTokenRecord> {
    let mut tokens = write_txn.open_table(ACTION_TOKENS)?;
    let bytes = tokens
        .get(token_hash)?
        .map(|value| value.value().to_vec())
        .ok_or(StoreError::ActionTokenInvalid)?;
    let record: ActionTokenRecord = serde_json::from_slice(&bytes)?;
    if !record.redeemable(purpose, now) {
        return Err(StoreError::ActionTokenInvalid);
    }

    tokens.remove(token_hash)?;
    let mut expiry = write_txn.open_table(ACTION_EXPIRY)?;
    expiry.remove(expiry_key(record.expires_at, token_hash).as_str())?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::AccountState;
    use crate::testutil::{seed_principal, temp_store};
    use chrono::Duration;

    fn token(hash: &str, principal_id: &str, purpose: ActionPurpose, now: DateTime<Utc>) -> ActionTokenRecord {
        ActionTokenRecord {
            token_hash: hash.to_string(),
            principal_id: principal_id.to_string(),
            purpose,
            issued_at: now,
            expires_at: now + Duration::hours(1),
        }
    }

    #[test]
    fn peek_checks_purpose_and_expiry() {
        let (store, _dir) = temp_store();
        let now = Utc::now();
        store
            .put_action_token(&token("t1", "p-1", ActionPurpose::PasswordReset, now))
            .unwrap();

        assert!(store
            .peek_action_token("t1", ActionPurpose::PasswordReset, now)
            .unwrap()
            .is_some());
        assert!(store
            .peek_action_token("t1", ActionPurpose::EmailVerification, now)
            .unwrap()
            .is_none());
        assert!(store
            .peek_action_token("t1", ActionPurpose::PasswordReset, now + Duration::hours(2))
            .unwrap()
            .is_none());
    }

    #[test]
    fn redeeming_consumes_the_token_with_the_mutation() {
        let (store, _dir) = temp_store();
        let now = Utc::now();
        let principal = seed_principal(&store, "alice@example.org").principal;
        store
            .put_action_token(&token("t1", &principal.id, ActionPurpose::EmailVerification, now))
            .unwrap();

        let receipt = store
            .redeem_and_mutate::<_, StoreError>("t1", ActionPurpose::EmailVerification, now, |p| {
                p.state = AccountState::Locked;
                Ok(())
            })
            .unwrap();
        assert_eq!(receipt.principal.revision, 2);

        let again = store.redeem_and_mutate::<_, StoreError>("t1", ActionPurpose::EmailVerification, now, |_| Ok(()));
        assert!(matches!(again, Err(StoreError::ActionTokenInvalid)));
        assert_eq!(store.get(&principal.id).unwrap().unwrap().revision, 2);
    }

    #[test]
    fn failed_change_keeps_the_token() {
        let (store, _dir) = temp_store();
        let now = Utc::now();
        let principal = seed_principal(&store, "alice@example.org").principal;
        store
            .put_action_token(&token("t1", &principal.id, ActionPurpose::PasswordReset, now))
            .unwrap();

        let refused = store.redeem_and_mutate("t1", ActionPurpose::PasswordReset, now, |_| {
            Err(StoreError::NotFound("refused".to_string()))
        });
        assert!(refused.is_err());
        assert!(store
            .peek_action_token("t1", ActionPurpose::PasswordReset, now)
            .unwrap()
            .is_some());
    }

    #[test]
    fn wrong_purpose_does_not_redeem() {
        let (store, _dir) = temp_store();
        let now = Utc::now();
        let principal = seed_principal(&store, "alice@example.org").principal;
        store
            .put_action_token(&token("t1", &principal.id, ActionPurpose::EmailVerification, now))
            .unwrap();

        let result = store.redeem_and_mutate::<_, StoreError>("t1", ActionPurpose::PasswordReset, now, |_| Ok(()));
        assert!(matches!(result, Err(StoreError::ActionTokenInvalid)));
        assert_eq!(store.get(&principal.id).unwrap().unwrap().revision, 1);
    }

    #[test]
    fn pruning_drops_expired_tokens() {
        let (store, _dir) = temp_store();
        let now = Utc::now();
        store
            .put_action_token(&token("old", "p-1", ActionPurpose::PasswordReset, now - Duration::hours(3)))
            .unwrap();
        store
            .put_action_token(&token("fresh", "p-1", ActionPurpose::PasswordReset, now))
            .unwrap();

        assert_eq!(store.prune_action_tokens(now).unwrap(), 1);
        assert_eq!(store.prune_action_tokens(now).unwrap(), 0);
        assert!(store
            .peek_action_token("fresh", ActionPurpose::PasswordReset, now)
            .unwrap()
            .is_some());
    }
}
