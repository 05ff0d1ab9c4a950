// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Account Service
//!
//! Every identity-relevant mutation goes through here:
//!
//! 1. Take the per-principal lock.
//! 2. Commit the change, revision bump and outbox entry in one transaction.
//! 3. Publish the staged event (inline, with backoff; outbox on failure).
//! 4. Release the lock.
//!
//! Holding the lock through publication keeps one principal's events in
//! revision order on the exchange. Publication never fails the mutation.
//!
//! ## Self-Service Flows
//!
//! Registration mails a one-time verification token; presenting it moves
//! the account to `Active`. Password reset works the same way with a
//! shorter-lived token. Requests for either never reveal whether the
//! identifier exists.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use ring::rand::SystemRandom;
use tracing::{info, warn};

use crate::auth::password::{PasswordService, PolicyViolation};
use crate::auth::refresh::{hash_token, random_token};
use crate::auth::social::SocialIdentity;
use crate::auth::Role;
use crate::notify::{AccountNotification, DisabledNotifier, NotificationKind, Notifier};
use crate::propagation::IdentityChangePublisher;
use crate::storage::{
    normalize_identifier, run_blocking, social_identifier, AccountState, ActionPurpose, ActionTokenRecord,
    AuthMaterial, CredentialStore, MutationReceipt, NewPrincipal, Principal, PrincipalLocks, StoreError,
};

const MAX_DISPLAY_NAME_CHARS: usize = 150;

const DEFAULT_VERIFICATION_LIFETIME_SECS: i64 = 86_400;
const DEFAULT_RESET_LIFETIME_SECS: i64 = 3_600;

#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("identifier already registered")]
    IdentifierTaken,

    #[error("identifier must be an e-mail address")]
    InvalidIdentifier,

    #[error("display name must be 1 to 150 characters")]
    InvalidDisplayName,

    #[error(transparent)]
    WeakPassword(#[from] PolicyViolation),

    #[error("principal not found")]
    NotFound,

    #[error("cannot move account from {from:?} to {to:?}")]
    InvalidTransition { from: AccountState, to: AccountState },

    #[error("invalid or expired token")]
    InvalidToken,

    #[error("password hashing failed: {0}")]
    Hashing(String),

    #[error("token issuance failed: {0}")]
    TokenIssuance(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for AccountError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => AccountError::NotFound,
            StoreError::IdentifierTaken(_) => AccountError::IdentifierTaken,
            StoreError::ActionTokenInvalid => AccountError::InvalidToken,
            other => AccountError::Store(other),
        }
    }
}

pub struct AccountService {
    store: Arc<CredentialStore>,
    publisher: Arc<IdentityChangePublisher>,
    passwords: Arc<PasswordService>,
    locks: PrincipalLocks,
    notifier: Arc<dyn Notifier>,
    rng: SystemRandom,
    verification_lifetime: Duration,
    reset_lifetime: Duration,
}

impl AccountService {
    pub fn new(
        store: Arc<CredentialStore>,
        publisher: Arc<IdentityChangePublisher>,
        passwords: Arc<PasswordService>,
        locks: PrincipalLocks,
    ) -> Self {
        Self {
            store,
            publisher,
            passwords,
            locks,
            notifier: Arc::new(DisabledNotifier),
            rng: SystemRandom::new(),
            verification_lifetime: Duration::seconds(DEFAULT_VERIFICATION_LIFETIME_SECS),
            reset_lifetime: Duration::seconds(DEFAULT_RESET_LIFETIME_SECS),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Lifetimes of verification and password reset tokens.
    pub fn with_action_token_lifetimes(mut self, verification: Duration, reset: Duration) -> Self {
        self.verification_lifetime = verification;
        self.reset_lifetime = reset;
        self
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub async fn get(&self, principal_id: &str) -> Result<Principal, AccountError> {
        let store = Arc::clone(&self.store);
        let id = principal_id.to_string();
        run_blocking(move || store.get(&id))
            .await?
            .filter(|p| !p.state.is_terminal())
            .ok_or(AccountError::NotFound)
    }

    /// Create a password principal awaiting verification and mail its token.
    pub async fn register(
        &self,
        identifier: &str,
        display_name: &str,
        password: &str,
        role: Role,
    ) -> Result<Principal, AccountError> {
        let principal = self
            .create_password_principal(identifier, display_name, password, role, AccountState::PendingVerification)
            .await?;
        self.send_action_token(&principal, ActionPurpose::EmailVerification).await;
        Ok(principal)
    }

    /// Create the first administrator unless the identifier is already taken.
    ///
    /// Returns `None` when an account with that identifier exists.
    pub async fn bootstrap_admin(
        &self,
        identifier: &str,
        display_name: &str,
        password: &str,
    ) -> Result<Option<Principal>, AccountError> {
        if self.find_by_identifier(identifier).await?.is_some() {
            return Ok(None);
        }
        match self
            .create_password_principal(identifier, display_name, password, Role::Admin, AccountState::Active)
            .await
        {
            Ok(principal) => {
                info!(principal_id = %principal.id, "Bootstrap administrator created");
                Ok(Some(principal))
            }
            Err(AccountError::IdentifierTaken) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// `PendingVerification → Active`.
    pub async fn verify_account(&self, principal_id: &str) -> Result<Principal, AccountError> {
        self.mutate(principal_id, activate).await
    }

    /// Mail a fresh verification token if the identifier awaits verification.
    ///
    /// Succeeds whether or not anything was sent.
    pub async fn request_verification(&self, identifier: &str) -> Result<(), AccountError> {
        match self.find_by_identifier(identifier).await? {
            Some(principal)
                if principal.state == AccountState::PendingVerification
                    && matches!(principal.auth, AuthMaterial::Password { .. }) =>
            {
                self.send_action_token(&principal, ActionPurpose::EmailVerification).await;
            }
            _ => {}
        }
        Ok(())
    }

    /// Redeem a verification token. The token is consumed with the transition.
    pub async fn confirm_verification(&self, token: &str) -> Result<Principal, AccountError> {
        self.redeem(token, ActionPurpose::EmailVerification, activate).await
    }

    /// Mail a password reset token to an active or unverified password account.
    ///
    /// Succeeds whether or not anything was sent.
    pub async fn request_password_reset(&self, identifier: &str) -> Result<(), AccountError> {
        match self.find_by_identifier(identifier).await? {
            Some(principal)
                if matches!(principal.state, AccountState::Active | AccountState::PendingVerification)
                    && matches!(principal.auth, AuthMaterial::Password { .. }) =>
            {
                self.send_action_token(&principal, ActionPurpose::PasswordReset).await;
            }
            _ => {}
        }
        Ok(())
    }

    /// Whether `token` would currently be accepted by [`Self::reset_password`].
    pub async fn check_password_reset_token(&self, token: &str) -> Result<bool, AccountError> {
        Ok(self.peek(token, ActionPurpose::PasswordReset).await?.is_some())
    }

    /// Set a new password with a reset token and end every session of the account.
    pub async fn reset_password(&self, token: &str, new_password: &str) -> Result<Principal, AccountError> {
        self.passwords.policy().validate(new_password)?;
        if self.peek(token, ActionPurpose::PasswordReset).await?.is_none() {
            return Err(AccountError::InvalidToken);
        }
        let hash = self.hash_password(new_password).await?;

        let principal = self
            .redeem(token, ActionPurpose::PasswordReset, move |principal| match &mut principal.auth {
                AuthMaterial::Password { hash: current } => {
                    *current = hash;
                    Ok(())
                }
                AuthMaterial::Social { .. } => Err(AccountError::InvalidToken),
            })
            .await?;

        let store = Arc::clone(&self.store);
        let principal_id = principal.id.clone();
        let revoked = run_blocking(move || store.revoke_principal_refresh_tokens(&principal_id)).await?;
        info!(principal_id = %principal.id, revoked_sessions = revoked, "Password reset");
        Ok(principal)
    }

    pub async fn update_display_name(&self, principal_id: &str, display_name: &str) -> Result<Principal, AccountError> {
        let display_name = validate_display_name(display_name)?;
        self.mutate(principal_id, move |principal| {
            principal.display_name = display_name;
            Ok(())
        })
        .await
    }

    /// Administrative state change. Deletion has its own operation.
    pub async fn set_account_state(&self, principal_id: &str, state: AccountState) -> Result<Principal, AccountError> {
        self.mutate(principal_id, move |principal| {
            if state.is_terminal() || principal.state == state {
                return Err(AccountError::InvalidTransition {
                    from: principal.state,
                    to: state,
                });
            }
            principal.state = state;
            Ok(())
        })
        .await
    }

    /// Tombstone the principal. Identifier and social link become free again.
    pub async fn delete_principal(&self, principal_id: &str) -> Result<Principal, AccountError> {
        let principal = self
            .mutate(principal_id, |principal| {
                principal.state = AccountState::Deleted;
                principal.display_name.clear();
                Ok(())
            })
            .await?;
        info!(principal_id = %principal.id, revision = principal.revision, "Principal deleted");
        Ok(principal)
    }

    /// Principal linked to a social identity, provisioned on first login.
    ///
    /// Returns `true` alongside when the principal was created by this call.
    /// The creation is committed and its event published before returning.
    pub async fn provision_social(&self, identity: &SocialIdentity) -> Result<(Principal, bool), AccountError> {
        let _guard = self
            .locks
            .acquire(&format!("social:{}:{}", identity.provider, identity.subject))
            .await;

        let store = Arc::clone(&self.store);
        let (provider, subject) = (identity.provider.clone(), identity.subject.clone());
        if let Some(existing) = run_blocking(move || store.find_by_social(&provider, &subject)).await? {
            return Ok((existing, false));
        }

        let display_name = identity
            .display_name
            .clone()
            .or_else(|| identity.email.clone())
            .unwrap_or_else(|| identity.subject.clone());
        let new = NewPrincipal {
            identifier: social_identifier(&identity.provider, &identity.subject),
            display_name: display_name.chars().take(MAX_DISPLAY_NAME_CHARS).collect(),
            role: Role::default(),
            state: AccountState::Active,
            auth: AuthMaterial::Social {
                provider: identity.provider.clone(),
                subject: identity.subject.clone(),
            },
        };
        let store = Arc::clone(&self.store);
        let receipt = run_blocking(move || store.create(new, Utc::now())).await?;
        info!(
            principal_id = %receipt.principal.id,
            provider = %identity.provider,
            "Principal provisioned from social login"
        );
        Ok((self.publish(receipt).await, true))
    }

    async fn create_password_principal(
        &self,
        identifier: &str,
        display_name: &str,
        password: &str,
        role: Role,
        state: AccountState,
    ) -> Result<Principal, AccountError> {
        let identifier = normalize_identifier(identifier);
        if !looks_like_email(&identifier) {
            return Err(AccountError::InvalidIdentifier);
        }
        let display_name = validate_display_name(display_name)?;
        self.passwords.policy().validate(password)?;

        let hash = self.hash_password(password).await?;

        let _guard = self.locks.acquire(&format!("identifier:{identifier}")).await;
        let new = NewPrincipal {
            identifier,
            display_name,
            role,
            state,
            auth: AuthMaterial::Password { hash },
        };
        let store = Arc::clone(&self.store);
        let receipt = run_blocking(move || store.create(new, Utc::now())).await?;
        info!(principal_id = %receipt.principal.id, role = ?receipt.principal.role, "Principal registered");
        Ok(self.publish(receipt).await)
    }

    async fn find_by_identifier(&self, identifier: &str) -> Result<Option<Principal>, AccountError> {
        let store = Arc::clone(&self.store);
        let identifier = identifier.to_string();
        Ok(run_blocking(move || store.find_by_identifier(&identifier)).await?)
    }

    async fn mutate<F>(&self, principal_id: &str, change: F) -> Result<Principal, AccountError>
    where
        F: FnOnce(&mut Principal) -> Result<(), AccountError> + Send + 'static,
    {
        let _guard = self.locks.acquire(principal_id).await;
        let store = Arc::clone(&self.store);
        let id = principal_id.to_string();
        let receipt = run_blocking(move || store.mutate(&id, Utc::now(), change)).await?;
        Ok(self.publish(receipt).await)
    }

    async fn peek(&self, token: &str, purpose: ActionPurpose) -> Result<Option<ActionTokenRecord>, AccountError> {
        let store = Arc::clone(&self.store);
        let token_hash = hash_token(token);
        Ok(run_blocking(move || store.peek_action_token(&token_hash, purpose, Utc::now())).await?)
    }

    /// Consume an action token and apply `change` under the principal's lock.
    async fn redeem<F>(&self, token: &str, purpose: ActionPurpose, change: F) -> Result<Principal, AccountError>
    where
        F: FnOnce(&mut Principal) -> Result<(), AccountError> + Send + 'static,
    {
        let record = self.peek(token, purpose).await?.ok_or(AccountError::InvalidToken)?;
        let _guard = self.locks.acquire(&record.principal_id).await;
        let store = Arc::clone(&self.store);
        let token_hash = hash_token(token);
        let receipt = run_blocking(move || store.redeem_and_mutate(&token_hash, purpose, Utc::now(), change)).await?;
        Ok(self.publish(receipt).await)
    }

    async fn publish(&self, receipt: MutationReceipt) -> Principal {
        self.publisher.on_principal_mutated(&receipt.event).await;
        receipt.principal
    }

    /// Issue an action token and hand it to the notifier. Failures are logged;
    /// the caller's operation has already succeeded.
    async fn send_action_token(&self, principal: &Principal, purpose: ActionPurpose) {
        let notification = match self.issue_action_token(principal, purpose, Utc::now()).await {
            Ok(notification) => notification,
            Err(e) => {
                warn!(principal_id = %principal.id, ?purpose, error = %e, "Failed to issue action token");
                return;
            }
        };
        if let Err(e) = self.notifier.send(notification).await {
            warn!(principal_id = %principal.id, ?purpose, error = %e, "Failed to send account e-mail");
        }
    }

    async fn issue_action_token(
        &self,
        principal: &Principal,
        purpose: ActionPurpose,
        now: DateTime<Utc>,
    ) -> Result<AccountNotification, AccountError> {
        let (lifetime, kind) = match purpose {
            ActionPurpose::EmailVerification => (self.verification_lifetime, NotificationKind::VerifyEmail),
            ActionPurpose::PasswordReset => (self.reset_lifetime, NotificationKind::PasswordReset),
        };
        let token = random_token(&self.rng).map_err(|e| AccountError::TokenIssuance(e.to_string()))?;
        let expires_at = now
            .checked_add_signed(lifetime)
            .ok_or_else(|| AccountError::TokenIssuance("token lifetime out of range".to_string()))?;

        let record = ActionTokenRecord {
            token_hash: hash_token(&token),
            principal_id: principal.id.clone(),
            purpose,
            issued_at: now,
            expires_at,
        };
        let store = Arc::clone(&self.store);
        run_blocking(move || store.put_action_token(&record)).await?;

        Ok(AccountNotification {
            kind,
            principal_id: principal.id.clone(),
            recipient: principal.identifier.clone(),
            display_name: principal.display_name.clone(),
            token,
            expires_at,
        })
    }

    async fn hash_password(&self, password: &str) -> Result<String, AccountError> {
        let passwords = Arc::clone(&self.passwords);
        let password = password.to_string();
        tokio::task::spawn_blocking(move || passwords.hash_password(&password))
            .await
            .map_err(|e| AccountError::Hashing(e.to_string()))?
            .map_err(|e| AccountError::Hashing(e.to_string()))
    }
}

fn activate(principal: &mut Principal) -> Result<(), AccountError> {
    match principal.state {
        AccountState::PendingVerification => {
            principal.state = AccountState::Active;
            Ok(())
        }
        from => Err(AccountError::InvalidTransition {
            from,
            to: AccountState::Active,
        }),
    }
}

fn looks_like_email(identifier: &str) -> bool {
    match identifier.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.starts_with('.'),
        None => false,
    }
}

fn validate_display_name(raw: &str) -> Result<String, AccountError> {
    let trimmed = raw.trim();
    let length = trimmed.chars().count();
    if length == 0 || length > MAX_DISPLAY_NAME_CHARS {
        return Err(AccountError::InvalidDisplayName);
    }
    Ok(trimmed.to_string())
}
