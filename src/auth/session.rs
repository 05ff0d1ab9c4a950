// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Session / Login Service
//!
//! Each login attempt walks a small state machine:
//!
//! ```text
//! Received → CredentialLookup → PasswordVerified        → TokenIssued
//!                             → SocialAssertionVerified → TokenIssued
//! (any non-terminal stage)    → Rejected
//! ```
//!
//! Tokens are only issued after any store mutation the login caused (social
//! first-login provisioning) has committed and its event has been handed to
//! the publisher.
//!
//! Password checks always run a full Argon2 verification, against a dummy
//! hash when the principal is unknown or signs in elsewhere, so timing does
//! not reveal which accounts exist.
//!
//! Store reads and writes run on the blocking pool. A login never waits on
//! a runtime worker that is busy committing someone else's mutation.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use ring::rand::SystemRandom;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::claims::{AccessToken, Claims};
use super::error::LoginError;
use super::password::PasswordService;
use super::refresh::{hash_token, mint};
use super::signer::TokenSigner;
use super::social::SocialAssertionVerifier;
use crate::accounts::{AccountError, AccountService};
use crate::storage::{
    normalize_identifier, run_blocking, AccountState, AuthMaterial, CredentialStore, Principal, RotateOutcome,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginStage {
    Received,
    CredentialLookup,
    PasswordVerified,
    SocialAssertionVerified,
    TokenIssued,
    Rejected,
}

impl LoginStage {
    pub fn can_advance_to(self, next: LoginStage) -> bool {
        use LoginStage::*;
        matches!(
            (self, next),
            (Received, CredentialLookup)
                | (CredentialLookup, PasswordVerified)
                | (CredentialLookup, SocialAssertionVerified)
                | (PasswordVerified, TokenIssued)
                | (SocialAssertionVerified, TokenIssued)
                | (Received | CredentialLookup | PasswordVerified | SocialAssertionVerified, Rejected)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, LoginStage::TokenIssued | LoginStage::Rejected)
    }
}

/// Progress of one login attempt, for tracing.
#[derive(Debug)]
pub struct LoginAttempt {
    id: Uuid,
    method: &'static str,
    stage: LoginStage,
    started: Instant,
}

impl LoginAttempt {
    fn new(method: &'static str) -> Self {
        Self {
            id: Uuid::new_v4(),
            method,
            stage: LoginStage::Received,
            started: Instant::now(),
        }
    }

    pub fn stage(&self) -> LoginStage {
        self.stage
    }

    fn advance(&mut self, next: LoginStage) {
        debug_assert!(
            self.stage.can_advance_to(next),
            "illegal login transition {:?} -> {next:?}",
            self.stage
        );
        debug!(attempt = %self.id, method = self.method, from = ?self.stage, to = ?next, "Login stage");
        self.stage = next;
    }

    fn reject(mut self, error: LoginError) -> LoginError {
        self.advance(LoginStage::Rejected);
        match &error {
            LoginError::Store(_) | LoginError::Hashing(_) | LoginError::Token(_) => warn!(
                attempt = %self.id,
                method = self.method,
                error = %error,
                "Login failed"
            ),
            _ => info!(
                attempt = %self.id,
                method = self.method,
                reason = %error,
                elapsed_ms = self.started.elapsed().as_millis() as u64,
                "Login rejected"
            ),
        }
        error
    }
}

/// Tokens handed to a client after a successful login or refresh.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub access_token: AccessToken,
    pub refresh_token: String,
    pub refresh_expires_at: DateTime<Utc>,
    pub principal: Principal,
}

pub struct SessionService {
    store: Arc<CredentialStore>,
    accounts: Arc<AccountService>,
    passwords: Arc<PasswordService>,
    signer: Arc<TokenSigner>,
    social: Option<Arc<SocialAssertionVerifier>>,
    refresh_lifetime: Duration,
    rng: SystemRandom,
}

impl SessionService {
    pub fn new(
        accounts: Arc<AccountService>,
        passwords: Arc<PasswordService>,
        signer: Arc<TokenSigner>,
        social: Option<Arc<SocialAssertionVerifier>>,
        refresh_lifetime: std::time::Duration,
    ) -> Self {
        Self {
            store: Arc::clone(accounts.store()),
            accounts,
            passwords,
            signer,
            social,
            refresh_lifetime: Duration::from_std(refresh_lifetime).unwrap_or_else(|_| Duration::days(1)),
            rng: SystemRandom::new(),
        }
    }

    pub fn signer(&self) -> &TokenSigner {
        &self.signer
    }

    pub fn social_enabled(&self) -> bool {
        self.social.is_some()
    }

    pub async fn login_with_password(&self, identifier: &str, password: &str) -> Result<IssuedSession, LoginError> {
        let mut attempt = LoginAttempt::new("password");
        attempt.advance(LoginStage::CredentialLookup);

        let store = Arc::clone(&self.store);
        let normalized = normalize_identifier(identifier);
        let found = match run_blocking(move || store.find_by_identifier(&normalized)).await {
            Ok(found) => found,
            Err(e) => return Err(attempt.reject(e.into())),
        };

        let principal = match found {
            None => {
                self.burn_password_check(password).await;
                return Err(attempt.reject(LoginError::UnknownPrincipal));
            }
            Some(principal) => principal,
        };

        let matches = match &principal.auth {
            AuthMaterial::Password { hash } => self.check_password(password, hash).await,
            AuthMaterial::Social { provider, .. } => {
                self.burn_password_check(password).await;
                return Err(attempt.reject(LoginError::ProviderMismatch(provider.clone())));
            }
        };
        let matches = match matches {
            Ok(matches) => matches,
            Err(e) => return Err(attempt.reject(e)),
        };
        if !matches {
            return Err(attempt.reject(LoginError::BadCredentials));
        }
        if let Err(e) = ensure_can_log_in(&principal) {
            return Err(attempt.reject(e));
        }
        attempt.advance(LoginStage::PasswordVerified);

        self.finish(attempt, principal).await
    }

    pub async fn login_with_social_assertion(&self, assertion: &str) -> Result<IssuedSession, LoginError> {
        let mut attempt = LoginAttempt::new("social");
        let Some(social) = &self.social else {
            return Err(attempt.reject(LoginError::SocialLoginDisabled));
        };
        attempt.advance(LoginStage::CredentialLookup);

        let identity = match social.verify(assertion).await {
            Ok(identity) => identity,
            Err(e) => return Err(attempt.reject(e)),
        };
        attempt.advance(LoginStage::SocialAssertionVerified);

        // Commits and publishes before any token exists
        let principal = match self.accounts.provision_social(&identity).await {
            Ok((principal, _)) => principal,
            Err(e) => return Err(attempt.reject(account_failure(e))),
        };
        if let Err(e) = ensure_can_log_in(&principal) {
            return Err(attempt.reject(e));
        }

        self.finish(attempt, principal).await
    }

    /// Rotate a refresh token and issue a new access token.
    ///
    /// Presenting a token that was already rotated revokes its whole family.
    pub async fn refresh(&self, refresh_token: &str) -> Result<IssuedSession, LoginError> {
        let now = Utc::now();
        let presented = hash_token(refresh_token);
        let replacement = mint(&self.rng, "", None, now, self.refresh_lifetime)
            .map_err(|e| LoginError::Hashing(e.to_string()))?;

        let store = Arc::clone(&self.store);
        let record = replacement.record.clone();
        let rotated = run_blocking(move || store.rotate_refresh_token(&presented, record, now)).await?;
        let previous = match rotated {
            RotateOutcome::Rotated { previous } => previous,
            RotateOutcome::Reused { family_id } => {
                warn!(family_id = %family_id, "Refresh token reuse detected, family revoked");
                return Err(LoginError::InvalidRefreshToken);
            }
            RotateOutcome::Unknown | RotateOutcome::Expired => return Err(LoginError::InvalidRefreshToken),
        };

        let store = Arc::clone(&self.store);
        let principal_id = previous.principal_id.clone();
        let principal = run_blocking(move || store.get(&principal_id))
            .await?
            .ok_or(LoginError::UnknownPrincipal)?;
        if let Err(e) = ensure_can_log_in(&principal) {
            let store = Arc::clone(&self.store);
            let token_hash = replacement.record.token_hash.clone();
            run_blocking(move || store.revoke_refresh_token(&token_hash)).await?;
            return Err(e);
        }

        let access_token = self.signer.issue(&principal.id, &claims_for(&principal), now)?;
        debug!(principal_id = %principal.id, family_id = %previous.family_id, "Refresh token rotated");
        Ok(IssuedSession {
            access_token,
            refresh_token: replacement.token,
            refresh_expires_at: replacement.record.expires_at,
            principal,
        })
    }

    /// Revoke a refresh token. Unknown tokens are ignored.
    pub async fn logout(&self, refresh_token: &str) -> Result<(), LoginError> {
        let store = Arc::clone(&self.store);
        let token_hash = hash_token(refresh_token);
        let revoked = run_blocking(move || store.revoke_refresh_token(&token_hash)).await?;
        debug!(revoked, "Logout");
        Ok(())
    }

    async fn finish(&self, mut attempt: LoginAttempt, principal: Principal) -> Result<IssuedSession, LoginError> {
        let now = Utc::now();
        let access_token = match self.signer.issue(&principal.id, &claims_for(&principal), now) {
            Ok(token) => token,
            Err(e) => return Err(attempt.reject(e.into())),
        };
        let refresh = match mint(&self.rng, &principal.id, None, now, self.refresh_lifetime) {
            Ok(refresh) => refresh,
            Err(e) => return Err(attempt.reject(LoginError::Hashing(e.to_string()))),
        };
        let store = Arc::clone(&self.store);
        let record = refresh.record.clone();
        if let Err(e) = run_blocking(move || store.put_refresh_token(&record)).await {
            return Err(attempt.reject(e.into()));
        }

        attempt.advance(LoginStage::TokenIssued);
        info!(
            attempt = %attempt.id,
            method = attempt.method,
            principal_id = %principal.id,
            elapsed_ms = attempt.started.elapsed().as_millis() as u64,
            "Login succeeded"
        );
        Ok(IssuedSession {
            access_token,
            refresh_token: refresh.token,
            refresh_expires_at: refresh.record.expires_at,
            principal,
        })
    }

    async fn check_password(&self, password: &str, hash: &str) -> Result<bool, LoginError> {
        let passwords = Arc::clone(&self.passwords);
        let password = password.to_string();
        let hash = hash.to_string();
        tokio::task::spawn_blocking(move || passwords.verify_password(&password, &hash))
            .await
            .map_err(|e| LoginError::Hashing(e.to_string()))
    }

    async fn burn_password_check(&self, password: &str) {
        let passwords = Arc::clone(&self.passwords);
        let password = password.to_string();
        let _ = tokio::task::spawn_blocking(move || passwords.verify_dummy(&password)).await;
    }
}

fn claims_for(principal: &Principal) -> Claims {
    Claims::for_role(principal.role).with_display_name(principal.display_name.clone())
}

fn ensure_can_log_in(principal: &Principal) -> Result<(), LoginError> {
    match principal.state {
        AccountState::Active => Ok(()),
        AccountState::Locked => Err(LoginError::AccountLocked),
        AccountState::PendingVerification => Err(LoginError::PendingVerification),
        AccountState::Deleted => Err(LoginError::UnknownPrincipal),
    }
}

fn account_failure(e: AccountError) -> LoginError {
    match e {
        AccountError::Store(store) => LoginError::Store(store),
        other => LoginError::SocialAssertionRejected(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenError;
    use crate::propagation::{ExchangeConsumer, IdentityChangeEvent};
    use crate::testutil::{provider_assertion, TestHarness, PROVIDER_ISSUER};
    use std::time::Duration as StdDuration;

    #[test]
    fn stage_transitions() {
        use LoginStage::*;
        assert!(Received.can_advance_to(CredentialLookup));
        assert!(CredentialLookup.can_advance_to(PasswordVerified));
        assert!(CredentialLookup.can_advance_to(SocialAssertionVerified));
        assert!(SocialAssertionVerified.can_advance_to(TokenIssued));
        assert!(Received.can_advance_to(Rejected));
        assert!(!Received.can_advance_to(TokenIssued));
        assert!(!CredentialLookup.can_advance_to(TokenIssued));
        assert!(!TokenIssued.can_advance_to(Rejected));
        assert!(!Rejected.can_advance_to(CredentialLookup));
        assert!(TokenIssued.is_terminal() && Rejected.is_terminal());
    }

    #[tokio::test]
    async fn password_login_issues_verifiable_token() {
        let harness = TestHarness::new();
        let alice = harness.seed_active("alice@example.org", "correct horse").await;

        let session = harness
            .sessions
            .login_with_password("Alice@Example.org", "correct horse")
            .await
            .unwrap();

        let verified = harness.verifier.verify(session.access_token.as_str(), Utc::now()).unwrap();
        assert_eq!(verified.subject, alice.id);
        assert_eq!(verified.claims.role, alice.role);
        assert_eq!(verified.claims.display_name.as_deref(), Some("alice"));
        assert!(!session.refresh_token.is_empty());
    }

    #[tokio::test]
    async fn alice_access_token_expires_sixteen_minutes_after_login() {
        let harness = TestHarness::with_access_lifetime(StdDuration::from_secs(15 * 60));
        harness.seed_active("alice@example.org", "correct horse").await;

        let session = harness
            .sessions
            .login_with_password("alice@example.org", "correct horse")
            .await
            .unwrap();
        let t0 = session.access_token.issued_at;

        assert!(harness
            .verifier
            .verify(session.access_token.as_str(), t0 + Duration::minutes(14))
            .is_ok());
        assert_eq!(
            harness
                .verifier
                .verify(session.access_token.as_str(), t0 + Duration::minutes(16))
                .unwrap_err(),
            TokenError::Expired
        );
    }

    #[tokio::test]
    async fn password_failures() {
        let harness = TestHarness::new();
        let alice = harness.seed_active("alice@example.org", "correct horse").await;
        harness
            .accounts
            .register("bob@example.org", "Bob", "battery staple", crate::auth::Role::Patient)
            .await
            .unwrap();

        assert!(matches!(
            harness.sessions.login_with_password("nobody@example.org", "correct horse").await,
            Err(LoginError::UnknownPrincipal)
        ));
        assert!(matches!(
            harness.sessions.login_with_password("alice@example.org", "wrong horse").await,
            Err(LoginError::BadCredentials)
        ));
        assert!(matches!(
            harness.sessions.login_with_password("bob@example.org", "battery staple").await,
            Err(LoginError::PendingVerification)
        ));

        harness
            .accounts
            .set_account_state(&alice.id, AccountState::Locked)
            .await
            .unwrap();
        assert!(matches!(
            harness.sessions.login_with_password("alice@example.org", "correct horse").await,
            Err(LoginError::AccountLocked)
        ));
    }

    #[tokio::test]
    async fn locked_account_with_wrong_password_is_bad_credentials() {
        let harness = TestHarness::new();
        let alice = harness.seed_active("alice@example.org", "correct horse").await;
        harness
            .accounts
            .set_account_state(&alice.id, AccountState::Locked)
            .await
            .unwrap();
        assert!(matches!(
            harness.sessions.login_with_password("alice@example.org", "guess").await,
            Err(LoginError::BadCredentials)
        ));
    }

    #[tokio::test]
    async fn signing_unavailable_fails_closed() {
        let harness = TestHarness::without_signing_key();
        harness.seed_active("alice@example.org", "correct horse").await;
        assert!(matches!(
            harness.sessions.login_with_password("alice@example.org", "correct horse").await,
            Err(LoginError::Token(TokenError::SigningUnavailable))
        ));
    }

    #[tokio::test]
    async fn social_first_login_provisions_before_issuing() {
        let harness = TestHarness::new();
        let assertion = provider_assertion("g-100", PROVIDER_ISSUER, Utc::now().timestamp() + 300);

        let session = harness.sessions.login_with_social_assertion(&assertion).await.unwrap();

        // The creation event was published before the token came back
        let delivery = harness.exchange.next_delivery().await.unwrap().unwrap();
        let event = IdentityChangeEvent::from_payload(&delivery.payload).unwrap();
        assert_eq!(event.principal_id, session.principal.id);
        assert_eq!(event.revision, 1);
        let stored = harness.store.get(&session.principal.id).unwrap().unwrap();
        assert_eq!(stored.revision, 1);

        let again = harness.sessions.login_with_social_assertion(&assertion).await.unwrap();
        assert_eq!(again.principal.id, session.principal.id);
        assert_eq!(harness.exchange.published_count(), 1);
    }

    #[tokio::test]
    async fn social_principal_cannot_use_password_login() {
        let harness = TestHarness::new();
        let assertion = provider_assertion("g-5", PROVIDER_ISSUER, Utc::now().timestamp() + 300);
        harness.sessions.login_with_social_assertion(&assertion).await.unwrap();

        assert!(matches!(
            harness.sessions.login_with_password("google:g-5", "whatever1").await,
            Err(LoginError::ProviderMismatch(provider)) if provider == "google"
        ));
    }

    #[tokio::test]
    async fn bad_assertion_is_rejected_without_provisioning() {
        let harness = TestHarness::new();
        let assertion = provider_assertion("g-6", "https://evil.example", Utc::now().timestamp() + 300);
        assert!(matches!(
            harness.sessions.login_with_social_assertion(&assertion).await,
            Err(LoginError::SocialAssertionRejected(_))
        ));
        assert_eq!(harness.store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn social_login_disabled_without_provider() {
        let harness = TestHarness::without_social();
        assert!(matches!(
            harness.sessions.login_with_social_assertion("a.b.c").await,
            Err(LoginError::SocialLoginDisabled)
        ));
    }

    #[tokio::test]
    async fn refresh_rotates_and_detects_reuse() {
        let harness = TestHarness::new();
        harness.seed_active("alice@example.org", "correct horse").await;
        let login = harness
            .sessions
            .login_with_password("alice@example.org", "correct horse")
            .await
            .unwrap();

        let rotated = harness.sessions.refresh(&login.refresh_token).await.unwrap();
        assert_ne!(rotated.refresh_token, login.refresh_token);
        assert_eq!(rotated.principal.id, login.principal.id);

        // Replaying the old token burns the whole family
        assert!(matches!(
            harness.sessions.refresh(&login.refresh_token).await,
            Err(LoginError::InvalidRefreshToken)
        ));
        assert!(matches!(
            harness.sessions.refresh(&rotated.refresh_token).await,
            Err(LoginError::InvalidRefreshToken)
        ));
    }

    #[tokio::test]
    async fn logout_revokes_refresh_token() {
        let harness = TestHarness::new();
        harness.seed_active("alice@example.org", "correct horse").await;
        let login = harness
            .sessions
            .login_with_password("alice@example.org", "correct horse")
            .await
            .unwrap();

        harness.sessions.logout(&login.refresh_token).await.unwrap();
        assert!(matches!(
            harness.sessions.refresh(&login.refresh_token).await,
            Err(LoginError::InvalidRefreshToken)
        ));
        harness.sessions.logout("never-issued").await.unwrap();
    }

    #[tokio::test]
    async fn refresh_refused_once_account_is_locked() {
        let harness = TestHarness::new();
        let alice = harness.seed_active("alice@example.org", "correct horse").await;
        let login = harness
            .sessions
            .login_with_password("alice@example.org", "correct horse")
            .await
            .unwrap();
        harness
            .accounts
            .set_account_state(&alice.id, AccountState::Locked)
            .await
            .unwrap();

        assert!(matches!(
            harness.sessions.refresh(&login.refresh_token).await,
            Err(LoginError::AccountLocked)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_logins_proceed_while_a_mutation_lock_is_held() {
        let harness = TestHarness::new();
        let alice = harness.seed_active("alice@example.org", "correct horse").await;
        harness.seed_active("bob@example.org", "battery staple").await;
        harness.seed_active("carol@example.org", "tr0ub4dor&3").await;

        // Hold alice's mutation lock until every login has finished
        let _held = harness.locks.acquire(&alice.id).await;

        let credentials = [
            ("alice@example.org", "correct horse"),
            ("bob@example.org", "battery staple"),
            ("carol@example.org", "tr0ub4dor&3"),
        ];
        let logins: Vec<_> = credentials
            .iter()
            .cycle()
            .take(12)
            .map(|(identifier, password)| {
                let sessions = Arc::clone(&harness.sessions);
                let (identifier, password) = (identifier.to_string(), password.to_string());
                tokio::spawn(async move { sessions.login_with_password(&identifier, &password).await })
            })
            .collect();

        let results = tokio::time::timeout(StdDuration::from_secs(10), futures::future::join_all(logins))
            .await
            .expect("logins must not wait on a held mutation lock");
        for result in results {
            assert!(result.unwrap().is_ok());
        }
        assert_eq!(harness.store.refresh_token_count().unwrap(), 12);
    }
}
