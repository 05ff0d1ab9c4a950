// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Shared fixtures for unit tests.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, DecodingKey, EncodingKey, Header};
use tempfile::TempDir;

use crate::accounts::AccountService;
use crate::auth::keys::{KeyMaterial, SigningKey, VerifyingKey};
use crate::auth::password::{Argon2Config, PasswordPolicy, PasswordService};
use crate::auth::session::SessionService;
use crate::auth::signer::TokenSigner;
use crate::auth::social::SocialAssertionVerifier;
use crate::auth::verifier::TokenVerifier;
use crate::auth::Role;
use crate::notify::{Notifier, RecordingNotifier};
use crate::propagation::{ExchangeConsumer, IdentityChangePublisher, InMemoryExchange, RetryPolicy};
use crate::state::AppState;
use crate::storage::{
    AccountState, AuthMaterial, CredentialStore, LocalIdentityCache, MutationReceipt, NewPrincipal, Principal,
    PrincipalLocks,
};

pub const ISSUER_PRIVATE_PEM: &str = include_str!("../tests/fixtures/issuer-private.pem");
pub const ISSUER_PUBLIC_PEM: &str = include_str!("../tests/fixtures/issuer-public.pem");
pub const ROTATED_PRIVATE_PEM: &str = include_str!("../tests/fixtures/rotated-private.pem");
pub const ROTATED_PUBLIC_PEM: &str = include_str!("../tests/fixtures/rotated-public.pem");
pub const ED25519_PRIVATE_PEM: &str = include_str!("../tests/fixtures/ed25519-private.pem");
pub const ED25519_PUBLIC_PEM: &str = include_str!("../tests/fixtures/ed25519-public.pem");

pub const TEST_ISSUER: &str = "patientenakte-auth";
pub const PROVIDER_ISSUER: &str = "https://accounts.google.com";
pub const PROVIDER_AUDIENCE: &str = "patientenakte-web";

pub fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

pub fn temp_store() -> (CredentialStore, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = CredentialStore::open(&dir.path().join("credentials.redb")).unwrap();
    (store, dir)
}

pub fn temp_cache() -> (LocalIdentityCache, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let cache = LocalIdentityCache::open(&dir.path().join("identity-cache.redb")).unwrap();
    (cache, dir)
}

pub fn quick_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(4),
    }
}

/// Active password principal written straight to the store. Nothing is published.
pub fn seed_principal(store: &CredentialStore, identifier: &str) -> MutationReceipt {
    store
        .create(
            NewPrincipal {
                identifier: identifier.to_string(),
                display_name: local_part(identifier),
                role: Role::Patient,
                state: AccountState::Active,
                auth: AuthMaterial::Password {
                    hash: "$argon2id$v=19$m=64,t=1,p=1$c2FsdHNhbHQ$aGFzaGhhc2hoYXNo".to_string(),
                },
            },
            Utc::now(),
        )
        .unwrap()
}

fn local_part(identifier: &str) -> String {
    identifier.split('@').next().unwrap_or(identifier).to_string()
}

fn key_pair(algorithm: Algorithm, private_pem: &str, public_pem: &str) -> (SigningKey, VerifyingKey) {
    let verifying = VerifyingKey::from_pem(algorithm, public_pem.as_bytes()).unwrap();
    let signing = SigningKey::from_pem(algorithm, private_pem.as_bytes(), verifying.kid()).unwrap();
    (signing, verifying)
}

pub fn issuer_keys() -> Arc<KeyMaterial> {
    let (signing, verifying) = key_pair(Algorithm::RS512, ISSUER_PRIVATE_PEM, ISSUER_PUBLIC_PEM);
    Arc::new(KeyMaterial::new(Some(signing), vec![verifying]).unwrap())
}

pub fn rotated_keys() -> Arc<KeyMaterial> {
    let (signing, verifying) = key_pair(Algorithm::RS512, ROTATED_PRIVATE_PEM, ROTATED_PUBLIC_PEM);
    Arc::new(KeyMaterial::new(Some(signing), vec![verifying]).unwrap())
}

/// Verifies tokens from both the issuer and the rotated key, newest first.
pub fn rotation_set_keys() -> Arc<KeyMaterial> {
    let newest = VerifyingKey::from_pem(Algorithm::RS512, ROTATED_PUBLIC_PEM.as_bytes()).unwrap();
    let previous = VerifyingKey::from_pem(Algorithm::RS512, ISSUER_PUBLIC_PEM.as_bytes()).unwrap();
    Arc::new(KeyMaterial::verifying_only(vec![newest, previous]).unwrap())
}

pub fn verifying_only_keys() -> Arc<KeyMaterial> {
    let verifying = VerifyingKey::from_pem(Algorithm::RS512, ISSUER_PUBLIC_PEM.as_bytes()).unwrap();
    Arc::new(KeyMaterial::verifying_only(vec![verifying]).unwrap())
}

pub fn ed25519_keys() -> Arc<KeyMaterial> {
    let (signing, verifying) = key_pair(Algorithm::EdDSA, ED25519_PRIVATE_PEM, ED25519_PUBLIC_PEM);
    Arc::new(KeyMaterial::new(Some(signing), vec![verifying]).unwrap())
}

/// ID token as the social provider would mint it.
pub fn provider_assertion(subject: &str, issuer: &str, expires_at: i64) -> String {
    let claims = serde_json::json!({
        "sub": subject,
        "iss": issuer,
        "aud": PROVIDER_AUDIENCE,
        "iat": Utc::now().timestamp(),
        "exp": expires_at,
        "email": format!("{subject}@example.org"),
    });
    let key = EncodingKey::from_rsa_pem(ROTATED_PRIVATE_PEM.as_bytes()).unwrap();
    encode(&Header::new(Algorithm::RS256), &claims, &key).unwrap()
}

pub fn provider_verifier() -> SocialAssertionVerifier {
    SocialAssertionVerifier::with_static_key(
        "google",
        PROVIDER_ISSUER,
        Some(PROVIDER_AUDIENCE.to_string()),
        DecodingKey::from_rsa_pem(ROTATED_PUBLIC_PEM.as_bytes()).unwrap(),
        Algorithm::RS256,
    )
}

/// Services wired against a temp store and an in-memory exchange.
pub struct TestHarness {
    pub store: Arc<CredentialStore>,
    pub exchange: InMemoryExchange,
    pub publisher: Arc<IdentityChangePublisher>,
    pub locks: PrincipalLocks,
    pub accounts: Arc<AccountService>,
    pub sessions: Arc<SessionService>,
    pub verifier: TokenVerifier,
    pub notifier: Arc<RecordingNotifier>,
    _dir: TempDir,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::build(issuer_keys(), Duration::from_secs(900), true)
    }

    pub fn with_access_lifetime(lifetime: Duration) -> Self {
        Self::build(issuer_keys(), lifetime, true)
    }

    pub fn without_signing_key() -> Self {
        Self::build(verifying_only_keys(), Duration::from_secs(900), true)
    }

    pub fn without_social() -> Self {
        Self::build(issuer_keys(), Duration::from_secs(900), false)
    }

    fn build(keys: Arc<KeyMaterial>, access_lifetime: Duration, social: bool) -> Self {
        let (store, dir) = temp_store();
        let store = Arc::new(store);
        let exchange = InMemoryExchange::new();
        let publisher = Arc::new(IdentityChangePublisher::new(
            Arc::new(exchange.clone()),
            Arc::clone(&store),
            quick_retry(3),
        ));
        let passwords = Arc::new(PasswordService::new(Argon2Config::testing(), PasswordPolicy::default()).unwrap());
        let locks = PrincipalLocks::new();
        let notifier = Arc::new(RecordingNotifier::new());
        let accounts = Arc::new(
            AccountService::new(
                Arc::clone(&store),
                Arc::clone(&publisher),
                Arc::clone(&passwords),
                locks.clone(),
            )
            .with_notifier(Arc::clone(&notifier) as Arc<dyn Notifier>),
        );
        let signer = Arc::new(TokenSigner::new(Arc::clone(&keys), TEST_ISSUER, access_lifetime));
        let sessions = Arc::new(SessionService::new(
            Arc::clone(&accounts),
            passwords,
            signer,
            social.then(|| Arc::new(provider_verifier())),
            Duration::from_secs(86_400),
        ));

        Self {
            store,
            exchange,
            publisher,
            locks,
            accounts,
            sessions,
            verifier: TokenVerifier::new(keys, TEST_ISSUER),
            notifier,
            _dir: dir,
        }
    }

    pub fn signer(&self) -> &TokenSigner {
        self.sessions.signer()
    }

    pub fn app_state(&self) -> AppState {
        AppState::new(
            Arc::clone(&self.accounts),
            Arc::clone(&self.sessions),
            self.verifier.clone(),
        )
    }

    /// Register and verify, leaving the principal active at revision 2.
    pub async fn seed_active(&self, identifier: &str, password: &str) -> Principal {
        let registered = self
            .accounts
            .register(identifier, &local_part(identifier), password, Role::Patient)
            .await
            .unwrap();
        self.accounts.verify_account(&registered.id).await.unwrap()
    }

    /// Consume and ack everything currently queued.
    pub async fn drain_events(&self) {
        while self.exchange.ready_len().await > 0 {
            let delivery = self.exchange.next_delivery().await.unwrap().unwrap();
            self.exchange.ack(delivery.tag).await.unwrap();
        }
    }
}
