// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Identity server: login, registration and account administration over
//! HTTP, plus the outbox sweeper that redelivers identity changes.

use std::net::SocketAddr;
use std::sync::Arc;

use patientenakte_identity::{
    accounts::{AccountError, AccountService},
    api::router,
    auth::{
        Argon2Config, KeyError, KeyMaterial, PasswordPolicy, PasswordService, SessionService,
        SocialAssertionVerifier, TokenSigner, TokenVerifier,
    },
    config::{ConfigError, ServiceConfig},
    logging::{init_logging, shutdown_signal},
    notify::{DisabledNotifier, Notifier, NotifyError, WebhookNotifier},
    propagation::{ExchangePublisher, IdentityChangePublisher, OutboxSweeper, RetryPolicy},
    state::AppState,
    storage::{CredentialStore, PrincipalLocks, StoreError},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Keys(#[from] KeyError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0}")]
    Hashing(String),
    #[error(transparent)]
    Notify(#[from] NotifyError),
    #[error("failed to create bootstrap administrator: {0}")]
    Bootstrap(#[from] AccountError),
    #[error("invalid bind address {0}")]
    BindAddress(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() {
    let config = match ServiceConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            std::process::exit(1);
        }
    };
    init_logging(config.log_format);

    if let Err(e) = run(config).await {
        error!(error = %e, "Identity server failed");
        std::process::exit(1);
    }
}

#[cfg(feature = "dev")]
fn exchange(_config: &ServiceConfig) -> Arc<dyn ExchangePublisher> {
    warn!("DEV MODE: identity changes go to an in-memory exchange and are not propagated");
    Arc::new(patientenakte_identity::propagation::InMemoryExchange::new())
}

#[cfg(not(feature = "dev"))]
fn exchange(config: &ServiceConfig) -> Arc<dyn ExchangePublisher> {
    use patientenakte_identity::propagation::{AmqpConfig, AmqpExchange};

    info!(
        host = %config.queue.host,
        port = config.queue.port,
        exchange = %config.queue.exchange_name,
        "Publishing identity changes over AMQP"
    );
    Arc::new(AmqpExchange::new(AmqpConfig::publisher(&config.queue)))
}

/// Lifetimes are bounded to ten years by config.
fn chrono_lifetime(lifetime: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(lifetime).unwrap_or(chrono::Duration::hours(1))
}

async fn run(config: ServiceConfig) -> Result<(), StartupError> {
    let keys = Arc::new(KeyMaterial::load(&config.token)?);
    if !keys.can_sign() {
        warn!("No signing key loaded, this instance only verifies tokens");
    }

    let store = Arc::new(CredentialStore::open(&config.credentials_db_path())?);
    info!(
        path = %config.credentials_db_path().display(),
        principals = store.count()?,
        outbox = store.outbox_len()?,
        "Credential store opened"
    );

    let publisher = Arc::new(IdentityChangePublisher::new(
        exchange(&config),
        Arc::clone(&store),
        RetryPolicy::from_config(&config.publish),
    ));

    let passwords = Arc::new(
        PasswordService::new(Argon2Config::default(), PasswordPolicy::default())
            .map_err(|e| StartupError::Hashing(e.to_string()))?,
    );
    let notifier: Arc<dyn Notifier> = match &config.accounts.notification_webhook_url {
        Some(url) => {
            info!(%url, "Account e-mails go to the notification webhook");
            Arc::new(WebhookNotifier::new(url.clone())?)
        }
        None => {
            warn!("No notification webhook, accounts must be verified by an administrator");
            Arc::new(DisabledNotifier)
        }
    };
    let accounts = Arc::new(
        AccountService::new(
            Arc::clone(&store),
            Arc::clone(&publisher),
            Arc::clone(&passwords),
            PrincipalLocks::new(),
        )
        .with_notifier(notifier)
        .with_action_token_lifetimes(
            chrono_lifetime(config.accounts.verification_token_lifetime),
            chrono_lifetime(config.accounts.password_reset_token_lifetime),
        ),
    );

    if let Some(admin) = &config.accounts.bootstrap_admin {
        match accounts
            .bootstrap_admin(&admin.identifier, &admin.display_name, &admin.password)
            .await?
        {
            Some(principal) => info!(principal_id = %principal.id, "Bootstrap administrator ready"),
            None => info!(identifier = %admin.identifier, "Bootstrap administrator already exists"),
        }
    }

    let social = config.social.as_ref().map(|provider| {
        info!(provider = %provider.name, jwks_url = %provider.jwks_url, "Social login enabled");
        Arc::new(SocialAssertionVerifier::from_config(provider))
    });
    let signer = Arc::new(TokenSigner::new(
        Arc::clone(&keys),
        config.token.issuer.clone(),
        config.token.access_token_lifetime,
    ));
    let sessions = Arc::new(SessionService::new(
        Arc::clone(&accounts),
        passwords,
        signer,
        social,
        config.token.refresh_token_lifetime,
    ));
    let verifier = TokenVerifier::new(keys, config.token.issuer.clone());

    let shutdown = CancellationToken::new();
    let sweeper = OutboxSweeper::new(Arc::clone(&store), publisher).with_interval(config.publish.sweep_interval);
    let sweeper_handle = tokio::spawn(sweeper.run(shutdown.clone()));

    let state = AppState::new(accounts, sessions, verifier).with_data_dir(config.data_dir.clone());
    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|_| StartupError::BindAddress(format!("{}:{}", config.host, config.port)))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Identity server listening (docs at /docs)");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            server_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Err(e) = sweeper_handle.await {
        error!(error = %e, "Outbox sweeper task failed");
    }
    info!("Identity server stopped");
    Ok(())
}
