// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! This module defines environment variable names, default values and the
//! parsed [`ServiceConfig`]. Configuration is loaded from the environment
//! at startup.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `DATA_DIR` | Directory for redb databases | `./data` |
//! | `HOST` | Server bind address | `0.0.0.0` |
//! | `PORT` | Server bind port | `8080` |
//! | `ACCESS_TOKEN_LIFETIME` | Access token lifetime (seconds) | `900` |
//! | `REFRESH_TOKEN_LIFETIME` | Refresh token lifetime (seconds) | `86400` |
//! | `TOKEN_ALGORITHM` | `RS256`, `RS384`, `RS512`, `PS*`, `ES256`, `ES384`, `EdDSA` | `RS512` |
//! | `TOKEN_ISSUER` | `iss` claim of issued tokens | `patientenakte-auth` |
//! | `JWT_PRIVATE_KEY_PATH` | PEM signing key (issuer only) | unset |
//! | `JWT_PUBLIC_KEY_PATHS` | Comma-separated PEM verifying keys, newest first | Required by the server |
//! | `USER_UPDATE_QUEUE_HOST` | AMQP broker host | `localhost` |
//! | `USER_UPDATE_QUEUE_PORT` | AMQP broker port | `5672` |
//! | `USER_UPDATE_QUEUE_USERNAME` | AMQP user | `guest` |
//! | `USER_UPDATE_QUEUE_PASSWORD` | AMQP password | `guest` |
//! | `USER_UPDATE_QUEUE_EXCHANGE_NAME` | Durable topic exchange | `user_update` |
//! | `USER_UPDATE_QUEUE_NAME` | Queue bound by consumers | `fileservice.user_update` |
//! | `USER_UPDATE_QUEUE_PREFETCH` | Unacked deliveries per consumer | `16` |
//! | `PUBLISH_MAX_ATTEMPTS` | Inline publish attempts before the outbox | `5` |
//! | `PUBLISH_INITIAL_BACKOFF_MS` | First retry delay | `100` |
//! | `PUBLISH_MAX_BACKOFF_MS` | Retry delay cap | `5000` |
//! | `OUTBOX_SWEEP_INTERVAL_SECS` | Outbox sweeper period | `30` |
//! | `CONSUMER_WORKERS` | Consumer pool size | `4` |
//! | `SOCIAL_PROVIDER_NAME` | Provider label stored with linked identities | `google` |
//! | `SOCIAL_PROVIDER_JWKS_URL` | Provider JWKS endpoint | unset (social login disabled) |
//! | `SOCIAL_PROVIDER_ISSUER` | Expected assertion issuer | Required with JWKS URL |
//! | `SOCIAL_PROVIDER_AUDIENCE` | Expected assertion audience | Optional |
//! | `NOTIFICATION_WEBHOOK_URL` | Mail relay receiving account e-mails | unset (e-mails dropped) |
//! | `VERIFICATION_TOKEN_LIFETIME` | E-mail verification token lifetime (seconds) | `86400` |
//! | `PASSWORD_RESET_TOKEN_LIFETIME` | Password reset token lifetime (seconds) | `3600` |
//! | `BOOTSTRAP_ADMIN_IDENTIFIER` | E-mail of the administrator created at startup | unset |
//! | `BOOTSTRAP_ADMIN_PASSWORD` | Its initial password | Required with identifier |
//! | `BOOTSTRAP_ADMIN_DISPLAY_NAME` | Its display name | `Administrator` |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info,tower_http=debug` |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use jsonwebtoken::Algorithm;
use url::Url;

pub const DATA_DIR_ENV: &str = "DATA_DIR";
pub const HOST_ENV: &str = "HOST";
pub const PORT_ENV: &str = "PORT";

/// Access token lifetime in seconds.
///
/// Every service verifying tokens trusts them until `exp`, so this bounds
/// how long a locked account keeps working elsewhere.
pub const ACCESS_TOKEN_LIFETIME_ENV: &str = "ACCESS_TOKEN_LIFETIME";
pub const REFRESH_TOKEN_LIFETIME_ENV: &str = "REFRESH_TOKEN_LIFETIME";
pub const TOKEN_ALGORITHM_ENV: &str = "TOKEN_ALGORITHM";
pub const TOKEN_ISSUER_ENV: &str = "TOKEN_ISSUER";

/// PEM private key used for signing. Only the issuing service sets this.
pub const JWT_PRIVATE_KEY_PATH_ENV: &str = "JWT_PRIVATE_KEY_PATH";

/// PEM public keys, newest first. The first one must match the private key.
pub const JWT_PUBLIC_KEY_PATHS_ENV: &str = "JWT_PUBLIC_KEY_PATHS";

pub const QUEUE_HOST_ENV: &str = "USER_UPDATE_QUEUE_HOST";
pub const QUEUE_PORT_ENV: &str = "USER_UPDATE_QUEUE_PORT";
pub const QUEUE_USERNAME_ENV: &str = "USER_UPDATE_QUEUE_USERNAME";
pub const QUEUE_PASSWORD_ENV: &str = "USER_UPDATE_QUEUE_PASSWORD";
pub const QUEUE_EXCHANGE_NAME_ENV: &str = "USER_UPDATE_QUEUE_EXCHANGE_NAME";
pub const QUEUE_NAME_ENV: &str = "USER_UPDATE_QUEUE_NAME";
pub const QUEUE_PREFETCH_ENV: &str = "USER_UPDATE_QUEUE_PREFETCH";

pub const PUBLISH_MAX_ATTEMPTS_ENV: &str = "PUBLISH_MAX_ATTEMPTS";
pub const PUBLISH_INITIAL_BACKOFF_MS_ENV: &str = "PUBLISH_INITIAL_BACKOFF_MS";
pub const PUBLISH_MAX_BACKOFF_MS_ENV: &str = "PUBLISH_MAX_BACKOFF_MS";
pub const OUTBOX_SWEEP_INTERVAL_SECS_ENV: &str = "OUTBOX_SWEEP_INTERVAL_SECS";
pub const CONSUMER_WORKERS_ENV: &str = "CONSUMER_WORKERS";

pub const SOCIAL_PROVIDER_NAME_ENV: &str = "SOCIAL_PROVIDER_NAME";
pub const SOCIAL_PROVIDER_JWKS_URL_ENV: &str = "SOCIAL_PROVIDER_JWKS_URL";
pub const SOCIAL_PROVIDER_ISSUER_ENV: &str = "SOCIAL_PROVIDER_ISSUER";
pub const SOCIAL_PROVIDER_AUDIENCE_ENV: &str = "SOCIAL_PROVIDER_AUDIENCE";

pub const NOTIFICATION_WEBHOOK_URL_ENV: &str = "NOTIFICATION_WEBHOOK_URL";
pub const VERIFICATION_TOKEN_LIFETIME_ENV: &str = "VERIFICATION_TOKEN_LIFETIME";
pub const PASSWORD_RESET_TOKEN_LIFETIME_ENV: &str = "PASSWORD_RESET_TOKEN_LIFETIME";

/// Created on startup when no account holds the identifier yet.
pub const BOOTSTRAP_ADMIN_IDENTIFIER_ENV: &str = "BOOTSTRAP_ADMIN_IDENTIFIER";
pub const BOOTSTRAP_ADMIN_PASSWORD_ENV: &str = "BOOTSTRAP_ADMIN_PASSWORD";
pub const BOOTSTRAP_ADMIN_DISPLAY_NAME_ENV: &str = "BOOTSTRAP_ADMIN_DISPLAY_NAME";

pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

/// Upper bound for every configured token lifetime (ten years).
pub const MAX_TOKEN_LIFETIME_SECS: u64 = 315_360_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub access_token_lifetime: Duration,
    pub refresh_token_lifetime: Duration,
    pub algorithm: Algorithm,
    pub issuer: String,
    pub private_key_path: Option<PathBuf>,
    pub public_key_paths: Vec<PathBuf>,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            access_token_lifetime: Duration::from_secs(900),
            refresh_token_lifetime: Duration::from_secs(86_400),
            algorithm: Algorithm::RS512,
            issuer: "patientenakte-auth".to_string(),
            private_key_path: None,
            public_key_paths: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct QueueConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub exchange_name: String,
    pub queue_name: String,
    pub prefetch: u16,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            exchange_name: "user_update".to_string(),
            queue_name: "fileservice.user_update".to_string(),
            prefetch: 16,
        }
    }
}

impl QueueConfig {
    /// Connection URI on the default vhost, credentials percent-encoded.
    pub fn amqp_uri(&self) -> String {
        let base = format!("amqp://{}:{}/%2f", self.host, self.port);
        match Url::parse(&base) {
            Ok(mut url) => {
                let _ = url.set_username(&self.username);
                let _ = url.set_password(Some(&self.password));
                url.to_string()
            }
            Err(_) => base,
        }
    }
}

impl std::fmt::Debug for QueueConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("exchange_name", &self.exchange_name)
            .field("queue_name", &self.queue_name)
            .field("prefetch", &self.prefetch)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct PublishConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub sweep_interval: Duration,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SocialProviderConfig {
    pub name: String,
    pub jwks_url: String,
    pub issuer: String,
    pub audience: Option<String>,
}

#[derive(Clone)]
pub struct BootstrapAdmin {
    pub identifier: String,
    pub password: String,
    pub display_name: String,
}

impl std::fmt::Debug for BootstrapAdmin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapAdmin")
            .field("identifier", &self.identifier)
            .field("password", &"<redacted>")
            .field("display_name", &self.display_name)
            .finish()
    }
}

/// Self-service account flows.
#[derive(Debug, Clone)]
pub struct AccountConfig {
    pub notification_webhook_url: Option<String>,
    pub verification_token_lifetime: Duration,
    pub password_reset_token_lifetime: Duration,
    pub bootstrap_admin: Option<BootstrapAdmin>,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            notification_webhook_url: None,
            verification_token_lifetime: Duration::from_secs(86_400),
            password_reset_token_lifetime: Duration::from_secs(3_600),
            bootstrap_admin: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub data_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub log_format: LogFormat,
    pub token: TokenConfig,
    pub queue: QueueConfig,
    pub publish: PublishConfig,
    pub social: Option<SocialProviderConfig>,
    pub accounts: AccountConfig,
    pub consumer_workers: usize,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let token_defaults = TokenConfig::default();
        let token = TokenConfig {
            access_token_lifetime: Duration::from_secs(parse_or(
                ACCESS_TOKEN_LIFETIME_ENV,
                get(ACCESS_TOKEN_LIFETIME_ENV),
                token_defaults.access_token_lifetime.as_secs(),
            )?),
            refresh_token_lifetime: Duration::from_secs(parse_or(
                REFRESH_TOKEN_LIFETIME_ENV,
                get(REFRESH_TOKEN_LIFETIME_ENV),
                token_defaults.refresh_token_lifetime.as_secs(),
            )?),
            algorithm: match get(TOKEN_ALGORITHM_ENV) {
                Some(raw) => parse_algorithm(&raw)?,
                None => token_defaults.algorithm,
            },
            issuer: get(TOKEN_ISSUER_ENV).unwrap_or(token_defaults.issuer),
            private_key_path: get(JWT_PRIVATE_KEY_PATH_ENV).map(PathBuf::from),
            public_key_paths: get(JWT_PUBLIC_KEY_PATHS_ENV)
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(PathBuf::from)
                        .collect()
                })
                .unwrap_or_default(),
        };
        check_lifetime(ACCESS_TOKEN_LIFETIME_ENV, token.access_token_lifetime)?;
        check_lifetime(REFRESH_TOKEN_LIFETIME_ENV, token.refresh_token_lifetime)?;

        let queue_defaults = QueueConfig::default();
        let queue = QueueConfig {
            host: get(QUEUE_HOST_ENV).unwrap_or(queue_defaults.host),
            port: parse_or(QUEUE_PORT_ENV, get(QUEUE_PORT_ENV), queue_defaults.port)?,
            username: get(QUEUE_USERNAME_ENV).unwrap_or(queue_defaults.username),
            password: get(QUEUE_PASSWORD_ENV).unwrap_or(queue_defaults.password),
            exchange_name: get(QUEUE_EXCHANGE_NAME_ENV).unwrap_or(queue_defaults.exchange_name),
            queue_name: get(QUEUE_NAME_ENV).unwrap_or(queue_defaults.queue_name),
            prefetch: parse_or(QUEUE_PREFETCH_ENV, get(QUEUE_PREFETCH_ENV), queue_defaults.prefetch)?,
        };

        let publish_defaults = PublishConfig::default();
        let publish = PublishConfig {
            max_attempts: parse_or(
                PUBLISH_MAX_ATTEMPTS_ENV,
                get(PUBLISH_MAX_ATTEMPTS_ENV),
                publish_defaults.max_attempts,
            )?,
            initial_backoff: Duration::from_millis(parse_or(
                PUBLISH_INITIAL_BACKOFF_MS_ENV,
                get(PUBLISH_INITIAL_BACKOFF_MS_ENV),
                publish_defaults.initial_backoff.as_millis() as u64,
            )?),
            max_backoff: Duration::from_millis(parse_or(
                PUBLISH_MAX_BACKOFF_MS_ENV,
                get(PUBLISH_MAX_BACKOFF_MS_ENV),
                publish_defaults.max_backoff.as_millis() as u64,
            )?),
            sweep_interval: Duration::from_secs(parse_or(
                OUTBOX_SWEEP_INTERVAL_SECS_ENV,
                get(OUTBOX_SWEEP_INTERVAL_SECS_ENV),
                publish_defaults.sweep_interval.as_secs(),
            )?),
        };

        let social = match get(SOCIAL_PROVIDER_JWKS_URL_ENV) {
            Some(jwks_url) => {
                Url::parse(&jwks_url).map_err(|e| ConfigError::Invalid {
                    var: SOCIAL_PROVIDER_JWKS_URL_ENV,
                    value: jwks_url.clone(),
                    reason: e.to_string(),
                })?;
                Some(SocialProviderConfig {
                    name: get(SOCIAL_PROVIDER_NAME_ENV).unwrap_or_else(|| "google".to_string()),
                    jwks_url,
                    issuer: get(SOCIAL_PROVIDER_ISSUER_ENV)
                        .ok_or(ConfigError::Missing(SOCIAL_PROVIDER_ISSUER_ENV))?,
                    audience: get(SOCIAL_PROVIDER_AUDIENCE_ENV),
                })
            }
            None => None,
        };

        let account_defaults = AccountConfig::default();
        let notification_webhook_url = match get(NOTIFICATION_WEBHOOK_URL_ENV) {
            Some(url) => {
                Url::parse(&url).map_err(|e| ConfigError::Invalid {
                    var: NOTIFICATION_WEBHOOK_URL_ENV,
                    value: url.clone(),
                    reason: e.to_string(),
                })?;
                Some(url)
            }
            None => None,
        };
        let bootstrap_admin = match get(BOOTSTRAP_ADMIN_IDENTIFIER_ENV) {
            Some(identifier) => Some(BootstrapAdmin {
                identifier,
                password: lookup(BOOTSTRAP_ADMIN_PASSWORD_ENV)
                    .filter(|v| !v.is_empty())
                    .ok_or(ConfigError::Missing(BOOTSTRAP_ADMIN_PASSWORD_ENV))?,
                display_name: get(BOOTSTRAP_ADMIN_DISPLAY_NAME_ENV).unwrap_or_else(|| "Administrator".to_string()),
            }),
            None => None,
        };
        let accounts = AccountConfig {
            notification_webhook_url,
            verification_token_lifetime: Duration::from_secs(parse_or(
                VERIFICATION_TOKEN_LIFETIME_ENV,
                get(VERIFICATION_TOKEN_LIFETIME_ENV),
                account_defaults.verification_token_lifetime.as_secs(),
            )?),
            password_reset_token_lifetime: Duration::from_secs(parse_or(
                PASSWORD_RESET_TOKEN_LIFETIME_ENV,
                get(PASSWORD_RESET_TOKEN_LIFETIME_ENV),
                account_defaults.password_reset_token_lifetime.as_secs(),
            )?),
            bootstrap_admin,
        };
        check_lifetime(VERIFICATION_TOKEN_LIFETIME_ENV, accounts.verification_token_lifetime)?;
        check_lifetime(PASSWORD_RESET_TOKEN_LIFETIME_ENV, accounts.password_reset_token_lifetime)?;

        let log_format = match get(LOG_FORMAT_ENV) {
            Some(raw) if raw.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        Ok(Self {
            data_dir: PathBuf::from(get(DATA_DIR_ENV).unwrap_or_else(|| "./data".to_string())),
            host: get(HOST_ENV).unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or(PORT_ENV, get(PORT_ENV), 8080)?,
            log_format,
            token,
            queue,
            publish,
            social,
            accounts,
            consumer_workers: parse_or(CONSUMER_WORKERS_ENV, get(CONSUMER_WORKERS_ENV), 4usize)?.max(1),
        })
    }

    pub fn credentials_db_path(&self) -> PathBuf {
        self.data_dir.join("credentials.redb")
    }

    pub fn identity_cache_db_path(&self) -> PathBuf {
        self.data_dir.join("identity-cache.redb")
    }
}

fn parse_or<T>(var: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
        None => Ok(default),
    }
}

fn check_lifetime(var: &'static str, lifetime: Duration) -> Result<(), ConfigError> {
    let secs = lifetime.as_secs();
    let reason = if secs == 0 {
        "lifetime must be positive"
    } else if secs > MAX_TOKEN_LIFETIME_SECS {
        "lifetime exceeds ten years"
    } else {
        return Ok(());
    };
    Err(ConfigError::Invalid {
        var,
        value: secs.to_string(),
        reason: reason.to_string(),
    })
}

/// Only asymmetric algorithms: verifiers must never hold signing material.
fn parse_algorithm(raw: &str) -> Result<Algorithm, ConfigError> {
    let invalid = |reason: &str| ConfigError::Invalid {
        var: TOKEN_ALGORITHM_ENV,
        value: raw.to_string(),
        reason: reason.to_string(),
    };
    let algorithm = Algorithm::from_str(raw).map_err(|_| invalid("unknown algorithm"))?;
    match algorithm {
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => Err(invalid("symmetric algorithms are not allowed")),
        other => Ok(other),
    }
}
