// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Identity change publisher.
//!
//! Runs after a mutation has committed and its event has been staged in the
//! outbox. Broker errors are retried with exponential backoff; once the
//! attempts are exhausted the entry is deferred to the outbox sweeper.
//! Serialization errors are not retryable: the event is logged and dropped.
//! Nothing here ever fails the mutation that produced the event.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::exchange::{ExchangeError, ExchangePublisher};
use super::IdentityChangeEvent;
use crate::config::PublishConfig;
use crate::storage::{run_blocking, CredentialStore};

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

impl PublishError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PublishError::Exchange(_))
    }
}

/// Exponential backoff: `initial * 2^(attempt-1)`, capped at `max_backoff`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &PublishConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
        }
    }

    /// Delay after the given failed attempt (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Delivered { attempts: u32 },
    /// Left in the outbox for the sweeper.
    Deferred { attempts: u32 },
    /// Could never be delivered; removed from the outbox.
    Dropped,
}

pub struct IdentityChangePublisher {
    exchange: Arc<dyn ExchangePublisher>,
    store: Arc<CredentialStore>,
    retry: RetryPolicy,
}

impl IdentityChangePublisher {
    pub fn new(exchange: Arc<dyn ExchangePublisher>, store: Arc<CredentialStore>, retry: RetryPolicy) -> Self {
        Self {
            exchange,
            store,
            retry,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Publish the event staged by a committed mutation.
    pub async fn on_principal_mutated(&self, event: &IdentityChangeEvent) -> PublishOutcome {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.publish_once(event).await {
                Ok(()) => {
                    self.complete(event).await;
                    debug!(
                        principal_id = %event.principal_id,
                        revision = event.revision,
                        attempt,
                        "Identity change published"
                    );
                    return PublishOutcome::Delivered { attempts: attempt };
                }
                Err(e) if !e.is_retryable() => {
                    self.drop_event(event, &e).await;
                    return PublishOutcome::Dropped;
                }
                Err(e) if attempt >= self.retry.max_attempts => {
                    self.defer(event, attempt, &e, Utc::now()).await;
                    return PublishOutcome::Deferred { attempts: attempt };
                }
                Err(e) => {
                    let delay = self.retry.backoff_for(attempt);
                    warn!(
                        principal_id = %event.principal_id,
                        revision = event.revision,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Publish failed, retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// One delivery attempt for an outbox entry, on behalf of the sweeper.
    ///
    /// `prior_attempts` decides how far the entry is pushed back on failure.
    pub async fn redeliver(&self, event: &IdentityChangeEvent, prior_attempts: u32, now: DateTime<Utc>) -> PublishOutcome {
        match self.publish_once(event).await {
            Ok(()) => {
                self.complete(event).await;
                info!(
                    principal_id = %event.principal_id,
                    revision = event.revision,
                    "Outbox entry delivered"
                );
                PublishOutcome::Delivered { attempts: prior_attempts + 1 }
            }
            Err(e) if !e.is_retryable() => {
                self.drop_event(event, &e).await;
                PublishOutcome::Dropped
            }
            Err(e) => {
                let attempts = prior_attempts + 1;
                let delay = self.retry.backoff_for(attempts);
                let next = now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                self.defer_until(event, 1, &e, next).await;
                PublishOutcome::Deferred { attempts }
            }
        }
    }

    async fn publish_once(&self, event: &IdentityChangeEvent) -> Result<(), PublishError> {
        let payload = event.to_payload()?;
        self.exchange.publish(event.routing_key(), &payload).await?;
        Ok(())
    }

    async fn complete(&self, event: &IdentityChangeEvent) {
        let store = Arc::clone(&self.store);
        let (principal_id, revision) = (event.principal_id.clone(), event.revision);
        if let Err(e) = run_blocking(move || store.outbox_complete(&principal_id, revision)).await {
            // Delivered already; a leftover entry is only redelivered
            warn!(principal_id = %event.principal_id, revision = event.revision, error = %e, "Failed to clear outbox entry");
        }
    }

    async fn defer(&self, event: &IdentityChangeEvent, attempts: u32, e: &PublishError, now: DateTime<Utc>) {
        warn!(
            principal_id = %event.principal_id,
            revision = event.revision,
            attempts,
            error = %e,
            "Publish retries exhausted, event left in outbox"
        );
        self.defer_until(event, attempts, e, now).await;
    }

    async fn defer_until(
        &self,
        event: &IdentityChangeEvent,
        attempts: u32,
        e: &PublishError,
        next_attempt_at: DateTime<Utc>,
    ) {
        let store = Arc::clone(&self.store);
        let (principal_id, revision, reason) = (event.principal_id.clone(), event.revision, e.to_string());
        let deferred = run_blocking(move || {
            store.outbox_defer(&principal_id, revision, attempts, &reason, next_attempt_at)
        })
        .await;
        if let Err(store_err) = deferred {
            // Entry stays Pending and is picked up once its grace period ends
            error!(principal_id = %event.principal_id, revision = event.revision, error = %store_err, "Failed to defer outbox entry");
        }
    }

    async fn drop_event(&self, event: &IdentityChangeEvent, e: &PublishError) {
        error!(
            principal_id = %event.principal_id,
            revision = event.revision,
            error = %e,
            "Identity change event cannot be serialized, dropping"
        );
        let store = Arc::clone(&self.store);
        let (principal_id, revision) = (event.principal_id.clone(), event.revision);
        let discarded = run_blocking(move || store.outbox_discard(&principal_id, revision)).await;
        if let Err(store_err) = discarded {
            error!(principal_id = %event.principal_id, error = %store_err, "Failed to discard outbox entry");
        }
    }
}
