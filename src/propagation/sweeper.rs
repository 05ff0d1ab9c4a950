// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Outbox Sweeper
//!
//! Background task that redelivers identity change events left in the
//! outbox, either because inline publication gave up or because the process
//! stopped between commit and publish.
//!
//! ## Strategy
//!
//! Every `sweep_interval` (default 30 s) the sweeper:
//! 1. Lists due entries (`next_attempt_at <= now`) in principal/revision order.
//! 2. Makes one delivery attempt per entry.
//! 3. Stops the pass at the first broker failure; the remaining entries
//!    are retried on the next pass.
//! 4. Deletes expired refresh and action tokens from the credential store.
//!
//! ## Shutdown
//!
//! Uses `tokio_util::sync::CancellationToken` for graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::publisher::{IdentityChangePublisher, PublishOutcome};
use crate::storage::{run_blocking, CredentialStore, StoreError};

/// Default interval between sweeps.
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Entries examined per sweep.
const DEFAULT_BATCH_SIZE: usize = 100;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub delivered: usize,
    pub deferred: usize,
    pub dropped: usize,
}

pub struct OutboxSweeper {
    store: Arc<CredentialStore>,
    publisher: Arc<IdentityChangePublisher>,
    sweep_interval: Duration,
    batch_size: usize,
}

impl OutboxSweeper {
    pub fn new(store: Arc<CredentialStore>, publisher: Arc<IdentityChangePublisher>) -> Self {
        Self {
            store,
            publisher,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Run the sweeper loop until the cancellation token is triggered.
    ///
    /// Should be spawned as a background task:
    /// ```rust,ignore
    /// tokio::spawn(sweeper.run(shutdown.clone()));
    /// ```
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.sweep_interval.as_secs(),
            "Outbox sweeper starting"
        );

        loop {
            if shutdown.is_cancelled() {
                info!("Outbox sweeper shutting down");
                return;
            }

            let now = Utc::now();
            self.sweep_once(now).await;
            self.prune_tokens(now).await;

            tokio::select! {
                _ = tokio::time::sleep(self.sweep_interval) => {},
                _ = shutdown.cancelled() => {
                    info!("Outbox sweeper shutting down");
                    return;
                }
            }
        }
    }

    /// Delete refresh and action tokens that expired at or before `now`.
    pub async fn prune_tokens(&self, now: DateTime<Utc>) -> usize {
        let store = Arc::clone(&self.store);
        let pruned = run_blocking(move || {
            let refresh = store.prune_refresh_tokens(now)?;
            let action = store.prune_action_tokens(now)?;
            Ok::<_, StoreError>(refresh + action)
        })
        .await;
        match pruned {
            Ok(0) => 0,
            Ok(count) => {
                info!(count, "Expired tokens pruned");
                count
            }
            Err(e) => {
                warn!(error = %e, "Failed to prune expired tokens");
                0
            }
        }
    }

    /// Execute one pass over the due entries.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        let store = Arc::clone(&self.store);
        let batch_size = self.batch_size;
        let due = match run_blocking(move || store.outbox_due(now, batch_size)).await {
            Ok(due) => due,
            Err(e) => {
                warn!(error = %e, "Outbox sweeper: failed to list due entries");
                return report;
            }
        };
        if due.is_empty() {
            return report;
        }

        info!(count = due.len(), "Outbox sweeper: redelivering entries");

        for entry in &due {
            match self.publisher.redeliver(&entry.event, entry.attempts, now).await {
                PublishOutcome::Delivered { .. } => report.delivered += 1,
                PublishOutcome::Dropped => report.dropped += 1,
                PublishOutcome::Deferred { attempts } => {
                    report.deferred += 1;
                    warn!(
                        principal_id = %entry.event.principal_id,
                        revision = entry.event.revision,
                        attempts,
                        "Outbox sweeper: broker still unavailable, ending pass"
                    );
                    break;
                }
            }
        }

        report
    }
}
