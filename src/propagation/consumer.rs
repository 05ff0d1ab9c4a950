// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Identity change consumer.
//!
//! Applies events to the local identity cache behind a revision guard, so
//! duplicates and out-of-order arrivals converge without buffering. A pool
//! of workers pulls from the exchange and settles each delivery only after
//! the outcome is known:
//!
//! | Outcome | Settlement |
//! |---------|------------|
//! | applied or stale (committed / nothing to do) | ack |
//! | payload cannot be decoded | nack, no requeue |
//! | local store failed | nack, requeue |

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::exchange::{Delivery, ExchangeConsumer};
use super::IdentityChangeEvent;
use crate::storage::{run_blocking, ApplyOutcome, LocalIdentityCache, StoreError, StoreResult};

/// Pause before pulling again after the broker reported an error.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Pause after a requeue so a failing store is not hammered.
const REQUEUE_DELAY: Duration = Duration::from_millis(200);

#[derive(Clone)]
pub struct IdentityChangeConsumer {
    cache: Arc<LocalIdentityCache>,
}

impl IdentityChangeConsumer {
    pub fn new(cache: Arc<LocalIdentityCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<LocalIdentityCache> {
        &self.cache
    }

    /// Apply `event` if it is newer than the cached revision.
    ///
    /// Stale and duplicate events are discarded silently.
    pub fn on_event(&self, event: &IdentityChangeEvent) -> StoreResult<ApplyOutcome> {
        let outcome = self.cache.apply(event, Utc::now())?;
        match outcome {
            ApplyOutcome::Applied { revision } => debug!(
                principal_id = %event.principal_id,
                revision,
                tombstone = event.is_tombstone(),
                "Identity change applied"
            ),
            ApplyOutcome::Stale { last_applied_revision } => debug!(
                principal_id = %event.principal_id,
                revision = event.revision,
                last_applied_revision,
                "Stale identity change discarded"
            ),
        }
        Ok(outcome)
    }
}

/// What a worker did with one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Rejected,
    Requeued,
}

pub struct ConsumerPool {
    consumer: Arc<IdentityChangeConsumer>,
    source: Arc<dyn ExchangeConsumer>,
    workers: usize,
}

impl ConsumerPool {
    pub fn new(consumer: Arc<IdentityChangeConsumer>, source: Arc<dyn ExchangeConsumer>, workers: usize) -> Self {
        Self {
            consumer,
            source,
            workers: workers.max(1),
        }
    }

    /// Spawn the workers. Each stops when `shutdown` fires or the source closes.
    pub fn spawn(self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        info!(workers = self.workers, "Identity consumer pool starting");
        (0..self.workers)
            .map(|worker| {
                let consumer = Arc::clone(&self.consumer);
                let source = Arc::clone(&self.source);
                let shutdown = shutdown.clone();
                tokio::spawn(run_worker(worker, consumer, source, shutdown))
            })
            .collect()
    }

    /// Spawn the workers and wait for all of them to finish.
    pub async fn run(self, shutdown: CancellationToken) {
        for handle in self.spawn(shutdown) {
            if let Err(e) = handle.await {
                error!(error = %e, "Identity consumer worker panicked");
            }
        }
        info!("Identity consumer pool stopped");
    }
}

async fn run_worker(
    worker: usize,
    consumer: Arc<IdentityChangeConsumer>,
    source: Arc<dyn ExchangeConsumer>,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            next = source.next_delivery() => next,
            _ = shutdown.cancelled() => {
                debug!(worker, "Identity consumer worker shutting down");
                return;
            }
        };

        match next {
            Ok(Some(delivery)) => {
                if handle_delivery(&consumer, source.as_ref(), &delivery).await == Settlement::Requeued {
                    tokio::time::sleep(REQUEUE_DELAY).await;
                }
            }
            Ok(None) => {
                info!(worker, "Identity change source closed");
                return;
            }
            Err(e) => {
                warn!(worker, error = %e, "Failed to receive identity change, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {},
                    _ = shutdown.cancelled() => return,
                }
            }
        }
    }
}

/// Decode, apply and settle one delivery.
pub async fn handle_delivery(
    consumer: &IdentityChangeConsumer,
    source: &dyn ExchangeConsumer,
    delivery: &Delivery,
) -> Settlement {
    let event = match IdentityChangeEvent::from_payload(&delivery.payload) {
        Ok(event) => event,
        Err(e) => {
            error!(
                routing_key = %delivery.routing_key,
                error = %e,
                "Malformed identity change, rejecting"
            );
            if let Err(e) = source.nack(delivery.tag, false).await {
                warn!(tag = delivery.tag, error = %e, "Failed to reject delivery");
            }
            return Settlement::Rejected;
        }
    };

    let applier = consumer.clone();
    let pending = event.clone();
    match run_blocking::<_, StoreError, _>(move || applier.on_event(&pending)).await {
        Ok(_) => {
            // Ack only after the apply committed; a lost ack means a harmless redelivery
            if let Err(e) = source.ack(delivery.tag).await {
                warn!(tag = delivery.tag, principal_id = %event.principal_id, error = %e, "Failed to ack delivery");
            }
            Settlement::Acked
        }
        Err(e) => {
            error!(
                principal_id = %event.principal_id,
                revision = event.revision,
                error = %e,
                "Failed to apply identity change, requeueing"
            );
            if let Err(e) = source.nack(delivery.tag, true).await {
                warn!(tag = delivery.tag, error = %e, "Failed to requeue delivery");
            }
            Settlement::Requeued
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::propagation::event::test_event;
    use crate::propagation::exchange::{ExchangePublisher, InMemoryExchange};
    use crate::testutil::temp_cache;
    use proptest::prelude::*;

    fn consumer() -> (IdentityChangeConsumer, tempfile::TempDir) {
        let (cache, dir) = temp_cache();
        (IdentityChangeConsumer::new(Arc::new(cache)), dir)
    }

    #[test]
    fn duplicate_revision_changes_nothing() {
        let (consumer, _dir) = consumer();
        consumer.on_event(&test_event("p-1", 3, "Alice")).unwrap();
        consumer.on_event(&test_event("p-1", 4, "Alice Smith")).unwrap();
        let before = consumer.cache().get("p-1").unwrap().unwrap();

        let outcome = consumer.on_event(&test_event("p-1", 4, "Alice Smith")).unwrap();

        assert_eq!(outcome, ApplyOutcome::Stale { last_applied_revision: 4 });
        assert_eq!(consumer.cache().get("p-1").unwrap().unwrap(), before);
    }

    #[test]
    fn out_of_order_arrival_keeps_newest() {
        let (consumer, _dir) = consumer();
        consumer.on_event(&test_event("p-1", 5, "five")).unwrap();
        consumer.on_event(&test_event("p-1", 3, "three")).unwrap();

        let entry = consumer.cache().get("p-1").unwrap().unwrap();
        assert_eq!(entry.last_applied_revision, 5);
        assert_eq!(entry.display_name, "five");
    }

    #[tokio::test]
    async fn delivery_is_acked_after_apply() {
        let (consumer, _dir) = consumer();
        let exchange = InMemoryExchange::new();
        let payload = test_event("p-1", 1, "Alice").to_payload().unwrap();
        exchange.publish("p-1", &payload).await.unwrap();

        let delivery = exchange.next_delivery().await.unwrap().unwrap();
        let settlement = handle_delivery(&consumer, &exchange, &delivery).await;

        assert_eq!(settlement, Settlement::Acked);
        assert_eq!(exchange.unacked_len().await, 0);
        assert_eq!(exchange.ready_len().await, 0);
        assert!(consumer.cache().get("p-1").unwrap().is_some());
    }

    #[tokio::test]
    async fn malformed_payload_is_rejected_without_requeue() {
        let (consumer, _dir) = consumer();
        let exchange = InMemoryExchange::new();
        exchange.inject("p-1", b"not an event").await;

        let delivery = exchange.next_delivery().await.unwrap().unwrap();
        let settlement = handle_delivery(&consumer, &exchange, &delivery).await;

        assert_eq!(settlement, Settlement::Rejected);
        assert_eq!(exchange.ready_len().await, 0);
        assert_eq!(exchange.unacked_len().await, 0);
    }

    #[tokio::test]
    async fn pool_drains_queue_and_stops_on_cancel() {
        let (consumer, _dir) = consumer();
        let consumer = Arc::new(consumer);
        let exchange = InMemoryExchange::new();
        for (principal, revision) in [("p-1", 1), ("p-2", 1), ("p-1", 2), ("p-1", 2), ("p-2", 3)] {
            let payload = test_event(principal, revision, &format!("{principal}-{revision}"))
                .to_payload()
                .unwrap();
            exchange.publish(principal, &payload).await.unwrap();
        }

        let shutdown = CancellationToken::new();
        let pool = ConsumerPool::new(Arc::clone(&consumer), Arc::new(exchange.clone()), 3);
        let handles = pool.spawn(shutdown.clone());

        tokio::time::timeout(Duration::from_secs(5), async {
            while exchange.ready_len().await > 0 || exchange.unacked_len().await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("queue should drain");

        shutdown.cancel();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        }

        assert_eq!(consumer.cache().get("p-1").unwrap().unwrap().last_applied_revision, 2);
        assert_eq!(consumer.cache().get("p-2").unwrap().unwrap().last_applied_revision, 3);
    }

    fn shuffled_with_duplicates() -> impl Strategy<Value = Vec<u64>> {
        (1u64..12)
            .prop_flat_map(|max| {
                let revisions: Vec<u64> = (1..=max).collect();
                (Just(revisions), proptest::collection::vec(1..=max, 0..6))
            })
            .prop_flat_map(|(mut revisions, duplicates)| {
                revisions.extend(duplicates);
                Just(revisions).prop_shuffle()
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn any_order_with_duplicates_converges_to_highest(order in shuffled_with_duplicates()) {
            let (consumer, _dir) = consumer();
            for revision in &order {
                consumer.on_event(&test_event("p-1", *revision, &format!("rev-{revision}"))).unwrap();
            }

            let (reference, _ref_dir) = self::consumer();
            let highest = *order.iter().max().unwrap();
            reference.on_event(&test_event("p-1", highest, &format!("rev-{highest}"))).unwrap();

            let got = consumer.cache().get("p-1").unwrap().unwrap();
            let want = reference.cache().get("p-1").unwrap().unwrap();
            prop_assert_eq!(got.last_applied_revision, want.last_applied_revision);
            prop_assert_eq!(got.display_name, want.display_name);
            prop_assert_eq!(got.account_state, want.account_state);
            prop_assert_eq!(got.role, want.role);
        }
    }
}
