// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Message exchange abstraction.
//!
//! Publishers send payloads to a durable topic exchange under a routing key;
//! consumers pull deliveries from a bound queue and settle each one
//! explicitly. A delivery that is never acknowledged is redelivered, which
//! gives at-least-once semantics.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ExchangeError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("publish not confirmed: {0}")]
    NotConfirmed(String),

    #[error("settlement failed: {0}")]
    Settlement(String),
}

/// One message handed to a consumer, pending settlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: u64,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub redelivered: bool,
}

#[async_trait]
pub trait ExchangePublisher: Send + Sync {
    /// Resolves once the broker has taken responsibility for the message.
    async fn publish(&self, routing_key: &str, payload: &[u8]) -> Result<(), ExchangeError>;
}

#[async_trait]
pub trait ExchangeConsumer: Send + Sync {
    /// Wait for the next delivery. `Ok(None)` means the source is closed.
    async fn next_delivery(&self) -> Result<Option<Delivery>, ExchangeError>;

    async fn ack(&self, tag: u64) -> Result<(), ExchangeError>;

    /// Negative acknowledgement. With `requeue` the message is redelivered,
    /// otherwise it is dropped (or dead-lettered by the broker).
    async fn nack(&self, tag: u64, requeue: bool) -> Result<(), ExchangeError>;
}

// =============================================================================
// In-memory exchange
// =============================================================================

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Delivery>,
    unacked: HashMap<u64, Delivery>,
}

struct Inner {
    state: Mutex<QueueState>,
    notify: Notify,
    available: AtomicBool,
    closed: AtomicBool,
    fail_next: AtomicU32,
    next_tag: AtomicU64,
    published: AtomicU64,
}

/// Topic exchange with a single queue bound to `#`, held in process.
///
/// Used by tests and the `dev` build. Broker outages can be simulated with
/// [`InMemoryExchange::set_available`] and [`InMemoryExchange::fail_next`].
#[derive(Clone)]
pub struct InMemoryExchange {
    inner: Arc<Inner>,
}

impl Default for InMemoryExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryExchange {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                available: AtomicBool::new(true),
                closed: AtomicBool::new(false),
                fail_next: AtomicU32::new(0),
                next_tag: AtomicU64::new(1),
                published: AtomicU64::new(0),
            }),
        }
    }

    /// Simulate the broker going down (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Fail the next `count` publishes regardless of availability.
    pub fn fail_next(&self, count: u32) {
        self.inner.fail_next.store(count, Ordering::SeqCst);
    }

    /// Stop handing out deliveries; blocked consumers return `Ok(None)`.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Messages confirmed by `publish` so far.
    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::SeqCst)
    }

    pub async fn ready_len(&self) -> usize {
        self.inner.state.lock().await.ready.len()
    }

    pub async fn unacked_len(&self) -> usize {
        self.inner.state.lock().await.unacked.len()
    }

    /// Inject a raw payload, bypassing publish failures.
    pub async fn inject(&self, routing_key: &str, payload: &[u8]) {
        self.enqueue(routing_key, payload).await;
    }

    async fn enqueue(&self, routing_key: &str, payload: &[u8]) {
        let delivery = Delivery {
            tag: self.inner.next_tag.fetch_add(1, Ordering::SeqCst),
            routing_key: routing_key.to_string(),
            payload: payload.to_vec(),
            redelivered: false,
        };
        self.inner.state.lock().await.ready.push_back(delivery);
        self.inner.notify.notify_one();
    }

    fn take_failure(&self) -> bool {
        self.inner
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ExchangePublisher for InMemoryExchange {
    async fn publish(&self, routing_key: &str, payload: &[u8]) -> Result<(), ExchangeError> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(ExchangeError::Unavailable("connection refused".to_string()));
        }
        if self.take_failure() {
            return Err(ExchangeError::NotConfirmed("injected failure".to_string()));
        }
        self.enqueue(routing_key, payload).await;
        self.inner.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl ExchangeConsumer for InMemoryExchange {
    async fn next_delivery(&self) -> Result<Option<Delivery>, ExchangeError> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent publish cannot be missed
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock().await;
                if let Some(delivery) = state.ready.pop_front() {
                    state.unacked.insert(delivery.tag, delivery.clone());
                    return Ok(Some(delivery));
                }
            }
            if self.inner.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            notified.await;
        }
    }

    async fn ack(&self, tag: u64) -> Result<(), ExchangeError> {
        let mut state = self.inner.state.lock().await;
        state
            .unacked
            .remove(&tag)
            .map(|_| ())
            .ok_or_else(|| ExchangeError::Settlement(format!("unknown delivery tag {tag}")))
    }

    async fn nack(&self, tag: u64, requeue: bool) -> Result<(), ExchangeError> {
        let mut state = self.inner.state.lock().await;
        let mut delivery = state
            .unacked
            .remove(&tag)
            .ok_or_else(|| ExchangeError::Settlement(format!("unknown delivery tag {tag}")))?;
        if requeue {
            delivery.redelivered = true;
            state.ready.push_front(delivery);
            drop(state);
            self.inner.notify.notify_one();
        }
        Ok(())
    }
}
