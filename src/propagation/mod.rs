// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Identity Propagation
//!
//! One-way flow of identity changes from the credential store to dependent
//! services:
//!
//! ```text
//! mutation commit (+ outbox row) → IdentityChangePublisher → exchange
//!                   ↑ OutboxSweeper (deferred / orphaned rows)
//! exchange → ConsumerPool → IdentityChangeConsumer → LocalIdentityCache
//! ```
//!
//! Delivery is at-least-once. Consumers converge by revision, never by
//! arrival order.

pub mod amqp;
pub mod consumer;
pub mod event;
pub mod exchange;
pub mod publisher;
pub mod sweeper;

pub use amqp::{AmqpConfig, AmqpExchange};
pub use consumer::{ConsumerPool, IdentityChangeConsumer, Settlement};
pub use event::{IdentityChangeEvent, IdentitySnapshot};
pub use exchange::{Delivery, ExchangeConsumer, ExchangeError, ExchangePublisher, InMemoryExchange};
pub use publisher::{IdentityChangePublisher, PublishError, PublishOutcome, RetryPolicy};
pub use sweeper::{OutboxSweeper, SweepReport};
