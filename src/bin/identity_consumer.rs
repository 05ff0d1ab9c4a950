// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Identity consumer daemon.
//!
//! Runs the worker pool of a dependent service: pulls identity changes from
//! the AMQP queue bound to the user-update exchange and keeps the local
//! identity cache converged by revision.

use std::sync::Arc;

use patientenakte_identity::{
    config::ServiceConfig,
    logging::{init_logging, shutdown_signal},
    propagation::{AmqpConfig, AmqpExchange, ConsumerPool, IdentityChangeConsumer},
    storage::LocalIdentityCache,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

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

    let cache_path = config.identity_cache_db_path();
    let cache = match LocalIdentityCache::open(&cache_path) {
        Ok(cache) => Arc::new(cache),
        Err(e) => {
            error!(path = %cache_path.display(), error = %e, "Failed to open local identity cache");
            std::process::exit(1);
        }
    };
    info!(
        path = %cache_path.display(),
        entries = cache.len().unwrap_or_default(),
        queue = %config.queue.queue_name,
        exchange = %config.queue.exchange_name,
        "Identity consumer starting"
    );

    let exchange = Arc::new(AmqpExchange::new(AmqpConfig::consumer(&config.queue)));
    let consumer = Arc::new(IdentityChangeConsumer::new(cache));
    let pool = ConsumerPool::new(consumer, exchange.clone(), config.consumer_workers);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    pool.run(shutdown).await;
    exchange.close().await;
    info!("Identity consumer stopped");
}
