// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Patientenakte Identity - credential issuance and identity propagation
//!
//! Authenticates principals of the patient-record platform, issues access
//! tokens that dependent services verify offline, and propagates every
//! identity change to those services over a durable exchange.
//!
//! ## Modules
//!
//! - `accounts` - Registration, verification and other identity mutations
//! - `api` - HTTP API handlers (Axum)
//! - `auth` - Passwords, social assertions, token signing and verification
//! - `notify` - Verification and password reset e-mails via a mail relay webhook
//! - `propagation` - Identity change publisher, outbox sweeper and consumer
//! - `storage` - Credential store and local identity cache (redb)

pub mod accounts;
pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod notify;
pub mod propagation;
pub mod state;
pub mod storage;

#[cfg(test)]
pub(crate) mod testutil;
