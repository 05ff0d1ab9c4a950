// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Per-principal async locks.
//!
//! Mutations of one principal are serialized from read through publication
//! so its events reach the exchange in revision order. Principals never
//! contend with each other. Idle entries are removed when the last guard
//! for a key is dropped.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Clone, Default)]
pub struct PrincipalLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

/// Held while a principal is being mutated.
pub struct PrincipalGuard {
    guard: Option<OwnedMutexGuard<()>>,
    key: String,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl PrincipalLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn acquire(&self, key: &str) -> PrincipalGuard {
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        PrincipalGuard {
            guard: Some(guard),
            key: key.to_string(),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Take `key` only if nobody holds it.
    pub fn try_acquire(&self, key: &str) -> Option<PrincipalGuard> {
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.try_lock_owned().ok();
        let guard = PrincipalGuard {
            guard,
            key: key.to_string(),
            locks: Arc::clone(&self.locks),
        };
        // Dropping a guard without a lock still runs the idle cleanup
        guard.guard.is_some().then_some(guard)
    }

    /// Keys currently tracked (held or awaited).
    pub fn tracked(&self) -> usize {
        self.locks.len()
    }
}

impl Drop for PrincipalGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map's own reference left means no holder and no waiter
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
