// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! JWKS (JSON Web Key Set) fetching and caching for the social identity
//! provider.
//!
//! - Keys are cached with a configurable TTL
//! - An unknown `kid` forces a refetch, so provider key rotation is picked
//!   up without waiting for the TTL. Forced refetches happen at most once
//!   per `min_refetch_interval`, and concurrent callers share one fetch, so
//!   a stream of tokens with made-up `kid`s cannot drive traffic to the
//!   provider
//! - A failed refetch falls back to the stale cache when one exists

use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::jwk::{AlgorithmParameters, Jwk, JwkSet, KeyAlgorithm};
use jsonwebtoken::{Algorithm, DecodingKey};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Default JWKS cache TTL (5 minutes).
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Minimum age of the cache before an unknown `kid` may trigger a refetch.
const DEFAULT_MIN_REFETCH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, thiserror::Error)]
pub enum JwksError {
    #[error("failed to fetch JWKS: {0}")]
    Fetch(String),
    #[error("no matching key in JWKS")]
    NoMatchingKey,
    #[error("unsupported key in JWKS: {0}")]
    UnsupportedKey(String),
}

struct CacheEntry {
    jwks: JwkSet,
    fetched_at: Instant,
}

/// JWKS manager with caching.
#[derive(Clone)]
pub struct JwksManager {
    jwks_url: String,
    cache_ttl: Duration,
    min_refetch_interval: Duration,
    cache: Arc<RwLock<Option<CacheEntry>>>,
    fetching: Arc<Mutex<()>>,
    client: reqwest::Client,
}

impl JwksManager {
    pub fn new(jwks_url: impl Into<String>) -> Self {
        Self {
            jwks_url: jwks_url.into(),
            cache_ttl: DEFAULT_CACHE_TTL,
            min_refetch_interval: DEFAULT_MIN_REFETCH_INTERVAL,
            cache: Arc::new(RwLock::new(None)),
            fetching: Arc::new(Mutex::new(())),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_min_refetch_interval(mut self, interval: Duration) -> Self {
        self.min_refetch_interval = interval;
        self
    }

    pub fn jwks_url(&self) -> &str {
        &self.jwks_url
    }

    /// Decoding key for `kid`, or the first usable key when the token has none.
    pub async fn decoding_key(&self, kid: Option<&str>) -> Result<(DecodingKey, Algorithm), JwksError> {
        let jwks = self.get_jwks(false).await?;
        match select_key(&jwks, kid) {
            Err(JwksError::NoMatchingKey) if kid.is_some() => {
                debug!(kid, "Unknown kid, refetching provider JWKS");
                let jwks = self.get_jwks(true).await?;
                select_key(&jwks, kid)
            }
            other => other,
        }
    }

    pub async fn is_cached(&self) -> bool {
        let cache = self.cache.read().await;
        cache
            .as_ref()
            .is_some_and(|entry| entry.fetched_at.elapsed() < self.cache_ttl)
    }

    /// Cached keys, refetched when older than the TTL. `force` lowers the
    /// threshold to the minimum refetch interval.
    async fn get_jwks(&self, force: bool) -> Result<JwkSet, JwksError> {
        let max_age = if force { self.min_refetch_interval } else { self.cache_ttl };
        if let Some(jwks) = self.cached_within(max_age).await {
            return Ok(jwks);
        }

        let _fetching = self.fetching.lock().await;
        // Another caller may have refreshed the cache while we waited
        if let Some(jwks) = self.cached_within(max_age).await {
            return Ok(jwks);
        }

        match self.fetch_jwks().await {
            Ok(jwks) => {
                let mut cache = self.cache.write().await;
                *cache = Some(CacheEntry {
                    jwks: jwks.clone(),
                    fetched_at: Instant::now(),
                });
                Ok(jwks)
            }
            Err(e) => {
                let cache = self.cache.read().await;
                match &*cache {
                    Some(entry) => {
                        warn!(error = %e, "JWKS refresh failed, using stale keys");
                        Ok(entry.jwks.clone())
                    }
                    None => Err(e),
                }
            }
        }
    }

    async fn cached_within(&self, max_age: Duration) -> Option<JwkSet> {
        let cache = self.cache.read().await;
        cache
            .as_ref()
            .filter(|entry| entry.fetched_at.elapsed() < max_age)
            .map(|entry| entry.jwks.clone())
    }

    async fn fetch_jwks(&self) -> Result<JwkSet, JwksError> {
        let response = self
            .client
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|e| JwksError::Fetch(e.to_string()))?;

        if !response.status().is_success() {
            return Err(JwksError::Fetch(format!(
                "HTTP {} from JWKS endpoint",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| JwksError::Fetch(e.to_string()))
    }
}

fn select_key(jwks: &JwkSet, kid: Option<&str>) -> Result<(DecodingKey, Algorithm), JwksError> {
    match kid {
        Some(kid) => {
            let jwk = jwks
                .keys
                .iter()
                .find(|k| k.common.key_id.as_deref() == Some(kid))
                .ok_or(JwksError::NoMatchingKey)?;
            jwk_to_decoding_key(jwk)
        }
        None => jwks
            .keys
            .iter()
            .find_map(|jwk| jwk_to_decoding_key(jwk).ok())
            .ok_or(JwksError::NoMatchingKey),
    }
}

/// Convert a JWK to a DecodingKey.
pub(crate) fn jwk_to_decoding_key(jwk: &Jwk) -> Result<(DecodingKey, Algorithm), JwksError> {
    match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => {
            let key = DecodingKey::from_rsa_components(&rsa.n, &rsa.e)
                .map_err(|e| JwksError::UnsupportedKey(format!("RSA: {e}")))?;
            let alg = match jwk.common.key_algorithm {
                Some(KeyAlgorithm::RS384) => Algorithm::RS384,
                Some(KeyAlgorithm::RS512) => Algorithm::RS512,
                _ => Algorithm::RS256,
            };
            Ok((key, alg))
        }
        AlgorithmParameters::EllipticCurve(ec) => {
            let key = DecodingKey::from_ec_components(&ec.x, &ec.y)
                .map_err(|e| JwksError::UnsupportedKey(format!("EC: {e}")))?;
            let alg = match jwk.common.key_algorithm {
                Some(KeyAlgorithm::ES384) => Algorithm::ES384,
                _ => Algorithm::ES256,
            };
            Ok((key, alg))
        }
        _ => Err(JwksError::UnsupportedKey("key type".to_string())),
    }
}
