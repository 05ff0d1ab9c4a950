// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Token key material.
//!
//! Keys are loaded once at startup into an immutable [`KeyMaterial`] and
//! handed to the signer and verifier. Services that only verify tokens carry
//! no signing key at all.
//!
//! ## Key identifiers
//!
//! Every verifying key gets a `kid` derived from the SHA-256 of its PEM
//! body. The signing key borrows the `kid` of the first (newest) verifying
//! key, which must be its own public half; this is checked on load by
//! signing and verifying a probe message.

use std::path::{Path, PathBuf};

use jsonwebtoken::{crypto, Algorithm, DecodingKey, EncodingKey};
use sha2::{Digest, Sha256};
use tracing::{error, info};

use crate::config::TokenConfig;

/// Characters of the hex digest kept as `kid`.
const KID_LEN: usize = 16;

const PROBE_MESSAGE: &[u8] = b"patientenakte-key-probe";

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("failed to read key file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid {algorithm:?} key: {reason}")]
    InvalidKey { algorithm: Algorithm, reason: String },

    #[error("algorithm {0:?} is not supported for access tokens")]
    UnsupportedAlgorithm(Algorithm),

    #[error("at least one verifying key is required")]
    NoVerifyingKeys,

    #[error("signing key does not match the newest verifying key")]
    KeyMismatch,
}

#[derive(Clone, Copy)]
enum KeyFamily {
    Rsa,
    Ec,
    Ed,
}

fn family(algorithm: Algorithm) -> Result<KeyFamily, KeyError> {
    match algorithm {
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512 => Ok(KeyFamily::Rsa),
        Algorithm::ES256 | Algorithm::ES384 => Ok(KeyFamily::Ec),
        Algorithm::EdDSA => Ok(KeyFamily::Ed),
        other => Err(KeyError::UnsupportedAlgorithm(other)),
    }
}

/// Short stable identifier for a public key.
pub fn key_id(public_pem: &[u8]) -> String {
    let digest = Sha256::digest(normalize_pem(public_pem));
    digest
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<String>()
        .chars()
        .take(KID_LEN)
        .collect()
}

// Line endings and trailing whitespace must not change the kid
fn normalize_pem(pem: &[u8]) -> Vec<u8> {
    String::from_utf8_lossy(pem)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
        .into_bytes()
}

/// Private key used to sign access tokens.
#[derive(Clone)]
pub struct SigningKey {
    kid: String,
    algorithm: Algorithm,
    key: EncodingKey,
}

impl SigningKey {
    pub fn from_pem(algorithm: Algorithm, pem: &[u8], kid: impl Into<String>) -> Result<Self, KeyError> {
        let invalid = |e: jsonwebtoken::errors::Error| KeyError::InvalidKey {
            algorithm,
            reason: e.to_string(),
        };
        let key = match family(algorithm)? {
            KeyFamily::Rsa => EncodingKey::from_rsa_pem(pem).map_err(invalid)?,
            KeyFamily::Ec => EncodingKey::from_ec_pem(pem).map_err(invalid)?,
            KeyFamily::Ed => EncodingKey::from_ed_pem(pem).map_err(invalid)?,
        };
        Ok(Self {
            kid: kid.into(),
            algorithm,
            key,
        })
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub(crate) fn encoding_key(&self) -> &EncodingKey {
        &self.key
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// Public key accepted when verifying access tokens.
#[derive(Clone)]
pub struct VerifyingKey {
    kid: String,
    algorithm: Algorithm,
    key: DecodingKey,
}

impl VerifyingKey {
    pub fn from_pem(algorithm: Algorithm, pem: &[u8]) -> Result<Self, KeyError> {
        let invalid = |e: jsonwebtoken::errors::Error| KeyError::InvalidKey {
            algorithm,
            reason: e.to_string(),
        };
        let key = match family(algorithm)? {
            KeyFamily::Rsa => DecodingKey::from_rsa_pem(pem).map_err(invalid)?,
            KeyFamily::Ec => DecodingKey::from_ec_pem(pem).map_err(invalid)?,
            KeyFamily::Ed => DecodingKey::from_ed_pem(pem).map_err(invalid)?,
        };
        Ok(Self {
            kid: key_id(pem),
            algorithm,
            key,
        })
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub(crate) fn decoding_key(&self) -> &DecodingKey {
        &self.key
    }
}

impl std::fmt::Debug for VerifyingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifyingKey")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// Immutable key set shared by the signer and verifier.
#[derive(Debug, Clone)]
pub struct KeyMaterial {
    signing: Option<SigningKey>,
    verifying: Vec<VerifyingKey>,
}

impl KeyMaterial {
    /// Assemble key material. `verifying` is ordered newest first.
    pub fn new(signing: Option<SigningKey>, verifying: Vec<VerifyingKey>) -> Result<Self, KeyError> {
        let newest = verifying.first().ok_or(KeyError::NoVerifyingKeys)?;
        if let Some(signing) = &signing {
            check_pair(signing, newest)?;
        }
        Ok(Self { signing, verifying })
    }

    /// Verification-only key material.
    pub fn verifying_only(verifying: Vec<VerifyingKey>) -> Result<Self, KeyError> {
        Self::new(None, verifying)
    }

    /// Load keys from the configured paths.
    ///
    /// A broken verifying key aborts start-up. A signing key that cannot be
    /// loaded leaves the material without one: verification keeps working
    /// and every issue attempt fails closed.
    pub fn load(config: &TokenConfig) -> Result<Self, KeyError> {
        let mut verifying = Vec::with_capacity(config.public_key_paths.len());
        for path in &config.public_key_paths {
            let pem = read_key_file(path)?;
            verifying.push(VerifyingKey::from_pem(config.algorithm, &pem)?);
        }
        let newest_kid = verifying.first().ok_or(KeyError::NoVerifyingKeys)?.kid().to_string();

        let signing = match &config.private_key_path {
            Some(path) => match load_signing_key(config.algorithm, path, &newest_kid) {
                Ok(key) => Some(key),
                Err(e) => {
                    error!(path = %path.display(), error = %e, "Signing key unavailable, token issuance disabled");
                    None
                }
            },
            None => None,
        };

        let material = match Self::new(signing, verifying.clone()) {
            Ok(material) => material,
            Err(KeyError::KeyMismatch) => {
                error!("Signing key does not match the newest verifying key, token issuance disabled");
                Self::verifying_only(verifying)?
            }
            Err(e) => return Err(e),
        };

        info!(
            algorithm = ?config.algorithm,
            verifying_keys = material.verifying.len(),
            signing = material.signing.is_some(),
            kid = %newest_kid,
            "Token keys loaded"
        );
        Ok(material)
    }

    pub fn signing_key(&self) -> Option<&SigningKey> {
        self.signing.as_ref()
    }

    pub fn verifying_keys(&self) -> &[VerifyingKey] {
        &self.verifying
    }

    pub fn can_sign(&self) -> bool {
        self.signing.is_some()
    }
}

fn read_key_file(path: &Path) -> Result<Vec<u8>, KeyError> {
    std::fs::read(path).map_err(|source| KeyError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn load_signing_key(algorithm: Algorithm, path: &Path, kid: &str) -> Result<SigningKey, KeyError> {
    let pem = read_key_file(path)?;
    SigningKey::from_pem(algorithm, &pem, kid)
}

fn check_pair(signing: &SigningKey, verifying: &VerifyingKey) -> Result<(), KeyError> {
    if signing.algorithm != verifying.algorithm {
        return Err(KeyError::KeyMismatch);
    }
    let signature = crypto::sign(PROBE_MESSAGE, &signing.key, signing.algorithm).map_err(|e| {
        KeyError::InvalidKey {
            algorithm: signing.algorithm,
            reason: e.to_string(),
        }
    })?;
    match crypto::verify(&signature, PROBE_MESSAGE, &verifying.key, verifying.algorithm) {
        Ok(true) => Ok(()),
        _ => Err(KeyError::KeyMismatch),
    }
}
