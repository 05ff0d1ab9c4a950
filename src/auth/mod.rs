// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Authentication Module
//!
//! Credential checks, access token issuance and offline verification.
//!
//! ## Auth Flow
//!
//! 1. Client logs in with a password or a social provider's ID token
//! 2. [`SessionService`] checks the credential and, for a first social
//!    login, provisions the principal (committed and published first)
//! 3. [`TokenSigner`] issues a short-lived access token signed with the
//!    issuer's private key, plus an opaque refresh token
//! 4. Dependent services verify access tokens with [`TokenVerifier`] using
//!    only the issuer's public keys
//!
//! ## Security
//!
//! - Passwords are stored as Argon2id hashes and compared in constant time
//! - Unknown principals still cost one full hash verification
//! - HTTP callers see one `authentication_failed` code for every credential
//!   failure
//! - Issuance fails closed when the signing key is unavailable

pub mod claims;
pub mod error;
pub mod extractor;
pub mod jwks;
pub mod keys;
pub mod password;
pub mod refresh;
pub mod roles;
pub mod session;
pub mod signer;
pub mod social;
pub mod verifier;

pub use claims::{AccessToken, AuthenticatedUser, Claims, VerifiedToken};
pub use error::{AuthError, LoginError, TokenError};
pub use extractor::{AdminOnly, Auth};
pub use jwks::JwksManager;
pub use keys::{KeyError, KeyMaterial};
pub use password::{Argon2Config, PasswordPolicy, PasswordService};
pub use roles::Role;
pub use session::{IssuedSession, LoginStage, SessionService};
pub use signer::TokenSigner;
pub use social::{SocialAssertionVerifier, SocialIdentity};
pub use verifier::TokenVerifier;
