// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Principal roles carried in access tokens.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Roles a principal can hold on the platform.
///
/// ## Role Hierarchy
///
/// - `Admin` - Account administration (verify, lock, unlock)
/// - `Physician` - Reads records shared with them
/// - `Patient` - Owns their own record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Physician,
    Patient,
}

impl Role {
    /// Check if this role has at least the privileges of the required role.
    pub fn has_privilege(&self, required: Role) -> bool {
        match (self, required) {
            (Role::Admin, _) => true,
            (Role::Physician, Role::Physician | Role::Patient) => true,
            (Role::Patient, Role::Patient) => true,
            _ => false,
        }
    }

    /// Parse role from string (case-insensitive).
    pub fn from_str(s: &str) -> Option<Role> {
        match s.to_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "physician" => Some(Role::Physician),
            "patient" => Some(Role::Patient),
            _ => None,
        }
    }

    /// Default scopes granted with this role.
    pub fn default_scopes(&self) -> Vec<String> {
        let scopes: &[&str] = match self {
            Role::Admin => &["files:read", "files:write", "accounts:admin"],
            Role::Physician => &["files:read"],
            Role::Patient => &["files:read", "files:write"],
        };
        scopes.iter().map(|s| s.to_string()).collect()
    }
}

impl Default for Role {
    /// Self-registered and social accounts are patients.
    fn default() -> Self {
        Role::Patient
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Admin => write!(f, "admin"),
            Role::Physician => write!(f, "physician"),
            Role::Patient => write!(f, "patient"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_has_all_privileges() {
        assert!(Role::Admin.has_privilege(Role::Admin));
        assert!(Role::Admin.has_privilege(Role::Physician));
        assert!(Role::Admin.has_privilege(Role::Patient));
    }

    #[test]
    fn patient_only_has_patient_privilege() {
        assert!(!Role::Patient.has_privilege(Role::Admin));
        assert!(!Role::Patient.has_privilege(Role::Physician));
        assert!(Role::Patient.has_privilege(Role::Patient));
    }

    #[test]
    fn from_str_parses_case_insensitively() {
        assert_eq!(Role::from_str("admin"), Some(Role::Admin));
        assert_eq!(Role::from_str("PHYSICIAN"), Some(Role::Physician));
        assert_eq!(Role::from_str("Patient"), Some(Role::Patient));
        assert_eq!(Role::from_str("nurse"), None);
    }

    #[test]
    fn default_role_is_patient() {
        assert_eq!(Role::default(), Role::Patient);
        assert!(Role::Patient.default_scopes().contains(&"files:write".to_string()));
    }
}
