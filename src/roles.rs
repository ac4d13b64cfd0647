//! Role code → assignee resolution.
//!
//! A directory entry may link an identity directly. If it only carries a
//! contact address, the resolver soft-matches that address against known
//! users and writes the match back onto the entry, so later lookups take the
//! direct path.

use crate::calendar::is_yaml_path;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("Directory unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to read directory file {path}: {reason}")]
    File { path: String, reason: String },
}

/// A role as held by the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleEntry {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_email: Option<String>,
}

/// Consumed interface of the user/role directory.
pub trait RoleDirectory: Send + Sync {
    fn lookup(&self, role_code: &str) -> Result<Option<RoleEntry>, DirectoryError>;

    /// Find an assignable identity whose address matches `contact`.
    fn find_identity_by_contact(&self, contact: &str) -> Result<Option<String>, DirectoryError>;

    /// Persist a soft-matched identity onto the role entry.
    fn link_identity(&self, role_code: &str, identity: &str) -> Result<(), DirectoryError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedReason {
    UnknownRole,
    NoMatchingUser,
    DirectoryError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Assigned(String),
    Unresolved(UnresolvedReason),
}

impl Resolution {
    pub fn assignee(&self) -> Option<String> {
        match self {
            Resolution::Assigned(identity) => Some(identity.clone()),
            Resolution::Unresolved(_) => None,
        }
    }
}

pub struct RoleResolver<'a> {
    directory: &'a dyn RoleDirectory,
}

impl<'a> RoleResolver<'a> {
    pub fn new(directory: &'a dyn RoleDirectory) -> Self {
        Self { directory }
    }

    /// Never fails: directory errors degrade to `Unresolved`.
    pub fn resolve(&self, role_code: &str) -> Resolution {
        let role_code = role_code.trim();
        let entry = match self.directory.lookup(role_code) {
            Ok(Some(entry)) => entry,
            Ok(None) => return Resolution::Unresolved(UnresolvedReason::UnknownRole),
            Err(e) => {
                warn!(role_code, error = %e, "Role lookup failed");
                return Resolution::Unresolved(UnresolvedReason::DirectoryError);
            }
        };

        if let Some(identity) = entry.identity.filter(|i| !i.trim().is_empty()) {
            return Resolution::Assigned(identity);
        }

        let Some(contact) = entry.contact_email.filter(|c| !c.trim().is_empty()) else {
            return Resolution::Unresolved(UnresolvedReason::NoMatchingUser);
        };

        match self.directory.find_identity_by_contact(&contact) {
            Ok(Some(identity)) => {
                debug!(role_code, identity = %identity, "Soft-matched role by contact address");
                if let Err(e) = self.directory.link_identity(role_code, &identity) {
                    warn!(role_code, error = %e, "Could not cache soft-matched identity");
                }
                Resolution::Assigned(identity)
            }
            Ok(None) => Resolution::Unresolved(UnresolvedReason::NoMatchingUser),
            Err(e) => {
                warn!(role_code, error = %e, "Contact lookup failed");
                Resolution::Unresolved(UnresolvedReason::DirectoryError)
            }
        }
    }
}

/// A user that roles can be soft-matched to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryUser {
    pub identity: String,
    pub email: String,
}

/// On-disk directory document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryDocument {
    #[serde(default)]
    pub roles: Vec<RoleEntry>,
    #[serde(default)]
    pub users: Vec<DirectoryUser>,
}

/// In-memory directory.
#[derive(Default)]
pub struct InMemoryRoleDirectory {
    roles: RwLock<HashMap<String, RoleEntry>>,
    /// Lowercased email → identity.
    users: HashMap<String, String>,
    lookups: RwLock<u64>,
}

impl InMemoryRoleDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_document(doc: DirectoryDocument) -> Self {
        Self {
            roles: RwLock::new(
                doc.roles
                    .into_iter()
                    .map(|r| (r.code.trim().to_string(), r))
                    .collect(),
            ),
            users: doc
                .users
                .into_iter()
                .map(|u| (u.email.trim().to_lowercase(), u.identity))
                .collect(),
            lookups: RwLock::new(0),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, DirectoryError> {
        let file_err = |reason: String| DirectoryError::File {
            path: path.display().to_string(),
            reason,
        };
        let raw = std::fs::read_to_string(path).map_err(|e| file_err(e.to_string()))?;
        let doc: DirectoryDocument = if is_yaml_path(path) {
            serde_yaml::from_str(&raw).map_err(|e| file_err(e.to_string()))?
        } else {
            serde_json::from_str(&raw).map_err(|e| file_err(e.to_string()))?
        };
        Ok(Self::from_document(doc))
    }

    pub fn with_role(self, code: &str, identity: Option<&str>, contact: Option<&str>) -> Self {
        if let Ok(mut roles) = self.roles.write() {
            roles.insert(
                code.to_string(),
                RoleEntry {
                    code: code.to_string(),
                    identity: identity.map(str::to_string),
                    contact_email: contact.map(str::to_string),
                },
            );
        }
        self
    }

    pub fn with_user(mut self, identity: &str, email: &str) -> Self {
        self.users
            .insert(email.trim().to_lowercase(), identity.to_string());
        self
    }

    /// Number of contact-address lookups served so far.
    pub fn contact_lookups(&self) -> u64 {
        self.lookups.read().map(|l| *l).unwrap_or(0)
    }
}

impl RoleDirectory for InMemoryRoleDirectory {
    fn lookup(&self, role_code: &str) -> Result<Option<RoleEntry>, DirectoryError> {
        let roles = self
            .roles
            .read()
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
        Ok(roles.get(role_code).cloned())
    }

    fn find_identity_by_contact(&self, contact: &str) -> Result<Option<String>, DirectoryError> {
        *self
            .lookups
            .write()
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))? += 1;
        Ok(self.users.get(&contact.trim().to_lowercase()).cloned())
    }

    fn link_identity(&self, role_code: &str, identity: &str) -> Result<(), DirectoryError> {
        let mut roles = self
            .roles
            .write()
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
        if let Some(entry) = roles.get_mut(role_code) {
            entry.identity = Some(identity.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> InMemoryRoleDirectory {
        InMemoryRoleDirectory::new()
            .with_role("PAYROLL", Some("alice"), None)
            .with_role("CONTROLLER", None, Some("Controller@Example.com"))
            .with_role("CFO", None, Some("cfo@example.com"))
            .with_role("AUDIT", None, None)
            .with_user("bob", "controller@example.com")
    }

    #[test]
    fn direct_identity_wins() {
        let dir = directory();
        let resolver = RoleResolver::new(&dir);
        assert_eq!(
            resolver.resolve("PAYROLL"),
            Resolution::Assigned("alice".to_string())
        );
        assert_eq!(dir.contact_lookups(), 0);
    }

    #[test]
    fn soft_match_is_cached_on_the_entry() {
        let dir = directory();
        let resolver = RoleResolver::new(&dir);
        assert_eq!(
            resolver.resolve("CONTROLLER"),
            Resolution::Assigned("bob".to_string())
        );
        assert_eq!(
            resolver.resolve("CONTROLLER"),
            Resolution::Assigned("bob".to_string())
        );
        assert_eq!(dir.contact_lookups(), 1, "second resolve uses the cached link");
        assert_eq!(
            dir.lookup("CONTROLLER").unwrap().unwrap().identity.as_deref(),
            Some("bob")
        );
    }

    #[test]
    fn misses_are_unresolved_not_errors() {
        let dir = directory();
        let resolver = RoleResolver::new(&dir);
        assert_eq!(
            resolver.resolve("TREASURY"),
            Resolution::Unresolved(UnresolvedReason::UnknownRole)
        );
        assert_eq!(
            resolver.resolve("CFO"),
            Resolution::Unresolved(UnresolvedReason::NoMatchingUser)
        );
        assert_eq!(
            resolver.resolve("AUDIT"),
            Resolution::Unresolved(UnresolvedReason::NoMatchingUser)
        );
        assert_eq!(resolver.resolve("AUDIT").assignee(), None);
    }

    #[test]
    fn directory_document_parses() {
        let doc: DirectoryDocument = serde_json::from_str(
            r#"{ "roles": [ { "code": "TAX", "contact_email": "tax@example.com" } ],
                 "users": [ { "identity": "carol", "email": "TAX@example.com" } ] }"#,
        )
        .unwrap();
        let dir = InMemoryRoleDirectory::from_document(doc);
        assert_eq!(
            RoleResolver::new(&dir).resolve("TAX"),
            Resolution::Assigned("carol".to_string())
        );
    }
}
