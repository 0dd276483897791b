//! Role and OU scope resolution
//!
//! Pure functions of the entry presented. Nothing is cached, so every
//! authorization check sees the current attribute values.

use serde::{Deserialize, Serialize};

use crate::models::{same_ou, DirectoryEntry, Role};

/// Access role from the multi-valued role attribute.
///
/// `root` wins over `admin`; anything else, or no value, is `User`.
pub fn resolve_role(entry: &DirectoryEntry) -> Role {
    let mut role = Role::User;
    for value in &entry.roles {
        match Role::from_marker(value) {
            Some(Role::Root) => return Role::Root,
            Some(Role::OuAdmin) => role = Role::OuAdmin,
            _ => {}
        }
    }
    role
}

/// OU the entry is confined to.
///
/// The explicit `ou` attribute wins; otherwise the `ou` component of the
/// naming path. Root-level identities have neither.
pub fn resolve_ou(entry: &DirectoryEntry) -> Option<String> {
    entry
        .ou
        .as_deref()
        .map(str::trim)
        .filter(|ou| !ou.is_empty())
        .map(ToString::to_string)
        .or_else(|| entry.path.ou().map(ToString::to_string))
}

/// The acting party of an engine call, resolved from its own entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub uid: String,
    pub role: Role,
    pub ou_scope: Option<String>,
}

impl Subject {
    pub fn from_entry(entry: &DirectoryEntry) -> Self {
        Self {
            uid: entry.uid.clone().unwrap_or_else(|| entry.path.leaf().value.clone()),
            role: resolve_role(entry),
            ou_scope: resolve_ou(entry),
        }
    }

    /// Highest-privilege subject, used by tooling that runs with directory admin rights
    pub fn root(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            role: Role::Root,
            ou_scope: None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.role == Role::Root
    }

    /// Whether this subject may write entries in `ou`
    pub fn may_manage(&self, ou: &str) -> bool {
        match self.role {
            Role::Root => true,
            Role::OuAdmin => self
                .ou_scope
                .as_deref()
                .map(|scope| same_ou(scope, ou))
                .unwrap_or(false),
            Role::User => false,
        }
    }
}
