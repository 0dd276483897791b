//! Domain models for multi-OU directory identities
//!
//! A person appears once per organizational unit. Each appearance is a
//! separate [`DirectoryEntry`]; the entries sharing a UID form one
//! [`LogicalIdentity`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::ids::AuditEventId;
use crate::naming::NamingPath;

/// LDAP attribute names used on the wire and in LDIF
pub mod attrs {
    pub const OBJECT_CLASS: &str = "objectClass";
    pub const UID: &str = "uid";
    pub const GIVEN_NAME: &str = "givenName";
    pub const FAMILY_NAME: &str = "sn";
    pub const DISPLAY_NAME: &str = "cn";
    pub const EMAIL: &str = "mail";
    pub const IDENTIFYING_NUMBER: &str = "employeeNumber";
    pub const CREDENTIAL: &str = "userPassword";
    pub const OU: &str = "ou";
    pub const ROLE: &str = "employeeType";
    pub const DESCRIPTION: &str = "description";
}

/// Object class markers
pub mod classes {
    pub const PERSON: &str = "inetOrgPerson";
    pub const ORGANIZATIONAL_UNIT: &str = "organizationalUnit";

    pub const PERSON_CLASSES: [&str; 4] = ["top", "person", "organizationalPerson", "inetOrgPerson"];
    pub const OU_CLASSES: [&str; 2] = ["top", "organizationalUnit"];
}

// =============================================================================
// Roles
// =============================================================================

/// Access level derived from the role attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    OuAdmin,
    Root,
}

impl Role {
    /// Value written to the role attribute
    pub fn marker(&self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::OuAdmin => "admin",
            Self::User => "user",
        }
    }

    /// Parse a single role marker, case-insensitive
    pub fn from_marker(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "root" => Some(Self::Root),
            "admin" | "ou_admin" => Some(Self::OuAdmin),
            "user" => Some(Self::User),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root => write!(f, "root"),
            Self::OuAdmin => write!(f, "ou_admin"),
            Self::User => write!(f, "user"),
        }
    }
}

// =============================================================================
// Directory entries
// =============================================================================

/// One physical record in the directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub path: NamingPath,
    pub object_classes: Vec<String>,
    pub uid: Option<String>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub identifying_number: Option<String>,
    /// Stored credential, always hashed or scheme-prefixed
    pub credential: Option<String>,
    pub ou: Option<String>,
    pub roles: Vec<String>,
    pub description: Option<String>,
    /// Attributes without a typed field, keyed by attribute name
    pub extra: BTreeMap<String, Vec<String>>,
}

impl DirectoryEntry {
    /// Empty entry at `path` with no object classes
    pub fn new(path: NamingPath) -> Self {
        Self {
            path,
            object_classes: Vec::new(),
            uid: None,
            given_name: None,
            family_name: None,
            display_name: None,
            email: None,
            identifying_number: None,
            credential: None,
            ou: None,
            roles: Vec::new(),
            description: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn person(path: NamingPath) -> Self {
        let mut entry = Self::new(path);
        entry.object_classes = classes::PERSON_CLASSES.iter().map(|c| c.to_string()).collect();
        entry
    }

    pub fn organizational_unit(path: NamingPath) -> Self {
        let mut entry = Self::new(path);
        entry.object_classes = classes::OU_CLASSES.iter().map(|c| c.to_string()).collect();
        entry
    }

    pub fn has_object_class(&self, class: &str) -> bool {
        self.object_classes
            .iter()
            .any(|c| c.eq_ignore_ascii_case(class))
    }

    pub fn is_person(&self) -> bool {
        self.has_object_class(classes::PERSON)
    }

    pub fn is_organizational_unit(&self) -> bool {
        self.has_object_class(classes::ORGANIZATIONAL_UNIT)
    }

    /// Whether this entry belongs to `ou`, compared case-insensitively
    pub fn in_ou(&self, ou: &str) -> bool {
        self.ou
            .as_deref()
            .or_else(|| self.path.ou())
            .map(|own| same_ou(own, ou))
            .unwrap_or(false)
    }

    /// All values of an attribute, by LDAP name
    pub fn attribute_values(&self, name: &str) -> Vec<String> {
        let single = |v: &Option<String>| v.iter().cloned().collect::<Vec<_>>();
        match name.to_lowercase().as_str() {
            "objectclass" => self.object_classes.clone(),
            "uid" => single(&self.uid),
            "givenname" => single(&self.given_name),
            "sn" => single(&self.family_name),
            "cn" => single(&self.display_name),
            "mail" => single(&self.email),
            "employeenumber" => single(&self.identifying_number),
            "userpassword" => single(&self.credential),
            "ou" => single(&self.ou),
            "employeetype" => self.roles.clone(),
            "description" => single(&self.description),
            _ => self
                .extra
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, values)| values.clone())
                .unwrap_or_default(),
        }
    }

    pub fn first_value(&self, name: &str) -> Option<String> {
        self.attribute_values(name).into_iter().next()
    }

    /// Replace all values of an attribute, by LDAP name.
    ///
    /// Single-valued attributes keep the first value. An empty list clears.
    pub fn set_attribute(&mut self, name: &str, values: Vec<String>) {
        let first = values.first().cloned();
        match name.to_lowercase().as_str() {
            "objectclass" => self.object_classes = values,
            "uid" => self.uid = first,
            "givenname" => self.given_name = first,
            "sn" => self.family_name = first,
            "cn" => self.display_name = first,
            "mail" => self.email = first,
            "employeenumber" => self.identifying_number = first,
            "userpassword" => self.credential = first,
            "ou" => self.ou = first,
            "employeetype" => self.roles = values,
            "description" => self.description = first,
            _ => {
                let existing = self
                    .extra
                    .keys()
                    .find(|key| key.eq_ignore_ascii_case(name))
                    .cloned();
                let key = existing.unwrap_or_else(|| name.to_string());
                if values.is_empty() {
                    self.extra.remove(&key);
                } else {
                    self.extra.insert(key, values);
                }
            }
        }
    }

    /// Every populated attribute as (name, values), in a stable order
    pub fn attributes(&self) -> Vec<(String, Vec<String>)> {
        let mut out = Vec::new();
        for name in [
            attrs::OBJECT_CLASS,
            attrs::UID,
            attrs::GIVEN_NAME,
            attrs::FAMILY_NAME,
            attrs::DISPLAY_NAME,
            attrs::EMAIL,
            attrs::IDENTIFYING_NUMBER,
            attrs::CREDENTIAL,
            attrs::OU,
            attrs::ROLE,
            attrs::DESCRIPTION,
        ] {
            let values = self.attribute_values(name);
            if !values.is_empty() {
                out.push((name.to_string(), values));
            }
        }
        for (name, values) in &self.extra {
            out.push((name.clone(), values.clone()));
        }
        out
    }

    /// Copy the attributes shared by all members of an identity
    pub fn common_attributes(&self) -> IdentityAttributes {
        IdentityAttributes {
            given_name: self.given_name.clone(),
            family_name: self.family_name.clone(),
            display_name: self.display_name.clone(),
            email: self.email.clone(),
        }
    }
}

pub fn same_ou(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

// =============================================================================
// Identity-level views
// =============================================================================

/// Naming attributes kept identical across every member entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityAttributes {
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub display_name: Option<String>,
    pub email: Option<String>,
}

impl IdentityAttributes {
    /// `(attribute name, value)` pairs that are set
    pub fn as_pairs(&self) -> Vec<(&'static str, &str)> {
        let mut pairs = Vec::new();
        if let Some(v) = &self.given_name {
            pairs.push((attrs::GIVEN_NAME, v.as_str()));
        }
        if let Some(v) = &self.family_name {
            pairs.push((attrs::FAMILY_NAME, v.as_str()));
        }
        if let Some(v) = &self.display_name {
            pairs.push((attrs::DISPLAY_NAME, v.as_str()));
        }
        if let Some(v) = &self.email {
            pairs.push((attrs::EMAIL, v.as_str()));
        }
        pairs
    }

    /// Values from `overlay` win where set
    pub fn merged_with(&self, overlay: &IdentityAttributes) -> IdentityAttributes {
        IdentityAttributes {
            given_name: overlay.given_name.clone().or_else(|| self.given_name.clone()),
            family_name: overlay.family_name.clone().or_else(|| self.family_name.clone()),
            display_name: overlay.display_name.clone().or_else(|| self.display_name.clone()),
            email: overlay.email.clone().or_else(|| self.email.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.as_pairs().is_empty()
    }
}

/// One (OU, role) membership of a logical identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub ou: String,
    pub role: Role,
    pub path: NamingPath,
}

/// All directory entries sharing one UID, viewed as a single person
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicalIdentity {
    pub uid: String,
    pub attributes: IdentityAttributes,
    pub identifying_number: Option<String>,
    pub memberships: Vec<Membership>,
}

impl LogicalIdentity {
    /// Aggregate member entries. Returns `None` when `entries` holds no person.
    ///
    /// Common attributes are taken from the first member that has them set.
    pub fn from_entries(entries: &[DirectoryEntry]) -> Option<Self> {
        let persons: Vec<&DirectoryEntry> = entries.iter().filter(|e| e.is_person()).collect();
        let uid = persons.iter().find_map(|e| e.uid.clone())?;

        let mut attributes = IdentityAttributes::default();
        for entry in &persons {
            attributes = entry.common_attributes().merged_with(&attributes);
        }

        let identifying_number = persons.iter().find_map(|e| e.identifying_number.clone());
        let memberships = persons
            .iter()
            .filter_map(|e| {
                crate::role::resolve_ou(e).map(|ou| Membership {
                    ou,
                    role: crate::role::resolve_role(e),
                    path: e.path.clone(),
                })
            })
            .collect();

        Some(Self {
            uid,
            attributes,
            identifying_number,
            memberships,
        })
    }

    pub fn ous(&self) -> Vec<String> {
        self.memberships.iter().map(|m| m.ou.clone()).collect()
    }
}

/// Flat organizational unit record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationalUnit {
    pub name: String,
    pub description: Option<String>,
}

impl OrganizationalUnit {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

// =============================================================================
// Audit
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    Create,
    Update,
    Delete,
    Import,
}

impl fmt::Display for AuditOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
            Self::Import => write!(f, "import"),
        }
    }
}

/// One audit record per identity-level operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: AuditEventId,
    pub operation: AuditOperation,
    /// Kind of entity touched, e.g. `identity` or `organizational_unit`
    pub entity: String,
    pub entity_id: String,
    /// Comma-separated OUs touched, if any
    pub ou: Option<String>,
    pub description: String,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        operation: AuditOperation,
        entity: impl Into<String>,
        entity_id: impl Into<String>,
        ous: &[String],
        description: impl Into<String>,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            id: AuditEventId::new(),
            operation,
            entity: entity.into(),
            entity_id: entity_id.into(),
            ou: if ous.is_empty() {
                None
            } else {
                Some(ous.join(","))
            },
            description: description.into(),
            actor: actor.into(),
            timestamp: Utc::now(),
        }
    }
}
