//! LDIF writers
//!
//! [`LdifGenerator::generate`] produces provisioning files from identity
//! tuples; [`export_entries`] dumps what the directory already holds.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use ouman_core::{
    attrs, build_entry_path, classes, DirectoryEntry, IdentityAttributes, Result, Role,
};
use ouman_identity::CredentialHasher;

/// One (identity, OU, role) tuple to provision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonExport {
    pub uid: String,
    #[serde(default)]
    pub attributes: IdentityAttributes,
    pub identifying_number: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    pub ou: String,
    pub role: Role,
}

pub struct LdifGenerator {
    base_path: String,
    hasher: CredentialHasher,
}

impl LdifGenerator {
    pub fn new(base_path: impl Into<String>, hasher: CredentialHasher) -> Self {
        Self {
            base_path: base_path.into(),
            hasher,
        }
    }

    /// One block per tuple. A plaintext password is hashed once per
    /// identity and the same value is written to each of its blocks.
    pub fn generate(&self, people: &[PersonExport]) -> Result<String> {
        let mut hashed: HashMap<(String, String), String> = HashMap::new();
        let mut out = String::new();

        for person in people {
            let uid = person.uid.trim();
            let ou = person.ou.trim();
            let attributes = &person.attributes;

            write_line(&mut out, "dn", &build_entry_path(uid, ou, &self.base_path));
            for class in classes::PERSON_CLASSES {
                write_line(&mut out, attrs::OBJECT_CLASS, class);
            }
            write_line(&mut out, attrs::UID, uid);
            write_optional(&mut out, attrs::GIVEN_NAME, attributes.given_name.as_deref());
            write_optional(&mut out, attrs::FAMILY_NAME, attributes.family_name.as_deref());
            write_optional(&mut out, attrs::DISPLAY_NAME, attributes.display_name.as_deref());
            write_optional(&mut out, attrs::EMAIL, attributes.email.as_deref());
            write_optional(
                &mut out,
                attrs::IDENTIFYING_NUMBER,
                person.identifying_number.as_deref(),
            );

            if let Some(password) = &person.password {
                let key = (uid.to_lowercase(), password.clone());
                let credential = match hashed.get(&key) {
                    Some(credential) => credential.clone(),
                    None => {
                        let credential = self.hasher.prepare(password)?;
                        hashed.insert(key, credential.clone());
                        credential
                    }
                };
                write_line(&mut out, attrs::CREDENTIAL, &credential);
            }

            write_line(&mut out, attrs::OU, ou);
            write_line(&mut out, attrs::ROLE, person.role.marker());
            out.push('\n');
        }

        debug!(blocks = people.len(), hashed = hashed.len(), "Generated LDIF");
        Ok(out)
    }
}

/// Export stored entries: OU records first, then persons, credentials as stored
pub fn export_entries(entries: &[DirectoryEntry]) -> String {
    let mut out = String::new();
    let ous = entries.iter().filter(|e| e.is_organizational_unit());
    let persons = entries.iter().filter(|e| e.is_person());

    for entry in ous.chain(persons) {
        write_line(&mut out, "dn", &entry.path.to_string());
        for (name, values) in entry.attributes() {
            for value in &values {
                write_line(&mut out, &name, value);
            }
        }
        out.push('\n');
    }
    out
}

fn write_optional(out: &mut String, key: &str, value: Option<&str>) {
    if let Some(value) = value {
        write_line(out, key, value);
    }
}

/// `key: value`, or `key:: base64` when the value is not LDIF-safe
fn write_line(out: &mut String, key: &str, value: &str) {
    out.push_str(key);
    if is_safe(value) {
        out.push_str(": ");
        out.push_str(value);
    } else {
        out.push_str(":: ");
        out.push_str(&BASE64.encode(value.as_bytes()));
    }
    out.push('\n');
}

fn is_safe(value: &str) -> bool {
    if value.is_empty() {
        return true;
    }
    if value.starts_with(|c: char| matches!(c, ' ' | ':' | '<')) || value.ends_with(' ') {
        return false;
    }
    value.bytes().all(|b| b.is_ascii() && b != 0 && b != b'\n' && b != b'\r')
}
