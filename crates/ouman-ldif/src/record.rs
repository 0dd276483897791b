//! Decoded LDIF blocks and their classification

use serde::Serialize;
use std::collections::BTreeMap;

use ouman_core::{classes, DirectoryEntry, NamingPath, OumanError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Person,
    OrganizationalUnit,
}

/// One `dn`-delimited record of an LDIF file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LdifBlock {
    pub dn: Option<String>,
    /// Values by attribute name as written; lookups ignore case
    pub attributes: BTreeMap<String, Vec<String>>,
    /// 1-based line where the block starts
    pub line: usize,
    /// Problems met while reading the block's lines
    pub errors: Vec<String>,
}

impl LdifBlock {
    pub fn new(line: usize) -> Self {
        Self {
            line,
            ..Default::default()
        }
    }

    pub fn with_dn(line: usize, dn: impl Into<String>) -> Self {
        Self {
            dn: Some(dn.into()),
            line,
            ..Default::default()
        }
    }

    /// Append a value, merging with an existing key of any case
    pub fn push(&mut self, name: &str, value: impl Into<String>) {
        let key = self
            .attributes
            .keys()
            .find(|k| k.eq_ignore_ascii_case(name))
            .cloned()
            .unwrap_or_else(|| name.to_string());
        self.attributes.entry(key).or_default().push(value.into());
    }

    pub fn values(&self, name: &str) -> &[String] {
        self.attributes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn first(&self, name: &str) -> Option<&str> {
        self.values(name).first().map(String::as_str)
    }

    pub fn has_object_class(&self, class: &str) -> bool {
        self.values("objectClass")
            .iter()
            .any(|c| c.trim().eq_ignore_ascii_case(class))
    }

    pub fn is_empty(&self) -> bool {
        self.dn.is_none() && self.attributes.is_empty() && self.errors.is_empty()
    }

    pub fn is_malformed(&self) -> bool {
        !self.errors.is_empty()
    }

    pub(crate) fn mark_malformed(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    /// The block's naming path; `MalformedBlock` when absent or unparsable
    pub fn path(&self) -> Result<NamingPath> {
        let dn = self
            .dn
            .as_deref()
            .ok_or_else(|| OumanError::malformed_block(self.line, "block has no dn line"))?;
        NamingPath::parse(dn)
            .map_err(|e| OumanError::malformed_block(self.line, e.to_string()))
    }

    pub fn classify(&self) -> Result<BlockKind> {
        if let Some(problem) = self.errors.first() {
            return Err(OumanError::malformed_block(self.line, problem.clone()));
        }
        self.path()?;

        if self.has_object_class(classes::PERSON) {
            Ok(BlockKind::Person)
        } else if self.has_object_class(classes::ORGANIZATIONAL_UNIT) {
            Ok(BlockKind::OrganizationalUnit)
        } else {
            Err(OumanError::UnsupportedBlockType {
                line: self.line,
                message: format!(
                    "object classes [{}] are neither {} nor {}",
                    self.values("objectClass").join(", "),
                    classes::PERSON,
                    classes::ORGANIZATIONAL_UNIT
                ),
            })
        }
    }

    /// Directory entry carrying every attribute of the block
    pub fn to_entry(&self) -> Result<DirectoryEntry> {
        let mut entry = DirectoryEntry::new(self.path()?);
        for (name, values) in &self.attributes {
            entry.set_attribute(name, values.clone());
        }
        Ok(entry)
    }
}
