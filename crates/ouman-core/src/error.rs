//! Error types for the ouman identity engine

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Outcome of persisting (or removing) one member entry of an identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "message")]
pub enum OuStatus {
    Applied,
    Failed(String),
    /// Never attempted because an earlier OU failed
    Skipped,
    /// Applied, then undone by compensation
    RolledBack,
}

/// Per-OU entry of a partial persistence report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OuOutcome {
    pub ou: String,
    pub status: OuStatus,
}

impl OuOutcome {
    pub fn applied(ou: impl Into<String>) -> Self {
        Self {
            ou: ou.into(),
            status: OuStatus::Applied,
        }
    }

    pub fn failed(ou: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            ou: ou.into(),
            status: OuStatus::Failed(message.into()),
        }
    }

    pub fn skipped(ou: impl Into<String>) -> Self {
        Self {
            ou: ou.into(),
            status: OuStatus::Skipped,
        }
    }

    pub fn is_applied(&self) -> bool {
        self.status == OuStatus::Applied
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, OuStatus::Failed(_))
    }
}

/// A UID already holding an identifying number in one or more OUs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumberHolder {
    pub uid: String,
    pub display_name: Option<String>,
    pub ous: Vec<String>,
}

impl fmt::Display for NumberHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.display_name {
            Some(name) => write!(f, "{} ({}) in [{}]", self.uid, name, self.ous.join(", ")),
            None => write!(f, "{} in [{}]", self.uid, self.ous.join(", ")),
        }
    }
}

fn join_holders(holders: &[NumberHolder]) -> String {
    holders
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn summarize_outcomes(outcomes: &[OuOutcome]) -> String {
    let applied = outcomes.iter().filter(|o| o.is_applied()).count();
    let failed = outcomes.iter().filter(|o| o.is_failed()).count();
    format!("{} applied, {} failed", applied, failed)
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OumanError {
    #[error("Validation failed for {field}: {message}")]
    ValidationFailed { field: String, message: String },

    #[error("UID {uid} already has an entry in [{}]", .ous.join(", "))]
    DuplicateInOu { uid: String, ous: Vec<String> },

    #[error("Identifying number {number} already in use by {}", join_holders(.holders))]
    IdentifyingNumberConflict {
        number: String,
        holders: Vec<NumberHolder>,
    },

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Forbidden: {message}")]
    Forbidden { message: String },

    #[error("Partial persistence failure for {uid}: {}", summarize_outcomes(.outcomes))]
    PartialPersistenceFailure { uid: String, outcomes: Vec<OuOutcome> },

    #[error("Unsupported block type at line {line}: {message}")]
    UnsupportedBlockType { line: usize, message: String },

    #[error("Malformed block at line {line}: {message}")]
    MalformedBlock { line: usize, message: String },

    #[error("Malformed naming path {path:?}: {message}")]
    MalformedPath { path: String, message: String },

    #[error("Directory error: {message}")]
    Directory { message: String },

    #[error("Credential error: {message}")]
    Credential { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl OumanError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationFailed {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    pub fn malformed_block(line: usize, message: impl Into<String>) -> Self {
        Self::MalformedBlock {
            line,
            message: message.into(),
        }
    }

    pub fn malformed_path(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedPath {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn directory(message: impl Into<String>) -> Self {
        Self::Directory {
            message: message.into(),
        }
    }

    pub fn credential(message: impl Into<String>) -> Self {
        Self::Credential {
            message: message.into(),
        }
    }

    /// Stable machine-readable name of the failure kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ValidationFailed { .. } => "validation_failed",
            Self::DuplicateInOu { .. } => "duplicate_in_ou",
            Self::IdentifyingNumberConflict { .. } => "identifying_number_conflict",
            Self::NotFound { .. } => "not_found",
            Self::Forbidden { .. } => "forbidden",
            Self::PartialPersistenceFailure { .. } => "partial_persistence_failure",
            Self::UnsupportedBlockType { .. } => "unsupported_block_type",
            Self::MalformedBlock { .. } => "malformed_block",
            Self::MalformedPath { .. } => "malformed_path",
            Self::Directory { .. } => "directory",
            Self::Credential { .. } => "credential",
            Self::Config { .. } => "config",
        }
    }
}

pub type Result<T> = std::result::Result<T, OumanError>;
