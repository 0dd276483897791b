//! ouman identity - the consistency engine that keeps every per-OU entry
//! of a logical identity in step
//!
//! # Architecture
//!
//! [`IdentityEngine`] sits on two collaborators from `ouman-core`:
//! - `DirectoryStore`: entry-level directory access, injected by the host
//! - `AuditSink`: one record per identity-level operation
//!
//! Credentials are hashed with Argon2id before they reach the store, and
//! per-key locks close the window between the uniqueness checks and the
//! writes that follow them.

pub mod audit;
pub mod credential;
pub mod engine;
pub mod locks;
pub mod stores;

#[cfg(test)]
mod tests;

pub use audit::{MemoryAuditSink, TracingAuditSink};
pub use credential::{is_hashed, CredentialHasher, CredentialSettings};
pub use engine::{
    CreateIdentity, DeleteOutcome, DroppedAttribute, EngineSettings, IdentityEngine,
    MembershipRequest, OuRegistration, UpdateIdentity, UpdateOutcome,
};
pub use locks::KeyedLocks;
pub use stores::InMemoryDirectoryStore;

#[cfg(feature = "ldap")]
pub use stores::{LdapDirectoryStore, LdapStoreConfig};

// Re-export core types
pub use ouman_core::*;
