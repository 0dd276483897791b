//! Collaborator traits consumed by the identity engine
//!
//! The directory transport (bind, search, modify) lives behind
//! [`DirectoryStore`]; its connect and retry policy belongs to the
//! implementation, which the host application constructs and injects.

use async_trait::async_trait;
use std::sync::Arc;

use crate::{error::Result, models::*, naming::NamingPath};

// =============================================================================
// Directory access
// =============================================================================

/// Entry-level access to the directory
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    /// Every entry, in any OU, whose `uid` equals `uid`
    async fn find_by_uid(&self, uid: &str) -> Result<Vec<DirectoryEntry>>;

    /// Every entry holding `value` for attribute `name` (case-insensitive match)
    async fn find_by_attribute(&self, name: &str, value: &str) -> Result<Vec<DirectoryEntry>>;

    async fn find_by_path(&self, path: &NamingPath) -> Result<Option<DirectoryEntry>>;

    /// Every person and OU entry below the base, for export
    async fn list_all(&self) -> Result<Vec<DirectoryEntry>>;

    /// Create the entry, or replace the attributes of the entry at the same path
    async fn save(&self, entry: &DirectoryEntry) -> Result<()>;

    async fn delete(&self, entry: &DirectoryEntry) -> Result<()>;
}

#[async_trait]
impl<T: DirectoryStore + ?Sized> DirectoryStore for Arc<T> {
    async fn find_by_uid(&self, uid: &str) -> Result<Vec<DirectoryEntry>> {
        (**self).find_by_uid(uid).await
    }

    async fn find_by_attribute(&self, name: &str, value: &str) -> Result<Vec<DirectoryEntry>> {
        (**self).find_by_attribute(name, value).await
    }

    async fn find_by_path(&self, path: &NamingPath) -> Result<Option<DirectoryEntry>> {
        (**self).find_by_path(path).await
    }

    async fn list_all(&self) -> Result<Vec<DirectoryEntry>> {
        (**self).list_all().await
    }

    async fn save(&self, entry: &DirectoryEntry) -> Result<()> {
        (**self).save(entry).await
    }

    async fn delete(&self, entry: &DirectoryEntry) -> Result<()> {
        (**self).delete(entry).await
    }
}

// =============================================================================
// Audit
// =============================================================================

/// Destination for audit records; one record per identity-level operation
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: &AuditRecord) -> Result<()>;
}

#[async_trait]
impl<T: AuditSink + ?Sized> AuditSink for Arc<T> {
    async fn record(&self, record: &AuditRecord) -> Result<()> {
        (**self).record(record).await
    }
}
