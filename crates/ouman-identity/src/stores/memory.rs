//! In-memory directory store for tests and local tooling

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use ouman_core::{same_ou, DirectoryEntry, DirectoryStore, NamingPath, OumanError, Result};

/// Entries keyed by normalized naming path
#[derive(Debug, Default)]
pub struct InMemoryDirectoryStore {
    entries: RwLock<BTreeMap<String, DirectoryEntry>>,
    /// OUs whose writes fail, to exercise partial-failure paths
    failing_ous: RwLock<HashSet<String>>,
}

impl InMemoryDirectoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_entries(entries: Vec<DirectoryEntry>) -> Self {
        let store = Self::new();
        {
            let mut map = store.entries.write().await;
            for entry in entries {
                map.insert(entry.path.normalized(), entry);
            }
        }
        store
    }

    /// Make every later save or delete under `ou` fail with a directory error
    pub async fn fail_writes_in_ou(&self, ou: &str) {
        self.failing_ous.write().await.insert(ou.trim().to_lowercase());
    }

    pub async fn clear_failures(&self) {
        self.failing_ous.write().await.clear();
    }

    pub async fn all(&self) -> Vec<DirectoryEntry> {
        self.entries.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    async fn check_writable(&self, entry: &DirectoryEntry) -> Result<()> {
        let failing = self.failing_ous.read().await;
        let ou = entry.ou.as_deref().or_else(|| entry.path.ou());
        if let Some(ou) = ou {
            if failing.iter().any(|f| same_ou(f, ou)) {
                return Err(OumanError::directory(format!(
                    "write refused for {}",
                    entry.path
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DirectoryStore for InMemoryDirectoryStore {
    async fn find_by_uid(&self, uid: &str) -> Result<Vec<DirectoryEntry>> {
        let wanted = uid.trim().to_lowercase();
        Ok(self
            .entries
            .read()
            .await
            .values()
            .filter(|e| {
                e.uid
                    .as_deref()
                    .map(|u| u.to_lowercase() == wanted)
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn find_by_attribute(&self, name: &str, value: &str) -> Result<Vec<DirectoryEntry>> {
        let wanted = value.trim().to_lowercase();
        Ok(self
            .entries
            .read()
            .await
            .values()
            .filter(|e| {
                e.attribute_values(name)
                    .iter()
                    .any(|v| v.trim().to_lowercase() == wanted)
            })
            .cloned()
            .collect())
    }

    async fn find_by_path(&self, path: &NamingPath) -> Result<Option<DirectoryEntry>> {
        Ok(self.entries.read().await.get(&path.normalized()).cloned())
    }

    async fn list_all(&self) -> Result<Vec<DirectoryEntry>> {
        Ok(self
            .entries
            .read()
            .await
            .values()
            .filter(|e| e.is_person() || e.is_organizational_unit())
            .cloned()
            .collect())
    }

    #[instrument(skip(self, entry), fields(path = %entry.path))]
    async fn save(&self, entry: &DirectoryEntry) -> Result<()> {
        self.check_writable(entry).await?;
        debug!("Saving entry");
        self.entries
            .write()
            .await
            .insert(entry.path.normalized(), entry.clone());
        Ok(())
    }

    #[instrument(skip(self, entry), fields(path = %entry.path))]
    async fn delete(&self, entry: &DirectoryEntry) -> Result<()> {
        self.check_writable(entry).await?;
        match self.entries.write().await.remove(&entry.path.normalized()) {
            Some(_) => Ok(()),
            None => Err(OumanError::not_found("entry", entry.path.to_string())),
        }
    }
}
