//! LDAP-backed directory store
//!
//! Opens one bound connection per call and unbinds afterwards. Entries are
//! written with `add` when absent and `modify`/`Replace` otherwise; the
//! leaf attribute of an existing entry is never sent in a modify.

use async_trait::async_trait;
use ldap3::{ldap_escape, LdapConnAsync, LdapConnSettings, Mod, Scope, SearchEntry};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, instrument};

use ouman_core::{
    attrs, classes, DirectoryEntry, DirectoryStore, NamingPath, OumanError, Result,
};

const RC_SUCCESS: u32 = 0;
const RC_NO_SUCH_OBJECT: u32 = 32;
const RC_ALREADY_EXISTS: u32 = 68;

/// Connection settings for [`LdapDirectoryStore`]
#[derive(Debug, Clone, Deserialize)]
pub struct LdapStoreConfig {
    pub url: String,
    pub base_dn: String,
    pub bind_dn: String,
    #[serde(default)]
    pub bind_password: String,
    #[serde(default)]
    pub start_tls: bool,
}

pub struct LdapDirectoryStore {
    config: LdapStoreConfig,
}

impl LdapDirectoryStore {
    pub fn new(config: LdapStoreConfig) -> Self {
        Self { config }
    }

    pub fn base_dn(&self) -> &str {
        &self.config.base_dn
    }

    async fn connect(&self) -> Result<ldap3::Ldap> {
        let settings = LdapConnSettings::new().set_starttls(self.config.start_tls);

        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &self.config.url)
            .await
            .map_err(|e| OumanError::directory(format!("LDAP connection failed: {}", e)))?;

        ldap3::drive!(conn);

        let result = ldap
            .simple_bind(&self.config.bind_dn, &self.config.bind_password)
            .await
            .map_err(|e| OumanError::directory(format!("LDAP bind failed: {}", e)))?;

        if result.rc != RC_SUCCESS {
            ldap.unbind().await.ok();
            return Err(OumanError::directory(format!(
                "LDAP bind failed with code {}: {}",
                result.rc, result.text
            )));
        }

        Ok(ldap)
    }

    async fn search(&self, base: &str, scope: Scope, filter: &str) -> Result<Vec<DirectoryEntry>> {
        let mut ldap = self.connect().await?;
        let result = ldap.search(base, scope, filter, vec!["*"]).await;
        ldap.unbind().await.ok();
        search_entries(result)
    }

    async fn add(&self, ldap: &mut ldap3::Ldap, entry: &DirectoryEntry) -> Result<()> {
        let dn = entry.path.to_string();
        let attributes: Vec<(String, HashSet<String>)> = entry
            .attributes()
            .into_iter()
            .map(|(name, values)| (name, values.into_iter().collect()))
            .collect();

        let result = ldap
            .add(&dn, attributes)
            .await
            .map_err(|e| OumanError::directory(format!("Failed to create entry {}: {}", dn, e)))?;

        match result.rc {
            RC_SUCCESS => {
                info!(dn = %dn, "LDAP entry created");
                Ok(())
            }
            RC_ALREADY_EXISTS => Err(OumanError::directory(format!("entry {} already exists", dn))),
            rc => Err(OumanError::directory(format!(
                "LDAP add failed with code {}: {}",
                rc, result.text
            ))),
        }
    }

    async fn replace(
        &self,
        ldap: &mut ldap3::Ldap,
        entry: &DirectoryEntry,
        existing: &DirectoryEntry,
    ) -> Result<()> {
        let dn = entry.path.to_string();
        let leaf = entry.path.leaf().attribute.clone();
        let writable = |name: &str| {
            !name.eq_ignore_ascii_case(&leaf) && !name.eq_ignore_ascii_case(attrs::OBJECT_CLASS)
        };

        let wanted: HashMap<String, Vec<String>> = entry
            .attributes()
            .into_iter()
            .map(|(name, values)| (name.to_lowercase(), values))
            .collect();

        let mut mods: Vec<Mod<String>> = Vec::new();
        for (name, values) in entry.attributes() {
            if writable(&name) && existing.attribute_values(&name) != values {
                mods.push(Mod::Replace(name, values.into_iter().collect()));
            }
        }
        for (name, _) in existing.attributes() {
            if writable(&name) && !wanted.contains_key(&name.to_lowercase()) {
                mods.push(Mod::Delete(name, HashSet::new()));
            }
        }

        if mods.is_empty() {
            debug!(dn = %dn, "Entry unchanged");
            return Ok(());
        }

        let result = ldap
            .modify(&dn, mods)
            .await
            .map_err(|e| OumanError::directory(format!("Failed to update entry {}: {}", dn, e)))?;

        match result.rc {
            RC_SUCCESS => {
                info!(dn = %dn, "LDAP entry updated");
                Ok(())
            }
            RC_NO_SUCH_OBJECT => Err(OumanError::not_found("entry", dn)),
            rc => Err(OumanError::directory(format!(
                "LDAP modify failed with code {}: {}",
                rc, result.text
            ))),
        }
    }
}

fn to_entry(se: SearchEntry) -> Result<DirectoryEntry> {
    let mut entry = DirectoryEntry::new(NamingPath::parse(&se.dn)?);
    for (name, values) in se.attrs {
        entry.set_attribute(&name, values);
    }
    Ok(entry)
}

/// Entries of a finished search; a missing base yields none
fn search_entries(
    result: std::result::Result<ldap3::SearchResult, ldap3::LdapError>,
) -> Result<Vec<DirectoryEntry>> {
    let ldap3::SearchResult(rs, result) =
        result.map_err(|e| OumanError::directory(format!("LDAP search failed: {}", e)))?;

    match result.rc {
        RC_SUCCESS => {}
        RC_NO_SUCH_OBJECT => return Ok(vec![]),
        rc => {
            return Err(OumanError::directory(format!(
                "LDAP search failed with code {}: {}",
                rc, result.text
            )))
        }
    }

    rs.into_iter()
        .map(|raw| to_entry(SearchEntry::construct(raw)))
        .collect()
}

fn equality(name: &str, value: &str) -> String {
    format!("({}={})", name, ldap_escape(value.trim()))
}

#[async_trait]
impl DirectoryStore for LdapDirectoryStore {
    #[instrument(skip(self))]
    async fn find_by_uid(&self, uid: &str) -> Result<Vec<DirectoryEntry>> {
        let filter = format!(
            "(&(objectClass={}){})",
            classes::PERSON,
            equality(attrs::UID, uid)
        );
        self.search(&self.config.base_dn, Scope::Subtree, &filter).await
    }

    #[instrument(skip(self))]
    async fn find_by_attribute(&self, name: &str, value: &str) -> Result<Vec<DirectoryEntry>> {
        self.search(&self.config.base_dn, Scope::Subtree, &equality(name, value))
            .await
    }

    #[instrument(skip(self), fields(path = %path))]
    async fn find_by_path(&self, path: &NamingPath) -> Result<Option<DirectoryEntry>> {
        let found = self
            .search(&path.to_string(), Scope::Base, "(objectClass=*)")
            .await?;
        Ok(found.into_iter().next())
    }

    #[instrument(skip(self))]
    async fn list_all(&self) -> Result<Vec<DirectoryEntry>> {
        let filter = format!(
            "(|(objectClass={})(objectClass={}))",
            classes::PERSON,
            classes::ORGANIZATIONAL_UNIT
        );
        self.search(&self.config.base_dn, Scope::Subtree, &filter).await
    }

    #[instrument(skip(self, entry), fields(path = %entry.path))]
    async fn save(&self, entry: &DirectoryEntry) -> Result<()> {
        let existing = self.find_by_path(&entry.path).await?;
        let mut ldap = self.connect().await?;

        let result = match existing {
            Some(existing) => self.replace(&mut ldap, entry, &existing).await,
            None => self.add(&mut ldap, entry).await,
        };

        ldap.unbind().await.ok();
        result
    }

    #[instrument(skip(self, entry), fields(path = %entry.path))]
    async fn delete(&self, entry: &DirectoryEntry) -> Result<()> {
        let dn = entry.path.to_string();
        let mut ldap = self.connect().await?;

        let result = ldap
            .delete(&dn)
            .await
            .map_err(|e| OumanError::directory(format!("Failed to delete entry {}: {}", dn, e)));
        ldap.unbind().await.ok();
        let result = result?;

        match result.rc {
            RC_SUCCESS => {
                info!(dn = %dn, "LDAP entry deleted");
                Ok(())
            }
            RC_NO_SUCH_OBJECT => Err(OumanError::not_found("entry", dn)),
            rc => Err(OumanError::directory(format!(
                "LDAP delete failed with code {}: {}",
                rc, result.text
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(rc: u32) -> ldap3::SearchResult {
        ldap3::SearchResult(
            vec![],
            ldap3::LdapResult {
                rc,
                matched: String::new(),
                text: "failed".to_string(),
                refs: vec![],
                ctrls: vec![],
            },
        )
    }

    #[test]
    fn test_search_outcomes() {
        assert!(search_entries(Ok(finished(RC_SUCCESS))).unwrap().is_empty());
        assert!(search_entries(Ok(finished(RC_NO_SUCH_OBJECT))).unwrap().is_empty());
        assert_eq!(
            search_entries(Ok(finished(50))).unwrap_err().kind(),
            "directory"
        );
        assert_eq!(
            search_entries(Err(ldap3::LdapError::from(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset"
            ))))
                .unwrap_err()
                .kind(),
            "directory"
        );
    }

    #[test]
    fn test_equality_filter_escapes_value() {
        assert_eq!(equality("uid", "ana"), "(uid=ana)");
        let filter = equality("cn", "a*(b)");
        assert!(filter.starts_with("(cn=a\\"));
        assert!(!filter[1..filter.len() - 1].contains(|c: char| matches!(c, '*' | '(' | ')')));
    }

    #[test]
    fn test_config_defaults() {
        let config: LdapStoreConfig = serde_json::from_str(
            r#"{"url":"ldap://localhost:389","base_dn":"dc=example,dc=com","bind_dn":"cn=admin,dc=example,dc=com"}"#,
        )
        .unwrap();
        assert!(!config.start_tls);
        assert!(config.bind_password.is_empty());
    }

    /// Needs a writable directory at `OUMAN_LDAP_URL`
    #[tokio::test]
    #[ignore]
    async fn test_round_trip_against_directory() {
        let url = match std::env::var("OUMAN_LDAP_URL") {
            Ok(url) => url,
            Err(_) => return,
        };
        let store = LdapDirectoryStore::new(LdapStoreConfig {
            url,
            base_dn: std::env::var("OUMAN_LDAP_BASE").unwrap_or_else(|_| "dc=example,dc=com".into()),
            bind_dn: std::env::var("OUMAN_LDAP_BIND_DN")
                .unwrap_or_else(|_| "cn=admin,dc=example,dc=com".into()),
            bind_password: std::env::var("OUMAN_LDAP_BIND_PASSWORD").unwrap_or_default(),
            start_tls: false,
        });

        let entries = store.list_all().await.unwrap();
        for entry in entries.iter().filter(|e| e.is_person()).take(1) {
            let found = store.find_by_path(&entry.path).await.unwrap();
            assert_eq!(found.as_ref().map(|e| &e.path), Some(&entry.path));
        }
    }
}
