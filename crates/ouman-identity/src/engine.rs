//! Identity consistency engine
//!
//! Fans identity-level operations out to one directory entry per OU and
//! back. Validation, authorization and the uniqueness checks all run
//! before the first write; a failure after that point is reported per OU.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use ouman_core::{
    attrs, has_risky_chars, list_risky_chars, resolve_ou, same_ou, validation::Validator,
    AuditOperation, AuditRecord, AuditSink, DirectoryEntry, DirectoryStore, IdentityAttributes,
    LogicalIdentity, NamingPath, NumberHolder, OrganizationalUnit, OuOutcome, OuStatus,
    OumanError, Result, Role, Subject,
};

use crate::credential::CredentialHasher;
use crate::locks::{number_key, ou_key, uid_key, KeyedLocks};

/// Attributes with a typed field; never accepted as extension attributes
const TYPED_ATTRIBUTES: [&str; 11] = [
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
];

/// Attributes only the engine writes, through dedicated request fields
const MANAGED_ATTRIBUTES: [&str; 5] = [
    attrs::OBJECT_CLASS,
    attrs::OU,
    attrs::ROLE,
    attrs::IDENTIFYING_NUMBER,
    attrs::CREDENTIAL,
];

// =============================================================================
// Settings and requests
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Directory suffix under which OU containers live
    pub base_path: String,
    /// Delete already-written entries when a multi-OU create fails midway
    #[serde(default)]
    pub compensate_partial_create: bool,
}

impl EngineSettings {
    pub fn new(base_path: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
            compensate_partial_create: false,
        }
    }
}

/// One target OU of a create or update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipRequest {
    pub ou: String,
    pub role: Role,
    /// Explicit naming path; built from the UID and OU when absent
    #[serde(default)]
    pub path: Option<NamingPath>,
}

impl MembershipRequest {
    pub fn new(ou: impl Into<String>, role: Role) -> Self {
        Self {
            ou: ou.into(),
            role,
            path: None,
        }
    }

    pub fn at(path: NamingPath, role: Role) -> Self {
        Self {
            ou: path.ou().unwrap_or_default().to_string(),
            role,
            path: Some(path),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateIdentity {
    pub uid: String,
    #[serde(default)]
    pub attributes: IdentityAttributes,
    pub identifying_number: Option<String>,
    /// Plaintext or already scheme-prefixed credential
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    pub memberships: Vec<MembershipRequest>,
    /// Extension attributes written to every member entry
    #[serde(default)]
    pub extra: BTreeMap<String, Vec<String>>,
}

impl CreateIdentity {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            ..Default::default()
        }
    }

    pub fn with_attributes(mut self, attributes: IdentityAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_identifying_number(mut self, number: impl Into<String>) -> Self {
        self.identifying_number = Some(number.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn member(mut self, ou: impl Into<String>, role: Role) -> Self {
        self.memberships.push(MembershipRequest::new(ou, role));
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateIdentity {
    pub uid: String,
    /// Common attributes to change on every member entry
    #[serde(default)]
    pub patch: IdentityAttributes,
    pub identifying_number: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    /// Other attribute writes by LDAP name, applied to every member entry
    #[serde(default)]
    pub attributes: BTreeMap<String, Vec<String>>,
    /// OUs to update or add; OUs left out keep their entries
    pub memberships: Option<Vec<MembershipRequest>>,
}

impl UpdateIdentity {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            ..Default::default()
        }
    }

    pub fn with_patch(mut self, patch: IdentityAttributes) -> Self {
        self.patch = patch;
        self
    }

    pub fn with_identifying_number(mut self, number: impl Into<String>) -> Self {
        self.identifying_number = Some(number.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), vec![value.into()]);
        self
    }

    pub fn with_memberships(mut self, memberships: Vec<MembershipRequest>) -> Self {
        self.memberships = Some(memberships);
        self
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// A write to an immutable attribute that was not applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedAttribute {
    pub path: String,
    pub attribute: String,
    pub attempted: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateOutcome {
    pub uid: String,
    /// OUs whose existing entry was rewritten
    pub updated: Vec<String>,
    /// OUs that gained a new member entry
    pub created: Vec<String>,
    pub unchanged: Vec<String>,
    pub dropped: Vec<DroppedAttribute>,
}

impl UpdateOutcome {
    pub fn is_noop(&self) -> bool {
        self.updated.is_empty() && self.created.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOutcome {
    pub uid: String,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OuRegistration {
    Created,
    Updated,
    Unchanged,
}

/// Result of writing a batch of member entries in order
struct Persisted {
    outcomes: Vec<OuOutcome>,
    /// Written entries with the index of their outcome
    written: Vec<(usize, DirectoryEntry)>,
    failed: bool,
}

/// Values every new member entry starts from
struct MemberTemplate<'a> {
    attributes: IdentityAttributes,
    identifying_number: Option<String>,
    credential: Option<String>,
    extra: &'a BTreeMap<String, Vec<String>>,
}

// =============================================================================
// Engine
// =============================================================================

pub struct IdentityEngine<S, A>
where
    S: DirectoryStore,
    A: AuditSink,
{
    store: Arc<S>,
    audit: Arc<A>,
    settings: EngineSettings,
    hasher: CredentialHasher,
    locks: KeyedLocks,
}

impl<S, A> IdentityEngine<S, A>
where
    S: DirectoryStore,
    A: AuditSink,
{
    pub fn new(
        store: Arc<S>,
        audit: Arc<A>,
        settings: EngineSettings,
        hasher: CredentialHasher,
    ) -> Self {
        Self {
            store,
            audit,
            settings,
            hasher,
            locks: KeyedLocks::new(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn hasher(&self) -> &CredentialHasher {
        &self.hasher
    }

    // -------------------------------------------------------------------------
    // Create
    // -------------------------------------------------------------------------

    /// Create one member entry per requested OU
    #[instrument(skip(self, actor, request), fields(actor = %actor.uid, uid = %request.uid))]
    pub async fn create(&self, actor: &Subject, request: CreateIdentity) -> Result<LogicalIdentity> {
        validate_create(&request)?;
        authorize_create(actor, &request)?;

        let uid = request.uid.trim().to_string();
        if has_risky_chars(&uid) {
            warn!(chars = ?list_risky_chars(&uid), "UID contains structural characters");
        }

        let targets = self.target_paths(&uid, &request.memberships)?;
        let ous: Vec<String> = request.memberships.iter().map(|m| m.ou.trim().to_string()).collect();

        let _uid_guard = self.locks.lock_all([uid_key(&uid)]).await;

        self.require_ous(&ous).await?;

        let existing = self.members(&uid).await?;
        let clashes: Vec<String> = ous
            .iter()
            .filter(|ou| existing.iter().any(|e| e.in_ou(ou)))
            .cloned()
            .collect();
        if !clashes.is_empty() {
            return Err(OumanError::DuplicateInOu { uid, ous: clashes });
        }

        let template = match existing.first() {
            None => MemberTemplate {
                attributes: request.attributes.clone(),
                identifying_number: trimmed(request.identifying_number.as_deref())
                    .map(ToString::to_string),
                credential: match request.password.clone() {
                    Some(password) => Some(self.hasher.prepare_async(password).await?),
                    None => None,
                },
                extra: &request.extra,
            },
            Some(_) => self.joining_template(&uid, &request, &existing).await?,
        };
        let number = template.identifying_number.clone();

        let _number_guard = self
            .locks
            .lock_all(number_keys(number.as_deref(), &ous))
            .await;

        self.require_free_paths(&uid, targets.iter().map(|(_, path)| path))
            .await?;
        if let Some(number) = &number {
            self.check_number(number, &uid, &ous).await?;
        }

        let batch: Vec<(String, DirectoryEntry)> = targets
            .into_iter()
            .map(|(membership, path)| {
                let ou = membership.ou.trim().to_string();
                let entry = person_entry(&uid, &ou, membership.role, path, &template);
                (ou, entry)
            })
            .collect();

        let mut persisted = self.persist(batch).await;

        if persisted.failed {
            if self.settings.compensate_partial_create {
                self.compensate(&mut persisted).await;
            }
            let kept = applied_ous(&persisted.outcomes);
            if !kept.is_empty() {
                self.record(
                    AuditOperation::Create,
                    "identity",
                    &uid,
                    &kept,
                    format!("Partially created identity {} in {}", uid, kept.join(", ")),
                    actor,
                )
                .await;
            }
            return Err(OumanError::PartialPersistenceFailure {
                uid,
                outcomes: persisted.outcomes,
            });
        }

        self.record(
            AuditOperation::Create,
            "identity",
            &uid,
            &ous,
            format!("Created identity {} in {}", uid, ous.join(", ")),
            actor,
        )
        .await;
        info!(ous = ?ous, "Identity created");

        let mut entries = existing;
        entries.extend(persisted.written.into_iter().map(|(_, entry)| entry));
        LogicalIdentity::from_entries(&entries).ok_or_else(|| OumanError::not_found("identity", uid))
    }

    // -------------------------------------------------------------------------
    // Update
    // -------------------------------------------------------------------------

    /// Apply common changes to every member entry and add any new OUs
    #[instrument(skip(self, actor, request), fields(actor = %actor.uid, uid = %request.uid))]
    pub async fn update(&self, actor: &Subject, request: UpdateIdentity) -> Result<UpdateOutcome> {
        validate_update(&request)?;

        let uid = request.uid.trim().to_string();
        let _uid_guard = self.locks.lock_all([uid_key(&uid)]).await;

        let existing = self.members(&uid).await?;
        if existing.is_empty() {
            return Err(OumanError::not_found("identity", uid));
        }
        authorize_update(actor, &uid, &existing, &request)?;

        let mut role_changes: Vec<(usize, Role)> = Vec::new();
        let mut new_members: Vec<(MembershipRequest, NamingPath)> = Vec::new();
        if let Some(memberships) = &request.memberships {
            for (membership, path) in self.target_paths(&uid, memberships)? {
                match existing.iter().position(|e| e.in_ou(&membership.ou)) {
                    Some(index) => role_changes.push((index, membership.role)),
                    None => new_members.push((membership, path)),
                }
            }
        }

        let new_ous: Vec<String> = new_members
            .iter()
            .map(|(m, _)| m.ou.trim().to_string())
            .collect();
        self.require_ous(&new_ous).await?;
        self.require_free_paths(&uid, new_members.iter().map(|(_, path)| path))
            .await?;

        let current_number = existing.iter().find_map(|e| e.identifying_number.clone());
        let requested_number = trimmed(request.identifying_number.as_deref()).map(ToString::to_string);
        let (number, check_ous) = match &requested_number {
            Some(number) => {
                let mut ous: Vec<String> = existing.iter().filter_map(resolve_ou).collect();
                ous.extend(new_ous.iter().cloned());
                (Some(number.clone()), ous)
            }
            None => (current_number.clone(), new_ous.clone()),
        };

        let _number_guard = self
            .locks
            .lock_all(number_keys(number.as_deref(), &check_ous))
            .await;
        if let Some(number) = &number {
            if !check_ous.is_empty() {
                self.check_number(number, &uid, &check_ous).await?;
            }
        }

        let current_credential = existing.iter().find_map(|e| e.credential.clone());
        let credential = match &request.password {
            Some(password) => {
                if self.holds_credential(password, &existing).await? {
                    None
                } else {
                    Some(self.hasher.prepare_async(password.clone()).await?)
                }
            }
            None => None,
        };
        let writes = attribute_writes(&request, requested_number.as_deref(), credential.as_deref());

        let mut outcome = UpdateOutcome {
            uid: uid.clone(),
            ..Default::default()
        };
        let mut batch: Vec<(String, DirectoryEntry)> = Vec::new();

        for (index, original) in existing.iter().enumerate() {
            let mut entry = original.clone();
            apply_writes(&mut entry, &writes, &mut outcome.dropped);
            if let Some((_, role)) = role_changes.iter().find(|(i, _)| *i == index) {
                entry.roles = vec![role.marker().to_string()];
            }

            let label = ou_label(original);
            if entry == *original {
                outcome.unchanged.push(label);
            } else {
                outcome.updated.push(label.clone());
                batch.push((label, entry));
            }
        }

        let empty = BTreeMap::new();
        let template = MemberTemplate {
            attributes: existing[0].common_attributes(),
            identifying_number: current_number,
            credential: current_credential,
            extra: &empty,
        };
        for (membership, path) in new_members {
            let ou = membership.ou.trim().to_string();
            let mut entry = person_entry(&uid, &ou, membership.role, path, &template);
            apply_writes(&mut entry, &writes, &mut outcome.dropped);
            outcome.created.push(ou.clone());
            batch.push((ou, entry));
        }

        let persisted = self.persist(batch).await;
        if persisted.failed {
            let kept = applied_ous(&persisted.outcomes);
            if !kept.is_empty() {
                self.record(
                    AuditOperation::Update,
                    "identity",
                    &uid,
                    &kept,
                    format!("Partially updated identity {} in {}", uid, kept.join(", ")),
                    actor,
                )
                .await;
            }
            return Err(OumanError::PartialPersistenceFailure {
                uid,
                outcomes: persisted.outcomes,
            });
        }

        let touched: Vec<String> = outcome
            .updated
            .iter()
            .chain(outcome.created.iter())
            .cloned()
            .collect();
        let description = if touched.is_empty() {
            format!("Updated identity {} (no changes)", uid)
        } else {
            format!("Updated identity {} in {}", uid, touched.join(", "))
        };
        self.record(AuditOperation::Update, "identity", &uid, &touched, description, actor)
            .await;

        info!(
            updated = outcome.updated.len(),
            created = outcome.created.len(),
            dropped = outcome.dropped.len(),
            "Identity updated"
        );
        Ok(outcome)
    }

    // -------------------------------------------------------------------------
    // Delete
    // -------------------------------------------------------------------------

    /// Remove every member entry of `uid`
    #[instrument(skip(self, actor), fields(actor = %actor.uid))]
    pub async fn delete(&self, actor: &Subject, uid: &str) -> Result<DeleteOutcome> {
        let uid = uid.trim().to_string();
        let _uid_guard = self.locks.lock_all([uid_key(&uid)]).await;

        let existing = self.members(&uid).await?;
        if existing.is_empty() {
            return Err(OumanError::not_found("identity", uid));
        }
        authorize_delete(actor, &existing)?;

        let mut outcomes = Vec::with_capacity(existing.len());
        for entry in &existing {
            let ou = ou_label(entry);
            match self.store.delete(entry).await {
                Ok(()) => outcomes.push(OuOutcome::applied(ou)),
                Err(e) => {
                    warn!(ou = %ou, error = %e, "Failed to delete member entry");
                    outcomes.push(OuOutcome::failed(ou, e.to_string()));
                }
            }
        }

        let removed = applied_ous(&outcomes);
        let failed = outcomes.iter().filter(|o| o.is_failed()).count();
        self.record(
            AuditOperation::Delete,
            "identity",
            &uid,
            &removed,
            format!(
                "Deleted identity {}: {} removed, {} failed",
                uid,
                removed.len(),
                failed
            ),
            actor,
        )
        .await;

        if failed > 0 {
            return Err(OumanError::PartialPersistenceFailure { uid, outcomes });
        }

        info!(ous = ?removed, "Identity deleted");
        Ok(DeleteOutcome { uid, removed })
    }

    // -------------------------------------------------------------------------
    // Queries and OU records
    // -------------------------------------------------------------------------

    pub async fn identity(&self, uid: &str) -> Result<LogicalIdentity> {
        let entries = self.members(uid.trim()).await?;
        LogicalIdentity::from_entries(&entries)
            .ok_or_else(|| OumanError::not_found("identity", uid.trim()))
    }

    /// Create an OU record, or update its description. Root only.
    #[instrument(skip(self, actor), fields(actor = %actor.uid, ou = %ou.name))]
    pub async fn register_ou(
        &self,
        actor: &Subject,
        ou: OrganizationalUnit,
    ) -> Result<OuRegistration> {
        if !actor.is_root() {
            return Err(OumanError::forbidden("only root may register organizational units"));
        }

        let mut v = Validator::new();
        v.naming_value("ou", &ou.name)
            .text_optional("description", ou.description.as_deref());
        v.finish()?;

        let name = ou.name.trim().to_string();
        let _guard = self.locks.lock_all([ou_key(&name)]).await;
        let path = NamingPath::for_ou(&name, &self.settings.base_path)?;

        let (entry, registration) = match self.store.find_by_path(&path).await? {
            Some(existing) if !existing.is_organizational_unit() => {
                return Err(OumanError::validation(
                    "ou",
                    format!("{} is occupied by a non-OU entry", path),
                ));
            }
            Some(existing) => {
                if ou.description.is_none() || existing.description == ou.description {
                    debug!("OU already registered");
                    return Ok(OuRegistration::Unchanged);
                }
                let mut entry = existing;
                entry.description = ou.description.clone();
                (entry, OuRegistration::Updated)
            }
            None => {
                let mut entry = DirectoryEntry::organizational_unit(path);
                entry.ou = Some(name.clone());
                entry.description = ou.description.clone();
                (entry, OuRegistration::Created)
            }
        };

        self.store.save(&entry).await?;

        let (operation, verb) = match registration {
            OuRegistration::Created => (AuditOperation::Create, "Registered"),
            _ => (AuditOperation::Update, "Updated"),
        };
        self.record(
            operation,
            "organizational_unit",
            &name,
            std::slice::from_ref(&name),
            format!("{} organizational unit {}", verb, name),
            actor,
        )
        .await;
        info!(registration = ?registration, "Organizational unit saved");
        Ok(registration)
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    /// Template for new members of an identity that already has entries.
    ///
    /// Common values come from the stored members; any value the request
    /// supplies must equal them, so every member keeps the same attributes,
    /// identifying number and credential.
    async fn joining_template<'r>(
        &self,
        uid: &str,
        request: &'r CreateIdentity,
        existing: &[DirectoryEntry],
    ) -> Result<MemberTemplate<'r>> {
        let stored = existing[0].common_attributes();
        {
            let held = stored.as_pairs();
            for (name, value) in request.attributes.as_pairs() {
                let current = held.iter().find(|(n, _)| *n == name).map(|(_, v)| *v);
                if current != Some(value) {
                    return Err(OumanError::validation(
                        name,
                        format!("differs from the value held by existing entries of {}", uid),
                    ));
                }
            }
        }

        let current_number = existing.iter().find_map(|e| e.identifying_number.clone());
        if let Some(number) = trimmed(request.identifying_number.as_deref()) {
            if current_number.as_deref() != Some(number) {
                return Err(OumanError::validation(
                    attrs::IDENTIFYING_NUMBER,
                    format!("differs from the number held by existing entries of {}", uid),
                ));
            }
        }

        let current_credential = existing.iter().find_map(|e| e.credential.clone());
        if let Some(password) = &request.password {
            let matches = match &current_credential {
                Some(stored) => {
                    self.hasher
                        .matches_async(password.clone(), stored.clone())
                        .await?
                }
                None => false,
            };
            if !matches {
                return Err(OumanError::validation(
                    attrs::CREDENTIAL,
                    format!("differs from the credential of existing entries of {}", uid),
                ));
            }
        }

        Ok(MemberTemplate {
            attributes: stored,
            identifying_number: current_number,
            credential: current_credential,
            extra: &request.extra,
        })
    }

    /// Whether every member already stores `password` under current parameters
    async fn holds_credential(&self, password: &str, existing: &[DirectoryEntry]) -> Result<bool> {
        let stored = match existing.first().and_then(|e| e.credential.clone()) {
            Some(stored) => stored,
            None => return Ok(false),
        };
        if existing
            .iter()
            .any(|e| e.credential.as_deref() != Some(stored.as_str()))
        {
            return Ok(false);
        }
        self.hasher
            .is_current_async(password.to_string(), stored)
            .await
    }

    async fn members(&self, uid: &str) -> Result<Vec<DirectoryEntry>> {
        Ok(self
            .store
            .find_by_uid(uid)
            .await?
            .into_iter()
            .filter(|e| e.is_person())
            .collect())
    }

    fn target_paths(
        &self,
        uid: &str,
        memberships: &[MembershipRequest],
    ) -> Result<Vec<(MembershipRequest, NamingPath)>> {
        memberships
            .iter()
            .map(|m| {
                let path = match &m.path {
                    Some(path) => path.clone(),
                    None => NamingPath::for_entry(uid, m.ou.trim(), &self.settings.base_path)?,
                };
                Ok((m.clone(), path))
            })
            .collect()
    }

    async fn require_ous(&self, ous: &[String]) -> Result<()> {
        for ou in ous {
            let path = NamingPath::for_ou(ou, &self.settings.base_path)?;
            match self.store.find_by_path(&path).await? {
                Some(entry) if entry.is_organizational_unit() => {}
                _ => return Err(OumanError::not_found("organizational_unit", ou.clone())),
            }
        }
        Ok(())
    }

    async fn require_free_paths<'p>(
        &self,
        uid: &str,
        paths: impl Iterator<Item = &'p NamingPath>,
    ) -> Result<()> {
        for path in paths {
            if let Some(entry) = self.store.find_by_path(path).await? {
                let owner = entry.uid.as_deref().unwrap_or_default();
                if !same_uid(owner, uid) {
                    return Err(OumanError::validation(
                        "path",
                        format!("{} is already taken by another entry", path),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Fail if another UID holds `number` in any of `ous`, naming every holder
    async fn check_number(&self, number: &str, uid: &str, ous: &[String]) -> Result<()> {
        let mut holders: BTreeMap<String, NumberHolder> = BTreeMap::new();

        for entry in self
            .store
            .find_by_attribute(attrs::IDENTIFYING_NUMBER, number)
            .await?
        {
            if !entry.is_person() {
                continue;
            }
            let other = match &entry.uid {
                Some(other) if !same_uid(other, uid) => other.clone(),
                _ => continue,
            };
            let entry_ou = match resolve_ou(&entry) {
                Some(ou) if ous.iter().any(|target| same_ou(target, &ou)) => ou,
                _ => continue,
            };

            holders
                .entry(other.to_lowercase())
                .or_insert_with(|| NumberHolder {
                    uid: other,
                    display_name: entry.display_name.clone(),
                    ous: Vec::new(),
                })
                .ous
                .push(entry_ou);
        }

        if holders.is_empty() {
            return Ok(());
        }
        Err(OumanError::IdentifyingNumberConflict {
            number: number.to_string(),
            holders: holders.into_values().collect(),
        })
    }

    /// Write entries in order, skipping the rest after the first failure
    async fn persist(&self, batch: Vec<(String, DirectoryEntry)>) -> Persisted {
        let mut persisted = Persisted {
            outcomes: Vec::with_capacity(batch.len()),
            written: Vec::new(),
            failed: false,
        };

        for (ou, entry) in batch {
            if persisted.failed {
                persisted.outcomes.push(OuOutcome::skipped(ou));
                continue;
            }
            match self.store.save(&entry).await {
                Ok(()) => {
                    debug!(ou = %ou, path = %entry.path, "Member entry written");
                    persisted.written.push((persisted.outcomes.len(), entry));
                    persisted.outcomes.push(OuOutcome::applied(ou));
                }
                Err(e) => {
                    warn!(ou = %ou, error = %e, "Member entry write failed");
                    persisted.outcomes.push(OuOutcome::failed(ou, e.to_string()));
                    persisted.failed = true;
                }
            }
        }
        persisted
    }

    async fn compensate(&self, persisted: &mut Persisted) {
        for (index, entry) in persisted.written.iter().rev() {
            match self.store.delete(entry).await {
                Ok(()) => persisted.outcomes[*index].status = OuStatus::RolledBack,
                Err(e) => warn!(path = %entry.path, error = %e, "Compensating delete failed"),
            }
        }
    }

    /// Write one audit record; a failing sink is logged, never raised
    pub async fn record(
        &self,
        operation: AuditOperation,
        entity: &str,
        entity_id: &str,
        ous: &[String],
        description: String,
        actor: &Subject,
    ) {
        let record = AuditRecord::new(
            operation,
            entity,
            entity_id,
            ous,
            description,
            actor.uid.clone(),
        );
        if let Err(e) = self.audit.record(&record).await {
            warn!(error = %e, "Failed to record audit event");
        }
    }
}

// =============================================================================
// Validation and authorization
// =============================================================================

fn validate_create(request: &CreateIdentity) -> Result<()> {
    let mut v = Validator::new();
    v.naming_value("uid", &request.uid)
        .identifying_number_optional(
            "identifying_number",
            trimmed(request.identifying_number.as_deref()),
        );
    validate_attributes(&mut v, &request.attributes);

    if request.memberships.is_empty() {
        v.error("memberships", "at least one OU is required");
    }
    validate_memberships(&mut v, &request.memberships);

    for name in request.extra.keys() {
        if TYPED_ATTRIBUTES.iter().any(|t| t.eq_ignore_ascii_case(name)) {
            v.error("extra", &format!("{} has a dedicated field", name));
        }
    }
    v.finish()
}

fn validate_update(request: &UpdateIdentity) -> Result<()> {
    let mut v = Validator::new();
    v.naming_value("uid", &request.uid)
        .identifying_number_optional(
            "identifying_number",
            trimmed(request.identifying_number.as_deref()),
        );
    validate_attributes(&mut v, &request.patch);

    if let Some(memberships) = &request.memberships {
        validate_memberships(&mut v, memberships);
    }
    for name in request.attributes.keys() {
        if MANAGED_ATTRIBUTES.iter().any(|m| m.eq_ignore_ascii_case(name)) {
            v.error("attributes", &format!("{} has a dedicated field", name));
        }
    }
    v.finish()
}

fn validate_attributes(v: &mut Validator, attributes: &IdentityAttributes) {
    v.text_optional("given_name", attributes.given_name.as_deref())
        .text_optional("family_name", attributes.family_name.as_deref())
        .text_optional("display_name", attributes.display_name.as_deref())
        .email_optional("email", attributes.email.as_deref());
}

fn validate_memberships(v: &mut Validator, memberships: &[MembershipRequest]) {
    let mut seen = BTreeSet::new();
    for membership in memberships {
        v.naming_value("ou", &membership.ou);
        if !seen.insert(membership.ou.trim().to_lowercase()) {
            v.error("ou", &format!("{} is named more than once", membership.ou.trim()));
        }
        if let Some(path) = &membership.path {
            let agrees = path
                .ou()
                .map(|ou| same_ou(ou, &membership.ou))
                .unwrap_or(false);
            if !agrees {
                v.error(
                    "path",
                    &format!("{} is not in OU {}", path, membership.ou.trim()),
                );
            }
        }
    }
}

fn authorize_create(actor: &Subject, request: &CreateIdentity) -> Result<()> {
    match actor.role {
        Role::Root => Ok(()),
        Role::OuAdmin => {
            authorize_scope(actor, request.memberships.iter().map(|m| m.ou.as_str()))?;
            forbid_root_grant(&request.memberships)
        }
        Role::User => Err(OumanError::forbidden("users may not create identities")),
    }
}

fn authorize_update(
    actor: &Subject,
    uid: &str,
    existing: &[DirectoryEntry],
    request: &UpdateIdentity,
) -> Result<()> {
    match actor.role {
        Role::Root => Ok(()),
        Role::OuAdmin => {
            authorize_members(actor, existing)?;
            if let Some(memberships) = &request.memberships {
                authorize_scope(actor, memberships.iter().map(|m| m.ou.as_str()))?;
                forbid_root_grant(memberships)?;
            }
            Ok(())
        }
        Role::User => {
            if !same_uid(&actor.uid, uid) {
                return Err(OumanError::forbidden("users may only update themselves"));
            }
            if request.memberships.is_some() {
                return Err(OumanError::forbidden("users may not change memberships"));
            }
            Ok(())
        }
    }
}

fn authorize_delete(actor: &Subject, existing: &[DirectoryEntry]) -> Result<()> {
    match actor.role {
        Role::Root => Ok(()),
        Role::OuAdmin => authorize_members(actor, existing),
        Role::User => Err(OumanError::forbidden("users may not delete identities")),
    }
}

fn authorize_scope<'a>(actor: &Subject, ous: impl Iterator<Item = &'a str>) -> Result<()> {
    for ou in ous {
        if !actor.may_manage(ou) {
            return Err(OumanError::forbidden(format!(
                "{} may not manage OU {}",
                actor.uid,
                ou.trim()
            )));
        }
    }
    Ok(())
}

/// Every existing member must sit inside the actor's scope
fn authorize_members(actor: &Subject, existing: &[DirectoryEntry]) -> Result<()> {
    for entry in existing {
        match resolve_ou(entry) {
            Some(ou) if actor.may_manage(&ou) => {}
            _ => {
                return Err(OumanError::forbidden(format!(
                    "{} has entries outside the scope of {}",
                    entry.uid.as_deref().unwrap_or_default(),
                    actor.uid
                )))
            }
        }
    }
    Ok(())
}

fn forbid_root_grant(memberships: &[MembershipRequest]) -> Result<()> {
    if memberships.iter().any(|m| m.role == Role::Root) {
        return Err(OumanError::forbidden("only root may grant the root role"));
    }
    Ok(())
}

// =============================================================================
// Entry construction
// =============================================================================

fn person_entry(
    uid: &str,
    ou: &str,
    role: Role,
    path: NamingPath,
    template: &MemberTemplate<'_>,
) -> DirectoryEntry {
    let attributes = &template.attributes;
    let mut entry = DirectoryEntry::person(path);

    for (name, values) in template.extra {
        entry.set_attribute(name, values.clone());
    }

    entry.uid = Some(uid.to_string());
    entry.given_name = attributes.given_name.clone();
    entry.display_name = attributes
        .display_name
        .clone()
        .or_else(|| derived_display_name(attributes))
        .or_else(|| Some(uid.to_string()));
    // person requires sn
    entry.family_name = attributes
        .family_name
        .clone()
        .or_else(|| entry.display_name.clone());
    entry.email = attributes.email.clone();
    entry.identifying_number = template.identifying_number.clone();
    entry.credential = template.credential.clone();
    entry.ou = Some(ou.to_string());
    entry.roles = vec![role.marker().to_string()];
    entry
}

fn derived_display_name(attributes: &IdentityAttributes) -> Option<String> {
    let joined = [&attributes.given_name, &attributes.family_name]
        .iter()
        .filter_map(|v| v.as_deref())
        .collect::<Vec<_>>()
        .join(" ");
    Some(joined).filter(|name| !name.is_empty())
}

/// Attribute writes of an update, by LDAP name
fn attribute_writes(
    request: &UpdateIdentity,
    number: Option<&str>,
    credential: Option<&str>,
) -> Vec<(String, Vec<String>)> {
    let mut writes: Vec<(String, Vec<String>)> = request
        .patch
        .as_pairs()
        .into_iter()
        .map(|(name, value)| (name.to_string(), vec![value.to_string()]))
        .collect();
    writes.extend(
        request
            .attributes
            .iter()
            .map(|(name, values)| (name.clone(), values.clone())),
    );
    if let Some(number) = number {
        writes.push((attrs::IDENTIFYING_NUMBER.to_string(), vec![number.to_string()]));
    }
    if let Some(credential) = credential {
        writes.push((attrs::CREDENTIAL.to_string(), vec![credential.to_string()]));
    }
    writes
}

/// Apply writes, dropping any that would change the leaf or the UID
fn apply_writes(
    entry: &mut DirectoryEntry,
    writes: &[(String, Vec<String>)],
    dropped: &mut Vec<DroppedAttribute>,
) {
    for (name, values) in writes {
        let immutable = entry.path.leaf().is(name) || name.eq_ignore_ascii_case(attrs::UID);
        if immutable {
            if entry.attribute_values(name) != *values {
                warn!(
                    path = %entry.path,
                    attribute = %name,
                    "Dropping write to immutable naming attribute"
                );
                dropped.push(DroppedAttribute {
                    path: entry.path.to_string(),
                    attribute: name.clone(),
                    attempted: values.clone(),
                });
            }
            continue;
        }
        entry.set_attribute(name, values.clone());
    }
}

fn number_keys(number: Option<&str>, ous: &[String]) -> Vec<String> {
    match number {
        Some(number) => ous.iter().map(|ou| number_key(ou, number)).collect(),
        None => Vec::new(),
    }
}

fn applied_ous(outcomes: &[OuOutcome]) -> Vec<String> {
    outcomes
        .iter()
        .filter(|o| o.is_applied())
        .map(|o| o.ou.clone())
        .collect()
}

fn ou_label(entry: &DirectoryEntry) -> String {
    resolve_ou(entry).unwrap_or_else(|| entry.path.to_string())
}

fn trimmed(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn same_uid(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}
