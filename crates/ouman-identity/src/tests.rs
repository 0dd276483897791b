//! Unit tests for ouman-identity

use std::sync::Arc;

use ouman_core::{
    resolve_ou, resolve_role, AuditOperation, DirectoryStore, IdentityAttributes, NamingPath,
    OrganizationalUnit, OuStatus, OumanError, Role, Subject,
};

use crate::{
    CreateIdentity, CredentialHasher, EngineSettings, IdentityEngine, InMemoryDirectoryStore,
    MemoryAuditSink, MembershipRequest, OuRegistration, UpdateIdentity,
};

const BASE: &str = "dc=example,dc=com";

type Engine = IdentityEngine<InMemoryDirectoryStore, MemoryAuditSink>;

struct Fixture {
    engine: Engine,
    store: Arc<InMemoryDirectoryStore>,
    audit: Arc<MemoryAuditSink>,
}

async fn fixture_with(settings: EngineSettings, ous: &[&str]) -> Fixture {
    let store = Arc::new(InMemoryDirectoryStore::new());
    let audit = Arc::new(MemoryAuditSink::new());
    let engine = IdentityEngine::new(
        store.clone(),
        audit.clone(),
        settings,
        CredentialHasher::low_cost(),
    );
    for ou in ous {
        engine
            .register_ou(&root(), OrganizationalUnit::new(*ou))
            .await
            .unwrap();
    }
    Fixture {
        engine,
        store,
        audit,
    }
}

async fn fixture(ous: &[&str]) -> Fixture {
    fixture_with(EngineSettings::new(BASE), ous).await
}

fn root() -> Subject {
    Subject::root("directory.admin")
}

fn ou_admin(scope: &str) -> Subject {
    Subject {
        uid: format!("{}.admin", scope),
        role: Role::OuAdmin,
        ou_scope: Some(scope.to_string()),
    }
}

fn ana_attributes() -> IdentityAttributes {
    IdentityAttributes {
        given_name: Some("Ana".into()),
        family_name: Some("Silva".into()),
        display_name: Some("Ana Silva".into()),
        email: Some("ana.silva@example.com".into()),
    }
}

fn ana() -> CreateIdentity {
    CreateIdentity::new("ana.silva")
        .with_attributes(ana_attributes())
        .with_identifying_number("12345678900")
        .with_password("Secret#1")
        .member("finance", Role::User)
        .member("hr", Role::OuAdmin)
}

fn person(uid: &str, number: &str, ou: &str) -> CreateIdentity {
    CreateIdentity::new(uid)
        .with_identifying_number(number)
        .member(ou, Role::User)
}

fn entry_path(uid: &str, ou: &str) -> NamingPath {
    NamingPath::for_entry(uid, ou, BASE).unwrap()
}

// =============================================================================
// Create Tests
// =============================================================================

#[cfg(test)]
mod create_tests {
    use super::*;

    #[tokio::test]
    async fn test_create_writes_one_entry_per_ou() {
        let f = fixture(&["finance", "hr"]).await;
        let identity = f.engine.create(&root(), ana()).await.unwrap();

        assert_eq!(identity.ous(), vec!["finance".to_string(), "hr".to_string()]);

        let entries = f.store.find_by_uid("ana.silva").await.unwrap();
        assert_eq!(entries.len(), 2);
        for entry in &entries {
            let ou = resolve_ou(entry).unwrap();
            assert!(ou == "finance" || ou == "hr");
            assert_eq!(entry.display_name.as_deref(), Some("Ana Silva"));
            assert_eq!(entry.identifying_number.as_deref(), Some("12345678900"));
        }

        let hr = f
            .store
            .find_by_path(&entry_path("ana.silva", "hr"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolve_role(&hr), Role::OuAdmin);
    }

    #[tokio::test]
    async fn test_password_hashed_once_per_identity() {
        let f = fixture(&["finance", "hr"]).await;
        f.engine.create(&root(), ana()).await.unwrap();

        let entries = f.store.find_by_uid("ana.silva").await.unwrap();
        let first = entries[0].credential.clone().unwrap();
        assert!(first.starts_with("{ARGON2}"));
        assert_eq!(entries[1].credential.as_deref(), Some(first.as_str()));
        assert!(f.engine.hasher().verify("Secret#1", &first));
    }

    #[tokio::test]
    async fn test_prehashed_password_stored_as_is() {
        let f = fixture(&["finance"]).await;
        let request = person("ana", "1", "finance").with_password("{SSHA}W6ph5Mm5Pz8GgiULbPgzG37mj9g=");
        f.engine.create(&root(), request).await.unwrap();

        let entry = f.store.find_by_uid("ana").await.unwrap().remove(0);
        assert_eq!(
            entry.credential.as_deref(),
            Some("{SSHA}W6ph5Mm5Pz8GgiULbPgzG37mj9g=")
        );
    }

    #[tokio::test]
    async fn test_single_audit_record_for_all_ous() {
        let f = fixture(&["finance", "hr"]).await;
        let before = f.audit.len().await;
        f.engine.create(&root(), ana()).await.unwrap();

        let records = f.audit.records().await;
        assert_eq!(records.len(), before + 1);
        let record = records.last().unwrap();
        assert_eq!(record.operation, AuditOperation::Create);
        assert_eq!(record.entity_id, "ana.silva");
        assert_eq!(record.ou.as_deref(), Some("finance,hr"));
        assert_eq!(record.actor, "directory.admin");
    }

    #[tokio::test]
    async fn test_number_conflict_names_holder_and_ou() {
        let f = fixture(&["finance", "hr", "it"]).await;
        f.engine.create(&root(), ana()).await.unwrap();

        let err = f
            .engine
            .create(&root(), person("bruno.rocha", "12345678900", "finance"))
            .await
            .unwrap_err();
        match err {
            OumanError::IdentifyingNumberConflict { number, holders } => {
                assert_eq!(number, "12345678900");
                assert_eq!(holders.len(), 1);
                assert_eq!(holders[0].uid, "ana.silva");
                assert_eq!(holders[0].display_name.as_deref(), Some("Ana Silva"));
                assert_eq!(holders[0].ous, vec!["finance".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        f.engine
            .create(&root(), person("bruno.rocha", "12345678900", "it"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_number_conflict_collects_every_ou() {
        let f = fixture(&["finance", "hr"]).await;
        f.engine.create(&root(), ana()).await.unwrap();

        let request = CreateIdentity::new("bruno.rocha")
            .with_identifying_number("12345678900")
            .member("finance", Role::User)
            .member("hr", Role::User);
        match f.engine.create(&root(), request).await.unwrap_err() {
            OumanError::IdentifyingNumberConflict { holders, .. } => {
                assert_eq!(holders[0].ous, vec!["finance".to_string(), "hr".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(f.store.find_by_uid("bruno.rocha").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_in_ou_lists_every_clash_before_writing() {
        let f = fixture(&["finance", "hr", "it"]).await;
        f.engine.create(&root(), ana()).await.unwrap();

        let request = CreateIdentity::new("ana.silva")
            .member("finance", Role::User)
            .member("hr", Role::User)
            .member("it", Role::User);
        match f.engine.create(&root(), request).await.unwrap_err() {
            OumanError::DuplicateInOu { uid, ous } => {
                assert_eq!(uid, "ana.silva");
                assert_eq!(ous, vec!["finance".to_string(), "hr".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(f
            .store
            .find_by_path(&entry_path("ana.silva", "it"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_existing_identity_joins_another_ou_with_shared_values() {
        let f = fixture(&["finance", "hr", "it"]).await;
        f.engine.create(&root(), ana()).await.unwrap();

        let joining = CreateIdentity::new("ana.silva").member("it", Role::User);
        let identity = f.engine.create(&root(), joining).await.unwrap();
        assert_eq!(identity.memberships.len(), 3);

        let entries = f.store.find_by_uid("ana.silva").await.unwrap();
        let it = entries.iter().find(|e| e.in_ou("it")).unwrap();
        let finance = entries.iter().find(|e| e.in_ou("finance")).unwrap();
        assert_eq!(it.common_attributes(), finance.common_attributes());
        assert_eq!(it.identifying_number, finance.identifying_number);
        assert_eq!(it.credential, finance.credential);
    }

    #[tokio::test]
    async fn test_joining_with_matching_values_reuses_stored_credential() {
        let f = fixture(&["finance", "hr", "it"]).await;
        f.engine.create(&root(), ana()).await.unwrap();

        let joining = CreateIdentity::new("ana.silva")
            .with_attributes(ana_attributes())
            .with_identifying_number("12345678900")
            .with_password("Secret#1")
            .member("it", Role::User);
        f.engine.create(&root(), joining).await.unwrap();

        let entries = f.store.find_by_uid("ana.silva").await.unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|e| e.credential == entries[0].credential));
    }

    #[tokio::test]
    async fn test_joining_with_diverging_values_rejected() {
        let f = fixture(&["finance", "hr", "it"]).await;
        f.engine.create(&root(), ana()).await.unwrap();

        let diverging = [
            ("employeeNumber", CreateIdentity::new("ana.silva").with_identifying_number("222")),
            (
                "cn",
                CreateIdentity::new("ana.silva").with_attributes(IdentityAttributes {
                    display_name: Some("Somebody Else".into()),
                    ..ana_attributes()
                }),
            ),
            (
                "mail",
                CreateIdentity::new("ana.silva").with_attributes(IdentityAttributes {
                    email: Some("other@example.com".into()),
                    ..Default::default()
                }),
            ),
            ("userPassword", CreateIdentity::new("ana.silva").with_password("pw-two")),
        ];

        for (field, request) in diverging {
            let err = f
                .engine
                .create(&root(), request.member("it", Role::User))
                .await
                .unwrap_err();
            match err {
                OumanError::ValidationFailed { field: got, .. } => assert_eq!(got, field),
                other => panic!("unexpected error for {field}: {other:?}"),
            }
        }
        assert!(f
            .store
            .find_by_path(&entry_path("ana.silva", "it"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_joining_checks_inherited_number_in_new_ou() {
        let f = fixture(&["finance", "hr", "it"]).await;
        f.engine.create(&root(), ana()).await.unwrap();
        f.engine
            .create(&root(), person("carla", "12345678900", "it"))
            .await
            .unwrap();

        let err = f
            .engine
            .create(&root(), CreateIdentity::new("ana.silva").member("it", Role::User))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "identifying_number_conflict");
    }

    #[tokio::test]
    async fn test_unknown_ou_is_not_found() {
        let f = fixture(&["finance"]).await;
        let err = f
            .engine
            .create(&root(), person("ana", "1", "marketing"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            OumanError::not_found("organizational_unit", "marketing")
        );
    }

    #[tokio::test]
    async fn test_invalid_requests_rejected() {
        let f = fixture(&["finance"]).await;

        let blank = person("   ", "1", "finance");
        let no_ous = CreateIdentity::new("ana");
        let twice = CreateIdentity::new("ana")
            .member("finance", Role::User)
            .member("FINANCE", Role::OuAdmin);
        let bad_email = person("ana", "1", "finance").with_attributes(IdentityAttributes {
            email: Some("not-an-email".into()),
            ..Default::default()
        });
        let mut wrong_path = person("ana", "1", "finance");
        wrong_path.memberships[0].path = Some(entry_path("ana", "hr"));

        for request in [blank, no_ous, twice, bad_email, wrong_path] {
            let err = f.engine.create(&root(), request).await.unwrap_err();
            assert_eq!(err.kind(), "validation_failed", "{err}");
        }
        assert_eq!(f.store.len().await, 1);
    }

    #[tokio::test]
    async fn test_structural_characters_survive_in_path() {
        let f = fixture(&["r&d, labs"]).await;
        let identity = f
            .engine
            .create(&root(), person("o'brien, jr+1", "77", "r&d, labs"))
            .await
            .unwrap();

        let path = &identity.memberships[0].path;
        assert_eq!(path.leaf().value, "o'brien, jr+1");
        assert_eq!(path.ou(), Some("r&d, labs"));
    }

    #[tokio::test]
    async fn test_explicit_path_is_used() {
        let f = fixture(&["finance"]).await;
        let path = NamingPath::parse("cn=Ana Silva,ou=finance,dc=example,dc=com").unwrap();
        let request = CreateIdentity {
            memberships: vec![MembershipRequest::at(path.clone(), Role::User)],
            ..person("ana", "1", "finance")
        };
        f.engine.create(&root(), request).await.unwrap();

        let stored = f.store.find_by_path(&path).await.unwrap().unwrap();
        assert_eq!(stored.uid.as_deref(), Some("ana"));
    }

    #[tokio::test]
    async fn test_partial_failure_reports_each_ou_without_rollback() {
        let f = fixture(&["finance", "hr", "it"]).await;
        f.store.fail_writes_in_ou("hr").await;

        let request = ana().member("it", Role::User);
        match f.engine.create(&root(), request).await.unwrap_err() {
            OumanError::PartialPersistenceFailure { uid, outcomes } => {
                assert_eq!(uid, "ana.silva");
                assert_eq!(outcomes.len(), 3);
                assert_eq!(outcomes[0].status, OuStatus::Applied);
                assert!(outcomes[1].is_failed());
                assert_eq!(outcomes[1].ou, "hr");
                assert_eq!(outcomes[2].status, OuStatus::Skipped);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let remaining = f.store.find_by_uid("ana.silva").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].in_ou("finance"));
    }

    #[tokio::test]
    async fn test_compensation_removes_applied_entries() {
        let settings = EngineSettings {
            compensate_partial_create: true,
            ..EngineSettings::new(BASE)
        };
        let f = fixture_with(settings, &["finance", "hr"]).await;
        f.store.fail_writes_in_ou("hr").await;

        match f.engine.create(&root(), ana()).await.unwrap_err() {
            OumanError::PartialPersistenceFailure { outcomes, .. } => {
                assert_eq!(outcomes[0].status, OuStatus::RolledBack);
                assert!(outcomes[1].is_failed());
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(f.store.find_by_uid("ana.silva").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_creates_claim_number_once() {
        let f = fixture(&["finance"]).await;
        let engine = Arc::new(f.engine);

        let a = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .create(&root(), person("ana", "42", "finance"))
                    .await
            })
        };
        let b = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .create(&root(), person("bruno", "42", "finance"))
                    .await
            })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.iter().any(|r| matches!(
            r,
            Err(OumanError::IdentifyingNumberConflict { .. })
        )));
    }
}

// =============================================================================
// Update Tests
// =============================================================================

#[cfg(test)]
mod update_tests {
    use super::*;

    #[tokio::test]
    async fn test_update_applies_patch_to_every_member() {
        let f = fixture(&["finance", "hr"]).await;
        f.engine.create(&root(), ana()).await.unwrap();

        let patch = IdentityAttributes {
            email: Some("ana@example.org".into()),
            ..Default::default()
        };
        let outcome = f
            .engine
            .update(&root(), UpdateIdentity::new("ana.silva").with_patch(patch))
            .await
            .unwrap();
        assert_eq!(outcome.updated.len(), 2);

        for entry in f.store.find_by_uid("ana.silva").await.unwrap() {
            assert_eq!(entry.email.as_deref(), Some("ana@example.org"));
            assert_eq!(entry.given_name.as_deref(), Some("Ana"));
        }
    }

    #[tokio::test]
    async fn test_update_is_idempotent() {
        let f = fixture(&["finance", "hr"]).await;
        f.engine.create(&root(), ana()).await.unwrap();

        let request = UpdateIdentity::new("ana.silva").with_patch(IdentityAttributes {
            display_name: Some("Ana M. Silva".into()),
            ..Default::default()
        });
        f.engine.update(&root(), request.clone()).await.unwrap();
        let after_first = f.store.find_by_uid("ana.silva").await.unwrap();

        let second = f.engine.update(&root(), request).await.unwrap();
        assert!(second.is_noop());
        assert_eq!(second.unchanged.len(), 2);
        assert_eq!(f.store.find_by_uid("ana.silva").await.unwrap(), after_first);
    }

    #[tokio::test]
    async fn test_repeated_password_update_is_noop() {
        let f = fixture(&["finance", "hr"]).await;
        f.engine.create(&root(), ana()).await.unwrap();
        let before = f.store.find_by_uid("ana.silva").await.unwrap();

        let request = UpdateIdentity::new("ana.silva").with_password("Secret#1");
        let outcome = f.engine.update(&root(), request.clone()).await.unwrap();
        assert!(outcome.is_noop());
        assert_eq!(f.store.find_by_uid("ana.silva").await.unwrap(), before);

        let changed = f
            .engine
            .update(&root(), UpdateIdentity::new("ana.silva").with_password("Secret#2"))
            .await
            .unwrap();
        assert_eq!(changed.updated.len(), 2);
        let after = f.store.find_by_uid("ana.silva").await.unwrap();
        assert!(f
            .engine
            .hasher()
            .verify("Secret#2", after[0].credential.as_deref().unwrap()));
        assert_eq!(after[0].credential, after[1].credential);

        let repeated = f
            .engine
            .update(&root(), UpdateIdentity::new("ana.silva").with_password("Secret#2"))
            .await
            .unwrap();
        assert!(repeated.is_noop());
    }

    #[tokio::test]
    async fn test_leaf_write_is_dropped_not_raised() {
        let f = fixture(&["finance", "hr"]).await;
        f.engine.create(&root(), ana()).await.unwrap();

        let outcome = f
            .engine
            .update(
                &root(),
                UpdateIdentity::new("ana.silva").with_attribute("uid", "ana.souza"),
            )
            .await
            .unwrap();
        assert_eq!(outcome.dropped.len(), 2);
        assert_eq!(outcome.dropped[0].attribute, "uid");
        assert!(outcome.is_noop());

        let entries = f.store.find_by_uid("ana.silva").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(f.store.find_by_uid("ana.souza").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_leaf_write_with_same_value_is_silent() {
        let f = fixture(&["finance"]).await;
        let path = NamingPath::parse("cn=Ana Silva,ou=finance,dc=example,dc=com").unwrap();
        let request = CreateIdentity {
            memberships: vec![MembershipRequest::at(path, Role::User)],
            ..ana()
        };
        f.engine.create(&root(), request).await.unwrap();

        let same = UpdateIdentity::new("ana.silva").with_patch(IdentityAttributes {
            display_name: Some("Ana Silva".into()),
            ..Default::default()
        });
        let outcome = f.engine.update(&root(), same).await.unwrap();
        assert!(outcome.dropped.is_empty());

        let renamed = UpdateIdentity::new("ana.silva").with_patch(IdentityAttributes {
            display_name: Some("Ana Souza".into()),
            ..Default::default()
        });
        let outcome = f.engine.update(&root(), renamed).await.unwrap();
        assert_eq!(outcome.dropped.len(), 1);
        assert_eq!(outcome.dropped[0].attribute, "cn");

        let entry = f.store.find_by_uid("ana.silva").await.unwrap().remove(0);
        assert_eq!(entry.display_name.as_deref(), Some("Ana Silva"));
    }

    #[tokio::test]
    async fn test_new_membership_added_and_omitted_ous_kept() {
        let f = fixture(&["finance", "hr", "it"]).await;
        f.engine.create(&root(), ana()).await.unwrap();

        let outcome = f
            .engine
            .update(
                &root(),
                UpdateIdentity::new("ana.silva")
                    .with_memberships(vec![MembershipRequest::new("it", Role::User)]),
            )
            .await
            .unwrap();
        assert_eq!(outcome.created, vec!["it".to_string()]);

        let identity = f.engine.identity("ana.silva").await.unwrap();
        assert_eq!(identity.memberships.len(), 3);

        let it = f
            .store
            .find_by_path(&entry_path("ana.silva", "it"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(it.display_name.as_deref(), Some("Ana Silva"));
        assert_eq!(it.identifying_number.as_deref(), Some("12345678900"));
        assert!(it.credential.is_some());
    }

    #[tokio::test]
    async fn test_role_change_touches_named_ou_only() {
        let f = fixture(&["finance", "hr"]).await;
        f.engine.create(&root(), ana()).await.unwrap();

        let outcome = f
            .engine
            .update(
                &root(),
                UpdateIdentity::new("ana.silva")
                    .with_memberships(vec![MembershipRequest::new("Finance", Role::OuAdmin)]),
            )
            .await
            .unwrap();
        assert_eq!(outcome.updated, vec!["finance".to_string()]);

        let identity = f.engine.identity("ana.silva").await.unwrap();
        assert!(identity.memberships.iter().all(|m| m.role == Role::OuAdmin));
    }

    #[tokio::test]
    async fn test_number_change_checked_in_every_ou() {
        let f = fixture(&["finance", "hr", "it"]).await;
        f.engine.create(&root(), ana()).await.unwrap();
        f.engine
            .create(&root(), person("bruno.rocha", "555", "hr"))
            .await
            .unwrap();
        f.engine
            .create(&root(), person("carla", "777", "it"))
            .await
            .unwrap();

        let err = f
            .engine
            .update(
                &root(),
                UpdateIdentity::new("ana.silva").with_identifying_number("555"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "identifying_number_conflict");

        f.engine
            .update(
                &root(),
                UpdateIdentity::new("ana.silva").with_identifying_number("777"),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_new_ou_checked_with_current_number() {
        let f = fixture(&["finance", "hr", "it"]).await;
        f.engine.create(&root(), ana()).await.unwrap();
        f.engine
            .create(&root(), person("carla", "12345678900", "it"))
            .await
            .unwrap();

        let err = f
            .engine
            .update(
                &root(),
                UpdateIdentity::new("ana.silva")
                    .with_memberships(vec![MembershipRequest::new("it", Role::User)]),
            )
            .await
            .unwrap_err();
        match err {
            OumanError::IdentifyingNumberConflict { holders, .. } => {
                assert_eq!(holders[0].uid, "carla");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_managed_attribute_rejected() {
        let f = fixture(&["finance"]).await;
        f.engine
            .create(&root(), person("ana", "1", "finance"))
            .await
            .unwrap();

        let err = f
            .engine
            .update(
                &root(),
                UpdateIdentity::new("ana").with_attribute("employeeType", "root"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation_failed");
    }

    #[tokio::test]
    async fn test_update_unknown_identity() {
        let f = fixture(&["finance"]).await;
        let err = f
            .engine
            .update(&root(), UpdateIdentity::new("ghost"))
            .await
            .unwrap_err();
        assert_eq!(err, OumanError::not_found("identity", "ghost"));
    }
}

// =============================================================================
// Authorization Tests
// =============================================================================

#[cfg(test)]
mod authorization_tests {
    use super::*;

    #[tokio::test]
    async fn test_ou_admin_confined_to_scope() {
        let f = fixture(&["finance", "hr"]).await;
        let admin = ou_admin("hr");

        let err = f
            .engine
            .create(&admin, person("ana", "1", "finance"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "forbidden");

        let across = CreateIdentity::new("bruno")
            .member("hr", Role::User)
            .member("finance", Role::User);
        assert_eq!(
            f.engine.create(&admin, across).await.unwrap_err().kind(),
            "forbidden"
        );
        assert!(f.store.find_by_uid("bruno").await.unwrap().is_empty());

        f.engine
            .create(&admin, person("ana", "1", "HR"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_ou_admin_cannot_grant_root() {
        let f = fixture(&["hr"]).await;
        let request = CreateIdentity::new("ana").member("hr", Role::Root);
        let err = f.engine.create(&ou_admin("hr"), request).await.unwrap_err();
        assert_eq!(err.kind(), "forbidden");
    }

    #[tokio::test]
    async fn test_ou_admin_cannot_touch_identity_spanning_other_ous() {
        let f = fixture(&["finance", "hr"]).await;
        f.engine.create(&root(), ana()).await.unwrap();

        let admin = ou_admin("hr");
        let update = UpdateIdentity::new("ana.silva").with_patch(IdentityAttributes {
            email: Some("x@example.com".into()),
            ..Default::default()
        });
        assert_eq!(
            f.engine.update(&admin, update).await.unwrap_err().kind(),
            "forbidden"
        );
        assert_eq!(
            f.engine.delete(&admin, "ana.silva").await.unwrap_err().kind(),
            "forbidden"
        );
        assert_eq!(f.store.find_by_uid("ana.silva").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_subject_resolved_from_entry() {
        let f = fixture(&["finance", "hr"]).await;
        f.engine.create(&root(), ana()).await.unwrap();
        let hr_entry = f
            .store
            .find_by_path(&entry_path("ana.silva", "hr"))
            .await
            .unwrap()
            .unwrap();

        let actor = Subject::from_entry(&hr_entry);
        assert_eq!(actor.role, Role::OuAdmin);
        assert_eq!(actor.ou_scope.as_deref(), Some("hr"));

        f.engine
            .create(&actor, person("bruno", "2", "hr"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_user_may_only_update_self() {
        let f = fixture(&["finance"]).await;
        f.engine
            .create(&root(), person("ana", "1", "finance"))
            .await
            .unwrap();
        f.engine
            .create(&root(), person("bruno", "2", "finance"))
            .await
            .unwrap();

        let ana = Subject {
            uid: "ana".into(),
            role: Role::User,
            ou_scope: Some("finance".into()),
        };
        let patch = IdentityAttributes {
            email: Some("ana@example.com".into()),
            ..Default::default()
        };

        f.engine
            .update(&ana, UpdateIdentity::new("ana").with_patch(patch.clone()))
            .await
            .unwrap();

        let other = UpdateIdentity::new("bruno").with_patch(patch.clone());
        assert_eq!(f.engine.update(&ana, other).await.unwrap_err().kind(), "forbidden");

        let promote = UpdateIdentity::new("ana")
            .with_memberships(vec![MembershipRequest::new("finance", Role::OuAdmin)]);
        assert_eq!(f.engine.update(&ana, promote).await.unwrap_err().kind(), "forbidden");

        assert_eq!(f.engine.delete(&ana, "ana").await.unwrap_err().kind(), "forbidden");
        assert_eq!(
            f.engine
                .create(&ana, person("carla", "3", "finance"))
                .await
                .unwrap_err()
                .kind(),
            "forbidden"
        );
    }

    #[tokio::test]
    async fn test_only_root_registers_ous() {
        let f = fixture(&["hr"]).await;
        let err = f
            .engine
            .register_ou(&ou_admin("hr"), OrganizationalUnit::new("sales"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "forbidden");
    }
}

// =============================================================================
// Delete and OU Tests
// =============================================================================

#[cfg(test)]
mod delete_tests {
    use super::*;

    #[tokio::test]
    async fn test_delete_removes_every_member() {
        let f = fixture(&["finance", "hr"]).await;
        f.engine.create(&root(), ana()).await.unwrap();

        let outcome = f.engine.delete(&root(), "ana.silva").await.unwrap();
        assert_eq!(outcome.removed, vec!["finance".to_string(), "hr".to_string()]);
        assert!(f.store.find_by_uid("ana.silva").await.unwrap().is_empty());

        let record = f.audit.records().await.pop().unwrap();
        assert_eq!(record.operation, AuditOperation::Delete);
        assert_eq!(record.ou.as_deref(), Some("finance,hr"));
    }

    #[tokio::test]
    async fn test_delete_unknown_identity() {
        let f = fixture(&["finance"]).await;
        let err = f.engine.delete(&root(), "ghost").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_delete_reports_partial_failure() {
        let f = fixture(&["finance", "hr"]).await;
        f.engine.create(&root(), ana()).await.unwrap();
        f.store.fail_writes_in_ou("hr").await;

        match f.engine.delete(&root(), "ana.silva").await.unwrap_err() {
            OumanError::PartialPersistenceFailure { outcomes, .. } => {
                assert_eq!(outcomes.iter().filter(|o| o.is_applied()).count(), 1);
                assert_eq!(outcomes.iter().filter(|o| o.is_failed()).count(), 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let remaining = f.store.find_by_uid("ana.silva").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].in_ou("hr"));
    }

    #[tokio::test]
    async fn test_register_ou_upserts_by_name() {
        let f = fixture(&[]).await;
        let engine = &f.engine;

        assert_eq!(
            engine
                .register_ou(&root(), OrganizationalUnit::new("Finance"))
                .await
                .unwrap(),
            OuRegistration::Created
        );
        assert_eq!(
            engine
                .register_ou(&root(), OrganizationalUnit::new("finance"))
                .await
                .unwrap(),
            OuRegistration::Unchanged
        );
        assert_eq!(
            engine
                .register_ou(
                    &root(),
                    OrganizationalUnit::new("FINANCE").with_description("Money")
                )
                .await
                .unwrap(),
            OuRegistration::Updated
        );
        assert_eq!(f.store.len().await, 1);
    }

    #[tokio::test]
    async fn test_identity_query() {
        let f = fixture(&["finance", "hr"]).await;
        f.engine.create(&root(), ana()).await.unwrap();

        let identity = f.engine.identity("ANA.SILVA").await.unwrap();
        assert_eq!(identity.uid, "ana.silva");
        assert_eq!(identity.identifying_number.as_deref(), Some("12345678900"));
        assert_eq!(identity.attributes, ana_attributes());

        assert_eq!(
            f.engine.identity("ghost").await.unwrap_err().kind(),
            "not_found"
        );
    }
}
