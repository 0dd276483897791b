//! File-level import scenarios against an in-memory directory

use std::sync::Arc;

use ouman_core::{DirectoryStore, Role, Subject};
use ouman_identity::{
    CredentialHasher, EngineSettings, IdentityEngine, InMemoryDirectoryStore, MemoryAuditSink,
};
use ouman_ldif::{LdifGenerator, LdifImporter, PersonExport};

const BASE: &str = "dc=example,dc=com";

fn importer() -> (
    LdifImporter<InMemoryDirectoryStore, MemoryAuditSink>,
    Arc<InMemoryDirectoryStore>,
) {
    let store = Arc::new(InMemoryDirectoryStore::new());
    let engine = Arc::new(IdentityEngine::new(
        store.clone(),
        Arc::new(MemoryAuditSink::new()),
        EngineSettings::new(BASE),
        CredentialHasher::low_cost(),
    ));
    (LdifImporter::new(engine), store)
}

const OUS: &str = "\
dn: ou=finance,dc=example,dc=com
objectClass: top
objectClass: organizationalUnit
ou: finance

dn: ou=it,dc=example,dc=com
objectClass: top
objectClass: organizationalUnit
ou: it

";

#[tokio::test]
async fn missing_dn_fails_only_its_own_block() {
    let (importer, store) = importer();
    importer.apply(&Subject::root("admin"), OUS).await;

    let text = "\
objectClass: inetOrgPerson
uid: ghost
ou: finance

dn: uid=ana.silva,ou=finance,dc=example,dc=com
objectClass: top
objectClass: person
objectClass: organizationalPerson
objectClass: inetOrgPerson
uid: ana.silva
cn: Ana Silva
sn: Silva
employeeNumber: 12345678900
userPassword: s3cret
ou: finance
employeeType: user
";

    let report = importer.apply(&Subject::root("admin"), text).await;
    assert_eq!(report.results.len(), 2);

    let first = &report.results[0];
    assert!(!first.success);
    assert_eq!(first.error.as_deref(), Some("malformed_block"));
    assert_eq!(first.line, 1);
    assert!(first.dn.is_empty());

    let second = &report.results[1];
    assert!(second.success, "{}", second.message);
    assert_eq!(second.line, 5);
    assert_eq!(second.message, "Created ana.silva in finance");

    assert!(store.find_by_uid("ghost").await.unwrap().is_empty());
    assert_eq!(store.find_by_uid("ana.silva").await.unwrap().len(), 1);
}

#[tokio::test]
async fn generated_file_shares_numbers_only_within_one_uid() {
    let (importer, store) = importer();
    importer.apply(&Subject::root("admin"), OUS).await;

    let tuple = |uid: &str, ou: &str, role: Role| PersonExport {
        uid: uid.to_string(),
        attributes: Default::default(),
        identifying_number: Some("12345678900".into()),
        password: Some("initial".into()),
        ou: ou.to_string(),
        role,
    };
    let ldif = LdifGenerator::new(BASE, CredentialHasher::low_cost())
        .generate(&[
            tuple("ana.silva", "finance", Role::User),
            tuple("ana.silva", "it", Role::OuAdmin),
            tuple("bruno.rocha", "it", Role::User),
        ])
        .unwrap();

    let report = importer.apply(&Subject::root("admin"), &ldif).await;
    let outcomes: Vec<bool> = report.results.iter().map(|r| r.success).collect();
    assert_eq!(outcomes, vec![true, true, false]);
    assert_eq!(
        report.results[2].error.as_deref(),
        Some("identifying_number_conflict")
    );

    let ana = store.find_by_uid("ana.silva").await.unwrap();
    assert_eq!(ana.len(), 2);
    assert_eq!(ana[0].credential, ana[1].credential);
    assert!(store.find_by_uid("bruno.rocha").await.unwrap().is_empty());
}
