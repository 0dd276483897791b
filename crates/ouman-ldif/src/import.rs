//! Applies LDIF files through the identity engine
//!
//! Blocks are applied one at a time in file order, so a later block may
//! rely on an OU registered earlier in the same file. The file is not a
//! transaction: every block succeeds or fails on its own.

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use ouman_core::{
    resolve_ou, resolve_role, AuditOperation, AuditSink, DirectoryStore, ImportBatchId,
    OrganizationalUnit, OumanError, Result, Subject,
};
use ouman_identity::{CreateIdentity, IdentityEngine, MembershipRequest, OuRegistration};

use crate::parser::parse;
use crate::record::{BlockKind, LdifBlock};

/// Outcome of one block
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockResult {
    pub dn: String,
    pub line: usize,
    pub success: bool,
    pub message: String,
    /// Error kind when the block failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BlockResult {
    fn ok(block: &LdifBlock, message: String) -> Self {
        Self {
            dn: dn_label(block),
            line: block.line,
            success: true,
            message,
            error: None,
        }
    }

    fn failed(block: &LdifBlock, err: &OumanError) -> Self {
        Self {
            dn: dn_label(block),
            line: block.line,
            success: false,
            message: err.to_string(),
            error: Some(err.kind().to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub batch: ImportBatchId,
    pub results: Vec<BlockResult>,
}

impl ImportReport {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    pub fn is_clean(&self) -> bool {
        self.failed() == 0
    }
}

pub struct LdifImporter<S, A>
where
    S: DirectoryStore,
    A: AuditSink,
{
    engine: Arc<IdentityEngine<S, A>>,
}

impl<S, A> LdifImporter<S, A>
where
    S: DirectoryStore,
    A: AuditSink,
{
    pub fn new(engine: Arc<IdentityEngine<S, A>>) -> Self {
        Self { engine }
    }

    /// Apply every block of `text` in order and report each outcome
    #[instrument(skip(self, actor, text), fields(actor = %actor.uid))]
    pub async fn apply(&self, actor: &Subject, text: &str) -> ImportReport {
        let batch = ImportBatchId::new();
        let blocks = parse(text);
        let mut results = Vec::with_capacity(blocks.len());

        for block in &blocks {
            let result = match self.apply_block(actor, block).await {
                Ok(message) => BlockResult::ok(block, message),
                Err(e) => {
                    warn!(line = block.line, error = %e, "LDIF block rejected");
                    BlockResult::failed(block, &e)
                }
            };
            results.push(result);
        }

        let report = ImportReport { batch, results };
        self.engine
            .record(
                AuditOperation::Import,
                "import_batch",
                &batch.to_string(),
                &[],
                format!(
                    "Imported {} of {} LDIF blocks",
                    report.succeeded(),
                    report.results.len()
                ),
                actor,
            )
            .await;

        info!(
            batch = %batch,
            succeeded = report.succeeded(),
            failed = report.failed(),
            "LDIF import finished"
        );
        report
    }

    async fn apply_block(&self, actor: &Subject, block: &LdifBlock) -> Result<String> {
        match block.classify()? {
            BlockKind::Person => {
                let request = person_request(block)?;
                let uid = request.uid.clone();
                let ou = request.memberships[0].ou.clone();
                self.engine.create(actor, request).await?;
                Ok(format!("Created {} in {}", uid, ou))
            }
            BlockKind::OrganizationalUnit => {
                let ou = organizational_unit(block)?;
                let name = ou.name.clone();
                let message = match self.engine.register_ou(actor, ou).await? {
                    OuRegistration::Created => format!("Registered OU {}", name),
                    OuRegistration::Updated => format!("Updated OU {}", name),
                    OuRegistration::Unchanged => format!("OU {} already registered", name),
                };
                Ok(message)
            }
        }
    }
}

/// A single-membership create at the block's own path
fn person_request(block: &LdifBlock) -> Result<CreateIdentity> {
    let entry = block.to_entry()?;

    let uid = entry
        .uid
        .clone()
        .or_else(|| {
            let leaf = entry.path.leaf();
            leaf.is("uid").then(|| leaf.value.clone())
        })
        .ok_or_else(|| OumanError::malformed_block(block.line, "person block has no uid"))?;
    let ou = resolve_ou(&entry)
        .ok_or_else(|| OumanError::malformed_block(block.line, "person block has no OU"))?;

    Ok(CreateIdentity {
        uid,
        attributes: entry.common_attributes(),
        identifying_number: entry.identifying_number.clone(),
        password: entry.credential.clone().filter(|p| !p.is_empty()),
        memberships: vec![MembershipRequest {
            ou,
            role: resolve_role(&entry),
            path: Some(entry.path.clone()),
        }],
        extra: entry.extra.clone(),
    })
}

fn organizational_unit(block: &LdifBlock) -> Result<OrganizationalUnit> {
    let path = block.path()?;
    let leaf = path.leaf();
    let name = block
        .first("ou")
        .map(ToString::to_string)
        .or_else(|| leaf.is("ou").then(|| leaf.value.clone()))
        .ok_or_else(|| OumanError::malformed_block(block.line, "OU block has no ou value"))?;

    Ok(OrganizationalUnit {
        name,
        description: block.first("description").map(ToString::to_string),
    })
}

fn dn_label(block: &LdifBlock) -> String {
    block.dn.clone().unwrap_or_default()
}
