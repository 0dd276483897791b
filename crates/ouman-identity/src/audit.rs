//! Audit sinks
//!
//! Durable audit storage is owned by the host application; these sinks
//! cover logging and tests.

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

use ouman_core::{AuditRecord, AuditSink, Result};

/// Emits each record as a structured `tracing` event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: &AuditRecord) -> Result<()> {
        info!(
            target: "ouman::audit",
            audit_id = %record.id,
            operation = %record.operation,
            entity = %record.entity,
            entity_id = %record.entity_id,
            ou = record.ou.as_deref().unwrap_or("-"),
            actor = %record.actor,
            "{}",
            record.description
        );
        Ok(())
    }
}

/// Keeps records in memory
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: RwLock<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, record: &AuditRecord) -> Result<()> {
        self.records.write().await.push(record.clone());
        Ok(())
    }
}
