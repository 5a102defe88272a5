//! Append-only execution log

use async_trait::async_trait;
use crm_shared::AutomationExecution;
use parking_lot::RwLock;
use std::collections::VecDeque;
use uuid::Uuid;

/// Storage for execution records. Records are never modified after append.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn append(&self, execution: AutomationExecution);

    /// Newest first
    async fn list_for_rule(&self, rule_id: Uuid, limit: usize) -> Vec<AutomationExecution>;

    /// Newest first, across every rule
    async fn list_recent(&self, limit: usize) -> Vec<AutomationExecution>;

    async fn len(&self) -> usize;
}

/// In-memory log that drops the oldest records past `retention`
pub struct MemoryExecutionStore {
    records: RwLock<VecDeque<AutomationExecution>>,
    retention: usize,
}

impl MemoryExecutionStore {
    pub fn new(retention: usize) -> Self {
        Self {
            records: RwLock::new(VecDeque::new()),
            retention: retention.max(1),
        }
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn append(&self, execution: AutomationExecution) {
        let mut records = self.records.write();
        records.push_back(execution);
        while records.len() > self.retention {
            records.pop_front();
        }
    }

    async fn list_for_rule(&self, rule_id: Uuid, limit: usize) -> Vec<AutomationExecution> {
        self.records
            .read()
            .iter()
            .rev()
            .filter(|execution| execution.rule_id == rule_id)
            .take(limit)
            .cloned()
            .collect()
    }

    async fn list_recent(&self, limit: usize) -> Vec<AutomationExecution> {
        self.records.read().iter().rev().take(limit).cloned().collect()
    }

    async fn len(&self) -> usize {
        self.records.read().len()
    }
}
