//! Delivery log storage and rolling stats

use async_trait::async_trait;
use crm_shared::{WebhookDeliveryLog, WebhookStats};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

/// Append-only delivery logs with per-webhook aggregate stats kept in
/// lockstep with every append
#[async_trait]
pub trait DeliveryLogStore: Send + Sync {
    async fn append(&self, log: WebhookDeliveryLog);

    /// Newest first
    async fn list(&self, webhook_id: Uuid, limit: usize) -> Vec<WebhookDeliveryLog>;

    /// Zeroed stats for a webhook without deliveries
    async fn stats(&self, webhook_id: Uuid) -> WebhookStats;

    /// Recompute the stats of a webhook from its stored logs
    async fn rebuild_stats(&self, webhook_id: Uuid) -> WebhookStats;

    /// Drop the logs and stats of a deleted webhook
    async fn remove(&self, webhook_id: Uuid);
}

struct WebhookHistory {
    logs: VecDeque<WebhookDeliveryLog>,
    stats: WebhookStats,
}

/// In-memory store keeping the newest `retention` logs per webhook. Stats
/// cover every delivery ever appended; a rebuild covers the retained logs.
pub struct MemoryDeliveryLogStore {
    histories: RwLock<HashMap<Uuid, WebhookHistory>>,
    retention: usize,
}

impl MemoryDeliveryLogStore {
    pub fn new(retention: usize) -> Self {
        Self {
            histories: RwLock::new(HashMap::new()),
            retention: retention.max(1),
        }
    }
}

#[async_trait]
impl DeliveryLogStore for MemoryDeliveryLogStore {
    async fn append(&self, log: WebhookDeliveryLog) {
        let mut histories = self.histories.write();
        let history = histories
            .entry(log.webhook_id)
            .or_insert_with(|| WebhookHistory {
                logs: VecDeque::new(),
                stats: WebhookStats::new(log.webhook_id),
            });

        history.stats.record(&log);
        history.logs.push_back(log);
        while history.logs.len() > self.retention {
            history.logs.pop_front();
        }
    }

    async fn list(&self, webhook_id: Uuid, limit: usize) -> Vec<WebhookDeliveryLog> {
        self.histories
            .read()
            .get(&webhook_id)
            .map(|history| history.logs.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    async fn stats(&self, webhook_id: Uuid) -> WebhookStats {
        self.histories
            .read()
            .get(&webhook_id)
            .map(|history| history.stats.clone())
            .unwrap_or_else(|| WebhookStats::new(webhook_id))
    }

    async fn rebuild_stats(&self, webhook_id: Uuid) -> WebhookStats {
        let mut histories = self.histories.write();
        match histories.get_mut(&webhook_id) {
            Some(history) => {
                history.stats = WebhookStats::from_logs(webhook_id, history.logs.iter());
                history.stats.clone()
            }
            None => WebhookStats::new(webhook_id),
        }
    }

    async fn remove(&self, webhook_id: Uuid) {
        self.histories.write().remove(&webhook_id);
    }
}
