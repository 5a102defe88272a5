//! Automation rule store
//!
//! Definitions live in a copy-on-write table: readers clone an `Arc` to the
//! current table and never block writers; writers build a new table under
//! the write lock and swap it in. Execution counters are kept beside the
//! definitions and only advance through `record_execution`.

use crate::error::{AutomationError, AutomationResult};
use chrono::{DateTime, Utc};
use crm_shared::{
    AutomationRule, CreateAutomationRequest, DomainEvent, RuleStatus, TriggerType,
    UpdateAutomationRequest, ValidationError,
};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default)]
struct RuleCounters {
    execution_count: u64,
    success_count: u64,
    last_executed_at: Option<DateTime<Utc>>,
}

/// Immutable view of every rule definition, in creation order
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    rules: BTreeMap<u64, Arc<AutomationRule>>,
    index: HashMap<Uuid, u64>,
}

impl RuleTable {
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn get(&self, id: &Uuid) -> Option<&Arc<AutomationRule>> {
        self.index.get(id).and_then(|seq| self.rules.get(seq))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<AutomationRule>> {
        self.rules.values()
    }

    /// Active rules whose trigger matches the event, in creation order
    pub fn matching(&self, event: &DomainEvent) -> Vec<Arc<AutomationRule>> {
        self.rules
            .values()
            .filter(|rule| rule.is_active() && rule.matches_event(event))
            .cloned()
            .collect()
    }
}

pub struct RuleStore {
    table: RwLock<Arc<RuleTable>>,
    next_seq: AtomicU64,
    counters: DashMap<Uuid, RuleCounters>,
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleStore {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(Arc::new(RuleTable::default())),
            next_seq: AtomicU64::new(1),
            counters: DashMap::new(),
        }
    }

    /// Current table; later writes are not visible through it
    pub fn snapshot(&self) -> Arc<RuleTable> {
        self.table.read().clone()
    }

    pub fn create(&self, request: CreateAutomationRequest) -> AutomationResult<AutomationRule> {
        let rule = request.into_rule()?;
        if rule.status == RuleStatus::Inactive {
            return Err(ValidationError::new("status", "a new rule must be draft or active").into());
        }
        rule.validate_definition()?;

        // Counters exist before the rule becomes visible to the engine
        self.counters.insert(rule.id, RuleCounters::default());
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        {
            let mut guard = self.table.write();
            let mut next = (**guard).clone();
            next.index.insert(rule.id, seq);
            next.rules.insert(seq, Arc::new(rule.clone()));
            *guard = Arc::new(next);
        }

        info!(rule_id = %rule.id, trigger = %rule.trigger_type, status = %rule.status, "Automation rule created");
        Ok(rule)
    }

    pub fn get(&self, id: Uuid) -> AutomationResult<AutomationRule> {
        let snapshot = self.snapshot();
        let rule = snapshot
            .get(&id)
            .ok_or_else(|| AutomationError::not_found(format!("Automation rule {}", id)))?;
        Ok(self.with_counters(rule))
    }

    /// Every rule in creation order
    pub fn list(&self) -> Vec<AutomationRule> {
        self.snapshot()
            .iter()
            .map(|rule| self.with_counters(rule))
            .collect()
    }

    /// Apply a partial update; the status is left as is
    pub fn update(&self, id: Uuid, request: UpdateAutomationRequest) -> AutomationResult<AutomationRule> {
        let rule = self.modify(id, |rule| Ok(request.apply_to(rule)?))?;
        info!(rule_id = %id, "Automation rule updated");
        Ok(rule)
    }

    /// draft/inactive -> active; requires at least one action
    pub fn activate(&self, id: Uuid) -> AutomationResult<AutomationRule> {
        self.transition(id, RuleStatus::Active)
    }

    /// active -> inactive
    pub fn deactivate(&self, id: Uuid) -> AutomationResult<AutomationRule> {
        self.transition(id, RuleStatus::Inactive)
    }

    pub fn delete(&self, id: Uuid) -> AutomationResult<()> {
        {
            let mut guard = self.table.write();
            let seq = guard
                .index
                .get(&id)
                .copied()
                .ok_or_else(|| AutomationError::not_found(format!("Automation rule {}", id)))?;
            let mut next = (**guard).clone();
            next.index.remove(&id);
            next.rules.remove(&seq);
            *guard = Arc::new(next);
        }
        self.counters.remove(&id);

        info!(rule_id = %id, "Automation rule deleted");
        Ok(())
    }

    /// Advance the counters of a rule after one execution. Rules deleted in
    /// the meantime are ignored.
    pub fn record_execution(&self, id: Uuid, success: bool, executed_at: DateTime<Utc>) {
        if let Some(mut counters) = self.counters.get_mut(&id) {
            counters.execution_count += 1;
            if success {
                counters.success_count += 1;
            }
            counters.last_executed_at = Some(match counters.last_executed_at {
                Some(last) if last > executed_at => last,
                _ => executed_at,
            });
        }
    }

    /// Active scheduled rules, used by the scheduled trigger source
    pub fn active_scheduled(&self) -> Vec<Arc<AutomationRule>> {
        self.snapshot()
            .iter()
            .filter(|rule| rule.is_active() && rule.trigger_type == TriggerType::Scheduled)
            .cloned()
            .collect()
    }

    fn transition(&self, id: Uuid, target: RuleStatus) -> AutomationResult<AutomationRule> {
        let rule = self.modify(id, |rule| {
            if !rule.status.can_become(target) {
                return Err(AutomationError::invalid_transition(
                    rule.status.as_str(),
                    target.as_str(),
                ));
            }
            if rule.status != target {
                rule.status = target;
                rule.updated_at = Utc::now();
            }
            Ok(())
        })?;

        info!(rule_id = %id, status = %rule.status, "Automation rule status changed");
        Ok(rule)
    }

    /// Copy, change, validate and swap in a single rule
    fn modify<F>(&self, id: Uuid, change: F) -> AutomationResult<AutomationRule>
    where
        F: FnOnce(&mut AutomationRule) -> AutomationResult<()>,
    {
        let updated = {
            let mut guard = self.table.write();
            let seq = guard
                .index
                .get(&id)
                .copied()
                .ok_or_else(|| AutomationError::not_found(format!("Automation rule {}", id)))?;
            let current = guard
                .rules
                .get(&seq)
                .ok_or_else(|| AutomationError::internal(format!("Rule index out of sync for {}", id)))?;

            let mut updated = (**current).clone();
            change(&mut updated)?;
            updated.validate_definition()?;

            let mut next = (**guard).clone();
            next.rules.insert(seq, Arc::new(updated.clone()));
            *guard = Arc::new(next);
            updated
        };

        Ok(self.with_counters(&updated))
    }

    fn with_counters(&self, rule: &AutomationRule) -> AutomationRule {
        let mut rule = rule.clone();
        if let Some(counters) = self.counters.get(&rule.id) {
            rule.execution_count = counters.execution_count;
            rule.success_count = counters.success_count;
            rule.last_executed_at = counters.last_executed_at;
        }
        rule
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crm_shared::{Action, ConditionGroup, SendMessageConfig};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Map};

    fn request(name: &str, actions: Vec<Action>, status: Option<RuleStatus>) -> CreateAutomationRequest {
        CreateAutomationRequest {
            name: name.to_string(),
            description: None,
            trigger_type: TriggerType::MessageReceived,
            trigger_config: Map::new(),
            condition_group: ConditionGroup::default(),
            actions,
            status,
        }
    }

    fn greet() -> Action {
        Action::SendMessage(SendMessageConfig {
            message: "Hello!".to_string(),
        })
    }

    #[test]
    fn test_create_defaults_to_draft() {
        let store = RuleStore::new();
        let rule = store.create(request("Greeting", vec![], None)).unwrap();
        assert_eq!(rule.status, RuleStatus::Draft);
        assert_eq!(store.get(rule.id).unwrap().name, "Greeting");
    }

    #[test]
    fn test_create_active_without_actions_fails() {
        let store = RuleStore::new();
        let error = store
            .create(request("Greeting", vec![], Some(RuleStatus::Active)))
            .unwrap_err();
        assert_eq!(error.error_code(), "VALIDATION_ERROR");
        assert!(store.list().is_empty());
    }

    #[test]
    fn test_lifecycle_transitions() {
        let store = RuleStore::new();
        let empty = store.create(request("Empty", vec![], None)).unwrap();

        // draft without actions cannot be activated, and cannot be deactivated
        assert_eq!(store.activate(empty.id).unwrap_err().error_code(), "VALIDATION_ERROR");
        assert_eq!(
            store.deactivate(empty.id).unwrap_err().error_code(),
            "INVALID_TRANSITION"
        );

        let rule = store.create(request("Greeting", vec![greet()], None)).unwrap();
        assert_eq!(store.activate(rule.id).unwrap().status, RuleStatus::Active);
        assert_eq!(store.activate(rule.id).unwrap().status, RuleStatus::Active);
        assert_eq!(store.deactivate(rule.id).unwrap().status, RuleStatus::Inactive);
        assert_eq!(store.activate(rule.id).unwrap().status, RuleStatus::Active);
    }

    #[test]
    fn test_update_cannot_empty_active_rule() {
        let store = RuleStore::new();
        let rule = store
            .create(request("Greeting", vec![greet()], Some(RuleStatus::Active)))
            .unwrap();

        let update = UpdateAutomationRequest {
            actions: Some(vec![]),
            ..Default::default()
        };
        assert!(store.update(rule.id, update).is_err());
        assert_eq!(store.get(rule.id).unwrap().actions.len(), 1);
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_writes() {
        let store = RuleStore::new();
        let rule = store
            .create(request("Greeting", vec![greet()], Some(RuleStatus::Active)))
            .unwrap();
        let event = DomainEvent::new("message.received", json!({}));

        let snapshot = store.snapshot();
        store.deactivate(rule.id).unwrap();

        assert_eq!(snapshot.matching(&event).len(), 1);
        assert!(store.snapshot().matching(&event).is_empty());
    }

    #[test]
    fn test_matching_keeps_creation_order() {
        let store = RuleStore::new();
        let ids: Vec<Uuid> = (0..5)
            .map(|i| {
                store
                    .create(request(&format!("Rule {}", i), vec![greet()], Some(RuleStatus::Active)))
                    .unwrap()
                    .id
            })
            .collect();

        let event = DomainEvent::new("message_received", json!({}));
        let matched: Vec<Uuid> = store.snapshot().matching(&event).iter().map(|r| r.id).collect();
        assert_eq!(matched, ids);
    }

    #[test]
    fn test_record_execution_counters() {
        let store = RuleStore::new();
        let rule = store.create(request("Greeting", vec![greet()], None)).unwrap();

        store.record_execution(rule.id, true, Utc::now());
        store.record_execution(rule.id, false, Utc::now());

        let rule = store.get(rule.id).unwrap();
        assert_eq!(rule.execution_count, 2);
        assert_eq!(rule.success_count, 1);
        assert!(rule.last_executed_at.is_some());
    }

    #[test]
    fn test_executions_count_as_soon_as_a_rule_is_visible() {
        let store = Arc::new(RuleStore::new());
        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..200 {
                    store.create(request(&format!("Rule {}", i), vec![], None)).unwrap();
                }
            })
        };

        let mut recorded = 0u64;
        loop {
            let done = writer.is_finished();
            for rule in store.snapshot().rules.values() {
                assert!(store.counters.contains_key(&rule.id));
                store.record_execution(rule.id, true, Utc::now());
                recorded += 1;
            }
            if done {
                break;
            }
        }
        writer.join().unwrap();

        let counted: u64 = store.list().iter().map(|rule| rule.execution_count).sum();
        assert_eq!(counted, recorded);
    }

    #[test]
    fn test_delete() {
        let store = RuleStore::new();
        let rule = store.create(request("Greeting", vec![], None)).unwrap();
        store.delete(rule.id).unwrap();
        assert_eq!(store.get(rule.id).unwrap_err().error_code(), "NOT_FOUND");
        assert_eq!(store.delete(rule.id).unwrap_err().error_code(), "NOT_FOUND");
    }
}
