//! # Automation Engine
//!
//! Matches domain events against the active rules of a store snapshot,
//! evaluates their conditions and runs their actions. Matching rules run
//! concurrently up to `max_concurrent_rules`; their executions are recorded
//! in rule creation order. A panic inside one rule is caught and recorded as
//! a failed execution of that rule only.

pub mod collaborators;
pub mod conditions;
pub mod executions;
pub mod executor;
pub mod scheduler;
pub mod store;

pub use collaborators::{
    CollaboratorCommand, CollaboratorRequest, CollaboratorService, Collaborators, RestCollaborator,
};
pub use executions::{ExecutionStore, MemoryExecutionStore};
pub use executor::{ActionContext, ActionExecutor};
pub use scheduler::ScheduledTriggerSource;
pub use store::{RuleStore, RuleTable};

use crate::error::AutomationError;
use crate::metrics::AutomationMetrics;
use chrono::Utc;
use crm_shared::{AutomationExecution, AutomationRule, DomainEvent, ExecutionOutcome};
use futures::{stream, FutureExt, StreamExt};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

pub struct AutomationEngine {
    store: Arc<RuleStore>,
    executions: Arc<dyn ExecutionStore>,
    executor: Arc<ActionExecutor>,
    metrics: AutomationMetrics,
    max_concurrent_rules: usize,
}

impl AutomationEngine {
    pub fn new(
        store: Arc<RuleStore>,
        executions: Arc<dyn ExecutionStore>,
        executor: Arc<ActionExecutor>,
        metrics: AutomationMetrics,
        max_concurrent_rules: usize,
    ) -> Self {
        Self {
            store,
            executions,
            executor,
            metrics,
            max_concurrent_rules: max_concurrent_rules.max(1),
        }
    }

    pub fn store(&self) -> &Arc<RuleStore> {
        &self.store
    }

    /// Run every matching active rule against `event` and record one
    /// execution per rule whose conditions hold
    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type))]
    pub async fn handle_event(&self, event: &DomainEvent) -> Vec<AutomationExecution> {
        let snapshot = self.store.snapshot();
        let rules = snapshot.matching(event);
        if rules.is_empty() {
            debug!("No active rule matches event");
            return Vec::new();
        }

        debug!(matched = rules.len(), "Evaluating matching rules");

        // `buffered` yields in input order, so executions keep creation order
        let outcomes: Vec<Option<AutomationExecution>> = stream::iter(
            rules
                .into_iter()
                .map(|rule| async move { self.run_isolated(&rule, event).await }),
        )
        .buffered(self.max_concurrent_rules)
        .collect()
        .await;

        let mut recorded = Vec::new();
        for execution in outcomes.into_iter().flatten() {
            let success = execution.is_success();
            self.store
                .record_execution(execution.rule_id, success, execution.executed_at);
            self.metrics
                .record_rule_execution(success, Duration::from_millis(execution.duration_ms));
            for result in &execution.action_results {
                self.metrics
                    .record_action_result(result.action_type.as_str(), result.is_success());
            }
            self.executions.append(execution.clone()).await;
            recorded.push(execution);
        }

        info!(executions = recorded.len(), "Event processed by automation engine");
        recorded
    }

    /// Evaluate one rule against one event without recording anything.
    /// `None` when the conditions do not hold.
    pub async fn run_rule(&self, rule: &AutomationRule, event: &DomainEvent) -> Option<AutomationExecution> {
        let started = Instant::now();
        let executed_at = Utc::now();

        if let Err(e) = rule.condition_group.validate_conditions() {
            return Some(failed_execution(
                rule,
                event,
                AutomationError::from(e).to_string(),
                executed_at,
                started,
            ));
        }

        if !conditions::evaluate(event, &rule.condition_group) {
            debug!(rule_id = %rule.id, "Conditions not met");
            return None;
        }

        let action_results = self.executor.execute_all(rule, event).await;
        let outcome = if action_results.iter().all(|result| result.is_success()) {
            ExecutionOutcome::Success
        } else {
            ExecutionOutcome::Failure
        };

        Some(AutomationExecution {
            id: Uuid::new_v4(),
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            triggering_event: event.clone(),
            action_results,
            outcome,
            error: None,
            executed_at,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn run_isolated(&self, rule: &AutomationRule, event: &DomainEvent) -> Option<AutomationExecution> {
        let started = Instant::now();
        let executed_at = Utc::now();

        match AssertUnwindSafe(self.run_rule(rule, event)).catch_unwind().await {
            Ok(execution) => execution,
            Err(panic) => {
                let fault = AutomationError::engine_fault(rule.id.to_string(), panic_message(panic.as_ref()));
                error!(rule_id = %rule.id, error = %fault, "Rule evaluation panicked");
                Some(failed_execution(rule, event, fault.to_string(), executed_at, started))
            }
        }
    }
}

fn failed_execution(
    rule: &AutomationRule,
    event: &DomainEvent,
    error: String,
    executed_at: chrono::DateTime<Utc>,
    started: Instant,
) -> AutomationExecution {
    AutomationExecution {
        id: Uuid::new_v4(),
        rule_id: rule.id,
        rule_name: rule.name.clone(),
        triggering_event: event.clone(),
        action_results: Vec::new(),
        outcome: ExecutionOutcome::Failure,
        error: Some(error),
        executed_at,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
