//! Shared fixtures for the automation service integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use automation_service::config::AutomationConfig;
use automation_service::engine::{CollaboratorRequest, CollaboratorService, Collaborators};
use automation_service::{AutomationResult, AutomationError};
use crm_shared::{
    Action, AutomationExecution, ConditionGroup, CreateAutomationRequest, RuleStatus, TagConfig,
    TagTarget, TriggerType,
};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Collaborator that records every request and can be told to fail or
/// panic on a given command
#[derive(Default)]
pub struct RecordingCollaborator {
    calls: Mutex<Vec<CollaboratorRequest>>,
    fail_on: Option<&'static str>,
    panic_on: Option<&'static str>,
}

impl RecordingCollaborator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_on(command: &'static str) -> Arc<Self> {
        Arc::new(Self {
            fail_on: Some(command),
            ..Self::default()
        })
    }

    pub fn panicking_on(command: &'static str) -> Arc<Self> {
        Arc::new(Self {
            panic_on: Some(command),
            ..Self::default()
        })
    }

    pub fn calls(&self) -> Vec<CollaboratorRequest> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl CollaboratorService for RecordingCollaborator {
    async fn execute(&self, request: &CollaboratorRequest) -> AutomationResult<Value> {
        let command = request.command.name();
        self.calls.lock().push(request.clone());

        if self.panic_on == Some(command) {
            panic!("collaborator crashed on {}", command);
        }
        if self.fail_on == Some(command) {
            return Err(AutomationError::collaborator("test", format!("{} rejected", command)));
        }
        Ok(json!({ "ok": true, "command": command }))
    }
}

pub fn collaborators(service: Arc<RecordingCollaborator>) -> Collaborators {
    Collaborators::uniform(service)
}

/// Defaults with fast retries and no background scheduler
pub fn test_config() -> AutomationConfig {
    let mut config = AutomationConfig::default();
    config.engine.scheduler_enabled = false;
    config.engine.action_timeout_seconds = 2;
    config.delivery.worker_count = 2;
    config.delivery.initial_backoff_ms = 10;
    config.delivery.max_backoff_ms = 50;
    config.security.secret_encryption_key = Some("integration-test-key".to_string());
    config.observability.metrics_namespace = "automation_test".to_string();
    config
}

pub fn add_vip_tag() -> Action {
    Action::AddTag(TagConfig {
        tag_name: "vip".to_string(),
        target: Some(TagTarget::Contact),
    })
}

pub fn rule_request(
    name: &str,
    trigger_type: TriggerType,
    actions: Vec<Action>,
    status: Option<RuleStatus>,
) -> CreateAutomationRequest {
    CreateAutomationRequest {
        name: name.to_string(),
        description: None,
        trigger_type,
        trigger_config: Map::new(),
        condition_group: ConditionGroup::default(),
        actions,
        status,
    }
}

/// Poll `check` until it yields a value or two seconds pass
pub async fn eventually<T, F, Fut>(mut check: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for _ in 0..100 {
        if let Some(value) = check().await {
            return Some(value);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    None
}

/// Per-action (type, outcome, error) triples, without timings
pub fn outcome_signature(execution: &AutomationExecution) -> Vec<(String, bool, Option<String>)> {
    execution
        .action_results
        .iter()
        .map(|result| {
            (
                result.action_type.to_string(),
                result.is_success(),
                result.error.as_ref().map(|e| e.message.clone()),
            )
        })
        .collect()
}
