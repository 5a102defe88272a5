//! Action execution
//!
//! Actions of one rule run strictly in order. A failed action is recorded
//! and the next one still runs.

use super::collaborators::{CollaboratorCommand, CollaboratorRequest, Collaborators};
use crate::webhook::delivery::{DeliveryTarget, WebhookDeliveryClient};
use crm_shared::{
    Action, ActionError, ActionErrorKind, ActionResult, AutomationRule, DomainEvent,
    WebhookActionConfig,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// What an action runs against
#[derive(Debug, Clone, Copy)]
pub struct ActionContext<'a> {
    pub rule_id: Uuid,
    pub event: &'a DomainEvent,
}

pub struct ActionExecutor {
    collaborators: Collaborators,
    delivery: Arc<WebhookDeliveryClient>,
    action_timeout: Duration,
}

impl ActionExecutor {
    pub fn new(
        collaborators: Collaborators,
        delivery: Arc<WebhookDeliveryClient>,
        action_timeout: Duration,
    ) -> Self {
        Self {
            collaborators,
            delivery,
            action_timeout,
        }
    }

    /// Run every action of `rule` in order
    pub async fn execute_all(&self, rule: &AutomationRule, event: &DomainEvent) -> Vec<ActionResult> {
        let context = ActionContext {
            rule_id: rule.id,
            event,
        };

        let mut results = Vec::with_capacity(rule.actions.len());
        for (index, action) in rule.actions.iter().enumerate() {
            results.push(self.execute(index, action, context).await);
        }
        results
    }

    /// Validate then dispatch a single action
    pub async fn execute(&self, index: usize, action: &Action, context: ActionContext<'_>) -> ActionResult {
        let started = Instant::now();
        let action_type = action.action_type();

        let outcome = match action.validate_config() {
            Err(e) => Err(ActionError::new(ActionErrorKind::Configuration, e.to_string())),
            Ok(()) => match action {
                Action::Webhook(config) => self.call_webhook(config, context).await,
                other => match collaborator_command(other) {
                    Some(command) => self.dispatch(command, context).await,
                    None => Err(ActionError::new(
                        ActionErrorKind::Configuration,
                        format!("{} has no collaborator command", action_type),
                    )),
                },
            },
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(detail) => {
                debug!(rule_id = %context.rule_id, index, action_type = %action_type, "Action succeeded");
                let detail = (!detail.is_null()).then_some(detail);
                ActionResult::success(index, action_type, detail, duration_ms)
            }
            Err(error) => {
                warn!(
                    rule_id = %context.rule_id,
                    index,
                    action_type = %action_type,
                    kind = error.kind.as_str(),
                    error = %error.message,
                    "Action failed"
                );
                ActionResult::failure(index, action_type, error, duration_ms)
            }
        }
    }

    async fn dispatch(&self, command: CollaboratorCommand, context: ActionContext<'_>) -> Result<Value, ActionError> {
        let service = self.collaborators.for_command(&command).clone();
        let request = CollaboratorRequest::new(context.rule_id, context.event, command);

        match tokio::time::timeout(self.action_timeout, service.execute(&request)).await {
            Ok(Ok(detail)) => Ok(detail),
            Ok(Err(e)) => Err(ActionError::new(ActionErrorKind::Collaborator, e.to_string())),
            Err(_) => Err(ActionError::new(
                ActionErrorKind::Collaborator,
                format!(
                    "{} timed out after {} seconds",
                    request.command.name(),
                    self.action_timeout.as_secs()
                ),
            )),
        }
    }

    /// One unsigned attempt; not registered, counted or logged as a delivery
    async fn call_webhook(&self, config: &WebhookActionConfig, context: ActionContext<'_>) -> Result<Value, ActionError> {
        let target = DeliveryTarget::one_shot(&config.url, config.method, &config.headers, self.action_timeout);

        let outcome = self
            .delivery
            .deliver(&target, context.event)
            .await
            .map_err(|e| ActionError::new(ActionErrorKind::Delivery, e.to_string()))?;

        if outcome.is_success {
            Ok(json!({
                "responseStatus": outcome.response_status,
                "responseTimeMs": outcome.response_time_ms,
            }))
        } else {
            Err(ActionError::new(
                ActionErrorKind::Delivery,
                outcome
                    .error_message
                    .unwrap_or_else(|| "Webhook call failed".to_string()),
            ))
        }
    }
}

/// Map a validated non-webhook action to its collaborator command
fn collaborator_command(action: &Action) -> Option<CollaboratorCommand> {
    let command = match action {
        Action::SendMessage(config) => CollaboratorCommand::SendMessage {
            message: config.message.clone(),
        },
        Action::AssignConversation(config) => CollaboratorCommand::AssignConversation {
            agent_id: config.agent_id.clone(),
        },
        Action::AddTag(config) => CollaboratorCommand::AddTag {
            tag_name: config.tag_name.clone(),
            target: config.target?,
        },
        Action::RemoveTag(config) => CollaboratorCommand::RemoveTag {
            tag_name: config.tag_name.clone(),
            target: config.target?,
        },
        Action::UpdateContact(config) => CollaboratorCommand::UpdateContact {
            field_name: config.field_name.clone(),
            field_value: config.field_value.clone()?,
        },
        Action::TriggerFlow(config) => CollaboratorCommand::TriggerFlow {
            flow_id: config.flow_id.clone(),
        },
        Action::SendEmail(config) => CollaboratorCommand::SendEmail {
            to: config.to.clone(),
            subject: config.subject.clone(),
            body: config.body.clone(),
        },
        Action::Webhook(_) => return None,
    };
    Some(command)
}
