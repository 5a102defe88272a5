//! Services that carry out non-webhook actions
//!
//! Messaging, contacts, flows and email live outside this service. Every
//! action is sent to one of them as a typed command plus the context pulled
//! from the triggering event.

use crate::config::CollaboratorsConfig;
use crate::error::{AutomationError, AutomationResult};
use async_trait::async_trait;
use crm_shared::{DomainEvent, TagTarget};
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

const CONVERSATION_PATHS: [&str; 3] = ["conversationId", "conversation_id", "conversation.id"];
const CONTACT_PATHS: [&str; 3] = ["contactId", "contact_id", "contact.id"];

/// Error bodies longer than this are cut in error messages
const ERROR_BODY_LIMIT: usize = 256;

/// Command sent to a collaborator, tagged by `command`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum CollaboratorCommand {
    SendMessage {
        message: String,
    },
    AssignConversation {
        agent_id: String,
    },
    AddTag {
        tag_name: String,
        target: TagTarget,
    },
    RemoveTag {
        tag_name: String,
        target: TagTarget,
    },
    UpdateContact {
        field_name: String,
        field_value: Value,
    },
    TriggerFlow {
        flow_id: String,
    },
    SendEmail {
        to: String,
        subject: String,
        body: String,
    },
}

impl CollaboratorCommand {
    pub fn name(&self) -> &'static str {
        match self {
            CollaboratorCommand::SendMessage { .. } => "send_message",
            CollaboratorCommand::AssignConversation { .. } => "assign_conversation",
            CollaboratorCommand::AddTag { .. } => "add_tag",
            CollaboratorCommand::RemoveTag { .. } => "remove_tag",
            CollaboratorCommand::UpdateContact { .. } => "update_contact",
            CollaboratorCommand::TriggerFlow { .. } => "trigger_flow",
            CollaboratorCommand::SendEmail { .. } => "send_email",
        }
    }
}

/// Command plus the event context it applies to
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaboratorRequest {
    pub rule_id: Uuid,
    pub event_type: String,
    pub conversation_id: Option<String>,
    pub contact_id: Option<String>,
    #[serde(flatten)]
    pub command: CollaboratorCommand,
    pub payload: Value,
}

impl CollaboratorRequest {
    pub fn new(rule_id: Uuid, event: &DomainEvent, command: CollaboratorCommand) -> Self {
        Self {
            rule_id,
            event_type: event.event_type.clone(),
            conversation_id: event.payload_str(&CONVERSATION_PATHS),
            contact_id: event.payload_str(&CONTACT_PATHS),
            command,
            payload: event.payload.clone(),
        }
    }
}

/// A dependent service that executes action commands
#[async_trait]
pub trait CollaboratorService: Send + Sync {
    /// Execute the command; the returned value is kept as action detail
    async fn execute(&self, request: &CollaboratorRequest) -> AutomationResult<Value>;
}

/// Routing of commands to the service that owns them
#[derive(Clone)]
pub struct Collaborators {
    pub messaging: Arc<dyn CollaboratorService>,
    pub contacts: Arc<dyn CollaboratorService>,
    pub flows: Arc<dyn CollaboratorService>,
    pub email: Arc<dyn CollaboratorService>,
}

impl Collaborators {
    /// One service for every command
    pub fn uniform(service: Arc<dyn CollaboratorService>) -> Self {
        Self {
            messaging: service.clone(),
            contacts: service.clone(),
            flows: service.clone(),
            email: service,
        }
    }

    pub fn from_config(config: &CollaboratorsConfig, timeout: Duration) -> AutomationResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(format!("CRM-Automation/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AutomationError::internal(format!("Failed to create HTTP client: {}", e)))?;

        let rest = |name: &'static str, base_url: &str| -> Arc<dyn CollaboratorService> {
            Arc::new(RestCollaborator::new(
                name,
                base_url,
                client.clone(),
                config.api_key.clone(),
            ))
        };

        Ok(Self {
            messaging: rest("messaging", &config.messaging_url),
            contacts: rest("contacts", &config.contacts_url),
            flows: rest("flows", &config.flows_url),
            email: rest("email", &config.email_url),
        })
    }

    pub fn for_command(&self, command: &CollaboratorCommand) -> &Arc<dyn CollaboratorService> {
        match command {
            CollaboratorCommand::SendMessage { .. }
            | CollaboratorCommand::AssignConversation { .. } => &self.messaging,
            CollaboratorCommand::AddTag { .. }
            | CollaboratorCommand::RemoveTag { .. }
            | CollaboratorCommand::UpdateContact { .. } => &self.contacts,
            CollaboratorCommand::TriggerFlow { .. } => &self.flows,
            CollaboratorCommand::SendEmail { .. } => &self.email,
        }
    }
}

/// Posts commands as JSON to `{base_url}/actions/{command}`
pub struct RestCollaborator {
    name: &'static str,
    base_url: String,
    client: Client,
    api_key: Option<String>,
}

impl RestCollaborator {
    pub fn new(name: &'static str, base_url: &str, client: Client, api_key: Option<String>) -> Self {
        Self {
            name,
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            api_key,
        }
    }
}

#[async_trait]
impl CollaboratorService for RestCollaborator {
    async fn execute(&self, request: &CollaboratorRequest) -> AutomationResult<Value> {
        let url = format!("{}/actions/{}", self.base_url, request.command.name());
        debug!(collaborator = self.name, url = %url, "Dispatching action command");

        let mut builder = self.client.post(&url).json(request);
        if let Some(ref api_key) = self.api_key {
            builder = builder.bearer_auth(api_key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| AutomationError::collaborator(self.name, format!("Request failed: {}", e)))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if status.is_success() {
            if body.trim().is_empty() {
                return Ok(Value::Null);
            }
            return Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)));
        }

        warn!(
            collaborator = self.name,
            status = status.as_u16(),
            "Collaborator rejected action command"
        );
        let mut snippet = body;
        if snippet.len() > ERROR_BODY_LIMIT {
            let mut cut = ERROR_BODY_LIMIT;
            while !snippet.is_char_boundary(cut) {
                cut -= 1;
            }
            snippet.truncate(cut);
        }
        Err(AutomationError::collaborator(
            self.name,
            format!("HTTP {} - {}", status.as_u16(), snippet),
        ))
    }
}
