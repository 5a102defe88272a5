//! Automation rule definitions and execution records
//!
//! A rule is a trigger, a condition group and an ordered list of actions.
//! The JSON shapes here are the console's contract: camelCase fields,
//! snake_case enum values, and actions as `{ "type": ..., "config": {...} }`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

use super::events::{DomainEvent, SCHEDULED_EVENT};
use super::validation::{header_names, http_url, not_blank, ValidationError};

// ============================================================================
// TRIGGERS
// ============================================================================

/// Frozen set of trigger sources a rule can listen to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    MessageReceived,
    ConversationCreated,
    ConversationAssigned,
    TagAdded,
    ContactCreated,
    ContactUpdated,
    Scheduled,
}

impl TriggerType {
    pub const ALL: [TriggerType; 7] = [
        TriggerType::MessageReceived,
        TriggerType::ConversationCreated,
        TriggerType::ConversationAssigned,
        TriggerType::TagAdded,
        TriggerType::ContactCreated,
        TriggerType::ContactUpdated,
        TriggerType::Scheduled,
    ];

    /// Catalog event type this trigger listens to
    pub fn event_type(&self) -> &'static str {
        match self {
            TriggerType::MessageReceived => "message.received",
            TriggerType::ConversationCreated => "conversation.created",
            TriggerType::ConversationAssigned => "conversation.assigned",
            TriggerType::TagAdded => "tag.added",
            TriggerType::ContactCreated => "contact.created",
            TriggerType::ContactUpdated => "contact.updated",
            TriggerType::Scheduled => SCHEDULED_EVENT,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::MessageReceived => "message_received",
            TriggerType::ConversationCreated => "conversation_created",
            TriggerType::ConversationAssigned => "conversation_assigned",
            TriggerType::TagAdded => "tag_added",
            TriggerType::ContactCreated => "contact_created",
            TriggerType::ContactUpdated => "contact_updated",
            TriggerType::Scheduled => "scheduled",
        }
    }

    /// Accepts both the dotted catalog name and the trigger name
    pub fn matches_event_type(&self, event_type: &str) -> bool {
        event_type == self.event_type() || event_type == self.as_str()
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TriggerType::ALL
            .into_iter()
            .find(|trigger| trigger.matches_event_type(s))
            .ok_or_else(|| format!("Invalid trigger type: {}", s))
    }
}

// ============================================================================
// RULE STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    Draft,
    Active,
    Inactive,
}

impl Default for RuleStatus {
    fn default() -> Self {
        RuleStatus::Draft
    }
}

impl RuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleStatus::Draft => "draft",
            RuleStatus::Active => "active",
            RuleStatus::Inactive => "inactive",
        }
    }

    /// Lifecycle: draft -> active <-> inactive. Repeating the current
    /// active/inactive state is a no-op and allowed.
    pub fn can_become(&self, next: RuleStatus) -> bool {
        matches!(
            (self, next),
            (RuleStatus::Draft, RuleStatus::Active)
                | (RuleStatus::Active, RuleStatus::Active)
                | (RuleStatus::Active, RuleStatus::Inactive)
                | (RuleStatus::Inactive, RuleStatus::Active)
                | (RuleStatus::Inactive, RuleStatus::Inactive)
        )
    }
}

impl fmt::Display for RuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// CONDITIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionLogic {
    #[serde(rename = "AND", alias = "and")]
    And,
    #[serde(rename = "OR", alias = "or")]
    Or,
}

impl Default for ConditionLogic {
    fn default() -> Self {
        ConditionLogic::And
    }
}

/// Frozen operator set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    GreaterThan,
    LessThan,
    IsEmpty,
    IsNotEmpty,
}

impl ConditionOperator {
    /// Unary operators ignore the condition value
    pub fn requires_value(&self) -> bool {
        !matches!(self, ConditionOperator::IsEmpty | ConditionOperator::IsNotEmpty)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[validate(custom = "not_blank")]
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl Condition {
    pub fn new<F: Into<String>>(field: F, operator: ConditionOperator, value: Option<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }

    /// Operators other than the emptiness checks compare against `value`
    fn check_value(&self) -> Result<(), ValidationError> {
        if self.operator.requires_value() && self.value.is_none() {
            return Err(ValidationError::required("value"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ConditionGroup {
    #[serde(default)]
    pub logic: ConditionLogic,
    #[serde(default)]
    #[validate]
    pub conditions: Vec<Condition>,
}

impl Default for ConditionGroup {
    fn default() -> Self {
        Self {
            logic: ConditionLogic::And,
            conditions: Vec::new(),
        }
    }
}

impl ConditionGroup {
    /// Field rules plus the operator/value pairing, with paths under
    /// `conditionGroup`
    pub fn validate_conditions(&self) -> Result<(), ValidationError> {
        self.validate()
            .map_err(|e| ValidationError::from(e).within("conditionGroup"))?;
        for (index, condition) in self.conditions.iter().enumerate() {
            condition
                .check_value()
                .map_err(|e| e.within(format!("conditionGroup.conditions[{}]", index)))?;
        }
        Ok(())
    }
}

// ============================================================================
// ACTIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    SendMessage,
    AssignConversation,
    AddTag,
    RemoveTag,
    UpdateContact,
    TriggerFlow,
    SendEmail,
    Webhook,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::SendMessage => "send_message",
            ActionType::AssignConversation => "assign_conversation",
            ActionType::AddTag => "add_tag",
            ActionType::RemoveTag => "remove_tag",
            ActionType::UpdateContact => "update_contact",
            ActionType::TriggerFlow => "trigger_flow",
            ActionType::SendEmail => "send_email",
            ActionType::Webhook => "webhook",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagTarget {
    Conversation,
    Contact,
}

impl TagTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagTarget::Conversation => "conversation",
            TagTarget::Contact => "contact",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HttpMethod {
    #[serde(rename = "GET", alias = "get")]
    Get,
    #[serde(rename = "POST", alias = "post")]
    Post,
    #[serde(rename = "PUT", alias = "put")]
    Put,
    #[serde(rename = "PATCH", alias = "patch")]
    Patch,
}

impl Default for HttpMethod {
    fn default() -> Self {
        HttpMethod::Post
    }
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Config fields all default so that a stored definition with a missing field
// still loads; `Action::validate_config` reports it instead.

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", default)]
pub struct SendMessageConfig {
    #[validate(custom = "not_blank")]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", default)]
pub struct AssignConversationConfig {
    #[validate(custom = "not_blank")]
    pub agent_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", default)]
pub struct TagConfig {
    #[validate(custom = "not_blank")]
    pub tag_name: String,
    #[validate(required)]
    pub target: Option<TagTarget>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateContactConfig {
    #[validate(custom = "not_blank")]
    pub field_name: String,
    #[validate(required)]
    pub field_value: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", default)]
pub struct TriggerFlowConfig {
    #[validate(custom = "not_blank")]
    pub flow_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", default)]
pub struct SendEmailConfig {
    #[validate(email(message = "must be an email address"))]
    pub to: String,
    #[validate(custom = "not_blank")]
    pub subject: String,
    #[validate(custom = "not_blank")]
    pub body: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", default)]
pub struct WebhookActionConfig {
    #[validate(custom = "http_url")]
    pub url: String,
    pub method: HttpMethod,
    #[validate(custom = "header_names")]
    pub headers: HashMap<String, String>,
}

/// One step of a rule, serialized as `{ "type": "add_tag", "config": {...} }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "snake_case")]
pub enum Action {
    SendMessage(SendMessageConfig),
    AssignConversation(AssignConversationConfig),
    AddTag(TagConfig),
    RemoveTag(TagConfig),
    UpdateContact(UpdateContactConfig),
    TriggerFlow(TriggerFlowConfig),
    SendEmail(SendEmailConfig),
    Webhook(WebhookActionConfig),
}

impl Action {
    pub fn action_type(&self) -> ActionType {
        match self {
            Action::SendMessage(_) => ActionType::SendMessage,
            Action::AssignConversation(_) => ActionType::AssignConversation,
            Action::AddTag(_) => ActionType::AddTag,
            Action::RemoveTag(_) => ActionType::RemoveTag,
            Action::UpdateContact(_) => ActionType::UpdateContact,
            Action::TriggerFlow(_) => ActionType::TriggerFlow,
            Action::SendEmail(_) => ActionType::SendEmail,
            Action::Webhook(_) => ActionType::Webhook,
        }
    }

    /// Check the variant's required fields. Field paths are relative to
    /// the action, e.g. `config.tagName`.
    pub fn validate_config(&self) -> Result<(), ValidationError> {
        let result = match self {
            Action::SendMessage(config) => config.validate(),
            Action::AssignConversation(config) => config.validate(),
            Action::AddTag(config) | Action::RemoveTag(config) => config.validate(),
            Action::UpdateContact(config) => config.validate(),
            Action::TriggerFlow(config) => config.validate(),
            Action::SendEmail(config) => config.validate(),
            Action::Webhook(config) => config.validate(),
        };

        result.map_err(|e| ValidationError::from(e).within("config"))
    }
}

// ============================================================================
// RULES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationRule {
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub trigger_config: Map<String, Value>,
    #[serde(default)]
    pub condition_group: ConditionGroup,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub status: RuleStatus,
    #[serde(default)]
    pub execution_count: u64,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub last_executed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AutomationRule {
    /// Full definition check run on every save and before every execution
    pub fn validate_definition(&self) -> Result<(), ValidationError> {
        not_blank(&self.name).map_err(|_| ValidationError::required("name"))?;

        if self.trigger_type == TriggerType::Scheduled && self.interval_minutes().is_none() {
            return Err(ValidationError::new(
                "triggerConfig.intervalMinutes",
                "must be a positive integer for scheduled rules",
            ));
        }

        self.condition_group.validate_conditions()?;

        for (index, action) in self.actions.iter().enumerate() {
            action
                .validate_config()
                .map_err(|e| e.within(format!("actions[{}]", index)))?;
        }

        if self.status == RuleStatus::Active && self.actions.is_empty() {
            return Err(ValidationError::new(
                "actions",
                "an active rule needs at least one action",
            ));
        }

        Ok(())
    }

    /// Interval for scheduled rules, read from `triggerConfig.intervalMinutes`
    pub fn interval_minutes(&self) -> Option<u64> {
        self.trigger_config
            .get("intervalMinutes")
            .and_then(Value::as_u64)
            .filter(|minutes| *minutes > 0)
    }

    pub fn is_active(&self) -> bool {
        self.status == RuleStatus::Active
    }

    /// Trigger match only; status is checked separately by the caller.
    /// Scheduled events may address a single rule through `payload.ruleId`.
    pub fn matches_event(&self, event: &DomainEvent) -> bool {
        if !self.trigger_type.matches_event_type(&event.event_type) {
            return false;
        }

        if self.trigger_type == TriggerType::Scheduled {
            return match event.payload.get("ruleId").and_then(Value::as_str) {
                Some(rule_id) => rule_id == self.id.to_string(),
                None => true,
            };
        }

        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateAutomationRequest {
    #[validate(custom = "not_blank")]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub trigger_config: Map<String, Value>,
    #[serde(default)]
    #[validate]
    pub condition_group: ConditionGroup,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub status: Option<RuleStatus>,
}

impl CreateAutomationRequest {
    /// Check the request's field rules and build an unsaved rule. The store
    /// runs the full definition check before insertion.
    pub fn into_rule(self) -> Result<AutomationRule, ValidationError> {
        self.validate()?;
        let now = Utc::now();
        Ok(AutomationRule {
            id: Uuid::new_v4(),
            name: self.name.trim().to_string(),
            description: self.description,
            trigger_type: self.trigger_type,
            trigger_config: self.trigger_config,
            condition_group: self.condition_group,
            actions: self.actions,
            status: self.status.unwrap_or_default(),
            execution_count: 0,
            success_count: 0,
            last_executed_at: None,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Partial update of a rule definition. Status changes go through
/// activate/deactivate instead.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAutomationRequest {
    #[serde(default)]
    #[validate(custom = "not_blank")]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub trigger_type: Option<TriggerType>,
    #[serde(default)]
    pub trigger_config: Option<Map<String, Value>>,
    #[serde(default)]
    #[validate]
    pub condition_group: Option<ConditionGroup>,
    #[serde(default)]
    pub actions: Option<Vec<Action>>,
}

impl UpdateAutomationRequest {
    pub fn apply_to(self, rule: &mut AutomationRule) -> Result<(), ValidationError> {
        self.validate()?;
        if let Some(name) = self.name {
            rule.name = name.trim().to_string();
        }
        if let Some(description) = self.description {
            rule.description = Some(description);
        }
        if let Some(trigger_type) = self.trigger_type {
            rule.trigger_type = trigger_type;
        }
        if let Some(trigger_config) = self.trigger_config {
            rule.trigger_config = trigger_config;
        }
        if let Some(condition_group) = self.condition_group {
            rule.condition_group = condition_group;
        }
        if let Some(actions) = self.actions {
            rule.actions = actions;
        }
        rule.updated_at = Utc::now();
        Ok(())
    }
}

// ============================================================================
// EXECUTIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionErrorKind {
    /// Missing or malformed action config; never retried
    Configuration,
    /// A dependent service refused or failed the command
    Collaborator,
    /// The webhook action's HTTP call failed
    Delivery,
    EngineFault,
}

impl ActionErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionErrorKind::Configuration => "configuration",
            ActionErrorKind::Collaborator => "collaborator",
            ActionErrorKind::Delivery => "delivery",
            ActionErrorKind::EngineFault => "engine_fault",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionError {
    pub kind: ActionErrorKind,
    pub message: String,
}

impl ActionError {
    pub fn new<M: Into<String>>(kind: ActionErrorKind, message: M) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    pub index: usize,
    pub action_type: ActionType,
    pub outcome: ActionOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ActionError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
    pub duration_ms: u64,
}

impl ActionResult {
    pub fn success(index: usize, action_type: ActionType, detail: Option<Value>, duration_ms: u64) -> Self {
        Self {
            index,
            action_type,
            outcome: ActionOutcome::Success,
            error: None,
            detail,
            duration_ms,
        }
    }

    pub fn failure(index: usize, action_type: ActionType, error: ActionError, duration_ms: u64) -> Self {
        Self {
            index,
            action_type,
            outcome: ActionOutcome::Failure,
            error: Some(error),
            detail: None,
            duration_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == ActionOutcome::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success,
    Failure,
}

impl ExecutionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionOutcome::Success => "success",
            ExecutionOutcome::Failure => "failure",
        }
    }
}

/// Immutable record of one rule match
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationExecution {
    pub id: Uuid,
    pub rule_id: Uuid,
    pub rule_name: String,
    pub triggering_event: DomainEvent,
    pub action_results: Vec<ActionResult>,
    pub outcome: ExecutionOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub executed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl AutomationExecution {
    pub fn is_success(&self) -> bool {
        self.outcome == ExecutionOutcome::Success
    }
}
