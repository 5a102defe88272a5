//! Shared type definitions for the automation platform
//!
//! This module groups the domain types used by the automation engine, the
//! webhook subsystem and the HTTP API.

pub mod automation;
pub mod events;
pub mod validation;
pub mod webhook;

pub use automation::{
    Action,
    ActionError,
    ActionErrorKind,
    ActionOutcome,
    ActionResult,
    ActionType,
    AssignConversationConfig,
    // Rules
    AutomationExecution,
    AutomationRule,
    Condition,
    ConditionGroup,
    ConditionLogic,
    ConditionOperator,
    CreateAutomationRequest,
    ExecutionOutcome,
    HttpMethod,
    RuleStatus,
    SendEmailConfig,
    SendMessageConfig,
    TagConfig,
    TagTarget,
    TriggerFlowConfig,
    TriggerType,
    UpdateAutomationRequest,
    UpdateContactConfig,
    WebhookActionConfig,
};

pub use events::{
    available_events, canonical_event_type, is_known_event, DomainEvent, EventDescriptor,
    WebhookEnvelope, SCHEDULED_EVENT, TEST_EVENT, WILDCARD_EVENT,
};

pub use validation::ValidationError;

pub use webhook::{
    CreateWebhookRequest, UpdateWebhookRequest, WebhookCreated, WebhookDeliveryLog,
    WebhookSecret, WebhookStats, WebhookSubscription, DEFAULT_RETRY_COUNT,
    DEFAULT_TIMEOUT_SECONDS, MAX_RETRY_COUNT, MAX_TIMEOUT_SECONDS, MIN_TIMEOUT_SECONDS,
};
