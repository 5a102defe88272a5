//! Domain events and the fixed catalog of event types the platform emits
//!
//! The catalog is what the console uses to populate the webhook event
//! checkboxes. Every emitter in the platform must use a type listed here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use uuid::Uuid;

use super::automation::TriggerType;

/// Subscription filter matching every event type, including future ones
pub const WILDCARD_EVENT: &str = "*";

/// Emitted by the scheduled trigger source
pub const SCHEDULED_EVENT: &str = "automation.scheduled";

/// Emitted by the "send test delivery" operation on a webhook
pub const TEST_EVENT: &str = "webhook.test";

// =============================================================================
// Domain Event
// =============================================================================

/// A single occurrence on the platform, e.g. an inbound WhatsApp message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default = "empty_payload")]
    pub payload: Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

fn empty_payload() -> Value {
    Value::Object(serde_json::Map::new())
}

impl DomainEvent {
    pub fn new<T: Into<String>>(event_type: T, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Look up a string at the first of several payload paths that holds one
    pub fn payload_str(&self, paths: &[&str]) -> Option<String> {
        paths.iter().find_map(|path| {
            let pointer = format!("/{}", path.replace('.', "/"));
            match self.payload.pointer(&pointer)? {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            }
        })
    }
}

/// Body transmitted to webhook subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEnvelope {
    pub event_type: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl From<&DomainEvent> for WebhookEnvelope {
    fn from(event: &DomainEvent) -> Self {
        Self {
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
            timestamp: event.timestamp,
        }
    }
}

// =============================================================================
// Event Catalog
// =============================================================================

/// One entry of the event catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDescriptor {
    pub event_type: &'static str,
    pub category: &'static str,
    pub description: &'static str,
}

const fn descriptor(
    event_type: &'static str,
    category: &'static str,
    description: &'static str,
) -> EventDescriptor {
    EventDescriptor {
        event_type,
        category,
        description,
    }
}

static AVAILABLE_EVENTS: &[EventDescriptor] = &[
    descriptor("message.received", "message", "Inbound message received from a contact"),
    descriptor("message.sent", "message", "Outbound message accepted for sending"),
    descriptor("message.delivered", "message", "Outbound message delivered to the device"),
    descriptor("message.read", "message", "Outbound message read by the contact"),
    descriptor("message.failed", "message", "Outbound message could not be delivered"),
    descriptor("conversation.created", "conversation", "New conversation opened"),
    descriptor("conversation.assigned", "conversation", "Conversation assigned to an agent"),
    descriptor("conversation.resolved", "conversation", "Conversation marked as resolved"),
    descriptor("contact.created", "contact", "New contact created"),
    descriptor("contact.updated", "contact", "Contact fields changed"),
    descriptor("contact.deleted", "contact", "Contact removed"),
    descriptor("tag.added", "tag", "Tag added to a conversation or contact"),
    descriptor("tag.removed", "tag", "Tag removed from a conversation or contact"),
    descriptor("campaign.started", "campaign", "Campaign started sending"),
    descriptor("campaign.completed", "campaign", "Campaign finished sending"),
    descriptor(SCHEDULED_EVENT, "automation", "Scheduled automation trigger fired"),
    descriptor(TEST_EVENT, "webhook", "Test delivery requested from the console"),
];

/// The fixed universe of event types the platform can emit
pub fn available_events() -> &'static [EventDescriptor] {
    AVAILABLE_EVENTS
}

/// Whether a type (or a trigger alias of one) is in the catalog
pub fn is_known_event(event_type: &str) -> bool {
    canonical_event_type(event_type).is_some()
}

/// Map an event type or a snake_case trigger name to its catalog spelling
pub fn canonical_event_type(event_type: &str) -> Option<&'static str> {
    if let Some(descriptor) = AVAILABLE_EVENTS
        .iter()
        .find(|descriptor| descriptor.event_type == event_type)
    {
        return Some(descriptor.event_type);
    }

    TriggerType::from_str(event_type)
        .ok()
        .map(|trigger| trigger.event_type())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_every_trigger_event_is_in_catalog() {
        for trigger in TriggerType::ALL {
            assert!(
                AVAILABLE_EVENTS
                    .iter()
                    .any(|d| d.event_type == trigger.event_type()),
                "{} missing from catalog",
                trigger.event_type()
            );
        }
    }

    #[test]
    fn test_canonical_event_type() {
        assert_eq!(canonical_event_type("message.received"), Some("message.received"));
        assert_eq!(canonical_event_type("tag_added"), Some("tag.added"));
        assert_eq!(canonical_event_type("scheduled"), Some(SCHEDULED_EVENT));
        assert_eq!(canonical_event_type("order.shipped"), None);
        assert!(!is_known_event(WILDCARD_EVENT));
    }

    #[test]
    fn test_domain_event_defaults_on_deserialize() {
        let event: DomainEvent =
            serde_json::from_value(json!({"type": "tag.added"})).unwrap();
        assert_eq!(event.event_type, "tag.added");
        assert!(event.payload.as_object().unwrap().is_empty());
        assert!(!event.id.is_nil());
    }

    #[test]
    fn test_payload_str_lookup_order() {
        let event = DomainEvent::new(
            "message.received",
            json!({"conversation": {"id": "conv-9"}, "contactId": 42}),
        );
        assert_eq!(
            event.payload_str(&["conversationId", "conversation.id"]),
            Some("conv-9".to_string())
        );
        assert_eq!(event.payload_str(&["contactId"]), Some("42".to_string()));
        assert_eq!(event.payload_str(&["missing"]), None);
    }

    #[test]
    fn test_envelope_shape() {
        let event = DomainEvent::new("message.received", json!({"text": "hi"}));
        let body = serde_json::to_value(WebhookEnvelope::from(&event)).unwrap();
        assert_eq!(body["eventType"], "message.received");
        assert_eq!(body["payload"]["text"], "hi");
        assert!(body["timestamp"].is_string());
    }
}
