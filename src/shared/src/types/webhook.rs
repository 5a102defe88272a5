//! Webhook subscriptions, delivery logs and aggregate delivery stats

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use super::automation::HttpMethod;
use validator::Validate;

use super::events::{canonical_event_type, WILDCARD_EVENT};
use super::validation::{event_filters, header_names, http_url, not_blank, ValidationError};

pub const DEFAULT_RETRY_COUNT: u32 = 3;
pub const MAX_RETRY_COUNT: u32 = 10;
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
pub const MIN_TIMEOUT_SECONDS: u64 = 5;
pub const MAX_TIMEOUT_SECONDS: u64 = 120;

// =============================================================================
// Subscriptions
// =============================================================================

/// A registered HTTP callback. The signing secret is held by the registry
/// and never part of this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookSubscription {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub events: Vec<String>,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub retry_count: u32,
    pub timeout_seconds: u64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookSubscription {
    /// Exact type match, or the `*` wildcard
    pub fn accepts_event(&self, event_type: &str) -> bool {
        self.events
            .iter()
            .any(|filter| filter == WILDCARD_EVENT || filter == event_type)
    }
}

/// Returned once, when the subscription is created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookCreated {
    #[serde(flatten)]
    pub webhook: WebhookSubscription,
    pub secret: String,
}

/// Returned once, when the secret is regenerated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookSecret {
    pub webhook_id: Uuid,
    pub secret: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateWebhookRequest {
    #[validate(custom = "not_blank")]
    pub name: String,
    #[validate(custom = "http_url")]
    pub url: String,
    #[validate(
        length(min = 1, message = "at least one event is required"),
        custom = "event_filters"
    )]
    pub events: Vec<String>,
    #[serde(default)]
    #[validate(custom = "not_blank")]
    pub secret: Option<String>,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    #[validate(custom = "header_names")]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    #[validate(range(max = 10, message = "must be between 0 and 10"))]
    pub retry_count: Option<u32>,
    #[serde(default)]
    #[validate(range(min = 5, max = 120, message = "must be between 5 and 120"))]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

impl CreateWebhookRequest {
    /// Validate and build the subscription. The caller-supplied secret, if
    /// any, is handed back separately for the registry to encrypt.
    pub fn into_subscription(self) -> Result<(WebhookSubscription, Option<String>), ValidationError> {
        self.validate()?;

        let now = Utc::now();
        let subscription = WebhookSubscription {
            id: Uuid::new_v4(),
            name: self.name.trim().to_string(),
            url: self.url,
            events: normalize_events(&self.events),
            method: self.method,
            headers: self.headers,
            retry_count: self.retry_count.unwrap_or(DEFAULT_RETRY_COUNT),
            timeout_seconds: self.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECONDS),
            is_active: self.is_active.unwrap_or(true),
            created_at: now,
            updated_at: now,
        };

        Ok((subscription, self.secret))
    }
}

/// Partial update; the secret can only change through regeneration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateWebhookRequest {
    #[serde(default)]
    #[validate(custom = "not_blank")]
    pub name: Option<String>,
    #[serde(default)]
    #[validate(custom = "http_url")]
    pub url: Option<String>,
    #[serde(default)]
    #[validate(
        length(min = 1, message = "at least one event is required"),
        custom = "event_filters"
    )]
    pub events: Option<Vec<String>>,
    #[serde(default)]
    pub method: Option<HttpMethod>,
    #[serde(default)]
    #[validate(custom = "header_names")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    #[validate(range(max = 10, message = "must be between 0 and 10"))]
    pub retry_count: Option<u32>,
    #[serde(default)]
    #[validate(range(min = 5, max = 120, message = "must be between 5 and 120"))]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

impl UpdateWebhookRequest {
    /// Validate every present field first, then apply them all
    pub fn apply_to(self, webhook: &mut WebhookSubscription) -> Result<(), ValidationError> {
        self.validate()?;

        if let Some(name) = self.name {
            webhook.name = name.trim().to_string();
        }
        if let Some(url) = self.url {
            webhook.url = url;
        }
        if let Some(events) = self.events {
            webhook.events = normalize_events(&events);
        }
        if let Some(method) = self.method {
            webhook.method = method;
        }
        if let Some(headers) = self.headers {
            webhook.headers = headers;
        }
        if let Some(retry_count) = self.retry_count {
            webhook.retry_count = retry_count;
        }
        if let Some(timeout_seconds) = self.timeout_seconds {
            webhook.timeout_seconds = timeout_seconds;
        }
        if let Some(is_active) = self.is_active {
            webhook.is_active = is_active;
        }
        webhook.updated_at = Utc::now();

        Ok(())
    }
}

/// Map every validated filter to its catalog spelling, dropping duplicates
fn normalize_events(events: &[String]) -> Vec<String> {
    let mut normalized: Vec<String> = Vec::with_capacity(events.len());
    for event in events {
        let event = event.trim();
        let canonical = canonical_event_type(event).unwrap_or(event);
        if !normalized.iter().any(|existing| existing == canonical) {
            normalized.push(canonical.to_string());
        }
    }
    normalized
}

// =============================================================================
// Delivery logs and stats
// =============================================================================

/// One row per delivery attempt sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookDeliveryLog {
    pub id: Uuid,
    pub webhook_id: Uuid,
    pub event_type: String,
    /// The transmitted envelope
    pub payload: Value,
    pub attempt_count: u32,
    pub is_success: bool,
    pub response_status: Option<u16>,
    pub response_time_ms: u64,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookStats {
    pub webhook_id: Uuid,
    pub total_deliveries: u64,
    pub successful_deliveries: u64,
    pub failed_deliveries: u64,
    pub avg_response_time_ms: f64,
    pub last_delivery_at: Option<DateTime<Utc>>,
}

impl WebhookStats {
    pub fn new(webhook_id: Uuid) -> Self {
        Self {
            webhook_id,
            total_deliveries: 0,
            successful_deliveries: 0,
            failed_deliveries: 0,
            avg_response_time_ms: 0.0,
            last_delivery_at: None,
        }
    }

    /// Fold one log row into the aggregate
    pub fn record(&mut self, log: &WebhookDeliveryLog) {
        self.total_deliveries += 1;
        if log.is_success {
            self.successful_deliveries += 1;
        } else {
            self.failed_deliveries += 1;
        }

        let n = self.total_deliveries as f64;
        self.avg_response_time_ms += (log.response_time_ms as f64 - self.avg_response_time_ms) / n;

        self.last_delivery_at = match self.last_delivery_at {
            Some(last) if last > log.created_at => Some(last),
            _ => Some(log.created_at),
        };
    }

    /// Recompute the aggregate from scratch
    pub fn from_logs<'a, I>(webhook_id: Uuid, logs: I) -> Self
    where
        I: IntoIterator<Item = &'a WebhookDeliveryLog>,
    {
        let mut stats = Self::new(webhook_id);
        for log in logs {
            stats.record(log);
        }
        stats
    }
}
