//! # CRM Automation Service
//!
//! Server side of the messaging CRM's automation console: a trigger,
//! condition and action rule engine, plus a webhook subsystem delivering
//! signed, retried HTTP callbacks to third parties.
//!
//! ## Architecture
//!
//! - **Event Hub**: accepts domain events and queues them, independently,
//!   for the engine and for the webhook dispatcher
//! - **Automation Engine**: matches active rules against each event,
//!   evaluates their conditions and runs their actions in order
//! - **Webhook Dispatcher**: fans events out to matching subscriptions on a
//!   fixed pool of delivery workers
//! - **Scheduled Trigger Source**: emits `automation.scheduled` events for
//!   rules with an elapsed interval
//!
//! ## Usage
//!
//! ```rust,no_run
//! use automation_service::{AutomationConfig, AutomationService};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AutomationConfig::from_env()?;
//!     let service = AutomationService::new(config).await?;
//!     service.start().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod handlers;
pub mod metrics;
pub mod security;
pub mod service;
pub mod webhook;

// Re-export main types for easier usage
pub use config::{AutomationConfig, ConfigOverrides};
pub use engine::{AutomationEngine, CollaboratorRequest, CollaboratorService, Collaborators, RuleStore};
pub use error::{AutomationError, AutomationResult};
pub use events::EventHub;
pub use metrics::AutomationMetrics;
pub use service::{AppState, AutomationService};
pub use webhook::{WebhookDeliveryClient, WebhookDispatcher, WebhookRegistry};

use std::collections::BTreeMap;

/// Version information for the automation service
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const SERVICE_NAME: &str = "automation-service";

/// Health check information
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub service: String,
    pub version: String,
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub uptime_seconds: i64,
    pub components: BTreeMap<String, bool>,
    pub counts: BTreeMap<String, usize>,
}

impl HealthStatus {
    pub fn healthy() -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
            version: VERSION.to_string(),
            status: "healthy".to_string(),
            timestamp: chrono::Utc::now(),
            uptime_seconds: 0,
            components: BTreeMap::new(),
            counts: BTreeMap::new(),
        }
    }

    /// A failing component degrades the overall status
    pub fn with_component(mut self, name: &str, healthy: bool) -> Self {
        self.components.insert(name.to_string(), healthy);
        if !healthy {
            self.status = "degraded".to_string();
        }
        self
    }

    pub fn with_count(mut self, name: &str, count: usize) -> Self {
        self.counts.insert(name.to_string(), count);
        self
    }

    pub fn with_uptime(mut self, started_at: chrono::DateTime<chrono::Utc>) -> Self {
        self.uptime_seconds = (self.timestamp - started_at).num_seconds().max(0);
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}
