//! Configuration for the automation service
//!
//! Every section has defaults, so an empty environment yields a runnable
//! local service. Values are overridden from `AUTOMATION__<SECTION>__<KEY>`
//! environment variables and from an optional file named by
//! `AUTOMATION_CONFIG_FILE`.

use serde::{Deserialize, Serialize};
use url::Url;

/// Main configuration structure for the automation service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Rule engine and event hub configuration
    pub engine: EngineConfig,
    /// Webhook delivery pool configuration
    pub delivery: DeliveryConfig,
    /// Secret storage configuration
    pub security: SecurityConfig,
    /// Base URLs of the services actions are dispatched to
    pub collaborators: CollaboratorsConfig,
    /// Metrics, health and logging
    pub observability: ObservabilityConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server host (default: 0.0.0.0)
    pub host: String,
    /// Server port (default: 8010)
    pub port: u16,
    /// Request timeout in seconds (default: 30)
    pub request_timeout: u64,
    /// Maximum request body size in bytes (default: 1MB)
    pub max_body_size: usize,
    /// Enable CORS (default: true)
    pub cors_enabled: bool,
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Matching rules executed at once for a single event
    pub max_concurrent_rules: usize,
    /// Events processed at once by each event hub consumer
    pub max_concurrent_events: usize,
    /// Capacity of each event hub queue
    pub event_queue_capacity: usize,
    /// Executions kept in memory before the oldest are dropped
    pub execution_retention: usize,
    /// Run the scheduled trigger source
    pub scheduler_enabled: bool,
    /// Scheduled trigger source tick interval
    pub scheduler_tick_seconds: u64,
    /// Deadline for a single action, including the webhook action's HTTP call
    pub action_timeout_seconds: u64,
}

/// Settings given on the command line. They take precedence over the
/// environment and the configuration file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Configuration file, instead of `AUTOMATION_CONFIG_FILE`
    pub file: Option<String>,
    /// Listening port
    pub port: Option<u16>,
}

/// Webhook delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Fixed number of delivery workers
    pub worker_count: usize,
    /// Capacity of the shared delivery job queue
    pub queue_capacity: usize,
    /// Attempts in flight for a single subscription. Defaults to one less
    /// than the worker count, so one slow endpoint never takes every worker.
    pub per_webhook_concurrency: Option<usize>,
    /// Delay before the first retry in milliseconds
    pub initial_backoff_ms: u64,
    /// Growth factor between retries (>= 1.0)
    pub backoff_multiplier: f64,
    /// Upper bound on any single retry delay in milliseconds
    pub max_backoff_ms: u64,
    /// Response bodies longer than this are truncated in delivery logs
    pub response_body_limit: usize,
    /// Delivery logs kept per webhook before the oldest are dropped
    pub log_retention: usize,
    /// User-Agent sent with every webhook request
    pub user_agent: String,
}

/// Security configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Passphrase the secret encryption key is derived from. When unset a
    /// random key is generated and secrets do not survive a restart.
    pub secret_encryption_key: Option<String>,
    /// Prefix of generated webhook secrets
    pub secret_prefix: String,
}

/// Collaborator service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaboratorsConfig {
    /// send_message, assign_conversation
    pub messaging_url: String,
    /// add_tag, remove_tag, update_contact
    pub contacts_url: String,
    /// trigger_flow
    pub flows_url: String,
    /// send_email
    pub email_url: String,
    /// Bearer token sent to every collaborator
    pub api_key: Option<String>,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Enable metrics collection
    pub metrics_enabled: bool,
    /// Metrics endpoint path (default: /metrics)
    pub metrics_path: String,
    /// Prometheus namespace for every metric
    pub metrics_namespace: String,
    /// Health check endpoint path (default: /health)
    pub health_path: String,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log format (json, pretty, compact)
    pub log_format: String,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            engine: EngineConfig::default(),
            delivery: DeliveryConfig::default(),
            security: SecurityConfig::default(),
            collaborators: CollaboratorsConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8010,
            request_timeout: 30,
            max_body_size: 1024 * 1024, // 1MB
            cors_enabled: true,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_rules: 8,
            max_concurrent_events: 32,
            event_queue_capacity: 1024,
            execution_retention: 10_000,
            scheduler_enabled: true,
            scheduler_tick_seconds: 30,
            action_timeout_seconds: 10,
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: 8,
            queue_capacity: 1024,
            per_webhook_concurrency: None,
            initial_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 60_000,
            response_body_limit: 1024,
            log_retention: 1_000,
            user_agent: format!("CRM-Automation-Webhooks/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl DeliveryConfig {
    /// Effective per-subscription limit, never below 1
    pub fn per_webhook_limit(&self) -> usize {
        self.per_webhook_concurrency
            .unwrap_or_else(|| self.worker_count.saturating_sub(1))
            .max(1)
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            secret_encryption_key: None,
            secret_prefix: "whsec_".to_string(),
        }
    }
}

impl Default for CollaboratorsConfig {
    fn default() -> Self {
        Self {
            messaging_url: "http://localhost:8021".to_string(),
            contacts_url: "http://localhost:8022".to_string(),
            flows_url: "http://localhost:8023".to_string(),
            email_url: "http://localhost:8024".to_string(),
            api_key: None,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            metrics_path: "/metrics".to_string(),
            metrics_namespace: "automation".to_string(),
            health_path: "/health".to_string(),
            log_level: "info".to_string(),
            log_format: "json".to_string(),
        }
    }
}

impl AutomationConfig {
    /// Load configuration from `.env`, the environment and an optional file
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::load(&ConfigOverrides::default())
    }

    /// Same as [`AutomationConfig::from_env`], with command line overrides
    /// applied last
    pub fn load(overrides: &ConfigOverrides) -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();

        let mut cfg = config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8010)?
            .set_default("observability.log_level", "info")?
            .set_default("observability.log_format", "json")?;

        // Load from optional config file
        let config_path = overrides
            .file
            .clone()
            .or_else(|| std::env::var("AUTOMATION_CONFIG_FILE").ok());
        if let Some(config_path) = config_path {
            cfg = cfg.add_source(config::File::with_name(&config_path).required(false));
        }

        // Environment wins over the file
        cfg = cfg.add_source(
            config::Environment::with_prefix("AUTOMATION")
                .prefix_separator("__")
                .separator("__"),
        );

        if let Some(port) = overrides.port {
            cfg = cfg.set_override("server.port", i64::from(port))?;
        }

        cfg.build()?.try_deserialize()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("Server port cannot be 0".to_string());
        }

        if self.engine.max_concurrent_rules == 0 || self.engine.max_concurrent_events == 0 {
            return Err("Engine concurrency limits must be at least 1".to_string());
        }

        if self.engine.event_queue_capacity == 0 {
            return Err("Event queue capacity must be at least 1".to_string());
        }

        if self.engine.scheduler_tick_seconds == 0 {
            return Err("Scheduler tick must be at least 1 second".to_string());
        }

        if self.engine.action_timeout_seconds == 0 {
            return Err("Action timeout must be at least 1 second".to_string());
        }

        if self.delivery.worker_count == 0 || self.delivery.queue_capacity == 0 {
            return Err("Delivery worker count and queue capacity must be at least 1".to_string());
        }

        if self.delivery.per_webhook_concurrency == Some(0) {
            return Err("Per-webhook delivery concurrency must be at least 1".to_string());
        }

        if self.delivery.log_retention == 0 {
            return Err("Delivery log retention must be at least 1".to_string());
        }

        let multiplier = self.delivery.backoff_multiplier;
        if multiplier.is_nan() || multiplier < 1.0 {
            return Err("Delivery backoff multiplier must be at least 1.0".to_string());
        }

        if self.delivery.max_backoff_ms < self.delivery.initial_backoff_ms {
            return Err("Delivery max backoff must not be below the initial backoff".to_string());
        }

        if let Some(ref key) = self.security.secret_encryption_key {
            if key.trim().is_empty() {
                return Err("Secret encryption key cannot be blank".to_string());
            }
        }

        // Validate URLs
        for (name, url) in [
            ("messaging", &self.collaborators.messaging_url),
            ("contacts", &self.collaborators.contacts_url),
            ("flows", &self.collaborators.flows_url),
            ("email", &self.collaborators.email_url),
        ] {
            Url::parse(url).map_err(|e| format!("Invalid {} collaborator URL: {}", name, e))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config() {
        let config = AutomationConfig::default();
        assert_eq!(config.server.port, 8010);
        assert_eq!(config.delivery.response_body_limit, 1024);
        assert_eq!(config.security.secret_prefix, "whsec_");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AutomationConfig::default();

        config.server.port = 0;
        assert!(config.validate().is_err());
        config.server.port = 8010;

        config.delivery.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());
        config.delivery.backoff_multiplier = 2.0;

        config.collaborators.contacts_url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_environment_overrides() {
        std::env::set_var("AUTOMATION__SERVER__PORT", "9100");
        std::env::set_var("AUTOMATION__DELIVERY__WORKER_COUNT", "3");

        let config = AutomationConfig::from_env().unwrap();

        std::env::remove_var("AUTOMATION__SERVER__PORT");
        std::env::remove_var("AUTOMATION__DELIVERY__WORKER_COUNT");

        assert_eq!(config.server.port, 9100);
        assert_eq!(config.delivery.worker_count, 3);
        assert_eq!(config.engine.max_concurrent_rules, 8);
    }

    #[test]
    #[serial]
    fn test_command_line_port_beats_environment() {
        std::env::set_var("AUTOMATION__SERVER__PORT", "9100");

        let config = AutomationConfig::load(&ConfigOverrides {
            file: None,
            port: Some(9200),
        })
        .unwrap();

        std::env::remove_var("AUTOMATION__SERVER__PORT");

        assert_eq!(config.server.port, 9200);
    }

    #[test]
    fn test_per_webhook_limit_leaves_a_worker_free() {
        let mut delivery = DeliveryConfig::default();
        delivery.worker_count = 8;
        assert_eq!(delivery.per_webhook_limit(), 7);

        delivery.worker_count = 1;
        assert_eq!(delivery.per_webhook_limit(), 1);

        delivery.per_webhook_concurrency = Some(3);
        assert_eq!(delivery.per_webhook_limit(), 3);
    }
}
