//! Main binary entry point for the CRM Automation Service
//!
//! Runs the automation rule engine, the webhook delivery pool and the HTTP
//! API used by the administration console.

use anyhow::Context;
use automation_service::{AutomationConfig, AutomationService, ConfigOverrides};
use clap::Parser;
use std::process;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Command line overrides; everything else comes from the environment
#[derive(Debug, Parser)]
#[command(name = "automation-server", version, about = "CRM automation rule engine and webhook delivery")]
struct Args {
    /// Configuration file, read before AUTOMATION__* variables
    #[arg(short, long, env = "AUTOMATION_CONFIG_FILE")]
    config: Option<String>,

    /// Override the listening port
    #[arg(short, long)]
    port: Option<u16>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize tracing
    if let Err(e) = init_tracing() {
        eprintln!("Failed to initialize tracing: {:#}", e);
        process::exit(1);
    }

    info!(
        "Starting CRM Automation Service v{}",
        env!("CARGO_PKG_VERSION")
    );

    // Load configuration
    let config = match load_config(&args) {
        Ok(config) => {
            info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            process::exit(1);
        }
    };

    // Validate configuration
    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        process::exit(1);
    }

    log_configuration(&config);

    if args.check {
        info!("Configuration is valid");
        return;
    }

    // Create and start the service
    let service = match AutomationService::new(config).await {
        Ok(service) => {
            info!("Automation service initialized successfully");
            service
        }
        Err(e) => {
            error!("Failed to initialize service: {}", e);
            process::exit(1);
        }
    };

    // Start the service (this blocks until shutdown)
    if let Err(e) = service.start().await {
        error!("Service error: {}", e);
        process::exit(1);
    }

    info!("CRM Automation Service shutdown complete");
}

fn load_config(args: &Args) -> anyhow::Result<AutomationConfig> {
    let overrides = ConfigOverrides {
        file: args.config.clone(),
        port: args.port,
    };
    AutomationConfig::load(&overrides).context("reading AUTOMATION__* settings")
}

/// Initialize tracing/logging
fn init_tracing() -> anyhow::Result<()> {
    // Get log level from environment or default to info
    let log_level = std::env::var("AUTOMATION_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    // Get log format from environment or default to json
    let log_format = std::env::var("AUTOMATION_LOG_FORMAT").unwrap_or_else(|_| "json".to_string());

    let filter = EnvFilter::try_new(&log_level)
        .or_else(|_| EnvFilter::try_new("info"))
        .context("building log filter")?;

    match log_format.as_str() {
        "json" => {
            // JSON formatted logs for production
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()?;
        }
        "pretty" | "text" => {
            // Pretty formatted logs for development
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .pretty()
                        .with_file(true)
                        .with_line_number(true)
                        .with_thread_ids(true)
                        .with_target(false),
                )
                .try_init()?;
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().compact())
                .try_init()?;
        }
    }

    Ok(())
}

fn log_configuration(config: &AutomationConfig) {
    info!(
        "Engine: {} concurrent rules, {} concurrent events, queue capacity {}",
        config.engine.max_concurrent_rules,
        config.engine.max_concurrent_events,
        config.engine.event_queue_capacity
    );

    if config.engine.scheduler_enabled {
        info!(
            "Scheduled triggers: enabled, tick every {}s",
            config.engine.scheduler_tick_seconds
        );
    } else {
        info!("Scheduled triggers: disabled");
    }

    info!(
        "Webhook delivery: {} workers, {} per webhook, backoff {}ms x{} up to {}ms",
        config.delivery.worker_count,
        config.delivery.per_webhook_limit(),
        config.delivery.initial_backoff_ms,
        config.delivery.backoff_multiplier,
        config.delivery.max_backoff_ms
    );

    if config.security.secret_encryption_key.is_none() {
        warn!("Secret encryption key not set, webhook secrets use an ephemeral key");
    }

    if config.collaborators.api_key.is_none() {
        warn!("No collaborator API key configured");
    }

    if config.observability.metrics_enabled {
        info!("Metrics: enabled at {}", config.observability.metrics_path);
    }
}
