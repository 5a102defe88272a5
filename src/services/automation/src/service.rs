//! Service wiring for the automation service
//!
//! Builds the rule store, engine, webhook pool and event hub from the
//! configuration, serves the HTTP API and shuts everything down in order.

use crate::config::AutomationConfig;
use crate::engine::{
    ActionExecutor, AutomationEngine, Collaborators, ExecutionStore, MemoryExecutionStore,
    RuleStore, ScheduledTriggerSource,
};
use crate::error::{AutomationError, AutomationResult};
use crate::events::EventHub;
use crate::handlers::create_routes;
use crate::metrics::AutomationMetrics;
use crate::security::SecretCipher;
use crate::webhook::{
    DeliveryLogStore, MemoryDeliveryLogStore, WebhookDeliveryClient, WebhookDispatcher,
    WebhookRegistry,
};
use axum::extract::DefaultBodyLimit;
use axum::{serve, Router};
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    request_id::{MakeRequestId, RequestId, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Main automation service
pub struct AutomationService {
    app_state: Arc<AppState>,
    addr: SocketAddr,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Application state shared across handlers
pub struct AppState {
    pub config: AutomationConfig,
    pub store: Arc<RuleStore>,
    pub executions: Arc<dyn ExecutionStore>,
    pub engine: Arc<AutomationEngine>,
    pub registry: Arc<WebhookRegistry>,
    pub dispatcher: WebhookDispatcher,
    pub logs: Arc<dyn DeliveryLogStore>,
    pub hub: EventHub,
    pub metrics: AutomationMetrics,
    pub started_at: DateTime<Utc>,
}

/// Custom request ID generator
#[derive(Clone, Default)]
struct CustomMakeRequestId;

impl MakeRequestId for CustomMakeRequestId {
    fn make_request_id<B>(&mut self, _request: &axum::http::Request<B>) -> Option<RequestId> {
        let id = format!("req-{}", Uuid::new_v4());
        axum::http::HeaderValue::from_str(&id)
            .ok()
            .map(RequestId::new)
    }
}

impl AutomationService {
    /// Create the service with REST collaborators taken from the configuration
    pub async fn new(config: AutomationConfig) -> AutomationResult<Self> {
        let collaborators = Collaborators::from_config(
            &config.collaborators,
            Duration::from_secs(config.engine.action_timeout_seconds),
        )?;
        Self::with_collaborators(config, collaborators).await
    }

    /// Create the service with caller-supplied collaborators. Spawns the
    /// background workers, so it must run inside a tokio runtime.
    pub async fn with_collaborators(
        config: AutomationConfig,
        collaborators: Collaborators,
    ) -> AutomationResult<Self> {
        info!("Initializing automation service");

        config.validate().map_err(AutomationError::configuration)?;

        let metrics = AutomationMetrics::new(&config.observability.metrics_namespace)?;
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        // Rules and executions
        let store = Arc::new(RuleStore::new());
        let executions: Arc<dyn ExecutionStore> =
            Arc::new(MemoryExecutionStore::new(config.engine.execution_retention));

        // Webhooks
        let delivery = Arc::new(WebhookDeliveryClient::new(&config.delivery)?);
        let cipher = SecretCipher::new(config.security.secret_encryption_key.as_deref());
        let registry = Arc::new(WebhookRegistry::new(cipher, config.security.secret_prefix.clone()));
        let logs: Arc<dyn DeliveryLogStore> =
            Arc::new(MemoryDeliveryLogStore::new(config.delivery.log_retention));
        let (dispatcher, delivery_tasks) = WebhookDispatcher::start(
            registry.clone(),
            delivery.clone(),
            logs.clone(),
            metrics.clone(),
            &config.delivery,
            shutdown.clone(),
        );
        tasks.extend(delivery_tasks);

        // Engine and event hub
        let executor = Arc::new(ActionExecutor::new(
            collaborators,
            delivery,
            Duration::from_secs(config.engine.action_timeout_seconds),
        ));
        let engine = Arc::new(AutomationEngine::new(
            store.clone(),
            executions.clone(),
            executor,
            metrics.clone(),
            config.engine.max_concurrent_rules,
        ));
        let (hub, hub_tasks) = EventHub::start(
            engine.clone(),
            dispatcher.clone(),
            &config.engine,
            metrics.clone(),
            shutdown.clone(),
        );
        tasks.extend(hub_tasks);

        if config.engine.scheduler_enabled {
            let scheduler = Arc::new(ScheduledTriggerSource::new(
                store.clone(),
                hub.clone(),
                Duration::from_secs(config.engine.scheduler_tick_seconds),
            ));
            tasks.push(tokio::spawn(scheduler.run(shutdown.clone())));
        } else {
            info!("Scheduled trigger source disabled");
        }

        let addr = format!("{}:{}", config.server.host, config.server.port)
            .parse()
            .map_err(|e| AutomationError::configuration(format!("Invalid server address: {}", e)))?;

        let app_state = Arc::new(AppState {
            config,
            store,
            executions,
            engine,
            registry,
            dispatcher,
            logs,
            hub,
            metrics,
            started_at: Utc::now(),
        });

        Ok(Self {
            app_state,
            addr,
            shutdown,
            tasks,
        })
    }

    pub fn state(&self) -> Arc<AppState> {
        self.app_state.clone()
    }

    /// Routes with the full middleware stack
    pub fn router(&self) -> Router {
        let config = &self.app_state.config;

        let middleware = ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CompressionLayer::new())
            .layer(SetRequestIdLayer::new(
                axum::http::header::HeaderName::from_static("x-request-id"),
                CustomMakeRequestId,
            ))
            .layer(TimeoutLayer::new(Duration::from_secs(config.server.request_timeout)))
            .layer(DefaultBodyLimit::max(config.server.max_body_size));

        let router = create_routes(self.app_state.clone()).layer(middleware);

        if config.server.cors_enabled {
            router.layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            )
        } else {
            router
        }
    }

    /// Serve until Ctrl+C or SIGTERM, then stop the background workers
    pub async fn start(self) -> AutomationResult<()> {
        info!("Starting automation service on {}", self.addr);

        let app = self.router();
        let listener = tokio::net::TcpListener::bind(&self.addr)
            .await
            .map_err(|e| AutomationError::internal(format!("Failed to bind to address: {}", e)))?;

        info!("Automation service started successfully on {}", self.addr);

        let served = serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(Self::shutdown_signal())
        .await;

        self.stop().await;

        if let Err(e) = served {
            error!("Server error: {}", e);
            return Err(AutomationError::internal(format!("Server error: {}", e)));
        }

        info!("Automation service stopped gracefully");
        Ok(())
    }

    /// Stop the event hub, scheduler and delivery workers and wait for
    /// in-flight work
    pub async fn stop(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
    }

    /// Wait for shutdown signal
    async fn shutdown_signal() {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    error!("Failed to install signal handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, shutting down");
            }
            _ = terminate => {
                info!("Received terminate signal, shutting down");
            }
        }
    }
}
