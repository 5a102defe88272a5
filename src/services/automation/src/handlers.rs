//! HTTP handlers for the automation service
//!
//! JSON API consumed by the administration console: event ingestion, rule
//! management, execution logs, webhook management and delivery logs.

use crate::error::{AutomationError, AutomationResult};
use crate::service::AppState;
use crate::HealthStatus;
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use crm_shared::{
    available_events, AutomationExecution, AutomationRule, CreateAutomationRequest,
    CreateWebhookRequest, DomainEvent, EventDescriptor, UpdateAutomationRequest,
    UpdateWebhookRequest, WebhookDeliveryLog, WebhookSecret, WebhookStats, WebhookSubscription,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

/// `?limit=` on log endpoints
#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

impl LimitQuery {
    fn resolve(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

/// Create all routes for the automation service
pub fn create_routes(state: Arc<AppState>) -> Router {
    let observability = &state.config.observability;
    let mut router = Router::new().route(&observability.health_path, get(health_check));
    if observability.metrics_enabled {
        router = router.route(&observability.metrics_path, get(metrics_handler));
    }

    router
        // Events
        .route("/api/v1/events", post(ingest_event))
        .route("/api/v1/events/available", get(list_available_events))
        // Automation rules
        .route(
            "/api/v1/automations",
            get(list_automations).post(create_automation),
        )
        .route(
            "/api/v1/automations/:id",
            get(get_automation)
                .put(update_automation)
                .delete(delete_automation),
        )
        .route("/api/v1/automations/:id/activate", post(activate_automation))
        .route(
            "/api/v1/automations/:id/deactivate",
            post(deactivate_automation),
        )
        .route("/api/v1/automations/:id/executions", get(rule_executions))
        .route("/api/v1/executions", get(recent_executions))
        // Webhooks
        .route("/api/v1/webhooks", get(list_webhooks).post(create_webhook))
        .route(
            "/api/v1/webhooks/:id",
            get(get_webhook).put(update_webhook).delete(delete_webhook),
        )
        .route(
            "/api/v1/webhooks/:id/regenerate-secret",
            post(regenerate_webhook_secret),
        )
        .route("/api/v1/webhooks/:id/test", post(test_webhook))
        .route("/api/v1/webhooks/:id/logs", get(webhook_logs))
        .route("/api/v1/webhooks/:id/stats", get(webhook_stats))
        .with_state(state)
}

// =============================================================================
// Health and metrics
// =============================================================================

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    debug!("Health check requested");

    let rules = state.store.list();
    let active_rules = rules.iter().filter(|rule| rule.is_active()).count();

    let health = HealthStatus::healthy()
        .with_uptime(state.started_at)
        .with_component("event_hub", state.hub.is_running())
        .with_component("delivery_pool", state.dispatcher.is_running())
        .with_count("rules", rules.len())
        .with_count("active_rules", active_rules)
        .with_count("webhooks", state.registry.len())
        .with_count("executions", state.executions.len().await);

    let status_code = if health.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(health))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> AutomationResult<impl IntoResponse> {
    let body = state.metrics.export_metrics()?;
    Ok((
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    ))
}

// =============================================================================
// Events
// =============================================================================

async fn ingest_event(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<DomainEvent>, JsonRejection>,
) -> AutomationResult<impl IntoResponse> {
    let event = state.hub.publish(json_body(payload)?)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "accepted": true,
            "eventId": event.id,
            "type": event.event_type,
        })),
    ))
}

async fn list_available_events() -> Json<&'static [EventDescriptor]> {
    Json(available_events())
}

// =============================================================================
// Automation rules
// =============================================================================

async fn list_automations(State(state): State<Arc<AppState>>) -> Json<Vec<AutomationRule>> {
    Json(state.store.list())
}

async fn create_automation(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateAutomationRequest>, JsonRejection>,
) -> AutomationResult<impl IntoResponse> {
    let rule = state.store.create(json_body(payload)?)?;
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn get_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AutomationResult<Json<AutomationRule>> {
    Ok(Json(state.store.get(parse_id(&id)?)?))
}

async fn update_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: Result<Json<UpdateAutomationRequest>, JsonRejection>,
) -> AutomationResult<Json<AutomationRule>> {
    let id = parse_id(&id)?;
    Ok(Json(state.store.update(id, json_body(payload)?)?))
}

async fn delete_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AutomationResult<StatusCode> {
    state.store.delete(parse_id(&id)?)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn activate_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AutomationResult<Json<AutomationRule>> {
    Ok(Json(state.store.activate(parse_id(&id)?)?))
}

async fn deactivate_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AutomationResult<Json<AutomationRule>> {
    Ok(Json(state.store.deactivate(parse_id(&id)?)?))
}

async fn rule_executions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> AutomationResult<Json<Vec<AutomationExecution>>> {
    let id = parse_id(&id)?;
    state.store.get(id)?;
    Ok(Json(state.executions.list_for_rule(id, query.resolve()).await))
}

async fn recent_executions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Json<Vec<AutomationExecution>> {
    Json(state.executions.list_recent(query.resolve()).await)
}

// =============================================================================
// Webhooks
// =============================================================================

async fn list_webhooks(State(state): State<Arc<AppState>>) -> Json<Vec<WebhookSubscription>> {
    Json(state.registry.list())
}

async fn create_webhook(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateWebhookRequest>, JsonRejection>,
) -> AutomationResult<impl IntoResponse> {
    let created = state.registry.create(json_body(payload)?)?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_webhook(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AutomationResult<Json<WebhookSubscription>> {
    Ok(Json(state.registry.get(parse_id(&id)?)?))
}

async fn update_webhook(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: Result<Json<UpdateWebhookRequest>, JsonRejection>,
) -> AutomationResult<Json<WebhookSubscription>> {
    let id = parse_id(&id)?;
    Ok(Json(state.registry.update(id, json_body(payload)?)?))
}

async fn delete_webhook(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AutomationResult<StatusCode> {
    let id = parse_id(&id)?;
    state.registry.delete(id)?;
    state.logs.remove(id).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn regenerate_webhook_secret(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AutomationResult<Json<WebhookSecret>> {
    Ok(Json(state.registry.regenerate_secret(parse_id(&id)?)?))
}

async fn test_webhook(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AutomationResult<Json<WebhookDeliveryLog>> {
    let id = parse_id(&id)?;
    let log = state.dispatcher.send_test(id).await?;
    info!(webhook_id = %id, success = log.is_success, "Test delivery finished");
    Ok(Json(log))
}

/// Logs outlive their subscription, so unknown ids yield an empty list
async fn webhook_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> AutomationResult<Json<Vec<WebhookDeliveryLog>>> {
    let id = parse_id(&id)?;
    Ok(Json(state.logs.list(id, query.resolve()).await))
}

async fn webhook_stats(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AutomationResult<Json<WebhookStats>> {
    let id = parse_id(&id)?;
    Ok(Json(state.logs.stats(id).await))
}

// =============================================================================
// Helpers
// =============================================================================

fn parse_id(raw: &str) -> AutomationResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| AutomationError::validation("id", format!("not a valid id: {}", raw)))
}

/// Turn body rejections into the API's error shape
fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> AutomationResult<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| AutomationError::validation("body", rejection.body_text()))
}
