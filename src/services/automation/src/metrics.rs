//! Prometheus metrics for the engine and the webhook delivery pool

use crate::error::{AutomationError, AutomationResult};
use crm_shared::is_known_event;
use prometheus::core::Collector;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Metrics collector for the automation service
#[derive(Clone)]
pub struct AutomationMetrics {
    registry: Arc<Registry>,

    // Counters
    events_received: IntCounterVec,
    rule_executions: IntCounterVec,
    action_results: IntCounterVec,
    webhook_deliveries: IntCounterVec,
    webhook_attempts: IntCounter,
    items_shed: IntCounterVec,

    // Gauges
    queue_depth: IntGaugeVec,

    // Histograms
    execution_duration: HistogramVec,
    delivery_duration: HistogramVec,
}

impl AutomationMetrics {
    pub fn new(namespace: &str) -> AutomationResult<Self> {
        let registry = Registry::new();

        let events_received = register(
            &registry,
            IntCounterVec::new(
                Opts::new("events_received_total", "Domain events accepted by the event hub")
                    .namespace(namespace),
                &["event_type"],
            ),
        )?;

        let rule_executions = register(
            &registry,
            IntCounterVec::new(
                Opts::new("rule_executions_total", "Automation rule executions")
                    .namespace(namespace),
                &["outcome"],
            ),
        )?;

        let action_results = register(
            &registry,
            IntCounterVec::new(
                Opts::new("action_results_total", "Individual action outcomes")
                    .namespace(namespace),
                &["action_type", "outcome"],
            ),
        )?;

        let webhook_deliveries = register(
            &registry,
            IntCounterVec::new(
                Opts::new("webhook_deliveries_total", "Terminal webhook delivery outcomes")
                    .namespace(namespace),
                &["outcome"],
            ),
        )?;

        let webhook_attempts = register(
            &registry,
            IntCounter::with_opts(
                Opts::new("webhook_delivery_attempts_total", "HTTP attempts made for webhooks")
                    .namespace(namespace),
            ),
        )?;

        let items_shed = register(
            &registry,
            IntCounterVec::new(
                Opts::new("items_shed_total", "Items dropped because an internal queue was full")
                    .namespace(namespace),
                &["queue"],
            ),
        )?;

        let queue_depth = register(
            &registry,
            IntGaugeVec::new(
                Opts::new("queue_depth", "Items waiting in internal queues").namespace(namespace),
                &["queue"],
            ),
        )?;

        let execution_duration = register(
            &registry,
            HistogramVec::new(
                HistogramOpts::new(
                    "rule_execution_duration_seconds",
                    "Time taken to run all actions of a matched rule",
                )
                .namespace(namespace)
                .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
                &["outcome"],
            ),
        )?;

        let delivery_duration = register(
            &registry,
            HistogramVec::new(
                HistogramOpts::new(
                    "webhook_delivery_duration_seconds",
                    "Duration of the terminal webhook attempt",
                )
                .namespace(namespace)
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
                &["outcome"],
            ),
        )?;

        info!("Automation metrics initialized");

        Ok(Self {
            registry: Arc::new(registry),
            events_received,
            rule_executions,
            action_results,
            webhook_deliveries,
            webhook_attempts,
            items_shed,
            queue_depth,
            execution_duration,
            delivery_duration,
        })
    }

    /// Types outside the catalog share the `other` label
    pub fn record_event_received(&self, event_type: &str) {
        let label = if is_known_event(event_type) {
            event_type
        } else {
            "other"
        };
        self.events_received.with_label_values(&[label]).inc();
    }

    pub fn record_rule_execution(&self, success: bool, duration: Duration) {
        let outcome = outcome_label(success);
        self.rule_executions.with_label_values(&[outcome]).inc();
        self.execution_duration
            .with_label_values(&[outcome])
            .observe(duration.as_secs_f64());
    }

    pub fn record_action_result(&self, action_type: &str, success: bool) {
        self.action_results
            .with_label_values(&[action_type, outcome_label(success)])
            .inc();
    }

    pub fn record_delivery(&self, success: bool, attempts: u32, terminal_attempt: Duration) {
        let outcome = outcome_label(success);
        self.webhook_deliveries.with_label_values(&[outcome]).inc();
        self.webhook_attempts.inc_by(u64::from(attempts));
        self.delivery_duration
            .with_label_values(&[outcome])
            .observe(terminal_attempt.as_secs_f64());
    }

    pub fn record_shed(&self, queue: &str) {
        self.items_shed.with_label_values(&[queue]).inc();
    }

    pub fn record_queue_depth(&self, queue: &str, depth: usize) {
        self.queue_depth
            .with_label_values(&[queue])
            .set(depth as i64);
    }

    /// Export metrics in Prometheus text format
    pub fn export_metrics(&self) -> AutomationResult<String> {
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();

        encoder
            .encode_to_string(&metric_families)
            .map_err(|e| AutomationError::internal(format!("Failed to encode metrics: {}", e)))
    }
}

fn outcome_label(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "failure"
    }
}

fn register<C>(registry: &Registry, metric: prometheus::Result<C>) -> AutomationResult<C>
where
    C: Collector + Clone + 'static,
{
    let metric =
        metric.map_err(|e| AutomationError::internal(format!("Failed to create metric: {}", e)))?;
    registry
        .register(Box::new(metric.clone()))
        .map_err(|e| AutomationError::internal(format!("Failed to register metric: {}", e)))?;
    Ok(metric)
}
