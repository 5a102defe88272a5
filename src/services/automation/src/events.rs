//! # Event Hub
//!
//! Single ingestion point for domain events. Each accepted event is handed
//! to the automation engine and to the webhook dispatcher through two
//! separate bounded queues. Only a full engine queue rejects an event; when
//! the webhook queue is full the event still runs rules and its webhook
//! deliveries are shed.

use crate::config::EngineConfig;
use crate::engine::AutomationEngine;
use crate::error::{AutomationError, AutomationResult};
use crate::metrics::AutomationMetrics;
use crate::webhook::WebhookDispatcher;
use crm_shared::{canonical_event_type, DomainEvent};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const ENGINE_QUEUE: &str = "engine_events";
const WEBHOOK_QUEUE: &str = "webhook_events";

#[derive(Clone)]
pub struct EventHub {
    engine_tx: mpsc::Sender<DomainEvent>,
    webhook_tx: mpsc::Sender<DomainEvent>,
    metrics: AutomationMetrics,
}

impl EventHub {
    /// Spawn both queue consumers and return the hub feeding them
    pub fn start(
        engine: Arc<AutomationEngine>,
        dispatcher: WebhookDispatcher,
        config: &EngineConfig,
        metrics: AutomationMetrics,
        shutdown: CancellationToken,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let capacity = config.event_queue_capacity.max(1);
        let (engine_tx, engine_rx) = mpsc::channel(capacity);
        let (webhook_tx, webhook_rx) = mpsc::channel(capacity);

        let engine_consumer = tokio::spawn(consume(
            ENGINE_QUEUE,
            engine_rx,
            config.max_concurrent_events,
            shutdown.clone(),
            move |event| {
                let engine = engine.clone();
                async move {
                    engine.handle_event(&event).await;
                }
            },
        ));

        let webhook_consumer = tokio::spawn(consume(
            WEBHOOK_QUEUE,
            webhook_rx,
            config.max_concurrent_events,
            shutdown,
            move |event| {
                let dispatcher = dispatcher.clone();
                async move {
                    dispatcher.dispatch(&event).await;
                }
            },
        ));

        (
            Self {
                engine_tx,
                webhook_tx,
                metrics,
            },
            vec![engine_consumer, webhook_consumer],
        )
    }

    /// Both consumers still receive events
    pub fn is_running(&self) -> bool {
        !self.engine_tx.is_closed() && !self.webhook_tx.is_closed()
    }

    /// Accept an event for asynchronous processing. Known types and trigger
    /// aliases are rewritten to their catalog spelling; other types are
    /// forwarded unchanged and reach wildcard subscriptions only.
    ///
    /// Fails with `ServiceUnavailable` when the engine queue is full.
    pub fn publish(&self, mut event: DomainEvent) -> AutomationResult<DomainEvent> {
        let event_type = event.event_type.trim();
        if event_type.is_empty() || event_type.chars().any(char::is_whitespace) {
            return Err(AutomationError::validation(
                "type",
                "event type must be a non-empty token",
            ));
        }

        event.event_type = match canonical_event_type(event_type) {
            Some(canonical) => canonical.to_string(),
            None => {
                warn!(event_type = %event_type, "Accepting event type outside the catalog");
                event_type.to_string()
            }
        };

        let engine_slot = self
            .engine_tx
            .try_reserve()
            .map_err(|_| AutomationError::service_unavailable(ENGINE_QUEUE))?;
        engine_slot.send(event.clone());

        match self.webhook_tx.try_reserve() {
            Ok(webhook_slot) => webhook_slot.send(event.clone()),
            Err(e) => {
                warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Webhook queue unavailable, shedding deliveries for event"
                );
                self.metrics.record_shed(WEBHOOK_QUEUE);
            }
        }

        self.metrics.record_event_received(&event.event_type);
        self.metrics.record_queue_depth(ENGINE_QUEUE, queue_depth(&self.engine_tx));
        self.metrics.record_queue_depth(WEBHOOK_QUEUE, queue_depth(&self.webhook_tx));

        debug!(event_id = %event.id, event_type = %event.event_type, "Event published");
        Ok(event)
    }
}

fn queue_depth<T>(sender: &mpsc::Sender<T>) -> usize {
    sender.max_capacity() - sender.capacity()
}

/// Drain a queue, running up to `concurrency` handlers at once. On shutdown
/// the consumer stops taking events and waits for running handlers.
async fn consume<F, Fut>(
    name: &'static str,
    mut events: mpsc::Receiver<DomainEvent>,
    concurrency: usize,
    shutdown: CancellationToken,
    handler: F,
) where
    F: Fn(DomainEvent) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let concurrency = concurrency.max(1);
    let permits = Arc::new(Semaphore::new(concurrency));
    info!(queue = name, concurrency, "Event consumer started");

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let permit = match permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let task = handler(event);
        tokio::spawn(async move {
            task.await;
            drop(permit);
        });
    }

    // Every permit back means every handler finished
    let _ = permits.acquire_many(concurrency as u32).await;
    info!(queue = name, "Event consumer stopped");
}
