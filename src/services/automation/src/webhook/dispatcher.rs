//! # Webhook Dispatcher
//!
//! Fans an event out to every matching subscription. Deliveries are queued
//! as jobs on one bounded channel and executed by a fixed pool of workers.
//!
//! A worker makes exactly one HTTP attempt per job. A failed attempt with
//! retries left goes to the retry scheduler, which puts the job back on the
//! queue once its backoff has elapsed, so no worker sleeps between attempts.
//! Each subscription may hold at most `per_webhook_limit` workers at once;
//! further jobs for it are parked and run as its attempts finish, leaving
//! the remaining workers to other subscriptions.

use super::delivery::{AttemptResult, DeliveryTarget, PreparedDelivery, WebhookDeliveryClient};
use super::logs::DeliveryLogStore;
use super::registry::WebhookRegistry;
use crate::config::DeliveryConfig;
use crate::error::{AutomationError, AutomationResult};
use crate::metrics::AutomationMetrics;
use chrono::Utc;
use crm_shared::{DomainEvent, WebhookDeliveryLog, WebhookEnvelope, WebhookSubscription, TEST_EVENT};
use futures::StreamExt;
use parking_lot::Mutex as SyncMutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

const QUEUE_NAME: &str = "webhook_delivery";
const PARKED_QUEUE_NAME: &str = "webhook_parked";

/// One subscription, one event
pub struct DeliveryJob {
    pub webhook: WebhookSubscription,
    pub secret: String,
    pub event: DomainEvent,
    /// Receives the log row once the delivery finished
    pub reply: Option<oneshot::Sender<WebhookDeliveryLog>>,
}

/// A job on its way through the pool
struct QueuedDelivery {
    job: DeliveryJob,
    /// 1-based number of the attempt this job makes next
    attempt: u32,
    /// Built by the first attempt and reused by retries
    prepared: Option<PreparedDelivery>,
}

impl QueuedDelivery {
    fn new(job: DeliveryJob) -> Self {
        Self {
            job,
            attempt: 1,
            prepared: None,
        }
    }

    fn webhook_id(&self) -> Uuid {
        self.job.webhook.id
    }
}

/// A failed attempt waiting for its backoff to elapse
struct ScheduledRetry {
    delivery: QueuedDelivery,
    delay: Duration,
}

/// Pending deliveries of one dispatched event
pub struct DispatchHandle {
    pub matched: usize,
    receivers: Vec<oneshot::Receiver<WebhookDeliveryLog>>,
}

impl DispatchHandle {
    /// Wait for every queued delivery of this event to finish
    pub async fn wait(self) -> Vec<WebhookDeliveryLog> {
        let mut logs = Vec::with_capacity(self.receivers.len());
        for receiver in self.receivers {
            if let Ok(log) = receiver.await {
                logs.push(log);
            }
        }
        logs
    }
}

#[derive(Default)]
struct Lane {
    in_flight: usize,
    parked: VecDeque<QueuedDelivery>,
}

enum Admission {
    Run(QueuedDelivery),
    Parked,
    Rejected(QueuedDelivery),
}

/// Per-subscription slots shared by all workers
struct Lanes {
    limit: usize,
    max_parked: usize,
    lanes: SyncMutex<HashMap<Uuid, Lane>>,
}

impl Lanes {
    fn new(limit: usize, max_parked: usize) -> Self {
        Self {
            limit: limit.max(1),
            max_parked: max_parked.max(1),
            lanes: SyncMutex::new(HashMap::new()),
        }
    }

    /// Take a slot of the job's subscription, or park the job behind the
    /// attempts already running for it
    fn admit(&self, delivery: QueuedDelivery) -> Admission {
        let mut lanes = self.lanes.lock();
        let lane = lanes.entry(delivery.webhook_id()).or_default();
        if lane.in_flight < self.limit {
            lane.in_flight += 1;
            Admission::Run(delivery)
        } else if lane.parked.len() < self.max_parked {
            lane.parked.push_back(delivery);
            Admission::Parked
        } else {
            Admission::Rejected(delivery)
        }
    }

    /// Give back a slot. When jobs are parked for the subscription the slot
    /// passes straight to the oldest one, which is returned to run next.
    fn release(&self, webhook_id: Uuid) -> Option<QueuedDelivery> {
        let mut lanes = self.lanes.lock();
        let lane = lanes.get_mut(&webhook_id)?;
        if let Some(next) = lane.parked.pop_front() {
            return Some(next);
        }
        lane.in_flight = lane.in_flight.saturating_sub(1);
        if lane.in_flight == 0 {
            lanes.remove(&webhook_id);
        }
        None
    }

    fn parked(&self) -> usize {
        self.lanes.lock().values().map(|lane| lane.parked.len()).sum()
    }
}

#[derive(Clone)]
pub struct WebhookDispatcher {
    registry: Arc<WebhookRegistry>,
    jobs: mpsc::Sender<QueuedDelivery>,
    metrics: AutomationMetrics,
}

struct Worker {
    id: usize,
    jobs: Arc<Mutex<mpsc::Receiver<QueuedDelivery>>>,
    retries: mpsc::UnboundedSender<ScheduledRetry>,
    lanes: Arc<Lanes>,
    client: Arc<WebhookDeliveryClient>,
    logs: Arc<dyn DeliveryLogStore>,
    metrics: AutomationMetrics,
}

impl WebhookDispatcher {
    /// Spawn the worker pool and the retry scheduler, and return the
    /// dispatcher feeding them
    pub fn start(
        registry: Arc<WebhookRegistry>,
        client: Arc<WebhookDeliveryClient>,
        logs: Arc<dyn DeliveryLogStore>,
        metrics: AutomationMetrics,
        config: &DeliveryConfig,
        shutdown: CancellationToken,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let (jobs_tx, jobs_rx) = mpsc::channel(config.queue_capacity.max(1));
        let jobs_rx = Arc::new(Mutex::new(jobs_rx));
        let (retries_tx, retries_rx) = mpsc::unbounded_channel();
        let lanes = Arc::new(Lanes::new(config.per_webhook_limit(), config.queue_capacity));

        let mut handles: Vec<JoinHandle<()>> = (0..config.worker_count.max(1))
            .map(|id| {
                let worker = Worker {
                    id,
                    jobs: jobs_rx.clone(),
                    retries: retries_tx.clone(),
                    lanes: lanes.clone(),
                    client: client.clone(),
                    logs: logs.clone(),
                    metrics: metrics.clone(),
                };
                tokio::spawn(worker.run(shutdown.clone()))
            })
            .collect();
        drop(retries_tx);

        handles.push(tokio::spawn(schedule_retries(
            retries_rx,
            jobs_tx.clone(),
            shutdown,
        )));

        info!(
            workers = config.worker_count,
            per_webhook = config.per_webhook_limit(),
            queue_capacity = config.queue_capacity,
            "Webhook delivery pool started"
        );

        (
            Self {
                registry,
                jobs: jobs_tx,
                metrics,
            },
            handles,
        )
    }

    pub fn registry(&self) -> &Arc<WebhookRegistry> {
        &self.registry
    }

    /// At least one worker still takes jobs
    pub fn is_running(&self) -> bool {
        !self.jobs.is_closed()
    }

    /// Queue one delivery per active subscription accepting the event type.
    /// Waits for queue space rather than dropping deliveries.
    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type))]
    pub async fn dispatch(&self, event: &DomainEvent) -> DispatchHandle {
        let targets = self.registry.matching(&event.event_type);
        let matched = targets.len();
        let mut receivers = Vec::with_capacity(matched);

        for (webhook, secret) in targets {
            let webhook_id = webhook.id;
            let (reply, receiver) = oneshot::channel();
            let job = DeliveryJob {
                webhook,
                secret,
                event: event.clone(),
                reply: Some(reply),
            };

            match self.jobs.send(QueuedDelivery::new(job)).await {
                Ok(()) => receivers.push(receiver),
                Err(_) => {
                    error!(webhook_id = %webhook_id, "Delivery queue closed, dropping delivery");
                }
            }
        }

        self.record_queue_depth();
        debug!(matched, "Event queued for webhook delivery");
        DispatchHandle { matched, receivers }
    }

    /// Send a `webhook.test` event to one subscription through the pool and
    /// wait for its log row
    pub async fn send_test(&self, webhook_id: Uuid) -> AutomationResult<WebhookDeliveryLog> {
        let (webhook, secret) = self.registry.target_for(webhook_id)?;
        let event = DomainEvent::new(
            TEST_EVENT,
            json!({
                "webhookId": webhook.id.to_string(),
                "webhookName": webhook.name,
                "message": "This is a test delivery",
            }),
        );

        let (reply, receiver) = oneshot::channel();
        self.jobs
            .send(QueuedDelivery::new(DeliveryJob {
                webhook,
                secret,
                event,
                reply: Some(reply),
            }))
            .await
            .map_err(|_| AutomationError::service_unavailable(QUEUE_NAME))?;
        self.record_queue_depth();

        receiver
            .await
            .map_err(|_| AutomationError::internal("Delivery worker stopped before replying"))
    }

    fn record_queue_depth(&self) {
        let depth = self.jobs.max_capacity() - self.jobs.capacity();
        self.metrics.record_queue_depth(QUEUE_NAME, depth);
    }
}

/// Hold failed attempts until their backoff elapses, then queue them again
async fn schedule_retries(
    mut retries: mpsc::UnboundedReceiver<ScheduledRetry>,
    jobs: mpsc::Sender<QueuedDelivery>,
    shutdown: CancellationToken,
) {
    let mut waiting = DelayQueue::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            retry = retries.recv() => match retry {
                Some(retry) => {
                    waiting.insert(retry.delivery, retry.delay);
                }
                None => break,
            },
            Some(due) = waiting.next(), if !waiting.is_empty() => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    sent = jobs.send(due.into_inner()) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    if !waiting.is_empty() {
        warn!(pending = waiting.len(), "Retry scheduler stopped with retries pending");
    }
    debug!("Retry scheduler stopped");
}

impl Worker {
    async fn run(self, shutdown: CancellationToken) {
        debug!(worker = self.id, "Delivery worker started");

        loop {
            // Only one idle worker waits on the receiver at a time
            let delivery = tokio::select! {
                _ = shutdown.cancelled() => break,
                delivery = async { self.jobs.lock().await.recv().await } => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            let mut current = match self.lanes.admit(delivery) {
                Admission::Run(delivery) => delivery,
                Admission::Parked => {
                    self.metrics.record_queue_depth(PARKED_QUEUE_NAME, self.lanes.parked());
                    continue;
                }
                Admission::Rejected(delivery) => {
                    self.shed(delivery);
                    continue;
                }
            };

            // Keep serving the lane while jobs are parked on it
            loop {
                let webhook_id = current.webhook_id();
                self.process(current).await;
                match self.lanes.release(webhook_id) {
                    Some(next) => current = next,
                    None => break,
                }
            }
        }

        debug!(worker = self.id, "Delivery worker stopped");
    }

    /// Make the job's next attempt, then finish it or hand it to the retry
    /// scheduler
    async fn process(&self, mut delivery: QueuedDelivery) {
        let target = DeliveryTarget::for_subscription(&delivery.job.webhook, delivery.job.secret.clone());

        let prepared = match delivery.prepared.take() {
            Some(prepared) => prepared,
            None => match self.client.prepare(&target, &delivery.job.event) {
                Ok(prepared) => prepared,
                Err(e) => {
                    error!(webhook_id = %delivery.webhook_id(), error = %e, "Webhook delivery could not be prepared");
                    let log = unsent_log(&delivery.job, e.to_string());
                    self.finish(delivery.job, log).await;
                    return;
                }
            },
        };

        let result = self.client.attempt(&target, &prepared).await;

        if !result.is_success() && delivery.attempt <= target.retry_count {
            let delay = self.client.backoff().delay_for(delivery.attempt - 1);
            warn!(
                webhook_id = %delivery.webhook_id(),
                attempt = delivery.attempt,
                max_attempts = target.retry_count.saturating_add(1),
                delay_ms = delay.as_millis() as u64,
                error = result.error.as_deref().unwrap_or_default(),
                "Webhook attempt failed, retrying"
            );

            delivery.attempt += 1;
            delivery.prepared = Some(prepared);
            match self.retries.send(ScheduledRetry { delivery, delay }) {
                Ok(()) => return,
                Err(mpsc::error::SendError(retry)) => {
                    // Scheduler gone: record the attempt that was made
                    let mut delivery = retry.delivery;
                    delivery.attempt -= 1;
                    let prepared = delivery.prepared.take();
                    self.complete(delivery, prepared, result).await;
                    return;
                }
            }
        }

        self.complete(delivery, Some(prepared), result).await;
    }

    async fn complete(&self, delivery: QueuedDelivery, prepared: Option<PreparedDelivery>, result: AttemptResult) {
        let log = match prepared {
            Some(prepared) => {
                let outcome = prepared.into_outcome(delivery.attempt, result);
                WebhookDeliveryLog {
                    id: Uuid::new_v4(),
                    webhook_id: delivery.job.webhook.id,
                    event_type: delivery.job.event.event_type.clone(),
                    payload: outcome.envelope,
                    attempt_count: outcome.attempt_count,
                    is_success: outcome.is_success,
                    response_status: outcome.response_status,
                    response_time_ms: outcome.response_time_ms,
                    response_body: outcome.response_body,
                    error_message: outcome.error_message,
                    created_at: Utc::now(),
                }
            }
            None => unsent_log(&delivery.job, result.error.unwrap_or_default()),
        };
        self.finish(delivery.job, log).await;
    }

    async fn finish(&self, job: DeliveryJob, log: WebhookDeliveryLog) {
        self.metrics.record_delivery(
            log.is_success,
            log.attempt_count,
            Duration::from_millis(log.response_time_ms),
        );

        if log.is_success {
            debug!(webhook_id = %job.webhook.id, attempts = log.attempt_count, "Webhook delivered");
        } else {
            warn!(
                webhook_id = %job.webhook.id,
                attempts = log.attempt_count,
                error = log.error_message.as_deref().unwrap_or_default(),
                "Webhook delivery failed"
            );
        }

        self.logs.append(log.clone()).await;

        if let Some(reply) = job.reply {
            // The requester may have stopped waiting
            let _ = reply.send(log);
        }
    }

    /// Too many jobs parked for one subscription: drop the newest
    fn shed(&self, delivery: QueuedDelivery) {
        warn!(
            webhook_id = %delivery.webhook_id(),
            event_id = %delivery.job.event.id,
            "Delivery backlog full for webhook, shedding delivery"
        );
        self.metrics.record_shed(PARKED_QUEUE_NAME);
    }
}

/// Log row for a delivery whose request could not be built. It still counts
/// as the first attempt.
fn unsent_log(job: &DeliveryJob, error: String) -> WebhookDeliveryLog {
    let payload = serde_json::to_value(WebhookEnvelope::from(&job.event)).unwrap_or(Value::Null);
    WebhookDeliveryLog {
        id: Uuid::new_v4(),
        webhook_id: job.webhook.id,
        event_type: job.event.event_type.clone(),
        payload,
        attempt_count: 1,
        is_success: false,
        response_status: None,
        response_time_ms: 0,
        response_body: None,
        error_message: Some(error),
        created_at: Utc::now(),
    }
}
