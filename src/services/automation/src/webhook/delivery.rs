//! # Webhook Delivery Client
//!
//! Sends one event to one HTTP endpoint: builds the JSON envelope, signs the
//! raw body and makes attempts with a hard deadline each. `deliver` retries
//! inline with exponential backoff; the dispatcher pool instead runs one
//! `attempt` per job and schedules the next one itself.

use crate::config::DeliveryConfig;
use crate::error::{AutomationError, AutomationResult};
use crate::security::{sign_payload, EVENT_HEADER, SIGNATURE_HEADER};
use crm_shared::{DomainEvent, HttpMethod, WebhookEnvelope, WebhookSubscription};
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use reqwest::{Client, Method};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// Headers a subscription cannot override
const RESERVED_HEADERS: [&str; 4] = ["content-type", "user-agent", "x-webhook-signature", "x-webhook-event"];

/// Exponential backoff without jitter: `min(initial * multiplier^n, max)`
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_backoff_ms),
            multiplier: config.backoff_multiplier.max(1.0),
            max: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Delay before retry `retry` (0-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let initial_ms = self.initial.as_millis() as f64;
        let max_ms = self.max.as_millis() as f64;
        let exponential = initial_ms * self.multiplier.powi(retry.min(i32::MAX as u32) as i32);
        Duration::from_millis(exponential.min(max_ms) as u64)
    }
}

/// Where and how to deliver
#[derive(Debug, Clone)]
pub struct DeliveryTarget {
    pub url: String,
    pub method: HttpMethod,
    pub headers: HashMap<String, String>,
    /// Unsigned when absent
    pub secret: Option<String>,
    /// Additional attempts after the first
    pub retry_count: u32,
    pub timeout: Duration,
}

impl DeliveryTarget {
    pub fn for_subscription(webhook: &WebhookSubscription, secret: String) -> Self {
        Self {
            url: webhook.url.clone(),
            method: webhook.method,
            headers: webhook.headers.clone(),
            secret: Some(secret),
            retry_count: webhook.retry_count,
            timeout: Duration::from_secs(webhook.timeout_seconds),
        }
    }

    /// Single unsigned attempt, used by the `webhook` rule action
    pub fn one_shot(
        url: &str,
        method: HttpMethod,
        headers: &HashMap<String, String>,
        timeout: Duration,
    ) -> Self {
        Self {
            url: url.to_string(),
            method,
            headers: headers.clone(),
            secret: None,
            retry_count: 0,
            timeout,
        }
    }
}

/// Terminal result of an attempt sequence
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryOutcome {
    /// The transmitted envelope
    pub envelope: Value,
    pub attempt_count: u32,
    pub is_success: bool,
    pub response_status: Option<u16>,
    /// Duration of the terminal attempt only
    pub response_time_ms: u64,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
}

/// Envelope, body and signature of one event for one target, built once
/// and reused by every attempt
#[derive(Debug, Clone)]
pub struct PreparedDelivery {
    pub envelope: Value,
    body: Vec<u8>,
    signature: Option<String>,
    event_type: String,
}

impl PreparedDelivery {
    /// Terminal outcome after `attempt_count` attempts ending in `last`
    pub fn into_outcome(self, attempt_count: u32, last: AttemptResult) -> DeliveryOutcome {
        DeliveryOutcome {
            envelope: self.envelope,
            attempt_count,
            is_success: last.is_success(),
            response_status: last.status,
            response_time_ms: last.elapsed.as_millis() as u64,
            response_body: last.body,
            error_message: last.error,
        }
    }
}

/// Result of a single HTTP attempt
#[derive(Debug, Clone)]
pub struct AttemptResult {
    pub status: Option<u16>,
    pub body: Option<String>,
    pub error: Option<String>,
    pub elapsed: Duration,
}

impl AttemptResult {
    pub fn is_success(&self) -> bool {
        matches!(self.status, Some(status) if (200..300).contains(&status))
    }
}

/// HTTP client for webhook delivery
#[derive(Clone)]
pub struct WebhookDeliveryClient {
    client: Client,
    backoff: BackoffPolicy,
    response_body_limit: usize,
    user_agent: String,
}

impl WebhookDeliveryClient {
    pub fn new(config: &DeliveryConfig) -> AutomationResult<Self> {
        // Deadlines are enforced per attempt, not on the client
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| AutomationError::internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            backoff: BackoffPolicy::from_config(config),
            response_body_limit: config.response_body_limit,
            user_agent: config.user_agent.clone(),
        })
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Build and sign the request body. Fails only when the envelope cannot
    /// be serialized or signed.
    pub fn prepare(&self, target: &DeliveryTarget, event: &DomainEvent) -> AutomationResult<PreparedDelivery> {
        let envelope = serde_json::to_value(WebhookEnvelope::from(event))?;
        let body = serde_json::to_vec(&envelope)?;
        let signature = match &target.secret {
            Some(secret) => Some(sign_payload(secret, &body)?),
            None => None,
        };

        Ok(PreparedDelivery {
            envelope,
            body,
            signature,
            event_type: event.event_type.clone(),
        })
    }

    /// Deliver `event` to `target`, retrying up to `target.retry_count`
    /// additional times. Errors only when the body cannot be built.
    #[instrument(skip(self, target, event), fields(event_id = %event.id, event_type = %event.event_type, url = %target.url))]
    pub async fn deliver(
        &self,
        target: &DeliveryTarget,
        event: &DomainEvent,
    ) -> AutomationResult<DeliveryOutcome> {
        let prepared = self.prepare(target, event)?;
        let max_attempts = target.retry_count.saturating_add(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let result = self.attempt(target, &prepared).await;
            let success = result.is_success();

            if success || attempt >= max_attempts {
                debug!(attempt, success, "Webhook delivery finished");
                return Ok(prepared.into_outcome(attempt, result));
            }

            let delay = self.backoff.delay_for(attempt - 1);
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = result.error.as_deref().unwrap_or_default(),
                "Webhook attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// One HTTP attempt bounded by `target.timeout`
    pub async fn attempt(&self, target: &DeliveryTarget, prepared: &PreparedDelivery) -> AttemptResult {
        let mut request = self
            .client
            .request(to_method(target.method), &target.url)
            .header(CONTENT_TYPE, "application/json")
            .header(USER_AGENT, &self.user_agent)
            .header(EVENT_HEADER, prepared.event_type.as_str());

        for (name, value) in &target.headers {
            if RESERVED_HEADERS
                .iter()
                .any(|reserved| name.eq_ignore_ascii_case(reserved))
            {
                continue;
            }
            request = request.header(name.as_str(), value.as_str());
        }

        if let Some(signature) = &prepared.signature {
            request = request.header(SIGNATURE_HEADER, signature.as_str());
        }

        let request = request.body(prepared.body.clone());
        let limit = self.response_body_limit;
        let started = Instant::now();

        let result = tokio::time::timeout(target.timeout, async {
            let mut response = request.send().await?;
            let status = response.status();
            // Stop reading once the logged prefix is complete
            let mut body = Vec::new();
            while body.len() < limit {
                match response.chunk().await? {
                    Some(chunk) => {
                        let take = chunk.len().min(limit - body.len());
                        body.extend_from_slice(&chunk[..take]);
                    }
                    None => break,
                }
            }
            Ok::<_, reqwest::Error>((status, body))
        })
        .await;

        let elapsed = started.elapsed();

        match result {
            Ok(Ok((status, body))) => AttemptResult {
                status: Some(status.as_u16()),
                body: Some(truncate_body(
                    String::from_utf8_lossy(&body).into_owned(),
                    limit,
                )),
                error: (!status.is_success()).then(|| format!("HTTP {}", status.as_u16())),
                elapsed,
            },
            Ok(Err(e)) => AttemptResult {
                status: None,
                body: None,
                error: Some(format!("Request failed: {}", e)),
                elapsed,
            },
            Err(_) => AttemptResult {
                status: None,
                body: None,
                error: Some(format!(
                    "Timed out after {} seconds",
                    target.timeout.as_secs_f64()
                )),
                elapsed,
            },
        }
    }
}

fn to_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
    }
}

/// Cut to at most `limit` bytes on a character boundary
fn truncate_body(mut body: String, limit: usize) -> String {
    if body.len() > limit {
        let mut cut = limit;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_monotonic_and_bounded() {
        let policy = BackoffPolicy {
            initial: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_millis(1_000),
        };

        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(1_000));

        let mut previous = Duration::ZERO;
        for retry in 0..20 {
            let delay = policy.delay_for(retry);
            assert!(delay >= previous);
            assert!(delay <= policy.max);
            previous = delay;
        }
    }

    #[test]
    fn test_multiplier_below_one_is_clamped() {
        let config = DeliveryConfig {
            backoff_multiplier: 0.5,
            ..DeliveryConfig::default()
        };
        assert_eq!(BackoffPolicy::from_config(&config).multiplier, 1.0);
    }

    #[test]
    fn test_truncate_body_respects_char_boundaries() {
        assert_eq!(truncate_body("short".to_string(), 10), "short");
        assert_eq!(truncate_body("abcdef".to_string(), 3), "abc");
        // "é" is two bytes
        assert_eq!(truncate_body("aé".to_string(), 2), "a");
    }

    #[test]
    fn test_one_shot_target_is_unsigned_single_attempt() {
        let target = DeliveryTarget::one_shot(
            "https://example.com/hook",
            HttpMethod::Put,
            &HashMap::new(),
            Duration::from_secs(5),
        );
        assert!(target.secret.is_none());
        assert_eq!(target.retry_count, 0);
    }
}
