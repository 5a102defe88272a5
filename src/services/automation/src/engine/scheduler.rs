//! Scheduled trigger source
//!
//! Publishes one `automation.scheduled` event per active scheduled rule
//! whose `intervalMinutes` has elapsed since it last fired, or since it was
//! last saved when it has not fired yet.

use super::store::RuleStore;
use crate::events::EventHub;
use chrono::{DateTime, Utc};
use crm_shared::{DomainEvent, SCHEDULED_EVENT};
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct ScheduledTriggerSource {
    store: Arc<RuleStore>,
    hub: EventHub,
    tick: Duration,
    last_fired: DashMap<Uuid, DateTime<Utc>>,
}

impl ScheduledTriggerSource {
    pub fn new(store: Arc<RuleStore>, hub: EventHub, tick: Duration) -> Self {
        Self {
            store,
            hub,
            tick,
            last_fired: DashMap::new(),
        }
    }

    /// Publish events for every rule due at `now`; returns how many were
    /// published
    pub fn tick(&self, now: DateTime<Utc>) -> usize {
        let rules = self.store.active_scheduled();
        self.last_fired
            .retain(|id, _| rules.iter().any(|rule| rule.id == *id));

        let mut published = 0;
        for rule in rules {
            let Some(minutes) = rule.interval_minutes() else {
                continue;
            };
            let since = self
                .last_fired
                .get(&rule.id)
                .map(|fired| *fired)
                .unwrap_or(rule.updated_at);

            let due = match (now - since).to_std() {
                Ok(elapsed) => elapsed >= Duration::from_secs(minutes.saturating_mul(60)),
                Err(_) => false,
            };
            if !due {
                continue;
            }

            let event = DomainEvent::new(
                SCHEDULED_EVENT,
                json!({
                    "ruleId": rule.id.to_string(),
                    "ruleName": rule.name,
                    "scheduledAt": now,
                }),
            );

            match self.hub.publish(event) {
                Ok(_) => {
                    self.last_fired.insert(rule.id, now);
                    published += 1;
                    debug!(rule_id = %rule.id, "Scheduled rule fired");
                }
                Err(e) => warn!(rule_id = %rule.id, error = %e, "Failed to publish scheduled event"),
            }
        }
        published
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(tick_seconds = self.tick.as_secs(), "Scheduled trigger source started");

        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.tick(Utc::now());
                }
            }
        }

        info!("Scheduled trigger source stopped");
    }
}
