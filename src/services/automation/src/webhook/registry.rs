//! Webhook subscription registry
//!
//! Subscriptions live in a copy-on-write table like the rule store. Signing
//! secrets are kept only in encrypted form, bound to the webhook id, and
//! leave the registry in plaintext at creation, regeneration and when the
//! dispatcher needs them to sign a delivery.

use crate::error::{AutomationError, AutomationResult};
use crate::security::{generate_secret, SecretCipher};
use chrono::Utc;
use crm_shared::{
    CreateWebhookRequest, UpdateWebhookRequest, WebhookCreated, WebhookSecret, WebhookSubscription,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StoredWebhook {
    webhook: WebhookSubscription,
    /// base64(nonce || ciphertext)
    sealed_secret: String,
}

#[derive(Debug, Clone, Default)]
struct WebhookTable {
    entries: BTreeMap<u64, StoredWebhook>,
    index: HashMap<Uuid, u64>,
}

impl WebhookTable {
    fn get(&self, id: &Uuid) -> Option<&StoredWebhook> {
        self.index.get(id).and_then(|seq| self.entries.get(seq))
    }
}

pub struct WebhookRegistry {
    table: RwLock<Arc<WebhookTable>>,
    next_seq: AtomicU64,
    cipher: SecretCipher,
    secret_prefix: String,
}

impl WebhookRegistry {
    pub fn new(cipher: SecretCipher, secret_prefix: impl Into<String>) -> Self {
        Self {
            table: RwLock::new(Arc::new(WebhookTable::default())),
            next_seq: AtomicU64::new(1),
            cipher,
            secret_prefix: secret_prefix.into(),
        }
    }

    /// Register a subscription. The plaintext secret is returned only here.
    pub fn create(&self, request: CreateWebhookRequest) -> AutomationResult<WebhookCreated> {
        let (webhook, secret) = request.into_subscription()?;
        let secret = secret.unwrap_or_else(|| generate_secret(&self.secret_prefix));
        let sealed_secret = self.cipher.encrypt(&secret, webhook.id.as_bytes())?;

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        {
            let mut guard = self.table.write();
            let mut next = (**guard).clone();
            next.index.insert(webhook.id, seq);
            next.entries.insert(
                seq,
                StoredWebhook {
                    webhook: webhook.clone(),
                    sealed_secret,
                },
            );
            *guard = Arc::new(next);
        }

        info!(webhook_id = %webhook.id, events = ?webhook.events, "Webhook registered");
        Ok(WebhookCreated { webhook, secret })
    }

    pub fn get(&self, id: Uuid) -> AutomationResult<WebhookSubscription> {
        self.table
            .read()
            .get(&id)
            .map(|stored| stored.webhook.clone())
            .ok_or_else(|| not_found(id))
    }

    /// Every subscription in creation order, without secrets
    pub fn list(&self) -> Vec<WebhookSubscription> {
        let snapshot = self.table.read().clone();
        snapshot
            .entries
            .values()
            .map(|stored| stored.webhook.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.table.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn update(&self, id: Uuid, request: UpdateWebhookRequest) -> AutomationResult<WebhookSubscription> {
        let webhook = self.modify(id, |stored| {
            request.apply_to(&mut stored.webhook)?;
            Ok(())
        })?;
        info!(webhook_id = %id, "Webhook updated");
        Ok(webhook)
    }

    pub fn delete(&self, id: Uuid) -> AutomationResult<()> {
        let mut guard = self.table.write();
        let seq = guard.index.get(&id).copied().ok_or_else(|| not_found(id))?;
        let mut next = (**guard).clone();
        next.index.remove(&id);
        next.entries.remove(&seq);
        *guard = Arc::new(next);

        info!(webhook_id = %id, "Webhook deleted");
        Ok(())
    }

    /// Replace the signing secret; the new plaintext is returned only here
    pub fn regenerate_secret(&self, id: Uuid) -> AutomationResult<WebhookSecret> {
        let secret = generate_secret(&self.secret_prefix);
        let sealed_secret = self.cipher.encrypt(&secret, id.as_bytes())?;

        self.modify(id, |stored| {
            stored.sealed_secret = sealed_secret;
            stored.webhook.updated_at = Utc::now();
            Ok(())
        })?;

        info!(webhook_id = %id, "Webhook secret regenerated");
        Ok(WebhookSecret {
            webhook_id: id,
            secret,
        })
    }

    /// Active subscriptions accepting `event_type`, with their plaintext
    /// secrets. Subscriptions whose secret cannot be decrypted are skipped.
    pub fn matching(&self, event_type: &str) -> Vec<(WebhookSubscription, String)> {
        let snapshot = self.table.read().clone();
        snapshot
            .entries
            .values()
            .filter(|stored| stored.webhook.is_active && stored.webhook.accepts_event(event_type))
            .filter_map(|stored| match self.open(stored) {
                Ok(secret) => Some((stored.webhook.clone(), secret)),
                Err(e) => {
                    error!(webhook_id = %stored.webhook.id, error = %e, "Skipping webhook with unreadable secret");
                    None
                }
            })
            .collect()
    }

    /// A single subscription with its plaintext secret, active or not
    pub fn target_for(&self, id: Uuid) -> AutomationResult<(WebhookSubscription, String)> {
        let snapshot = self.table.read().clone();
        let stored = snapshot.get(&id).ok_or_else(|| not_found(id))?;
        Ok((stored.webhook.clone(), self.open(stored)?))
    }

    fn open(&self, stored: &StoredWebhook) -> AutomationResult<String> {
        self.cipher
            .decrypt(&stored.sealed_secret, stored.webhook.id.as_bytes())
    }

    fn modify<F>(&self, id: Uuid, change: F) -> AutomationResult<WebhookSubscription>
    where
        F: FnOnce(&mut StoredWebhook) -> AutomationResult<()>,
    {
        let mut guard = self.table.write();
        let seq = guard.index.get(&id).copied().ok_or_else(|| not_found(id))?;
        let mut stored = guard
            .entries
            .get(&seq)
            .cloned()
            .ok_or_else(|| AutomationError::internal(format!("Webhook index out of sync for {}", id)))?;

        change(&mut stored)?;

        let webhook = stored.webhook.clone();
        let mut next = (**guard).clone();
        next.entries.insert(seq, stored);
        *guard = Arc::new(next);
        Ok(webhook)
    }
}

fn not_found(id: Uuid) -> AutomationError {
    AutomationError::not_found(format!("Webhook {}", id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crm_shared::HttpMethod;
    use pretty_assertions::assert_eq;

    fn registry() -> WebhookRegistry {
        WebhookRegistry::new(SecretCipher::from_passphrase("test-key"), "whsec_")
    }

    fn request(events: &[&str], secret: Option<&str>) -> CreateWebhookRequest {
        CreateWebhookRequest {
            name: "CRM sync".to_string(),
            url: "https://hooks.example.com/crm".to_string(),
            events: events.iter().map(|e| e.to_string()).collect(),
            secret: secret.map(str::to_string),
            method: HttpMethod::Post,
            headers: HashMap::new(),
            retry_count: None,
            timeout_seconds: None,
            is_active: None,
        }
    }

    #[test]
    fn test_create_generates_prefixed_secret() {
        let registry = registry();
        let created = registry.create(request(&["message.received"], None)).unwrap();

        assert!(created.secret.starts_with("whsec_"));
        assert_eq!(created.webhook.retry_count, 3);
        assert_eq!(created.webhook.timeout_seconds, 30);

        let (_, secret) = registry.target_for(created.webhook.id).unwrap();
        assert_eq!(secret, created.secret);
    }

    #[test]
    fn test_read_responses_never_carry_the_secret() {
        let registry = registry();
        let created = registry
            .create(request(&["message.received"], Some("my-own-secret")))
            .unwrap();
        assert_eq!(created.secret, "my-own-secret");

        let listed = serde_json::to_string(&registry.list()).unwrap();
        let fetched = serde_json::to_string(&registry.get(created.webhook.id).unwrap()).unwrap();
        assert!(!listed.contains("my-own-secret"));
        assert!(!fetched.contains("my-own-secret"));
        assert!(!fetched.contains("secret"));
    }

    #[test]
    fn test_regenerate_secret_replaces_the_old_one() {
        let registry = registry();
        let created = registry.create(request(&["*"], None)).unwrap();

        let regenerated = registry.regenerate_secret(created.webhook.id).unwrap();
        assert_ne!(regenerated.secret, created.secret);

        let (_, secret) = registry.target_for(created.webhook.id).unwrap();
        assert_eq!(secret, regenerated.secret);
    }

    #[test]
    fn test_matching_filters_inactive_and_event_type() {
        let registry = registry();
        let messages = registry.create(request(&["message.received"], None)).unwrap();
        let wildcard = registry.create(request(&["*"], None)).unwrap();
        let paused = registry.create(request(&["message.received"], None)).unwrap();
        registry
            .update(
                paused.webhook.id,
                UpdateWebhookRequest {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();

        let matched: Vec<Uuid> = registry
            .matching("message.received")
            .into_iter()
            .map(|(webhook, _)| webhook.id)
            .collect();
        assert_eq!(matched, vec![messages.webhook.id, wildcard.webhook.id]);

        let matched: Vec<Uuid> = registry
            .matching("invoice.paid")
            .into_iter()
            .map(|(webhook, _)| webhook.id)
            .collect();
        assert_eq!(matched, vec![wildcard.webhook.id]);
    }

    #[test]
    fn test_invalid_update_leaves_subscription_untouched() {
        let registry = registry();
        let created = registry.create(request(&["message.received"], None)).unwrap();

        let result = registry.update(
            created.webhook.id,
            UpdateWebhookRequest {
                name: Some("Renamed".to_string()),
                retry_count: Some(11),
                ..Default::default()
            },
        );
        assert_eq!(result.unwrap_err().error_code(), "VALIDATION_ERROR");
        assert_eq!(registry.get(created.webhook.id).unwrap().name, "CRM sync");
    }

    #[test]
    fn test_delete() {
        let registry = registry();
        let created = registry.create(request(&["*"], None)).unwrap();
        registry.delete(created.webhook.id).unwrap();

        assert!(registry.is_empty());
        assert_eq!(
            registry.get(created.webhook.id).unwrap_err().error_code(),
            "NOT_FOUND"
        );
    }
}
