//! # Webhook Delivery Integration Tests
//!
//! Signing, retries, timeouts, fan-out and pool fairness against wiremock
//! endpoints.

mod common;

use automation_service::config::DeliveryConfig;
use automation_service::engine::{ActionContext, ActionExecutor, Collaborators};
use automation_service::security::{sign_payload, verify_signature};
use automation_service::webhook::{DeliveryTarget, WebhookDeliveryClient};
use automation_service::config::AutomationConfig;
use automation_service::AutomationService;
use common::{eventually, test_config, RecordingCollaborator};
use crm_shared::{
    Action, ActionErrorKind, CreateWebhookRequest, DomainEvent, HttpMethod, WebhookActionConfig,
    WebhookSubscription,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_delivery() -> DeliveryConfig {
    DeliveryConfig {
        initial_backoff_ms: 10,
        max_backoff_ms: 40,
        ..DeliveryConfig::default()
    }
}

fn subscription(url: &str, events: &[&str], retry_count: u32) -> WebhookSubscription {
    let (webhook, _) = CreateWebhookRequest {
        name: "Test hook".to_string(),
        url: url.to_string(),
        events: events.iter().map(|e| e.to_string()).collect(),
        secret: None,
        method: HttpMethod::Post,
        headers: HashMap::from([("X-Tenant".to_string(), "acme".to_string())]),
        retry_count: Some(retry_count),
        timeout_seconds: Some(5),
        is_active: None,
    }
    .into_subscription()
    .unwrap();
    webhook
}

fn create_request(url: &str, events: &[&str]) -> CreateWebhookRequest {
    CreateWebhookRequest {
        name: "Pipeline".to_string(),
        url: url.to_string(),
        events: events.iter().map(|e| e.to_string()).collect(),
        secret: None,
        method: HttpMethod::Post,
        headers: HashMap::new(),
        retry_count: Some(0),
        timeout_seconds: Some(5),
        is_active: None,
    }
}

fn retrying_request(url: &str, events: &[&str], retry_count: u32) -> CreateWebhookRequest {
    CreateWebhookRequest {
        retry_count: Some(retry_count),
        ..create_request(url, events)
    }
}

async fn start_service(config: AutomationConfig) -> AutomationService {
    AutomationService::with_collaborators(config, Collaborators::uniform(RecordingCollaborator::new()))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_failing_endpoint_is_retried_then_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .expect(3)
        .mount(&server)
        .await;

    let client = WebhookDeliveryClient::new(&fast_delivery()).unwrap();
    let webhook = subscription(&format!("{}/hook", server.uri()), &["message.received"], 2);
    let target = DeliveryTarget::for_subscription(&webhook, "whsec_test".to_string());

    let outcome = client
        .deliver(&target, &DomainEvent::new("message.received", json!({"text": "hi"})))
        .await
        .unwrap();

    assert_eq!(outcome.attempt_count, 3);
    assert!(!outcome.is_success);
    assert_eq!(outcome.response_status, Some(500));
    assert_eq!(outcome.response_body.as_deref(), Some("boom"));
    assert_eq!(outcome.error_message.as_deref(), Some("HTTP 500"));
}

#[tokio::test]
async fn test_signature_matches_transmitted_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("content-type", "application/json"))
        .and(header("x-webhook-event", "contact.created"))
        .and(header("x-tenant", "acme"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = WebhookDeliveryClient::new(&fast_delivery()).unwrap();
    let webhook = subscription(&server.uri(), &["contact.created"], 3);
    let secret = "whsec_0123456789abcdef";
    let target = DeliveryTarget::for_subscription(&webhook, secret.to_string());
    let event = DomainEvent::new("contact.created", json!({"contactId": "ct-1"}));

    let outcome = client.deliver(&target, &event).await.unwrap();
    assert!(outcome.is_success);
    assert_eq!(outcome.attempt_count, 1);

    let requests = server.received_requests().await.unwrap();
    let request = &requests[0];
    let signature = request
        .headers
        .get("x-webhook-signature")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    assert!(verify_signature(secret, &request.body, &signature));
    assert_eq!(signature, sign_payload(secret, &request.body).unwrap());
    assert!(signature.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));

    let body: Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(body["eventType"], "contact.created");
    assert_eq!(body["payload"]["contactId"], "ct-1");
    assert!(body["timestamp"].is_string());
    assert_eq!(body, outcome.envelope);
}

#[tokio::test]
async fn test_recovers_after_transient_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(202).set_body_string("queued"))
        .mount(&server)
        .await;

    let client = WebhookDeliveryClient::new(&fast_delivery()).unwrap();
    let webhook = subscription(&server.uri(), &["*"], 3);
    let target = DeliveryTarget::for_subscription(&webhook, "whsec_x".to_string());

    let outcome = client
        .deliver(&target, &DomainEvent::new("tag.added", json!({})))
        .await
        .unwrap();

    assert!(outcome.is_success);
    assert_eq!(outcome.attempt_count, 2);
    assert_eq!(outcome.response_status, Some(202));
    assert!(outcome.error_message.is_none());
}

#[tokio::test]
async fn test_attempt_deadline_is_enforced() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let client = WebhookDeliveryClient::new(&fast_delivery()).unwrap();
    let target = DeliveryTarget {
        url: server.uri(),
        method: HttpMethod::Post,
        headers: HashMap::new(),
        secret: None,
        retry_count: 1,
        timeout: Duration::from_millis(200),
    };

    let outcome = client
        .deliver(&target, &DomainEvent::new("message.sent", json!({})))
        .await
        .unwrap();

    assert!(!outcome.is_success);
    assert_eq!(outcome.attempt_count, 2);
    assert_eq!(outcome.response_status, None);
    assert!(outcome.error_message.unwrap().starts_with("Timed out"));
    assert!(outcome.response_time_ms < 2_000);
}

#[tokio::test]
async fn test_webhook_action_is_a_single_unsigned_call() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/crm"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let client = Arc::new(WebhookDeliveryClient::new(&fast_delivery()).unwrap());
    let executor = ActionExecutor::new(
        Collaborators::uniform(RecordingCollaborator::new()),
        client,
        Duration::from_secs(2),
    );
    let event = DomainEvent::new("message.received", json!({}));
    let action = Action::Webhook(WebhookActionConfig {
        url: format!("{}/crm", server.uri()),
        method: HttpMethod::Put,
        headers: HashMap::new(),
    });

    let result = executor
        .execute(
            0,
            &action,
            ActionContext {
                rule_id: uuid::Uuid::new_v4(),
                event: &event,
            },
        )
        .await;

    assert!(!result.is_success());
    assert_eq!(result.error.unwrap().kind, ActionErrorKind::Delivery);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].headers.get("x-webhook-signature").is_none());
}

#[tokio::test]
async fn test_dispatch_fans_out_to_matching_subscriptions() {
    let messages = MockServer::start().await;
    let everything = MockServer::start().await;
    for server in [&messages, &everything] {
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(server)
            .await;
    }

    let service = AutomationService::with_collaborators(
        test_config(),
        Collaborators::uniform(RecordingCollaborator::new()),
    )
    .await
    .unwrap();
    let state = service.state();

    let narrow = state
        .registry
        .create(create_request(&messages.uri(), &["message.received"]))
        .unwrap();
    let wildcard = state
        .registry
        .create(create_request(&everything.uri(), &["*"]))
        .unwrap();

    let logs = state
        .dispatcher
        .dispatch(&DomainEvent::new("message.received", json!({})))
        .await
        .wait()
        .await;
    assert_eq!(logs.len(), 2);
    assert!(logs.iter().all(|log| log.is_success));

    // a type outside the catalog still reaches the wildcard subscription
    let logs = state
        .dispatcher
        .dispatch(&DomainEvent::new("invoice.paid", json!({"amount": 10})))
        .await
        .wait()
        .await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].webhook_id, wildcard.webhook.id);
    assert_eq!(logs[0].event_type, "invoice.paid");

    let narrow_stats = state.logs.stats(narrow.webhook.id).await;
    let wildcard_stats = state.logs.stats(wildcard.webhook.id).await;
    assert_eq!(narrow_stats.total_deliveries, 1);
    assert_eq!(wildcard_stats.total_deliveries, 2);
    assert_eq!(wildcard_stats.successful_deliveries, 2);

    service.stop().await;
}

#[tokio::test]
async fn test_failing_subscription_does_not_affect_others() {
    let healthy = MockServer::start().await;
    let broken = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&healthy)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&broken)
        .await;

    let service = AutomationService::with_collaborators(
        test_config(),
        Collaborators::uniform(RecordingCollaborator::new()),
    )
    .await
    .unwrap();
    let state = service.state();

    let good = state
        .registry
        .create(create_request(&healthy.uri(), &["conversation.resolved"]))
        .unwrap();
    let bad = state
        .registry
        .create(create_request(&broken.uri(), &["conversation.resolved"]))
        .unwrap();

    let logs = state
        .dispatcher
        .dispatch(&DomainEvent::new("conversation.resolved", json!({})))
        .await
        .wait()
        .await;
    assert_eq!(logs.len(), 2);

    let good_log = logs.iter().find(|l| l.webhook_id == good.webhook.id).unwrap();
    let bad_log = logs.iter().find(|l| l.webhook_id == bad.webhook.id).unwrap();
    assert!(good_log.is_success);
    assert!(!bad_log.is_success);
    assert_eq!(bad_log.attempt_count, 1);

    service.stop().await;
}

#[tokio::test]
async fn test_published_events_reach_subscribers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let service = AutomationService::with_collaborators(
        test_config(),
        Collaborators::uniform(RecordingCollaborator::new()),
    )
    .await
    .unwrap();
    let state = service.state();
    let created = state
        .registry
        .create(create_request(&server.uri(), &["tag.added"]))
        .unwrap();
    let webhook_id = created.webhook.id;

    // the trigger alias is published under its catalog name
    let event = state
        .hub
        .publish(DomainEvent::new("tag_added", json!({"tag": "vip"})))
        .unwrap();
    assert_eq!(event.event_type, "tag.added");

    let logs = eventually(|| {
        let state = state.clone();
        async move {
            let logs = state.logs.list(webhook_id, 10).await;
            (!logs.is_empty()).then_some(logs)
        }
    })
    .await
    .expect("delivery logged");

    assert!(logs[0].is_success);
    assert_eq!(logs[0].response_status, Some(204));
    assert_eq!(logs[0].payload["eventType"], "tag.added");

    service.stop().await;
}

#[tokio::test]
async fn test_send_test_delivers_a_test_event() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("x-webhook-event", "webhook.test"))
        .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
        .expect(1)
        .mount(&server)
        .await;

    let service = AutomationService::with_collaborators(
        test_config(),
        Collaborators::uniform(RecordingCollaborator::new()),
    )
    .await
    .unwrap();
    let state = service.state();
    let created = state
        .registry
        .create(create_request(&server.uri(), &["message.received"]))
        .unwrap();

    let log = state.dispatcher.send_test(created.webhook.id).await.unwrap();
    assert!(log.is_success);
    assert_eq!(log.event_type, "webhook.test");
    assert_eq!(log.response_body.as_deref(), Some("pong"));

    let requests = server.received_requests().await.unwrap();
    let signature = requests[0]
        .headers
        .get("x-webhook-signature")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(verify_signature(&created.secret, &requests[0].body, &signature));

    service.stop().await;
}

#[tokio::test]
async fn test_response_body_is_read_up_to_the_limit() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(256 * 1024)))
        .mount(&server)
        .await;

    let client = WebhookDeliveryClient::new(&DeliveryConfig {
        response_body_limit: 16,
        ..fast_delivery()
    })
    .unwrap();
    let webhook = subscription(&server.uri(), &["*"], 0);
    let target = DeliveryTarget::for_subscription(&webhook, "whsec_x".to_string());

    let outcome = client
        .deliver(&target, &DomainEvent::new("message.sent", json!({})))
        .await
        .unwrap();

    assert!(outcome.is_success);
    assert_eq!(outcome.response_body.as_deref(), Some("xxxxxxxxxxxxxxxx"));
}

// Not stopped at the end: stopping waits for the stalled attempts.
#[tokio::test]
async fn test_slow_subscription_does_not_delay_others() {
    let slow = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
        .mount(&slow)
        .await;
    let healthy = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&healthy)
        .await;

    let mut config = test_config();
    config.delivery.worker_count = 2;
    let service = start_service(config).await;
    let state = service.state();

    state
        .registry
        .create(create_request(&slow.uri(), &["message.received"]))
        .unwrap();
    let fast = state
        .registry
        .create(create_request(&healthy.uri(), &["tag.added"]))
        .unwrap();

    for _ in 0..2 {
        let pending = state
            .dispatcher
            .dispatch(&DomainEvent::new("message.received", json!({})))
            .await;
        assert_eq!(pending.matched, 1);
    }

    let started = std::time::Instant::now();
    let logs = tokio::time::timeout(
        Duration::from_secs(1),
        state
            .dispatcher
            .dispatch(&DomainEvent::new("tag.added", json!({"tag": "vip"})))
            .await
            .wait(),
    )
    .await
    .expect("healthy subscription delivered while the slow one is stalled");

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].webhook_id, fast.webhook.id);
    assert!(logs[0].is_success);
}

#[tokio::test]
async fn test_retry_backoff_does_not_hold_a_worker() {
    let broken = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&broken)
        .await;
    let healthy = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&healthy)
        .await;

    let mut config = test_config();
    config.delivery.worker_count = 1;
    config.delivery.initial_backoff_ms = 500;
    config.delivery.max_backoff_ms = 500;
    let service = start_service(config).await;
    let state = service.state();

    let failing = state
        .registry
        .create(retrying_request(&broken.uri(), &["message.received"], 2))
        .unwrap();
    state
        .registry
        .create(create_request(&healthy.uri(), &["tag.added"]))
        .unwrap();

    let failing_delivery = state
        .dispatcher
        .dispatch(&DomainEvent::new("message.received", json!({})))
        .await;

    // Only worker is free again as soon as the first attempt failed
    let logs = tokio::time::timeout(
        Duration::from_millis(400),
        state
            .dispatcher
            .dispatch(&DomainEvent::new("tag.added", json!({})))
            .await
            .wait(),
    )
    .await
    .expect("delivered during the failing subscription's backoff");
    assert!(logs[0].is_success);

    let logs = failing_delivery.wait().await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].webhook_id, failing.webhook.id);
    assert_eq!(logs[0].attempt_count, 3);
    assert!(!logs[0].is_success);
    assert_eq!(broken.received_requests().await.unwrap().len(), 3);

    service.stop().await;
}

#[tokio::test]
async fn test_attempt_count_stays_within_retry_budget() {
    let server_error = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server_error)
        .await;
    let not_found = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&not_found)
        .await;
    let refused = {
        let gone = MockServer::start().await;
        gone.uri()
    };
    let ok = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&ok)
        .await;

    let service = start_service(test_config()).await;
    let state = service.state();

    let failing_urls = [server_error.uri(), not_found.uri(), refused];
    for retry_count in [0u32, 1, 3] {
        let event_type = "conversation.created";
        let mut expected = HashMap::new();
        for url in &failing_urls {
            let created = state
                .registry
                .create(retrying_request(url, &[event_type], retry_count))
                .unwrap();
            expected.insert(created.webhook.id, false);
        }
        let succeeding = state
            .registry
            .create(retrying_request(&ok.uri(), &[event_type], retry_count))
            .unwrap();
        expected.insert(succeeding.webhook.id, true);

        let logs = state
            .dispatcher
            .dispatch(&DomainEvent::new(event_type, json!({})))
            .await
            .wait()
            .await;
        assert_eq!(logs.len(), expected.len());

        for log in &logs {
            assert!(log.attempt_count >= 1);
            assert!(log.attempt_count <= retry_count + 1);
            assert_eq!(log.is_success, expected[&log.webhook_id]);
            if log.is_success {
                assert_eq!(log.attempt_count, 1);
            } else {
                assert_eq!(log.attempt_count, retry_count + 1);
                assert!(log.error_message.is_some());
            }
        }

        // Each round gets fresh subscriptions
        for id in expected.keys() {
            state.registry.delete(*id).unwrap();
        }
    }

    service.stop().await;
}
