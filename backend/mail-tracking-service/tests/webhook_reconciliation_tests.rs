/// Provider webhook endpoint end to end against the in-memory ledger
///
/// Covers replay dedupe, monotonic status, the open window, unlinked events,
/// first-time activity notes and the two 401 paths.
mod common;

use actix_web::{http::header, http::StatusCode, test, App};
use async_trait::async_trait;
use common::*;
use mail_tracking_service::config::WebhookAuthConfig;
use mail_tracking_service::services::{
    ActivityRecorder, InMemoryActivityRecorder, ProviderWebhook, WebhookOutcome,
};
use mail_tracking_service::{EmailStatus, MailLedgerStore, WebhookReconciler};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Timeline that takes longer than the webhook acknowledgement budget
struct SlowTimeline {
    inner: Arc<InMemoryActivityRecorder>,
    delay: Duration,
}

#[async_trait]
impl ActivityRecorder for SlowTimeline {
    async fn record(
        &self,
        application_id: Uuid,
        event_type: &str,
        metadata: Value,
    ) -> anyhow::Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.record(application_id, event_type, metadata).await
    }
}

#[actix_web::test]
async fn test_delivery_updates_existing_message() {
    let h = Harness::new();
    let application_id = Uuid::new_v4();
    let seeded = h
        .seed_sent(Some("pm-1"), None, "a@example.com", Some(application_id))
        .await;
    let app = test::init_service(App::new().configure(h.configure(webhook_auth(), None))).await;

    let resp = test::call_service(
        &app,
        webhook(json!({
            "RecordType": "Delivery",
            "MessageID": "pm-1",
            "Recipient": "a@example.com",
            "DeliveredAt": "2026-02-14T10:00:00Z"
        }))
        .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body, json!({"ok": true}));

    let message = h.message(seeded.id).await;
    assert_eq!(message.status, EmailStatus::Delivered);
    assert_eq!(message.delivered_at, Some(at(10, 0)));

    let entries = h.activities.entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].event_type, "email_delivered");
    assert_eq!(entries[0].application_id, application_id);
    assert_eq!(entries[0].metadata["email_message_id"], json!(seeded.id));
}

#[actix_web::test]
async fn test_identical_payload_is_stored_once() {
    let h = Harness::new();
    let seeded = h.seed_sent(Some("pm-1"), None, "a@example.com", None).await;
    let app = test::init_service(App::new().configure(h.configure(webhook_auth(), None))).await;

    let payload = json!({
        "RecordType": "Bounce",
        "MessageID": "pm-1",
        "Recipient": "a@example.com",
        "BouncedAt": "2026-02-14T10:00:00Z",
        "Description": "Mailbox does not exist",
        "ID": 4242
    });

    for _ in 0..2 {
        let resp = test::call_service(&app, webhook(payload.clone()).to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    assert_eq!(h.store.event_count().await, 1);
    let fingerprint = ProviderWebhook::parse(&payload).expect("tracked type").fingerprint();
    let stored = h.store.find_event(&fingerprint).await.unwrap().expect("event stored");
    assert_eq!(stored.email_message_id, Some(seeded.id));

    let message = h.message(seeded.id).await;
    assert_eq!(message.status, EmailStatus::Bounced);
    assert_eq!(message.bounced_at, Some(at(10, 0)));
}

#[actix_web::test]
async fn test_two_opens_produce_one_activity_note() {
    let h = Harness::new();
    let application_id = Uuid::new_v4();
    let seeded = h
        .seed_sent(Some("pm-1"), None, "a@example.com", Some(application_id))
        .await;
    let app = test::init_service(App::new().configure(h.configure(webhook_auth(), None))).await;

    let first = json!({
        "RecordType": "Open",
        "MessageID": "pm-1",
        "Recipient": "a@example.com",
        "FirstOpen": "2026-02-14T11:00:00Z"
    });
    let second = json!({
        "RecordType": "Open",
        "MessageID": "pm-1",
        "Recipient": "a@example.com",
        "ReceivedAt": "2026-02-14T12:15:00Z"
    });
    test::call_service(&app, webhook(first).to_request()).await;
    test::call_service(&app, webhook(second).to_request()).await;

    let message = h.message(seeded.id).await;
    assert_eq!(message.status, EmailStatus::Opened);
    assert_eq!(message.first_opened_at, Some(at(11, 0)));
    assert_eq!(message.last_opened_at, Some(at(12, 15)));
    assert_eq!(h.store.event_count().await, 2);
    assert_eq!(h.activities.count_of("email_opened").await, 1);
}

#[actix_web::test]
async fn test_open_window_widens_outward() {
    let h = Harness::new();
    let seeded = h.seed_sent(Some("pm-1"), None, "a@example.com", None).await;

    for received in ["2026-02-14T12:00:00Z", "2026-02-14T11:00:00Z", "2026-02-14T13:00:00Z"] {
        h.reconciler
            .reconcile(json!({
                "RecordType": "Open",
                "MessageID": "pm-1",
                "ReceivedAt": received
            }))
            .await;
    }

    let message = h.message(seeded.id).await;
    assert_eq!(message.first_opened_at, Some(at(11, 0)));
    assert_eq!(message.last_opened_at, Some(at(13, 0)));
    assert_eq!(message.last_event_at, Some(at(13, 0)));
}

#[actix_web::test]
async fn test_bounce_then_delivery_stays_bounced() {
    let h = Harness::new();
    let seeded = h.seed_sent(Some("pm-1"), None, "a@example.com", None).await;
    let app = test::init_service(App::new().configure(h.configure(webhook_auth(), None))).await;

    test::call_service(
        &app,
        webhook(json!({
            "RecordType": "Bounce",
            "MessageID": "pm-1",
            "Recipient": "a@example.com",
            "BouncedAt": "2026-02-14T10:00:00Z",
            "Description": "The recipient mailbox is full"
        }))
        .to_request(),
    )
    .await;
    test::call_service(
        &app,
        webhook(json!({
            "RecordType": "Delivery",
            "MessageID": "pm-1",
            "Recipient": "a@example.com",
            "DeliveredAt": "2026-02-14T10:05:00Z"
        }))
        .to_request(),
    )
    .await;

    let message = h.message(seeded.id).await;
    assert_eq!(message.status, EmailStatus::Bounced);
    assert_eq!(message.failure_reason.as_deref(), Some("The recipient mailbox is full"));
    assert_eq!(message.delivered_at, Some(at(10, 5)));
}

#[actix_web::test]
async fn test_status_never_regresses_under_any_order() {
    let kinds = [
        ("Delivery", "DeliveredAt"),
        ("Open", "ReceivedAt"),
        ("Bounce", "BouncedAt"),
    ];
    let orders = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];

    for order in orders {
        let h = Harness::new();
        let seeded = h.seed_sent(Some("pm-1"), None, "a@example.com", None).await;
        for (minute, idx) in order.iter().enumerate() {
            let (record_type, field) = kinds[*idx];
            let mut payload = json!({"RecordType": record_type, "MessageID": "pm-1"});
            payload[field] = json!(at(10, minute as u32).to_rfc3339());
            h.reconciler.reconcile(payload).await;
        }
        assert_eq!(h.message(seeded.id).await.status, EmailStatus::Bounced, "order {:?}", order);
    }
}

#[actix_web::test]
async fn test_unknown_message_is_stored_unlinked() {
    let h = Harness::new();
    let app = test::init_service(App::new().configure(h.configure(webhook_auth(), None))).await;

    let resp = test::call_service(
        &app,
        webhook(json!({
            "RecordType": "Delivery",
            "MessageID": "pm-unknown-1",
            "Recipient": "nobody@example.com",
            "DeliveredAt": "2026-02-14T10:00:00Z"
        }))
        .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);

    let events = h.store.all_events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].email_message_id, None);
    assert_eq!(events[0].provider_message_id.as_deref(), Some("pm-unknown-1"));
    assert_eq!(events[0].payload["MessageID"], json!("pm-unknown-1"));
    assert_eq!(h.store.message_count().await, 0);
    assert!(h.activities.entries().await.is_empty());
}

#[actix_web::test]
async fn test_metadata_lookup_backfills_provider_id() {
    let h = Harness::new();
    let application_id = Uuid::new_v4();
    let seeded = h
        .seed_sent(None, Some("n-7"), "a@example.com", Some(application_id))
        .await;

    let outcome = h
        .reconciler
        .reconcile(json!({
            "RecordType": "Delivery",
            "MessageID": "<pm-77>",
            "Recipient": "A@Example.com",
            "DeliveredAt": "2026-02-14T10:00:00Z",
            "Metadata": {"notification_id": "n-7"}
        }))
        .await;
    assert_eq!(
        outcome,
        WebhookOutcome::Applied {
            message_id: seeded.id,
            activity_recorded: true
        }
    );

    let message = h.message(seeded.id).await;
    assert_eq!(message.provider_message_id.as_deref(), Some("pm-77"));
    assert_eq!(message.status, EmailStatus::Delivered);
}

#[actix_web::test]
async fn test_application_metadata_lookup() {
    let h = Harness::new();
    let application_id = Uuid::new_v4();
    let seeded = h
        .seed_sent(None, None, "a@example.com", Some(application_id))
        .await;

    let outcome = h
        .reconciler
        .reconcile(json!({
            "RecordType": "SpamComplaint",
            "Email": "a@example.com",
            "ReportedAt": "2026-02-14T10:00:00Z",
            "Metadata": {"application_id": application_id.to_string()}
        }))
        .await;
    assert!(matches!(outcome, WebhookOutcome::Applied { .. }));

    let message = h.message(seeded.id).await;
    assert_eq!(message.status, EmailStatus::SpamComplaint);
    assert_eq!(h.activities.count_of("email_spam_complaint").await, 1);
}

#[actix_web::test]
async fn test_unlinked_message_gets_no_activity_note() {
    let h = Harness::new();
    h.seed_sent(Some("pm-1"), None, "a@example.com", None).await;

    let outcome = h
        .reconciler
        .reconcile(json!({"RecordType": "Delivery", "MessageID": "pm-1"}))
        .await;
    assert!(matches!(
        outcome,
        WebhookOutcome::Applied {
            activity_recorded: false,
            ..
        }
    ));
    assert!(h.activities.entries().await.is_empty());
}

#[actix_web::test]
async fn test_missing_timestamp_uses_reception_time() {
    let h = Harness::new();
    let seeded = h.seed_sent(Some("pm-1"), None, "a@example.com", None).await;

    h.reconciler
        .reconcile(json!({"RecordType": "Delivery", "MessageID": "pm-1"}))
        .await;

    let message = h.message(seeded.id).await;
    assert!(message.delivered_at.is_some());
    let events = h.store.all_events().await;
    assert_eq!(events[0].occurred_at, None);
}

#[actix_web::test]
async fn test_unrecognized_and_malformed_bodies_are_acknowledged() {
    let h = Harness::new();
    let app = test::init_service(App::new().configure(h.configure(webhook_auth(), None))).await;

    let resp = test::call_service(
        &app,
        webhook(json!({"RecordType": "Click", "MessageID": "pm-1"})).to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);

    let req = test::TestRequest::post()
        .uri(WEBHOOK_PATH)
        .insert_header((header::AUTHORIZATION, basic_auth(WEBHOOK_USER, WEBHOOK_PASSWORD)))
        .insert_header((header::CONTENT_TYPE, "application/json"))
        .set_payload("{not json")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    assert_eq!(h.store.event_count().await, 0);
}

#[actix_web::test]
async fn test_bad_credentials_are_rejected() {
    let h = Harness::new();
    let app = test::init_service(App::new().configure(h.configure(webhook_auth(), None))).await;

    let req = test::TestRequest::post()
        .uri(WEBHOOK_PATH)
        .insert_header((header::AUTHORIZATION, basic_auth(WEBHOOK_USER, "wrong")))
        .set_json(json!({"RecordType": "Delivery", "MessageID": "pm-1"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert!(resp.headers().contains_key(header::WWW_AUTHENTICATE));

    let req = test::TestRequest::post()
        .uri(WEBHOOK_PATH)
        .set_json(json!({"RecordType": "Delivery", "MessageID": "pm-1"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    assert_eq!(h.store.event_count().await, 0);
}

#[actix_web::test]
async fn test_unconfigured_credentials_reject_everything() {
    let h = Harness::new();
    let app = test::init_service(
        App::new().configure(h.configure(WebhookAuthConfig::default(), None)),
    )
    .await;

    let resp = test::call_service(
        &app,
        webhook(json!({"RecordType": "Delivery", "MessageID": "pm-1"})).to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], json!("authentication_error"));
    assert_eq!(h.store.event_count().await, 0);
}

#[actix_web::test]
async fn test_activity_note_survives_acknowledgement_timeout() {
    let mut h = Harness::new();
    let application_id = Uuid::new_v4();
    let seeded = h
        .seed_sent(Some("pm-1"), None, "a@example.com", Some(application_id))
        .await;
    h.reconciler = Arc::new(WebhookReconciler::new(
        h.store.clone(),
        Arc::new(SlowTimeline {
            inner: h.activities.clone(),
            delay: Duration::from_millis(200),
        }),
    ));

    let mut auth = webhook_auth();
    auth.timeout_ms = 50;
    let app = test::init_service(App::new().configure(h.configure(auth, None))).await;

    let delivery = json!({
        "RecordType": "Delivery",
        "MessageID": "pm-1",
        "Recipient": "a@example.com",
        "DeliveredAt": "2026-02-14T10:00:00Z"
    });

    let resp = test::call_service(&app, webhook(delivery.clone()).to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(h.activities.entries().await.is_empty());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(h.message(seeded.id).await.status, EmailStatus::Delivered);
    assert_eq!(h.activities.count_of("email_delivered").await, 1);

    // the provider's retry is a duplicate and must not add a second note
    let resp = test::call_service(&app, webhook(delivery).to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.store.event_count().await, 1);
    assert_eq!(h.activities.count_of("email_delivered").await, 1);
}
