//! Shared wiring for the HTTP tests: in-memory store and timeline, the two
//! services on top, and the routes registered the same way `main` does.
#![allow(dead_code)]

use actix_web::{http::header, test::TestRequest, web};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, TimeZone, Utc};
use mail_tracking_service::config::{MailConfig, WebhookAuthConfig};
use mail_tracking_service::handlers::{self, InternalApiKey};
use mail_tracking_service::services::InMemoryActivityRecorder;
use mail_tracking_service::{
    EmailMessage, InMemoryMailLedgerStore, MailLedgerStore, OutboundRecord, OutboundSendRecorder,
    WebhookReconciler,
};
use std::sync::Arc;
use uuid::Uuid;

pub const WEBHOOK_USER: &str = "postmark";
pub const WEBHOOK_PASSWORD: &str = "hook-secret";
pub const WEBHOOK_PATH: &str = "/webhooks/mail-provider";

pub struct Harness {
    pub store: Arc<InMemoryMailLedgerStore>,
    pub activities: Arc<InMemoryActivityRecorder>,
    pub recorder: Arc<OutboundSendRecorder>,
    pub reconciler: Arc<WebhookReconciler>,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(InMemoryMailLedgerStore::new());
        let activities = Arc::new(InMemoryActivityRecorder::new());
        let recorder = Arc::new(OutboundSendRecorder::new(store.clone(), MailConfig::default()));
        let reconciler = Arc::new(WebhookReconciler::new(store.clone(), activities.clone()));
        Self {
            store,
            activities,
            recorder,
            reconciler,
        }
    }

    /// Register the service routes with the given webhook credentials
    pub fn configure(
        &self,
        auth: WebhookAuthConfig,
        internal_key: Option<&str>,
    ) -> impl FnOnce(&mut web::ServiceConfig) {
        let store: Arc<dyn MailLedgerStore> = self.store.clone();
        let recorder = self.recorder.clone();
        let reconciler = self.reconciler.clone();
        let internal_key = InternalApiKey(internal_key.map(str::to_string));

        move |cfg: &mut web::ServiceConfig| {
            cfg.app_data(web::Data::new(store))
                .app_data(web::Data::new(recorder))
                .app_data(web::Data::new(reconciler))
                .app_data(web::Data::new(auth))
                .app_data(web::Data::new(internal_key));
            handlers::configure(cfg);
        }
    }

    /// Seed a sent row, optionally linked to an application
    pub async fn seed_sent(
        &self,
        provider_message_id: Option<&str>,
        notification_id: Option<&str>,
        recipient: &str,
        application_id: Option<Uuid>,
    ) -> EmailMessage {
        let message = EmailMessage::from_sent(
            OutboundRecord {
                notification_id: notification_id.map(str::to_string),
                recipient_email: recipient.to_string(),
                provider_message_id: provider_message_id.map(str::to_string),
                subject: Some("Your interview is scheduled".to_string()),
                application_id,
                ..Default::default()
            },
            at(9, 0),
        );
        self.store.insert_message(message.clone()).await;
        message
    }

    pub async fn message(&self, id: Uuid) -> EmailMessage {
        self.store
            .get_message(id)
            .await
            .expect("store read")
            .expect("message exists")
    }
}

pub fn webhook_auth() -> WebhookAuthConfig {
    WebhookAuthConfig::new(WEBHOOK_USER, WEBHOOK_PASSWORD)
}

pub fn basic_auth(user: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", user, password)))
}

/// Authenticated webhook POST
pub fn webhook(body: serde_json::Value) -> TestRequest {
    TestRequest::post()
        .uri(WEBHOOK_PATH)
        .insert_header((header::AUTHORIZATION, basic_auth(WEBHOOK_USER, WEBHOOK_PASSWORD)))
        .set_json(body)
}

pub fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 14, h, m, 0).unwrap()
}
