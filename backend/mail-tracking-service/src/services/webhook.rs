//! Provider webhook reconciliation
//!
//! One payload goes through: classify, extract correlation fields,
//! fingerprint, resolve the ledger row, store the event, apply it, and note
//! first-time milestones on the application timeline. Event storage and the
//! ledger update are one atomic step inside the store.

use super::activity::ActivityRecorder;
use crate::metrics::{observe_webhook_event, report_error};
use crate::models::{
    normalize_email, normalize_provider_message_id, EmailEventKind, NewEmailEvent,
};
use crate::store::{MailLedgerStore, MessageLookup, ReconcileOutcome};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Tried in order; the first that parses wins
const TIMESTAMP_FIELDS: [&str; 5] = ["DeliveredAt", "BouncedAt", "ReportedAt", "FirstOpen", "ReceivedAt"];

const FINGERPRINT_PLACEHOLDER: &str = "-";

/// Correlation fields pulled out of one provider payload
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderWebhook {
    pub kind: EmailEventKind,
    pub provider_message_id: Option<String>,
    pub recipient_email: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
    pub provider_event_id: Option<String>,
    pub message_stream: Option<String>,
    pub notification_id: Option<String>,
    pub application_id: Option<Uuid>,
    pub bounce_reason: Option<String>,
}

impl ProviderWebhook {
    /// `None` for record types we do not track
    pub fn parse(payload: &Value) -> Option<Self> {
        let kind = payload
            .get("RecordType")
            .and_then(Value::as_str)
            .and_then(EmailEventKind::from_record_type)?;

        let metadata = payload.get("Metadata");

        Some(Self {
            kind,
            provider_message_id: first_text(payload, &["MessageID", "MessageId"])
                .and_then(|id| normalize_provider_message_id(&id)),
            recipient_email: first_text(payload, &["Recipient", "Email"])
                .map(|email| normalize_email(&email)),
            occurred_at: TIMESTAMP_FIELDS
                .iter()
                .find_map(|field| payload.get(*field).and_then(parse_timestamp)),
            provider_event_id: first_text(payload, &["ID"]),
            message_stream: first_text(payload, &["MessageStream"]),
            notification_id: metadata.and_then(|m| first_text(m, &["notification_id"])),
            application_id: metadata
                .and_then(|m| first_text(m, &["application_id"]))
                .and_then(|id| Uuid::parse_str(&id).ok()),
            bounce_reason: first_text(payload, &["Description", "Details"]),
        })
    }

    /// SHA-256 over (kind, provider message id, recipient, occurred-at,
    /// provider event id, message stream), missing parts replaced by a
    /// placeholder. Each part is length-prefixed so no two tuples share an
    /// encoding. Hex encoded.
    pub fn fingerprint(&self) -> String {
        let occurred_at = self
            .occurred_at
            .map(|at| at.to_rfc3339_opts(SecondsFormat::AutoSi, true));
        let parts = [
            Some(self.kind.as_str()),
            self.provider_message_id.as_deref(),
            self.recipient_email.as_deref(),
            occurred_at.as_deref(),
            self.provider_event_id.as_deref(),
            self.message_stream.as_deref(),
        ];

        let mut hasher = Sha256::new();
        for part in parts {
            let part = part.unwrap_or(FINGERPRINT_PLACEHOLDER).as_bytes();
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part);
        }
        hex::encode(hasher.finalize())
    }

    /// Resolution order: provider id, then notification metadata + recipient,
    /// then application metadata + recipient.
    pub fn lookups(&self) -> Vec<MessageLookup> {
        let mut lookups = Vec::with_capacity(3);
        if let Some(id) = &self.provider_message_id {
            lookups.push(MessageLookup::ProviderMessageId(id.clone()));
        }
        if let Some(email) = &self.recipient_email {
            if let Some(notification_id) = &self.notification_id {
                lookups.push(MessageLookup::Notification {
                    notification_id: notification_id.clone(),
                    recipient_email: email.clone(),
                });
            }
            if let Some(application_id) = self.application_id {
                lookups.push(MessageLookup::Application {
                    application_id,
                    recipient_email: email.clone(),
                });
            }
        }
        lookups
    }

    fn into_new_event(self, fingerprint: String, payload: Value) -> NewEmailEvent {
        NewEmailEvent {
            fingerprint,
            kind: self.kind,
            provider_message_id: self.provider_message_id,
            recipient_email: self.recipient_email,
            occurred_at: self.occurred_at,
            payload,
        }
    }
}

/// What happened to one webhook delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Unrecognized record type
    Ignored,
    Duplicate,
    Unlinked,
    Applied {
        message_id: Uuid,
        activity_recorded: bool,
    },
    /// Processing error, already reported
    Failed,
}

pub struct WebhookReconciler {
    store: Arc<dyn MailLedgerStore>,
    activities: Arc<dyn ActivityRecorder>,
}

impl WebhookReconciler {
    pub fn new(store: Arc<dyn MailLedgerStore>, activities: Arc<dyn ActivityRecorder>) -> Self {
        Self { store, activities }
    }

    /// Never fails: errors are reported and turned into `WebhookOutcome::Failed`.
    pub async fn reconcile(&self, payload: Value) -> WebhookOutcome {
        match self.try_reconcile(payload).await {
            Ok(outcome) => outcome,
            Err(e) => {
                report_error("webhook_reconciler", &e);
                WebhookOutcome::Failed
            }
        }
    }

    async fn try_reconcile(&self, payload: Value) -> anyhow::Result<WebhookOutcome> {
        let Some(parsed) = ProviderWebhook::parse(&payload) else {
            let record_type = payload
                .get("RecordType")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("");
            debug!(record_type, "Ignoring untracked webhook record type");
            observe_webhook_event("unknown", "ignored");
            return Ok(WebhookOutcome::Ignored);
        };

        let kind = parsed.kind;
        let fingerprint = parsed.fingerprint();
        let lookups = parsed.lookups();
        let bounce_reason = parsed.bounce_reason.clone();
        let event = parsed.into_new_event(fingerprint.clone(), payload);

        let outcome = self
            .store
            .reconcile_event(event, &lookups, bounce_reason, Utc::now())
            .await?;
        observe_webhook_event(kind.as_str(), outcome.label());

        match outcome {
            ReconcileOutcome::Duplicate => {
                debug!(fingerprint = %fingerprint, kind = %kind, "Duplicate webhook event; skipping");
                Ok(WebhookOutcome::Duplicate)
            }
            ReconcileOutcome::Unlinked(event) => {
                info!(
                    event_id = %event.id,
                    kind = %kind,
                    provider_message_id = event.provider_message_id.as_deref().unwrap_or(""),
                    "Stored webhook event without a matching message"
                );
                Ok(WebhookOutcome::Unlinked)
            }
            ReconcileOutcome::Applied {
                message,
                event,
                effect,
            } => {
                info!(
                    message_id = %message.id,
                    event_id = %event.id,
                    kind = %kind,
                    status = %message.status,
                    status_changed = effect.status_changed,
                    "Applied webhook event"
                );

                let mut activity_recorded = false;
                if let (true, Some(application_id)) =
                    (effect.milestone_newly_set, message.application_id)
                {
                    let reason = match kind {
                        EmailEventKind::Bounce => message.failure_reason.clone(),
                        _ => None,
                    };
                    let metadata = serde_json::json!({
                        "email_message_id": message.id,
                        "provider_message_id": message.provider_message_id,
                        "recipient_email": message.recipient_email,
                        "subject": message.subject,
                        "occurred_at": event.occurred_at.unwrap_or(event.created_at),
                        "reason": reason,
                    });
                    match self
                        .activities
                        .record(application_id, kind.activity_type(), metadata)
                        .await
                    {
                        Ok(()) => activity_recorded = true,
                        Err(e) => report_error("activity_recorder", &e),
                    }
                }

                Ok(WebhookOutcome::Applied {
                    message_id: message.id,
                    activity_recorded,
                })
            }
        }
    }
}

/// First field holding a non-empty string or a number, rendered as text
fn first_text(value: &Value, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|field| match value.get(*field)? {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let raw = value.as_str()?.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_parse_delivery() {
        let payload = json!({
            "RecordType": "Delivery",
            "MessageID": "<pm-1>",
            "Recipient": "A@Example.com",
            "DeliveredAt": "2026-02-14T10:00:00Z",
            "MessageStream": "outbound",
            "Metadata": {"notification_id": "n-1", "application_id": "6f1c1d2e-8a4b-4c5d-9e6f-7a8b9c0d1e2f"}
        });
        let parsed = ProviderWebhook::parse(&payload).unwrap();
        assert_eq!(parsed.kind, EmailEventKind::Delivery);
        assert_eq!(parsed.provider_message_id.as_deref(), Some("pm-1"));
        assert_eq!(parsed.recipient_email.as_deref(), Some("a@example.com"));
        assert_eq!(
            parsed.occurred_at,
            Some(Utc.with_ymd_and_hms(2026, 2, 14, 10, 0, 0).unwrap())
        );
        assert_eq!(parsed.notification_id.as_deref(), Some("n-1"));
        assert!(parsed.application_id.is_some());
        assert_eq!(parsed.lookups().len(), 3);
    }

    #[test]
    fn test_unknown_record_type() {
        assert!(ProviderWebhook::parse(&json!({"RecordType": "Click"})).is_none());
        assert!(ProviderWebhook::parse(&json!({"MessageID": "pm-1"})).is_none());
    }

    #[test]
    fn test_alternate_field_names() {
        let payload = json!({
            "RecordType": "spamcomplaint",
            "MessageId": "pm-2",
            "Email": "b@example.com",
            "BouncedAt": "not a date",
            "ReportedAt": "2026-02-14T10:30:00+01:00",
            "ID": 123456
        });
        let parsed = ProviderWebhook::parse(&payload).unwrap();
        assert_eq!(parsed.kind, EmailEventKind::SpamComplaint);
        assert_eq!(parsed.provider_message_id.as_deref(), Some("pm-2"));
        assert_eq!(parsed.recipient_email.as_deref(), Some("b@example.com"));
        assert_eq!(
            parsed.occurred_at,
            Some(Utc.with_ymd_and_hms(2026, 2, 14, 9, 30, 0).unwrap())
        );
        assert_eq!(parsed.provider_event_id.as_deref(), Some("123456"));
    }

    #[test]
    fn test_open_first_open_bool_falls_through_to_received_at() {
        let payload = json!({
            "RecordType": "Open",
            "MessageID": "pm-3",
            "FirstOpen": true,
            "ReceivedAt": "2026-02-14T12:15:00Z"
        });
        let parsed = ProviderWebhook::parse(&payload).unwrap();
        assert_eq!(
            parsed.occurred_at,
            Some(Utc.with_ymd_and_hms(2026, 2, 14, 12, 15, 0).unwrap())
        );
    }

    #[test]
    fn test_naive_timestamp_is_utc() {
        let at = parse_timestamp(&json!("2026-02-14T10:00:00.5")).unwrap();
        assert_eq!(at.timestamp(), Utc.with_ymd_and_hms(2026, 2, 14, 10, 0, 0).unwrap().timestamp());
        assert!(parse_timestamp(&json!("")).is_none());
        assert!(parse_timestamp(&json!(42)).is_none());
    }

    #[test]
    fn test_fingerprint_is_deterministic_and_ignores_unrelated_fields() {
        let a = json!({"RecordType": "Open", "MessageID": "pm-1", "ReceivedAt": "2026-02-14T11:00:00Z", "UserAgent": "x"});
        let b = json!({"RecordType": "open", "MessageID": "pm-1", "ReceivedAt": "2026-02-14T11:00:00Z", "UserAgent": "y"});
        let fa = ProviderWebhook::parse(&a).unwrap().fingerprint();
        let fb = ProviderWebhook::parse(&b).unwrap().fingerprint();
        assert_eq!(fa, fb);
        assert_eq!(fa.len(), 64);
    }

    #[test]
    fn test_fingerprint_separates_distinct_events() {
        let base = json!({"RecordType": "Open", "MessageID": "pm-1", "ReceivedAt": "2026-02-14T11:00:00Z"});
        let later = json!({"RecordType": "Open", "MessageID": "pm-1", "ReceivedAt": "2026-02-14T12:15:00Z"});
        let other_id = json!({"RecordType": "Open", "MessageID": "pm-1", "ReceivedAt": "2026-02-14T11:00:00Z", "ID": 7});
        let delivery = json!({"RecordType": "Delivery", "MessageID": "pm-1", "DeliveredAt": "2026-02-14T11:00:00Z"});
        let fp = |v: &Value| ProviderWebhook::parse(v).unwrap().fingerprint();
        assert_ne!(fp(&base), fp(&later));
        assert_ne!(fp(&base), fp(&other_id));
        assert_ne!(fp(&base), fp(&delivery));
    }

    #[test]
    fn test_fingerprint_parts_do_not_run_together() {
        let split_early = json!({"RecordType": "Open", "MessageID": "pm-1|a@example.com", "Recipient": "b@example.com"});
        let split_late = json!({"RecordType": "Open", "MessageID": "pm-1", "Recipient": "a@example.com|b@example.com"});
        let fp = |v: &Value| ProviderWebhook::parse(v).unwrap().fingerprint();
        assert_ne!(fp(&split_early), fp(&split_late));
    }

    #[test]
    fn test_lookups_need_recipient_for_metadata() {
        let payload = json!({
            "RecordType": "Bounce",
            "Metadata": {"notification_id": "n-1"}
        });
        let parsed = ProviderWebhook::parse(&payload).unwrap();
        assert!(parsed.lookups().is_empty());
    }

    #[test]
    fn test_bounce_reason_prefers_description() {
        let payload = json!({
            "RecordType": "Bounce",
            "Description": "The server was unable to deliver your message",
            "Details": "smtp;550 5.1.1 user unknown"
        });
        let parsed = ProviderWebhook::parse(&payload).unwrap();
        assert_eq!(
            parsed.bounce_reason.as_deref(),
            Some("The server was unable to deliver your message")
        );
    }
}
