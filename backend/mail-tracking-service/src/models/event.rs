use super::EmailEventKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One raw inbound provider event. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailEvent {
    pub id: Uuid,

    /// Ledger row the event was resolved against; `None` for unlinked events
    pub email_message_id: Option<Uuid>,

    /// Content-derived dedupe key, unique across the log
    pub fingerprint: String,
    pub kind: EmailEventKind,
    pub provider_message_id: Option<String>,
    pub recipient_email: Option<String>,

    /// As reported by the provider, may be absent
    pub occurred_at: Option<DateTime<Utc>>,

    /// Payload exactly as received
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Event about to be appended to the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEmailEvent {
    pub fingerprint: String,
    pub kind: EmailEventKind,
    pub provider_message_id: Option<String>,
    pub recipient_email: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
    pub payload: serde_json::Value,
}

impl NewEmailEvent {
    pub fn into_event(self, email_message_id: Option<Uuid>, now: DateTime<Utc>) -> EmailEvent {
        EmailEvent {
            id: Uuid::new_v4(),
            email_message_id,
            fingerprint: self.fingerprint,
            kind: self.kind,
            provider_message_id: self.provider_message_id,
            recipient_email: self.recipient_email,
            occurred_at: self.occurred_at,
            payload: self.payload,
            created_at: now,
        }
    }
}
