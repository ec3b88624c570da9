//! Persistence for the message ledger and the event log
//!
//! Both implementations run every read-modify-write of a ledger row as one
//! serialized unit: the Postgres store under `SELECT ... FOR UPDATE` inside a
//! transaction (plus advisory locks on the lookup keys when the row may not
//! exist yet), the in-memory store behind a single async mutex. The
//! decisions themselves live on [`EmailMessage`] so both stores agree.

mod memory;
mod postgres;

pub use memory::InMemoryMailLedgerStore;
pub use postgres::PgMailLedgerStore;

use crate::error::StoreResult;
use crate::models::{
    EmailEvent, EmailEventKind, EmailMessage, EmailStatus, EventEffect, NewEmailEvent,
    OutboundRecord, OutboundSignal,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

/// One way of locating a ledger row. Lookups are tried in the order given;
/// pair lookups pick the most recently created match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageLookup {
    ProviderMessageId(String),
    Notification {
        notification_id: String,
        recipient_email: String,
    },
    Application {
        application_id: Uuid,
        recipient_email: String,
    },
}

impl MessageLookup {
    pub fn matches(&self, message: &EmailMessage) -> bool {
        match self {
            MessageLookup::ProviderMessageId(id) => {
                message.provider_message_id.as_deref() == Some(id.as_str())
            }
            MessageLookup::Notification {
                notification_id,
                recipient_email,
            } => {
                message.notification_id.as_deref() == Some(notification_id.as_str())
                    && message.recipient_email.as_deref() == Some(recipient_email.as_str())
            }
            MessageLookup::Application {
                application_id,
                recipient_email,
            } => {
                message.application_id == Some(*application_id)
                    && message.recipient_email.as_deref() == Some(recipient_email.as_str())
            }
        }
    }

    /// Key for the transaction-scoped advisory lock taken by writers that may
    /// create the row, so two of them never both see "no row yet".
    pub fn lock_key(&self) -> String {
        match self {
            MessageLookup::ProviderMessageId(id) => format!("email_messages:provider:{id}"),
            MessageLookup::Notification {
                notification_id,
                recipient_email,
            } => format!("email_messages:notification:{notification_id}:{recipient_email}"),
            MessageLookup::Application {
                application_id,
                recipient_email,
            } => format!("email_messages:application:{application_id}:{recipient_email}"),
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            MessageLookup::ProviderMessageId(_) => "provider_message_id",
            MessageLookup::Notification { .. } => "notification_id",
            MessageLookup::Application { .. } => "application_id",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    Created(EmailMessage),
    Updated(EmailMessage),
}

impl UpsertOutcome {
    pub fn message(&self) -> &EmailMessage {
        match self {
            UpsertOutcome::Created(m) | UpsertOutcome::Updated(m) => m,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            UpsertOutcome::Created(_) => "created",
            UpsertOutcome::Updated(_) => "updated",
        }
    }
}

/// Result of applying one webhook event
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// Fingerprint already in the log; nothing changed
    Duplicate,
    /// Stored without a ledger row
    Unlinked(EmailEvent),
    Applied {
        message: EmailMessage,
        event: EmailEvent,
        effect: EventEffect,
    },
}

impl ReconcileOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ReconcileOutcome::Duplicate => "duplicate",
            ReconcileOutcome::Unlinked(_) => "unlinked",
            ReconcileOutcome::Applied { .. } => "applied",
        }
    }
}

/// Read-side filter for the message listing
#[derive(Debug, Clone, Deserialize)]
pub struct MessageFilter {
    pub status: Option<EmailStatus>,
    pub organization_id: Option<Uuid>,
    /// Inclusive lower bound on `created_at`
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `created_at`
    pub to: Option<DateTime<Utc>>,
    /// Only messages with at least one logged event of this kind
    pub event_kind: Option<EmailEventKind>,
    #[serde(default = "MessageFilter::default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

impl Default for MessageFilter {
    fn default() -> Self {
        Self {
            status: None,
            organization_id: None,
            from: None,
            to: None,
            event_kind: None,
            limit: Self::default_limit(),
            offset: 0,
        }
    }
}

impl MessageFilter {
    pub const MAX_LIMIT: i64 = 200;

    fn default_limit() -> i64 {
        50
    }

    pub fn clamped(mut self) -> Self {
        self.limit = self.limit.clamp(1, Self::MAX_LIMIT);
        self.offset = self.offset.max(0);
        self
    }

    /// Row-level predicate, minus the event-kind join
    pub fn matches(&self, message: &EmailMessage) -> bool {
        self.status.map_or(true, |s| message.status == s)
            && self
                .organization_id
                .map_or(true, |org| message.organization_id == Some(org))
            && self.from.map_or(true, |from| message.created_at >= from)
            && self.to.map_or(true, |to| message.created_at < to)
    }
}

#[async_trait]
pub trait MailLedgerStore: Send + Sync {
    /// Lock the first row matched by `lookups`, fold the signal into it (or
    /// insert a new row) and persist.
    async fn record_outbound(
        &self,
        lookups: &[MessageLookup],
        signal: OutboundSignal,
        record: OutboundRecord,
        now: DateTime<Utc>,
    ) -> StoreResult<UpsertOutcome>;

    /// Dedupe on the fingerprint, resolve and lock the target row, append the
    /// event and apply it, all atomically. `received_at` stands in for a
    /// missing occurrence time.
    async fn reconcile_event(
        &self,
        event: NewEmailEvent,
        lookups: &[MessageLookup],
        bounce_reason: Option<String>,
        received_at: DateTime<Utc>,
    ) -> StoreResult<ReconcileOutcome>;

    async fn get_message(&self, id: Uuid) -> StoreResult<Option<EmailMessage>>;

    async fn list_messages(&self, filter: &MessageFilter) -> StoreResult<Vec<EmailMessage>>;

    /// Oldest first
    async fn events_for_message(&self, message_id: Uuid) -> StoreResult<Vec<EmailEvent>>;

    async fn find_event(&self, fingerprint: &str) -> StoreResult<Option<EmailEvent>>;
}

/// Shared by both stores: backfill and apply an event to a resolved row.
pub(crate) fn apply_to_resolved(
    message: &mut EmailMessage,
    event: &NewEmailEvent,
    bounce_reason: Option<&str>,
    received_at: DateTime<Utc>,
) -> EventEffect {
    message.backfill_provider_message_id(event.provider_message_id.as_deref());
    let at = event.occurred_at.unwrap_or(received_at);
    message.apply_event(event.kind, at, bounce_reason, received_at)
}
