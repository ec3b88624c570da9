use super::{EmailEventKind, EmailStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const MAX_FAILURE_REASON_LEN: usize = 1000;

/// One outbound notification attempt to one recipient (the ledger row)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub id: Uuid,

    /// Id assigned by the delivery provider, unique when present
    pub provider_message_id: Option<String>,

    /// Correlation id assigned at send time; only unique together with the recipient
    pub notification_id: Option<String>,

    pub organization_id: Option<Uuid>,
    pub campaign_id: Option<Uuid>,
    pub application_id: Option<Uuid>,
    pub user_id: Option<Uuid>,

    /// Lowercased recipient address
    pub recipient_email: Option<String>,
    pub recipient_name: Option<String>,
    pub subject: Option<String>,
    pub mailer: Option<String>,
    pub provider: Option<String>,

    pub status: EmailStatus,

    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub first_opened_at: Option<DateTime<Utc>>,
    pub last_opened_at: Option<DateTime<Utc>>,
    pub bounced_at: Option<DateTime<Utc>>,
    pub spam_reported_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,

    pub failure_reason: Option<String>,

    /// Diagnostics only (channel, notification type, ...)
    pub context: serde_json::Value,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything the send recorder learned about an attempt
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutboundRecord {
    pub notification_id: Option<String>,
    pub recipient_email: String,
    pub recipient_name: Option<String>,
    pub provider_message_id: Option<String>,
    pub subject: Option<String>,
    pub mailer: Option<String>,
    pub provider: Option<String>,
    pub organization_id: Option<Uuid>,
    pub campaign_id: Option<Uuid>,
    pub application_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub context: serde_json::Value,
}

/// Signal raised by the notification layer for one mail attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundSignal {
    Sent,
    Failed { reason: Option<String> },
}

impl OutboundSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboundSignal::Sent => "sent",
            OutboundSignal::Failed { .. } => "failed",
        }
    }
}

/// What applying one webhook event changed on a ledger row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventEffect {
    /// The milestone timestamp for this event kind was null before
    pub milestone_newly_set: bool,
    pub status_changed: bool,
}

impl EmailMessage {
    fn blank(now: DateTime<Utc>, status: EmailStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider_message_id: None,
            notification_id: None,
            organization_id: None,
            campaign_id: None,
            application_id: None,
            user_id: None,
            recipient_email: None,
            recipient_name: None,
            subject: None,
            mailer: None,
            provider: None,
            status,
            sent_at: None,
            delivered_at: None,
            first_opened_at: None,
            last_opened_at: None,
            bounced_at: None,
            spam_reported_at: None,
            last_event_at: None,
            failure_reason: None,
            context: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        }
    }

    /// Fold a send/failure signal into the matched row, or start a new one.
    /// The flag is `true` when a new row was created.
    pub fn apply_outbound(
        existing: Option<EmailMessage>,
        signal: OutboundSignal,
        record: OutboundRecord,
        now: DateTime<Utc>,
    ) -> (EmailMessage, bool) {
        match (existing, signal) {
            (Some(mut message), OutboundSignal::Sent) => {
                message.merge_sent(record, now);
                (message, false)
            }
            (Some(mut message), OutboundSignal::Failed { reason }) => {
                message.merge_failed(record, reason, now);
                (message, false)
            }
            (None, OutboundSignal::Sent) => (EmailMessage::from_sent(record, now), true),
            (None, OutboundSignal::Failed { reason }) => {
                (EmailMessage::from_failed(record, reason, now), true)
            }
        }
    }

    /// Rows matched through notification or application metadata may not know
    /// the provider id yet.
    pub fn backfill_provider_message_id(&mut self, provider_message_id: Option<&str>) -> bool {
        match (&self.provider_message_id, provider_message_id) {
            (None, Some(id)) => {
                self.provider_message_id = Some(id.to_string());
                true
            }
            _ => false,
        }
    }

    /// New row for a first "sent" signal
    pub fn from_sent(record: OutboundRecord, now: DateTime<Utc>) -> Self {
        let mut message = Self::blank(now, EmailStatus::Sent);
        message.overwrite_known_fields(record);
        message.sent_at = Some(now);
        message.last_event_at = Some(now);
        message
    }

    /// New row for a "failed" signal with no prior attempt on record
    pub fn from_failed(record: OutboundRecord, reason: Option<String>, now: DateTime<Utc>) -> Self {
        let mut message = Self::blank(now, EmailStatus::Failed);
        message.overwrite_known_fields(record);
        message.failure_reason = reason.as_deref().and_then(clean_reason);
        message.last_event_at = Some(now);
        message
    }

    /// Repeated "sent" signal for an existing row. Newly discovered non-null
    /// values replace stored ones; status never moves backwards.
    pub fn merge_sent(&mut self, record: OutboundRecord, now: DateTime<Utc>) {
        self.overwrite_known_fields(record);
        if self.sent_at.is_none() {
            self.sent_at = Some(now);
        }
        self.advance_last_event_at(now);
        if !self.status.is_past_sent() {
            self.status = EmailStatus::Sent;
        }
        self.updated_at = now;
    }

    /// "failed" signal for an existing row. Only null identity fields are
    /// filled; bounces and complaints keep their status.
    pub fn merge_failed(&mut self, record: OutboundRecord, reason: Option<String>, now: DateTime<Utc>) {
        self.fill_missing_fields(record);
        if let Some(reason) = reason.as_deref().and_then(clean_reason) {
            self.failure_reason = Some(reason);
        }
        self.advance_last_event_at(now);
        if !self.status.is_rejection() {
            self.status = EmailStatus::Failed;
        }
        self.updated_at = now;
    }

    /// Apply one reconciled provider event. `at` is the provider's occurrence
    /// time, or the reception time when the payload carried none.
    pub fn apply_event(
        &mut self,
        kind: EmailEventKind,
        at: DateTime<Utc>,
        bounce_reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> EventEffect {
        let mut effect = EventEffect::default();

        let target = kind.target_status();
        if target.outranks(self.status) {
            self.status = target;
            effect.status_changed = true;
        }

        self.advance_last_event_at(at);

        match kind {
            EmailEventKind::Delivery => {
                if self.delivered_at.is_none() {
                    self.delivered_at = Some(at);
                    effect.milestone_newly_set = true;
                }
            }
            EmailEventKind::Open => {
                match self.first_opened_at {
                    None => {
                        self.first_opened_at = Some(at);
                        effect.milestone_newly_set = true;
                    }
                    Some(first) if at < first => self.first_opened_at = Some(at),
                    Some(_) => {}
                }
                if self.last_opened_at.map_or(true, |last| at > last) {
                    self.last_opened_at = Some(at);
                }
            }
            EmailEventKind::Bounce => {
                if self.bounced_at.is_none() {
                    self.bounced_at = Some(at);
                    effect.milestone_newly_set = true;
                }
                if let Some(reason) = bounce_reason.and_then(clean_reason) {
                    self.failure_reason = Some(reason);
                }
            }
            EmailEventKind::SpamComplaint => {
                if self.spam_reported_at.is_none() {
                    self.spam_reported_at = Some(at);
                    effect.milestone_newly_set = true;
                }
            }
        }

        self.updated_at = now;
        effect
    }

    /// Forward-only
    pub fn advance_last_event_at(&mut self, at: DateTime<Utc>) {
        if self.last_event_at.map_or(true, |last| at > last) {
            self.last_event_at = Some(at);
        }
    }

    fn overwrite_known_fields(&mut self, record: OutboundRecord) {
        self.recipient_email = Some(normalize_email(&record.recipient_email));
        overwrite(&mut self.notification_id, record.notification_id);
        overwrite(&mut self.recipient_name, record.recipient_name);
        overwrite(&mut self.provider_message_id, record.provider_message_id);
        overwrite(&mut self.subject, record.subject);
        overwrite(&mut self.mailer, record.mailer);
        overwrite(&mut self.provider, record.provider);
        overwrite(&mut self.organization_id, record.organization_id);
        overwrite(&mut self.campaign_id, record.campaign_id);
        overwrite(&mut self.application_id, record.application_id);
        overwrite(&mut self.user_id, record.user_id);
        if !record.context.is_null() {
            self.context = record.context;
        }
    }

    fn fill_missing_fields(&mut self, record: OutboundRecord) {
        if self.recipient_email.is_none() {
            self.recipient_email = Some(normalize_email(&record.recipient_email));
        }
        fill(&mut self.notification_id, record.notification_id);
        fill(&mut self.recipient_name, record.recipient_name);
        fill(&mut self.subject, record.subject);
        fill(&mut self.mailer, record.mailer);
        fill(&mut self.provider, record.provider);
        fill(&mut self.organization_id, record.organization_id);
        fill(&mut self.campaign_id, record.campaign_id);
        fill(&mut self.application_id, record.application_id);
        fill(&mut self.user_id, record.user_id);
        if self.context.is_null() {
            self.context = record.context;
        }
    }
}

fn overwrite<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

fn fill<T>(slot: &mut Option<T>, value: Option<T>) {
    if slot.is_none() {
        *slot = value;
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Strip surrounding whitespace and angle brackets from a provider message id.
/// Returns `None` when nothing is left.
pub fn normalize_provider_message_id(raw: &str) -> Option<String> {
    let trimmed = raw
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn clean_reason(reason: &str) -> Option<String> {
    let reason = reason.trim();
    if reason.is_empty() {
        return None;
    }
    Some(reason.chars().take(MAX_FAILURE_REASON_LEN).collect())
}
