//! Outbound send recorder
//!
//! Turns "notification sent" / "notification failed" signals from the
//! notification layer into ledger rows. Recording is a side channel: it never
//! returns an error to the sender, whatever happens here is reported and
//! swallowed.

use super::recipient::{MailRoute, Recipient};
use crate::config::MailConfig;
use crate::error::StoreResult;
use crate::metrics::{observe_outbound_record, report_error};
use crate::models::{normalize_provider_message_id, OutboundRecord, OutboundSignal};
use crate::store::{MailLedgerStore, MessageLookup, UpsertOutcome};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Only this channel is tracked
pub const MAIL_CHANNEL: &str = "mail";

/// Rendered mail capability of a notification
pub trait MailContent {
    fn subject(&self) -> Option<String>;

    fn mailer(&self) -> Option<String> {
        None
    }
}

/// Domain ids a notification may carry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainContext {
    pub organization_id: Option<Uuid>,
    pub campaign_id: Option<Uuid>,
    pub application_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
}

/// A notification as seen by the recorder
pub trait TrackedNotification: Send + Sync {
    /// Correlation id assigned at send time
    fn notification_id(&self) -> Option<String>;

    fn notification_type(&self) -> String;

    fn domain_context(&self) -> DomainContext {
        DomainContext::default()
    }

    /// Render the mail representation. `Ok(None)` means the notification has
    /// no mail form; an error is an introspection failure and degrades to
    /// null subject and the default mailer.
    fn to_mail(&self) -> anyhow::Result<Option<Box<dyn MailContent + '_>>> {
        Ok(None)
    }
}

/// What the transport handed back after a successful send
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportReceipt {
    pub message_id: Option<String>,
}

pub struct NotificationSent<'a> {
    pub notifiable: &'a MailRoute,
    pub notification: &'a dyn TrackedNotification,
    pub channel: &'a str,
    pub response: Option<&'a TransportReceipt>,
}

pub struct NotificationFailed<'a> {
    pub notifiable: &'a MailRoute,
    pub notification: &'a dyn TrackedNotification,
    pub channel: &'a str,
    /// Message of the carried exception, if any
    pub reason: Option<String>,
}

pub struct OutboundSendRecorder {
    store: Arc<dyn MailLedgerStore>,
    mail: MailConfig,
}

impl OutboundSendRecorder {
    pub fn new(store: Arc<dyn MailLedgerStore>, mail: MailConfig) -> Self {
        Self { store, mail }
    }

    /// Returns the written row, or `None` when the signal was ignored or
    /// recording failed.
    pub async fn record_sent(&self, signal: NotificationSent<'_>) -> Option<UpsertOutcome> {
        if signal.channel != MAIL_CHANNEL {
            return None;
        }
        let Some(recipient) = signal.notifiable.resolve() else {
            debug!(route = signal.notifiable.kind(), "No usable recipient on sent signal; ignoring");
            observe_outbound_record("sent", "skipped");
            return None;
        };

        let provider_message_id = signal
            .response
            .and_then(|r| r.message_id.as_deref())
            .and_then(normalize_provider_message_id);

        let record = self.build_record(
            recipient,
            signal.notifiable,
            signal.notification,
            signal.channel,
            provider_message_id,
        );

        let mut lookups = Vec::with_capacity(2);
        if let Some(id) = &record.provider_message_id {
            lookups.push(MessageLookup::ProviderMessageId(id.clone()));
        }
        if let Some(lookup) = notification_lookup(&record) {
            lookups.push(lookup);
        }

        self.persist(OutboundSignal::Sent, &lookups, record).await
    }

    pub async fn record_failed(&self, signal: NotificationFailed<'_>) -> Option<UpsertOutcome> {
        if signal.channel != MAIL_CHANNEL {
            return None;
        }
        let Some(recipient) = signal.notifiable.resolve() else {
            debug!(route = signal.notifiable.kind(), "No usable recipient on failed signal; ignoring");
            observe_outbound_record("failed", "skipped");
            return None;
        };

        let record = self.build_record(
            recipient,
            signal.notifiable,
            signal.notification,
            signal.channel,
            None,
        );
        let lookups: Vec<MessageLookup> = notification_lookup(&record).into_iter().collect();

        self.persist(
            OutboundSignal::Failed {
                reason: signal.reason,
            },
            &lookups,
            record,
        )
        .await
    }

    async fn persist(
        &self,
        signal: OutboundSignal,
        lookups: &[MessageLookup],
        record: OutboundRecord,
    ) -> Option<UpsertOutcome> {
        let label = signal.as_str();
        let result: StoreResult<UpsertOutcome> = self
            .store
            .record_outbound(lookups, signal, record, Utc::now())
            .await;

        match result {
            Ok(outcome) => {
                let message = outcome.message();
                info!(
                    signal = label,
                    outcome = outcome.label(),
                    message_id = %message.id,
                    status = %message.status,
                    "Recorded outbound mail"
                );
                observe_outbound_record(label, outcome.label());
                Some(outcome)
            }
            Err(e) => {
                report_error("send_recorder", &e);
                None
            }
        }
    }

    fn build_record(
        &self,
        recipient: Recipient,
        route: &MailRoute,
        notification: &dyn TrackedNotification,
        channel: &str,
        provider_message_id: Option<String>,
    ) -> OutboundRecord {
        let (subject, mailer) = match notification.to_mail() {
            Ok(Some(mail)) => (
                mail.subject().filter(|s| !s.trim().is_empty()),
                mail.mailer().filter(|m| !m.trim().is_empty()),
            ),
            Ok(None) => (None, None),
            Err(e) => {
                warn!(error = %e, "Could not introspect mail message; recording without subject");
                (None, None)
            }
        };

        let ctx = notification.domain_context();
        let notification_type = notification.notification_type();

        OutboundRecord {
            notification_id: notification
                .notification_id()
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty()),
            recipient_email: recipient.email,
            recipient_name: recipient.name,
            provider_message_id,
            subject,
            mailer: Some(mailer.unwrap_or_else(|| self.mail.default_mailer.clone())),
            provider: Some(self.mail.provider_name.clone()),
            organization_id: ctx.organization_id,
            campaign_id: ctx.campaign_id,
            application_id: ctx.application_id,
            user_id: ctx.user_id,
            context: serde_json::json!({
                "channel": channel,
                "notification_type": notification_type,
                "route": route.kind(),
            }),
        }
    }
}

fn notification_lookup(record: &OutboundRecord) -> Option<MessageLookup> {
    record
        .notification_id
        .as_ref()
        .map(|notification_id| MessageLookup::Notification {
            notification_id: notification_id.clone(),
            recipient_email: record.recipient_email.clone(),
        })
}

/// Notification shape carried by the internal HTTP signal endpoints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RenderedNotification {
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub notification_type: String,
    pub subject: Option<String>,
    pub mailer: Option<String>,
    #[serde(default)]
    pub context: DomainContext,
}

impl MailContent for RenderedNotification {
    fn subject(&self) -> Option<String> {
        self.subject.clone()
    }

    fn mailer(&self) -> Option<String> {
        self.mailer.clone()
    }
}

impl TrackedNotification for RenderedNotification {
    fn notification_id(&self) -> Option<String> {
        self.id.clone()
    }

    fn notification_type(&self) -> String {
        self.notification_type.clone()
    }

    fn domain_context(&self) -> DomainContext {
        self.context
    }

    fn to_mail(&self) -> anyhow::Result<Option<Box<dyn MailContent + '_>>> {
        Ok(Some(Box::new(self.clone())))
    }
}
