use super::{
    apply_to_resolved, MailLedgerStore, MessageFilter, MessageLookup, ReconcileOutcome,
    UpsertOutcome,
};
use crate::error::StoreResult;
use crate::models::{EmailEvent, EmailMessage, NewEmailEvent, OutboundRecord, OutboundSignal};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Ledger {
    messages: HashMap<Uuid, EmailMessage>,
    events: Vec<EmailEvent>,
}

impl Ledger {
    fn resolve(&self, lookups: &[MessageLookup]) -> Option<Uuid> {
        lookups.iter().find_map(|lookup| {
            self.messages
                .values()
                .filter(|m| lookup.matches(m))
                .max_by_key(|m| m.created_at)
                .map(|m| m.id)
        })
    }
}

/// Process-local store. Every operation holds one lock for its whole
/// duration, which serializes updates per message (and globally).
#[derive(Default)]
pub struct InMemoryMailLedgerStore {
    inner: Mutex<Ledger>,
}

impl InMemoryMailLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a row directly
    pub async fn insert_message(&self, message: EmailMessage) {
        self.inner.lock().await.messages.insert(message.id, message);
    }

    pub async fn message_count(&self) -> usize {
        self.inner.lock().await.messages.len()
    }

    pub async fn event_count(&self) -> usize {
        self.inner.lock().await.events.len()
    }

    pub async fn all_events(&self) -> Vec<EmailEvent> {
        self.inner.lock().await.events.clone()
    }
}

#[async_trait]
impl MailLedgerStore for InMemoryMailLedgerStore {
    async fn record_outbound(
        &self,
        lookups: &[MessageLookup],
        signal: OutboundSignal,
        record: OutboundRecord,
        now: DateTime<Utc>,
    ) -> StoreResult<UpsertOutcome> {
        let mut ledger = self.inner.lock().await;
        let existing = ledger
            .resolve(lookups)
            .and_then(|id| ledger.messages.get(&id).cloned());

        let (message, created) = EmailMessage::apply_outbound(existing, signal, record, now);
        ledger.messages.insert(message.id, message.clone());

        Ok(if created {
            UpsertOutcome::Created(message)
        } else {
            UpsertOutcome::Updated(message)
        })
    }

    async fn reconcile_event(
        &self,
        event: NewEmailEvent,
        lookups: &[MessageLookup],
        bounce_reason: Option<String>,
        received_at: DateTime<Utc>,
    ) -> StoreResult<ReconcileOutcome> {
        let mut ledger = self.inner.lock().await;
        if ledger
            .events
            .iter()
            .any(|e| e.fingerprint == event.fingerprint)
        {
            return Ok(ReconcileOutcome::Duplicate);
        }

        let resolved = ledger
            .resolve(lookups)
            .and_then(|id| ledger.messages.get(&id).cloned());

        match resolved {
            None => {
                let stored = event.into_event(None, received_at);
                ledger.events.push(stored.clone());
                Ok(ReconcileOutcome::Unlinked(stored))
            }
            Some(mut message) => {
                let effect =
                    apply_to_resolved(&mut message, &event, bounce_reason.as_deref(), received_at);
                let stored = event.into_event(Some(message.id), received_at);
                ledger.events.push(stored.clone());
                ledger.messages.insert(message.id, message.clone());
                Ok(ReconcileOutcome::Applied {
                    message,
                    event: stored,
                    effect,
                })
            }
        }
    }

    async fn get_message(&self, id: Uuid) -> StoreResult<Option<EmailMessage>> {
        Ok(self.inner.lock().await.messages.get(&id).cloned())
    }

    async fn list_messages(&self, filter: &MessageFilter) -> StoreResult<Vec<EmailMessage>> {
        let ledger = self.inner.lock().await;
        let mut rows: Vec<EmailMessage> = ledger
            .messages
            .values()
            .filter(|m| filter.matches(m))
            .filter(|m| match filter.event_kind {
                Some(kind) => ledger
                    .events
                    .iter()
                    .any(|e| e.email_message_id == Some(m.id) && e.kind == kind),
                None => true,
            })
            .cloned()
            .collect();

        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(rows
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .collect())
    }

    async fn events_for_message(&self, message_id: Uuid) -> StoreResult<Vec<EmailEvent>> {
        let ledger = self.inner.lock().await;
        let mut events: Vec<EmailEvent> = ledger
            .events
            .iter()
            .filter(|e| e.email_message_id == Some(message_id))
            .cloned()
            .collect();
        events.sort_by_key(|e| e.created_at);
        Ok(events)
    }

    async fn find_event(&self, fingerprint: &str) -> StoreResult<Option<EmailEvent>> {
        Ok(self
            .inner
            .lock()
            .await
            .events
            .iter()
            .find(|e| e.fingerprint == fingerprint)
            .cloned())
    }
}
