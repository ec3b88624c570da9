use super::{
    apply_to_resolved, MailLedgerStore, MessageFilter, MessageLookup, ReconcileOutcome,
    UpsertOutcome,
};
use crate::error::{StoreError, StoreResult};
use crate::models::{
    EmailEvent, EmailEventKind, EmailMessage, EmailStatus, NewEmailEvent, OutboundRecord,
    OutboundSignal,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

const MESSAGE_COLUMNS: &str = r#"
    id, provider_message_id, notification_id, organization_id, campaign_id,
    application_id, user_id, recipient_email, recipient_name, subject, mailer,
    provider, status, sent_at, delivered_at, first_opened_at, last_opened_at,
    bounced_at, spam_reported_at, last_event_at, failure_reason, context,
    created_at, updated_at
"#;

const EVENT_COLUMNS: &str = r#"
    id, email_message_id, fingerprint, kind, provider_message_id,
    recipient_email, occurred_at, payload, created_at
"#;

/// Ledger and event log backed by PostgreSQL
#[derive(Clone)]
pub struct PgMailLedgerStore {
    pool: PgPool,
}

impl PgMailLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Advisory locks on every lookup key, held until the transaction ends.
    /// `FOR UPDATE` locks nothing while the row is still missing; these keep
    /// concurrent creators of the same message apart. Sorted to avoid
    /// lock-order deadlocks.
    async fn lock_keys(
        tx: &mut Transaction<'_, Postgres>,
        lookups: &[MessageLookup],
    ) -> StoreResult<()> {
        let mut keys: Vec<String> = lookups.iter().map(MessageLookup::lock_key).collect();
        keys.sort();
        keys.dedup();

        for key in &keys {
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(key)
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }

    /// First row matched by `lookups`, locked until the transaction ends
    async fn lock_first(
        tx: &mut Transaction<'_, Postgres>,
        lookups: &[MessageLookup],
    ) -> StoreResult<Option<EmailMessage>> {
        for lookup in lookups {
            let row = match lookup {
                MessageLookup::ProviderMessageId(id) => {
                    sqlx::query(&format!(
                        "SELECT {MESSAGE_COLUMNS} FROM email_messages
                         WHERE provider_message_id = $1
                         LIMIT 1
                         FOR UPDATE"
                    ))
                    .bind(id)
                    .fetch_optional(&mut **tx)
                    .await?
                }
                MessageLookup::Notification {
                    notification_id,
                    recipient_email,
                } => {
                    sqlx::query(&format!(
                        "SELECT {MESSAGE_COLUMNS} FROM email_messages
                         WHERE notification_id = $1 AND recipient_email = $2
                         ORDER BY created_at DESC, id DESC
                         LIMIT 1
                         FOR UPDATE"
                    ))
                    .bind(notification_id)
                    .bind(recipient_email)
                    .fetch_optional(&mut **tx)
                    .await?
                }
                MessageLookup::Application {
                    application_id,
                    recipient_email,
                } => {
                    sqlx::query(&format!(
                        "SELECT {MESSAGE_COLUMNS} FROM email_messages
                         WHERE application_id = $1 AND recipient_email = $2
                         ORDER BY created_at DESC, id DESC
                         LIMIT 1
                         FOR UPDATE"
                    ))
                    .bind(application_id)
                    .bind(recipient_email)
                    .fetch_optional(&mut **tx)
                    .await?
                }
            };

            if let Some(row) = row {
                debug!(lookup = lookup.describe(), "Resolved email message");
                return message_from_row(&row).map(Some);
            }
        }
        Ok(None)
    }

    async fn insert_message(
        tx: &mut Transaction<'_, Postgres>,
        message: &EmailMessage,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO email_messages (
                id, provider_message_id, notification_id, organization_id, campaign_id,
                application_id, user_id, recipient_email, recipient_name, subject, mailer,
                provider, status, sent_at, delivered_at, first_opened_at, last_opened_at,
                bounced_at, spam_reported_at, last_event_at, failure_reason, context,
                created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                $17, $18, $19, $20, $21, $22, $23, $24
            )
            "#,
        )
        .bind(message.id)
        .bind(&message.provider_message_id)
        .bind(&message.notification_id)
        .bind(message.organization_id)
        .bind(message.campaign_id)
        .bind(message.application_id)
        .bind(message.user_id)
        .bind(&message.recipient_email)
        .bind(&message.recipient_name)
        .bind(&message.subject)
        .bind(&message.mailer)
        .bind(&message.provider)
        .bind(message.status.as_str())
        .bind(message.sent_at)
        .bind(message.delivered_at)
        .bind(message.first_opened_at)
        .bind(message.last_opened_at)
        .bind(message.bounced_at)
        .bind(message.spam_reported_at)
        .bind(message.last_event_at)
        .bind(&message.failure_reason)
        .bind(&message.context)
        .bind(message.created_at)
        .bind(message.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn update_message(
        tx: &mut Transaction<'_, Postgres>,
        message: &EmailMessage,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE email_messages SET
                provider_message_id = $2,
                notification_id = $3,
                organization_id = $4,
                campaign_id = $5,
                application_id = $6,
                user_id = $7,
                recipient_email = $8,
                recipient_name = $9,
                subject = $10,
                mailer = $11,
                provider = $12,
                status = $13,
                sent_at = $14,
                delivered_at = $15,
                first_opened_at = $16,
                last_opened_at = $17,
                bounced_at = $18,
                spam_reported_at = $19,
                last_event_at = $20,
                failure_reason = $21,
                context = $22,
                updated_at = $23
            WHERE id = $1
            "#,
        )
        .bind(message.id)
        .bind(&message.provider_message_id)
        .bind(&message.notification_id)
        .bind(message.organization_id)
        .bind(message.campaign_id)
        .bind(message.application_id)
        .bind(message.user_id)
        .bind(&message.recipient_email)
        .bind(&message.recipient_name)
        .bind(&message.subject)
        .bind(&message.mailer)
        .bind(&message.provider)
        .bind(message.status.as_str())
        .bind(message.sent_at)
        .bind(message.delivered_at)
        .bind(message.first_opened_at)
        .bind(message.last_opened_at)
        .bind(message.bounced_at)
        .bind(message.spam_reported_at)
        .bind(message.last_event_at)
        .bind(&message.failure_reason)
        .bind(&message.context)
        .bind(message.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// `None` when the fingerprint is already taken
    async fn insert_event(
        tx: &mut Transaction<'_, Postgres>,
        event: &EmailEvent,
    ) -> StoreResult<Option<EmailEvent>> {
        let row = sqlx::query(&format!(
            "INSERT INTO email_events (
                id, email_message_id, fingerprint, kind, provider_message_id,
                recipient_email, occurred_at, payload, created_at
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (fingerprint) DO NOTHING
             RETURNING {EVENT_COLUMNS}"
        ))
        .bind(event.id)
        .bind(event.email_message_id)
        .bind(&event.fingerprint)
        .bind(event.kind.as_str())
        .bind(&event.provider_message_id)
        .bind(&event.recipient_email)
        .bind(event.occurred_at)
        .bind(&event.payload)
        .bind(event.created_at)
        .fetch_optional(&mut **tx)
        .await?;

        row.as_ref().map(event_from_row).transpose()
    }
}

#[async_trait]
impl MailLedgerStore for PgMailLedgerStore {
    async fn record_outbound(
        &self,
        lookups: &[MessageLookup],
        signal: OutboundSignal,
        record: OutboundRecord,
        now: DateTime<Utc>,
    ) -> StoreResult<UpsertOutcome> {
        let mut tx = self.pool.begin().await?;

        Self::lock_keys(&mut tx, lookups).await?;
        let existing = Self::lock_first(&mut tx, lookups).await?;
        let (message, created) = EmailMessage::apply_outbound(existing, signal, record, now);

        if created {
            Self::insert_message(&mut tx, &message).await?;
        } else {
            Self::update_message(&mut tx, &message).await?;
        }
        tx.commit().await?;

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
        // provider retries stop here, before any row lock
        let seen: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM email_events WHERE fingerprint = $1)")
                .bind(&event.fingerprint)
                .fetch_one(&self.pool)
                .await?;
        if seen {
            return Ok(ReconcileOutcome::Duplicate);
        }

        let mut tx = self.pool.begin().await?;

        let Some(mut message) = Self::lock_first(&mut tx, lookups).await? else {
            let candidate = event.into_event(None, received_at);
            return match Self::insert_event(&mut tx, &candidate).await? {
                Some(stored) => {
                    tx.commit().await?;
                    Ok(ReconcileOutcome::Unlinked(stored))
                }
                None => Ok(ReconcileOutcome::Duplicate),
            };
        };

        let effect = apply_to_resolved(&mut message, &event, bounce_reason.as_deref(), received_at);
        let candidate = event.into_event(Some(message.id), received_at);

        // A concurrent delivery of the same event won the insert: dropping the
        // transaction rolls back the backfill as well.
        let Some(stored) = Self::insert_event(&mut tx, &candidate).await? else {
            return Ok(ReconcileOutcome::Duplicate);
        };

        Self::update_message(&mut tx, &message).await?;
        tx.commit().await?;

        Ok(ReconcileOutcome::Applied {
            message,
            event: stored,
            effect,
        })
    }

    async fn get_message(&self, id: Uuid) -> StoreResult<Option<EmailMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM email_messages WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(message_from_row).transpose()
    }

    async fn list_messages(&self, filter: &MessageFilter) -> StoreResult<Vec<EmailMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM email_messages m
             WHERE ($1::text IS NULL OR m.status = $1)
               AND ($2::uuid IS NULL OR m.organization_id = $2)
               AND ($3::timestamptz IS NULL OR m.created_at >= $3)
               AND ($4::timestamptz IS NULL OR m.created_at < $4)
               AND ($5::text IS NULL OR EXISTS (
                    SELECT 1 FROM email_events e
                    WHERE e.email_message_id = m.id AND e.kind = $5
               ))
             ORDER BY m.created_at DESC, m.id DESC
             LIMIT $6 OFFSET $7"
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.organization_id)
        .bind(filter.from)
        .bind(filter.to)
        .bind(filter.event_kind.map(|k| k.as_str()))
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(message_from_row).collect()
    }

    async fn events_for_message(&self, message_id: Uuid) -> StoreResult<Vec<EmailEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM email_events
             WHERE email_message_id = $1
             ORDER BY created_at ASC"
        ))
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(event_from_row).collect()
    }

    async fn find_event(&self, fingerprint: &str) -> StoreResult<Option<EmailEvent>> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM email_events WHERE fingerprint = $1"
        ))
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(event_from_row).transpose()
    }
}

fn message_from_row(row: &PgRow) -> StoreResult<EmailMessage> {
    let status: String = row.try_get("status")?;
    Ok(EmailMessage {
        id: row.try_get("id")?,
        provider_message_id: row.try_get("provider_message_id")?,
        notification_id: row.try_get("notification_id")?,
        organization_id: row.try_get("organization_id")?,
        campaign_id: row.try_get("campaign_id")?,
        application_id: row.try_get("application_id")?,
        user_id: row.try_get("user_id")?,
        recipient_email: row.try_get("recipient_email")?,
        recipient_name: row.try_get("recipient_name")?,
        subject: row.try_get("subject")?,
        mailer: row.try_get("mailer")?,
        provider: row.try_get("provider")?,
        status: status.parse::<EmailStatus>().map_err(StoreError::CorruptRow)?,
        sent_at: row.try_get("sent_at")?,
        delivered_at: row.try_get("delivered_at")?,
        first_opened_at: row.try_get("first_opened_at")?,
        last_opened_at: row.try_get("last_opened_at")?,
        bounced_at: row.try_get("bounced_at")?,
        spam_reported_at: row.try_get("spam_reported_at")?,
        last_event_at: row.try_get("last_event_at")?,
        failure_reason: row.try_get("failure_reason")?,
        context: row.try_get("context")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn event_from_row(row: &PgRow) -> StoreResult<EmailEvent> {
    let kind: String = row.try_get("kind")?;
    Ok(EmailEvent {
        id: row.try_get("id")?,
        email_message_id: row.try_get("email_message_id")?,
        fingerprint: row.try_get("fingerprint")?,
        kind: kind.parse::<EmailEventKind>().map_err(StoreError::CorruptRow)?,
        provider_message_id: row.try_get("provider_message_id")?,
        recipient_email: row.try_get("recipient_email")?,
        occurred_at: row.try_get("occurred_at")?,
        payload: row.try_get("payload")?,
        created_at: row.try_get("created_at")?,
    })
}
