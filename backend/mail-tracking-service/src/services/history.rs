//! Read-side projection of a ledger row into its reached milestones
use crate::models::{EmailMessage, EmailStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;

const TOOLTIP_SEPARATOR: &str = " · ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusHistoryEntry {
    pub status: EmailStatus,
    pub occurred_at: DateTime<Utc>,
    pub label: &'static str,
}

impl StatusHistoryEntry {
    fn new(status: EmailStatus, occurred_at: DateTime<Utc>) -> Self {
        Self {
            status,
            occurred_at,
            label: status.label(),
        }
    }
}

/// Milestones with a timestamp, oldest first. Equal timestamps keep the
/// sent, delivered, opened, bounced, spam order. A failed row without any
/// milestone yields a single failed entry.
pub fn project(message: &EmailMessage) -> Vec<StatusHistoryEntry> {
    let milestones = [
        (EmailStatus::Sent, message.sent_at),
        (EmailStatus::Delivered, message.delivered_at),
        (EmailStatus::Opened, message.first_opened_at),
        (EmailStatus::Bounced, message.bounced_at),
        (EmailStatus::SpamComplaint, message.spam_reported_at),
    ];

    let mut entries: Vec<StatusHistoryEntry> = milestones
        .into_iter()
        .filter_map(|(status, at)| at.map(|at| StatusHistoryEntry::new(status, at)))
        .collect();

    if entries.is_empty() && message.status == EmailStatus::Failed {
        let at = message.last_event_at.unwrap_or(message.updated_at);
        entries.push(StatusHistoryEntry::new(EmailStatus::Failed, at));
    }

    // stable sort keeps milestone order on ties
    entries.sort_by_key(|entry| entry.occurred_at);
    entries
}

/// One-line rendering, e.g. `Sent 2026-02-14 10:00 UTC · Delivered 2026-02-14 10:01 UTC`
pub fn tooltip(entries: &[StatusHistoryEntry]) -> String {
    entries
        .iter()
        .map(|entry| {
            format!(
                "{} {}",
                entry.label,
                entry.occurred_at.format("%Y-%m-%d %H:%M UTC")
            )
        })
        .collect::<Vec<_>>()
        .join(TOOLTIP_SEPARATOR)
}
