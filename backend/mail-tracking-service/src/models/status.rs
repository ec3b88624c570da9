use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of an outbound message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EmailStatus {
    Sent,
    Delivered,
    Opened,
    Bounced,
    SpamComplaint,
    Failed,
}

impl EmailStatus {
    pub const ALL: [EmailStatus; 6] = [
        EmailStatus::Sent,
        EmailStatus::Delivered,
        EmailStatus::Opened,
        EmailStatus::Bounced,
        EmailStatus::SpamComplaint,
        EmailStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EmailStatus::Sent => "sent",
            EmailStatus::Delivered => "delivered",
            EmailStatus::Opened => "opened",
            EmailStatus::Bounced => "bounced",
            EmailStatus::SpamComplaint => "spam_complaint",
            EmailStatus::Failed => "failed",
        }
    }

    /// Total order used by webhook reconciliation. A status only replaces
    /// another when its rank is strictly higher; bounced and spam_complaint
    /// share the top rank.
    pub fn rank(&self) -> u8 {
        match self {
            EmailStatus::Bounced | EmailStatus::SpamComplaint => 4,
            EmailStatus::Opened => 3,
            EmailStatus::Delivered => 2,
            EmailStatus::Sent => 1,
            EmailStatus::Failed => 0,
        }
    }

    pub fn outranks(&self, other: EmailStatus) -> bool {
        self.rank() > other.rank()
    }

    /// Statuses a repeated "sent" signal must not overwrite
    pub fn is_past_sent(&self) -> bool {
        matches!(
            self,
            EmailStatus::Delivered
                | EmailStatus::Opened
                | EmailStatus::Bounced
                | EmailStatus::SpamComplaint
        )
    }

    /// Statuses a "failed" signal must not overwrite
    pub fn is_rejection(&self) -> bool {
        matches!(self, EmailStatus::Bounced | EmailStatus::SpamComplaint)
    }

    pub fn label(&self) -> &'static str {
        match self {
            EmailStatus::Sent => "Sent",
            EmailStatus::Delivered => "Delivered",
            EmailStatus::Opened => "Opened",
            EmailStatus::Bounced => "Bounced",
            EmailStatus::SpamComplaint => "Marked as spam",
            EmailStatus::Failed => "Failed",
        }
    }
}

impl fmt::Display for EmailStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmailStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EmailStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown email status: {}", s))
    }
}

/// Kind of an inbound provider event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EmailEventKind {
    Delivery,
    Open,
    Bounce,
    SpamComplaint,
}

impl EmailEventKind {
    pub const ALL: [EmailEventKind; 4] = [
        EmailEventKind::Delivery,
        EmailEventKind::Open,
        EmailEventKind::Bounce,
        EmailEventKind::SpamComplaint,
    ];

    /// Map the provider's `RecordType` (case-insensitive). Unknown types yield `None`.
    pub fn from_record_type(record_type: &str) -> Option<Self> {
        match record_type.trim().to_ascii_lowercase().as_str() {
            "delivery" => Some(EmailEventKind::Delivery),
            "open" => Some(EmailEventKind::Open),
            "bounce" => Some(EmailEventKind::Bounce),
            "spamcomplaint" => Some(EmailEventKind::SpamComplaint),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EmailEventKind::Delivery => "delivery",
            EmailEventKind::Open => "open",
            EmailEventKind::Bounce => "bounce",
            EmailEventKind::SpamComplaint => "spam_complaint",
        }
    }

    /// Status this event pushes the ledger row towards
    pub fn target_status(&self) -> EmailStatus {
        match self {
            EmailEventKind::Delivery => EmailStatus::Delivered,
            EmailEventKind::Open => EmailStatus::Opened,
            EmailEventKind::Bounce => EmailStatus::Bounced,
            EmailEventKind::SpamComplaint => EmailStatus::SpamComplaint,
        }
    }

    /// Tag used for the application timeline entry
    pub fn activity_type(&self) -> &'static str {
        match self {
            EmailEventKind::Delivery => "email_delivered",
            EmailEventKind::Open => "email_opened",
            EmailEventKind::Bounce => "email_bounced",
            EmailEventKind::SpamComplaint => "email_spam_complaint",
        }
    }
}

impl fmt::Display for EmailEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmailEventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EmailEventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown email event kind: {}", s))
    }
}
