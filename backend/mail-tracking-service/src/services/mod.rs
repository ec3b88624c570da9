pub mod activity;
pub mod history;
pub mod recipient;
pub mod send_recorder;
pub mod webhook;

pub use activity::{ActivityEntry, ActivityRecorder, InMemoryActivityRecorder, PgActivityRecorder};
pub use history::{project as project_history, tooltip as history_tooltip, StatusHistoryEntry};
pub use recipient::{MailRoute, Recipient};
pub use send_recorder::{
    DomainContext, MailContent, NotificationFailed, NotificationSent, OutboundSendRecorder,
    RenderedNotification, TrackedNotification, TransportReceipt, MAIL_CHANNEL,
};
pub use webhook::{ProviderWebhook, WebhookOutcome, WebhookReconciler};
