//! Data model of the outbound mail ledger and the inbound event log

mod event;
mod message;
mod status;

pub use event::{EmailEvent, NewEmailEvent};
pub use message::{
    normalize_email, normalize_provider_message_id, EmailMessage, EventEffect, OutboundRecord,
    OutboundSignal,
};
pub use status::{EmailEventKind, EmailStatus};
