//! Read side of the ledger
use crate::error::{AppError, Result};
use crate::models::{EmailEvent, EmailMessage};
use crate::services::{history_tooltip, project_history, StatusHistoryEntry};
use crate::store::{MailLedgerStore, MessageFilter};
use actix_web::{web, HttpResponse};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// A ledger row with its computed history
#[derive(Debug, Serialize)]
pub struct MessageView {
    #[serde(flatten)]
    pub message: EmailMessage,
    pub status_label: &'static str,
    pub history: Vec<StatusHistoryEntry>,
    pub history_tooltip: String,
}

impl From<EmailMessage> for MessageView {
    fn from(message: EmailMessage) -> Self {
        let history = project_history(&message);
        Self {
            status_label: message.status.label(),
            history_tooltip: history_tooltip(&history),
            history,
            message,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MessageListResponse {
    pub messages: Vec<MessageView>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Serialize)]
pub struct MessageDetailResponse {
    #[serde(flatten)]
    pub view: MessageView,
    pub events: Vec<EmailEvent>,
}

/// GET /api/v1/email-messages
pub async fn list_messages(
    store: web::Data<Arc<dyn MailLedgerStore>>,
    query: web::Query<MessageFilter>,
) -> Result<HttpResponse> {
    let filter = query.into_inner().clamped();
    let messages = store.list_messages(&filter).await?;

    Ok(HttpResponse::Ok().json(MessageListResponse {
        messages: messages.into_iter().map(MessageView::from).collect(),
        limit: filter.limit,
        offset: filter.offset,
    }))
}

/// GET /api/v1/email-messages/{id}
pub async fn get_message(
    store: web::Data<Arc<dyn MailLedgerStore>>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse> {
    let id = path.into_inner();
    let message = store
        .get_message(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("email message {}", id)))?;
    let events = store.events_for_message(id).await?;

    Ok(HttpResponse::Ok().json(MessageDetailResponse {
        view: MessageView::from(message),
        events,
    }))
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1/email-messages")
            .route("", web::get().to(list_messages))
            .route("/{id}", web::get().to(get_message)),
    );
}
