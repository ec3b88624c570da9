//! Internal endpoints carrying send/failure signals from notification layers
//! that run out of process.
use crate::error::{AppError, AuthError, Result};
use crate::services::{
    MailRoute, NotificationFailed, NotificationSent, OutboundSendRecorder, RenderedNotification,
    TransportReceipt, MAIL_CHANNEL,
};
use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

pub const INTERNAL_API_KEY_HEADER: &str = "X-Internal-API-Key";

/// Shared secret for the internal endpoints; `None` leaves them open
#[derive(Debug, Clone, Default)]
pub struct InternalApiKey(pub Option<String>);

#[derive(Debug, Deserialize)]
pub struct SentSignalPayload {
    pub notifiable: MailRoute,
    #[serde(default)]
    pub notification: RenderedNotification,
    #[serde(default = "default_channel")]
    pub channel: String,
    /// Transport response, when the transport returned one
    pub response: Option<TransportReceipt>,
}

#[derive(Debug, Deserialize)]
pub struct FailedSignalPayload {
    pub notifiable: MailRoute,
    #[serde(default)]
    pub notification: RenderedNotification,
    #[serde(default = "default_channel")]
    pub channel: String,
    pub reason: Option<String>,
}

fn default_channel() -> String {
    MAIL_CHANNEL.to_string()
}

fn check_internal_key(req: &HttpRequest, key: &InternalApiKey) -> Result<()> {
    let Some(expected) = key.0.as_deref() else {
        return Ok(());
    };
    let given = req
        .headers()
        .get(INTERNAL_API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());
    if given == Some(expected) {
        Ok(())
    } else {
        Err(AppError::Unauthorized(AuthError::InvalidCredentials))
    }
}

fn accepted() -> HttpResponse {
    HttpResponse::Accepted().json(json!({ "ok": true }))
}

/// POST /internal/v1/outbound/sent
pub async fn record_sent(
    req: HttpRequest,
    key: web::Data<InternalApiKey>,
    recorder: web::Data<Arc<OutboundSendRecorder>>,
    payload: web::Json<SentSignalPayload>,
) -> Result<HttpResponse> {
    check_internal_key(&req, &key)?;
    let payload = payload.into_inner();

    recorder
        .record_sent(NotificationSent {
            notifiable: &payload.notifiable,
            notification: &payload.notification,
            channel: &payload.channel,
            response: payload.response.as_ref(),
        })
        .await;

    Ok(accepted())
}

/// POST /internal/v1/outbound/failed
pub async fn record_failed(
    req: HttpRequest,
    key: web::Data<InternalApiKey>,
    recorder: web::Data<Arc<OutboundSendRecorder>>,
    payload: web::Json<FailedSignalPayload>,
) -> Result<HttpResponse> {
    check_internal_key(&req, &key)?;
    let payload = payload.into_inner();

    recorder
        .record_failed(NotificationFailed {
            notifiable: &payload.notifiable,
            notification: &payload.notification,
            channel: &payload.channel,
            reason: payload.reason.clone(),
        })
        .await;

    Ok(accepted())
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/internal/v1/outbound")
            .route("/sent", web::post().to(record_sent))
            .route("/failed", web::post().to(record_failed)),
    );
}
