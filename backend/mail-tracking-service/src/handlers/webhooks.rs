//! Provider webhook endpoint
use crate::config::WebhookAuthConfig;
use crate::error::{AuthError, Result};
use crate::metrics::report_error;
use crate::services::WebhookReconciler;
use actix_web::{http::header, web, HttpRequest, HttpResponse};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Check the `Authorization: Basic ...` header against the configured pair
pub fn verify_basic_auth(req: &HttpRequest, auth: &WebhookAuthConfig) -> std::result::Result<(), AuthError> {
    let Some((username, password)) = auth.credentials() else {
        error!("Mail webhook credentials are not configured; rejecting provider call");
        return Err(AuthError::NotConfigured);
    };

    let encoded = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Basic "))
        .ok_or(AuthError::InvalidCredentials)?;

    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|_| AuthError::InvalidCredentials)?;
    let decoded = String::from_utf8(decoded).map_err(|_| AuthError::InvalidCredentials)?;
    let (given_user, given_password) = decoded
        .split_once(':')
        .ok_or(AuthError::InvalidCredentials)?;

    // evaluate both so timing does not reveal which half matched
    let user_ok = constant_time_eq(given_user.as_bytes(), username.as_bytes());
    let password_ok = constant_time_eq(given_password.as_bytes(), password.as_bytes());
    if user_ok & password_ok {
        Ok(())
    } else {
        warn!("Rejected mail webhook call with invalid credentials");
        Err(AuthError::InvalidCredentials)
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Receive one provider event
///
/// POST /webhooks/mail-provider
pub async fn receive_provider_event(
    req: HttpRequest,
    auth: web::Data<WebhookAuthConfig>,
    reconciler: web::Data<Arc<WebhookReconciler>>,
    body: web::Bytes,
) -> Result<HttpResponse> {
    verify_basic_auth(&req, &auth)?;

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, bytes = body.len(), "Dropping malformed mail webhook body");
            return Ok(acknowledge());
        }
    };

    // Runs on its own task so a slow delivery still finishes (activity note
    // included); the timeout only bounds how long the provider waits.
    let reconciler = Arc::clone(reconciler.get_ref());
    let work = tokio::spawn(async move { reconciler.reconcile(payload).await });

    match tokio::time::timeout(auth.timeout(), work).await {
        Ok(Ok(outcome)) => debug!(outcome = ?outcome, "Mail webhook processed"),
        Ok(Err(e)) => report_error("webhook_reconciler", &e),
        Err(_) => report_error(
            "webhook_reconciler",
            &format!("processing exceeded {} ms; acknowledged before completion", auth.timeout_ms),
        ),
    }

    Ok(acknowledge())
}

fn acknowledge() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "ok": true }))
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/webhooks").route("/mail-provider", web::post().to(receive_provider_event)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    fn basic(user: &str, password: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!("{}:{}", user, password)))
    }

    #[test]
    fn test_valid_credentials() {
        let auth = WebhookAuthConfig::new("postmark", "s3cret");
        let req = TestRequest::default()
            .insert_header((header::AUTHORIZATION, basic("postmark", "s3cret")))
            .to_http_request();
        assert_eq!(verify_basic_auth(&req, &auth), Ok(()));
    }

    #[test]
    fn test_wrong_password() {
        let auth = WebhookAuthConfig::new("postmark", "s3cret");
        let req = TestRequest::default()
            .insert_header((header::AUTHORIZATION, basic("postmark", "nope")))
            .to_http_request();
        assert_eq!(verify_basic_auth(&req, &auth), Err(AuthError::InvalidCredentials));
    }

    #[test]
    fn test_missing_or_garbled_header() {
        let auth = WebhookAuthConfig::new("postmark", "s3cret");
        let req = TestRequest::default().to_http_request();
        assert_eq!(verify_basic_auth(&req, &auth), Err(AuthError::InvalidCredentials));

        let req = TestRequest::default()
            .insert_header((header::AUTHORIZATION, "Basic %%%"))
            .to_http_request();
        assert_eq!(verify_basic_auth(&req, &auth), Err(AuthError::InvalidCredentials));

        let req = TestRequest::default()
            .insert_header((header::AUTHORIZATION, "Bearer abc"))
            .to_http_request();
        assert_eq!(verify_basic_auth(&req, &auth), Err(AuthError::InvalidCredentials));
    }

    #[test]
    fn test_unconfigured_is_distinct() {
        let auth = WebhookAuthConfig::default();
        let req = TestRequest::default()
            .insert_header((header::AUTHORIZATION, basic("postmark", "s3cret")))
            .to_http_request();
        assert_eq!(verify_basic_auth(&req, &auth), Err(AuthError::NotConfigured));
    }

    #[test]
    fn test_empty_half_is_unconfigured() {
        let req = TestRequest::default()
            .insert_header((header::AUTHORIZATION, basic("postmark", "")))
            .to_http_request();
        let auth = WebhookAuthConfig::new("postmark", "");
        assert!(!auth.is_configured());
        assert_eq!(verify_basic_auth(&req, &auth), Err(AuthError::NotConfigured));

        let auth = WebhookAuthConfig::new("", "s3cret");
        assert_eq!(auth.credentials(), None);
        assert_eq!(verify_basic_auth(&req, &auth), Err(AuthError::NotConfigured));
    }

    #[test]
    fn test_password_may_contain_colon() {
        let auth = WebhookAuthConfig::new("postmark", "a:b");
        let req = TestRequest::default()
            .insert_header((header::AUTHORIZATION, basic("postmark", "a:b")))
            .to_http_request();
        assert_eq!(verify_basic_auth(&req, &auth), Ok(()));
    }
}
