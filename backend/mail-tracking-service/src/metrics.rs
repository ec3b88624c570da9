use std::fmt::Display;
use std::time::Duration;

use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, TextEncoder};

static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "mail_tracking_http_requests_total",
            "Total HTTP requests handled by mail-tracking-service",
        ),
        &["method", "path", "status"],
    )
    .expect("failed to create mail_tracking_http_requests_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register mail_tracking_http_requests_total");
    counter
});

static HTTP_REQUEST_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let histogram = HistogramVec::new(
        HistogramOpts::new(
            "mail_tracking_http_request_duration_seconds",
            "HTTP request latency for mail-tracking-service",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
        &["method", "path", "status"],
    )
    .expect("failed to create mail_tracking_http_request_duration_seconds");
    prometheus::default_registry()
        .register(Box::new(histogram.clone()))
        .expect("failed to register mail_tracking_http_request_duration_seconds");
    histogram
});

static WEBHOOK_EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "mail_tracking_webhook_events_total",
            "Provider webhook events by kind and reconciliation outcome",
        ),
        &["kind", "outcome"],
    )
    .expect("failed to create mail_tracking_webhook_events_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register mail_tracking_webhook_events_total");
    counter
});

static OUTBOUND_RECORDS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "mail_tracking_outbound_records_total",
            "Send/failure signals recorded into the ledger",
        ),
        &["signal", "outcome"],
    )
    .expect("failed to create mail_tracking_outbound_records_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register mail_tracking_outbound_records_total");
    counter
});

static INTERNAL_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "mail_tracking_internal_errors_total",
            "Errors swallowed by the recorder and the reconciler",
        ),
        &["component"],
    )
    .expect("failed to create mail_tracking_internal_errors_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register mail_tracking_internal_errors_total");
    counter
});

pub fn observe_http_request(method: &str, path: &str, status: u16, elapsed: Duration) {
    let status_label = status.to_string();
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status_label])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path, &status_label])
        .observe(elapsed.as_secs_f64());
}

pub fn observe_webhook_event(kind: &str, outcome: &str) {
    WEBHOOK_EVENTS_TOTAL.with_label_values(&[kind, outcome]).inc();
}

pub fn observe_outbound_record(signal: &str, outcome: &str) {
    OUTBOUND_RECORDS_TOTAL
        .with_label_values(&[signal, outcome])
        .inc();
}

/// Operator-visible error channel. Recording and reconciliation never fail
/// their callers; whatever goes wrong ends up here instead.
pub fn report_error(component: &str, error: &dyn Display) {
    INTERNAL_ERRORS_TOTAL.with_label_values(&[component]).inc();
    tracing::error!(component = %component, error = %error, "mail tracking error swallowed");
}

pub fn internal_error_count(component: &str) -> u64 {
    INTERNAL_ERRORS_TOTAL.with_label_values(&[component]).get()
}

pub async fn serve_metrics() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error,
};
use futures::future::{ready, LocalBoxFuture, Ready};
use std::rc::Rc;
use std::time::Instant;

pub struct MetricsMiddleware;

impl<S, B> Transform<S, ServiceRequest> for MetricsMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = MetricsMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(MetricsMiddlewareService {
            service: Rc::new(service),
        }))
    }
}

pub struct MetricsMiddlewareService<S> {
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for MetricsMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        // route pattern keeps message ids out of the label set
        let path = req
            .match_pattern()
            .unwrap_or_else(|| req.path().to_string());
        let method = req.method().to_string();
        let start = Instant::now();

        Box::pin(async move {
            let result = service.call(req).await;
            let elapsed = start.elapsed();
            match &result {
                Ok(response) => {
                    observe_http_request(&method, &path, response.status().as_u16(), elapsed);
                }
                Err(_) => {
                    observe_http_request(&method, &path, 500, elapsed);
                }
            }
            result
        })
    }
}
