use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use mail_tracking_service::{
    handlers::{self, InternalApiKey},
    metrics,
    services::{ActivityRecorder, InMemoryActivityRecorder, PgActivityRecorder},
    Config, InMemoryMailLedgerStore, MailLedgerStore, OutboundSendRecorder, PgMailLedgerStore,
    WebhookReconciler,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    tracing::info!("Starting mail tracking service");

    let config = Config::from_env().context("Failed to load configuration")?;

    let (store, activities): (Arc<dyn MailLedgerStore>, Arc<dyn ActivityRecorder>) =
        match &config.database {
            Some(db) => {
                let pool = PgPoolOptions::new()
                    .max_connections(db.max_connections)
                    .acquire_timeout(Duration::from_secs(10))
                    .test_before_acquire(true)
                    .connect(&db.url)
                    .await
                    .context("Failed to connect to database")?;
                tracing::info!("Successfully connected to database");

                let pg_store = PgMailLedgerStore::new(pool.clone());
                pg_store
                    .run_migrations()
                    .await
                    .context("Failed to run database migrations")?;

                let store: Arc<dyn MailLedgerStore> = Arc::new(pg_store);
                let activities: Arc<dyn ActivityRecorder> = Arc::new(PgActivityRecorder::new(pool));
                (store, activities)
            }
            None => {
                tracing::warn!(
                    env = %config.app.env,
                    "DATABASE_URL is not set; using the in-memory ledger, data is lost on restart"
                );
                let store: Arc<dyn MailLedgerStore> = Arc::new(InMemoryMailLedgerStore::new());
                let activities: Arc<dyn ActivityRecorder> =
                    Arc::new(InMemoryActivityRecorder::new());
                (store, activities)
            }
        };

    if !config.webhook.is_configured() {
        tracing::error!("MAIL_WEBHOOK_USERNAME / MAIL_WEBHOOK_PASSWORD are not set; provider webhooks will be rejected");
    }

    let recorder = Arc::new(OutboundSendRecorder::new(store.clone(), config.mail.clone()));
    let reconciler = Arc::new(WebhookReconciler::new(store.clone(), activities));
    let webhook_auth = web::Data::new(config.webhook.clone());
    let internal_key = web::Data::new(InternalApiKey(config.internal_api_key.clone()));

    let addr = format!("0.0.0.0:{}", config.app.port);
    tracing::info!("Starting HTTP server on {}", addr);

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(store.clone()))
            .app_data(web::Data::new(recorder.clone()))
            .app_data(web::Data::new(reconciler.clone()))
            .app_data(webhook_auth.clone())
            .app_data(internal_key.clone())
            .wrap(middleware::Logger::default())
            .wrap(metrics::MetricsMiddleware)
            .route("/health", web::get().to(|| async { "OK" }))
            .route("/metrics", web::get().to(metrics::serve_metrics))
            .configure(handlers::configure)
    })
    .bind(&addr)
    .with_context(|| format!("Failed to bind {}", addr))?
    .run()
    .await
    .context("HTTP server error")
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,actix_web=info".into());
    let json = std::env::var("LOG_FORMAT").map_or(false, |v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
