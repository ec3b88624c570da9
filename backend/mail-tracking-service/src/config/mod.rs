//! Configuration for the mail tracking service
//!
//! Everything is read from environment variables once at startup. A `.env`
//! file is honoured in debug builds.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub database: Option<DatabaseConfig>,
    pub webhook: WebhookAuthConfig,
    pub mail: MailConfig,
    pub internal_api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub env: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Static Basic-Auth credentials expected on the provider webhook.
///
/// Handlers receive this as `web::Data` and read it per request; an absent
/// username or password means the endpoint is not configured and every call
/// is rejected.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct WebhookAuthConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_ms: u64,
}

impl std::fmt::Debug for WebhookAuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookAuthConfig")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

impl WebhookAuthConfig {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
            timeout_ms: DEFAULT_WEBHOOK_TIMEOUT_MS,
        }
    }

    /// The username/password pair, when both halves are present and non-empty.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some((u, p)),
            _ => None,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.credentials().is_some()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }
}

/// Defaults stamped onto ledger rows by the send recorder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    pub provider_name: String,
    pub default_mailer: String,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            provider_name: "postmark".to_string(),
            default_mailer: "smtp".to_string(),
        }
    }
}

const DEFAULT_WEBHOOK_TIMEOUT_MS: u64 = 5_000;

impl Config {
    pub fn from_env() -> Result<Self> {
        if cfg!(debug_assertions) {
            dotenvy::dotenv().ok();
        }

        let database = match non_empty_var("DATABASE_URL") {
            Some(url) => Some(DatabaseConfig {
                url,
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .context("Invalid DATABASE_MAX_CONNECTIONS")?,
            }),
            None => None,
        };

        let defaults = MailConfig::default();

        Ok(Config {
            app: AppConfig {
                env: env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
                port: env::var("APP_PORT")
                    .unwrap_or_else(|_| "8000".to_string())
                    .parse()
                    .context("Invalid APP_PORT")?,
            },
            database,
            webhook: WebhookAuthConfig {
                username: non_empty_var("MAIL_WEBHOOK_USERNAME"),
                password: non_empty_var("MAIL_WEBHOOK_PASSWORD"),
                timeout_ms: env::var("MAIL_WEBHOOK_TIMEOUT_MS")
                    .unwrap_or_else(|_| DEFAULT_WEBHOOK_TIMEOUT_MS.to_string())
                    .parse()
                    .context("Invalid MAIL_WEBHOOK_TIMEOUT_MS")?,
            },
            mail: MailConfig {
                provider_name: non_empty_var("MAIL_PROVIDER_NAME")
                    .unwrap_or(defaults.provider_name),
                default_mailer: non_empty_var("MAIL_DEFAULT_MAILER")
                    .unwrap_or(defaults.default_mailer),
            },
            internal_api_key: non_empty_var("INTERNAL_API_KEY"),
        })
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
