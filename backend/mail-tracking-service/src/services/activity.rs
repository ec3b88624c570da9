//! Application timeline collaborator
//!
//! The reconciler appends one entry per first-time milestone of a message
//! linked to an application.
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityEntry {
    pub application_id: Uuid,
    pub event_type: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait ActivityRecorder: Send + Sync {
    async fn record(
        &self,
        application_id: Uuid,
        event_type: &str,
        metadata: serde_json::Value,
    ) -> Result<()>;
}

/// Writes into the `application_activities` table
pub struct PgActivityRecorder {
    pool: PgPool,
}

impl PgActivityRecorder {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ActivityRecorder for PgActivityRecorder {
    async fn record(
        &self,
        application_id: Uuid,
        event_type: &str,
        metadata: serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO application_activities (id, application_id, event_type, metadata, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(application_id)
        .bind(event_type)
        .bind(&metadata)
        .execute(&self.pool)
        .await
        .context("Failed to insert application activity")?;
        Ok(())
    }
}

/// Keeps entries in memory; used by tests and database-less runs
#[derive(Default)]
pub struct InMemoryActivityRecorder {
    entries: Mutex<Vec<ActivityEntry>>,
}

impl InMemoryActivityRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<ActivityEntry> {
        self.entries.lock().await.clone()
    }

    pub async fn count_of(&self, event_type: &str) -> usize {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

#[async_trait]
impl ActivityRecorder for InMemoryActivityRecorder {
    async fn record(
        &self,
        application_id: Uuid,
        event_type: &str,
        metadata: serde_json::Value,
    ) -> Result<()> {
        self.entries.lock().await.push(ActivityEntry {
            application_id,
            event_type: event_type.to_string(),
            metadata,
            created_at: Utc::now(),
        });
        Ok(())
    }
}
