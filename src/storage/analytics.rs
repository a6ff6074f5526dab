use anyhow::{Result, Context};
use async_trait::async_trait;
use sqlx::{Pool, Postgres, postgres::PgPoolOptions};
use sqlx::types::Json;
use std::sync::Arc;
use tracing::debug;

use crate::cli::config::AnalyticsSettings;
use crate::crawler::stats::TaskStats;

/// Sink for per-attempt statistics rows
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatsRecorder: Send + Sync {
    async fn record(&self, stats: &TaskStats) -> Result<()>;
}

/// Connect the analytics recorder described by the settings
pub async fn connect(settings: &AnalyticsSettings) -> Result<Arc<dyn StatsRecorder>> {
    Ok(Arc::new(PostgresRecorder::new(settings).await?))
}

/// PostgreSQL implementation of StatsRecorder
pub struct PostgresRecorder {
    pool: Pool<Postgres>,
    table: String,
}

impl PostgresRecorder {
    pub async fn new(settings: &AnalyticsSettings) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&settings.connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        let recorder = Self {
            pool,
            table: settings.table.clone(),
        };
        recorder.ensure_table().await?;

        debug!("Connected to analytics database");

        Ok(recorder)
    }

    async fn ensure_table(&self) -> Result<()> {
        let query = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id BIGSERIAL PRIMARY KEY,
                url TEXT NOT NULL,
                random_identifier TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                succeeded BOOLEAN NOT NULL,
                failure_code TEXT,
                raw_trace_size BIGINT NOT NULL,
                begin_crawl TIMESTAMPTZ,
                end_storage TIMESTAMPTZ,
                timing JSONB NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
            self.table
        );

        sqlx::query(&query)
            .execute(&self.pool)
            .await
            .context(format!("Failed to create analytics table: {}", self.table))?;

        Ok(())
    }
}

#[async_trait]
impl StatsRecorder for PostgresRecorder {
    async fn record(&self, stats: &TaskStats) -> Result<()> {
        let query = format!(
            "INSERT INTO {} (url, random_identifier, attempt, succeeded, failure_code,
                             raw_trace_size, begin_crawl, end_storage, timing)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            self.table
        );

        sqlx::query(&query)
            .bind(&stats.url)
            .bind(&stats.random_identifier)
            .bind(stats.attempt as i32)
            .bind(stats.task_succeeded)
            .bind(&stats.failure_code)
            .bind(stats.raw_trace_size as i64)
            .bind(stats.timing.begin_crawl)
            .bind(stats.timing.end_storage)
            .bind(Json(&stats.timing))
            .execute(&self.pool)
            .await
            .context("Failed to record task stats")?;

        debug!("Recorded stats for {} (attempt {})", stats.url, stats.attempt);

        Ok(())
    }
}
