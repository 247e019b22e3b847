//! Postgres-backed completion sink.

use async_trait::async_trait;
use decompose_core::{CompletionRecord, CompletionSink, CoreError, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS job_completions (
    job_id       UUID PRIMARY KEY,
    kind         TEXT NOT NULL,
    status       TEXT NOT NULL,
    name         TEXT,
    container_id TEXT,
    detail       TEXT,
    failure      TEXT,
    finished_at  TIMESTAMPTZ NOT NULL,
    recorded_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const INSERT_COMPLETION: &str = r#"
INSERT INTO job_completions
    (job_id, kind, status, name, container_id, detail, failure, finished_at)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
ON CONFLICT (job_id) DO NOTHING
"#;

/// Append-only completion table. Duplicate job ids are ignored.
#[derive(Debug, Clone)]
pub struct PgCompletionSink {
    pool: PgPool,
}

impl PgCompletionSink {
    /// Connect and make sure the table exists.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(sink_error)?;
        let sink = Self::with_pool(pool);
        sink.init_schema().await?;
        Ok(sink)
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(CREATE_TABLE)
            .execute(&self.pool)
            .await
            .map_err(sink_error)?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn sink_error(e: sqlx::Error) -> CoreError {
    CoreError::Sink(e.to_string())
}

#[async_trait]
impl CompletionSink for PgCompletionSink {
    async fn record(&self, record: &CompletionRecord) -> Result<bool> {
        let result = sqlx::query(INSERT_COMPLETION)
            .bind(record.job_id.as_uuid())
            .bind(record.kind.to_string())
            .bind(record.status.to_string())
            .bind(record.name.as_deref())
            .bind(record.container_id.as_deref())
            .bind(record.detail.as_deref())
            .bind(record.failure.map(|f| f.to_string()))
            .bind(record.finished_at)
            .execute(&self.pool)
            .await
            .map_err(sink_error)?;

        let inserted = result.rows_affected() == 1;
        if !inserted {
            tracing::debug!(job_id = %record.job_id, "Completion already recorded");
        }
        Ok(inserted)
    }
}
