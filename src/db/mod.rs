use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Create the job table when it does not exist yet. Schema evolution proper
/// is handled by the deployment's migration tooling; this keeps local runs
/// and integration tests self-contained.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS prediction_jobs (
            id UUID PRIMARY KEY,
            status TEXT NOT NULL,
            owner_ref TEXT NOT NULL,
            input_key TEXT NOT NULL,
            output_key TEXT,
            queue_message_id UUID,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            queued_at TIMESTAMPTZ,
            started_at TIMESTAMPTZ,
            finished_at TIMESTAMPTZ,
            error_detail TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_prediction_jobs_owner
            ON prediction_jobs (owner_ref, created_at DESC)
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

pub mod queries;
