use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Create jobs table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id UUID PRIMARY KEY,
            command TEXT NOT NULL,
            owner_id VARCHAR(255),
            gpu_count INTEGER NOT NULL CHECK (gpu_count >= 1),
            priority INTEGER NOT NULL,
            cwd TEXT NOT NULL,
            max_runtime_minutes INTEGER NOT NULL DEFAULT 0,
            retry_count INTEGER NOT NULL DEFAULT 0,
            exit_code INTEGER,
            state VARCHAR(20) NOT NULL,
            node_id VARCHAR(255),
            created_at TIMESTAMPTZ NOT NULL,
            queued_at TIMESTAMPTZ,
            assigned_at TIMESTAMPTZ,
            started_at TIMESTAMPTZ,
            finished_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create job events table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_events (
            id BIGSERIAL PRIMARY KEY,
            job_id UUID NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
            at TIMESTAMPTZ NOT NULL,
            from_state VARCHAR(20),
            to_state VARCHAR(20) NOT NULL,
            node_id VARCHAR(255),
            reason TEXT,
            retry_count INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes for better query performance
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at DESC)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_job_events_job_id ON job_events(job_id, id)")
        .execute(pool)
        .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
