//! Postgres Job Store
//!
//! Handles all database operations related to jobs and their events.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_core::domain::job::{Job, JobEvent, JobState};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::{JobStore, Result, StoreError, Transition, submission_event};

const JOB_COLUMNS: &str = r#"
    id, command, owner_id, gpu_count, priority, cwd, max_runtime_minutes,
    retry_count, exit_code, state, node_id, created_at, queued_at,
    assigned_at, started_at, finished_at
"#;

/// Job store persisted in Postgres
///
/// A transition locks the job row (`SELECT ... FOR UPDATE`) for the duration
/// of its transaction, which serializes concurrent swaps on the same job.
pub struct PgJobStore {
    pool: PgPool,
    retry_limit: u32,
}

impl PgJobStore {
    pub fn new(pool: PgPool, retry_limit: u32) -> Self {
        Self { pool, retry_limit }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: Job) -> Result<JobEvent> {
        job.check_invariants(self.retry_limit)
            .map_err(StoreError::Invariant)?;

        let gpu_count = to_column(job.gpu_count, "gpu_count")?;
        let max_runtime_minutes = to_column(job.max_runtime_minutes, "max_runtime_minutes")?;
        let retry_count = to_column(job.retry_count, "retry_count")?;

        let event = submission_event(&job);
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO jobs (id, command, owner_id, gpu_count, priority, cwd,
                              max_runtime_minutes, retry_count, state, created_at, queued_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(job.id)
        .bind(&job.command)
        .bind(&job.owner_id)
        .bind(gpu_count)
        .bind(job.priority)
        .bind(&job.cwd)
        .bind(max_runtime_minutes)
        .bind(retry_count)
        .bind(job.state.as_str())
        .bind(job.created_at)
        .bind(job.queued_at)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(StoreError::Duplicate(job.id));
        }

        insert_event(&mut tx, &event).await?;
        tx.commit().await?;

        Ok(event)
    }

    async fn get(&self, id: Uuid) -> Result<Job> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM jobs WHERE id = $1",
            JOB_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound(id))?;

        row.try_into()
    }

    async fn list(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM jobs ORDER BY created_at DESC, id DESC",
            JOB_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(decode_jobs(rows))
    }

    async fn list_in_states(&self, states: &[JobState]) -> Result<Vec<Job>> {
        let states: Vec<&str> = states.iter().map(|s| s.as_str()).collect();

        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM jobs WHERE state = ANY($1) ORDER BY created_at ASC, id ASC",
            JOB_COLUMNS
        ))
        .bind(&states)
        .fetch_all(&self.pool)
        .await?;

        Ok(decode_jobs(rows))
    }

    async fn transition(&self, id: Uuid, change: &Transition) -> Result<(Job, JobEvent)> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM jobs WHERE id = $1 FOR UPDATE",
            JOB_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound(id))?;

        let job = Job::try_from(row)?;
        // dropping `tx` on error rolls back and releases the row lock
        let (next, event) = change.apply(&job, Utc::now(), self.retry_limit)?;
        let retry_count = to_column(next.retry_count, "retry_count")?;

        sqlx::query(
            r#"
            UPDATE jobs
            SET state = $2, node_id = $3, exit_code = $4, retry_count = $5,
                queued_at = $6, assigned_at = $7, started_at = $8, finished_at = $9
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(next.state.as_str())
        .bind(&next.node_id)
        .bind(next.exit_code)
        .bind(retry_count)
        .bind(next.queued_at)
        .bind(next.assigned_at)
        .bind(next.started_at)
        .bind(next.finished_at)
        .execute(&mut *tx)
        .await?;

        insert_event(&mut tx, &event).await?;
        tx.commit().await?;

        Ok((next, event))
    }

    async fn events(&self, id: Uuid) -> Result<Vec<JobEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT job_id, at, from_state, to_state, node_id, reason, retry_count
            FROM job_events
            WHERE job_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            // every stored job has a submission event
            return Err(StoreError::NotFound(id));
        }

        rows.into_iter().map(JobEvent::try_from).collect()
    }
}

async fn insert_event(conn: &mut PgConnection, event: &JobEvent) -> Result<()> {
    let retry_count = to_column(event.retry_count, "retry_count")?;

    sqlx::query(
        r#"
        INSERT INTO job_events (job_id, at, from_state, to_state, node_id, reason, retry_count)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(event.job_id)
    .bind(event.at)
    .bind(event.from.map(JobState::as_str))
    .bind(event.to.as_str())
    .bind(&event.node_id)
    .bind(&event.reason)
    .bind(retry_count)
    .execute(conn)
    .await?;

    Ok(())
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_state(s: &str) -> Result<JobState> {
    s.parse().map_err(StoreError::Invariant)
}

/// Converts rows to jobs, skipping rows that violate job invariants
fn decode_jobs(rows: Vec<JobRow>) -> Vec<Job> {
    rows.into_iter()
        .filter_map(|row| {
            let id = row.id;
            match Job::try_from(row) {
                Ok(job) => Some(job),
                Err(e) => {
                    tracing::error!("Skipping unreadable job {}: {}", id, e);
                    None
                }
            }
        })
        .collect()
}

fn to_column(value: u32, column: &str) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| StoreError::Invariant(format!("{} out of range: {}", column, value)))
}

fn non_negative(value: i32, column: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| StoreError::Invariant(format!("negative {} in database: {}", column, value)))
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    command: String,
    owner_id: Option<String>,
    gpu_count: i32,
    priority: i32,
    cwd: String,
    max_runtime_minutes: i32,
    retry_count: i32,
    exit_code: Option<i32>,
    state: String,
    node_id: Option<String>,
    created_at: DateTime<Utc>,
    queued_at: Option<DateTime<Utc>>,
    assigned_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Job {
            id: row.id,
            command: row.command,
            owner_id: row.owner_id,
            gpu_count: non_negative(row.gpu_count, "gpu_count")?,
            priority: row.priority,
            cwd: row.cwd,
            max_runtime_minutes: non_negative(row.max_runtime_minutes, "max_runtime_minutes")?,
            retry_count: non_negative(row.retry_count, "retry_count")?,
            exit_code: row.exit_code,
            state: parse_state(&row.state)?,
            node_id: row.node_id,
            created_at: row.created_at,
            queued_at: row.queued_at,
            assigned_at: row.assigned_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    job_id: Uuid,
    at: DateTime<Utc>,
    from_state: Option<String>,
    to_state: String,
    node_id: Option<String>,
    reason: Option<String>,
    retry_count: i32,
}

impl TryFrom<EventRow> for JobEvent {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self> {
        Ok(JobEvent {
            job_id: row.job_id,
            at: row.at,
            from: row.from_state.as_deref().map(parse_state).transpose()?,
            to: parse_state(&row.to_state)?,
            node_id: row.node_id,
            reason: row.reason,
            retry_count: non_negative(row.retry_count, "retry_count")?,
        })
    }
}
