use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;

use crate::models::job::{Job, JobStatus};

/// Error detail is user-visible; keep it bounded and free of raw transport
/// noise accumulating over retries.
const MAX_ERROR_DETAIL: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum JobStoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    /// The conditional status guard rejected the write. Expected under
    /// concurrent redelivery; the caller acknowledges and moves on.
    #[error("stale transition for job {job_id}: expected {expected}")]
    StaleTransition { job_id: Uuid, expected: &'static str },
}

fn job_from_row(row: &PgRow) -> Result<Job, sqlx::Error> {
    let status_str: String = row.try_get("status")?;
    let status = JobStatus::from_str(&status_str).map_err(|_| sqlx::Error::ColumnDecode {
        index: "status".into(),
        source: format!("unknown job status '{status_str}'").into(),
    })?;

    Ok(Job {
        id: row.try_get("id")?,
        status,
        owner_ref: row.try_get("owner_ref")?,
        input_key: row.try_get("input_key")?,
        output_key: row.try_get("output_key")?,
        queue_message_id: row.try_get("queue_message_id")?,
        created_at: row.try_get("created_at")?,
        queued_at: row.try_get("queued_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        error_detail: row.try_get("error_detail")?,
    })
}

const JOB_COLUMNS: &str = "id, status, owner_ref, input_key, output_key, queue_message_id, \
     created_at, queued_at, started_at, finished_at, error_detail";

/// Insert a new job in pending_publish. The publisher must follow up with
/// `mark_queued` or `mark_failed`; a row left in pending_publish indicates a
/// producer crash between persist and publish.
pub async fn create_job(
    pool: &PgPool,
    owner_ref: &str,
    input_key: &str,
) -> Result<Job, JobStoreError> {
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO prediction_jobs (id, status, owner_ref, input_key)
        VALUES ($1, 'pending_publish', $2, $3)
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(owner_ref)
    .bind(input_key)
    .fetch_one(pool)
    .await?;

    Ok(job_from_row(&row)?)
}

/// pending_publish -> queued, recording the confirmed queue message id.
pub async fn mark_queued(
    pool: &PgPool,
    job_id: Uuid,
    message_id: Uuid,
) -> Result<(), JobStoreError> {
    let result = sqlx::query(
        r#"
        UPDATE prediction_jobs
        SET status = 'queued', queue_message_id = $1, queued_at = NOW()
        WHERE id = $2 AND status = 'pending_publish'
        "#,
    )
    .bind(message_id)
    .bind(job_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(JobStoreError::StaleTransition {
            job_id,
            expected: "pending_publish",
        });
    }
    Ok(())
}

/// queued|running -> running. Accepting running lets a redelivery after
/// lease expiry take the job over; started_at is only written the first
/// time.
pub async fn mark_running(pool: &PgPool, job_id: Uuid) -> Result<(), JobStoreError> {
    let result = sqlx::query(
        r#"
        UPDATE prediction_jobs
        SET status = 'running',
            started_at = COALESCE(started_at, NOW())
        WHERE id = $1 AND status IN ('queued', 'running')
        "#,
    )
    .bind(job_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(JobStoreError::StaleTransition {
            job_id,
            expected: "queued or running",
        });
    }
    Ok(())
}

/// running -> completed. Exactly one of two racing deliveries wins; the
/// loser sees StaleTransition and must not overwrite the result.
pub async fn mark_completed(
    pool: &PgPool,
    job_id: Uuid,
    output_key: &str,
) -> Result<(), JobStoreError> {
    let result = sqlx::query(
        r#"
        UPDATE prediction_jobs
        SET status = 'completed', output_key = $1, finished_at = NOW()
        WHERE id = $2 AND status = 'running'
        "#,
    )
    .bind(output_key)
    .bind(job_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(JobStoreError::StaleTransition {
            job_id,
            expected: "running",
        });
    }
    Ok(())
}

/// any non-terminal -> failed.
pub async fn mark_failed(
    pool: &PgPool,
    job_id: Uuid,
    error_detail: &str,
) -> Result<(), JobStoreError> {
    let detail: String = error_detail.chars().take(MAX_ERROR_DETAIL).collect();

    let result = sqlx::query(
        r#"
        UPDATE prediction_jobs
        SET status = 'failed', error_detail = $1, finished_at = NOW()
        WHERE id = $2 AND status NOT IN ('completed', 'failed')
        "#,
    )
    .bind(detail)
    .bind(job_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(JobStoreError::StaleTransition {
            job_id,
            expected: "any non-terminal",
        });
    }
    Ok(())
}

/// Owner-scoped lookup for the status-query surface. Absence and
/// non-ownership are indistinguishable to the caller.
pub async fn get_job(
    pool: &PgPool,
    job_id: Uuid,
    owner_ref: &str,
) -> Result<Option<Job>, JobStoreError> {
    let row = sqlx::query(&format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM prediction_jobs
        WHERE id = $1 AND owner_ref = $2
        "#
    ))
    .bind(job_id)
    .bind(owner_ref)
    .fetch_optional(pool)
    .await?;

    Ok(row.as_ref().map(job_from_row).transpose()?)
}

/// All jobs for one owner, newest first.
pub async fn list_jobs(pool: &PgPool, owner_ref: &str) -> Result<Vec<Job>, JobStoreError> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM prediction_jobs
        WHERE owner_ref = $1
        ORDER BY created_at DESC
        "#
    ))
    .bind(owner_ref)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|r| job_from_row(r).map_err(JobStoreError::Db))
        .collect()
}

/// Worker-side lookup by id alone; the consumer holds no owner context.
pub async fn load_job(pool: &PgPool, job_id: Uuid) -> Result<Option<Job>, JobStoreError> {
    let row = sqlx::query(&format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM prediction_jobs
        WHERE id = $1
        "#
    ))
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.as_ref().map(job_from_row).transpose()?)
}
