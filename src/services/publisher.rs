use sqlx::PgPool;
use uuid::Uuid;

use crate::db::queries::{self, JobStoreError};
use crate::models::job::{Job, JobStatus};
use crate::models::message::QueueMessage;
use crate::services::queue::{JobQueue, QueueError};

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("failed to persist job: {0}")]
    Store(#[from] JobStoreError),

    /// The job row exists and has been marked failed; the message was never
    /// (confirmably) enqueued.
    #[error("failed to publish job {job_id}: {source}")]
    Transport {
        job_id: Uuid,
        #[source]
        source: QueueError,
    },
}

/// Persist a new job, then publish its queue message.
///
/// Ordering is the contract: the row must exist before the message is sent,
/// so a consumer can never receive a message for an unknown job. If the
/// publish fails the job is marked failed rather than left in
/// pending_publish; if even that write fails the transport error still wins,
/// since the row can be swept later but the caller needs the real cause.
pub async fn submit_job(
    pool: &PgPool,
    queue: &JobQueue,
    owner_ref: &str,
    input_key: &str,
) -> Result<Job, PublishError> {
    let mut job = queries::create_job(pool, owner_ref, input_key).await?;

    let message = QueueMessage::new(job.id, input_key);
    let message_id = match queue.publish(&message).await {
        Ok(id) => id,
        Err(e) => {
            tracing::error!(job_id = %job.id, error = %e, "queue publish failed, failing job");
            if let Err(mark_err) =
                queries::mark_failed(pool, job.id, &format!("queue publish failed: {e}")).await
            {
                tracing::error!(job_id = %job.id, error = %mark_err, "could not mark job failed");
            }
            return Err(PublishError::Transport {
                job_id: job.id,
                source: e,
            });
        }
    };

    if let Err(e) = queries::mark_queued(pool, job.id, message_id).await {
        // The message is already live; a worker receiving it will keep
        // abandoning a pending_publish job, so the row must not stay there.
        tracing::error!(job_id = %job.id, error = %e, "mark_queued failed, failing job");
        match queries::mark_failed(pool, job.id, "could not record enqueue").await {
            Ok(()) | Err(JobStoreError::StaleTransition { .. }) => {}
            Err(mark_err) => {
                tracing::error!(job_id = %job.id, error = %mark_err, "could not mark job failed");
            }
        }
        return Err(e.into());
    }
    job.status = JobStatus::Queued;
    job.queue_message_id = Some(message_id);

    tracing::info!(job_id = %job.id, message_id = %message_id, "job queued");
    Ok(job)
}
