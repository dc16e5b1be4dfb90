use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::config::AppConfig;
use crate::db::queries::{self, JobStoreError};
use crate::models::message::QueueMessage;
use crate::models::report::PredictionArtifact;
use crate::services::column_map::map_columns;
use crate::services::dataset::RawTable;
use crate::services::feature_check::validate_features;
use crate::services::queue::Delivery;
use crate::services::storage;

/// Upper bound on any single storage or store call.
const STAGE_TIMEOUT: Duration = Duration::from_secs(60);

/// Transient-error retries inside a stage before the failure surfaces as
/// recoverable.
const STAGE_RETRIES: u32 = 3;
const STAGE_BACKOFF_BASE: Duration = Duration::from_millis(200);

/// Outcome of one delivery's full processing attempt.
#[derive(Debug)]
pub enum ProcessOutcome {
    /// Result written, job completed.
    Completed { job_id: Uuid, elapsed: Duration },
    /// Nothing to do: job already settled, missing, or another delivery won
    /// a transition race. Acknowledged without side effects.
    Discarded { reason: String },
    /// Unfixable input or model mismatch; the job is failed and the message
    /// acknowledged.
    Terminal { job_id: Uuid, detail: String },
    /// Transient trouble; the message should be redelivered.
    Recoverable { job_id: Uuid, detail: String },
    /// The payload itself is unusable (unparsable, unknown version).
    Poison { job_id: Option<Uuid>, detail: String },
}

/// What to do with the message after processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Abandon,
    DeadLetter,
}

/// The single place acknowledge-vs-abandon is decided. Pure so the bounded
/// retry policy is testable without a queue.
pub fn decide(outcome: &ProcessOutcome, delivery_count: u32, max_attempts: u32) -> Disposition {
    match outcome {
        ProcessOutcome::Completed { .. }
        | ProcessOutcome::Discarded { .. }
        | ProcessOutcome::Terminal { .. } => Disposition::Ack,
        ProcessOutcome::Recoverable { .. } | ProcessOutcome::Poison { .. } => {
            if delivery_count >= max_attempts {
                Disposition::DeadLetter
            } else {
                Disposition::Abandon
            }
        }
    }
}

/// Long-running queue consumer. Holds no state besides its handles; any
/// number of workers may run against the same queue and job store.
pub struct Worker {
    state: AppState,
    config: AppConfig,
}

impl Worker {
    pub fn new(state: AppState, config: AppConfig) -> Self {
        Self { state, config }
    }

    /// Poll until `shutdown` flips, then drain in-flight work up to the
    /// grace deadline. Messages not finished in time keep their lease and
    /// redeliver after expiry.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_in_flight));
        let mut tasks: JoinSet<()> = JoinSet::new();
        let lease = Duration::from_secs(self.config.lease_secs);
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        tracing::info!(
            max_in_flight = self.config.max_in_flight,
            lease_secs = self.config.lease_secs,
            max_delivery_attempts = self.config.max_delivery_attempts,
            "worker loop started"
        );

        while !*shutdown.borrow() {
            while tasks.try_join_next().is_some() {}

            let available = semaphore.available_permits();
            if available == 0 {
                tokio::select! {
                    _ = tasks.join_next() => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            let batch = available.min(self.config.batch_size);
            let deliveries = match self.state.queue.receive(batch, lease).await {
                Ok(d) => d,
                Err(e) => {
                    tracing::error!(error = %e, "queue receive failed");
                    tokio::select! {
                        _ = sleep(poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                    continue;
                }
            };

            if deliveries.is_empty() {
                if let Ok(depth) = self.state.queue.depth().await {
                    self.state.telemetry.queue_depth(depth);
                }
                tokio::select! {
                    _ = sleep(poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            for delivery in deliveries {
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return,
                };
                let state = self.state.clone();
                let config = self.config.clone();
                tasks.spawn(async move {
                    handle_delivery(state, config, delivery).await;
                    drop(permit);
                });
            }
        }

        tracing::info!("shutdown requested, draining in-flight work");
        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        let deadline = Instant::now() + grace;
        while !tasks.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!(
                    abandoned = tasks.len(),
                    "grace deadline reached, leaving messages leased for redelivery"
                );
                tasks.abort_all();
                break;
            }
            if timeout(remaining, tasks.join_next()).await.is_err() {
                continue;
            }
        }
        tracing::info!("worker loop stopped");
    }
}

/// Process one delivery end to end and apply its disposition. Errors never
/// escape: every failure is folded into a `ProcessOutcome` and a crash here
/// is equivalent to a lease timeout.
pub async fn handle_delivery(state: AppState, config: AppConfig, delivery: Delivery) {
    let lease = Duration::from_secs(config.lease_secs);

    // Keep the lease alive while this message is in flight so the queue's
    // redelivery timer cannot fire mid-processing.
    let extender = {
        let queue = state.queue.clone();
        let message_id = delivery.message_id;
        tokio::spawn(async move {
            let tick = (lease / 3).max(Duration::from_secs(1));
            let mut interval = tokio::time::interval(tick);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = queue.extend_lease(message_id, lease).await {
                    tracing::warn!(message_id = %message_id, error = %e, "lease extension failed");
                }
            }
        })
    };

    let outcome = process_message(&state, &config, &delivery).await;
    extender.abort();

    let disposition = decide(&outcome, delivery.delivery_count, config.max_delivery_attempts);

    match (&outcome, disposition) {
        (ProcessOutcome::Completed { job_id, elapsed }, Disposition::Ack) => {
            state.telemetry.job_completed(*elapsed);
            tracing::info!(job_id = %job_id, elapsed_ms = elapsed.as_millis(), "job completed");
            ack(&state, delivery.message_id).await;
        }
        (ProcessOutcome::Discarded { reason }, Disposition::Ack) => {
            tracing::debug!(message_id = %delivery.message_id, reason = %reason, "message discarded");
            ack(&state, delivery.message_id).await;
        }
        (ProcessOutcome::Terminal { job_id, detail }, Disposition::Ack) => {
            state.telemetry.job_failed("terminal");
            fail_job(&state, *job_id, detail).await;
            tracing::warn!(job_id = %job_id, detail = %detail, "job failed terminally");
            ack(&state, delivery.message_id).await;
        }
        (ProcessOutcome::Recoverable { job_id, detail }, Disposition::Abandon) => {
            state.telemetry.job_retried();
            tracing::warn!(
                job_id = %job_id,
                detail = %detail,
                delivery_count = delivery.delivery_count,
                "recoverable failure, leaving message for redelivery"
            );
            if let Err(e) = state.queue.abandon(delivery.message_id).await {
                tracing::error!(message_id = %delivery.message_id, error = %e, "abandon failed");
            }
        }
        (ProcessOutcome::Recoverable { job_id, detail }, Disposition::DeadLetter) => {
            state.telemetry.job_failed("retries_exhausted");
            fail_job(
                &state,
                *job_id,
                &format!(
                    "retries exhausted after {} deliveries: {detail}",
                    delivery.delivery_count
                ),
            )
            .await;
            tracing::error!(job_id = %job_id, detail = %detail, "retries exhausted, dead-lettering");
            dead_letter(&state, delivery.message_id).await;
        }
        (ProcessOutcome::Poison { job_id: _, detail }, Disposition::Abandon) => {
            tracing::warn!(
                message_id = %delivery.message_id,
                detail = %detail,
                delivery_count = delivery.delivery_count,
                "poison message, leaving for a compatible worker"
            );
            if let Err(e) = state.queue.abandon(delivery.message_id).await {
                tracing::error!(message_id = %delivery.message_id, error = %e, "abandon failed");
            }
        }
        (ProcessOutcome::Poison { job_id, detail }, Disposition::DeadLetter) => {
            state.telemetry.job_failed("poison");
            if let Some(job_id) = job_id {
                fail_job(&state, *job_id, &format!("poison message: {detail}")).await;
            }
            tracing::error!(
                message_id = %delivery.message_id,
                detail = %detail,
                "poison message exhausted its attempts, dead-lettering"
            );
            dead_letter(&state, delivery.message_id).await;
        }
        (outcome, disposition) => {
            // decide() is total over the variants above; this arm is dead.
            tracing::error!(?outcome, ?disposition, "unexpected disposition");
            ack(&state, delivery.message_id).await;
        }
    }
}

async fn ack(state: &AppState, message_id: Uuid) {
    if let Err(e) = state.queue.ack(message_id).await {
        tracing::error!(message_id = %message_id, error = %e, "ack failed");
    }
}

async fn dead_letter(state: &AppState, message_id: Uuid) {
    if let Err(e) = state.queue.dead_letter(message_id).await {
        tracing::error!(message_id = %message_id, error = %e, "dead-letter failed");
    }
}

/// Best-effort terminal write. StaleTransition means another delivery
/// already settled the job, which is fine.
async fn fail_job(state: &AppState, job_id: Uuid, detail: &str) {
    match store_backoff(|| queries::mark_failed(&state.db, job_id, detail)).await {
        Ok(()) => {}
        Err(JobStoreError::StaleTransition { .. }) => {
            tracing::debug!(job_id = %job_id, "job already settled, skipping mark_failed");
        }
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "could not mark job failed");
        }
    }
}

/// The pipeline proper: decode, guard, run the stages, persist the result.
async fn process_message(
    state: &AppState,
    config: &AppConfig,
    delivery: &Delivery,
) -> ProcessOutcome {
    let message = match QueueMessage::decode(&delivery.payload) {
        Ok(m) => m,
        Err(e) => {
            return ProcessOutcome::Poison {
                job_id: e.job_id(),
                detail: e.to_string(),
            }
        }
    };
    let job_id = message.job_id;

    // Idempotency guard: a redelivered message for a settled job is
    // acknowledged without reprocessing.
    let job = match store_backoff(|| queries::load_job(&state.db, job_id)).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            return ProcessOutcome::Discarded {
                reason: format!("no job record for {job_id}"),
            }
        }
        Err(e) => {
            return ProcessOutcome::Recoverable {
                job_id,
                detail: format!("job store lookup failed: {e}"),
            }
        }
    };
    if job.status.is_terminal() {
        return ProcessOutcome::Discarded {
            reason: format!("job {job_id} already {}", job.status),
        };
    }

    match store_backoff(|| queries::mark_running(&state.db, job_id)).await {
        Ok(()) => {}
        Err(JobStoreError::StaleTransition { .. }) => {
            // Two very different reasons land here: a concurrent delivery
            // settled the job, or the message outran the producer and the
            // row is still pending_publish. Only a terminal status may eat
            // the message; otherwise it must survive for redelivery.
            return match store_backoff(|| queries::load_job(&state.db, job_id)).await {
                Ok(Some(job)) if job.status.is_terminal() => ProcessOutcome::Discarded {
                    reason: format!("job {job_id} settled by a concurrent delivery"),
                },
                Ok(Some(job)) => ProcessOutcome::Recoverable {
                    job_id,
                    detail: format!("job not yet runnable (status {})", job.status),
                },
                Ok(None) => ProcessOutcome::Discarded {
                    reason: format!("no job record for {job_id}"),
                },
                Err(e) => ProcessOutcome::Recoverable {
                    job_id,
                    detail: format!("job store lookup failed: {e}"),
                },
            };
        }
        Err(e) => {
            return ProcessOutcome::Recoverable {
                job_id,
                detail: format!("mark_running failed: {e}"),
            }
        }
    }

    let started = Instant::now();

    let input = match staged(with_backoff(|| {
        state.storage.download(&message.input_key)
    }))
    .await
    {
        Ok(bytes) => bytes,
        Err(detail) => {
            return ProcessOutcome::Recoverable {
                job_id,
                detail: format!("input download: {detail}"),
            }
        }
    };

    let table = match RawTable::from_csv(&input) {
        Ok(t) => t,
        Err(e) => {
            return ProcessOutcome::Terminal {
                job_id,
                detail: format!("malformed dataset: {e}"),
            }
        }
    };

    let mapping = map_columns(&table.columns, &state.schema);
    tracing::debug!(
        job_id = %job_id,
        mapped = mapping.mapping.iter().filter(|m| m.source.is_some()).count(),
        unmapped_required = mapping.unmapped_required.len(),
        "column mapping done"
    );

    let (clean, validation) =
        match validate_features(&table, &mapping, &state.schema, config.quality_floor) {
            Ok(v) => v,
            Err(e) => {
                return ProcessOutcome::Terminal {
                    job_id,
                    detail: e.to_string(),
                }
            }
        };

    let (predictions, summary) = match state.model.predict(&clean) {
        Ok(p) => p,
        Err(e) => {
            return ProcessOutcome::Terminal {
                job_id,
                detail: format!("inference failed: {e}"),
            }
        }
    };

    let artifact = PredictionArtifact {
        job_id,
        summary,
        validation,
        predictions,
    };
    let body = match serde_json::to_vec(&artifact) {
        Ok(b) => b,
        Err(e) => {
            return ProcessOutcome::Terminal {
                job_id,
                detail: format!("artifact serialization failed: {e}"),
            }
        }
    };

    let output_key = storage::output_key(job_id);
    if let Err(detail) = staged(with_backoff(|| {
        state.storage.upload(&output_key, &body, "application/json")
    }))
    .await
    {
        return ProcessOutcome::Recoverable {
            job_id,
            detail: format!("artifact upload: {detail}"),
        };
    }

    match store_backoff(|| queries::mark_completed(&state.db, job_id, &output_key)).await {
        Ok(()) => ProcessOutcome::Completed {
            job_id,
            elapsed: started.elapsed(),
        },
        Err(JobStoreError::StaleTransition { .. }) => ProcessOutcome::Discarded {
            reason: format!("job {job_id} completed by a concurrent delivery"),
        },
        Err(e) => ProcessOutcome::Recoverable {
            job_id,
            detail: format!("mark_completed failed: {e}"),
        },
    }
}

/// Apply the per-stage deadline; elapsed stages surface as recoverable.
async fn staged<T, E: std::fmt::Display>(
    fut: impl Future<Output = Result<T, E>>,
) -> Result<T, String> {
    match timeout(STAGE_TIMEOUT, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("stage deadline ({}s) exceeded", STAGE_TIMEOUT.as_secs())),
    }
}

/// Retry a transient-prone call with exponential backoff.
async fn with_backoff<T, E, F, Fut>(op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    with_backoff_if(op, |_| true).await
}

/// A StaleTransition is a verdict, not contention; only database errors are
/// worth a second try.
async fn store_backoff<T, F, Fut>(op: F) -> Result<T, JobStoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, JobStoreError>>,
{
    with_backoff_if(op, |e| matches!(e, JobStoreError::Db(_))).await
}

async fn with_backoff_if<T, E, F, Fut>(mut op: F, transient: impl Fn(&E) -> bool) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = STAGE_BACKOFF_BASE;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < STAGE_RETRIES && transient(&e) => {
                tracing::debug!(error = %e, attempt, "transient failure, backing off");
                sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed() -> ProcessOutcome {
        ProcessOutcome::Completed {
            job_id: Uuid::new_v4(),
            elapsed: Duration::from_secs(1),
        }
    }

    fn recoverable() -> ProcessOutcome {
        ProcessOutcome::Recoverable {
            job_id: Uuid::new_v4(),
            detail: "io".into(),
        }
    }

    #[test]
    fn success_and_terminal_outcomes_always_ack() {
        assert_eq!(decide(&completed(), 1, 5), Disposition::Ack);
        assert_eq!(decide(&completed(), 99, 5), Disposition::Ack);
        assert_eq!(
            decide(
                &ProcessOutcome::Terminal {
                    job_id: Uuid::new_v4(),
                    detail: "bad input".into()
                },
                1,
                5
            ),
            Disposition::Ack
        );
        assert_eq!(
            decide(
                &ProcessOutcome::Discarded {
                    reason: "settled".into()
                },
                5,
                5
            ),
            Disposition::Ack
        );
    }

    #[test]
    fn recoverable_failures_abandon_until_attempts_exhausted() {
        for count in 1..5 {
            assert_eq!(decide(&recoverable(), count, 5), Disposition::Abandon);
        }
        assert_eq!(decide(&recoverable(), 5, 5), Disposition::DeadLetter);
        assert_eq!(decide(&recoverable(), 6, 5), Disposition::DeadLetter);
    }

    #[test]
    fn poison_messages_dead_letter_after_bound() {
        let poison = ProcessOutcome::Poison {
            job_id: None,
            detail: "unknown schema_version 9".into(),
        };
        assert_eq!(decide(&poison, 1, 3), Disposition::Abandon);
        assert_eq!(decide(&poison, 3, 3), Disposition::DeadLetter);
    }

    #[test]
    fn a_permanently_failing_message_terminates_in_exactly_max_attempts() {
        // Simulate the redelivery loop: each delivery raises a recoverable
        // failure. It must abandon max-1 times and dead-letter once.
        let max = 4;
        let mut deliveries = 0;
        loop {
            deliveries += 1;
            match decide(&recoverable(), deliveries, max) {
                Disposition::Abandon => continue,
                Disposition::DeadLetter => break,
                Disposition::Ack => panic!("recoverable outcome must never plain-ack"),
            }
        }
        assert_eq!(deliveries, max);
    }
}
