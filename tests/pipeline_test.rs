use std::sync::Arc;
use std::time::Duration;

use churn_predict::{
    app_state::AppState,
    config::AppConfig,
    db::{self, queries, queries::JobStoreError},
    models::job::JobStatus,
    models::report::PredictionArtifact,
    services::{
        column_map::CanonicalSchema,
        predict::ChurnModel,
        publisher::{self, PublishError},
        queue::JobQueue,
        storage::{self, ObjectStore},
        telemetry::NoopTelemetry,
    },
    worker,
};
use uuid::Uuid;

/// These tests exercise the pipeline against live PostgreSQL, Redis and
/// object storage, configured through the same environment variables the
/// worker uses.
///
/// The tests share one queue, so run them serially:
/// cargo test --test pipeline_test -- --ignored --test-threads=1

const TEST_MODEL: &str = r#"{
    "model_version": "churn-lr-test",
    "bias": -1.0,
    "weights": { "monthly_charge": 0.02, "tenure_days": -0.1,
                 "total_charges": 0.0, "support_tickets": 0.3 },
    "level_weights": { "contract_type": { "0": 1.2, "1": -0.4, "2": -1.1 } },
    "threshold": 0.5
}"#;

fn test_config() -> AppConfig {
    let mut config = AppConfig::from_env().expect("Failed to load config");
    config.lease_secs = 30;
    config.max_delivery_attempts = 3;
    config.quality_floor = 0.5;
    config
}

async fn test_state(config: &AppConfig) -> AppState {
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    db::ensure_schema(&db_pool)
        .await
        .expect("Failed to ensure schema");

    let storage = ObjectStore::new(
        &config.s3_bucket,
        &config.s3_endpoint,
        &config.s3_access_key,
        &config.s3_secret_key,
    )
    .expect("Failed to initialize object storage");

    let queue = JobQueue::new(&config.redis_url).expect("Failed to initialize queue");
    let model = ChurnModel::from_json(TEST_MODEL).expect("Failed to parse test model");

    AppState::new(
        db_pool,
        storage,
        queue,
        model,
        CanonicalSchema::churn_default(),
        Arc::new(NoopTelemetry),
    )
}

/// Drain the queue one delivery at a time, processing each with the worker's
/// delivery handler. Returns how many deliveries were processed.
async fn drain_queue(state: &AppState, config: &AppConfig) -> usize {
    let lease = Duration::from_secs(config.lease_secs);
    let mut processed = 0;
    loop {
        let deliveries = state
            .queue
            .receive(1, lease)
            .await
            .expect("Failed to receive");
        if deliveries.is_empty() {
            return processed;
        }
        for delivery in deliveries {
            worker::handle_delivery(state.clone(), config.clone(), delivery).await;
            processed += 1;
        }
    }
}

#[tokio::test]
#[ignore]
async fn round_trip_produces_deterministic_artifact() {
    let config = test_config();
    let state = test_state(&config).await;
    let owner = format!("owner-{}", Uuid::new_v4());

    // Upload a source dataset whose columns only resolve through aliases
    let csv = b"acct_id,mrr,plan_type,tenure_days\n\
                c-100,\"$129.00\",month_to_month,45\n\
                c-200,19.50,two_year,900\n";
    let staging_key = storage::input_key(Uuid::new_v4());
    state
        .storage
        .upload(&staging_key, csv, "text/csv")
        .await
        .expect("Failed to upload input");

    let job = publisher::submit_job(&state.db, &state.queue, &owner, &staging_key)
        .await
        .expect("Failed to submit job");
    assert_eq!(job.status, JobStatus::Queued);
    assert!(job.queue_message_id.is_some());

    let processed = drain_queue(&state, &config).await;
    assert_eq!(processed, 1);

    let finished = queries::get_job(&state.db, job.id, &owner)
        .await
        .expect("Failed to get job")
        .expect("Job not visible to owner");
    assert_eq!(finished.status, JobStatus::Completed);
    assert!(finished.started_at.is_some());
    assert!(finished.finished_at.is_some());

    let output_key = finished.output_key.expect("No output key");
    assert_eq!(output_key, storage::output_key(job.id));

    let body = state
        .storage
        .download(&output_key)
        .await
        .expect("Failed to download artifact");
    let artifact: PredictionArtifact =
        serde_json::from_slice(&body).expect("Artifact not parsable");

    assert_eq!(artifact.job_id, job.id);
    assert_eq!(artifact.summary.rows, 2);
    assert_eq!(artifact.predictions[0].customer_id, "c-100");
    // month-to-month at $129 scores churn; two-year at $19.50 does not
    assert!(artifact.predictions[0].churn);
    assert!(!artifact.predictions[1].churn);

    // Determinism: rerunning inference over the same input gives the same
    // artifact content
    let rerun = state
        .storage
        .download(&output_key)
        .await
        .expect("Failed to re-download artifact");
    assert_eq!(body, rerun);

    // Owner scoping: another principal cannot see the job
    let hidden = queries::get_job(&state.db, job.id, "someone-else")
        .await
        .expect("Failed to query");
    assert!(hidden.is_none());

    let listed = queries::list_jobs(&state.db, &owner)
        .await
        .expect("Failed to list");
    assert!(listed.iter().any(|j| j.id == job.id));
}

#[tokio::test]
#[ignore]
async fn redelivery_after_completion_has_no_side_effects() {
    let config = test_config();
    let state = test_state(&config).await;
    let owner = format!("owner-{}", Uuid::new_v4());

    let staging_key = storage::input_key(Uuid::new_v4());
    state
        .storage
        .upload(
            &staging_key,
            b"acct_id,mrr,plan_type\nc1,42.0,one_year\n",
            "text/csv",
        )
        .await
        .expect("Failed to upload input");

    let job = publisher::submit_job(&state.db, &state.queue, &owner, &staging_key)
        .await
        .expect("Failed to submit job");
    assert_eq!(drain_queue(&state, &config).await, 1);

    let completed = queries::load_job(&state.db, job.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(completed.status, JobStatus::Completed);

    // Simulate duplicate delivery: publish the identical message again
    let message = churn_predict::models::message::QueueMessage::new(job.id, &staging_key);
    state
        .queue
        .publish(&message)
        .await
        .expect("Failed to republish");

    // The redelivery must ack cleanly without reprocessing
    assert_eq!(drain_queue(&state, &config).await, 1);
    assert_eq!(state.queue.depth().await.unwrap(), 0);

    let after = queries::load_job(&state.db, job.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.status, JobStatus::Completed);
    assert_eq!(after.finished_at, completed.finished_at);
    assert_eq!(after.output_key, completed.output_key);
}

#[tokio::test]
#[ignore]
async fn concurrent_completion_races_resolve_to_one_winner() {
    let config = test_config();
    let state = test_state(&config).await;
    let owner = format!("owner-{}", Uuid::new_v4());

    let job = queries::create_job(&state.db, &owner, "inputs/race.csv")
        .await
        .expect("Failed to create job");
    queries::mark_queued(&state.db, job.id, Uuid::new_v4())
        .await
        .expect("Failed to mark queued");
    queries::mark_running(&state.db, job.id)
        .await
        .expect("Failed to mark running");

    let key = storage::output_key(job.id);
    let (a, b) = futures::future::join(
        queries::mark_completed(&state.db, job.id, &key),
        queries::mark_completed(&state.db, job.id, &key),
    )
    .await;

    let winners = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1, "exactly one completion must win");
    let loser = if a.is_err() { a } else { b };
    assert!(matches!(
        loser,
        Err(JobStoreError::StaleTransition { .. })
    ));

    // And nothing can move a completed job
    assert!(matches!(
        queries::mark_failed(&state.db, job.id, "too late").await,
        Err(JobStoreError::StaleTransition { .. })
    ));
}

#[tokio::test]
#[ignore]
async fn message_arriving_before_enqueue_is_recorded_survives() {
    let config = test_config();
    let state = test_state(&config).await;
    let owner = format!("owner-{}", Uuid::new_v4());

    let staging_key = storage::input_key(Uuid::new_v4());
    state
        .storage
        .upload(
            &staging_key,
            b"acct_id,mrr,plan_type\nc1,42.0,one_year\n",
            "text/csv",
        )
        .await
        .expect("Failed to upload input");

    // Publish by hand with the job row still in pending_publish, the state
    // a consumer observes when it wins the race against mark_queued
    let job = queries::create_job(&state.db, &owner, &staging_key)
        .await
        .expect("Failed to create job");
    let message = churn_predict::models::message::QueueMessage::new(job.id, &staging_key);
    state
        .queue
        .publish(&message)
        .await
        .expect("Failed to publish");

    let deliveries = state
        .queue
        .receive(1, Duration::from_secs(config.lease_secs))
        .await
        .expect("Failed to receive");
    assert_eq!(deliveries.len(), 1);
    worker::handle_delivery(state.clone(), config.clone(), deliveries[0].clone()).await;

    // The delivery must bounce, not consume the message or settle the job
    assert_eq!(state.queue.depth().await.unwrap(), 1);
    let row = queries::load_job(&state.db, job.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, JobStatus::PendingPublish);

    // Once the producer catches up, the redelivery completes normally
    queries::mark_queued(&state.db, job.id, Uuid::new_v4())
        .await
        .expect("Failed to mark queued");
    assert_eq!(drain_queue(&state, &config).await, 1);
    let finished = queries::load_job(&state.db, job.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(finished.status, JobStatus::Completed);
}

#[tokio::test]
#[ignore]
async fn expired_lease_redelivers_with_incremented_count() {
    let config = test_config();
    let state = test_state(&config).await;

    let message = churn_predict::models::message::QueueMessage::new(
        Uuid::new_v4(),
        "inputs/lease-expiry.csv",
    );
    state
        .queue
        .publish(&message)
        .await
        .expect("Failed to publish");

    // First delivery with a one-second lease, deliberately never acked
    let first = state
        .queue
        .receive(1, Duration::from_secs(1))
        .await
        .expect("Failed to receive");
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].delivery_count, 1);

    // In flight: nothing pending, nothing further to receive
    assert_eq!(state.queue.depth().await.unwrap(), 0);
    assert!(state
        .queue
        .receive(1, Duration::from_secs(1))
        .await
        .unwrap()
        .is_empty());

    tokio::time::sleep(Duration::from_millis(1500)).await;

    // The sweep at the top of receive turns the expired lease into a
    // redelivery of the same message
    let second = state
        .queue
        .receive(1, Duration::from_secs(config.lease_secs))
        .await
        .expect("Failed to receive");
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].message_id, first[0].message_id);
    assert_eq!(second[0].payload, first[0].payload);
    assert_eq!(second[0].delivery_count, 2);

    state
        .queue
        .ack(second[0].message_id)
        .await
        .expect("Failed to ack");
    assert_eq!(state.queue.depth().await.unwrap(), 0);
}

#[tokio::test]
#[ignore]
async fn publish_failure_marks_job_failed() {
    let config = test_config();
    let state = test_state(&config).await;
    let owner = format!("owner-{}", Uuid::new_v4());

    // A queue pointed at a closed port fails on publish, not on construction
    let dead_queue = JobQueue::new("redis://127.0.0.1:1/").expect("client construction");

    let err = publisher::submit_job(&state.db, &dead_queue, &owner, "inputs/nope.csv")
        .await
        .expect_err("publish must fail");
    let PublishError::Transport { job_id, .. } = err else {
        panic!("expected transport error");
    };

    let job = queries::get_job(&state.db, job_id, &owner)
        .await
        .unwrap()
        .expect("job row must exist");
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job
        .error_detail
        .as_deref()
        .unwrap_or_default()
        .contains("queue publish failed"));
    assert!(job.queue_message_id.is_none());
}

#[tokio::test]
#[ignore]
async fn always_recoverable_failure_terminates_after_bounded_retries() {
    let config = test_config();
    let state = test_state(&config).await;
    let owner = format!("owner-{}", Uuid::new_v4());

    // Input object deliberately never uploaded: every download attempt is a
    // transient-class failure, so every delivery is recoverable
    let missing_key = storage::input_key(Uuid::new_v4());
    let job = publisher::submit_job(&state.db, &state.queue, &owner, &missing_key)
        .await
        .expect("Failed to submit job");

    let processed = drain_queue(&state, &config).await;
    assert_eq!(
        processed, config.max_delivery_attempts as usize,
        "message must be delivered exactly the configured number of times"
    );
    assert_eq!(state.queue.depth().await.unwrap(), 0);

    let failed = queries::get_job(&state.db, job.id, &owner)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed
        .error_detail
        .as_deref()
        .unwrap_or_default()
        .contains("retries exhausted"));
}

#[tokio::test]
#[ignore]
async fn validation_failure_is_terminal_not_retried() {
    let config = test_config();
    let state = test_state(&config).await;
    let owner = format!("owner-{}", Uuid::new_v4());

    // Mandatory columns cannot be resolved from these headers
    let staging_key = storage::input_key(Uuid::new_v4());
    state
        .storage
        .upload(&staging_key, b"foo,bar\n1,2\n", "text/csv")
        .await
        .expect("Failed to upload input");

    let job = publisher::submit_job(&state.db, &state.queue, &owner, &staging_key)
        .await
        .expect("Failed to submit job");

    // Exactly one delivery: terminal failures are acked, never redelivered
    assert_eq!(drain_queue(&state, &config).await, 1);

    let failed = queries::get_job(&state.db, job.id, &owner)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed
        .error_detail
        .as_deref()
        .unwrap_or_default()
        .contains("unmapped"));
}
