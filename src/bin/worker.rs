use std::sync::Arc;

use churn_predict::{
    app_state::AppState,
    config::AppConfig,
    db,
    services::{
        column_map::CanonicalSchema, predict::ChurnModel, queue::JobQueue, storage::ObjectStore,
        telemetry::MetricsTelemetry,
    },
    worker::Worker,
};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting churn-prediction worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Initialize services
    tracing::info!("Initializing services");
    let storage = ObjectStore::new(
        &config.s3_bucket,
        &config.s3_endpoint,
        &config.s3_access_key,
        &config.s3_secret_key,
    )
    .expect("Failed to initialize object storage client");

    let queue = JobQueue::new(&config.redis_url).expect("Failed to initialize job queue");
    queue
        .health_check()
        .await
        .expect("Job queue unreachable");

    tracing::info!(model_path = %config.model_path, "Loading model artifact");
    let model = ChurnModel::load(&config.model_path).expect("Failed to load model artifact");

    let schema = match &config.schema_path {
        Some(path) => CanonicalSchema::load(path).expect("Failed to load canonical schema"),
        None => CanonicalSchema::churn_default(),
    };

    metrics::describe_counter!(
        "prediction_jobs_completed",
        "Total prediction jobs completed"
    );
    metrics::describe_counter!("prediction_jobs_failed", "Total prediction jobs that failed");
    metrics::describe_counter!(
        "prediction_jobs_retried",
        "Total deliveries abandoned for retry"
    );
    metrics::describe_histogram!(
        "prediction_processing_seconds",
        "Time to process one prediction job"
    );
    metrics::describe_gauge!(
        "prediction_queue_depth",
        "Current number of pending messages in the queue"
    );

    let state = AppState::new(
        db_pool,
        storage,
        queue,
        model,
        schema,
        Arc::new(MetricsTelemetry),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("termination signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    tracing::info!("Worker ready, starting job processing loop");
    let worker = Worker::new(state, config);
    worker.run(shutdown_rx).await;
}
