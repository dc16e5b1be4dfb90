use sqlx::PgPool;
use std::sync::Arc;

use crate::services::{
    column_map::CanonicalSchema, predict::ChurnModel, queue::JobQueue, storage::ObjectStore,
    telemetry::Telemetry,
};

/// Shared service handles, constructed once at startup and passed into the
/// worker and producer explicitly. No process-wide singletons.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub storage: Arc<ObjectStore>,
    pub queue: Arc<JobQueue>,
    pub model: Arc<ChurnModel>,
    pub schema: Arc<CanonicalSchema>,
    pub telemetry: Arc<dyn Telemetry>,
}

impl AppState {
    pub fn new(
        db: PgPool,
        storage: ObjectStore,
        queue: JobQueue,
        model: ChurnModel,
        schema: CanonicalSchema,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        Self {
            db,
            storage: Arc::new(storage),
            queue: Arc::new(queue),
            model: Arc::new(model),
            schema: Arc::new(schema),
            telemetry,
        }
    }
}
