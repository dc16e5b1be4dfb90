use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Status of a prediction job.
///
/// Transitions are strictly forward: `PendingPublish → Queued → Running →
/// Completed | Failed`, with `Failed` reachable from any non-terminal state.
/// `PendingPublish` is internal to the producer; callers only observe it if
/// the publish step died mid-flight.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, EnumString, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    PendingPublish,
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// A churn-prediction job record. The Job Store row is the single source of
/// truth for job state; workers never cache it across deliveries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    /// Opaque identifier of the requesting principal. Ownership checks live
    /// in the excluded auth layer; the store only filters by it.
    pub owner_ref: String,
    /// Object-storage key of the uploaded source dataset.
    pub input_key: String,
    /// Object-storage key of the result artifact; set on completion.
    pub output_key: Option<String>,
    /// Queue message id, set once the publish step confirms enqueue.
    pub queue_message_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Populated only on failure. Bounded length, never raw transport errors.
    pub error_detail: Option<String>,
}
