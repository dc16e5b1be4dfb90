use serde::Deserialize;

/// Environment-driven configuration, loaded once at startup and passed in
/// explicitly. Tunables carry defaults; endpoints and credentials do not.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string (job store)
    pub database_url: String,

    /// Redis connection string (durable job queue)
    pub redis_url: String,

    /// Object-storage bucket for input datasets and result artifacts
    pub s3_bucket: String,

    /// S3-compatible endpoint URL
    pub s3_endpoint: String,

    pub s3_access_key: String,

    pub s3_secret_key: String,

    /// Path to the trained model artifact (JSON), loaded once per worker
    pub model_path: String,

    /// Optional path to a canonical-schema JSON (fields, aliases, kinds).
    /// Falls back to the built-in churn schema when unset.
    #[serde(default)]
    pub schema_path: Option<String>,

    /// Idle sleep between empty polls, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Visibility/lease timeout for a received message, in seconds
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    /// Max messages pulled per poll
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Bound on concurrently processed messages per worker
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Deliveries allowed before a message is dead-lettered
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,

    /// Minimum acceptable data-quality score in [0,1]
    #[serde(default = "default_quality_floor")]
    pub quality_floor: f64,

    /// Grace period for in-flight work on shutdown, in seconds
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_lease_secs() -> u64 {
    120
}

fn default_batch_size() -> usize {
    4
}

fn default_max_in_flight() -> usize {
    2
}

fn default_max_delivery_attempts() -> u32 {
    5
}

fn default_quality_floor() -> f64 {
    0.7
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }
}
