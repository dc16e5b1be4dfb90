pub mod column_map;
pub mod dataset;
pub mod feature_check;
pub mod predict;
pub mod publisher;
pub mod queue;
pub mod storage;
pub mod telemetry;
