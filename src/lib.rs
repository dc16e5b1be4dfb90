//! Asynchronous churn-prediction pipeline.
//!
//! An ingestion tier persists a job and publishes a message to a durable
//! Redis-backed queue; worker processes consume it, map arbitrary dataset
//! columns onto the model's canonical schema, validate and coerce features,
//! run inference, and write the result artifact to object storage. Job
//! state lives in PostgreSQL behind conditional transitions, which is what
//! makes redelivered messages idempotent in effect.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod services;
pub mod worker;
