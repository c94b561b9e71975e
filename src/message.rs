//! Message envelopes and job delivery state.
//!
//! A [`Job`] is one delivery of a message through a queue. The broker owns its
//! state; workers only drive transitions by returning from (or failing in) a
//! processor.
//!
//! # Job Lifecycle
//!
//! 1. Jobs are created `Waiting`
//! 2. A worker reserves them and they become `Active`
//! 3. A successful processor run moves them to `Completed`
//! 4. A failed run moves them back to `Waiting` after a backoff delay, or to
//!    `Failed` once the attempt budget is spent
//!
//! Nothing leaves `Completed` or `Failed` on its own; failed jobs are replayed
//! by an operator.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sqlx::prelude::FromRow;

use crate::error::Error;

pub type JobId = i64;

/// Delivery state of a job.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    sqlx::Type,
    strum::Display,
)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobState {
    /// Queued, possibly with a future `available_at` while backing off
    Waiting,
    /// Reserved by a worker that holds its lock
    Active,
    Completed,
    /// Attempt budget exhausted; retained for inspection
    Failed,
}

/// Per-message enqueue options.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOptions {
    /// Makes enqueue idempotent while a job with the same key is waiting or active.
    pub dedup_key: Option<String>,
}

impl JobOptions {
    pub fn dedup(key: impl Into<String>) -> Self {
        Self {
            dedup_key: Some(key.into()),
        }
    }
}

/// Row of the `jobs` table.
#[derive(Serialize, Deserialize, FromRow, Debug, Clone)]
pub struct JobRecord {
    pub id: JobId,
    pub queue: i64,
    pub name: String,
    pub payload: String,
    pub dedup_key: Option<String>,
    pub state: JobState,
    /// Reservations so far, including the current one
    pub attempts: i64,
    pub max_attempts: i64,
    pub backoff_ms: i64,
    pub remove_on_complete: bool,
    pub remove_on_fail: bool,
    pub available_at: i64,
    pub locked_until: Option<i64>,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub finished_at: Option<i64>,
}

impl JobRecord {
    pub fn options(&self) -> JobOptions {
        JobOptions {
            dedup_key: self.dedup_key.clone(),
        }
    }

    pub fn into_job<T: DeserializeOwned>(self, queue: &str) -> Result<Job<T>, Error> {
        let data = serde_json::from_str(&self.payload)?;

        Ok(Job {
            id: self.id,
            queue: queue.to_owned(),
            opts: self.options(),
            name: self.name,
            data,
            attempt: self.attempts as u32,
        })
    }
}

/// A typed job handed to a processor.
#[derive(Debug, Clone)]
pub struct Job<T> {
    pub id: JobId,
    pub queue: String,
    pub name: String,
    pub data: T,
    pub opts: JobOptions,
    /// 1-based attempt number of this delivery
    pub attempt: u32,
}

/// Operator-facing view of a job.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobSummary {
    pub id: JobId,
    pub name: String,
    pub state: JobState,
    pub attempts: i64,
    pub dedup_key: Option<String>,
    pub last_error: Option<String>,
    pub payload: serde_json::Value,
}

impl From<JobRecord> for JobSummary {
    fn from(record: JobRecord) -> Self {
        let payload = serde_json::from_str(&record.payload)
            .unwrap_or(serde_json::Value::String(record.payload));

        Self {
            id: record.id,
            name: record.name,
            state: record.state,
            attempts: record.attempts,
            dedup_key: record.dedup_key,
            last_error: record.last_error,
            payload,
        }
    }
}
