use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, SqliteConnection};

use crate::message::{JobId, JobRecord, JobState};

/// What a failed attempt turned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back to `waiting`, due again after `delay`.
    Retrying { delay: Duration },
    /// Attempt budget spent.
    Failed,
    /// The job is no longer ours (stalled and re-reserved elsewhere).
    LockLost,
}

/// Result of a manual replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    Replayed,
    /// No failed job with that id in the queue.
    NotFailed,
    /// A live job already holds the failed job's dedup key.
    DedupConflict,
}

/// A job whose lock expired while it was active.
#[derive(Serialize, Deserialize, FromRow, Debug, Clone, PartialEq, Eq)]
pub struct StalledJob {
    pub id: JobId,
    pub name: String,
    pub state: JobState,
    pub attempts: i64,
}

/// Column values of a job about to be inserted.
pub struct NewJob<'a> {
    pub queue: i64,
    pub name: &'a str,
    pub payload: &'a str,
    pub dedup_key: Option<&'a str>,
    pub max_attempts: i64,
    pub backoff_ms: i64,
    pub remove_on_complete: bool,
    pub remove_on_fail: bool,
}

impl JobRecord {
    /// Returns `None` when a live job with the same dedup key already exists.
    pub async fn insert(db: &mut SqliteConnection, job: NewJob<'_>, now: i64) -> eyre::Result<Option<JobId>> {
        Ok(sqlx::query_scalar(
            "
            INSERT OR IGNORE INTO jobs (
                queue, name, payload, dedup_key, state, attempts, max_attempts, backoff_ms,
                remove_on_complete, remove_on_fail, available_at, created_at
            )
            VALUES ($1, $2, $3, $4, 'waiting', 0, $5, $6, $7, $8, $9, $9)
            RETURNING id
            ",
        )
        .bind(job.queue)
        .bind(job.name)
        .bind(job.payload)
        .bind(job.dedup_key)
        .bind(job.max_attempts)
        .bind(job.backoff_ms)
        .bind(job.remove_on_complete)
        .bind(job.remove_on_fail)
        .bind(now)
        .fetch_optional(db)
        .await?)
    }

    /// Moves up to `limit` due jobs to `active` and counts the attempt.
    pub async fn reserve(
        db: &mut SqliteConnection,
        queue: i64,
        limit: i64,
        now: i64,
        locked_until: i64,
    ) -> eyre::Result<Vec<JobRecord>> {
        Ok(sqlx::query_as(
            "
            UPDATE jobs
            SET state = 'active', attempts = attempts + 1, locked_until = $1
            WHERE id IN (
                SELECT id FROM jobs
                WHERE queue = $2 AND state = 'waiting' AND available_at <= $3
                ORDER BY available_at, id
                LIMIT $4
            )
            RETURNING *
            ",
        )
        .bind(locked_until)
        .bind(queue)
        .bind(now)
        .bind(limit)
        .fetch_all(db)
        .await?)
    }

    /// Returns false if the job was no longer held under this attempt.
    pub async fn complete(&self, db: &mut SqliteConnection, now: i64) -> eyre::Result<bool> {
        let res = if self.remove_on_complete {
            sqlx::query("DELETE FROM jobs WHERE id = $1 AND state = 'active' AND attempts = $2")
                .bind(self.id)
                .bind(self.attempts)
                .execute(db)
                .await?
        } else {
            sqlx::query(
                "
                UPDATE jobs
                SET state = 'completed', locked_until = NULL, finished_at = $1
                WHERE id = $2 AND state = 'active' AND attempts = $3
                ",
            )
            .bind(now)
            .bind(self.id)
            .bind(self.attempts)
            .execute(db)
            .await?
        };

        Ok(res.rows_affected() > 0)
    }

    pub async fn fail(&self, db: &mut SqliteConnection, error: &str, now: i64) -> eyre::Result<FailOutcome> {
        if self.attempts < self.max_attempts {
            let delay = backoff_delay(self.backoff_ms, self.attempts);

            let res = sqlx::query(
                "
                UPDATE jobs
                SET state = 'waiting', available_at = $1, locked_until = NULL, last_error = $2
                WHERE id = $3 AND state = 'active' AND attempts = $4
                ",
            )
            .bind(now + delay.as_millis() as i64)
            .bind(error)
            .bind(self.id)
            .bind(self.attempts)
            .execute(db)
            .await?;

            return Ok(if res.rows_affected() > 0 {
                FailOutcome::Retrying { delay }
            } else {
                FailOutcome::LockLost
            });
        }

        let res = if self.remove_on_fail {
            sqlx::query("DELETE FROM jobs WHERE id = $1 AND state = 'active' AND attempts = $2")
                .bind(self.id)
                .bind(self.attempts)
                .execute(db)
                .await?
        } else {
            sqlx::query(
                "
                UPDATE jobs
                SET state = 'failed', locked_until = NULL, last_error = $1, finished_at = $2
                WHERE id = $3 AND state = 'active' AND attempts = $4
                ",
            )
            .bind(error)
            .bind(now)
            .bind(self.id)
            .bind(self.attempts)
            .execute(db)
            .await?
        };

        Ok(if res.rows_affected() > 0 {
            FailOutcome::Failed
        } else {
            FailOutcome::LockLost
        })
    }

    /// Extends the locks of `(id, attempts)` pairs. A job that was re-reserved
    /// since is skipped, so a late heartbeat cannot extend the new holder's lock.
    pub async fn extend_locks(
        db: &mut SqliteConnection,
        held: &[(JobId, i64)],
        locked_until: i64,
    ) -> eyre::Result<u64> {
        if held.is_empty() {
            return Ok(0);
        }

        let held = serde_json::to_string(held)?;

        let res = sqlx::query(
            "
            UPDATE jobs
            SET locked_until = $1
            WHERE state = 'active' AND (id, attempts) IN (
                SELECT json_extract(value, '$[0]'), json_extract(value, '$[1]')
                FROM json_each($2)
            )
            ",
        )
        .bind(locked_until)
        .bind(held)
        .execute(db)
        .await?;

        Ok(res.rows_affected())
    }

    /// Releases active jobs whose lock expired. The attempt was already counted
    /// at reservation, so a stall spends the same budget as a failure.
    pub async fn recover_stalled(db: &mut SqliteConnection, queue: i64, now: i64) -> eyre::Result<Vec<StalledJob>> {
        let stalled: Vec<StalledJob> = sqlx::query_as(
            "
            UPDATE jobs
            SET
                state = CASE WHEN attempts >= max_attempts THEN 'failed' ELSE 'waiting' END,
                finished_at = CASE WHEN attempts >= max_attempts THEN $1 ELSE NULL END,
                available_at = $1,
                locked_until = NULL,
                last_error = 'job stalled'
            WHERE queue = $2 AND state = 'active' AND locked_until < $1
            RETURNING id, name, state, attempts
            ",
        )
        .bind(now)
        .bind(queue)
        .fetch_all(&mut *db)
        .await?;

        if stalled.iter().any(|job| job.state == JobState::Failed) {
            sqlx::query("DELETE FROM jobs WHERE queue = $1 AND state = 'failed' AND remove_on_fail = 1")
                .bind(queue)
                .execute(&mut *db)
                .await?;
        }

        Ok(stalled)
    }

    pub async fn list(
        db: &mut SqliteConnection,
        queue: i64,
        state: JobState,
        limit: i64,
    ) -> eyre::Result<Vec<JobRecord>> {
        Ok(sqlx::query_as(
            "SELECT * FROM jobs WHERE queue = $1 AND state = $2 ORDER BY id DESC LIMIT $3",
        )
        .bind(queue)
        .bind(state)
        .bind(limit)
        .fetch_all(db)
        .await?)
    }

    pub async fn get(db: &mut SqliteConnection, queue: i64, id: JobId) -> eyre::Result<Option<JobRecord>> {
        Ok(sqlx::query_as("SELECT * FROM jobs WHERE id = $1 AND queue = $2")
            .bind(id)
            .bind(queue)
            .fetch_optional(db)
            .await?)
    }

    /// Puts a failed job back in line with a fresh attempt budget.
    pub async fn replay(db: &mut SqliteConnection, queue: i64, id: JobId, now: i64) -> eyre::Result<ReplayOutcome> {
        let res = sqlx::query(
            "
            UPDATE jobs
            SET state = 'waiting', attempts = 0, available_at = $1, last_error = NULL, finished_at = NULL
            WHERE id = $2 AND queue = $3 AND state = 'failed'
            ",
        )
        .bind(now)
        .bind(id)
        .bind(queue)
        .execute(db)
        .await;

        match res {
            Ok(res) if res.rows_affected() > 0 => Ok(ReplayOutcome::Replayed),
            Ok(_) => Ok(ReplayOutcome::NotFailed),
            // The dedup index only covers live jobs, so a newer job may hold the key.
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Ok(ReplayOutcome::DedupConflict),
            Err(e) => Err(e.into()),
        }
    }
}

/// Exponential backoff: `base * 2^(attempt - 1)`.
pub fn backoff_delay(base_ms: i64, attempt: i64) -> Duration {
    let exponent = attempt.saturating_sub(1).clamp(0, 20) as u32;
    Duration::from_millis(base_ms.max(0) as u64) * 2_u32.saturating_pow(exponent)
}
