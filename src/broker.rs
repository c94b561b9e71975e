//! SQLite-backed broker: durable storage, locks and redelivery for every queue.

use std::{sync::Arc, time::Duration};

use serde::{de::DeserializeOwned, Serialize};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode, SqlitePoolOptions},
    SqlitePool,
};

use crate::{
    config::Config,
    db::{
        job::{FailOutcome, NewJob, ReplayOutcome, StalledJob},
        queue::{Queue as QueueRow, QueueStatistics},
    },
    error::Error,
    message::{JobId, JobOptions, JobRecord, JobState, JobSummary},
    queue::{Channel, DeliveryPolicy, Queue},
};

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Shared connection to the broker. Cloning is cheap.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    db: SqlitePool,
    config: Config,
    channels: papaya::HashMap<String, Arc<Channel>>,
}

impl Broker {
    pub async fn connect_with(config: Config) -> Result<Self, Error> {
        let opts = SqliteConnectOptions::new()
            .filename(config.db_path())
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .locking_mode(SqliteLockingMode::Normal)
            .busy_timeout(Duration::from_secs(10))
            .optimize_on_close(true, None);

        let pool = SqlitePoolOptions::new().connect_with(opts).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!(path = config.db_path(), "Broker connected");

        Ok(Self {
            inner: Arc::new(BrokerInner {
                db: pool,
                config,
                channels: papaya::HashMap::new(),
            }),
        })
    }

    pub fn db(&self) -> &SqlitePool {
        &self.inner.db
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Creates the queue `name`, or attaches to it if it already exists.
    pub async fn queue<T>(&self, name: impl Into<String>) -> Result<Queue<T>, Error>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let channel = self.channel(name.into()).await?;
        Ok(Queue::new(self.clone(), channel))
    }

    async fn channel(&self, name: String) -> Result<Arc<Channel>, Error> {
        if let Some(channel) = self.inner.channels.pin().get(&name) {
            return Ok(channel.clone());
        }

        let mut conn = self.inner.db.acquire().await?;
        let id = QueueRow::ensure(&mut conn, &name, now_ms()).await?;

        let channels = self.inner.channels.pin();
        let channel = channels.get_or_insert(name.clone(), Arc::new(Channel::new(id, name)));

        Ok(channel.clone())
    }

    pub(crate) async fn enqueue(
        &self,
        channel: &Channel,
        name: &str,
        payload: &str,
        opts: &JobOptions,
        policy: &DeliveryPolicy,
    ) -> Result<Option<JobId>, Error> {
        let mut conn = self.inner.db.acquire().await?;

        let id = JobRecord::insert(
            &mut conn,
            NewJob {
                queue: channel.id,
                name,
                payload,
                dedup_key: opts.dedup_key.as_deref(),
                max_attempts: policy.max_attempts.max(1) as i64,
                backoff_ms: policy.backoff.base_delay().as_millis() as i64,
                remove_on_complete: !policy.retain_completed,
                remove_on_fail: !policy.retain_failed,
            },
            now_ms(),
        )
        .await?;

        match id {
            Some(id) => {
                tracing::debug!(queue = %channel.name, id, name, "Job added");
                channel.notify.notify_waiters();
            }
            None => {
                tracing::debug!(
                    queue = %channel.name,
                    dedup_key = ?opts.dedup_key,
                    name,
                    "Duplicate job ignored"
                );
            }
        }

        Ok(id)
    }

    pub(crate) async fn reserve(
        &self,
        channel: &Channel,
        limit: usize,
        lock_duration: Duration,
    ) -> Result<Vec<JobRecord>, Error> {
        let mut conn = self.inner.db.acquire().await?;
        let now = now_ms();

        Ok(JobRecord::reserve(
            &mut conn,
            channel.id,
            limit as i64,
            now,
            now + lock_duration.as_millis() as i64,
        )
        .await?)
    }

    pub(crate) async fn complete(&self, job: &JobRecord) -> Result<bool, Error> {
        let mut conn = self.inner.db.acquire().await?;
        Ok(job.complete(&mut conn, now_ms()).await?)
    }

    pub(crate) async fn fail(&self, job: &JobRecord, error: &str) -> Result<FailOutcome, Error> {
        let mut conn = self.inner.db.acquire().await?;
        Ok(job.fail(&mut conn, error, now_ms()).await?)
    }

    pub(crate) async fn extend_locks(
        &self,
        held: &[(JobId, i64)],
        lock_duration: Duration,
    ) -> Result<u64, Error> {
        let mut conn = self.inner.db.acquire().await?;

        Ok(JobRecord::extend_locks(&mut conn, held, now_ms() + lock_duration.as_millis() as i64).await?)
    }

    pub(crate) async fn recover_stalled(&self, channel: &Channel) -> Result<Vec<StalledJob>, Error> {
        let mut conn = self.inner.db.acquire().await?;
        Ok(JobRecord::recover_stalled(&mut conn, channel.id, now_ms()).await?)
    }

    pub async fn list_queues(&self) -> Result<Vec<QueueRow>, Error> {
        let mut conn = self.inner.db.acquire().await?;
        Ok(QueueRow::list(&mut conn).await?)
    }

    /// Job counts for every registered queue.
    pub async fn statistics(&self) -> Result<Vec<QueueStatistics>, Error> {
        let mut conn = self.inner.db.acquire().await?;
        Ok(QueueRow::statistics(&mut conn, now_ms()).await?)
    }

    pub async fn counts(&self, queue: impl AsRef<str>) -> Result<QueueStatistics, Error> {
        let mut conn = self.inner.db.acquire().await?;

        QueueRow::statistics_for(&mut conn, queue.as_ref(), now_ms())
            .await?
            .ok_or_else(|| Error::queue_not_found(queue.as_ref()))
    }

    pub async fn jobs(
        &self,
        queue: impl AsRef<str>,
        state: JobState,
        limit: u32,
    ) -> Result<Vec<JobSummary>, Error> {
        let mut conn = self.inner.db.acquire().await?;

        let queue_id = QueueRow::get_id(&mut conn, queue.as_ref())
            .await?
            .ok_or_else(|| Error::queue_not_found(queue.as_ref()))?;

        Ok(JobRecord::list(&mut conn, queue_id, state, limit as i64)
            .await?
            .into_iter()
            .map(JobSummary::from)
            .collect())
    }

    pub async fn job(&self, queue: impl AsRef<str>, id: JobId) -> Result<JobSummary, Error> {
        let mut conn = self.inner.db.acquire().await?;

        let queue_id = QueueRow::get_id(&mut conn, queue.as_ref())
            .await?
            .ok_or_else(|| Error::queue_not_found(queue.as_ref()))?;

        JobRecord::get(&mut conn, queue_id, id)
            .await?
            .map(JobSummary::from)
            .ok_or_else(|| Error::job_not_found(id, queue.as_ref()))
    }

    /// Manually re-queues a failed job with a fresh attempt budget.
    pub async fn replay(&self, queue: impl AsRef<str>, id: JobId) -> Result<(), Error> {
        let mut conn = self.inner.db.acquire().await?;

        let queue_id = QueueRow::get_id(&mut conn, queue.as_ref())
            .await?
            .ok_or_else(|| Error::queue_not_found(queue.as_ref()))?;

        match JobRecord::replay(&mut conn, queue_id, id, now_ms()).await? {
            ReplayOutcome::Replayed => {}
            ReplayOutcome::NotFailed => return Err(Error::job_not_found(id, queue.as_ref())),
            ReplayOutcome::DedupConflict => {
                return Err(Error::ReplayConflict {
                    job_id: id,
                    queue: queue.as_ref().to_owned(),
                })
            }
        }

        tracing::info!(queue = queue.as_ref(), id, "Failed job replayed");

        if let Some(channel) = self.inner.channels.pin().get(queue.as_ref()) {
            channel.notify.notify_waiters();
        }

        Ok(())
    }
}
