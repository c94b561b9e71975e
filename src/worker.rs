//! Concurrent consumers bound to one queue.
//!
//! A worker reserves jobs up to its concurrency bound, runs the processor for
//! each one on its own task and reports the outcome back to the broker. While a
//! job is in flight the worker keeps extending its lock; a job whose lock runs
//! out (because the process died, say) is picked up by the stall sweep and
//! redelivered.

use std::{
    collections::HashMap,
    future::Future,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::Duration,
};

use futures_util::{future::BoxFuture, FutureExt};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{broadcast, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::Instrument;

use crate::{
    config::Config,
    db::job::FailOutcome,
    message::{Job, JobId, JobRecord, JobState},
    queue::Queue,
};

/// User code run once per delivered job.
///
/// Returning `Ok` completes the job. Any error sends it through the queue's
/// retry policy.
pub trait Processor<T>: Send + Sync + 'static {
    fn process(&self, job: Job<T>) -> BoxFuture<'static, eyre::Result<()>>;
}

impl<T, F, Fut> Processor<T> for F
where
    T: Send + 'static,
    F: Fn(Job<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = eyre::Result<()>> + Send + 'static,
{
    fn process(&self, job: Job<T>) -> BoxFuture<'static, eyre::Result<()>> {
        Box::pin(self(job))
    }
}

/// Lifecycle notifications. Meant for logging and metrics only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Active {
        id: JobId,
        name: String,
    },
    Completed {
        id: JobId,
        name: String,
    },
    Failed {
        id: JobId,
        name: String,
        attempt: u32,
        error: String,
        /// No attempts left; the job is now `failed`
        terminal: bool,
    },
    /// The job's lock expired without an explicit outcome.
    Stalled {
        id: JobId,
        name: String,
        /// The stall spent the last attempt
        terminal: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    pub lock_duration: Duration,
    pub poll_interval: Duration,
    pub stalled_interval: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            lock_duration: config.lock_duration(),
            poll_interval: config.poll_interval(),
            stalled_interval: config.stalled_interval(),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

const EVENT_CAPACITY: usize = 1024;

/// Starts a worker on `queue`.
///
/// ```ignore
/// let handle = worker()
///     .queue(queue)
///     .processor(|job: Job<TokenPayload>| async move { Ok(()) })
///     .concurrency(4)
///     .spawn();
/// ```
#[bon::builder(finish_fn = spawn)]
pub fn worker<T, P>(
    queue: Queue<T>,
    processor: P,
    #[builder(default = 1)] concurrency: usize,
    settings: Option<WorkerSettings>,
) -> WorkerHandle
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    P: Processor<T>,
{
    let concurrency = concurrency.max(1);
    let settings = settings.unwrap_or_else(|| WorkerSettings::from_config(queue.broker().config()));

    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    let runner = Arc::new(Runner {
        queue,
        processor,
        concurrency,
        settings,
        slots: Arc::new(Semaphore::new(concurrency)),
        in_flight: Mutex::new(HashMap::new()),
        events: events.clone(),
        cancel: cancel.clone(),
        tracker: tracker.clone(),
    });

    let span = tracing::info_span!("worker", queue = %runner.queue.name());

    tracker.spawn(runner.clone().poll_loop().instrument(span.clone()));
    tracker.spawn(runner.clone().heartbeat_loop().instrument(span.clone()));
    tracker.spawn(runner.clone().stalled_loop().instrument(span));
    tracker.close();

    tracing::debug!(queue = %runner.queue.name(), concurrency, "Worker started");

    WorkerHandle {
        queue: runner.queue.name().to_owned(),
        events,
        cancel,
        tracker,
    }
}

/// Owner of a running worker.
///
/// Dropping the handle does not stop the worker; call [`WorkerHandle::shutdown`].
pub struct WorkerHandle {
    queue: String,
    events: broadcast::Sender<WorkerEvent>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl WorkerHandle {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    /// Stops reserving new jobs and waits up to `timeout` for in-flight ones.
    ///
    /// Jobs still running when the timeout elapses stay `active` and are
    /// redelivered once their lock expires. Returns whether everything drained.
    pub async fn shutdown(self, timeout: Duration) -> bool {
        tracing::info!(queue = %self.queue, "Stopping worker");

        self.cancel.cancel();

        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    queue = %self.queue,
                    in_flight = self.tracker.len(),
                    "Worker stopped with jobs still in flight"
                );
                false
            }
        }
    }
}

struct Runner<T, P> {
    queue: Queue<T>,
    processor: P,
    concurrency: usize,
    settings: WorkerSettings,
    slots: Arc<Semaphore>,
    /// Held job id -> the attempt it was reserved under
    in_flight: Mutex<HashMap<JobId, i64>>,
    events: broadcast::Sender<WorkerEvent>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl<T, P> Runner<T, P>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    P: Processor<T>,
{
    fn emit(&self, event: WorkerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn idle(&self, wait: impl Future<Output = ()>) -> bool {
        tokio::select! {
            () = wait => true,
            () = self.cancel.cancelled() => false,
        }
    }

    async fn poll_loop(self: Arc<Self>) {
        let channel = self.queue.channel().clone();

        loop {
            let first = tokio::select! {
                permit = self.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                () = self.cancel.cancelled() => break,
            };

            let mut permits = vec![first];
            while permits.len() < self.concurrency {
                match self.slots.clone().try_acquire_owned() {
                    Ok(permit) => permits.push(permit),
                    Err(_) => break,
                }
            }

            // Register for wakeups before looking, so an add racing the
            // reservation is not missed.
            let notified = channel.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let jobs = match self
                .queue
                .broker()
                .reserve(&channel, permits.len(), self.settings.lock_duration)
                .await
            {
                Ok(jobs) => jobs,
                Err(error) => {
                    tracing::error!(error = %error, "Failed to reserve jobs");
                    drop(permits);
                    if !self.idle(tokio::time::sleep(self.settings.poll_interval)).await {
                        break;
                    }
                    continue;
                }
            };

            if jobs.is_empty() {
                drop(permits);
                let wait = async {
                    tokio::select! {
                        () = notified => {},
                        () = tokio::time::sleep(self.settings.poll_interval) => {},
                    }
                };
                if !self.idle(wait).await {
                    break;
                }
                continue;
            }

            for (record, permit) in jobs.into_iter().zip(permits) {
                self.in_flight.lock().await.insert(record.id, record.attempts);
                self.tracker.spawn(self.clone().handle(record, permit).in_current_span());
            }
        }

        tracing::debug!("Worker poll loop stopped");
    }

    async fn handle(self: Arc<Self>, record: JobRecord, permit: OwnedSemaphorePermit) {
        let id = record.id;
        let attempt = record.attempts as u32;

        tracing::debug!(id, event = %record.name, attempt, "Event processing job");
        self.emit(WorkerEvent::Active {
            id,
            name: record.name.clone(),
        });

        let result = match record.clone().into_job::<T>(self.queue.name()) {
            Ok(job) => AssertUnwindSafe(self.processor.process(job))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(eyre::eyre!("processor panicked"))),
            Err(error) => Err(eyre::eyre!("malformed payload: {error}")),
        };

        let broker = self.queue.broker();

        match result {
            Ok(()) => match broker.complete(&record).await {
                Ok(true) => {
                    tracing::debug!(id, event = %record.name, "Event processing done");
                    self.emit(WorkerEvent::Completed {
                        id,
                        name: record.name.clone(),
                    });
                }
                Ok(false) => {
                    tracing::warn!(id, event = %record.name, "Job lock lost before completion");
                }
                Err(error) => {
                    tracing::error!(id, error = %error, "Failed to mark job completed");
                }
            },
            Err(report) => {
                let message = format!("{report:#}");

                match broker.fail(&record, &message).await {
                    Ok(FailOutcome::Retrying { delay }) => {
                        tracing::warn!(
                            id,
                            event = %record.name,
                            attempt,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %message,
                            "Event processing failed, retrying"
                        );
                        self.emit(WorkerEvent::Failed {
                            id,
                            name: record.name.clone(),
                            attempt,
                            error: message,
                            terminal: false,
                        });
                    }
                    Ok(FailOutcome::Failed) => {
                        tracing::error!(
                            id,
                            event = %record.name,
                            attempt,
                            error = %message,
                            "Event processing failed"
                        );
                        self.emit(WorkerEvent::Failed {
                            id,
                            name: record.name.clone(),
                            attempt,
                            error: message,
                            terminal: true,
                        });
                    }
                    Ok(FailOutcome::LockLost) => {
                        tracing::warn!(id, event = %record.name, "Job lock lost before failure was recorded");
                    }
                    Err(error) => {
                        tracing::error!(id, error = %error, "Failed to record job failure");
                    }
                }
            }
        }

        self.in_flight.lock().await.remove(&id);
        drop(permit);
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let period = (self.settings.lock_duration / 2).max(Duration::from_millis(10));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while self.idle(interval.tick().map(|_| ())).await {
            let held: Vec<(JobId, i64)> = self
                .in_flight
                .lock()
                .await
                .iter()
                .map(|(id, attempts)| (*id, *attempts))
                .collect();

            if let Err(error) = self
                .queue
                .broker()
                .extend_locks(&held, self.settings.lock_duration)
                .await
            {
                tracing::error!(error = %error, held = held.len(), "Failed to extend job locks");
            }
        }
    }

    async fn stalled_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.settings.stalled_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while self.idle(interval.tick().map(|_| ())).await {
            let stalled = match self.queue.broker().recover_stalled(self.queue.channel()).await {
                Ok(stalled) => stalled,
                Err(error) => {
                    tracing::error!(error = %error, "Failed to check for stalled jobs");
                    continue;
                }
            };

            let requeued = stalled.iter().any(|job| job.state == JobState::Waiting);

            for job in stalled {
                let terminal = job.state == JobState::Failed;

                tracing::error!(id = job.id, event = %job.name, attempts = job.attempts, terminal, "Event processing stalled");
                self.emit(WorkerEvent::Stalled {
                    id: job.id,
                    name: job.name,
                    terminal,
                });
            }

            if requeued {
                self.queue.channel().notify.notify_waiters();
            }
        }
    }
}
