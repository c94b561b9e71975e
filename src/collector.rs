//! Many-to-one aggregation in front of batch-oriented consumers.
//!
//! A collector consumes single events from an input queue and emits one
//! aggregated event to an output queue once `buffer_size` events have arrived
//! or `flush_interval` has passed since the batch was opened, whichever comes
//! first.
//!
//! Input jobs are not completed when they are buffered. Each processor call
//! waits until its batch is flushed, so the broker keeps the job `active` for
//! the lifetime of the batch. If the process dies first, the jobs stall and are
//! redelivered. If aggregation or the output enqueue fails, every job of the
//! batch fails together and goes through its own retry policy.

use std::{sync::Arc, time::Duration};

use serde::{de::DeserializeOwned, Serialize};
use tokio::{
    sync::{oneshot, Mutex},
    time::Instant,
};
use tracing::Instrument;

use crate::{
    message::{Job, JobOptions},
    queue::Queue,
    worker::{worker, WorkerHandle, WorkerSettings},
};

/// Job name of every aggregated event.
pub const COLLECTED_EVENTS: &str = "CollectedEvents";

struct Entry<T> {
    payload: T,
    ack: oneshot::Sender<Result<(), String>>,
}

struct Batch<T> {
    entries: Vec<Entry<T>>,
    opened_at: Instant,
}

impl<T> Batch<T> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            opened_at: Instant::now(),
        }
    }
}

struct Collector<In, Out, A> {
    input: String,
    output: Queue<Out>,
    aggregate: A,
    buffer_size: usize,
    flush_interval: Duration,
    /// At most one open batch. Appends, threshold checks and taking the batch
    /// for a flush all happen under this lock.
    batch: Mutex<Option<Batch<In>>>,
}

impl<In, Out, A> Collector<In, Out, A>
where
    In: Send + Sync + 'static,
    Out: Serialize + DeserializeOwned + Send + Sync + 'static,
    A: Fn(Vec<In>) -> eyre::Result<Out> + Send + Sync + 'static,
{
    /// Buffers one payload and resolves once its batch has been flushed.
    async fn accept(self: Arc<Self>, payload: In) -> eyre::Result<()> {
        let (ack, done) = oneshot::channel();

        let full = {
            let mut open = self.batch.lock().await;

            let opened = open.is_none();
            let batch = open.get_or_insert_with(Batch::new);
            batch.entries.push(Entry { payload, ack });
            let len = batch.entries.len();

            if opened {
                tracing::debug!(input = %self.input, "No buffer, creating new buffer");
                self.arm_timer();
            } else {
                tracing::debug!(input = %self.input, len, buffer_size = self.buffer_size, "Adding event to buffer");
            }

            if len >= self.buffer_size {
                open.take()
            } else {
                None
            }
        };

        if let Some(batch) = full {
            tracing::info!(input = %self.input, len = batch.entries.len(), "Buffer full, flushing");
            self.flush_batch(batch).await;
        }

        match done.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(eyre::eyre!(message)),
            Err(_) => Err(eyre::eyre!("batch dropped before it was flushed")),
        }
    }

    /// One-shot flush timer for the batch that was just opened.
    ///
    /// It is never cancelled. If a size-triggered flush got there first, the
    /// timer flushes whatever batch is open when it fires, or nothing.
    fn arm_timer(self: &Arc<Self>) {
        let this = self.clone();

        tokio::spawn(
            async move {
                tokio::time::sleep(this.flush_interval).await;
                tracing::debug!(input = %this.input, "Flushing buffer due to timeout");
                this.flush().await;
            }
            .in_current_span(),
        );
    }

    /// Flushes the open batch; a no-op when there is none.
    async fn flush(&self) {
        let batch = self.batch.lock().await.take();

        match batch {
            Some(batch) => self.flush_batch(batch).await,
            None => tracing::debug!(input = %self.input, "No open batch to flush"),
        }
    }

    /// The batch has already been detached, so entries arriving meanwhile open
    /// a fresh one.
    async fn flush_batch(&self, batch: Batch<In>) {
        let age = batch.opened_at.elapsed();
        let (payloads, acks): (Vec<In>, Vec<_>) = batch
            .entries
            .into_iter()
            .map(|entry| (entry.payload, entry.ack))
            .unzip();
        let size = payloads.len();

        let result = async {
            tracing::debug!(input = %self.input, size, "Aggregating events");
            let event = (self.aggregate)(payloads)?;

            self.output
                .add(COLLECTED_EVENTS, &event, JobOptions::default())
                .await?;

            Ok::<_, eyre::Report>(())
        }
        .await;

        match result {
            Ok(()) => {
                tracing::info!(
                    input = %self.input,
                    output = self.output.name(),
                    size,
                    age_ms = age.as_millis() as u64,
                    "Sent aggregated event, acknowledging atomic events"
                );
                for ack in acks {
                    let _ = ack.send(Ok(()));
                }
            }
            Err(error) => {
                tracing::error!(
                    input = %self.input,
                    output = self.output.name(),
                    size,
                    error = %format!("{error:#}"),
                    "Failed to aggregate events, rejecting batch"
                );
                let message = format!("failed to aggregate events: {error:#}");
                for ack in acks {
                    let _ = ack.send(Err(message.clone()));
                }
            }
        }
    }
}

/// Starts a collector worker on `input` that emits aggregated events to `output`.
///
/// The worker runs with concurrency `buffer_size + 1`, so a full batch can be
/// flushed while the broker still holds further deliveries back.
#[bon::builder(finish_fn = spawn)]
pub fn collector<In, Out, A>(
    input: Queue<In>,
    output: Queue<Out>,
    aggregate: A,
    #[builder(default = 5)] buffer_size: usize,
    #[builder(default = Duration::from_secs(10))] flush_interval: Duration,
    settings: Option<WorkerSettings>,
) -> WorkerHandle
where
    In: Serialize + DeserializeOwned + Send + Sync + 'static,
    Out: Serialize + DeserializeOwned + Send + Sync + 'static,
    A: Fn(Vec<In>) -> eyre::Result<Out> + Send + Sync + 'static,
{
    let buffer_size = buffer_size.max(1);

    tracing::info!(
        buffer_size,
        flush_interval_ms = flush_interval.as_millis() as u64,
        from = input.name(),
        to = output.name(),
        "Collector setup"
    );

    let state = Arc::new(Collector {
        input: input.name().to_owned(),
        output,
        aggregate,
        buffer_size,
        flush_interval,
        batch: Mutex::new(None),
    });

    worker()
        .queue(input)
        .processor(move |job: Job<In>| state.clone().accept(job.data))
        .concurrency(buffer_size + 1)
        .maybe_settings(settings)
        .spawn()
}
