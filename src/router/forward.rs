use serde::{de::DeserializeOwned, Serialize};

use crate::{
    message::Job,
    queue::Queue,
    worker::{worker, WorkerHandle},
};

/// Republishes every job from `from` onto `to` unchanged, dedup key included.
///
/// ```text
/// A ----> B
/// ```
pub fn forward<T>(from: Queue<T>, to: Queue<T>) -> WorkerHandle
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    tracing::info!(from = from.name(), to = to.name(), "Forwarding rule set");

    worker()
        .queue(from)
        .processor(move |job: Job<T>| {
            let to = to.clone();
            async move {
                to.add(&job.name, &job.data, job.opts).await?;
                Ok::<_, eyre::Report>(())
            }
        })
        .spawn()
}
