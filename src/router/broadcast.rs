use futures_util::future::join_all;
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    message::Job,
    queue::Queue,
    worker::{worker, WorkerHandle},
};

/// Republishes every job from `from` onto each queue in `to`.
///
/// ```text
///         ____ A.1
///        /
/// A ----> ---- A.2
///        \____ A.3
/// ```
///
/// Publishes are independent: a failing destination is logged and does not
/// keep the others from receiving the job. The source job is only retried
/// when no destination accepted it, so a partial failure never duplicates
/// deliveries to the destinations that succeeded.
pub fn broadcast<T>(from: Queue<T>, to: Vec<Queue<T>>) -> WorkerHandle
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    tracing::info!(
        from = from.name(),
        to = ?to.iter().map(|queue| queue.name()).collect::<Vec<_>>(),
        "Broadcast rule set"
    );

    worker()
        .queue(from)
        .processor(move |job: Job<T>| {
            let to = to.clone();
            async move {
                let results = join_all(
                    to.iter()
                        .map(|queue| queue.add(&job.name, &job.data, job.opts.clone())),
                )
                .await;

                let mut failed = 0;
                for (queue, result) in to.iter().zip(results) {
                    if let Err(error) = result {
                        failed += 1;
                        tracing::error!(
                            id = job.id,
                            to = queue.name(),
                            error = %error,
                            "Broadcast publish failed"
                        );
                    }
                }

                if !to.is_empty() && failed == to.len() {
                    eyre::bail!("broadcast failed for all {failed} destinations");
                }

                Ok::<_, eyre::Report>(())
            }
        })
        .spawn()
}
