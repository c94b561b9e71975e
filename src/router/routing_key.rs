use std::{collections::HashMap, fmt::Debug, future::Future, hash::Hash, sync::Arc};

use serde::{de::DeserializeOwned, Serialize};

use crate::{
    message::Job,
    queue::Queue,
    worker::{worker, WorkerHandle},
};

/// Partition identifier used to pick a destination.
pub trait RoutingKey: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

impl<K> RoutingKey for K where K: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

/// A destination queue and the key that selects it.
#[derive(Debug, Clone)]
pub struct Route<K, T> {
    pub queue: Queue<T>,
    pub key: K,
}

impl<K, T> Route<K, T> {
    pub fn new(key: K, queue: Queue<T>) -> Self {
        Self { queue, key }
    }
}

/// Builds the key lookup once. The first destination registered for a key wins.
fn route_map<K, V>(routes: impl IntoIterator<Item = (K, V)>) -> HashMap<K, V>
where
    K: RoutingKey,
{
    let mut map = HashMap::new();

    for (key, destination) in routes {
        if map.contains_key(&key) {
            tracing::warn!(routing_key = ?key, "Duplicate routing key, keeping the first destination");
            continue;
        }
        map.insert(key, destination);
    }

    map
}

/// Sends each job from `from` to the one destination whose key equals
/// `extract_key(payload)`.
///
/// ```text
///         _    A.1
///        /
/// A ---->      A.2
///        \____ A.3
/// ```
///
/// Jobs whose key matches no destination are dropped with a debug log; this
/// route narrows the stream, it does not dead-letter.
pub fn routing_key<K, T, E, Fut>(from: Queue<T>, to: Vec<Route<K, T>>, extract_key: E) -> WorkerHandle
where
    K: RoutingKey,
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    E: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = eyre::Result<K>> + Send + 'static,
{
    let queues = Arc::new(route_map(to.into_iter().map(|route| (route.key, route.queue))));

    let routing: HashMap<String, &str> = queues
        .iter()
        .map(|(key, queue)| (format!("{key:?}"), queue.name()))
        .collect();
    tracing::info!(from = from.name(), routing = ?routing, "Routing key rule set");

    let extract_key = Arc::new(extract_key);

    worker()
        .queue(from)
        .processor(move |job: Job<T>| {
            let queues = queues.clone();
            let extract_key = extract_key.clone();
            async move {
                let key = extract_key(job.data.clone()).await?;

                match queues.get(&key) {
                    Some(queue) => {
                        queue.add(&job.name, &job.data, job.opts).await?;
                    }
                    None => {
                        tracing::debug!(id = job.id, routing_key = ?key, "No queue for routing key");
                    }
                }

                Ok::<_, eyre::Report>(())
            }
        })
        .spawn()
}
