//! Assembly of queues, routes and collectors into one graph.
//!
//! A [`Pipeline`] owns the worker of every route it wires and records the
//! edges so the graph can be inspected. It keeps provenance traceable by
//! allowing exactly one writer-side route into each inbox.

use std::{collections::HashMap, future::Future, time::Duration};

use futures_util::future::join_all;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    broker::Broker,
    collector::collector,
    error::Error,
    queue::Queue,
    router::{self, Route, RoutingKey, Topology},
    worker::{worker, Processor, WorkerHandle},
};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub from: String,
    pub to: Vec<String>,
    pub topology: Topology,
}

pub struct Pipeline {
    broker: Broker,
    edges: Vec<Edge>,
    /// inbox name -> the source queue of the route that writes into it
    writers: HashMap<String, String>,
    workers: Vec<WorkerHandle>,
}

impl Pipeline {
    pub fn new(broker: Broker) -> Self {
        Self {
            broker,
            edges: Vec::new(),
            writers: HashMap::new(),
            workers: Vec::new(),
        }
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub async fn queue<T>(&self, name: impl Into<String>) -> Result<Queue<T>, Error>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.broker.queue(name).await
    }

    /// Creates a queue and a worker running `processor` on it.
    pub async fn queue_with_processor<T, P>(
        &mut self,
        name: impl Into<String>,
        processor: P,
    ) -> Result<Queue<T>, Error>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        P: Processor<T>,
    {
        let queue = self.broker.queue::<T>(name).await?;

        self.workers
            .push(worker().queue(queue.clone()).processor(processor).spawn());

        tracing::info!(queue = queue.name(), "Queue created");

        Ok(queue)
    }

    pub fn forward<T>(&mut self, from: &Queue<T>, to: &Queue<T>) -> Result<(), Error>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.claim(from.name(), [to.name()])?;
        self.add_edge(from.name(), [to.name()], Topology::Forward);

        self.workers.push(router::forward(from.clone(), to.clone()));
        Ok(())
    }

    pub fn broadcast<T>(&mut self, from: &Queue<T>, to: &[Queue<T>]) -> Result<(), Error>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let names = to.iter().map(|queue| queue.name());
        self.claim(from.name(), names.clone())?;
        self.add_edge(from.name(), names, Topology::Broadcast);

        self.workers
            .push(router::broadcast(from.clone(), to.to_vec()));
        Ok(())
    }

    pub fn routing_key<K, T, E, Fut>(
        &mut self,
        from: &Queue<T>,
        to: Vec<Route<K, T>>,
        extract_key: E,
    ) -> Result<(), Error>
    where
        K: RoutingKey,
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        E: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = eyre::Result<K>> + Send + 'static,
    {
        let names: Vec<String> = to.iter().map(|route| route.queue.name().to_owned()).collect();
        self.claim(from.name(), names.iter().map(String::as_str))?;
        self.add_edge(from.name(), names.iter().map(String::as_str), Topology::RoutingKey);

        self.workers
            .push(router::routing_key(from.clone(), to, extract_key));
        Ok(())
    }

    pub fn collector<In, Out, A>(
        &mut self,
        input: &Queue<In>,
        output: &Queue<Out>,
        aggregate: A,
        buffer_size: usize,
        flush_interval: Duration,
    ) -> Result<(), Error>
    where
        In: Serialize + DeserializeOwned + Send + Sync + 'static,
        Out: Serialize + DeserializeOwned + Send + Sync + 'static,
        A: Fn(Vec<In>) -> eyre::Result<Out> + Send + Sync + 'static,
    {
        self.claim(input.name(), [output.name()])?;
        self.add_edge(input.name(), [output.name()], Topology::Collector);

        self.workers.push(
            collector()
                .input(input.clone())
                .output(output.clone())
                .aggregate(aggregate)
                .buffer_size(buffer_size)
                .flush_interval(flush_interval)
                .spawn(),
        );
        Ok(())
    }

    /// Records that the processor of `from` enqueues onto `to`.
    ///
    /// Processors are not routes, so any number of them may publish into the
    /// same inbox.
    pub fn publishes<T>(&mut self, from: &str, to: &Queue<T>)
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.add_edge(from, [to.name()], Topology::Publish);
    }

    pub fn topology(&self) -> &[Edge] {
        &self.edges
    }

    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    /// Stops every worker. Jobs that do not finish within `timeout` stay
    /// `active` and are redelivered after their locks expire.
    pub async fn shutdown(self, timeout: Duration) {
        tracing::info!(workers = self.workers.len(), "Stopping pipeline");

        join_all(
            self.workers
                .into_iter()
                .map(|handle| handle.shutdown(timeout)),
        )
        .await;
    }

    /// Registers `from` as the only writer-side route of each destination.
    fn claim<'a>(&mut self, from: &str, to: impl IntoIterator<Item = &'a str>) -> Result<(), Error> {
        let to: Vec<&str> = to.into_iter().collect();

        for inbox in &to {
            if let Some(existing) = self.writers.get(*inbox) {
                return Err(Error::DuplicateRoute {
                    queue: (*inbox).to_owned(),
                    existing: existing.clone(),
                });
            }
        }

        for inbox in to {
            self.writers.insert(inbox.to_owned(), from.to_owned());
        }

        Ok(())
    }

    fn add_edge<'a>(&mut self, from: &str, to: impl IntoIterator<Item = &'a str>, topology: Topology) {
        self.edges.push(Edge {
            from: from.to_owned(),
            to: to.into_iter().map(str::to_owned).collect(),
            topology,
        });
    }
}
