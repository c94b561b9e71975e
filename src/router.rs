//! Topologies that connect one queue's output to other queues.
//!
//! Every route is a single worker on the source queue whose processor
//! republishes jobs to the destinations. The route lives as long as that
//! worker.

mod broadcast;
mod forward;
mod routing_key;

pub use broadcast::broadcast;
pub use forward::forward;
pub use routing_key::{routing_key, Route, RoutingKey};

use serde::{Deserialize, Serialize};

/// Shape of an edge in a pipeline graph.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum Topology {
    Forward,
    Broadcast,
    RoutingKey,
    Collector,
    /// A processor that enqueues onto another queue as a side effect.
    Publish,
}
