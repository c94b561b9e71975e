//! Typed queue handles and the delivery policy shared by every queue.

use std::{fmt, marker::PhantomData, sync::Arc, time::Duration};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::Notify;

use crate::{
    broker::Broker,
    error::Error,
    message::{JobId, JobOptions},
};

/// Retry delay curve between attempts.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    Exponential { base_delay: Duration },
}

impl Backoff {
    pub fn base_delay(&self) -> Duration {
        match self {
            Self::Exponential { base_delay } => *base_delay,
        }
    }

    /// Delay before the retry that follows failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        crate::db::job::backoff_delay(self.base_delay().as_millis() as i64, attempt as i64)
    }
}

/// How the broker treats jobs enqueued through a queue handle.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub retain_completed: bool,
    pub retain_failed: bool,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Backoff::Exponential {
                base_delay: Duration::from_millis(5_000),
            },
            retain_completed: false,
            retain_failed: true,
        }
    }
}

/// Process-wide state behind one queue name.
pub struct Channel {
    pub(crate) id: i64,
    pub(crate) name: String,
    pub(crate) notify: Notify,
}

impl Channel {
    pub(crate) fn new(id: i64, name: String) -> Self {
        Self {
            id,
            name,
            notify: Notify::new(),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Handle to a named durable queue carrying payloads of type `T`.
///
/// Handles are cheap to clone. Every handle created for the same name shares
/// one [`Channel`].
pub struct Queue<T> {
    broker: Broker,
    channel: Arc<Channel>,
    policy: DeliveryPolicy,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            broker: self.broker.clone(),
            channel: self.channel.clone(),
            policy: self.policy,
            _payload: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.channel.name)
            .field("policy", &self.policy)
            .finish()
    }
}

impl<T> Queue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub(crate) fn new(broker: Broker, channel: Arc<Channel>) -> Self {
        Self {
            broker,
            channel,
            policy: DeliveryPolicy::default(),
            _payload: PhantomData,
        }
    }

    /// Overrides the delivery policy for jobs added through this handle.
    pub fn with_policy(mut self, policy: DeliveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.channel.name
    }

    pub fn policy(&self) -> &DeliveryPolicy {
        &self.policy
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub(crate) fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Durably enqueues a message. Returns `None` if a waiting or active job
    /// with the same dedup key already exists.
    pub async fn add(
        &self,
        name: impl AsRef<str>,
        payload: &T,
        opts: JobOptions,
    ) -> Result<Option<JobId>, Error> {
        let payload = serde_json::to_string(payload)?;

        self.broker
            .enqueue(&self.channel, name.as_ref(), &payload, &opts, &self.policy)
            .await
    }
}
