//! The token metadata pipeline served by the binary.
//!
//! Refresh signals fan out to the independent sources, which request updates
//! for the tokens they know about. Every update is broadcast to the
//! per-network deployment and on-chain metadata stages. Deployments that
//! changed feed the canonical bridge collectors.

use std::{sync::Arc, time::Duration};

use crate::{
    api::trigger::Triggers,
    broker::Broker,
    error::Error,
    message::{Job, JobId, JobOptions},
    payloads::{collect_token_ids, BatchTokenPayload, RefreshSignal, TokenPayload},
    pipeline::Pipeline,
    queue::Queue,
    router::Route,
    utils::chain_of,
    Application,
};

/// Bridges whose canonical token mappings are read in batches.
pub const CANONICAL_BRIDGES: &[&str] = &["Arbitrum", "Optimism", "ZkSync"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Network {
    pub name: String,
    pub chain_id: u64,
}

impl Network {
    pub fn new(name: impl Into<String>, chain_id: u64) -> Self {
        Self {
            name: name.into(),
            chain_id,
        }
    }
}

/// An independent listing of tokens. Its processor runs as `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSource {
    pub name: String,
    pub token_ids: Vec<String>,
}

impl TokenSource {
    pub fn new<I, S>(name: impl Into<String>, token_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            token_ids: token_ids.into_iter().map(Into::into).collect(),
        }
    }
}

/// Asks for `token_id` to be refreshed. Returns `None` while an update for
/// the same token is still pending.
pub async fn request_update(
    queue: &Queue<TokenPayload>,
    token_id: &str,
) -> Result<Option<JobId>, Error> {
    queue
        .add(
            "TokenUpdateRequest",
            &TokenPayload::new(token_id),
            JobOptions::dedup(token_id),
        )
        .await
}

async fn token_chain(payload: TokenPayload) -> eyre::Result<u64> {
    chain_of(&payload.token_id)
}

/// Wires the whole token pipeline onto `broker`.
#[bon::builder(finish_fn = assemble)]
pub async fn token_pipeline(
    broker: Broker,
    networks: Vec<Network>,
    sources: Vec<TokenSource>,
    #[builder(default = 100)] buffer_size: usize,
    #[builder(default = Duration::from_secs(60))] flush_interval: Duration,
) -> Result<Application, Error> {
    let mut pipeline = Pipeline::new(broker);

    let refresh = pipeline.queue::<RefreshSignal>("RefreshInbox").await?;
    let token_updates = pipeline.queue::<TokenPayload>("TokenUpdateInbox").await?;

    let mut source_queues = Vec::with_capacity(sources.len());
    for source in sources {
        let updates = token_updates.clone();
        let name = source.name.clone();
        let token_ids: Arc<[String]> = source.token_ids.into();

        let queue = pipeline
            .queue_with_processor(source.name, move |job: Job<RefreshSignal>| {
                let updates = updates.clone();
                let token_ids = token_ids.clone();
                async move {
                    let mut requested = 0;
                    for token_id in token_ids.iter() {
                        if request_update(&updates, token_id).await?.is_some() {
                            requested += 1;
                        }
                    }
                    tracing::info!(queue = %job.queue, requested, "Source refreshed");
                    Ok::<_, eyre::Report>(())
                }
            })
            .await?;
        pipeline.publishes(&name, &token_updates);
        source_queues.push(queue);
    }
    pipeline.broadcast(&refresh, &source_queues)?;

    let deployment_inbox = pipeline
        .queue::<TokenPayload>("DeploymentRoutingInbox")
        .await?;
    let on_chain_inbox = pipeline
        .queue::<TokenPayload>("OnChainMetadataRoutingInbox")
        .await?;
    pipeline.broadcast(
        &token_updates,
        &[deployment_inbox.clone(), on_chain_inbox.clone()],
    )?;

    let deployment_updates = pipeline
        .queue::<TokenPayload>("DeploymentUpdatedInbox")
        .await?;

    let mut deployments = Vec::with_capacity(networks.len());
    let mut on_chain = Vec::with_capacity(networks.len());

    for Network { name: network, chain_id } in networks {
        let updated = deployment_updates.clone();
        let deployment = pipeline
            .queue_with_processor(
                format!("DeploymentProcessor:{network}"),
                move |job: Job<TokenPayload>| {
                    let updated = updated.clone();
                    async move {
                        tracing::info!(chain_id, token_id = %job.data.token_id, "Deployment updated");
                        updated
                            .add(
                                "DeploymentUpdated",
                                &job.data,
                                JobOptions::dedup(job.data.token_id.as_str()),
                            )
                            .await?;
                        Ok::<_, eyre::Report>(())
                    }
                },
            )
            .await?;
        pipeline.publishes(deployment.name(), &deployment_updates);
        deployments.push(Route::new(chain_id, deployment));

        // Metadata is read in batches to spare the node a call per token.
        let collector = pipeline
            .queue::<TokenPayload>(format!("OnChainMetadataEventCollector:{network}"))
            .await?;
        let batch = pipeline
            .queue_with_processor(
                format!("OnChainMetadataBatchProcessor:{network}"),
                move |job: Job<BatchTokenPayload>| async move {
                    tracing::info!(
                        chain_id,
                        tokens = job.data.token_ids.len(),
                        "Fetching on-chain metadata"
                    );
                    Ok::<_, eyre::Report>(())
                },
            )
            .await?;
        pipeline.collector(
            &collector,
            &batch,
            collect_token_ids,
            buffer_size,
            flush_interval,
        )?;
        on_chain.push(Route::new(chain_id, collector));
    }

    pipeline.routing_key(&deployment_inbox, deployments, token_chain)?;
    pipeline.routing_key(&on_chain_inbox, on_chain, token_chain)?;

    let mut canonical = Vec::with_capacity(CANONICAL_BRIDGES.len());
    for &bridge in CANONICAL_BRIDGES {
        let collector = pipeline
            .queue::<TokenPayload>(format!("{bridge}CanonicalEventCollector"))
            .await?;
        let batch = pipeline
            .queue_with_processor(
                format!("{bridge}CanonicalBatchProcessor"),
                move |job: Job<BatchTokenPayload>| async move {
                    tracing::info!(
                        bridge,
                        tokens = job.data.token_ids.len(),
                        "Fetching canonical mappings"
                    );
                    Ok::<_, eyre::Report>(())
                },
            )
            .await?;
        pipeline.collector(
            &collector,
            &batch,
            collect_token_ids,
            buffer_size,
            flush_interval,
        )?;
        canonical.push(collector);
    }
    pipeline.broadcast(&deployment_updates, &canonical)?;

    Ok(Application {
        pipeline,
        triggers: Triggers {
            token_updates,
            refresh,
        },
    })
}
