use std::{future::Future, time::Duration};

use actix_cors::Cors;
use actix_web::{
    middleware::{NormalizePath, TrailingSlash},
    web::{Data, JsonConfig},
    App, HttpServer,
};
use api::trigger::Triggers;
use broker::Broker;
use config::Config;
use error::Error;
use pipeline::Pipeline;
use tracing::level_filters::LevelFilter;
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod api;
pub mod broker;
pub mod collector;
pub mod config;
pub mod db;
pub mod error;
pub mod message;
pub mod payloads;
pub mod pipeline;
pub mod queue;
pub mod router;
pub mod tokens;
pub mod utils;
pub mod worker;

/// How long in-flight jobs get to finish once the HTTP server has stopped.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Everything `setup` hands back to the server: the wired pipeline and the
/// entry queues the admin surface publishes to.
pub struct Application {
    pub pipeline: Pipeline,
    pub triggers: Triggers,
}

/// Returns a builder for the main application.
#[bon::builder(finish_fn = start)]
pub async fn run<S, F>(setup: S, config: Option<Config>) -> eyre::Result<()>
where
    S: FnOnce(Broker) -> F,
    F: Future<Output = Result<Application, Error>>,
{
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("SLUICE_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("SLUICE_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    let config = match config {
        Some(config) => config,
        None => Config::load()?,
    };
    let addr = (config.host().to_owned(), config.port());

    let broker = Broker::connect_with(config).await?;

    let Application { pipeline, triggers } = setup(broker.clone()).await?;

    tracing::info!(
        workers = pipeline.workers().len(),
        edges = pipeline.topology().len(),
        "Pipeline assembled"
    );

    let broker = Data::new(broker);
    let triggers = Data::new(triggers);
    let topology = Data::new(pipeline.topology().to_vec());

    tracing::info!(host = %addr.0, port = addr.1, "Starting admin server");

    HttpServer::new(move || {
        let cors = Cors::permissive();

        let json_cfg = JsonConfig::default().content_type_required(false);

        App::new()
            .wrap(TracingLogger::default())
            .wrap(NormalizePath::new(TrailingSlash::Trim))
            .wrap(cors)
            .configure(api::configure)
            .app_data(broker.clone())
            .app_data(triggers.clone())
            .app_data(topology.clone())
            .app_data(json_cfg)
    })
    .bind(addr)?
    .run()
    .await?;

    pipeline.shutdown(SHUTDOWN_GRACE).await;

    Ok(())
}
