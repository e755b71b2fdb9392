//! TraceTune worker process: wires settings, postgres, redis, the
//! in-process broker, and the beat scheduler, then runs until
//! interrupted.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tracetune::llm::HttpGateway;
use tracetune::template::AnchorExtractor;
use tracetune::Settings;
use tracetune_broker::InProcessBroker;
use tracetune_engine::{default_beat, register_tasks, Engine};
use tracetune_postgres::PostgresStore;
use tracetune_redis::RedisLockService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env();
    info!(broker_url = %settings.broker_url(), "starting tracetune worker");

    let store = PostgresStore::connect(&settings.database_url)
        .await
        .context("connecting to postgres")?;
    store.migrate().await.context("applying schema")?;

    let locks = RedisLockService::connect(&settings.broker_url())
        .await
        .context("connecting to redis")?;

    let gateway = HttpGateway::from_settings(&settings);

    let broker = Arc::new(InProcessBroker::new());
    let engine = Arc::new(Engine {
        store: Arc::new(store),
        gateway: Arc::new(gateway),
        locks: Arc::new(locks),
        extractor: Arc::new(AnchorExtractor::default()),
    });
    register_tasks(&broker, engine);
    info!(tasks = broker.task_names().len(), "task registry ready");

    let handles = default_beat(broker).spawn();
    info!(entries = handles.len(), "beat schedule running");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    for handle in handles {
        handle.abort();
    }
    Ok(())
}
