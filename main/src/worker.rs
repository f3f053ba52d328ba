use std::{sync::Arc, time::Duration};

use common::{
    messaging::RabbitMqClient,
    storage::db::SurrealDbClient,
    utils::{
        config::get_config,
        embedding::{CachedEmbedder, EmbeddingBackend, OpenAiEmbedder},
    },
};
use investigation_pipeline::{
    consumer::{ConsumerRegistry, InvestigationConsumer},
    investigator::Investigator,
    watchdog::StaleWatchdog,
};
use retrieval_pipeline::Retriever;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = get_config()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );
    db.ensure_initialized(config.embedding_dimensions as usize)
        .await?;

    let mq = Arc::new(RabbitMqClient::new(&config.amqp_addr).await?);

    let embedder = Arc::new(CachedEmbedder::new(
        Arc::new(OpenAiEmbedder::from_config(&config)) as Arc<dyn EmbeddingBackend>,
        Duration::from_secs(config.cache_ttl),
    ));
    let retriever = Arc::new(Retriever::new(Arc::clone(&db), embedder));

    let investigator = Arc::new(Investigator::new(
        Arc::clone(&db),
        retriever,
        config.clone(),
    ));

    let watchdog = StaleWatchdog::new(Arc::clone(&db), &config);
    tokio::spawn(async move { watchdog.run().await });

    let mut registry = ConsumerRegistry::new(Arc::clone(&mq));
    registry.register(InvestigationConsumer::new(
        mq,
        investigator,
        config.investigation_parallelism,
    ));

    registry.run().await?;

    Ok(())
}
