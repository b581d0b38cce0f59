//! `aptindex process` — run the supervised pipeline.

use std::sync::Arc;

use anyhow::{Context, Result};

use aptindex_aptos::{CoinFlipConfig, CoinFlipProcessor, RestStreamConfig, RestStreamProvider};
use aptindex_core::{IndexerConfig, ProcessorManager, StreamExit, Supervisor};

pub async fn run(config: IndexerConfig) -> Result<()> {
    let chain = config.chain()?;
    let store = aptindex_storage::connect(&config.db_connection_uri)
        .await
        .context("opening storage")?;
    let provider = RestStreamProvider::new(RestStreamConfig::from_indexer_config(&config))
        .context("building stream provider")?;

    let mut manager =
        ProcessorManager::new(chain.id(), config.starting_version, store, Arc::new(provider));
    if CoinFlipConfig::for_chain(chain).is_some() {
        manager = manager.with_coprocessor(Arc::new(CoinFlipProcessor::new(chain)?));
    } else {
        tracing::warn!(%chain, "coin_flip is not deployed on this chain; running the super stream only");
    }

    tracing::info!(
        %chain,
        endpoint = %config.stream_endpoint,
        starting_version = config.starting_version,
        consumer = %manager.super_processor_name(),
        "starting aptindex"
    );

    let mut supervisor = Supervisor::new(config.retry.clone());
    tokio::select! {
        result = supervisor.run(&manager) => {
            let StreamExit::Ended { next_version } = result.context("pipeline stopped")?;
            tracing::info!(next_version, "stream closed");
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("listening for shutdown signal")?;
            tracing::info!("shutdown signal received");
        }
    }
    Ok(())
}
