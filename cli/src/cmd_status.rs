//! `aptindex status` — print every stored checkpoint.

use anyhow::{Context, Result};
use chrono::DateTime;

use aptindex_core::{Checkpoint, CheckpointStore, IndexerConfig};

pub async fn run(config: &IndexerConfig, json: bool) -> Result<()> {
    let store = aptindex_storage::connect(&config.db_connection_uri)
        .await
        .context("opening storage")?;
    let checkpoints = store.checkpoints().await.context("reading checkpoints")?;

    if json {
        for cp in &checkpoints {
            println!("{}", serde_json::to_string(cp)?);
        }
        return Ok(());
    }

    if checkpoints.is_empty() {
        println!("no checkpoints stored yet");
        return Ok(());
    }
    println!("{:<40} {:>16}  UPDATED AT", "CONSUMER", "NEXT VERSION");
    for cp in &checkpoints {
        println!("{}", render(cp));
    }
    Ok(())
}

fn render(cp: &Checkpoint) -> String {
    let updated_at = DateTime::from_timestamp(cp.updated_at, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| cp.updated_at.to_string());
    format!("{:<40} {:>16}  {updated_at}", cp.consumer_name, cp.next_version)
}
