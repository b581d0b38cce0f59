//! Coin-flip coprocessor.
//!
//! Indexes `{publisher}::coin_flip::CoinFlipEvent` into two models:
//! - `coin_flip_events`: one row per event
//! - `coin_flip_stats`: one running total per chain

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};

use aptindex_core::chain::SupportedChain;
use aptindex_core::coprocessor::Coprocessor;
use aptindex_core::error::IndexerError;
use aptindex_core::event_id::{AccountAddress, EventTypeId};
use aptindex_core::handler::{AptosEvent, EventHandler, HandlerRegistry};
use aptindex_core::store::{ColumnKind, Row, TableSchema, Value, WriteTxn};
use aptindex_core::types::TransactionContext;

/// Publisher of the `coin_flip` module on testnet.
pub const COIN_FLIP_PUBLISHER: &str =
    "0xe57752173bc7c57e9b61c84895a75e53cd7c0ef0855acd81d31cb39b0e87e1d0";

pub const EVENTS_TABLE: &str = "coin_flip_events";
pub const STATS_TABLE: &str = "coin_flip_stats";

/// Where the module lives on one chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinFlipConfig {
    pub module_publisher: AccountAddress,
    pub genesis_version: u64,
}

impl CoinFlipConfig {
    /// Deployment on `chain`, if the module is published there.
    pub fn for_chain(chain: SupportedChain) -> Option<Self> {
        match chain {
            // jestnet mirrors testnet for local runs
            SupportedChain::Testnet | SupportedChain::Jestnet => Some(Self {
                module_publisher: AccountAddress::from_hex(COIN_FLIP_PUBLISHER).ok()?,
                genesis_version: 635_567_537,
            }),
            SupportedChain::Mainnet | SupportedChain::Devnet => None,
        }
    }

    pub fn event_id(&self) -> EventTypeId {
        EventTypeId::new(self.module_publisher, "coin_flip", "CoinFlipEvent")
    }
}

/// Payload of `coin_flip::CoinFlipEvent`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CoinFlipEventData {
    pub prediction: bool,
    pub result: bool,
    #[serde(deserialize_with = "u64_string")]
    pub wins: u64,
    #[serde(deserialize_with = "u64_string")]
    pub losses: u64,
}

impl CoinFlipEventData {
    pub fn won(&self) -> bool {
        self.prediction == self.result
    }
}

/// Move `u64` arrives as a JSON string.
fn u64_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

fn win_percentage(wins: u64, losses: u64) -> f64 {
    let total = wins as f64 + losses as f64;
    if total == 0.0 {
        0.0
    } else {
        wins as f64 / total
    }
}

/// An integer column value, refusing counters past `i64::MAX`.
fn int(event: &AptosEvent, column: &str, v: u64) -> Result<Value, IndexerError> {
    Value::try_from(v).map_err(|_| IndexerError::Decode {
        event_type: event.id.to_string(),
        reason: format!("{column} = {v} is out of range"),
    })
}

pub fn events_table() -> TableSchema {
    TableSchema::new(EVENTS_TABLE)
        .key("chain_id", ColumnKind::Int)
        .key("sequence_number", ColumnKind::Int)
        .key("creation_number", ColumnKind::Int)
        .key("account_address", ColumnKind::Text)
        .column("prediction", ColumnKind::Bool)
        .column("result", ColumnKind::Bool)
        .column("wins", ColumnKind::Int)
        .column("losses", ColumnKind::Int)
        .column("win_percentage", ColumnKind::Float)
        .column("transaction_version", ColumnKind::Int)
        .column("transaction_timestamp", ColumnKind::Timestamp)
        .column("event_index", ColumnKind::Int)
}

pub fn stats_table() -> TableSchema {
    TableSchema::new(STATS_TABLE)
        .key("chain_id", ColumnKind::Int)
        .column("total_wins", ColumnKind::Int)
        .column("total_losses", ColumnKind::Int)
        .column("win_percentage", ColumnKind::Float)
        .column("last_updated", ColumnKind::Timestamp)
}

struct CoinFlipHandler {
    events: TableSchema,
    stats: TableSchema,
}

#[async_trait]
impl EventHandler for CoinFlipHandler {
    async fn handle(
        &self,
        ctx: &TransactionContext,
        event: &AptosEvent,
        txn: &mut dyn WriteTxn,
    ) -> Result<(), IndexerError> {
        let data: CoinFlipEventData = event.decode()?;

        let chain_id = int(event, "chain_id", ctx.chain_id)?;

        let row = Row::new()
            .with("chain_id", chain_id.clone())
            .with("sequence_number", int(event, "sequence_number", event.sequence_number)?)
            .with("creation_number", int(event, "creation_number", event.creation_number)?)
            .with("account_address", event.account_address.as_str())
            .with("prediction", data.prediction)
            .with("result", data.result)
            .with("wins", int(event, "wins", data.wins)?)
            .with("losses", int(event, "losses", data.losses)?)
            .with("win_percentage", win_percentage(data.wins, data.losses))
            .with("transaction_version", int(event, "transaction_version", ctx.version)?)
            .with("transaction_timestamp", ctx.timestamp)
            .with("event_index", int(event, "event_index", event.event_index as u64)?);
        txn.insert(&self.events, vec![row]).await?;

        let key = Row::new().with("chain_id", chain_id);
        let (mut total_wins, mut total_losses) = match txn.find(&self.stats, &key).await? {
            Some(stats) => (
                stats.int("total_wins").unwrap_or(0) as u64,
                stats.int("total_losses").unwrap_or(0) as u64,
            ),
            None => (0, 0),
        };
        if data.won() {
            total_wins += 1;
        } else {
            total_losses += 1;
        }

        let stats = key
            .with("total_wins", int(event, "total_wins", total_wins)?)
            .with("total_losses", int(event, "total_losses", total_losses)?)
            .with("win_percentage", win_percentage(total_wins, total_losses))
            .with("last_updated", ctx.timestamp);
        txn.upsert(&self.stats, stats).await?;

        tracing::trace!(
            version = ctx.version,
            account = %event.account_address,
            won = data.won(),
            total_wins,
            total_losses,
            "coin flip recorded"
        );
        Ok(())
    }
}

/// Coprocessor indexing coin flips on one chain.
pub struct CoinFlipProcessor {
    chain: SupportedChain,
    config: CoinFlipConfig,
    registry: HandlerRegistry,
}

impl CoinFlipProcessor {
    /// The processor for `chain`'s published module.
    pub fn new(chain: SupportedChain) -> Result<Self, IndexerError> {
        let config = CoinFlipConfig::for_chain(chain).ok_or_else(|| {
            IndexerError::Config(format!(
                "{} unsupported on chain: {}",
                consumer_name(chain),
                chain.id()
            ))
        })?;
        Self::with_config(chain, config)
    }

    pub fn with_config(chain: SupportedChain, config: CoinFlipConfig) -> Result<Self, IndexerError> {
        let mut registry = HandlerRegistry::new();
        registry.register(
            config.event_id(),
            Arc::new(CoinFlipHandler {
                events: events_table(),
                stats: stats_table(),
            }),
        )?;
        Ok(Self {
            chain,
            config,
            registry,
        })
    }

    pub fn config(&self) -> &CoinFlipConfig {
        &self.config
    }
}

fn consumer_name(chain: SupportedChain) -> String {
    format!("{}_coin_flip_processor", chain.id())
}

impl Coprocessor for CoinFlipProcessor {
    fn name(&self) -> String {
        consumer_name(self.chain)
    }

    fn genesis_version(&self) -> u64 {
        self.config.genesis_version
    }

    fn tables(&self) -> Vec<TableSchema> {
        vec![events_table(), stats_table()]
    }

    fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }
}
