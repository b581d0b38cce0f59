//! Transaction stream over the Aptos node REST API, backed by `reqwest`.
//!
//! Pages `GET {endpoint}/transactions?start=<version>&limit=<n>`:
//! - transient failures (connect errors, 429, 5xx) are retried with
//!   exponential backoff inside the stream
//! - an empty page means the stream caught up with the ledger tip; it waits
//!   `poll_interval` and asks again
//! - a node reporting a different chain id is a configuration error

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Deserializer};

use aptindex_core::config::IndexerConfig;
use aptindex_core::error::IndexerError;
use aptindex_core::retry::{RetryConfig, RetryPolicy};
use aptindex_core::stream::{StreamProvider, TransactionStream};
use aptindex_core::types::{
    RawEvent, Transaction, TransactionBatch, TransactionKind, UserTransaction,
};

const CHAIN_ID_HEADER: &str = "x-aptos-chain-id";

/// Configuration for [`RestStreamProvider`].
#[derive(Debug, Clone)]
pub struct RestStreamConfig {
    /// Base URL including the API version, e.g. `https://api.testnet.aptoslabs.com/v1`.
    pub endpoint: String,
    pub api_key: Option<String>,
    /// Expected chain id; checked against the node's response header.
    pub chain_id: u64,
    /// Transactions requested per page.
    pub batch_size: u64,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub retry: RetryConfig,
}

impl RestStreamConfig {
    pub fn from_indexer_config(config: &IndexerConfig) -> Self {
        Self {
            endpoint: config.stream_endpoint.trim_end_matches('/').to_string(),
            api_key: config.stream_api_key.clone(),
            chain_id: config.chain_id,
            batch_size: config.batch_size,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            request_timeout: Duration::from_secs(30),
            retry: config.retry.clone(),
        }
    }

    fn transactions_url(&self) -> String {
        format!("{}/transactions", self.endpoint.trim_end_matches('/'))
    }
}

/// Opens [`TransactionStream`]s against one REST endpoint.
pub struct RestStreamProvider {
    http: reqwest::Client,
    config: RestStreamConfig,
}

impl RestStreamProvider {
    pub fn new(config: RestStreamConfig) -> Result<Self, IndexerError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| IndexerError::Config(format!("cannot build http client: {e}")))?;
        Ok(Self { http, config })
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }
}

#[async_trait]
impl StreamProvider for RestStreamProvider {
    async fn open(
        &self,
        starting_version: u64,
    ) -> Result<Box<dyn TransactionStream>, IndexerError> {
        tracing::info!(
            endpoint = %self.config.endpoint,
            starting_version,
            batch_size = self.config.batch_size,
            "opening REST transaction stream"
        );
        Ok(Box::new(RestStream {
            http: self.http.clone(),
            retry: RetryPolicy::new(self.config.retry.clone()),
            config: self.config.clone(),
            next_version: starting_version,
        }))
    }
}

struct RestStream {
    http: reqwest::Client,
    config: RestStreamConfig,
    retry: RetryPolicy,
    next_version: u64,
}

/// Outcome of a single page request.
enum FetchError {
    Transient(String),
    Fatal(IndexerError),
}

impl RestStream {
    async fn fetch_once(&self) -> Result<Vec<Transaction>, FetchError> {
        let mut request = self
            .http
            .get(self.config.transactions_url())
            .query(&[
                ("start", self.next_version),
                ("limit", self.config.batch_size),
            ]);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| FetchError::Transient(e.to_string()))?;

        if let Some(node_chain) = resp
            .headers()
            .get(CHAIN_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
        {
            if node_chain != self.config.chain_id {
                return Err(FetchError::Fatal(IndexerError::Config(format!(
                    "endpoint {} serves chain {node_chain}, expected {}",
                    self.config.endpoint, self.config.chain_id
                ))));
            }
        }

        let status = resp.status();
        // Asking past the ledger tip.
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let message = format!("HTTP {}: {body}", status.as_u16());
            return if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                Err(FetchError::Transient(message))
            } else {
                Err(FetchError::Fatal(IndexerError::Stream(message)))
            };
        }

        let body = resp
            .text()
            .await
            .map_err(|e| FetchError::Transient(e.to_string()))?;
        parse_transactions(&body).map_err(FetchError::Fatal)
    }

    async fn fetch(&self) -> Result<Vec<Transaction>, IndexerError> {
        let mut failures = 0u32;
        loop {
            match self.fetch_once().await {
                Ok(transactions) => return Ok(transactions),
                Err(FetchError::Fatal(e)) => return Err(e),
                Err(FetchError::Transient(reason)) => {
                    failures += 1;
                    match self.retry.next_delay(failures) {
                        Some(delay) => {
                            tracing::warn!(
                                attempt = failures,
                                delay_ms = delay.as_millis() as u64,
                                error = %reason,
                                start = self.next_version,
                                "retrying transaction page"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            tracing::error!(attempt = failures, error = %reason, "max retries exceeded");
                            return Err(IndexerError::Stream(reason));
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl TransactionStream for RestStream {
    async fn next_batch(&mut self) -> Result<Option<TransactionBatch>, IndexerError> {
        loop {
            let transactions = self.fetch().await?;
            match page_from(self.next_version, transactions)? {
                Some(batch) => {
                    self.next_version = batch.end_version + 1;
                    tracing::debug!(
                        start = batch.start_version,
                        end = batch.end_version,
                        len = batch.len(),
                        "fetched transaction page"
                    );
                    return Ok(Some(batch));
                }
                None => {
                    tracing::trace!(next_version = self.next_version, "at ledger tip, polling");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
    }
}

/// Drop versions already delivered. An empty page means the ledger tip; a
/// non-empty page with nothing new means the node ignored `start`.
fn page_from(
    next_version: u64,
    transactions: Vec<Transaction>,
) -> Result<Option<TransactionBatch>, IndexerError> {
    let received = transactions.len();
    let fresh: Vec<Transaction> = transactions
        .into_iter()
        .filter(|t| t.version >= next_version)
        .collect();
    if received > 0 && fresh.is_empty() {
        return Err(IndexerError::Stream(format!(
            "node returned {received} transactions all below requested start {next_version}"
        )));
    }
    Ok(TransactionBatch::from_transactions(fresh))
}

// ─── JSON model ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RestTransaction {
    #[serde(rename = "type")]
    kind: String,
    #[serde(deserialize_with = "u64_string")]
    version: u64,
    /// Microseconds since the epoch; absent on genesis.
    #[serde(default, deserialize_with = "opt_u64_string")]
    timestamp: Option<u64>,
    #[serde(default, deserialize_with = "opt_u64_string")]
    block_height: Option<u64>,
    #[serde(default)]
    sender: Option<String>,
    #[serde(default)]
    events: Vec<RestEvent>,
}

#[derive(Debug, Deserialize)]
struct RestEvent {
    guid: RestGuid,
    #[serde(deserialize_with = "u64_string")]
    sequence_number: u64,
    #[serde(rename = "type")]
    type_str: String,
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RestGuid {
    #[serde(deserialize_with = "u64_string")]
    creation_number: u64,
    account_address: String,
}

/// The REST API encodes `u64` as a JSON string.
#[derive(Deserialize)]
#[serde(untagged)]
enum U64Repr {
    Text(String),
    Number(u64),
}

impl U64Repr {
    fn value<E: serde::de::Error>(self) -> Result<u64, E> {
        match self {
            Self::Number(n) => Ok(n),
            Self::Text(s) => s.parse().map_err(E::custom),
        }
    }
}

fn u64_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    U64Repr::deserialize(deserializer)?.value()
}

fn opt_u64_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    Option::<U64Repr>::deserialize(deserializer)?
        .map(U64Repr::value)
        .transpose()
}

fn kind_of(type_str: &str) -> Option<TransactionKind> {
    match type_str {
        "genesis_transaction" => Some(TransactionKind::Genesis),
        "block_metadata_transaction" => Some(TransactionKind::BlockMetadata),
        "state_checkpoint_transaction" => Some(TransactionKind::StateCheckpoint),
        "user_transaction" => Some(TransactionKind::User),
        "validator_transaction" => Some(TransactionKind::Validator),
        "block_epilogue_transaction" => Some(TransactionKind::BlockEpilogue),
        _ => None,
    }
}

fn timestamp_from_micros(version: u64, micros: u64) -> Result<DateTime<Utc>, IndexerError> {
    let secs = (micros / 1_000_000) as i64;
    let nanos = ((micros % 1_000_000) * 1_000) as u32;
    DateTime::from_timestamp(secs, nanos).ok_or_else(|| IndexerError::MalformedTransaction {
        version,
        reason: format!("timestamp {micros} out of range"),
    })
}

impl RestTransaction {
    fn into_transaction(self) -> Result<Transaction, IndexerError> {
        let version = self.version;
        let kind = kind_of(&self.kind).ok_or_else(|| IndexerError::MalformedTransaction {
            version,
            reason: format!("unknown transaction type '{}'", self.kind),
        })?;
        let timestamp = timestamp_from_micros(version, self.timestamp.unwrap_or(0))?;

        let user = if kind == TransactionKind::User {
            let events = self
                .events
                .into_iter()
                .map(|e| {
                    let data = serde_json::to_string(&e.data).map_err(|err| {
                        IndexerError::MalformedTransaction {
                            version,
                            reason: err.to_string(),
                        }
                    })?;
                    Ok(RawEvent {
                        type_str: e.type_str,
                        sequence_number: e.sequence_number,
                        creation_number: e.guid.creation_number,
                        account_address: e.guid.account_address,
                        data,
                    })
                })
                .collect::<Result<Vec<_>, IndexerError>>()?;
            Some(UserTransaction {
                sender: self.sender.unwrap_or_default(),
                events,
            })
        } else {
            None
        };

        Ok(Transaction {
            version,
            block_height: self.block_height.unwrap_or(0),
            timestamp,
            kind,
            user,
        })
    }
}

/// Decode a `GET /transactions` response body.
pub fn parse_transactions(body: &str) -> Result<Vec<Transaction>, IndexerError> {
    let raw: Vec<RestTransaction> = serde_json::from_str(body)
        .map_err(|e| IndexerError::Stream(format!("invalid transactions page: {e}")))?;
    raw.into_iter().map(RestTransaction::into_transaction).collect()
}
