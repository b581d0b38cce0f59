//! Error types for the aptindex pipeline.

use thiserror::Error;

/// Errors that can occur during indexing.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Handler error in '{handler}': {reason}")]
    Handler { handler: String, reason: String },

    #[error("Failed to decode event '{event_type}': {reason}")]
    Decode { event_type: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Handler already registered for event type {event_type}")]
    DuplicateHandler { event_type: String },

    #[error("INVARIANT: {0}")]
    Invariant(String),

    #[error("Version gap for '{consumer}': expected {expected}, batch starts at {actual}")]
    VersionGap {
        consumer: String,
        expected: u64,
        actual: u64,
    },

    #[error("Malformed transaction at version {version}: {reason}")]
    MalformedTransaction { version: u64, reason: String },

    #[error("Processor manager is already running")]
    AlreadyRunning,

    #[error("Giving up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("Run aborted: {reason}")]
    Aborted { reason: String },

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Returns `true` if retrying the pipeline cannot fix this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::DuplicateHandler { .. }
                | Self::Invariant(_)
                | Self::MalformedTransaction { .. }
                | Self::AlreadyRunning
                | Self::RetriesExhausted { .. }
        )
    }

    /// Shorthand used by storage backends: `.map_err(IndexerError::storage)`.
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }

    /// Shorthand used by stream providers.
    pub fn stream(err: impl std::fmt::Display) -> Self {
        Self::Stream(err.to_string())
    }
}
