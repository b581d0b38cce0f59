//! aptindex-aptos — Aptos-facing collaborators of the aptindex pipeline.
//!
//! - [`rest`]: a [`StreamProvider`](aptindex_core::StreamProvider) paging the
//!   node REST API (`GET /transactions`).
//! - [`coin_flip`]: an example coprocessor indexing `coin_flip::CoinFlipEvent`.

pub mod coin_flip;
pub mod rest;

pub use coin_flip::{CoinFlipConfig, CoinFlipProcessor};
pub use rest::{RestStreamConfig, RestStreamProvider};
