//! Event type identifiers — the dispatch key of the handler registry.
//!
//! A Move event type string such as `0x1::coin::DepositEvent` is parsed into
//! an [`EventTypeId`]. The module address is stored as raw bytes, so
//! `0x1` and `0x000…0001` compare equal without any string formatting.

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

/// Width of an account address in bytes.
pub const ADDRESS_LENGTH: usize = 32;

// ─── AccountAddress ──────────────────────────────────────────────────────────

/// A 32-byte account address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountAddress([u8; ADDRESS_LENGTH]);

impl AccountAddress {
    pub const fn new(bytes: [u8; ADDRESS_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Parse a hex address with or without `0x`, left-padding short forms.
    pub fn from_hex(s: &str) -> Result<Self, IndexerError> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        if digits.is_empty() || digits.len() > ADDRESS_LENGTH * 2 {
            return Err(IndexerError::Config(format!("invalid account address '{s}'")));
        }
        let padded = format!("{digits:0>width$}", width = ADDRESS_LENGTH * 2);
        let mut bytes = [0u8; ADDRESS_LENGTH];
        hex::decode_to_slice(&padded, &mut bytes)
            .map_err(|e| IndexerError::Config(format!("invalid account address '{s}': {e}")))?;
        Ok(Self(bytes))
    }

    /// Canonical `0x`-prefixed, zero-padded, lowercase form.
    pub fn to_canonical_string(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl std::fmt::Display for AccountAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_canonical_string())
    }
}

impl std::fmt::Debug for AccountAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AccountAddress({self})")
    }
}

impl std::str::FromStr for AccountAddress {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for AccountAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_canonical_string())
    }
}

impl<'de> Deserialize<'de> for AccountAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ─── EventTypeId ─────────────────────────────────────────────────────────────

/// `{module_address}::{module_name}::{event_name}`.
///
/// Generic parameters stay part of `event_name`
/// (`CoinDeposit<0x1::aptos_coin::AptosCoin>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventTypeId {
    pub module_address: AccountAddress,
    pub module_name: String,
    pub event_name: String,
}

impl EventTypeId {
    pub fn new(
        module_address: AccountAddress,
        module_name: impl Into<String>,
        event_name: impl Into<String>,
    ) -> Self {
        Self {
            module_address,
            module_name: module_name.into(),
            event_name: event_name.into(),
        }
    }

    /// Parse a raw event type string.
    ///
    /// Returns `None` for anything that is not a struct tag (primitive or
    /// vector event types), since no handler can be registered for those.
    pub fn parse(type_str: &str) -> Option<Self> {
        let mut parts = type_str.splitn(3, "::");
        let address = parts.next()?;
        let module_name = parts.next()?;
        let event_name = parts.next()?;
        if module_name.is_empty() || event_name.is_empty() {
            return None;
        }
        let module_address = AccountAddress::from_hex(address).ok()?;
        Some(Self::new(module_address, module_name, event_name))
    }
}

impl std::fmt::Display for EventTypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}::{}::{}",
            self.module_address, self.module_name, self.event_name
        )
    }
}

impl std::str::FromStr for EventTypeId {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| IndexerError::Config(format!("invalid event type '{s}'")))
    }
}
