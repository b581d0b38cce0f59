//! Event handler trait + dispatch registry.
//!
//! A coprocessor registers one handler per [`EventTypeId`]; the registry then
//! walks each transaction's event list once and routes every event whose type
//! has a handler. Events without a handler are skipped silently.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::error::IndexerError;
use crate::event_id::EventTypeId;
use crate::store::WriteTxn;
use crate::types::{RawEvent, TransactionContext};

/// A ledger event whose type matched a registered handler.
#[derive(Debug, Clone, PartialEq)]
pub struct AptosEvent {
    pub id: EventTypeId,
    pub sequence_number: u64,
    pub creation_number: u64,
    pub account_address: String,
    /// Position of the event within its transaction.
    pub event_index: usize,
    pub data: serde_json::Value,
}

impl AptosEvent {
    /// Parse a raw event into a structured one.
    pub fn from_raw(
        id: EventTypeId,
        raw: &RawEvent,
        event_index: usize,
    ) -> Result<Self, IndexerError> {
        let data = serde_json::from_str(&raw.data).map_err(|e| IndexerError::Decode {
            event_type: raw.type_str.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            id,
            sequence_number: raw.sequence_number,
            creation_number: raw.creation_number,
            account_address: raw.account_address.clone(),
            event_index,
            data,
        })
    }

    /// Deserialize the payload into a typed event body.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, IndexerError> {
        serde_json::from_value(self.data.clone()).map_err(|e| IndexerError::Decode {
            event_type: self.id.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Trait for coprocessor event handlers.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Called for each event of the type this handler is registered for.
    async fn handle(
        &self,
        ctx: &TransactionContext,
        event: &AptosEvent,
        txn: &mut dyn WriteTxn,
    ) -> Result<(), IndexerError>;
}

/// Registry of event handlers keyed by event type.
pub struct HandlerRegistry {
    handlers: HashMap<EventTypeId, Arc<dyn EventHandler>>,
    /// Registration order, for introspection.
    order: Vec<EventTypeId>,
    strict: bool,
}

impl HandlerRegistry {
    /// A registry that rejects a second registration for the same type.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            order: Vec::new(),
            strict: true,
        }
    }

    /// A registry where a later registration replaces the earlier handler.
    pub fn permissive() -> Self {
        Self {
            strict: false,
            ..Self::new()
        }
    }

    /// Bind `handler` to `id`.
    pub fn register(
        &mut self,
        id: EventTypeId,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), IndexerError> {
        if self.handlers.contains_key(&id) {
            if self.strict {
                return Err(IndexerError::DuplicateHandler {
                    event_type: id.to_string(),
                });
            }
            tracing::warn!(event_type = %id, "replacing registered event handler");
        } else {
            self.order.push(id.clone());
        }
        self.handlers.insert(id, handler);
        Ok(())
    }

    /// Registered event types in registration order.
    pub fn registered_ids(&self) -> &[EventTypeId] {
        &self.order
    }

    pub fn is_registered(&self, id: &EventTypeId) -> bool {
        self.handlers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Route one raw event to its handler, if any.
    ///
    /// Returns `true` if a handler ran.
    pub async fn dispatch(
        &self,
        ctx: &TransactionContext,
        raw: &RawEvent,
        event_index: usize,
        txn: &mut dyn WriteTxn,
    ) -> Result<bool, IndexerError> {
        let Some(id) = EventTypeId::parse(&raw.type_str) else {
            tracing::trace!(event_type = %raw.type_str, "unparseable event type");
            return Ok(false);
        };
        let Some(handler) = self.handlers.get(&id) else {
            tracing::trace!(event_type = %raw.type_str, version = ctx.version, "no handler");
            return Ok(false);
        };
        let event = AptosEvent::from_raw(id, raw, event_index)?;
        handler.handle(ctx, &event, txn).await?;
        Ok(true)
    }

    /// Dispatch every event of one transaction in order.
    ///
    /// Returns the number of events that reached a handler.
    pub async fn dispatch_all(
        &self,
        ctx: &TransactionContext,
        events: &[RawEvent],
        txn: &mut dyn WriteTxn,
    ) -> Result<usize, IndexerError> {
        let mut handled = 0;
        for (index, raw) in events.iter().enumerate() {
            if self.dispatch(ctx, raw, index, txn).await? {
                handled += 1;
            }
        }
        Ok(handled)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_id::AccountAddress;
    use crate::memory::InMemoryStorage;
    use crate::store::Storage;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct Counter(Arc<AtomicU32>);

    #[async_trait]
    impl EventHandler for Counter {
        async fn handle(
            &self,
            _ctx: &TransactionContext,
            _e: &AptosEvent,
            _txn: &mut dyn WriteTxn,
        ) -> Result<(), IndexerError> {
            self.0.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    /// Records the events it sees.
    #[derive(Default)]
    struct Recorder(Mutex<Vec<AptosEvent>>);

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(
            &self,
            _ctx: &TransactionContext,
            e: &AptosEvent,
            _txn: &mut dyn WriteTxn,
        ) -> Result<(), IndexerError> {
            self.0.lock().unwrap().push(e.clone());
            Ok(())
        }
    }

    fn ctx() -> TransactionContext {
        TransactionContext {
            chain_id: 0,
            version: 1,
            block_height: 1,
            timestamp: chrono::DateTime::from_timestamp(0, 0).unwrap_or_default(),
        }
    }

    fn raw(type_str: &str, data: &str) -> RawEvent {
        RawEvent {
            type_str: type_str.into(),
            sequence_number: 4,
            creation_number: 2,
            account_address: "0xa11ce".into(),
            data: data.into(),
        }
    }

    fn id(type_str: &str) -> EventTypeId {
        EventTypeId::parse(type_str).unwrap()
    }

    #[tokio::test]
    async fn dispatch_hits_only_the_registered_type() {
        let count = Arc::new(AtomicU32::new(0));
        let mut registry = HandlerRegistry::new();
        registry
            .register(id("0xa::m::E"), Arc::new(Counter(count.clone())))
            .unwrap();

        let store = InMemoryStorage::new();
        let mut txn = store.begin().await.unwrap();

        // padded form of the same address still matches
        let padded = format!("{}::m::E", AccountAddress::from_hex("0xa").unwrap());
        assert!(registry.dispatch(&ctx(), &raw(&padded, "{}"), 0, txn.as_mut()).await.unwrap());
        assert!(!registry
            .dispatch(&ctx(), &raw("0xa::m::F", "{}"), 1, txn.as_mut())
            .await
            .unwrap());
        assert!(!registry
            .dispatch(&ctx(), &raw("vector<u8>", "{}"), 2, txn.as_mut())
            .await
            .unwrap());

        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn strict_registry_rejects_duplicates() {
        let count = Arc::new(AtomicU32::new(0));
        let mut registry = HandlerRegistry::new();
        registry
            .register(id("0x1::m::E"), Arc::new(Counter(count.clone())))
            .unwrap();
        let err = registry
            .register(id("0x01::m::E"), Arc::new(Counter(count)))
            .unwrap_err();
        assert!(matches!(err, IndexerError::DuplicateHandler { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn permissive_registry_keeps_one_handler() {
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));
        let mut registry = HandlerRegistry::permissive();
        registry
            .register(id("0x1::m::E"), Arc::new(Counter(first.clone())))
            .unwrap();
        registry
            .register(id("0x1::m::E"), Arc::new(Counter(second.clone())))
            .unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.registered_ids().len(), 1);

        let store = InMemoryStorage::new();
        let mut txn = store.begin().await.unwrap();
        registry
            .dispatch(&ctx(), &raw("0x1::m::E", "{}"), 0, txn.as_mut())
            .await
            .unwrap();
        assert_eq!(first.load(Ordering::Relaxed), 0);
        assert_eq!(second.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn dispatch_all_parses_payload_and_index() {
        let recorder = Arc::new(Recorder::default());
        let mut registry = HandlerRegistry::new();
        registry.register(id("0x1::m::E"), recorder.clone()).unwrap();

        let store = InMemoryStorage::new();
        let mut txn = store.begin().await.unwrap();
        let events = vec![
            raw("0x1::other::X", "{}"),
            raw("0x1::m::E", r#"{"wins":"3"}"#),
        ];
        let handled = registry
            .dispatch_all(&ctx(), &events, txn.as_mut())
            .await
            .unwrap();
        assert_eq!(handled, 1);

        let seen = recorder.0.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].event_index, 1);
        assert_eq!(seen[0].sequence_number, 4);
        assert_eq!(seen[0].creation_number, 2);
        assert_eq!(seen[0].account_address, "0xa11ce");
        assert_eq!(seen[0].data["wins"], "3");
    }

    #[tokio::test]
    async fn bad_payload_is_a_decode_error() {
        let count = Arc::new(AtomicU32::new(0));
        let mut registry = HandlerRegistry::new();
        registry
            .register(id("0x1::m::E"), Arc::new(Counter(count.clone())))
            .unwrap();
        let store = InMemoryStorage::new();
        let mut txn = store.begin().await.unwrap();
        let err = registry
            .dispatch(&ctx(), &raw("0x1::m::E", "not json"), 0, txn.as_mut())
            .await
            .unwrap_err();
        assert!(matches!(err, IndexerError::Decode { .. }));
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }
}
