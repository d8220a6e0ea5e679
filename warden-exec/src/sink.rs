//! Event sink used for best-effort outcome logging.

use async_trait::async_trait;
use std::sync::Arc;

use warden_domain::EngineEvent;
use warden_store::{Store, StoreError};

/// Destination for engine events.
///
/// Callers treat a failed `record` as non-fatal.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Record one event
    async fn record(&self, event: EngineEvent) -> Result<(), StoreError>;
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn record(&self, _event: EngineEvent) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Appends events to a store's event log
pub struct StoreEventSink<S: Store + ?Sized> {
    store: Arc<S>,
}

impl<S: Store + ?Sized> StoreEventSink<S> {
    /// Sink backed by `store`
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: Store + ?Sized + 'static> EventSink for StoreEventSink<S> {
    async fn record(&self, event: EngineEvent) -> Result<(), StoreError> {
        let seq = self.store.events().append(&event).await?;
        tracing::trace!(seq, event_type = event.event_type(), "Event recorded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use warden_domain::ExchangeId;
    use warden_store::MemoryStore;

    #[tokio::test]
    async fn test_store_sink_appends() {
        let store = Arc::new(MemoryStore::new());
        let sink = StoreEventSink::new(store.clone());

        sink.record(EngineEvent::SynchronizationStarted {
            exchange: ExchangeId::new("binance").unwrap(),
            timestamp: Utc::now(),
        })
        .await
        .unwrap();

        assert_eq!(store.events().count().await.unwrap(), 1);
        NoopEventSink.record(store.events().find_recent(1).await.unwrap()[0].clone()).await.unwrap();
        assert_eq!(store.events().count().await.unwrap(), 1);
    }
}
