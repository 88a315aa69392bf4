//! Traffic history
//!
//! [`ExchangeLog`] hands out sequence numbers and appends to a [`TrafficStore`]
//! under one lock, so the stored order is the sequence order.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use crate::errors::{Error, Result};
use crate::hooks::{Event, HookRegistry};
use crate::record::{CapturedExchange, ConnectionInfo, ExchangeContent};

/// Where captured exchanges end up.
#[async_trait]
pub trait TrafficStore: Send + Sync {
  /// Persist `exchange`, returning its sequence id.
  async fn append(&self, exchange: CapturedExchange) -> Result<u64>;
}

/// Keeps every exchange in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
  entries: RwLock<Vec<Arc<CapturedExchange>>>,
}

impl MemoryStore {
  /// An empty store.
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of stored exchanges.
  pub async fn len(&self) -> usize {
    self.entries.read().await.len()
  }

  /// Whether nothing has been stored yet.
  pub async fn is_empty(&self) -> bool {
    self.entries.read().await.is_empty()
  }

  /// The exchange with `sequence`, if stored.
  pub async fn get(&self, sequence: u64) -> Option<Arc<CapturedExchange>> {
    let entries = self.entries.read().await;
    entries
      .binary_search_by_key(&sequence, |e| e.sequence())
      .ok()
      .map(|i| entries[i].clone())
  }

  /// Everything stored so far, in append order.
  pub async fn snapshot(&self) -> Vec<Arc<CapturedExchange>> {
    self.entries.read().await.clone()
  }
}

#[async_trait]
impl TrafficStore for MemoryStore {
  async fn append(&self, exchange: CapturedExchange) -> Result<u64> {
    let mut entries = self.entries.write().await;
    if let Some(last) = entries.last() {
      if last.sequence() >= exchange.sequence() {
        return Err(Error::store(format!(
          "sequence {} appended after {}",
          exchange.sequence(),
          last.sequence()
        )));
      }
    }
    let sequence = exchange.sequence();
    entries.push(Arc::new(exchange));
    Ok(sequence)
  }
}

/// Assigns sequence numbers and records exchanges into a store.
pub struct ExchangeLog {
  store: Arc<dyn TrafficStore>,
  next_sequence: Mutex<u64>,
  hooks: Arc<HookRegistry>,
}

impl std::fmt::Debug for ExchangeLog {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ExchangeLog")
      .field("hooks", &self.hooks)
      .finish_non_exhaustive()
  }
}

impl ExchangeLog {
  /// A log writing to `store`, numbering from 1.
  pub fn new(store: Arc<dyn TrafficStore>) -> Self {
    Self::with_hooks(store, Arc::new(HookRegistry::default()))
  }

  /// A log that fires `exchange.captured` hooks after each append.
  pub fn with_hooks(store: Arc<dyn TrafficStore>, hooks: Arc<HookRegistry>) -> Self {
    ExchangeLog {
      store,
      next_sequence: Mutex::new(1),
      hooks,
    }
  }

  /// Number and append one exchange.
  ///
  /// A number is only consumed when the store accepts the append, so a
  /// failed append leaves no gap.
  pub async fn record(&self, connection: ConnectionInfo, content: ExchangeContent) -> Result<u64> {
    let mut next = self.next_sequence.lock().await;
    let exchange = CapturedExchange::new(*next, connection, content);
    let notify = if self.hooks.is_empty() {
      None
    } else {
      Some(exchange.clone())
    };
    let sequence = self.store.append(exchange).await?;
    *next += 1;
    drop(next);
    if let Some(exchange) = notify {
      self.hooks.emit(&Event::ExchangeCaptured(&exchange));
    }
    Ok(sequence)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn meta() -> ConnectionInfo {
    ConnectionInfo {
      client_addr: None,
      target_host: "example.com".to_string(),
      target_port: 443,
      tls_intercepted: false,
      excluded: true,
    }
  }

  fn tunnel() -> ExchangeContent {
    ExchangeContent::Passthrough {
      bytes_from_client: 1,
      bytes_from_origin: 2,
    }
  }

  struct RejectingStore;

  #[async_trait]
  impl TrafficStore for RejectingStore {
    async fn append(&self, _exchange: CapturedExchange) -> Result<u64> {
      Err(Error::store("full"))
    }
  }

  #[tokio::test]
  async fn sequences_start_at_one() {
    let store = Arc::new(MemoryStore::new());
    let log = ExchangeLog::new(store.clone());
    assert_eq!(log.record(meta(), tunnel()).await.unwrap(), 1);
    assert_eq!(log.record(meta(), tunnel()).await.unwrap(), 2);
    assert_eq!(store.len().await, 2);
    assert!(store.get(2).await.unwrap().is_passthrough());
    assert!(store.get(3).await.is_none());
  }

  #[tokio::test]
  async fn failed_append_consumes_no_number() {
    let log = ExchangeLog::new(Arc::new(RejectingStore));
    assert!(log.record(meta(), tunnel()).await.is_err());
    assert_eq!(*log.next_sequence.lock().await, 1);
  }

  #[tokio::test]
  async fn out_of_order_append_is_rejected() {
    let store = MemoryStore::new();
    store
      .append(CapturedExchange::new(5, meta(), tunnel()))
      .await
      .unwrap();
    let err = store
      .append(CapturedExchange::new(5, meta(), tunnel()))
      .await
      .unwrap_err();
    assert!(matches!(err, Error::Store(_)));
  }
}
