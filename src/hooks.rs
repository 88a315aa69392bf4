//! Event hooks
//!
//! Handlers are registered against an event name once, at startup, and run
//! synchronously in registration order every time the event fires. A handler
//! must not block; anything slow belongs on a channel it owns.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::errors::Error;
use crate::intruder::AttackResult;
use crate::record::{CapturedExchange, ExchangeContent};

/// Fired after an exchange is appended to the traffic store.
pub const EXCHANGE_CAPTURED: &str = "exchange.captured";
/// Fired for every attack result, in enumeration order.
pub const INTRUDER_RESULT: &str = "intruder.result";
/// Fired when a proxied connection ends with an error.
pub const CONNECTION_ERROR: &str = "proxy.connection_error";

/// Something a hook can observe.
#[derive(Debug)]
pub enum Event<'a> {
  /// See [`EXCHANGE_CAPTURED`].
  ExchangeCaptured(&'a CapturedExchange),
  /// See [`INTRUDER_RESULT`].
  AttackResult(&'a AttackResult),
  /// See [`CONNECTION_ERROR`].
  ConnectionError {
    /// The downstream client.
    client_addr: SocketAddr,
    /// What went wrong.
    error: &'a Error,
  },
}

impl Event<'_> {
  /// The registration name this event is dispatched under.
  pub fn name(&self) -> &'static str {
    match self {
      Event::ExchangeCaptured(_) => EXCHANGE_CAPTURED,
      Event::AttackResult(_) => INTRUDER_RESULT,
      Event::ConnectionError { .. } => CONNECTION_ERROR,
    }
  }
}

/// A registered handler.
pub trait Hook: Send + Sync {
  /// Observe one event.
  fn handle(&self, event: &Event<'_>);
}

impl<F> Hook for F
where
  F: Fn(&Event<'_>) + Send + Sync,
{
  fn handle(&self, event: &Event<'_>) {
    self(event)
  }
}

/// Event name → ordered handlers. Immutable once built.
#[derive(Default, Clone)]
pub struct HookRegistry {
  table: HashMap<String, Vec<Arc<dyn Hook>>>,
}

impl std::fmt::Debug for HookRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let counts: HashMap<&str, usize> = self
      .table
      .iter()
      .map(|(name, hooks)| (name.as_str(), hooks.len()))
      .collect();
    f.debug_struct("HookRegistry").field("table", &counts).finish()
  }
}

impl HookRegistry {
  /// Start registering handlers.
  pub fn builder() -> HookRegistryBuilder {
    HookRegistryBuilder::default()
  }

  /// Run every handler registered for the event, returning how many ran.
  pub fn emit(&self, event: &Event<'_>) -> usize {
    match self.table.get(event.name()) {
      Some(hooks) => {
        for hook in hooks {
          hook.handle(event);
        }
        hooks.len()
      }
      None => 0,
    }
  }

  /// Number of handlers registered under `name`.
  pub fn handlers(&self, name: &str) -> usize {
    self.table.get(name).map(Vec::len).unwrap_or(0)
  }

  /// Check if any hooks are registered
  pub fn is_empty(&self) -> bool {
    self.table.values().all(Vec::is_empty)
  }
}

/// Builds a [`HookRegistry`].
#[derive(Default)]
#[must_use]
pub struct HookRegistryBuilder {
  table: HashMap<String, Vec<Arc<dyn Hook>>>,
}

impl HookRegistryBuilder {
  /// Append `hook` to the handlers for `event`.
  pub fn on(mut self, event: impl Into<String>, hook: impl Hook + 'static) -> Self {
    self.table.entry(event.into()).or_default().push(Arc::new(hook));
    self
  }

  /// Register [`LoggingHook`] for every built-in event.
  pub fn with_logging(self) -> Self {
    self
      .on(EXCHANGE_CAPTURED, LoggingHook)
      .on(INTRUDER_RESULT, LoggingHook)
      .on(CONNECTION_ERROR, LoggingHook)
  }

  /// Freeze the table.
  pub fn build(self) -> HookRegistry {
    HookRegistry { table: self.table }
  }
}

/// Logs every event through `tracing`.
pub struct LoggingHook;

impl Hook for LoggingHook {
  fn handle(&self, event: &Event<'_>) {
    match event {
      Event::ExchangeCaptured(exchange) => match exchange.content() {
        ExchangeContent::Http { request, response } => tracing::info!(
          "[proxy] #{} {} {} -> {}",
          exchange.sequence(),
          request.method(),
          request.uri(),
          response
            .as_ref()
            .map(|r| r.status_code().to_string())
            .unwrap_or_else(|| "no response".to_string())
        ),
        ExchangeContent::Passthrough {
          bytes_from_client,
          bytes_from_origin,
        } => tracing::info!(
          "[proxy] #{} tunnel {}:{} up={} down={}",
          exchange.sequence(),
          exchange.connection().target_host,
          exchange.connection().target_port,
          bytes_from_client,
          bytes_from_origin
        ),
      },
      Event::AttackResult(result) => match result.response() {
        Some(response) => tracing::info!(
          "[intruder] #{} {:?} -> {} ({} bytes)",
          result.index(),
          result.payloads(),
          response.status_code(),
          response.body().len()
        ),
        None => tracing::info!(
          "[intruder] #{} {:?} failed: {}",
          result.index(),
          result.payloads(),
          result
            .failure()
            .map(|f| f.message.as_str())
            .unwrap_or_default()
        ),
      },
      Event::ConnectionError { client_addr, error } => {
        tracing::warn!("[proxy] connection from {} failed: {}", client_addr, error)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Mutex;

  #[test]
  fn handlers_run_in_registration_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (first, second) = (seen.clone(), seen.clone());
    let registry = HookRegistry::builder()
      .on(CONNECTION_ERROR, move |_: &Event<'_>| first.lock().unwrap().push(1))
      .on(CONNECTION_ERROR, move |_: &Event<'_>| second.lock().unwrap().push(2))
      .build();
    let error = Error::other("boom");
    let ran = registry.emit(&Event::ConnectionError {
      client_addr: "127.0.0.1:1".parse().unwrap(),
      error: &error,
    });
    assert_eq!(ran, 2);
    assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    assert_eq!(registry.handlers(EXCHANGE_CAPTURED), 0);
  }

  #[test]
  fn logging_covers_all_builtin_events() {
    let registry = HookRegistry::builder().with_logging().build();
    for name in [EXCHANGE_CAPTURED, INTRUDER_RESULT, CONNECTION_ERROR] {
      assert_eq!(registry.handlers(name), 1);
    }
    assert!(!registry.is_empty());
    assert!(HookRegistry::default().is_empty());
  }
}
