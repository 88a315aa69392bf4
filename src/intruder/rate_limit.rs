use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;

/// A single gate spacing request starts at least `min_interval` apart.
///
/// [`RateLimiter::acquire`] waits until the interval since the previous
/// start has passed and hands out a [`RateSlot`]. The gate stays closed
/// until that slot is started, so the next caller measures from the moment
/// the previous request actually began rather than from when it was
/// scheduled.
#[derive(Debug, Clone)]
pub struct RateLimiter {
  min_interval: Duration,
  next_slot: Arc<Mutex<Option<Instant>>>,
}

/// Permission to start one request. Dropping it unstarted gives the slot
/// back without moving the gate.
#[derive(Debug)]
pub struct RateSlot {
  min_interval: Duration,
  next_slot: OwnedMutexGuard<Option<Instant>>,
}

impl RateLimiter {
  /// A gate with the given spacing. `Duration::ZERO` never waits.
  pub fn new(min_interval: Duration) -> Self {
    RateLimiter {
      min_interval,
      next_slot: Arc::new(Mutex::new(None)),
    }
  }

  /// The configured spacing.
  pub fn min_interval(&self) -> Duration {
    self.min_interval
  }

  /// Wait for the next slot.
  ///
  /// Waiters are served one at a time. Dropping the future while it waits
  /// leaves the gate untouched.
  pub async fn acquire(&self) -> RateSlot {
    let next_slot = self.next_slot.clone().lock_owned().await;
    if let Some(slot) = *next_slot {
      tokio::time::sleep_until(slot).await;
    }
    RateSlot {
      min_interval: self.min_interval,
      next_slot,
    }
  }
}

impl RateSlot {
  /// Mark the request as starting now and reopen the gate.
  pub fn start(mut self) -> Instant {
    let now = Instant::now();
    *self.next_slot = Some(now + self.min_interval);
    now
  }
}
