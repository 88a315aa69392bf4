//! Intruder
//!
//! Marks `{name}` positions in a request template, binds a payload set to
//! each and sends every variant an [`AttackStrategy`] enumerates through a
//! bounded, rate limited worker pool.
//!
//! ```no_run
//! # async fn run() -> volley::Result<()> {
//! use volley::intruder::{AttackPosition, AttackStrategy, PayloadSet, RequestTemplate};
//! use volley::{Intruder, IntruderConfig};
//!
//! let template = RequestTemplate::new(http::Method::GET, "http://127.0.0.1:3000/users/{id}");
//! let positions = vec![AttackPosition::new("id", PayloadSet::numbers(1, 100))];
//! let report = Intruder::new(IntruderConfig::default())?
//!   .fuzz(template, positions, AttackStrategy::Sniper)?
//!   .collect()
//!   .await;
//! for result in report.responses() {
//!   println!("{:?} {:?}", result.payloads(), result.response().map(|r| r.status_code()));
//! }
//! # Ok(())
//! # }
//! ```

mod engine;
mod payloads;
mod rate_limit;
mod strategy;
mod template;

pub use engine::{
  AttackEvent, AttackFailure, AttackReport, AttackResult, AttackRun, CancelHandle, FailureKind,
  Intruder,
};
pub use payloads::PayloadSet;
pub use rate_limit::{RateLimiter, RateSlot};
pub use strategy::{AttackStrategy, Slot};
pub use template::{is_position_name, AttackPosition, RequestTemplate};
