//! Attack dispatch
//!
//! A scheduler task walks the enumeration in order. For each index it takes
//! a worker permit, then a rate limiter slot, and spawns the request. The
//! worker starts the slot right before it sends, so the spacing holds
//! between actual request starts. Workers report to a collector that
//! buffers out-of-order results and releases them strictly by index. Once
//! every dispatched request has reported, the scheduler sends the terminal
//! event.

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::Stream;
use tokio::sync::{mpsc, watch, Semaphore};

use crate::client::Client;
use crate::config::IntruderConfig;
use crate::errors::{Error, Result};
use crate::hooks::{Event, HookRegistry};
use crate::intruder::rate_limit::{RateLimiter, RateSlot};
use crate::intruder::strategy::{AttackStrategy, Slot};
use crate::intruder::template::{is_position_name, AttackPosition, RequestTemplate};
use crate::record::{ConnectionInfo, ExchangeContent};
use crate::redirect::Policy;
use crate::store::ExchangeLog;
use crate::{Request, Response};

const EVENT_BUFFER: usize = 64;
const MAX_REDIRECTS: usize = 10;

/// Why an attempt produced no response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
  /// The request exceeded its deadline.
  Timeout,
  /// Connecting, the TLS handshake or reading the response failed.
  Network,
  /// The payloads did not produce a valid request.
  InvalidRequest,
}

/// A failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttackFailure {
  /// Failure category.
  pub kind: FailureKind,
  /// Human readable cause.
  pub message: String,
}

impl AttackFailure {
  fn from_error(error: &Error) -> Self {
    let kind = match error {
      Error::Timeout(_) => FailureKind::Timeout,
      _ => FailureKind::Network,
    };
    AttackFailure {
      kind,
      message: error.to_string(),
    }
  }
}

/// One variant's outcome.
#[derive(Debug, Clone)]
pub struct AttackResult {
  index: usize,
  request: Option<Request>,
  payloads: Vec<(String, String)>,
  outcome: std::result::Result<Response, AttackFailure>,
  started_at: Instant,
}

impl AttackResult {
  /// Position in the enumeration, from 0.
  pub fn index(&self) -> usize {
    self.index
  }

  /// The request that was sent. `None` when rendering failed.
  pub fn request(&self) -> Option<&Request> {
    self.request.as_ref()
  }

  /// Position name → value used, in declaration order.
  pub fn payloads(&self) -> &[(String, String)] {
    &self.payloads
  }

  /// Value used for position `name`.
  pub fn payload(&self, name: &str) -> Option<&str> {
    self
      .payloads
      .iter()
      .find(|(position, _)| position == name)
      .map(|(_, value)| value.as_str())
  }

  /// The response or the failure.
  pub fn outcome(&self) -> std::result::Result<&Response, &AttackFailure> {
    self.outcome.as_ref()
  }

  /// The response, if one arrived.
  pub fn response(&self) -> Option<&Response> {
    self.outcome.as_ref().ok()
  }

  /// The failure, if the attempt failed.
  pub fn failure(&self) -> Option<&AttackFailure> {
    self.outcome.as_ref().err()
  }

  /// Whether the attempt failed.
  pub fn is_failure(&self) -> bool {
    self.outcome.is_err()
  }

  /// When the request started, right after its rate limiter slot.
  pub fn started_at(&self) -> Instant {
    self.started_at
  }
}

/// Items of an [`AttackRun`].
#[derive(Debug)]
pub enum AttackEvent {
  /// The next result in enumeration order.
  Result(AttackResult),
  /// Every planned variant was dispatched and has reported.
  Finished {
    /// Requests dispatched.
    dispatched: usize,
  },
  /// The run was cancelled; only dispatched requests reported.
  Cancelled {
    /// Requests dispatched before the cancellation.
    dispatched: usize,
  },
}

/// Everything an attack produced.
#[derive(Debug)]
pub struct AttackReport {
  /// Results in enumeration order.
  pub results: Vec<AttackResult>,
  /// Whether the run was cut short.
  pub cancelled: bool,
  /// Requests dispatched.
  pub dispatched: usize,
}

impl AttackReport {
  /// Results without a response.
  pub fn failures(&self) -> impl Iterator<Item = &AttackResult> {
    self.results.iter().filter(|result| result.is_failure())
  }

  /// Results with a response.
  pub fn responses(&self) -> impl Iterator<Item = &AttackResult> {
    self.results.iter().filter(|result| !result.is_failure())
  }
}

/// Stops an attack from another task.
#[derive(Debug, Clone)]
pub struct CancelHandle {
  tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
  /// Stop scheduling. Requests in flight still report.
  pub fn cancel(&self) {
    self.tx.send_replace(true);
  }
}

/// A running attack, consumed as an ordered stream of [`AttackEvent`]s.
///
/// The stream ends after the terminal `Finished` or `Cancelled` event.
/// Dropping the run cancels it.
#[derive(Debug)]
pub struct AttackRun {
  events: mpsc::Receiver<AttackEvent>,
  cancel: CancelHandle,
  planned: usize,
}

impl AttackRun {
  /// Number of variants the strategy enumerates.
  pub fn planned(&self) -> usize {
    self.planned
  }

  /// The next event, or `None` once the terminal event was delivered.
  pub async fn next(&mut self) -> Option<AttackEvent> {
    self.events.recv().await
  }

  /// Stop scheduling new requests.
  pub fn cancel(&self) {
    self.cancel.cancel();
  }

  /// A handle that can cancel this run from elsewhere.
  pub fn cancel_handle(&self) -> CancelHandle {
    self.cancel.clone()
  }

  /// Drain the run into a report.
  pub async fn collect(mut self) -> AttackReport {
    let mut results = Vec::new();
    while let Some(event) = self.next().await {
      match event {
        AttackEvent::Result(result) => results.push(result),
        AttackEvent::Finished { dispatched } => {
          return AttackReport {
            results,
            cancelled: false,
            dispatched,
          }
        }
        AttackEvent::Cancelled { dispatched } => {
          return AttackReport {
            results,
            cancelled: true,
            dispatched,
          }
        }
      }
    }
    let dispatched = results.len();
    AttackReport {
      results,
      cancelled: true,
      dispatched,
    }
  }
}

impl Drop for AttackRun {
  fn drop(&mut self) {
    self.cancel.cancel();
  }
}

impl Stream for AttackRun {
  type Item = AttackEvent;

  fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<AttackEvent>> {
    self.events.poll_recv(cx)
  }
}

/// Validated positions plus the enumeration they produce.
#[derive(Debug)]
struct Plan {
  template: RequestTemplate,
  positions: Vec<AttackPosition>,
  strategy: AttackStrategy,
  lengths: Vec<usize>,
  total: usize,
}

impl Plan {
  fn new(
    template: RequestTemplate,
    positions: Vec<AttackPosition>,
    strategy: AttackStrategy,
  ) -> Result<Self> {
    if positions.is_empty() {
      return Err(Error::payload_substitution("no attack positions given"));
    }
    let markers = template.markers();
    for (i, position) in positions.iter().enumerate() {
      let name = position.name();
      if !is_position_name(name) {
        return Err(Error::payload_substitution(format!(
          "invalid position name {:?}",
          name
        )));
      }
      if positions[..i].iter().any(|other| other.name() == name) {
        return Err(Error::payload_substitution(format!(
          "position {} declared twice",
          name
        )));
      }
      if !markers.iter().any(|marker| marker == name) {
        return Err(Error::payload_substitution(format!(
          "position {} has no {{{}}} marker in the template",
          name, name
        )));
      }
    }
    let lengths: Vec<usize> = positions.iter().map(|p| p.payloads().len()).collect();
    let total = strategy.count(&lengths).ok_or_else(|| {
      Error::payload_substitution(format!(
        "attack too large: {} over set lengths {:?}",
        strategy, lengths
      ))
    })?;
    Ok(Plan {
      template,
      positions,
      strategy,
      lengths,
      total,
    })
  }

  /// Position values and rendered request for variant `index`.
  fn variant(&self, index: usize) -> (Vec<(String, String)>, Result<Request>) {
    let slots = self
      .strategy
      .combination_at(&self.lengths, index)
      .unwrap_or_default();
    let payloads: Vec<(String, String)> = self
      .positions
      .iter()
      .zip(slots)
      .map(|(position, slot)| {
        let value = match slot {
          Slot::Base => position.base(),
          Slot::Payload { list, index } => self.positions[list].payloads().get(index).unwrap_or_default(),
        };
        (position.name().to_string(), value.to_string())
      })
      .collect();
    let values: HashMap<String, String> = payloads.iter().cloned().collect();
    let request = self.template.render(&values);
    (payloads, request)
  }
}

/// Sends request variants built from a template and payload sets.
#[derive(Debug, Clone)]
pub struct Intruder {
  client: Client,
  config: IntruderConfig,
  hooks: Arc<HookRegistry>,
  log: Option<Arc<ExchangeLog>>,
}

impl Intruder {
  /// An engine with its own client built from `config`. It follows up to
  /// ten redirects when `follow_redirects` is set.
  pub fn new(config: IntruderConfig) -> Result<Self> {
    let redirect = if config.follow_redirects {
      Policy::limited(MAX_REDIRECTS)
    } else {
      Policy::none()
    };
    let client = Client::builder()
      .timeout(config.request_timeout())
      .danger_accept_invalid_certs(!config.verify_certs)
      .redirect(redirect)
      .build()?;
    Ok(Self::with_client(client, config))
  }

  /// An engine sending through `client`.
  pub fn with_client(client: Client, config: IntruderConfig) -> Self {
    Intruder {
      client,
      config,
      hooks: Arc::new(HookRegistry::default()),
      log: None,
    }
  }

  /// Fire `intruder.result` hooks for every result.
  pub fn hooks(mut self, hooks: impl Into<Arc<HookRegistry>>) -> Self {
    self.hooks = hooks.into();
    self
  }

  /// Record every attempt that produced a request into `log`.
  pub fn log(mut self, log: Arc<ExchangeLog>) -> Self {
    self.log = Some(log);
    self
  }

  /// The settings in use.
  pub fn config(&self) -> &IntruderConfig {
    &self.config
  }

  /// Validate an attack and return how many requests it would send.
  pub fn plan(
    &self,
    template: &RequestTemplate,
    positions: &[AttackPosition],
    strategy: AttackStrategy,
  ) -> Result<usize> {
    Plan::new(template.clone(), positions.to_vec(), strategy).map(|plan| plan.total)
  }

  /// Validate and start an attack.
  ///
  /// # Errors
  ///
  /// [`Error::PayloadSubstitution`] when `positions` is empty, a name is
  /// repeated or invalid, or a position has no marker in the template.
  /// Nothing is sent in that case.
  pub fn fuzz(
    &self,
    template: impl Into<RequestTemplate>,
    positions: Vec<AttackPosition>,
    strategy: AttackStrategy,
  ) -> Result<AttackRun> {
    let plan = Plan::new(template.into(), positions, strategy)?;
    let planned = plan.total;
    tracing::info!(
      "[intruder] {} attack with {} positions, {} requests",
      strategy,
      plan.positions.len(),
      planned
    );
    let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let scheduler = Scheduler {
      plan: Arc::new(plan),
      client: self.client.clone(),
      concurrency: self.config.concurrency.max(1),
      limiter: RateLimiter::new(self.config.min_interval()),
      request_timeout: self.config.request_timeout(),
      hooks: self.hooks.clone(),
      log: self.log.clone(),
    };
    tokio::spawn(scheduler.run(cancel_rx, events_tx));
    Ok(AttackRun {
      events: events_rx,
      cancel: CancelHandle {
        tx: Arc::new(cancel_tx),
      },
      planned,
    })
  }
}

struct Scheduler {
  plan: Arc<Plan>,
  client: Client,
  concurrency: usize,
  limiter: RateLimiter,
  request_timeout: Duration,
  hooks: Arc<HookRegistry>,
  log: Option<Arc<ExchangeLog>>,
}

impl Scheduler {
  async fn run(self, mut cancel: watch::Receiver<bool>, events: mpsc::Sender<AttackEvent>) {
    let (results_tx, results_rx) = mpsc::unbounded_channel();
    let collector = tokio::spawn(collect(
      results_rx,
      events.clone(),
      self.hooks.clone(),
      self.log.clone(),
    ));
    let workers = Arc::new(Semaphore::new(self.concurrency));
    let mut dispatched = 0;
    let mut cancelled = false;

    for index in 0..self.plan.total {
      let permit = tokio::select! {
        biased;
        _ = async { let _ = cancel.wait_for(|stop| *stop).await; } => { cancelled = true; break; }
        permit = workers.clone().acquire_owned() => match permit {
          Ok(permit) => permit,
          Err(_) => break,
        },
      };
      let slot = tokio::select! {
        biased;
        _ = async { let _ = cancel.wait_for(|stop| *stop).await; } => { cancelled = true; break; }
        slot = self.limiter.acquire() => slot,
      };
      if *cancel.borrow() || events.is_closed() {
        cancelled = true;
        break;
      }

      let (payloads, request) = self.plan.variant(index);
      tracing::debug!("[intruder] dispatch #{} {:?}", index, payloads);
      dispatched += 1;
      let client = self.client.clone();
      let results = results_tx.clone();
      let request_timeout = self.request_timeout;
      tokio::spawn(async move {
        let result = attempt(
          &client,
          request_timeout,
          index,
          payloads,
          request,
          slot,
        )
        .await;
        drop(permit);
        let _ = results.send(result);
      });
    }

    drop(results_tx);
    if collector.await.is_err() {
      tracing::error!("[intruder] result collector failed");
    }
    let event = if cancelled {
      tracing::info!("[intruder] cancelled after {} requests", dispatched);
      AttackEvent::Cancelled { dispatched }
    } else {
      tracing::info!("[intruder] finished, {} requests", dispatched);
      AttackEvent::Finished { dispatched }
    };
    let _ = events.send(event).await;
  }
}

async fn attempt(
  client: &Client,
  request_timeout: Duration,
  index: usize,
  payloads: Vec<(String, String)>,
  request: Result<Request>,
  slot: RateSlot,
) -> AttackResult {
  let started_at = slot.start().into_std();
  let (request, outcome) = match request {
    Err(error) => (
      None,
      Err(AttackFailure {
        kind: FailureKind::InvalidRequest,
        message: error.to_string(),
      }),
    ),
    Ok(request) => {
      let outcome = match tokio::time::timeout(request_timeout, client.execute(&request)).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(error)) => Err(AttackFailure::from_error(&error)),
        Err(_) => Err(AttackFailure {
          kind: FailureKind::Timeout,
          message: format!("no response after {:?}", request_timeout),
        }),
      };
      (Some(request), outcome)
    }
  };
  AttackResult {
    index,
    request,
    payloads,
    outcome,
    started_at,
  }
}

/// Release results strictly by index.
async fn collect(
  mut results: mpsc::UnboundedReceiver<AttackResult>,
  events: mpsc::Sender<AttackEvent>,
  hooks: Arc<HookRegistry>,
  log: Option<Arc<ExchangeLog>>,
) {
  let mut pending = BTreeMap::new();
  let mut next = 0;
  while let Some(result) = results.recv().await {
    pending.insert(result.index, result);
    while let Some(result) = pending.remove(&next) {
      next += 1;
      deliver(result, &events, &hooks, log.as_deref()).await;
    }
  }
  for (_, result) in pending {
    deliver(result, &events, &hooks, log.as_deref()).await;
  }
}

async fn deliver(
  result: AttackResult,
  events: &mpsc::Sender<AttackEvent>,
  hooks: &HookRegistry,
  log: Option<&ExchangeLog>,
) {
  hooks.emit(&Event::AttackResult(&result));
  if let (Some(log), Some(request)) = (log, result.request()) {
    let connection = ConnectionInfo {
      client_addr: None,
      target_host: request.host().unwrap_or_default(),
      target_port: request.port(),
      tls_intercepted: false,
      excluded: false,
    };
    let content = ExchangeContent::Http {
      request: request.clone(),
      response: result.response().cloned(),
    };
    if let Err(error) = log.record(connection, content).await {
      tracing::warn!("[intruder] failed to record #{}: {}", result.index, error);
    }
  }
  let _ = events.send(AttackEvent::Result(result)).await;
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::intruder::PayloadSet;
  use http::Method;

  fn template() -> RequestTemplate {
    RequestTemplate::new(Method::GET, "http://127.0.0.1:9/{a}?b={b}")
  }

  #[test]
  fn validation_rejects_bad_positions() {
    let intruder = Intruder::new(IntruderConfig::default()).unwrap();
    let a = AttackPosition::new("a", PayloadSet::new(["1"]));
    let b = AttackPosition::new("b", PayloadSet::new(["x"]));
    let c = AttackPosition::new("c", PayloadSet::new(["x"]));
    let cases = [
      vec![],
      vec![a.clone(), a.clone()],
      vec![a.clone(), c],
      vec![AttackPosition::new("bad name", PayloadSet::new(["x"]))],
    ];
    for positions in cases {
      let err = intruder
        .plan(&template(), &positions, AttackStrategy::Sniper)
        .unwrap_err();
      assert!(matches!(err, Error::PayloadSubstitution(_)));
    }
    assert_eq!(
      intruder
        .plan(&template(), &[a, b], AttackStrategy::ClusterBomb)
        .unwrap(),
      1
    );
  }

  #[test]
  fn oversized_attack_is_refused() {
    let template = RequestTemplate::new(Method::GET, "http://127.0.0.1:9/{a}{b}{c}{d}{e}");
    let positions: Vec<AttackPosition> = ["a", "b", "c", "d", "e"]
      .into_iter()
      .map(|name| AttackPosition::new(name, PayloadSet::numbers(1, 10_000)))
      .collect();
    let intruder = Intruder::new(IntruderConfig::default()).unwrap();
    let err = intruder
      .plan(&template, &positions, AttackStrategy::ClusterBomb)
      .unwrap_err();
    assert!(matches!(err, Error::PayloadSubstitution(_)));
    assert_eq!(
      intruder
        .plan(&template, &positions, AttackStrategy::Sniper)
        .unwrap(),
      50_000
    );
  }

  #[test]
  fn sniper_variants_keep_base_values() {
    let plan = Plan::new(
      template(),
      vec![
        AttackPosition::new("a", PayloadSet::new(["1", "2"])).with_base("base"),
        AttackPosition::new("b", PayloadSet::new(["x"])).with_base("q"),
      ],
      AttackStrategy::Sniper,
    )
    .unwrap();
    assert_eq!(plan.total, 3);
    let (payloads, request) = plan.variant(2);
    assert_eq!(
      payloads,
      vec![
        ("a".to_string(), "base".to_string()),
        ("b".to_string(), "x".to_string())
      ]
    );
    assert_eq!(request.unwrap().uri().to_string(), "http://127.0.0.1:9/base?b=x");
  }

  #[test]
  fn battering_ram_uses_first_set_everywhere() {
    let plan = Plan::new(
      template(),
      vec![
        AttackPosition::new("a", PayloadSet::new(["p", "q"])),
        AttackPosition::new("b", PayloadSet::new(["ignored"])),
      ],
      AttackStrategy::BatteringRam,
    )
    .unwrap();
    let (_, request) = plan.variant(1);
    assert_eq!(request.unwrap().uri().to_string(), "http://127.0.0.1:9/q?b=q");
  }

  #[tokio::test]
  async fn empty_sets_finish_immediately() {
    let intruder = Intruder::new(IntruderConfig::default()).unwrap();
    let run = intruder
      .fuzz(
        template(),
        vec![
          AttackPosition::new("a", PayloadSet::default()),
          AttackPosition::new("b", PayloadSet::new(["x"])),
        ],
        AttackStrategy::Pitchfork,
      )
      .unwrap();
    assert_eq!(run.planned(), 0);
    let report = run.collect().await;
    assert!(!report.cancelled);
    assert_eq!(report.dispatched, 0);
    assert!(report.results.is_empty());
  }

  #[tokio::test]
  async fn invalid_variants_become_failures() {
    let intruder = Intruder::new(IntruderConfig {
      min_interval_ms: 0,
      ..IntruderConfig::default()
    })
    .unwrap();
    let template = RequestTemplate::new(Method::GET, "http://127.0.0.1:9/")
      .header("X-Token", "{v}");
    let run = intruder
      .fuzz(
        template,
        vec![AttackPosition::new("v", PayloadSet::new(["a\r\nb"]))],
        AttackStrategy::Sniper,
      )
      .unwrap();
    let report = run.collect().await;
    assert_eq!(report.results.len(), 1);
    let failure = report.results[0].failure().unwrap();
    assert_eq!(failure.kind, FailureKind::InvalidRequest);
    assert!(report.results[0].request().is_none());
  }
}
