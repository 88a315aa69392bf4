#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # volley
//!
//! The `volley` crate is an intercepting HTTP(S) proxy and request attack
//! toolkit for web application testing.
//!
//! - An HTTP forward proxy that terminates `CONNECT` tunnels with leaf
//!   certificates forged on the fly by a local [`CertificateAuthority`]
//! - A [traffic history](#traffic-history) numbering every captured exchange
//! - An [`Intruder`] sending template variants with four
//!   [attack strategies](#attack-strategies)
//! - A [`Repeater`] for replaying and comparing single requests
//!
//! ## Running the proxy
//!
//! The CA certificate is written next to its key the first time the proxy
//! runs. Install `ca_cert.pem` in the client's trust store, then point the
//! client at the proxy.
//!
//! ```no_run
//! # async fn run() -> volley::Result<()> {
//! let config = volley::Config::load("volley.toml")?;
//! let certificates = volley::CertificateManager::load_or_generate(&config.ca_storage_path).await?;
//! let server = volley::ProxyServer::builder()
//!   .config(config.proxy.clone())
//!   .certificates(certificates)
//!   .build()?;
//! server.run(&config.proxy.bind_address()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Hosts in [`ProxyConfig::exclude_domains`] are tunnelled without
//! interception. Only the connection metadata and byte counts of such
//! tunnels are recorded.
//!
//! ## Traffic history
//!
//! Every exchange the proxy, the repeater or the intruder observes is given
//! a sequence number by an [`ExchangeLog`] and appended to a
//! [`TrafficStore`]. Numbers start at 1 and have no gaps. [`MemoryStore`] is
//! the in-process store.
//!
//! ## Attack strategies
//!
//! | Strategy | Variants for set lengths `L1..Ln` |
//! |---|---|
//! | [`AttackStrategy::Sniper`] | `L1 + .. + Ln` |
//! | [`AttackStrategy::BatteringRam`] | `L1` |
//! | [`AttackStrategy::Pitchfork`] | `min(L1..Ln)` |
//! | [`AttackStrategy::ClusterBomb`] | `L1 * .. * Ln` |
//!
//! ```no_run
//! # async fn run() -> volley::Result<()> {
//! use volley::intruder::{AttackEvent, AttackPosition, PayloadSet, RequestTemplate};
//!
//! let template = RequestTemplate::from_raw(
//!   "POST /login HTTP/1.1\r\nHost: app.test\r\n\r\nuser={user}&pass={pass}",
//!   "https",
//! )?;
//! let positions = vec![
//!   AttackPosition::new("user", PayloadSet::new(["admin", "root"])),
//!   AttackPosition::new("pass", PayloadSet::common()),
//! ];
//! let intruder = volley::Intruder::new(volley::IntruderConfig::default())?;
//! let mut run = intruder.fuzz(template, positions, volley::AttackStrategy::ClusterBomb)?;
//! while let Some(event) = run.next().await {
//!   if let AttackEvent::Result(result) = event {
//!     println!("{:?} -> {:?}", result.payloads(), result.response().map(|r| r.status_code()));
//!   }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Hooks
//!
//! A [`HookRegistry`] maps event names to handlers that run synchronously in
//! registration order. It is built once and shared with the proxy and the
//! intruder.
//!
//! ## Logging
//!
//! Everything is logged through `tracing`. Install a subscriber such as
//! `tracing-subscriber` to see it.

mod ca;
mod client;
mod config;
mod connector;
mod errors;
mod framing;
/// Event hooks
pub mod hooks;
pub mod intruder;
pub mod proxy;
/// Captured traffic
pub mod record;
pub mod redirect;
mod repeater;
mod request;
mod response;
mod socket;
mod store;
mod tls;

pub use ca::{CertificateAuthority, CertificateManager, LeafCertificate};
pub use client::{Client, ClientBuilder};
pub use config::{Config, IntruderConfig, ProxyConfig};
pub use connector::{Connector, ConnectorBuilder};
pub use errors::{Error, Result};
pub use hooks::{Event, Hook, HookRegistry, HookRegistryBuilder, LoggingHook};
pub use http::header;
pub use http::uri;
pub use http::Method;
pub use http::{StatusCode, Version};
pub use intruder::{AttackResult, AttackRun, AttackStrategy, Intruder};
pub use proxy::{ExcludeList, ProxyHandle, ProxyServer, ProxyServerBuilder};
pub use record::{CapturedExchange, ConnectionInfo, ExchangeContent};
pub use repeater::{HeaderChange, Repeater, ResponseDiff};
pub use request::{Request, RequestBuilder};
pub use response::{Response, ResponseBuilder, ResponseConfig};
pub use socket::Socket;
pub use store::{ExchangeLog, MemoryStore, TrafficStore};
pub use tls::Certificate;

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];
