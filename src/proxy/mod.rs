//! Intercepting proxy
//!
//! Plain HTTP requests are forwarded in absolute form. `CONNECT` tunnels are
//! either terminated with a leaf certificate forged by
//! [`CertificateManager`](crate::CertificateManager) and replayed upstream,
//! or relayed blind when the host is excluded or interception is off.

pub mod exclude;
mod handler;
pub mod server;
pub mod tunnel;

pub use exclude::ExcludeList;
pub use server::{ProxyHandle, ProxyServer, ProxyServerBuilder};
pub use tunnel::TunnelStats;
