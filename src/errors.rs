//! Error types shared by the proxy, the certificate authority and the attack engine

use std::io;
use thiserror::Error as ThisError;

/// A `Result` alias where the `Err` case is `volley::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The errors that may occur while intercepting traffic or running an attack.
#[derive(ThisError, Debug)]
pub enum Error {
  /// Client-side or origin-side TLS negotiation failed, including leaf signing failures.
  #[error("TLS handshake error: {0}")]
  TlsHandshake(String),

  /// CONNECT target unreachable or refused.
  #[error("tunnel error: {0}")]
  Tunnel(String),

  /// Malformed HTTP framing.
  #[error("parse error: {0}")]
  Parse(String),

  /// An attack references a position missing from the template or the payload map.
  #[error("payload substitution error: {0}")]
  PayloadSubstitution(String),

  /// Root or leaf certificate generation, loading or serialization failed.
  #[error("certificate error: {0}")]
  Certificate(String),

  /// An operation exceeded its deadline.
  #[error("timed out: {0}")]
  Timeout(String),

  /// IO error
  #[error(transparent)]
  Io(#[from] io::Error),

  /// http::Error
  #[error(transparent)]
  Http(#[from] http::Error),

  /// Configuration could not be read or is invalid.
  #[error("config error: {0}")]
  Config(String),

  /// The traffic store rejected an append.
  #[error("store error: {0}")]
  Store(String),

  /// Other errors
  #[error("{0}")]
  Other(String),
}

impl Error {
  /// Create a TLS handshake error and log it
  pub fn tls_handshake(msg: impl Into<String>) -> Self {
    let error = Error::TlsHandshake(msg.into());
    tracing::warn!("{}", error);
    error
  }

  /// Create a tunnel error and log it
  pub fn tunnel(msg: impl Into<String>) -> Self {
    let error = Error::Tunnel(msg.into());
    tracing::warn!("{}", error);
    error
  }

  /// Create a parse error and log it
  pub fn parse(msg: impl Into<String>) -> Self {
    let error = Error::Parse(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a payload substitution error and log it
  pub fn payload_substitution(msg: impl Into<String>) -> Self {
    let error = Error::PayloadSubstitution(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a certificate error and log it
  pub fn certificate(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a timeout error
  pub fn timeout(msg: impl Into<String>) -> Self {
    Error::Timeout(msg.into())
  }

  /// Create a config error and log it
  pub fn config(msg: impl Into<String>) -> Self {
    let error = Error::Config(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a store error and log it
  pub fn store(msg: impl Into<String>) -> Self {
    let error = Error::Store(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create an other error
  pub fn other(msg: impl Into<String>) -> Self {
    Error::Other(msg.into())
  }

  /// Whether the error comes from a deadline rather than the network or the peer.
  pub fn is_timeout(&self) -> bool {
    match self {
      Error::Timeout(_) => true,
      Error::Io(e) => e.kind() == io::ErrorKind::TimedOut,
      _ => false,
    }
  }
}

impl From<tokio_rustls::rustls::Error> for Error {
  fn from(value: tokio_rustls::rustls::Error) -> Self {
    Error::tls_handshake(value.to_string())
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::header::InvalidHeaderName> for Error {
  fn from(value: http::header::InvalidHeaderName) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::uri::InvalidUri> for Error {
  fn from(value: http::uri::InvalidUri) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<serde_json::Error> for Error {
  fn from(value: serde_json::Error) -> Self {
    Error::config(format!("invalid JSON: {}", value))
  }
}

impl From<toml::de::Error> for Error {
  fn from(value: toml::de::Error) -> Self {
    Error::config(format!("invalid TOML: {}", value))
  }
}

pub(crate) fn new_io_error(error_kind: io::ErrorKind, msg: &str) -> Error {
  Error::Io(io::Error::new(error_kind, msg))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn timeouts_are_recognised() {
    assert!(Error::timeout("slow").is_timeout());
    assert!(new_io_error(io::ErrorKind::TimedOut, "slow").is_timeout());
    assert!(!Error::parse("bad").is_timeout());
  }
}
