use std::net::SocketAddr;
use std::time::SystemTime;

use crate::{Request, Response};

/// Where a captured exchange travelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
  /// Address of the downstream client, absent for requests the process originated.
  pub client_addr: Option<SocketAddr>,
  /// Target host as named by the client.
  pub target_host: String,
  /// Target port.
  pub target_port: u16,
  /// Whether the proxy terminated TLS for this exchange.
  pub tls_intercepted: bool,
  /// Whether the target matched the exclusion list and was tunnelled blind.
  pub excluded: bool,
}

/// What was observed on the connection.
#[derive(Debug, Clone)]
pub enum ExchangeContent {
  /// A parsed request and, unless the origin failed, its response.
  Http {
    /// The request as forwarded to the origin.
    request: Request,
    /// The origin's response.
    response: Option<Response>,
  },
  /// An opaque tunnel; only byte counts are known.
  Passthrough {
    /// Bytes relayed from client to origin.
    bytes_from_client: u64,
    /// Bytes relayed from origin to client.
    bytes_from_origin: u64,
  },
}

/// One entry in the traffic history.
#[derive(Debug, Clone)]
pub struct CapturedExchange {
  sequence: u64,
  connection: ConnectionInfo,
  content: ExchangeContent,
  captured_at: SystemTime,
}

impl CapturedExchange {
  pub(crate) fn new(sequence: u64, connection: ConnectionInfo, content: ExchangeContent) -> Self {
    CapturedExchange {
      sequence,
      connection,
      content,
      captured_at: SystemTime::now(),
    }
  }

  /// Position in the history, starting at 1 with no gaps.
  pub fn sequence(&self) -> u64 {
    self.sequence
  }

  /// Connection metadata.
  pub fn connection(&self) -> &ConnectionInfo {
    &self.connection
  }

  /// The observed content.
  pub fn content(&self) -> &ExchangeContent {
    &self.content
  }

  /// When the exchange was recorded.
  pub fn captured_at(&self) -> SystemTime {
    self.captured_at
  }

  /// The request, unless this was a blind tunnel.
  pub fn request(&self) -> Option<&Request> {
    match &self.content {
      ExchangeContent::Http { request, .. } => Some(request),
      ExchangeContent::Passthrough { .. } => None,
    }
  }

  /// The response, if one was received.
  pub fn response(&self) -> Option<&Response> {
    match &self.content {
      ExchangeContent::Http { response, .. } => response.as_ref(),
      ExchangeContent::Passthrough { .. } => None,
    }
  }

  /// Whether only tunnel metadata was recorded.
  pub fn is_passthrough(&self) -> bool {
    matches!(self.content, ExchangeContent::Passthrough { .. })
  }
}
