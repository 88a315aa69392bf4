use std::net::SocketAddr;
use std::time::Duration;

use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

use crate::errors::{new_io_error, Error, Result};
use crate::socket::{MaybeTlsStream, Socket};
use crate::tls::{self, Certificate};

/// ConnectorBuilder
#[derive(Clone, Debug)]
pub struct ConnectorBuilder {
  certs_verification: bool,
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
  certificate: Vec<Certificate>,
}

impl Default for ConnectorBuilder {
  fn default() -> Self {
    Self {
      certs_verification: true,
      connect_timeout: Some(Duration::from_secs(10)),
      nodelay: true,
      keepalive: false,
      certificate: vec![],
    }
  }
}

impl ConnectorBuilder {
  /// Controls the use of certificate validation against origins.
  ///
  /// Defaults to `true`.
  ///
  /// # Warning
  ///
  /// If invalid certificates are trusted, *any* certificate for *any* site
  /// will be trusted for use, including expired certificates.
  pub fn certs_verification(mut self, value: bool) -> ConnectorBuilder {
    self.certs_verification = value;
    self
  }

  /// Set that all sockets have `SO_NODELAY` set to the supplied value `nodelay`.
  ///
  /// Default is `true`.
  pub fn nodelay(mut self, value: bool) -> ConnectorBuilder {
    self.nodelay = value;
    self
  }

  /// Sets value for the `SO_KEEPALIVE` option on this socket.
  ///
  /// Default is `false`.
  pub fn keepalive(mut self, value: bool) -> ConnectorBuilder {
    self.keepalive = value;
    self
  }

  /// Adds certificates to the set of roots that the connector will trust.
  pub fn certificate(mut self, value: Vec<Certificate>) -> ConnectorBuilder {
    self.certificate = value;
    self
  }

  /// Set a timeout for only the connect phase.
  ///
  /// Default is 10 seconds.
  pub fn connect_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.connect_timeout = timeout;
    self
  }

  /// Combine the configuration of this builder to create a `Connector`.
  pub fn build(&self) -> Result<Connector> {
    let config = tls::client_config(self.certs_verification, &self.certificate)?;
    Ok(Connector {
      connect_timeout: self.connect_timeout,
      nodelay: self.nodelay,
      keepalive: self.keepalive,
      tls: TlsConnector::from(config),
    })
  }
}

/// Opens TCP connections to origins and upgrades them to TLS.
#[derive(Clone)]
pub struct Connector {
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
  tls: TlsConnector,
}

impl std::fmt::Debug for Connector {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Connector")
      .field("connect_timeout", &self.connect_timeout)
      .field("nodelay", &self.nodelay)
      .field("keepalive", &self.keepalive)
      .finish()
  }
}

impl Connector {
  /// Connect to a remote endpoint with addr
  pub async fn connect_with_addr<S: Into<SocketAddr>>(&self, addr: S) -> Result<TcpStream> {
    let addr = addr.into();
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    if self.nodelay {
      socket.set_nodelay(self.nodelay)?;
    }
    if self.keepalive {
      socket.set_keepalive(self.keepalive)?;
    }
    let s = match self.connect_timeout {
      None => socket.connect(addr).await?,
      Some(timeout) => tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|x| new_io_error(std::io::ErrorKind::TimedOut, &x.to_string()))??,
    };
    Ok(s)
  }

  /// Resolve `host` and connect to the first address that accepts.
  pub async fn connect_tcp(&self, host: &str, port: u16) -> Result<TcpStream> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
    let mut last_error = None;
    for addr in addrs {
      match self.connect_with_addr(addr).await {
        Ok(stream) => return Ok(stream),
        Err(err) => {
          tracing::debug!("[connector] {} ({}) refused: {}", host, addr, err);
          last_error = Some(err);
        }
      }
    }
    Err(last_error.unwrap_or_else(|| {
      new_io_error(
        std::io::ErrorKind::NotFound,
        &format!("no addresses resolved for {}", host),
      )
    }))
  }

  /// Connect to the origin named by an absolute URI, with TLS for `https`.
  pub async fn connect_with_uri(&self, target: &http::Uri) -> Result<Socket> {
    let host = target
      .host()
      .ok_or_else(|| Error::parse(format!("no host in {}", target)))?
      .trim_start_matches('[')
      .trim_end_matches(']');
    let https = target.scheme() == Some(&http::uri::Scheme::HTTPS);
    let port = target.port_u16().unwrap_or(if https { 443 } else { 80 });
    let tcp = self.connect_tcp(host, port).await?;
    if !https {
      return Ok(Socket::new(MaybeTlsStream::Tcp(tcp)));
    }
    self.upgrade_to_tls(tcp, host).await
  }

  /// Run a client TLS handshake over `stream`, sending `domain` as SNI.
  pub async fn upgrade_to_tls(&self, stream: TcpStream, domain: &str) -> Result<Socket> {
    let domain = ServerName::try_from(domain.to_owned())
      .map_err(|e| Error::tls_handshake(format!("invalid server name {}: {}", domain, e)))?;
    let tls = self
      .tls
      .connect(domain, stream)
      .await
      .map_err(|e| Error::tls_handshake(format!("origin handshake failed: {}", e)))?;
    Ok(Socket::new(MaybeTlsStream::Tls(Box::new(tls))))
  }
}
