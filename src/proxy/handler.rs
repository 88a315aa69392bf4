//! Per-connection state machine
//!
//! `AwaitRequestLine → ReadHeaders → (PlainForward | ConnectTunnel)`. Plain
//! requests loop back to `AwaitRequestLine` while the connection stays
//! persistent. An intercepted CONNECT runs the same loop over the decrypted
//! stream with the tunnel's host as the default authority.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode, Uri};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use crate::ca::CertificateManager;
use crate::client::Client;
use crate::config::ProxyConfig;
use crate::errors::{Error, Result};
use crate::framing::{self, RequestLine};
use crate::hooks::{Event, HookRegistry};
use crate::proxy::exclude::ExcludeList;
use crate::proxy::tunnel;
use crate::record::{ConnectionInfo, ExchangeContent};
use crate::store::ExchangeLog;
use crate::{tls, Request, Response};

const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Everything a handler shares with its siblings.
pub(crate) struct ProxyContext {
  pub(crate) config: ProxyConfig,
  pub(crate) certificates: Arc<CertificateManager>,
  pub(crate) log: Arc<ExchangeLog>,
  pub(crate) hooks: Arc<HookRegistry>,
  pub(crate) client: Client,
  pub(crate) excludes: ExcludeList,
}

/// Whose requests a session carries.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Origin {
  /// Forward-proxy requests in absolute form.
  Plain,
  /// Decrypted requests from inside a CONNECT tunnel.
  Intercepted { host: String, port: u16 },
}

enum State {
  AwaitRequestLine,
  ReadHeaders(RequestLine),
  PlainForward(RequestLine, HeaderMap),
  ConnectTunnel(String),
  Closed,
}

enum SessionEnd {
  Closed,
  Connect(String),
}

pub(crate) struct ConnectionHandler {
  ctx: Arc<ProxyContext>,
  client_addr: SocketAddr,
  shutdown: watch::Receiver<bool>,
}

impl ConnectionHandler {
  pub(crate) fn new(
    ctx: Arc<ProxyContext>,
    client_addr: SocketAddr,
    shutdown: watch::Receiver<bool>,
  ) -> Self {
    ConnectionHandler {
      ctx,
      client_addr,
      shutdown,
    }
  }

  /// Serve one accepted connection. Errors end only this connection.
  pub(crate) async fn run(mut self, stream: TcpStream) {
    tracing::debug!("[proxy] accepted {}", self.client_addr);
    match self.serve(stream).await {
      Ok(()) => tracing::debug!("[proxy] {} closed", self.client_addr),
      Err(error) if error.is_timeout() => {
        tracing::debug!("[proxy] {} timed out: {}", self.client_addr, error)
      }
      Err(error) => {
        tracing::debug!("[proxy] {} failed: {}", self.client_addr, error);
        self.ctx.hooks.emit(&Event::ConnectionError {
          client_addr: self.client_addr,
          error: &error,
        });
      }
    }
  }

  async fn serve(&mut self, stream: TcpStream) -> Result<()> {
    let mut reader = BufReader::new(stream);
    match self.session(&mut reader, &Origin::Plain).await? {
      SessionEnd::Closed => Ok(()),
      SessionEnd::Connect(target) => self.connect_tunnel(reader, &target).await,
    }
  }

  fn idle_timeout(&self) -> Duration {
    self.ctx.config.idle_timeout()
  }

  async fn session<S>(&mut self, reader: &mut BufReader<S>, origin: &Origin) -> Result<SessionEnd>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send,
  {
    let mut state = State::AwaitRequestLine;
    loop {
      state = match state {
        State::AwaitRequestLine => match self.await_request_line(reader).await {
          Ok(Some(line)) => State::ReadHeaders(line),
          Ok(None) => State::Closed,
          Err(error) => return reject(reader, error).await,
        },
        State::ReadHeaders(line) => {
          let headers = match with_deadline(self.idle_timeout(), framing::read_headers(reader)).await {
            Ok(headers) => headers,
            Err(error) => return reject(reader, error).await,
          };
          if line.method != Method::CONNECT {
            State::PlainForward(line, headers)
          } else if *origin == Origin::Plain {
            State::ConnectTunnel(line.target)
          } else {
            return reject(reader, Error::parse("CONNECT inside an intercepted tunnel")).await;
          }
        }
        State::PlainForward(line, headers) => match self.forward(reader, origin, line, headers).await {
          Ok(true) => State::AwaitRequestLine,
          Ok(false) => State::Closed,
          Err(error) => return reject(reader, error).await,
        },
        State::ConnectTunnel(target) => return Ok(SessionEnd::Connect(target)),
        State::Closed => return Ok(SessionEnd::Closed),
      };
    }
  }

  /// Next request line, or `None` on EOF, idle timeout or shutdown.
  async fn await_request_line<S>(&mut self, reader: &mut BufReader<S>) -> Result<Option<RequestLine>>
  where
    S: AsyncRead + Unpin,
  {
    let idle = self.idle_timeout();
    let client_addr = self.client_addr;
    let shutdown = &mut self.shutdown;
    loop {
      if *shutdown.borrow() {
        return Ok(None);
      }
      let line = tokio::select! {
        line = tokio::time::timeout(idle, framing::read_line(reader)) => match line {
          Ok(line) => line?,
          Err(_) => {
            tracing::debug!("[proxy] {} idle for {:?}", client_addr, idle);
            return Ok(None);
          }
        },
        _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => return Ok(None),
      };
      match line {
        None => return Ok(None),
        Some(line) if line.is_empty() => continue,
        Some(line) => return framing::parse_request_line(&line).map(Some),
      }
    }
  }

  /// Forward one request and write the response back. Returns whether the
  /// connection stays open.
  async fn forward<S>(
    &mut self,
    reader: &mut BufReader<S>,
    origin: &Origin,
    line: RequestLine,
    mut headers: HeaderMap,
  ) -> Result<bool>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send,
  {
    let uri = target_uri(origin, &line.target, &headers)?;
    let body_framing = framing::request_framing(&headers)?;
    let body = with_deadline(self.idle_timeout(), framing::read_body(reader, body_framing)).await?;
    let keep_alive = framing::keep_alive(line.version, &headers);
    framing::strip_hop_by_hop(&mut headers);
    if !body.is_empty() {
      headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    }
    let request = Request::from_parts(line.method, uri, line.version, headers, body);
    tracing::debug!(
      "[proxy] {} {} {}",
      self.client_addr,
      request.method(),
      request.uri()
    );

    let (raw, response, keep_alive) = match self.ctx.client.execute(&request).await {
      Ok(response) => (downstream_bytes(&response, keep_alive), Some(response), keep_alive),
      Err(error) => {
        tracing::warn!("[proxy] {} {} failed: {}", request.method(), request.uri(), error);
        let status = if error.is_timeout() {
          StatusCode::GATEWAY_TIMEOUT
        } else {
          StatusCode::BAD_GATEWAY
        };
        (framing::simple_response(status, &error.to_string()), None, false)
      }
    };

    let connection = ConnectionInfo {
      client_addr: Some(self.client_addr),
      target_host: request.host().unwrap_or_default(),
      target_port: request.port(),
      tls_intercepted: matches!(origin, Origin::Intercepted { .. }),
      excluded: false,
    };
    self
      .record(connection, ExchangeContent::Http { request, response })
      .await;

    let stream = reader.get_mut();
    stream.write_all(&raw).await?;
    stream.flush().await?;
    Ok(keep_alive)
  }

  async fn connect_tunnel(&mut self, reader: BufReader<TcpStream>, target: &str) -> Result<()> {
    let (host, port) = match framing::split_host_port(target, 443) {
      Ok(authority) => authority,
      Err(error) => {
        let mut reader = reader;
        return reject(&mut reader, error).await.map(|_| ());
      }
    };
    let leftover = reader.buffer().to_vec();
    let mut stream = reader.into_inner();
    let excluded = self.ctx.excludes.matches(&host);
    if excluded || !self.ctx.config.tls_intercept {
      return self.passthrough(stream, leftover, host, port, excluded).await;
    }
    stream.write_all(CONNECTION_ESTABLISHED).await?;
    stream.flush().await?;
    if !leftover.is_empty() {
      return Err(Error::parse("client sent data before the tunnel was established"));
    }
    self.intercept(stream, host, port).await
  }

  /// Relay raw bytes; only metadata and byte counts are recorded.
  async fn passthrough(
    &mut self,
    mut stream: TcpStream,
    leftover: Vec<u8>,
    host: String,
    port: u16,
    excluded: bool,
  ) -> Result<()> {
    let mut origin = match self.ctx.client.connector().connect_tcp(&host, port).await {
      Ok(origin) => origin,
      Err(error) => {
        let message = format!("{}:{} unreachable: {}", host, port, error);
        let _ = stream
          .write_all(&framing::simple_response(StatusCode::BAD_GATEWAY, &message))
          .await;
        let _ = stream.shutdown().await;
        return Err(Error::tunnel(message));
      }
    };
    stream.write_all(CONNECTION_ESTABLISHED).await?;
    stream.flush().await?;
    if !leftover.is_empty() {
      origin.write_all(&leftover).await?;
    }
    tracing::debug!(
      "[proxy] {} tunnelling {}:{} without interception",
      self.client_addr,
      host,
      port
    );
    let stats = tunnel::relay(stream, origin, self.idle_timeout()).await;
    let connection = ConnectionInfo {
      client_addr: Some(self.client_addr),
      target_host: host,
      target_port: port,
      tls_intercepted: false,
      excluded,
    };
    self
      .record(
        connection,
        ExchangeContent::Passthrough {
          bytes_from_client: stats.bytes_from_client + leftover.len() as u64,
          bytes_from_origin: stats.bytes_from_origin,
        },
      )
      .await;
    Ok(())
  }

  /// Terminate TLS with a forged leaf and serve the decrypted session.
  async fn intercept(&mut self, stream: TcpStream, host: String, port: u16) -> Result<()> {
    let leaf = self.ctx.certificates.get_leaf_certificate(&host).await?;
    let acceptor = TlsAcceptor::from(tls::server_config(&leaf)?);
    let tls_stream = match tokio::time::timeout(self.idle_timeout(), acceptor.accept(stream)).await {
      Ok(Ok(tls_stream)) => tls_stream,
      Ok(Err(error)) => {
        return Err(Error::tls_handshake(format!(
          "client handshake for {} failed: {}",
          host, error
        )))
      }
      Err(_) => return Err(Error::timeout(format!("client handshake for {}", host))),
    };
    tracing::debug!("[proxy] {} intercepting {}:{}", self.client_addr, host, port);
    let mut reader = BufReader::new(tls_stream);
    let origin = Origin::Intercepted { host, port };
    let end = self.session(&mut reader, &origin).await;
    let _ = reader.get_mut().shutdown().await;
    match end? {
      SessionEnd::Closed => Ok(()),
      SessionEnd::Connect(_) => Err(Error::parse("CONNECT inside an intercepted tunnel")),
    }
  }

  async fn record(&self, connection: ConnectionInfo, content: ExchangeContent) {
    if let Err(error) = self.ctx.log.record(connection, content).await {
      tracing::warn!("[proxy] failed to record exchange: {}", error);
    }
  }
}

async fn with_deadline<F, T>(deadline: Duration, fut: F) -> Result<T>
where
  F: std::future::Future<Output = Result<T>>,
{
  tokio::time::timeout(deadline, fut)
    .await
    .map_err(|_| Error::timeout(format!("no data for {:?}", deadline)))?
}

/// Answer malformed input with 400 and give the error back.
async fn reject<S>(reader: &mut BufReader<S>, error: Error) -> Result<SessionEnd>
where
  S: AsyncWrite + AsyncRead + Unpin,
{
  if matches!(error, Error::Parse(_)) {
    let stream = reader.get_mut();
    let _ = stream
      .write_all(&framing::simple_response(StatusCode::BAD_REQUEST, &error.to_string()))
      .await;
    let _ = stream.flush().await;
  }
  Err(error)
}

fn format_authority(host: &str, port: u16, default_port: u16) -> String {
  let host = if host.contains(':') {
    format!("[{}]", host)
  } else {
    host.to_string()
  };
  if port == default_port {
    host
  } else {
    format!("{}:{}", host, port)
  }
}

/// Resolve the request target to an absolute URI.
fn target_uri(origin: &Origin, target: &str, headers: &HeaderMap) -> Result<Uri> {
  let absolute = target.contains("://");
  let uri = match origin {
    _ if absolute => target.to_string(),
    Origin::Intercepted { host, port } if target.starts_with('/') => {
      format!("https://{}{}", format_authority(host, *port, 443), target)
    }
    Origin::Plain if target.starts_with('/') => {
      let host = headers
        .get(http::header::HOST)
        .and_then(|h| h.to_str().ok())
        .filter(|h| !h.trim().is_empty())
        .ok_or_else(|| Error::parse("origin-form request without Host header"))?;
      format!("http://{}{}", host.trim(), target)
    }
    _ => return Err(Error::parse(format!("unsupported request target: {}", target))),
  };
  let uri: Uri = uri
    .parse()
    .map_err(|e| Error::parse(format!("invalid request target {}: {}", target, e)))?;
  match uri.scheme_str() {
    Some("http") | Some("https") if uri.host().is_some() => {}
    _ => return Err(Error::parse(format!("unsupported request target: {}", target))),
  }
  if let Origin::Intercepted { host, port } = origin {
    let target_host = uri.host().unwrap_or_default().trim_start_matches('[').trim_end_matches(']');
    let same_origin = uri.scheme_str() == Some("https")
      && target_host.eq_ignore_ascii_case(host)
      && uri.port_u16().unwrap_or(443) == *port;
    if !same_origin {
      return Err(Error::parse(format!(
        "request target {} leaves the tunnel to {}",
        target,
        format_authority(host, *port, 443)
      )));
    }
  }
  Ok(uri)
}

fn downstream_bytes(response: &Response, keep_alive: bool) -> Bytes {
  let mut out = response
    .without_header(&http::header::CONNECTION)
    .without_header(&HeaderName::from_static("keep-alive"));
  if !keep_alive {
    out = out.with_header(http::header::CONNECTION, HeaderValue::from_static("close"));
  }
  out.to_raw()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn absolute_targets_pass_through() {
    let uri = target_uri(&Origin::Plain, "http://example.com:8080/a?b", &HeaderMap::new()).unwrap();
    assert_eq!(uri.to_string(), "http://example.com:8080/a?b");
  }

  #[test]
  fn origin_form_uses_tunnel_authority() {
    let origin = Origin::Intercepted {
      host: "example.com".to_string(),
      port: 443,
    };
    let uri = target_uri(&origin, "/login", &HeaderMap::new()).unwrap();
    assert_eq!(uri.to_string(), "https://example.com/login");
    let origin = Origin::Intercepted {
      host: "::1".to_string(),
      port: 8443,
    };
    let uri = target_uri(&origin, "/", &HeaderMap::new()).unwrap();
    assert_eq!(uri.to_string(), "https://[::1]:8443/");
  }

  #[test]
  fn absolute_targets_must_stay_in_the_tunnel() {
    let origin = Origin::Intercepted {
      host: "a.test".to_string(),
      port: 443,
    };
    let headers = HeaderMap::new();
    let uri = target_uri(&origin, "https://A.test/x", &headers).unwrap();
    assert_eq!(uri.to_string(), "https://A.test/x");
    assert!(target_uri(&origin, "https://a.test:443/", &headers).is_ok());
    for target in ["https://b.test/", "http://a.test/", "https://a.test:8443/"] {
      let err = target_uri(&origin, target, &headers).unwrap_err();
      assert!(matches!(err, Error::Parse(_)), "{}", target);
    }
  }

  #[test]
  fn origin_form_on_plain_proxy_needs_host() {
    assert!(target_uri(&Origin::Plain, "/", &HeaderMap::new()).is_err());
    let mut headers = HeaderMap::new();
    headers.insert("host", HeaderValue::from_static("intranet:81"));
    let uri = target_uri(&Origin::Plain, "/x", &headers).unwrap();
    assert_eq!(uri.to_string(), "http://intranet:81/x");
    assert!(target_uri(&Origin::Plain, "ftp://example.com/", &headers).is_err());
    assert!(target_uri(&Origin::Plain, "*", &headers).is_err());
  }

  #[test]
  fn downstream_connection_header() {
    let response: Response = http::Response::builder()
      .header("connection", "keep-alive")
      .header("keep-alive", "timeout=5")
      .body("ok")
      .unwrap()
      .into();
    let raw = String::from_utf8(downstream_bytes(&response, false).to_vec()).unwrap();
    assert!(raw.contains("connection: close\r\n"));
    assert!(!raw.contains("keep-alive"));
    let raw = String::from_utf8(downstream_bytes(&response, true).to_vec()).unwrap();
    assert!(!raw.contains("connection:"));
  }
}
