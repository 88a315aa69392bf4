use std::sync::Arc;
use std::time::{Duration, Instant};

use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use tokio::io::{AsyncWriteExt, BufReader};

use crate::connector::{Connector, ConnectorBuilder};
use crate::errors::{Error, Result};
use crate::redirect::{self, Action, Policy};
use crate::response::{ResponseBuilder, ResponseConfig};
use crate::tls::Certificate;
use crate::{Request, Response};

/// Sends requests to origins on behalf of the proxy, the repeater and the
/// attack engine.
///
/// Each exchange uses a fresh connection. Redirects are not followed unless
/// a [`Policy`] says so, so by default the response returned is exactly what
/// the origin sent for this request. Cloning is cheap and clones share
/// configuration.
///
/// # Examples
///
/// ```rust
/// # use std::time::Duration;
/// # fn run() -> volley::Result<()> {
/// let client = volley::Client::builder()
///   .timeout(Duration::from_secs(10))
///   .danger_accept_invalid_certs(true)
///   .build()?;
/// # drop(client);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct Client {
  inner: Arc<ClientRef>,
}

#[derive(Debug)]
struct ClientRef {
  connector: Connector,
  timeout: Option<Duration>,
  default_headers: HeaderMap,
  redirect_policy: Policy,
}

impl Client {
  /// Creates a `ClientBuilder` to configure a `Client`.
  pub fn builder() -> ClientBuilder {
    ClientBuilder::new()
  }

  /// The connector, for callers that need a raw connection to an origin.
  pub fn connector(&self) -> &Connector {
    &self.inner.connector
  }

  /// The redirect policy in use.
  pub fn redirect_policy(&self) -> &Policy {
    &self.inner.redirect_policy
  }

  /// A client sharing this one's settings but with another redirect policy.
  pub fn with_redirect(&self, policy: Policy) -> Client {
    Client {
      inner: Arc::new(ClientRef {
        connector: self.inner.connector.clone(),
        timeout: self.inner.timeout,
        default_headers: self.inner.default_headers.clone(),
        redirect_policy: policy,
      }),
    }
  }

  /// Executes a `Request` against the origin named by its absolute URI.
  ///
  /// # Errors
  ///
  /// Fails when the origin cannot be reached, the TLS handshake fails, the
  /// response is malformed or the whole exchange, redirects included,
  /// exceeds the timeout.
  pub async fn execute(&self, request: &Request) -> Result<Response> {
    let start = Instant::now();
    let exchange = self.follow(request);
    let response = match self.inner.timeout {
      Some(timeout) => tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| Error::timeout(format!("{} {} after {:?}", request.method(), request.uri(), timeout)))??,
      None => exchange.await?,
    };
    tracing::trace!(
      "[client] {} {} -> {} in {:?}",
      request.method(),
      request.uri(),
      response.status_code(),
      start.elapsed()
    );
    Ok(response.with_elapsed(start.elapsed()))
  }

  /// Send `request`, then each redirect hop the policy allows.
  async fn follow(&self, request: &Request) -> Result<Response> {
    let mut current = request.clone();
    let mut previous: Vec<Uri> = Vec::new();
    loop {
      let response = self.exchange(&current).await?;
      if self.inner.redirect_policy.is_none() || !redirect::is_redirect(response.status_code()) {
        return Ok(response);
      }
      let next = match response
        .headers()
        .get(http::header::LOCATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| redirect::resolve(current.uri(), value))
      {
        Some(next) => next,
        None => return Ok(response),
      };
      previous.push(current.uri().clone());
      match self
        .inner
        .redirect_policy
        .check(response.status_code(), &next, &previous)
      {
        Action::Stop => return Ok(response),
        Action::Follow => {
          tracing::debug!(
            "[client] {} redirect {} -> {}",
            response.status_code(),
            current.uri(),
            next
          );
          current = redirected(&current, response.status_code(), next, &previous);
        }
      }
    }
  }

  async fn exchange(&self, request: &Request) -> Result<Response> {
    if request.uri().host().is_none() {
      return Err(Error::parse(format!(
        "request target {} is not absolute",
        request.uri()
      )));
    }
    let mut socket = self.inner.connector.connect_with_uri(request.uri()).await?;
    let mut outgoing = request.clone();
    for (name, value) in self.inner.default_headers.iter() {
      if !outgoing.headers().contains_key(name) {
        outgoing = outgoing.with_header(name.clone(), value.clone());
      }
    }
    socket.write_all(&outgoing.to_raw()).await?;
    socket.flush().await?;
    let mut reader = BufReader::new(socket);
    ResponseBuilder::new(&mut reader, ResponseConfig::new(&outgoing))
      .build()
      .await
  }
}

/// The request for the next hop. 301, 302 and 303 turn anything but GET
/// and HEAD into a bodiless GET; 307 and 308 resend as is.
fn redirected(request: &Request, status: StatusCode, next: Uri, previous: &[Uri]) -> Request {
  let mut headers = request.headers().clone();
  headers.remove(http::header::HOST);
  redirect::remove_sensitive_headers(&mut headers, &next, previous);
  let keep_method = matches!(
    status,
    StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT
  ) || *request.method() == Method::GET
    || *request.method() == Method::HEAD;
  let (method, body) = if keep_method {
    (request.method().clone(), request.body().clone())
  } else {
    for name in [
      http::header::CONTENT_LENGTH,
      http::header::CONTENT_TYPE,
      http::header::CONTENT_ENCODING,
      http::header::TRANSFER_ENCODING,
    ] {
      headers.remove(name);
    }
    (Method::GET, bytes::Bytes::new())
  };
  Request::from_parts(method, next, request.version(), headers, body)
}

/// A `ClientBuilder` can be used to create a `Client` with custom configuration.
#[must_use]
#[derive(Debug)]
pub struct ClientBuilder {
  connector: ConnectorBuilder,
  timeout: Option<Duration>,
  default_headers: HeaderMap,
  accept_invalid_certs: bool,
  root_certificates: Vec<Certificate>,
  redirect_policy: Policy,
}

impl Default for ClientBuilder {
  fn default() -> Self {
    Self::new()
  }
}

impl ClientBuilder {
  /// Constructs a new `ClientBuilder`.
  ///
  /// This is the same as `Client::builder()`.
  pub fn new() -> ClientBuilder {
    ClientBuilder {
      connector: ConnectorBuilder::default(),
      timeout: Some(Duration::from_secs(30)),
      default_headers: HeaderMap::new(),
      accept_invalid_certs: false,
      root_certificates: vec![],
      redirect_policy: Policy::none(),
    }
  }

  /// Returns a `Client` that uses this `ClientBuilder` configuration.
  ///
  /// # Errors
  ///
  /// This method fails if the TLS backend cannot be initialized.
  pub fn build(self) -> Result<Client> {
    let connector = self
      .connector
      .certs_verification(!self.accept_invalid_certs)
      .certificate(self.root_certificates)
      .build()?;
    Ok(Client {
      inner: Arc::new(ClientRef {
        connector,
        timeout: self.timeout,
        default_headers: self.default_headers,
        redirect_policy: self.redirect_policy,
      }),
    })
  }

  /// Sets a `User-Agent` header for requests that carry none.
  pub fn user_agent<V>(mut self, value: V) -> ClientBuilder
  where
    V: Into<HeaderValue>,
  {
    self
      .default_headers
      .insert(http::header::USER_AGENT, value.into());
    self
  }

  /// Headers added to every request that does not already set them.
  pub fn default_headers(mut self, headers: HeaderMap) -> ClientBuilder {
    for (key, value) in headers.iter() {
      self.default_headers.insert(key, value.clone());
    }
    self
  }

  /// Total deadline for connect, send and receive.
  ///
  /// Default is 30 seconds.
  pub fn timeout(mut self, timeout: Duration) -> ClientBuilder {
    self.timeout = Some(timeout);
    self
  }

  /// Set a timeout for only the connect phase.
  ///
  /// Default is 10 seconds.
  pub fn connect_timeout(mut self, timeout: Duration) -> ClientBuilder {
    self.connector = self.connector.connect_timeout(Some(timeout));
    self
  }

  /// Set whether sockets have `TCP_NODELAY` enabled.
  ///
  /// Default is `true`.
  pub fn tcp_nodelay(mut self, enabled: bool) -> ClientBuilder {
    self.connector = self.connector.nodelay(enabled);
    self
  }

  /// Set a `redirect::Policy` for this client.
  ///
  /// Default is [`Policy::none`].
  pub fn redirect(mut self, policy: Policy) -> ClientBuilder {
    self.redirect_policy = policy;
    self
  }

  /// Add a custom root certificate.
  ///
  /// This can be used to connect to a server that has a self-signed
  /// certificate for example.
  pub fn add_root_certificate(mut self, cert: Certificate) -> ClientBuilder {
    self.root_certificates.push(cert);
    self
  }

  /// Controls the use of certificate validation.
  ///
  /// Defaults to `false`.
  ///
  /// # Warning
  ///
  /// You should think very carefully before using this method. If
  /// invalid certificates are trusted, *any* certificate for *any* site
  /// will be trusted for use. This includes expired certificates.
  pub fn danger_accept_invalid_certs(mut self, accept_invalid_certs: bool) -> ClientBuilder {
    self.accept_invalid_certs = accept_invalid_certs;
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::AsyncReadExt;
  use tokio::net::TcpListener;

  #[tokio::test]
  async fn execute_reads_one_response() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      let (mut stream, _) = listener.accept().await.unwrap();
      let mut buf = vec![0u8; 4096];
      let n = stream.read(&mut buf).await.unwrap();
      let head = String::from_utf8_lossy(&buf[..n]).to_string();
      let body = if head.contains("user-agent: volley-test") { "ua" } else { "none" };
      let reply = format!("HTTP/1.1 201 Created\r\nContent-Length: {}\r\n\r\n{}", body.len(), body);
      stream.write_all(reply.as_bytes()).await.unwrap();
    });
    let client = Client::builder()
      .user_agent(HeaderValue::from_static("volley-test"))
      .build()
      .unwrap();
    let request = Request::builder()
      .uri(format!("http://{}/created", addr))
      .build()
      .unwrap();
    let response = client.execute(&request).await.unwrap();
    assert_eq!(response.status_code(), http::StatusCode::CREATED);
    assert_eq!(response.text(), "ua");
  }

  /// Answers `/start` with `status` pointing at `/done`, and `/done` with
  /// the method and body it received.
  async fn redirecting_origin(status: &'static str) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      while let Ok((mut stream, _)) = listener.accept().await {
        let mut buf = vec![0u8; 4096];
        let n = stream.read(&mut buf).await.unwrap_or(0);
        let head = String::from_utf8_lossy(&buf[..n]).to_string();
        let reply = if head.contains(" /start ") {
          format!(
            "HTTP/1.1 {}\r\nLocation: /done\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            status
          )
        } else {
          let method = head.split(' ').next().unwrap_or("").to_string();
          let body = head.split("\r\n\r\n").nth(1).unwrap_or("");
          let text = format!("{} {}", method, body);
          format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            text.len(),
            text
          )
        };
        let _ = stream.write_all(reply.as_bytes()).await;
      }
    });
    addr
  }

  fn post(addr: std::net::SocketAddr) -> Request {
    Request::builder()
      .method("POST")
      .uri(format!("http://{}/start", addr))
      .body("a=1")
      .unwrap()
  }

  #[tokio::test]
  async fn redirects_are_returned_by_default() {
    let addr = redirecting_origin("302 Found").await;
    let client = Client::builder().build().unwrap();
    let response = client.execute(&post(addr)).await.unwrap();
    assert_eq!(response.status_code(), StatusCode::FOUND);
    assert_eq!(response.headers()["location"], "/done");
  }

  #[tokio::test]
  async fn found_is_followed_as_get() {
    let addr = redirecting_origin("302 Found").await;
    let client = Client::builder().redirect(Policy::limited(5)).build().unwrap();
    let response = client.execute(&post(addr)).await.unwrap();
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.text(), "GET ");
  }

  #[tokio::test]
  async fn temporary_redirect_keeps_method_and_body() {
    let addr = redirecting_origin("307 Temporary Redirect").await;
    let client = Client::builder()
      .build()
      .unwrap()
      .with_redirect(Policy::limited(5));
    let response = client.execute(&post(addr)).await.unwrap();
    assert_eq!(response.text(), "POST a=1");
  }

  #[tokio::test]
  async fn relative_targets_are_rejected() {
    let client = Client::builder().build().unwrap();
    let request = Request::builder().uri("/relative").build().unwrap();
    let err = client.execute(&request).await.unwrap_err();
    assert!(matches!(err, Error::Parse(_)), "{:?}", err);
  }

  #[tokio::test]
  async fn silent_origin_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      let (_stream, _) = listener.accept().await.unwrap();
      tokio::time::sleep(Duration::from_secs(5)).await;
    });
    let client = Client::builder()
      .timeout(Duration::from_millis(200))
      .build()
      .unwrap();
    let request = Request::builder()
      .uri(format!("http://{}/", addr))
      .build()
      .unwrap();
    let err = client.execute(&request).await.unwrap_err();
    assert!(err.is_timeout(), "{:?}", err);
  }
}
