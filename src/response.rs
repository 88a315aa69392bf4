use std::fmt::{Debug, Formatter};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode, Version};
use tokio::io::AsyncBufRead;

use crate::errors::{Error, Result};
use crate::framing;
use crate::{Request, COLON_SPACE, CR_LF, SPACE};

/// A Response to a submitted `Request`.
///
/// Bodies are always held de-chunked. Serializing with [`Response::to_raw`]
/// re-frames the body with a `Content-Length`.
#[derive(Clone)]
pub struct Response {
  version: Version,
  status: StatusCode,
  headers: HeaderMap,
  body: Bytes,
  received_at: SystemTime,
  elapsed: Duration,
}

impl Debug for Response {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Response")
      .field("version", &self.version)
      .field("status", &self.status)
      .field("headers", &self.headers)
      .field("body_len", &self.body.len())
      .field("elapsed", &self.elapsed)
      .finish()
  }
}

impl PartialEq for Response {
  fn eq(&self, other: &Self) -> bool {
    self.version == other.version
      && self.status == other.status
      && self.headers == other.headers
      && self.body == other.body
  }
}

impl<T> From<http::Response<T>> for Response
where
  T: Into<Bytes>,
{
  fn from(value: http::Response<T>) -> Self {
    let (parts, body) = value.into_parts();
    Response {
      version: parts.version,
      status: parts.status,
      headers: parts.headers,
      body: body.into(),
      received_at: SystemTime::now(),
      elapsed: Duration::ZERO,
    }
  }
}

impl Response {
  /// An HTTP response builder
  ///
  /// This type can be used to construct an instance of `Response` through a
  /// builder-like pattern.
  pub fn builder() -> http::response::Builder {
    http::response::Builder::new()
  }

  /// Get the `StatusCode` of this `Response`.
  #[inline]
  pub fn status_code(&self) -> StatusCode {
    self.status
  }

  /// Get the HTTP `Version` of this `Response`.
  #[inline]
  pub fn version(&self) -> Version {
    self.version
  }

  /// Get the `Headers` of this `Response`.
  #[inline]
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }

  /// The de-chunked body.
  #[inline]
  pub fn body(&self) -> &Bytes {
    &self.body
  }

  /// Body decoded as UTF-8 with invalid sequences replaced.
  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).to_string()
  }

  /// When the response head was fully read.
  #[inline]
  pub fn received_at(&self) -> SystemTime {
    self.received_at
  }

  /// Time from dispatching the request to reading the full response.
  #[inline]
  pub fn elapsed(&self) -> Duration {
    self.elapsed
  }

  /// Get the content-length of the response, if the origin sent one.
  pub fn content_length(&self) -> Option<u64> {
    self
      .headers
      .get(http::header::CONTENT_LENGTH)
      .and_then(|x| x.to_str().ok()?.parse().ok())
  }

  pub(crate) fn with_elapsed(mut self, elapsed: Duration) -> Response {
    self.elapsed = elapsed;
    self
  }

  /// A copy with `name` set to `value`.
  pub fn with_header(&self, name: HeaderName, value: HeaderValue) -> Response {
    let mut next = self.clone();
    next.headers.insert(name, value);
    next
  }

  /// A copy without any `name` header.
  pub fn without_header(&self, name: &HeaderName) -> Response {
    let mut next = self.clone();
    next.headers.remove(name);
    next
  }

  fn permits_body(&self) -> bool {
    !(self.status.is_informational()
      || self.status == StatusCode::NO_CONTENT
      || self.status == StatusCode::NOT_MODIFIED)
  }

  /// Serialize for a downstream client.
  ///
  /// `Transfer-Encoding` is dropped because the body is already de-chunked;
  /// a `Content-Length` is written whenever the status permits a body and
  /// none was sent.
  pub fn to_raw(&self) -> Bytes {
    let mut http_response = Vec::with_capacity(256 + self.body.len());
    http_response.extend(format!("{:?}", self.version).as_bytes());
    http_response.extend(SPACE);
    http_response.extend(self.status.as_str().as_bytes());
    http_response.extend(SPACE);
    http_response.extend(self.status.canonical_reason().unwrap_or("Unknown").as_bytes());
    http_response.extend(CR_LF);
    let mut headers = self.headers.clone();
    let rechunked = headers.remove(http::header::TRANSFER_ENCODING).is_some();
    if self.permits_body() && (rechunked || !headers.contains_key(http::header::CONTENT_LENGTH)) {
      headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(self.body.len()));
    }
    for (k, v) in headers.iter() {
      http_response.extend(k.as_str().as_bytes());
      http_response.extend(COLON_SPACE);
      http_response.extend(v.as_bytes());
      http_response.extend(CR_LF);
    }
    http_response.extend(CR_LF);
    http_response.extend(self.body.as_ref());
    Bytes::from(http_response)
  }
}

/// Options for reading one response off a connection.
#[derive(Debug, Clone)]
pub struct ResponseConfig {
  method: Method,
}

impl ResponseConfig {
  /// Config for the response to `request`.
  pub fn new(request: &Request) -> Self {
    ResponseConfig {
      method: request.method().clone(),
    }
  }
}

/// Reads a `Response` off a buffered connection.
///
/// To construct a `ResponseBuilder`, refer to the `Client` documentation.
#[derive(Debug)]
pub struct ResponseBuilder<'a, R> {
  reader: &'a mut R,
  config: ResponseConfig,
}

impl<'a, R: AsyncBufRead + Unpin> ResponseBuilder<'a, R> {
  /// Constructs a new response reader.
  pub fn new(reader: &'a mut R, config: ResponseConfig) -> ResponseBuilder<'a, R> {
    ResponseBuilder { reader, config }
  }

  async fn parser_version(&mut self) -> Result<(Version, StatusCode)> {
    loop {
      let line = framing::read_line(self.reader)
        .await?
        .ok_or_else(|| Error::parse("connection closed before status line"))?;
      if line.is_empty() {
        continue;
      }
      return framing::parse_status_line(&line);
    }
  }

  /// Read status line, headers and body. Interim 1xx responses are skipped.
  pub async fn build(mut self) -> Result<Response> {
    loop {
      let (version, status) = self.parser_version().await?;
      let headers = framing::read_headers(self.reader).await?;
      if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
        continue;
      }
      let received_at = SystemTime::now();
      let body_framing = framing::response_framing(&self.config.method, status, &headers)?;
      let body = framing::read_body(self.reader, body_framing).await?;
      return Ok(Response {
        version,
        status,
        headers,
        body,
        received_at,
        elapsed: Duration::ZERO,
      });
    }
  }
}
