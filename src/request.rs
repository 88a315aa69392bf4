use std::fmt::{Debug, Formatter};
use std::time::SystemTime;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, Uri, Version};

use crate::errors::{Error, Result};
use crate::{COLON_SPACE, CR_LF, SPACE};

/// An immutable HTTP request shared by the proxy, the repeater and the attack engine.
///
/// Header names are case-insensitive and keep their insertion order. Every edit
/// returns a new `Request`; the creation timestamp is reset on each edit because
/// the edited request is a new message.
#[derive(Clone)]
pub struct Request {
  method: Method,
  uri: Uri,
  version: Version,
  headers: HeaderMap,
  body: Bytes,
  created_at: SystemTime,
}

impl Debug for Request {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Request")
      .field("method", &self.method)
      .field("uri", &self.uri)
      .field("version", &self.version)
      .field("headers", &self.headers)
      .field("body", &format_args!("{}", self.body.escape_ascii()))
      .finish()
  }
}

impl Default for Request {
  fn default() -> Self {
    Request::new(Method::GET, Uri::from_static("/"))
  }
}

impl<T> From<http::Request<T>> for Request
where
  T: Into<Bytes>,
{
  fn from(value: http::Request<T>) -> Self {
    let (parts, body) = value.into_parts();
    Request::from_parts(parts.method, parts.uri, parts.version, parts.headers, body.into())
  }
}

impl Request {
  /// A body-less HTTP/1.1 request.
  pub fn new(method: Method, uri: Uri) -> Self {
    Request::from_parts(method, uri, Version::HTTP_11, HeaderMap::new(), Bytes::new())
  }

  /// Assemble a request from already-parsed parts.
  pub fn from_parts(
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
  ) -> Self {
    Request {
      method,
      uri,
      version,
      headers,
      body,
      created_at: SystemTime::now(),
    }
  }

  /// Creates a new builder-style object to manufacture a `Request`
  ///
  /// # Examples
  ///
  /// ```
  /// let request = volley::Request::builder()
  ///   .method("POST")
  ///   .uri("http://127.0.0.1/login")
  ///   .header("Content-Type", "application/x-www-form-urlencoded")
  ///   .body("user=admin")
  ///   .unwrap();
  /// assert_eq!(request.body().as_ref(), b"user=admin");
  /// ```
  pub fn builder() -> RequestBuilder {
    RequestBuilder::default()
  }

  /// The HTTP method.
  #[inline]
  pub fn method(&self) -> &Method {
    &self.method
  }

  /// The target URI. Absolute for anything that leaves the process.
  #[inline]
  pub fn uri(&self) -> &Uri {
    &self.uri
  }

  /// The HTTP version.
  #[inline]
  pub fn version(&self) -> Version {
    self.version
  }

  /// The header map.
  #[inline]
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }

  /// The body bytes, empty when the request has no body.
  #[inline]
  pub fn body(&self) -> &Bytes {
    &self.body
  }

  /// When this message was constructed.
  #[inline]
  pub fn created_at(&self) -> SystemTime {
    self.created_at
  }

  /// Whether the target uses the `https` scheme.
  pub fn is_https(&self) -> bool {
    self.uri.scheme() == Some(&http::uri::Scheme::HTTPS)
  }

  /// The target host, from the URI or else from the `Host` header.
  pub fn host(&self) -> Option<String> {
    if let Some(host) = self.uri.host() {
      return Some(host.trim_start_matches('[').trim_end_matches(']').to_string());
    }
    let header = self.headers.get(http::header::HOST)?.to_str().ok()?;
    let (host, _) = crate::framing::split_host_port(header, 80).ok()?;
    Some(host)
  }

  /// The target port, defaulting from the scheme.
  pub fn port(&self) -> u16 {
    self
      .uri
      .port_u16()
      .unwrap_or(if self.is_https() { 443 } else { 80 })
  }

  /// A copy with a different method.
  pub fn with_method(&self, method: Method) -> Request {
    let mut next = self.edited();
    next.method = method;
    next
  }

  /// A copy with a different target URI.
  pub fn with_uri(&self, uri: Uri) -> Request {
    let mut next = self.edited();
    next.uri = uri;
    next
  }

  /// A copy with `name` set to `value`, replacing existing values.
  pub fn with_header(&self, name: HeaderName, value: HeaderValue) -> Request {
    let mut next = self.edited();
    next.headers.insert(name, value);
    next
  }

  /// A copy without any `name` header.
  pub fn without_header(&self, name: &HeaderName) -> Request {
    let mut next = self.edited();
    next.headers.remove(name);
    next
  }

  /// A copy with a new body. A present `Content-Length` is updated to match.
  pub fn with_body(&self, body: impl Into<Bytes>) -> Request {
    let mut next = self.edited();
    next.body = body.into();
    if next.headers.contains_key(http::header::CONTENT_LENGTH) {
      next
        .headers
        .insert(http::header::CONTENT_LENGTH, HeaderValue::from(next.body.len()));
    }
    next
  }

  fn edited(&self) -> Request {
    Request {
      created_at: SystemTime::now(),
      ..self.clone()
    }
  }

  /// Serialize in origin-form, as sent to an origin server.
  ///
  /// A `Host` header is added from the URI authority when missing, and a
  /// `Content-Length` when the body is non-empty and no length is set.
  pub fn to_raw(&self) -> Bytes {
    let mut raw = Vec::with_capacity(256 + self.body.len());
    raw.extend(self.method.as_str().as_bytes());
    raw.extend(SPACE);
    let target = self
      .uri
      .path_and_query()
      .map(|pq| pq.as_str())
      .filter(|pq| !pq.is_empty())
      .unwrap_or("/");
    raw.extend(target.as_bytes());
    raw.extend(SPACE);
    raw.extend(format!("{:?}", self.version).as_bytes());
    raw.extend(CR_LF);
    if !self.headers.contains_key(http::header::HOST) {
      if let Some(authority) = self.uri.authority() {
        raw.extend(http::header::HOST.as_str().as_bytes());
        raw.extend(COLON_SPACE);
        raw.extend(authority.as_str().as_bytes());
        raw.extend(CR_LF);
      }
    }
    let mut headers = self.headers.clone();
    if !self.body.is_empty() && !headers.contains_key(http::header::TRANSFER_ENCODING) {
      headers
        .entry(http::header::CONTENT_LENGTH)
        .or_insert(HeaderValue::from(self.body.len()));
    }
    for (k, v) in headers.iter() {
      raw.extend(k.as_str().as_bytes());
      raw.extend(COLON_SPACE);
      raw.extend(v.as_bytes());
      raw.extend(CR_LF);
    }
    raw.extend(CR_LF);
    raw.extend(self.body.as_ref());
    Bytes::from(raw)
  }
}

/// A builder to construct the properties of a `Request`.
#[derive(Debug)]
#[must_use = "RequestBuilder does nothing until you call `body` or `build`"]
pub struct RequestBuilder {
  builder: http::request::Builder,
}

impl Default for RequestBuilder {
  fn default() -> Self {
    RequestBuilder {
      builder: http::request::Builder::new(),
    }
  }
}

impl RequestBuilder {
  /// Set the HTTP method.
  pub fn method<M>(mut self, method: M) -> RequestBuilder
  where
    Method: TryFrom<M>,
    <Method as TryFrom<M>>::Error: Into<http::Error>,
  {
    self.builder = self.builder.method(method);
    self
  }

  /// Set the target URI.
  pub fn uri<U>(mut self, uri: U) -> RequestBuilder
  where
    Uri: TryFrom<U>,
    <Uri as TryFrom<U>>::Error: Into<http::Error>,
  {
    self.builder = self.builder.uri(uri);
    self
  }

  /// Append a header.
  pub fn header<K, V>(mut self, key: K, value: V) -> RequestBuilder
  where
    HeaderName: TryFrom<K>,
    HeaderValue: TryFrom<V>,
    <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
    <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
  {
    self.builder = self.builder.header(key, value);
    self
  }

  /// Add a `Header` from `Name: value` lines.
  pub fn header_lines(mut self, lines: &str) -> Result<RequestBuilder> {
    for line in lines.lines().filter(|l| !l.trim().is_empty()) {
      let (name, value) = crate::framing::parse_header_line(line.as_bytes())?;
      self.builder = self.builder.header(name, value);
    }
    Ok(self)
  }

  /// Finish with `body`.
  pub fn body(self, body: impl Into<Bytes>) -> Result<Request> {
    let request = self.builder.body(body.into()).map_err(Error::Http)?;
    Ok(request.into())
  }

  /// Finish with an empty body.
  pub fn build(self) -> Result<Request> {
    self.body(Bytes::new())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn to_raw_adds_host_and_length() {
    let request = Request::builder()
      .method("POST")
      .uri("http://example.com:8080/a?b=c")
      .header("X-Test", "1")
      .body("hello")
      .unwrap();
    let raw = String::from_utf8(request.to_raw().to_vec()).unwrap();
    assert!(raw.starts_with("POST /a?b=c HTTP/1.1\r\n"));
    assert!(raw.contains("host: example.com:8080\r\n"));
    assert!(raw.contains("content-length: 5\r\n"));
    assert!(raw.ends_with("\r\n\r\nhello"));
  }

  #[test]
  fn edits_produce_new_instances() {
    let original = Request::builder()
      .uri("http://example.com/")
      .header("Content-Length", "2")
      .body("hi")
      .unwrap();
    let edited = original
      .with_body("hello")
      .with_header(http::header::USER_AGENT, HeaderValue::from_static("volley"));
    assert_eq!(original.body().as_ref(), b"hi");
    assert_eq!(original.headers().get("content-length").unwrap(), "2");
    assert_eq!(edited.headers().get("content-length").unwrap(), "5");
    assert_eq!(edited.headers().get("user-agent").unwrap(), "volley");
    assert!(original.headers().get("user-agent").is_none());
  }

  #[test]
  fn host_and_port_fall_back_to_scheme_and_header() {
    let request = Request::builder().uri("https://example.com/x").build().unwrap();
    assert_eq!(request.host().as_deref(), Some("example.com"));
    assert_eq!(request.port(), 443);
    let request = Request::builder()
      .uri("/x")
      .header("Host", "intranet:8081")
      .build()
      .unwrap();
    assert_eq!(request.host().as_deref(), Some("intranet"));
  }

  #[test]
  fn header_lines_are_parsed() {
    let request = Request::builder()
      .uri("http://example.com/")
      .header_lines("Accept: text/html\r\nX-Forwarded-For: 127.0.0.1\r\n")
      .unwrap()
      .build()
      .unwrap();
    assert_eq!(request.headers()["accept"], "text/html");
    assert_eq!(request.headers()["x-forwarded-for"], "127.0.0.1");
  }
}
