//! Request templates with `{name}` markers.
//!
//! A marker is `{` + a position name + `}` where the name is made of ASCII
//! letters, digits, `_`, `.` and `-`. Braces around anything else, such as a
//! JSON body, are left alone. Substitution is a single left-to-right pass,
//! so a payload containing `{other}` is never expanded again.

use std::collections::HashMap;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{Method, Uri, Version};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

use crate::errors::{Error, Result};
use crate::intruder::payloads::PayloadSet;
use crate::Request;

/// Bytes that cannot appear raw in a URI. `%` is kept so payloads may carry
/// their own escapes.
const URI_UNSAFE: &AsciiSet = &CONTROLS
  .add(b' ')
  .add(b'"')
  .add(b'<')
  .add(b'>')
  .add(b'\\')
  .add(b'`')
  .add(b'#')
  .add(b'{')
  .add(b'}')
  .add(b'|')
  .add(b'^');

/// Whether `name` can be used as a position name.
pub fn is_position_name(name: &str) -> bool {
  !name.is_empty()
    && name
      .bytes()
      .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

/// Replace every marker `lookup` knows, leaving the rest as written.
fn substitute<F>(text: &str, mut lookup: F) -> String
where
  F: FnMut(&str) -> Option<String>,
{
  let mut out = String::with_capacity(text.len());
  let mut rest = text;
  while let Some(open) = rest.find('{') {
    out.push_str(&rest[..open]);
    let after = &rest[open + 1..];
    match after.find('}') {
      Some(close) if is_position_name(&after[..close]) => {
        let name = &after[..close];
        match lookup(name) {
          Some(value) => out.push_str(&value),
          None => {
            out.push('{');
            out.push_str(name);
            out.push('}');
          }
        }
        rest = &after[close + 1..];
      }
      _ => {
        out.push('{');
        rest = after;
      }
    }
  }
  out.push_str(rest);
  out
}

/// A named marker, the payloads swept through it and the value it keeps
/// when another position is being swept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttackPosition {
  name: String,
  payloads: PayloadSet,
  base: String,
}

impl AttackPosition {
  /// A position with an empty base value.
  pub fn new(name: impl Into<String>, payloads: impl Into<PayloadSet>) -> Self {
    AttackPosition {
      name: name.into(),
      payloads: payloads.into(),
      base: String::new(),
    }
  }

  /// Value used while the position is not swept.
  pub fn with_base(mut self, base: impl Into<String>) -> Self {
    self.base = base.into();
    self
  }

  /// Marker name, without braces.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Payloads bound to this position.
  pub fn payloads(&self) -> &PayloadSet {
    &self.payloads
  }

  /// Base value.
  pub fn base(&self) -> &str {
    &self.base
  }
}

/// A request whose URI, header values and body may contain markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTemplate {
  method: Method,
  uri: String,
  headers: Vec<(String, String)>,
  body: String,
}

impl RequestTemplate {
  /// A template with no headers and an empty body. `uri` must be absolute
  /// once substituted.
  pub fn new(method: Method, uri: impl Into<String>) -> Self {
    RequestTemplate {
      method,
      uri: uri.into(),
      headers: Vec::new(),
      body: String::new(),
    }
  }

  /// Append a header; the value may contain markers.
  pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// Set the body.
  pub fn body(mut self, body: impl Into<String>) -> Self {
    self.body = body.into();
    self
  }

  /// Start from a captured request. Markers are added by editing the
  /// result; non UTF-8 bytes are replaced.
  pub fn from_request(request: &Request) -> Self {
    RequestTemplate {
      method: request.method().clone(),
      uri: request.uri().to_string(),
      headers: request
        .headers()
        .iter()
        .map(|(name, value)| {
          (
            name.as_str().to_string(),
            String::from_utf8_lossy(value.as_bytes()).into_owned(),
          )
        })
        .collect(),
      body: String::from_utf8_lossy(request.body()).into_owned(),
    }
  }

  /// Parse raw request text as copied from a proxy history.
  ///
  /// An origin-form target is made absolute with `scheme` and the Host
  /// header. Line endings may be `\r\n` or `\n`.
  pub fn from_raw(raw: &str, scheme: &str) -> Result<Self> {
    let (head, body) = match raw.find("\r\n\r\n") {
      Some(i) => (&raw[..i], &raw[i + 4..]),
      None => match raw.find("\n\n") {
        Some(i) => (&raw[..i], &raw[i + 2..]),
        None => (raw, ""),
      },
    };
    let mut lines = head.lines();
    let request_line = lines
      .next()
      .filter(|line| !line.trim().is_empty())
      .ok_or_else(|| Error::parse("empty request template"))?;
    let mut parts = request_line.split_whitespace();
    let (method, target) = match (parts.next(), parts.next()) {
      (Some(method), Some(target)) => (method, target),
      _ => {
        return Err(Error::parse(format!(
          "invalid request line: {}",
          request_line
        )))
      }
    };
    let method = Method::from_bytes(method.as_bytes())
      .map_err(|_| Error::parse(format!("invalid method: {}", method)))?;
    let mut headers = Vec::new();
    for line in lines {
      let (name, value) = line
        .split_once(':')
        .ok_or_else(|| Error::parse(format!("invalid header line: {}", line)))?;
      headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    let uri = if target.contains("://") {
      target.to_string()
    } else {
      let host = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(HOST.as_str()))
        .map(|(_, value)| value.as_str())
        .ok_or_else(|| Error::parse("origin-form template without Host header"))?;
      format!("{}://{}{}", scheme, host, target)
    };
    Ok(RequestTemplate {
      method,
      uri,
      headers,
      body: body.to_string(),
    })
  }

  /// Method.
  pub fn method(&self) -> &Method {
    &self.method
  }

  /// URI text, markers included.
  pub fn uri(&self) -> &str {
    &self.uri
  }

  /// Marker names in order of first appearance: URI, then header values,
  /// then body.
  pub fn markers(&self) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let texts = std::iter::once(self.uri.as_str())
      .chain(self.headers.iter().map(|(_, value)| value.as_str()))
      .chain(std::iter::once(self.body.as_str()));
    for text in texts {
      substitute(text, |name| {
        if !names.iter().any(|known| known == name) {
          names.push(name.to_string());
        }
        None
      });
    }
    names
  }

  /// Whether `{name}` appears anywhere.
  pub fn has_marker(&self, name: &str) -> bool {
    self.markers().iter().any(|marker| marker == name)
  }

  /// Build the concrete request for one set of values.
  ///
  /// Values placed in the URI are percent-encoded where the URI grammar
  /// requires it; header and body values are inserted verbatim. Markers
  /// without a value stay in place. Content-Length follows the rendered body.
  pub fn render(&self, values: &HashMap<String, String>) -> Result<Request> {
    let uri = substitute(&self.uri, |name| {
      values
        .get(name)
        .map(|value| utf8_percent_encode(value, URI_UNSAFE).to_string())
    });
    let uri: Uri = uri
      .parse()
      .map_err(|e| Error::parse(format!("rendered URI {:?} is invalid: {}", uri, e)))?;
    let mut headers = HeaderMap::new();
    for (name, value) in &self.headers {
      let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| Error::parse(format!("invalid header name {:?}: {}", name, e)))?;
      if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
        continue;
      }
      let value = substitute(value, |marker| values.get(marker).cloned());
      let value = HeaderValue::from_str(&value)
        .map_err(|e| Error::parse(format!("invalid value for {}: {}", name, e)))?;
      headers.append(name, value);
    }
    let body = substitute(&self.body, |name| values.get(name).cloned());
    let had_length = self
      .headers
      .iter()
      .any(|(name, _)| name.eq_ignore_ascii_case(CONTENT_LENGTH.as_str()));
    if had_length || !body.is_empty() {
      headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    }
    Ok(Request::from_parts(
      self.method.clone(),
      uri,
      Version::HTTP_11,
      headers,
      Bytes::from(body),
    ))
  }
}

impl From<&Request> for RequestTemplate {
  fn from(request: &Request) -> Self {
    RequestTemplate::from_request(request)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn values(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect()
  }

  #[test]
  fn position_names() {
    assert!(is_position_name("user_id"));
    assert!(is_position_name("a.b-c"));
    assert!(!is_position_name(""));
    assert!(!is_position_name("\"a\":1"));
    assert!(!is_position_name("two words"));
  }

  #[test]
  fn markers_in_order_of_appearance() {
    let template = RequestTemplate::new(Method::POST, "http://t/{path}?q={q}")
      .header("X-Token", "{token}")
      .body(r#"{"q":"{q}","n":{n}}"#);
    assert_eq!(template.markers(), ["path", "q", "token", "n"]);
    assert!(template.has_marker("token"));
    assert!(!template.has_marker("missing"));
  }

  #[test]
  fn render_substitutes_everywhere() {
    let template = RequestTemplate::new(Method::POST, "http://t/items/{id}")
      .header("Authorization", "Bearer {token}")
      .header("Content-Length", "0")
      .body("name={name}");
    let request = template
      .render(&values(&[("id", "7"), ("token", "abc"), ("name", "bob")]))
      .unwrap();
    assert_eq!(request.uri().to_string(), "http://t/items/7");
    assert_eq!(request.headers()["authorization"], "Bearer abc");
    assert_eq!(request.headers()["content-length"], "8");
    assert_eq!(request.body().as_ref(), b"name=bob");
  }

  #[test]
  fn uri_payloads_are_encoded() {
    let template = RequestTemplate::new(Method::GET, "http://t/s?q={q}");
    let request = template
      .render(&values(&[("q", "<script>alert(1)</script> #x")]))
      .unwrap();
    assert_eq!(
      request.uri().to_string(),
      "http://t/s?q=%3Cscript%3Ealert(1)%3C/script%3E%20%23x"
    );
    let request = template.render(&values(&[("q", "%27")])).unwrap();
    assert_eq!(request.uri().query(), Some("q=%27"));
  }

  #[test]
  fn substitution_is_single_pass() {
    let template = RequestTemplate::new(Method::GET, "http://t/").body("{a}{b}");
    let request = template
      .render(&values(&[("a", "{b}"), ("b", "x")]))
      .unwrap();
    assert_eq!(request.body().as_ref(), b"{b}x");
  }

  #[test]
  fn json_braces_survive() {
    let template = RequestTemplate::new(Method::POST, "http://t/").body(r#"{"user": "{u}"}"#);
    let request = template.render(&values(&[("u", "root")])).unwrap();
    assert_eq!(request.body().as_ref(), br#"{"user": "root"}"#);
  }

  #[test]
  fn invalid_header_value_is_reported() {
    let template = RequestTemplate::new(Method::GET, "http://t/").header("X-A", "{v}");
    let err = template.render(&values(&[("v", "a\r\nb")])).unwrap_err();
    assert!(matches!(err, Error::Parse(_)));
  }

  #[test]
  fn raw_template_uses_host_header() {
    let raw = "POST /login?next={next} HTTP/1.1\r\nHost: app.test\r\nContent-Type: text/plain\r\n\r\nuser={user}";
    let template = RequestTemplate::from_raw(raw, "https").unwrap();
    assert_eq!(template.method(), Method::POST);
    assert_eq!(template.uri(), "https://app.test/login?next={next}");
    assert_eq!(template.markers(), ["next", "user"]);
    assert!(RequestTemplate::from_raw("GET / HTTP/1.1\n\n", "http").is_err());
  }

  #[test]
  fn from_request_keeps_fields() {
    let request = Request::builder()
      .method(Method::PUT)
      .uri("http://t/x")
      .header("x-a", "1")
      .body("data")
      .unwrap();
    let template = RequestTemplate::from(&request);
    let rendered = template.render(&HashMap::new()).unwrap();
    assert_eq!(rendered.method(), Method::PUT);
    assert_eq!(rendered.headers()["x-a"], "1");
    assert_eq!(rendered.body().as_ref(), b"data");
  }
}
