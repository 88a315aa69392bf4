//! HTTP/1.x wire framing shared by the proxy handler and the outbound client.

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::errors::{Error, Result};
use crate::{CR_LF, SPACE};

/// Longest accepted request, status or header line.
pub(crate) const MAX_LINE: usize = 16 * 1024;
/// Largest accepted header block.
pub(crate) const MAX_HEADERS: usize = 64 * 1024;
/// Largest body buffered in memory.
pub(crate) const MAX_BODY: usize = 64 * 1024 * 1024;

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
  Empty,
  Length(usize),
  Chunked,
  UntilEof,
}

/// First line of a client request, before headers are read.
#[derive(Debug, Clone)]
pub(crate) struct RequestLine {
  pub method: Method,
  pub target: String,
  pub version: Version,
}

/// Read one line terminated by LF. `None` means EOF before any byte.
pub(crate) async fn read_line<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = Vec::new();
  let mut limited = (&mut *reader).take(MAX_LINE as u64);
  let n = limited.read_until(b'\n', &mut line).await?;
  if n == 0 {
    return Ok(None);
  }
  if !line.ends_with(b"\n") {
    if line.len() >= MAX_LINE {
      return Err(Error::parse("line exceeds maximum length"));
    }
    return Err(Error::parse("connection closed mid-line"));
  }
  line.pop();
  if line.ends_with(b"\r") {
    line.pop();
  }
  Ok(Some(line))
}

fn parse_version(raw: &[u8]) -> Result<Version> {
  match raw {
    b"HTTP/0.9" => Ok(Version::HTTP_09),
    b"HTTP/1.0" => Ok(Version::HTTP_10),
    b"HTTP/1.1" => Ok(Version::HTTP_11),
    _ => Err(Error::parse(format!(
      "unsupported http version: {}",
      raw.escape_ascii()
    ))),
  }
}

pub(crate) fn parse_request_line(line: &[u8]) -> Result<RequestLine> {
  let mut parts = line.split(|b| b == &b' ').filter(|p| !p.is_empty());
  let (Some(method), Some(target), Some(version), None) =
    (parts.next(), parts.next(), parts.next(), parts.next())
  else {
    return Err(Error::parse(format!(
      "invalid request line: {}",
      line.escape_ascii()
    )));
  };
  let method = Method::from_bytes(method).map_err(|e| Error::parse(e.to_string()))?;
  let target = std::str::from_utf8(target)
    .map_err(|_| Error::parse("request target is not valid utf-8"))?
    .to_string();
  Ok(RequestLine {
    method,
    target,
    version: parse_version(version)?,
  })
}

pub(crate) fn parse_status_line(line: &[u8]) -> Result<(Version, StatusCode)> {
  let mut parts = line.splitn(3, |b| b == &b' ');
  let version = parts
    .next()
    .filter(|v| !v.is_empty())
    .ok_or_else(|| Error::parse("invalid http version and status_code data"))?;
  let status = parts
    .next()
    .filter(|s| s.len() == 3)
    .ok_or_else(|| Error::parse("invalid http version and status_code data"))?;
  let status = StatusCode::from_bytes(status).map_err(|e| Error::parse(e.to_string()))?;
  Ok((parse_version(version)?, status))
}

/// Split a `Name: value` line.
pub(crate) fn parse_header_line(buffer: &[u8]) -> Result<(HeaderName, HeaderValue)> {
  let buffer = buffer.strip_suffix(CR_LF).unwrap_or(buffer);
  let colon = buffer
    .iter()
    .position(|b| b == &b':')
    .ok_or_else(|| Error::parse(format!("header without colon: {}", buffer.escape_ascii())))?;
  let (name, value) = buffer.split_at(colon);
  let value = value[1..].trim_ascii();
  let name = HeaderName::from_bytes(name).map_err(|e| Error::parse(e.to_string()))?;
  let value = HeaderValue::from_bytes(value).map_err(|e| Error::parse(e.to_string()))?;
  Ok((name, value))
}

/// Read header lines up to and including the blank line.
pub(crate) async fn read_headers<R>(reader: &mut R) -> Result<HeaderMap>
where
  R: AsyncBufRead + Unpin,
{
  let mut headers = HeaderMap::new();
  let mut total = 0usize;
  loop {
    let line = read_line(reader)
      .await?
      .ok_or_else(|| Error::parse("connection closed inside header block"))?;
    if line.is_empty() {
      return Ok(headers);
    }
    total += line.len();
    if total > MAX_HEADERS {
      return Err(Error::parse("header block too large"));
    }
    let (name, value) = parse_header_line(&line)?;
    headers.append(name, value);
  }
}

fn content_length(headers: &HeaderMap) -> Result<Option<usize>> {
  let mut length = None;
  for value in headers.get_all(http::header::CONTENT_LENGTH) {
    let parsed: usize = value
      .to_str()
      .ok()
      .and_then(|v| v.trim().parse().ok())
      .ok_or_else(|| Error::parse("invalid content-length"))?;
    if length.is_some_and(|l| l != parsed) {
      return Err(Error::parse("conflicting content-length headers"));
    }
    length = Some(parsed);
  }
  Ok(length)
}

fn is_chunked(headers: &HeaderMap) -> bool {
  headers
    .get_all(http::header::TRANSFER_ENCODING)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .last()
    .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
}

/// Request bodies are never delimited by EOF.
pub(crate) fn request_framing(headers: &HeaderMap) -> Result<BodyFraming> {
  if headers.contains_key(http::header::TRANSFER_ENCODING) {
    if is_chunked(headers) {
      return Ok(BodyFraming::Chunked);
    }
    return Err(Error::parse("unsupported transfer-encoding on request"));
  }
  Ok(match content_length(headers)? {
    Some(0) | None => BodyFraming::Empty,
    Some(n) => BodyFraming::Length(n),
  })
}

pub(crate) fn response_framing(
  method: &Method,
  status: StatusCode,
  headers: &HeaderMap,
) -> Result<BodyFraming> {
  if method == Method::HEAD
    || status.is_informational()
    || status == StatusCode::NO_CONTENT
    || status == StatusCode::NOT_MODIFIED
  {
    return Ok(BodyFraming::Empty);
  }
  if headers.contains_key(http::header::TRANSFER_ENCODING) {
    return Ok(if is_chunked(headers) {
      BodyFraming::Chunked
    } else {
      BodyFraming::UntilEof
    });
  }
  Ok(match content_length(headers)? {
    Some(0) => BodyFraming::Empty,
    Some(n) => BodyFraming::Length(n),
    None => BodyFraming::UntilEof,
  })
}

pub(crate) async fn read_body<R>(reader: &mut R, framing: BodyFraming) -> Result<Bytes>
where
  R: AsyncBufRead + Unpin,
{
  match framing {
    BodyFraming::Empty => Ok(Bytes::new()),
    BodyFraming::Length(n) => {
      if n > MAX_BODY {
        return Err(Error::parse(format!("body of {} bytes exceeds limit", n)));
      }
      let mut body = vec![0; n];
      reader
        .read_exact(&mut body)
        .await
        .map_err(|e| Error::parse(format!("body truncated: {}", e)))?;
      Ok(Bytes::from(body))
    }
    BodyFraming::Chunked => read_chunked_body(reader).await,
    BodyFraming::UntilEof => {
      let mut body = Vec::new();
      (&mut *reader)
        .take(MAX_BODY as u64 + 1)
        .read_to_end(&mut body)
        .await?;
      if body.len() > MAX_BODY {
        return Err(Error::parse("body exceeds limit"));
      }
      Ok(Bytes::from(body))
    }
  }
}

async fn read_chunked_body<R>(reader: &mut R) -> Result<Bytes>
where
  R: AsyncBufRead + Unpin,
{
  let mut body: Vec<u8> = Vec::new();
  loop {
    let line = read_line(reader)
      .await?
      .ok_or_else(|| Error::parse("connection closed inside chunked body"))?;
    let size = line
      .split(|b| b == &b';')
      .next()
      .and_then(|s| std::str::from_utf8(s).ok())
      .map(str::trim)
      .and_then(|s| usize::from_str_radix(s, 16).ok())
      .ok_or_else(|| Error::parse(format!("invalid chunk size: {}", line.escape_ascii())))?;
    if size == 0 {
      // trailers
      while let Some(trailer) = read_line(reader).await? {
        if trailer.is_empty() {
          break;
        }
      }
      return Ok(Bytes::from(body));
    }
    if body.len() + size > MAX_BODY {
      return Err(Error::parse("chunked body exceeds limit"));
    }
    let start = body.len();
    body.resize(start + size, 0);
    reader.read_exact(&mut body[start..]).await?;
    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf).await?;
    if crlf != *b"\r\n" {
      return Err(Error::parse("chunk not terminated by CRLF"));
    }
  }
}

/// Whether the connection may carry another message after this one.
pub(crate) fn keep_alive(version: Version, headers: &HeaderMap) -> bool {
  let tokens = |value: &str| {
    headers
      .get_all(http::header::CONNECTION)
      .iter()
      .chain(headers.get_all("proxy-connection"))
      .filter_map(|v| v.to_str().ok())
      .flat_map(|v| v.split(','))
      .any(|t| t.trim().eq_ignore_ascii_case(value))
  };
  match version {
    Version::HTTP_11 => !tokens("close"),
    Version::HTTP_10 => tokens("keep-alive"),
    _ => false,
  }
}

/// Drop headers that describe a single hop rather than the message.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
  let named: Vec<HeaderName> = headers
    .get_all(http::header::CONNECTION)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .filter_map(|t| HeaderName::from_bytes(t.trim().as_bytes()).ok())
    .collect();
  for name in named {
    headers.remove(name);
  }
  for name in [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
  ] {
    headers.remove(name);
  }
}

/// Split `host:port`, `[v6]:port` or a bare host.
pub(crate) fn split_host_port(authority: &str, default_port: u16) -> Result<(String, u16)> {
  let authority = authority.trim();
  if authority.is_empty() {
    return Err(Error::parse("empty authority"));
  }
  let invalid = || Error::parse(format!("invalid authority: {}", authority));
  if let Some(rest) = authority.strip_prefix('[') {
    let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
    let port = match tail.strip_prefix(':') {
      Some(port) => port.parse().map_err(|_| invalid())?,
      None if tail.is_empty() => default_port,
      None => return Err(invalid()),
    };
    return Ok((host.to_string(), port));
  }
  match authority.rsplit_once(':') {
    Some((host, port)) if !host.contains(':') => {
      if host.is_empty() {
        return Err(invalid());
      }
      Ok((host.to_string(), port.parse().map_err(|_| invalid())?))
    }
    Some(_) => Ok((authority.to_string(), default_port)),
    None => Ok((authority.to_string(), default_port)),
  }
}

/// A minimal response the proxy writes itself: status, reason and a text body.
pub(crate) fn simple_response(status: StatusCode, message: &str) -> Bytes {
  let mut raw = Vec::with_capacity(128 + message.len());
  raw.extend(b"HTTP/1.1");
  raw.extend(SPACE);
  raw.extend(status.as_str().as_bytes());
  raw.extend(SPACE);
  raw.extend(status.canonical_reason().unwrap_or("Unknown").as_bytes());
  raw.extend(CR_LF);
  raw.extend(b"content-type: text/plain; charset=utf-8\r\n");
  raw.extend(format!("content-length: {}\r\n", message.len()).as_bytes());
  raw.extend(b"connection: close\r\n");
  raw.extend(CR_LF);
  raw.extend(message.as_bytes());
  Bytes::from(raw)
}
