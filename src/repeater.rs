//! Manual replay of single requests and response comparison.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use http::HeaderMap;
use tokio::sync::RwLock;

use crate::client::Client;
use crate::errors::Result;
use crate::record::{ConnectionInfo, ExchangeContent};
use crate::redirect::Policy;
use crate::store::ExchangeLog;
use crate::{Request, Response};

const DEFAULT_HISTORY_LIMIT: usize = 1000;
const MAX_REDIRECTS: usize = 10;

/// Sends edited requests one at a time and keeps what came back.
///
/// Redirects are followed by default, up to ten hops. The history keeps the
/// most recent exchanges only, 1000 unless changed with
/// [`Repeater::history_limit`].
#[derive(Debug)]
pub struct Repeater {
  client: Client,
  following: Client,
  follow_redirects: bool,
  log: Option<Arc<ExchangeLog>>,
  history_limit: usize,
  history: RwLock<VecDeque<(Request, Response)>>,
}

impl Repeater {
  /// A repeater sending through `client`.
  pub fn new(client: Client) -> Self {
    let following = if client.redirect_policy().is_none() {
      client.with_redirect(Policy::limited(MAX_REDIRECTS))
    } else {
      client.clone()
    };
    Repeater {
      client: client.with_redirect(Policy::none()),
      following,
      follow_redirects: true,
      log: None,
      history_limit: DEFAULT_HISTORY_LIMIT,
      history: RwLock::new(VecDeque::new()),
    }
  }

  /// Whether [`Repeater::send`] follows redirects.
  pub fn follow_redirects(mut self, follow: bool) -> Self {
    self.follow_redirects = follow;
    self
  }

  /// Keep at most `limit` exchanges, dropping the oldest first.
  pub fn history_limit(mut self, limit: usize) -> Self {
    self.history_limit = limit.max(1);
    self
  }

  /// Also record every exchange into `log`.
  pub fn with_log(mut self, log: Arc<ExchangeLog>) -> Self {
    self.log = Some(log);
    self
  }

  /// Send `request` as is and remember the exchange.
  ///
  /// Failures are returned and leave no history entry.
  pub async fn send(&self, request: &Request) -> Result<Response> {
    self.send_with(request, self.follow_redirects).await
  }

  /// Like [`Repeater::send`], choosing whether redirects are followed for
  /// this request only. When they are, the final response is returned.
  pub async fn send_with(&self, request: &Request, follow_redirects: bool) -> Result<Response> {
    tracing::info!("[repeater] {} {}", request.method(), request.uri());
    let client = if follow_redirects {
      &self.following
    } else {
      &self.client
    };
    let response = client.execute(request).await?;
    if let Some(log) = &self.log {
      let connection = ConnectionInfo {
        client_addr: None,
        target_host: request.host().unwrap_or_default(),
        target_port: request.port(),
        tls_intercepted: false,
        excluded: false,
      };
      let content = ExchangeContent::Http {
        request: request.clone(),
        response: Some(response.clone()),
      };
      if let Err(error) = log.record(connection, content).await {
        tracing::warn!("[repeater] failed to record exchange: {}", error);
      }
    }
    let mut history = self.history.write().await;
    while history.len() >= self.history_limit {
      history.pop_front();
    }
    history.push_back((request.clone(), response.clone()));
    Ok(response)
  }

  /// The kept exchanges, oldest first.
  pub async fn history(&self) -> Vec<(Request, Response)> {
    self.history.read().await.iter().cloned().collect()
  }

  /// Forget the history.
  pub async fn clear(&self) {
    self.history.write().await.clear();
  }

  /// Compare two responses, `left` usually being the baseline.
  pub fn compare(left: &Response, right: &Response) -> ResponseDiff {
    ResponseDiff {
      statuses: (left.status_code(), right.status_code()),
      header_changes: header_changes(left.headers(), right.headers()),
      body_lengths: (left.body().len(), right.body().len()),
      body_similarity: similarity(left.body(), right.body()),
    }
  }
}

/// A header whose values differ between two responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderChange {
  /// Header name, lowercase.
  pub name: String,
  /// Values on the left, joined with `, `; `None` when absent.
  pub left: Option<String>,
  /// Values on the right, joined with `, `; `None` when absent.
  pub right: Option<String>,
}

/// How two responses differ.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseDiff {
  /// Left and right status codes.
  pub statuses: (http::StatusCode, http::StatusCode),
  /// Differing headers, sorted by name.
  pub header_changes: Vec<HeaderChange>,
  /// Left and right body lengths.
  pub body_lengths: (usize, usize),
  /// Share of byte positions holding the same byte, relative to the longer
  /// body. Two empty bodies are identical.
  pub body_similarity: f64,
}

impl ResponseDiff {
  /// Whether the status codes differ.
  pub fn status_changed(&self) -> bool {
    self.statuses.0 != self.statuses.1
  }

  /// Whether the body lengths differ.
  pub fn length_changed(&self) -> bool {
    self.body_lengths.0 != self.body_lengths.1
  }

  /// Whether nothing compared differs.
  pub fn is_identical(&self) -> bool {
    !self.status_changed() && self.header_changes.is_empty() && self.body_similarity >= 1.0
  }
}

fn joined(headers: &HeaderMap, name: &str) -> Option<String> {
  let values: Vec<String> = headers
    .get_all(name)
    .iter()
    .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
    .collect();
  (!values.is_empty()).then(|| values.join(", "))
}

fn header_changes(left: &HeaderMap, right: &HeaderMap) -> Vec<HeaderChange> {
  let names: BTreeSet<&str> = left
    .keys()
    .chain(right.keys())
    .map(|name| name.as_str())
    .collect();
  names
    .into_iter()
    .filter_map(|name| {
      let (l, r) = (joined(left, name), joined(right, name));
      (l != r).then(|| HeaderChange {
        name: name.to_string(),
        left: l,
        right: r,
      })
    })
    .collect()
}

fn similarity(left: &[u8], right: &[u8]) -> f64 {
  match (left.is_empty(), right.is_empty()) {
    (true, true) => return 1.0,
    (true, false) | (false, true) => return 0.0,
    _ => {}
  }
  let same = left.iter().zip(right).filter(|(a, b)| a == b).count();
  same as f64 / left.len().max(right.len()) as f64
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;

  fn response(status: u16, headers: &[(&str, &str)], body: &'static str) -> Response {
    let mut builder = http::Response::builder().status(status);
    for (name, value) in headers {
      builder = builder.header(*name, *value);
    }
    builder.body(body).unwrap().into()
  }

  #[test]
  fn identical_responses() {
    let a = response(200, &[("x-a", "1")], "hello");
    let diff = Repeater::compare(&a, &a.clone());
    assert!(diff.is_identical());
    assert_eq!(diff.body_similarity, 1.0);
  }

  #[test]
  fn differences_are_reported() {
    let a = response(200, &[("x-a", "1"), ("server", "one")], "abcd");
    let b = response(403, &[("x-a", "2"), ("x-b", "new"), ("server", "one")], "abxdef");
    let diff = Repeater::compare(&a, &b);
    assert!(diff.status_changed());
    assert!(diff.length_changed());
    assert_eq!(diff.body_lengths, (4, 6));
    assert_eq!(diff.body_similarity, 3.0 / 6.0);
    assert_eq!(
      diff.header_changes,
      vec![
        HeaderChange {
          name: "x-a".to_string(),
          left: Some("1".to_string()),
          right: Some("2".to_string()),
        },
        HeaderChange {
          name: "x-b".to_string(),
          left: None,
          right: Some("new".to_string()),
        },
      ]
    );
  }

  #[test]
  fn empty_bodies() {
    assert_eq!(similarity(b"", b""), 1.0);
    assert_eq!(similarity(b"", b"a"), 0.0);
  }

  /// Serves `/` with a redirect to `/final` and `/final` with a 200.
  async fn redirecting_origin(connections: usize) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      for _ in 0..connections {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        let n = stream.read(&mut buf).await.unwrap();
        let reply: &[u8] = if buf[..n].starts_with(b"GET /final ") {
          b"HTTP/1.1 200 OK\r\ncontent-length: 4\r\n\r\ndone"
        } else {
          b"HTTP/1.1 302 Found\r\nlocation: /final\r\ncontent-length: 0\r\n\r\n"
        };
        stream.write_all(reply).await.unwrap();
      }
    });
    addr
  }

  #[tokio::test]
  async fn redirects_followed_unless_disabled() {
    let addr = redirecting_origin(3).await;
    let request = Request::new(http::Method::GET, format!("http://{}/", addr).parse().unwrap());
    let repeater = Repeater::new(Client::builder().build().unwrap());
    let followed = repeater.send(&request).await.unwrap();
    assert_eq!(followed.status_code(), http::StatusCode::OK);
    assert_eq!(followed.text(), "done");
    let stopped = repeater.send_with(&request, false).await.unwrap();
    assert_eq!(stopped.status_code(), http::StatusCode::FOUND);
  }

  #[tokio::test]
  async fn follow_can_be_turned_off() {
    let addr = redirecting_origin(1).await;
    let request = Request::new(http::Method::GET, format!("http://{}/", addr).parse().unwrap());
    let repeater = Repeater::new(Client::builder().build().unwrap()).follow_redirects(false);
    let response = repeater.send(&request).await.unwrap();
    assert_eq!(response.status_code(), http::StatusCode::FOUND);
  }

  #[tokio::test]
  async fn history_drops_oldest_past_limit() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      for _ in 0..3 {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        let _ = stream.read(&mut buf).await.unwrap();
        stream
          .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
          .await
          .unwrap();
      }
    });
    let repeater = Repeater::new(Client::builder().build().unwrap()).history_limit(2);
    for path in ["/1", "/2", "/3"] {
      let request = Request::new(
        http::Method::GET,
        format!("http://{}{}", addr, path).parse().unwrap(),
      );
      repeater.send(&request).await.unwrap();
    }
    let paths: Vec<String> = repeater
      .history()
      .await
      .iter()
      .map(|(request, _)| request.uri().path().to_string())
      .collect();
    assert_eq!(paths, ["/2", "/3"]);
  }

  #[tokio::test]
  async fn send_keeps_history() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      for _ in 0..2 {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        let _ = stream.read(&mut buf).await.unwrap();
        stream
          .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
          .await
          .unwrap();
      }
    });
    let repeater = Repeater::new(Client::builder().build().unwrap());
    let request = Request::new(
      http::Method::GET,
      format!("http://{}/a", addr).parse().unwrap(),
    );
    let first = repeater.send(&request).await.unwrap();
    let second = repeater.send(&request.with_uri(format!("http://{}/b", addr).parse().unwrap())).await.unwrap();
    assert!(Repeater::compare(&first, &second).header_changes.iter().all(|c| c.name != "content-length"));
    let history = repeater.history().await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].0.uri().path(), "/b");
    repeater.clear().await;
    assert!(repeater.history().await.is_empty());
  }
}
