#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_rustls::rustls::{self, ServerConfig};
use tokio_rustls::TlsAcceptor;
use volley::{CertificateManager, MemoryStore};

/// A local origin answering every request with its target as the body.
pub struct Origin {
  pub addr: SocketAddr,
  hits: Arc<AtomicUsize>,
}

impl Origin {
  pub fn hits(&self) -> usize {
    self.hits.load(Ordering::SeqCst)
  }
}

async fn answer<S>(stream: S, hits: Arc<AtomicUsize>)
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let mut reader = BufReader::new(stream);
  let mut line = String::new();
  if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
    return;
  }
  let target = line.split_whitespace().nth(1).unwrap_or("").to_string();
  let mut length = 0usize;
  loop {
    let mut header = String::new();
    if reader.read_line(&mut header).await.unwrap_or(0) == 0 {
      return;
    }
    let header = header.trim_end();
    if header.is_empty() {
      break;
    }
    if let Some((name, value)) = header.split_once(':') {
      if name.eq_ignore_ascii_case("content-length") {
        length = value.trim().parse().unwrap_or(0);
      }
    }
  }
  let mut body = vec![0u8; length];
  if reader.read_exact(&mut body).await.is_err() {
    return;
  }
  hits.fetch_add(1, Ordering::SeqCst);
  let response = format!(
    "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
    target.len(),
    target
  );
  let stream = reader.get_mut();
  let _ = stream.write_all(response.as_bytes()).await;
  let _ = stream.shutdown().await;
}

/// Plain HTTP origin.
pub async fn http_origin() -> Origin {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let hits = Arc::new(AtomicUsize::new(0));
  let counter = hits.clone();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      tokio::spawn(answer(stream, counter.clone()));
    }
  });
  Origin { addr, hits }
}

/// HTTPS origin presenting a leaf for `localhost` from its own CA.
pub async fn https_origin() -> Origin {
  let ca = CertificateManager::ephemeral().unwrap();
  let leaf = ca.get_leaf_certificate("localhost").await.unwrap();
  let provider = Arc::new(rustls::crypto::ring::default_provider());
  let config = ServerConfig::builder_with_provider(provider)
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(leaf.chain(), leaf.private_key())
    .unwrap();
  let acceptor = TlsAcceptor::from(Arc::new(config));
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let hits = Arc::new(AtomicUsize::new(0));
  let counter = hits.clone();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      let acceptor = acceptor.clone();
      let counter = counter.clone();
      tokio::spawn(async move {
        if let Ok(tls) = acceptor.accept(stream).await {
          answer(tls, counter).await;
        }
      });
    }
  });
  Origin { addr, hits }
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  drop(listener);
  addr
}

/// Poll until the store holds `n` exchanges.
pub async fn wait_for_len(store: &MemoryStore, n: usize) {
  let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
  while store.len().await < n {
    assert!(
      tokio::time::Instant::now() < deadline,
      "store has {} exchanges, expected {}",
      store.len().await,
      n
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
  }
}

/// Read a response head up to the blank line.
pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
  let mut head = Vec::new();
  let mut byte = [0u8; 1];
  while !head.ends_with(b"\r\n\r\n") {
    if stream.read(&mut byte).await.unwrap() == 0 {
      break;
    }
    head.push(byte[0]);
  }
  String::from_utf8(head).unwrap()
}
