//! Cluster bomb attack against a throwaway local login endpoint
//!
//! To run:
//! ```bash
//! cargo run --example cluster_bomb
//! ```

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use volley::intruder::{AttackEvent, AttackPosition, PayloadSet, RequestTemplate};
use volley::{AttackStrategy, ExchangeLog, Intruder, IntruderConfig, MemoryStore};

/// Answers 200 only for admin:letmein, 401 otherwise.
async fn login_server(listener: TcpListener) {
  loop {
    let Ok((mut stream, _)) = listener.accept().await else {
      return;
    };
    tokio::spawn(async move {
      let mut buf = vec![0u8; 4096];
      let n = stream.read(&mut buf).await.unwrap_or(0);
      let request = String::from_utf8_lossy(&buf[..n]);
      let status = if request.contains("user=admin&pass=letmein") {
        "200 OK"
      } else {
        "401 Unauthorized"
      };
      let response = format!("HTTP/1.1 {}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n", status);
      let _ = stream.write_all(response.as_bytes()).await;
    });
  }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let listener = TcpListener::bind("127.0.0.1:0").await?;
  let addr = listener.local_addr()?;
  tokio::spawn(login_server(listener));

  let raw = format!(
    "POST /login HTTP/1.1\r\nHost: {}\r\nContent-Type: application/x-www-form-urlencoded\r\n\r\nuser={{user}}&pass={{pass}}",
    addr
  );
  let template = RequestTemplate::from_raw(&raw, "http")?;
  let positions = vec![
    AttackPosition::new("user", PayloadSet::new(["guest", "admin", "root"])),
    AttackPosition::new("pass", PayloadSet::new(["password", "letmein", "123456"])),
  ];

  let store = Arc::new(MemoryStore::new());
  let log = Arc::new(ExchangeLog::new(store.clone()));
  let intruder = Intruder::new(IntruderConfig {
    concurrency: 4,
    min_interval_ms: 20,
    ..IntruderConfig::default()
  })?
  .log(log);

  let mut run = intruder.fuzz(template, positions, AttackStrategy::ClusterBomb)?;
  println!("sending {} requests", run.planned());
  while let Some(event) = run.next().await {
    match event {
      AttackEvent::Result(result) => {
        if let Some(response) = result.response() {
          if response.status_code().is_success() {
            println!("hit: {:?}", result.payloads());
          }
        }
      }
      AttackEvent::Finished { dispatched } => println!("finished after {} requests", dispatched),
      AttackEvent::Cancelled { dispatched } => println!("cancelled after {} requests", dispatched),
    }
  }
  println!("{} exchanges recorded", store.len().await);
  Ok(())
}
