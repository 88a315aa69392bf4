//! Blind byte relay for tunnels that are not intercepted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::Instant;

const BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved in each direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
  /// Client to origin.
  pub bytes_from_client: u64,
  /// Origin to client.
  pub bytes_from_origin: u64,
}

/// Last time either direction moved data, as millis since the relay started.
struct Activity {
  start: Instant,
  last: AtomicU64,
}

impl Activity {
  fn touch(&self) {
    self
      .last
      .store(self.start.elapsed().as_millis() as u64, Ordering::Relaxed);
  }

  fn idle_for(&self) -> Duration {
    let last = Duration::from_millis(self.last.load(Ordering::Relaxed));
    self.start.elapsed().saturating_sub(last)
  }
}

/// Copy bytes both ways until either side closes, errors or the tunnel idles.
///
/// Each direction runs on its own task. The first one to finish signals
/// the other through a shared watch channel, so one EOF tears down both.
pub async fn relay<C, O>(client: C, origin: O, idle_timeout: Duration) -> TunnelStats
where
  C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
  O: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
  let (client_read, client_write) = tokio::io::split(client);
  let (origin_read, origin_write) = tokio::io::split(origin);
  let (stop_tx, stop_rx) = watch::channel(false);
  let stop_tx = Arc::new(stop_tx);
  let activity = Arc::new(Activity {
    start: Instant::now(),
    last: AtomicU64::new(0),
  });

  let upstream = tokio::spawn(pump(
    client_read,
    origin_write,
    stop_tx.clone(),
    stop_rx.clone(),
    activity.clone(),
    idle_timeout,
  ));
  let downstream = tokio::spawn(pump(
    origin_read,
    client_write,
    stop_tx,
    stop_rx,
    activity,
    idle_timeout,
  ));
  let (up, down) = tokio::join!(upstream, downstream);
  TunnelStats {
    bytes_from_client: up.unwrap_or(0),
    bytes_from_origin: down.unwrap_or(0),
  }
}

async fn pump<R, W>(
  mut reader: R,
  mut writer: W,
  stop_tx: Arc<watch::Sender<bool>>,
  mut stop_rx: watch::Receiver<bool>,
  activity: Arc<Activity>,
  idle_timeout: Duration,
) -> u64
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut buffer = vec![0u8; BUFFER_SIZE];
  let mut total = 0u64;
  loop {
    tokio::select! {
      _ = async { let _ = stop_rx.wait_for(|stop| *stop).await; } => break,
      read = tokio::time::timeout(idle_timeout, reader.read(&mut buffer)) => match read {
        Err(_) => {
          if activity.idle_for() >= idle_timeout {
            tracing::debug!("[proxy] tunnel idle for {:?}, closing", idle_timeout);
            break;
          }
        }
        Ok(Ok(0)) | Ok(Err(_)) => break,
        Ok(Ok(n)) => {
          if writer.write_all(&buffer[..n]).await.is_err() {
            break;
          }
          activity.touch();
          total += n as u64;
        }
      },
    }
  }
  let _ = writer.shutdown().await;
  stop_tx.send_replace(true);
  total
}
