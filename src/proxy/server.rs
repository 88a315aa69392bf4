//! Listener, accept loop and graceful shutdown.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use crate::ca::CertificateManager;
use crate::client::Client;
use crate::config::ProxyConfig;
use crate::errors::{Error, Result};
use crate::framing;
use crate::hooks::HookRegistry;
use crate::proxy::exclude::ExcludeList;
use crate::proxy::handler::{ConnectionHandler, ProxyContext};
use crate::store::{ExchangeLog, MemoryStore, TrafficStore};

/// Intercepting HTTP(S) proxy.
///
/// ```no_run
/// # async fn run() -> volley::Result<()> {
/// let certificates = volley::CertificateManager::load_or_generate(".volley").await?;
/// let server = volley::ProxyServer::builder()
///   .certificates(certificates)
///   .build()?;
/// let handle = server.start("127.0.0.1:8080").await?;
/// println!("listening on {}", handle.local_addr());
/// handle.stop(std::time::Duration::from_secs(5)).await?;
/// # Ok(())
/// # }
/// ```
pub struct ProxyServer {
  ctx: Arc<ProxyContext>,
}

impl std::fmt::Debug for ProxyServer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ProxyServer")
      .field("config", &self.ctx.config)
      .finish_non_exhaustive()
  }
}

impl ProxyServer {
  /// Start configuring a proxy.
  pub fn builder() -> ProxyServerBuilder {
    ProxyServerBuilder::default()
  }

  /// The proxy settings in use.
  pub fn config(&self) -> &ProxyConfig {
    &self.ctx.config
  }

  /// Issues the forged leaf certificates.
  pub fn certificates(&self) -> &Arc<CertificateManager> {
    &self.ctx.certificates
  }

  /// The traffic history this proxy records into.
  pub fn log(&self) -> &Arc<ExchangeLog> {
    &self.ctx.log
  }

  /// The CA certificate clients have to trust, PEM encoded.
  pub fn ca_cert_pem(&self) -> &str {
    self.ctx.certificates.ca_cert_pem()
  }

  /// Where the CA certificate was persisted, if it was.
  pub fn ca_cert_path(&self) -> Option<PathBuf> {
    self.ctx.certificates.authority().ca_cert_path()
  }

  /// Bind the configured `host:port` and start serving.
  pub async fn start_configured(&self) -> Result<ProxyHandle> {
    let address = self.ctx.config.bind_address();
    self.start(&address).await
  }

  /// Bind `address` and start serving in the background.
  pub async fn start(&self, address: &str) -> Result<ProxyHandle> {
    let listener = TcpListener::bind(address).await?;
    let local_addr = listener.local_addr()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let limit = Arc::new(Semaphore::new(self.ctx.config.max_connections.max(1)));
    tracing::info!(
      "[proxy] listening on {} (tls interception {})",
      local_addr,
      if self.ctx.config.tls_intercept {
        "on"
      } else {
        "off"
      }
    );
    let accept_task = tokio::spawn(accept_loop(listener, self.ctx.clone(), shutdown_rx, limit));
    Ok(ProxyHandle {
      local_addr,
      shutdown_tx,
      accept_task,
    })
  }

  /// Serve on `address` until the process receives ctrl-c.
  pub async fn run(&self, address: &str) -> Result<()> {
    let handle = self.start(address).await?;
    tokio::signal::ctrl_c().await?;
    tracing::info!("[proxy] interrupt received, shutting down");
    handle.stop(self.ctx.config.shutdown_grace()).await
  }
}

async fn accept_loop(
  listener: TcpListener,
  ctx: Arc<ProxyContext>,
  mut shutdown: watch::Receiver<bool>,
  limit: Arc<Semaphore>,
) -> JoinSet<()> {
  let mut connections = JoinSet::new();
  loop {
    tokio::select! {
      _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
      accepted = listener.accept() => match accepted {
        Ok((stream, peer)) => {
          while connections.try_join_next().is_some() {}
          match limit.clone().try_acquire_owned() {
            Ok(permit) => {
              let handler = ConnectionHandler::new(ctx.clone(), peer, shutdown.clone());
              connections.spawn(async move {
                handler.run(stream).await;
                drop(permit);
              });
            }
            Err(_) => {
              tracing::warn!("[proxy] connection limit reached, refusing {}", peer);
              tokio::spawn(refuse(stream));
            }
          }
        }
        Err(error) => {
          tracing::error!("[proxy] accept failed: {}", error);
          tokio::time::sleep(Duration::from_millis(50)).await;
        }
      },
    }
  }
  tracing::debug!("[proxy] accept loop stopped, {} connections open", connections.len());
  connections
}

async fn refuse(mut stream: TcpStream) {
  let response = framing::simple_response(
    http::StatusCode::SERVICE_UNAVAILABLE,
    "too many connections",
  );
  let _ = stream.write_all(&response).await;
  let _ = stream.shutdown().await;
}

/// A running proxy.
///
/// Dropping the handle stops accepting and aborts open connections; use
/// [`ProxyHandle::stop`] to let them finish.
#[derive(Debug)]
pub struct ProxyHandle {
  local_addr: SocketAddr,
  shutdown_tx: watch::Sender<bool>,
  accept_task: JoinHandle<JoinSet<()>>,
}

impl ProxyHandle {
  /// The bound address, useful when binding port 0.
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// Stop accepting, give open connections `grace` to finish, then abort
  /// whatever is left.
  pub async fn stop(self, grace: Duration) -> Result<()> {
    self.shutdown_tx.send_replace(true);
    let mut connections = self
      .accept_task
      .await
      .map_err(|e| Error::other(format!("accept loop failed: {}", e)))?;
    let drained = tokio::time::timeout(grace, async {
      while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
      tracing::warn!(
        "[proxy] {} connections still open after {:?}, aborting",
        connections.len(),
        grace
      );
      connections.abort_all();
      while connections.join_next().await.is_some() {}
    }
    tracing::info!("[proxy] stopped");
    Ok(())
  }
}

/// Configures a [`ProxyServer`].
#[derive(Default)]
pub struct ProxyServerBuilder {
  config: Option<ProxyConfig>,
  certificates: Option<Arc<CertificateManager>>,
  store: Option<Arc<dyn TrafficStore>>,
  log: Option<Arc<ExchangeLog>>,
  hooks: Option<Arc<HookRegistry>>,
  client: Option<Client>,
}

impl ProxyServerBuilder {
  /// Proxy settings; defaults to [`ProxyConfig::default`].
  pub fn config(mut self, config: ProxyConfig) -> Self {
    self.config = Some(config);
    self
  }

  /// Certificate manager used to forge leaf certificates. Required.
  pub fn certificates(mut self, certificates: impl Into<Arc<CertificateManager>>) -> Self {
    self.certificates = Some(certificates.into());
    self
  }

  /// Store to record into. Defaults to a fresh [`MemoryStore`].
  pub fn store(mut self, store: Arc<dyn TrafficStore>) -> Self {
    self.store = Some(store);
    self
  }

  /// Share an existing log, for example with an intruder or repeater.
  /// Takes precedence over [`ProxyServerBuilder::store`].
  pub fn log(mut self, log: Arc<ExchangeLog>) -> Self {
    self.log = Some(log);
    self
  }

  /// Hooks fired for captured exchanges and connection errors.
  pub fn hooks(mut self, hooks: impl Into<Arc<HookRegistry>>) -> Self {
    self.hooks = Some(hooks.into());
    self
  }

  /// Client used for upstream requests. Defaults to one honoring the
  /// upstream timeout and verification settings.
  pub fn client(mut self, client: Client) -> Self {
    self.client = Some(client);
    self
  }

  /// Assemble the server.
  pub fn build(self) -> Result<ProxyServer> {
    let config = self.config.unwrap_or_default();
    let certificates = self
      .certificates
      .ok_or_else(|| Error::config("a certificate manager is required"))?;
    let hooks = self.hooks.unwrap_or_default();
    let log = match self.log {
      Some(log) => log,
      None => {
        let store = self
          .store
          .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn TrafficStore>);
        Arc::new(ExchangeLog::with_hooks(store, hooks.clone()))
      }
    };
    let client = match self.client {
      Some(client) => client,
      None => Client::builder()
        .timeout(config.upstream_timeout())
        .danger_accept_invalid_certs(!config.verify_upstream_certs)
        .build()?,
    };
    let excludes = ExcludeList::new(&config.exclude_domains);
    Ok(ProxyServer {
      ctx: Arc::new(ProxyContext {
        config,
        certificates,
        log,
        hooks,
        client,
        excludes,
      }),
    })
  }
}
