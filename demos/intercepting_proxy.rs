//! Intercepting proxy with a traffic counter hook
//!
//! Install `.volley/ca_cert.pem` in the browser, point it at the proxy and
//! browse. Captured exchanges are logged as they arrive.
//!
//! To run:
//! ```bash
//! cargo run --example intercepting_proxy -- volley.toml
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use volley::hooks::EXCHANGE_CAPTURED;
use volley::{CertificateManager, Config, Event, ExchangeContent, HookRegistry, ProxyServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  let config = match std::env::args().nth(1) {
    Some(path) => Config::load(path)?,
    None => {
      let mut config = Config::default();
      config.apply_env()?;
      config.validate()?;
      config
    }
  };
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
    )
    .init();

  let certificates = CertificateManager::load_or_generate(&config.ca_storage_path).await?;
  if let Some(path) = certificates.authority().ca_cert_path() {
    println!("CA certificate: {}", path.display());
  }

  let captured = Arc::new(AtomicUsize::new(0));
  let counter = captured.clone();
  let hooks = HookRegistry::builder()
    .with_logging()
    .on(EXCHANGE_CAPTURED, move |event: &Event<'_>| {
      if let Event::ExchangeCaptured(exchange) = event {
        counter.fetch_add(1, Ordering::Relaxed);
        if let ExchangeContent::Http {
          request,
          response: Some(response),
        } = exchange.content()
        {
          if response.status_code().is_server_error() {
            println!("server error from {}", request.uri());
          }
        }
      }
    })
    .build();

  let server = ProxyServer::builder()
    .config(config.proxy.clone())
    .certificates(certificates)
    .hooks(hooks)
    .build()?;
  println!("proxy listening on {}", config.proxy.bind_address());
  server.run(&config.proxy.bind_address()).await?;
  println!("captured {} exchanges", captured.load(Ordering::Relaxed));
  Ok(())
}
