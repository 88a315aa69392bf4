//! File-backed configuration for the proxy and the attack engine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Listener and interception settings.
  pub proxy: ProxyConfig,
  /// Attack engine settings.
  pub intruder: IntruderConfig,
  /// Directory holding `ca_cert.pem` and `ca_key.pem`.
  pub ca_storage_path: PathBuf,
  /// `tracing` filter directive used by front-ends.
  pub log_level: String,
}

impl Default for Config {
  fn default() -> Self {
    Config {
      proxy: ProxyConfig::default(),
      intruder: IntruderConfig::default(),
      ca_storage_path: PathBuf::from(".volley"),
      log_level: "info".to_string(),
    }
  }
}

/// Proxy listener and interception settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
  /// Listen host.
  pub host: String,
  /// Listen port; 0 picks an ephemeral port.
  pub port: u16,
  /// Terminate TLS on CONNECT tunnels. When off every tunnel is blind.
  pub tls_intercept: bool,
  /// Hosts tunnelled without interception.
  pub exclude_domains: Vec<String>,
  /// Seconds a connection may sit without traffic.
  pub idle_timeout_secs: u64,
  /// Concurrent connections served before new ones are shed with 503.
  pub max_connections: usize,
  /// Seconds `stop` waits for in-flight connections.
  pub shutdown_grace_secs: u64,
  /// Seconds allowed for one origin exchange.
  pub upstream_timeout_secs: u64,
  /// Verify origin certificates against the platform roots.
  pub verify_upstream_certs: bool,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    ProxyConfig {
      host: "127.0.0.1".to_string(),
      port: 8080,
      tls_intercept: true,
      exclude_domains: Vec::new(),
      idle_timeout_secs: 60,
      max_connections: 1000,
      shutdown_grace_secs: 5,
      upstream_timeout_secs: 30,
      verify_upstream_certs: true,
    }
  }
}

impl ProxyConfig {
  /// `host:port` to bind.
  pub fn bind_address(&self) -> String {
    if self.host.contains(':') && !self.host.starts_with('[') {
      format!("[{}]:{}", self.host, self.port)
    } else {
      format!("{}:{}", self.host, self.port)
    }
  }

  /// Idle timeout as a `Duration`.
  pub fn idle_timeout(&self) -> Duration {
    Duration::from_secs(self.idle_timeout_secs)
  }

  /// Shutdown grace as a `Duration`.
  pub fn shutdown_grace(&self) -> Duration {
    Duration::from_secs(self.shutdown_grace_secs)
  }

  /// Origin exchange deadline as a `Duration`.
  pub fn upstream_timeout(&self) -> Duration {
    Duration::from_secs(self.upstream_timeout_secs)
  }
}

/// Attack engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntruderConfig {
  /// Requests in flight at once.
  pub concurrency: usize,
  /// Minimum milliseconds between consecutive request starts.
  pub min_interval_ms: u64,
  /// Hard per-request deadline in seconds.
  pub request_timeout_secs: u64,
  /// Verify origin certificates.
  pub verify_certs: bool,
  /// Follow up to ten redirects per variant and report the final response.
  pub follow_redirects: bool,
}

impl Default for IntruderConfig {
  fn default() -> Self {
    IntruderConfig {
      concurrency: 10,
      min_interval_ms: 100,
      request_timeout_secs: 30,
      verify_certs: false,
      follow_redirects: true,
    }
  }
}

impl IntruderConfig {
  /// Minimum spacing between request starts.
  pub fn min_interval(&self) -> Duration {
    Duration::from_millis(self.min_interval_ms)
  }

  /// Per-request deadline.
  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigFormat {
  Toml,
  Json,
}

fn detect_format(path: &Path) -> Result<ConfigFormat> {
  let extension = path
    .extension()
    .and_then(|e| e.to_str())
    .ok_or_else(|| Error::config(format!("cannot determine format of {}", path.display())))?;
  match extension.to_ascii_lowercase().as_str() {
    "toml" => Ok(ConfigFormat::Toml),
    "json" => Ok(ConfigFormat::Json),
    other => Err(Error::config(format!("unsupported config format: {}", other))),
  }
}

impl Config {
  /// Read `path` (TOML or JSON by extension), apply `VOLLEY_*` overrides and validate.
  pub fn load(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)
      .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;
    let mut config = match format {
      ConfigFormat::Toml => Config::from_toml_str(&content)?,
      ConfigFormat::Json => Config::from_json_str(&content)?,
    };
    config.apply_env()?;
    config.validate()?;
    tracing::debug!("[config] loaded {}", path.display());
    Ok(config)
  }

  /// Parse TOML; missing keys take defaults.
  pub fn from_toml_str(content: &str) -> Result<Config> {
    Ok(toml::from_str(content)?)
  }

  /// Parse JSON; missing keys take defaults.
  pub fn from_json_str(content: &str) -> Result<Config> {
    Ok(serde_json::from_str(content)?)
  }

  /// Apply overrides from the process environment.
  ///
  /// Recognised: `VOLLEY_HOST`, `VOLLEY_PORT`, `VOLLEY_TLS_INTERCEPT`,
  /// `VOLLEY_EXCLUDE` (comma separated), `VOLLEY_CONCURRENCY`,
  /// `VOLLEY_MIN_INTERVAL_MS`, `VOLLEY_FOLLOW_REDIRECTS`, `VOLLEY_CA_DIR`,
  /// `VOLLEY_LOG`.
  pub fn apply_env(&mut self) -> Result<()> {
    self.apply_overrides(|key| std::env::var(key).ok())
  }

  pub(crate) fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
  where
    F: Fn(&str) -> Option<String>,
  {
    fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
      value
        .trim()
        .parse()
        .map_err(|_| Error::config(format!("invalid {}: {}", key, value)))
    }
    if let Some(host) = lookup("VOLLEY_HOST") {
      self.proxy.host = host;
    }
    if let Some(port) = lookup("VOLLEY_PORT") {
      self.proxy.port = parse("VOLLEY_PORT", &port)?;
    }
    if let Some(flag) = lookup("VOLLEY_TLS_INTERCEPT") {
      self.proxy.tls_intercept = parse("VOLLEY_TLS_INTERCEPT", &flag)?;
    }
    if let Some(excludes) = lookup("VOLLEY_EXCLUDE") {
      self.proxy.exclude_domains = excludes
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(String::from)
        .collect();
    }
    if let Some(concurrency) = lookup("VOLLEY_CONCURRENCY") {
      self.intruder.concurrency = parse("VOLLEY_CONCURRENCY", &concurrency)?;
    }
    if let Some(interval) = lookup("VOLLEY_MIN_INTERVAL_MS") {
      self.intruder.min_interval_ms = parse("VOLLEY_MIN_INTERVAL_MS", &interval)?;
    }
    if let Some(flag) = lookup("VOLLEY_FOLLOW_REDIRECTS") {
      self.intruder.follow_redirects = parse("VOLLEY_FOLLOW_REDIRECTS", &flag)?;
    }
    if let Some(dir) = lookup("VOLLEY_CA_DIR") {
      self.ca_storage_path = PathBuf::from(dir);
    }
    if let Some(level) = lookup("VOLLEY_LOG") {
      self.log_level = level;
    }
    Ok(())
  }

  /// Reject settings the engines cannot run with.
  pub fn validate(&self) -> Result<()> {
    if self.proxy.host.trim().is_empty() {
      return Err(Error::config("proxy.host must not be empty"));
    }
    if self.proxy.max_connections == 0 {
      return Err(Error::config("proxy.max_connections must be at least 1"));
    }
    if self.proxy.idle_timeout_secs == 0 {
      return Err(Error::config("proxy.idle_timeout_secs must be at least 1"));
    }
    if let Some(entry) = self
      .proxy
      .exclude_domains
      .iter()
      .find(|d| d.trim().trim_start_matches("*.").trim_end_matches('.').is_empty())
    {
      return Err(Error::config(format!("empty exclude entry: {:?}", entry)));
    }
    if self.intruder.concurrency == 0 {
      return Err(Error::config("intruder.concurrency must be at least 1"));
    }
    if self.intruder.request_timeout_secs == 0 {
      return Err(Error::config("intruder.request_timeout_secs must be at least 1"));
    }
    Ok(())
  }
}
