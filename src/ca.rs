//! Certificate authority for intercepting HTTPS traffic
//!
//! A root is loaded from (or generated into) a storage directory once per
//! process. Leaf certificates are signed on demand, one per hostname, and
//! cached for the lifetime of the [`CertificateManager`].
//!

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::errors::{Error, Result};

/// Leaf validity period in seconds (1 year)
const LEAF_TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Root validity period in days
const ROOT_TTL_DAYS: i64 = 3650;
/// Offset for not_before timestamp to handle clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;

const CA_CERT_FILE: &str = "ca_cert.pem";
const CA_KEY_FILE: &str = "ca_key.pem";

/// A certificate for one hostname, signed by the root, plus its private key.
pub struct LeafCertificate {
  hostname: String,
  cert_der: CertificateDer<'static>,
  ca_cert_der: CertificateDer<'static>,
  key_der: PrivateKeyDer<'static>,
  issued_at: SystemTime,
}

impl std::fmt::Debug for LeafCertificate {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LeafCertificate")
      .field("hostname", &self.hostname)
      .field("issued_at", &self.issued_at)
      .finish_non_exhaustive()
  }
}

impl LeafCertificate {
  /// The normalized hostname the certificate was issued for.
  pub fn hostname(&self) -> &str {
    &self.hostname
  }

  /// DER encoding of the leaf certificate.
  pub fn cert_der(&self) -> &[u8] {
    self.cert_der.as_ref()
  }

  /// PKCS#8 DER encoding of the leaf private key.
  pub fn key_der(&self) -> &[u8] {
    self.key_der.secret_der()
  }

  /// When the leaf was signed.
  pub fn issued_at(&self) -> SystemTime {
    self.issued_at
  }

  /// Chain presented to clients: `[leaf, root]`.
  pub fn chain(&self) -> Vec<CertificateDer<'static>> {
    vec![self.cert_der.clone(), self.ca_cert_der.clone()]
  }

  /// The private key in the form rustls expects.
  pub fn private_key(&self) -> PrivateKeyDer<'static> {
    self.key_der.clone_key()
  }
}

/// The root used to sign every leaf.
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_der: CertificateDer<'static>,
  ca_cert_pem: String,
  storage_path: Option<PathBuf>,
}

impl std::fmt::Debug for CertificateAuthority {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CertificateAuthority")
      .field("storage_path", &self.storage_path)
      .finish_non_exhaustive()
  }
}

impl CertificateAuthority {
  /// Load the root from `storage_path`, generating and persisting it when absent.
  ///
  /// The directory is created if needed. A half-present pair (only the
  /// certificate or only the key) is an error rather than silently replaced.
  pub async fn load_or_generate(storage_path: impl AsRef<Path>) -> Result<Self> {
    let storage_path = storage_path.as_ref().to_path_buf();
    if !storage_path.exists() {
      fs::create_dir_all(&storage_path).await?;
    }
    let cert_path = storage_path.join(CA_CERT_FILE);
    let key_path = storage_path.join(CA_KEY_FILE);
    let mut ca = match (cert_path.exists(), key_path.exists()) {
      (true, true) => {
        let ca = Self::load(&cert_path, &key_path).await?;
        tracing::info!("[ca] loaded root from {}", cert_path.display());
        ca
      }
      (false, false) => {
        let (ca, key_pem) = Self::generate()?;
        fs::write(&cert_path, ca.ca_cert_pem.as_bytes()).await?;
        fs::write(&key_path, key_pem.as_bytes()).await?;
        tracing::info!("[ca] generated new root at {}", cert_path.display());
        ca
      }
      _ => {
        return Err(Error::certificate(format!(
          "incomplete root in {}: expected both {} and {}",
          storage_path.display(),
          CA_CERT_FILE,
          CA_KEY_FILE
        )))
      }
    };
    ca.storage_path = Some(storage_path);
    Ok(ca)
  }

  /// A root that lives only in memory, for tests and throwaway sessions.
  pub fn ephemeral() -> Result<Self> {
    Self::generate().map(|(ca, _)| ca)
  }

  async fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
    let cert_pem = fs::read_to_string(cert_path).await?;
    let key_pem = fs::read_to_string(key_path).await?;
    let key_pair = KeyPair::from_pem(&key_pem)
      .map_err(|e| Error::certificate(format!("failed to parse root key: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate(format!("failed to create issuer from root: {}", e)))?;
    let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::certificate("no certificate found in root PEM"))?
      .map_err(|e| Error::certificate(format!("failed to parse root PEM: {}", e)))?;
    Ok(Self {
      issuer,
      ca_cert_der: cert_der,
      ca_cert_pem: cert_pem,
      storage_path: None,
    })
  }

  fn generate() -> Result<(Self, String)> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Volley Interception CA");
    dn.push(DnType::OrganizationName, "Volley");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
      KeyUsagePurpose::KeyCertSign,
      KeyUsagePurpose::CrlSign,
      KeyUsagePurpose::DigitalSignature,
    ];
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::days(ROOT_TTL_DAYS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate(format!("failed to generate root key: {}", e)))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate(format!("failed to self-sign root: {}", e)))?;
    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();
    let ca_cert_der = CertificateDer::from(cert.der().to_vec());
    let issuer = Issuer::new(params, key_pair);
    Ok((
      Self {
        issuer,
        ca_cert_der,
        ca_cert_pem: cert_pem,
        storage_path: None,
      },
      key_pem,
    ))
  }

  /// Sign a fresh leaf for `hostname`.
  ///
  /// IP literals get an IP address SAN plus the textual form as a DNS SAN,
  /// since clients disagree on which one they check.
  pub fn sign_leaf(&self, hostname: &str) -> Result<LeafCertificate> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    params.distinguished_name = dn;
    params.subject_alt_names = if let Ok(ip) = hostname.parse::<IpAddr>() {
      let mut sans = vec![SanType::IpAddress(ip)];
      if let Ok(dns_name) = hostname.try_into() {
        sans.push(SanType::DnsName(dns_name));
      }
      sans
    } else {
      vec![SanType::DnsName(hostname.try_into().map_err(|_| {
        Error::certificate(format!("invalid hostname: {}", hostname))
      })?)]
    };
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::seconds(LEAF_TTL_SECS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate(format!("failed to generate leaf key: {}", e)))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate(format!("failed to sign leaf for {}: {}", hostname, e)))?;
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::certificate("failed to serialize leaf key"))?;
    Ok(LeafCertificate {
      hostname: hostname.to_string(),
      cert_der: CertificateDer::from(cert.der().to_vec()),
      ca_cert_der: self.ca_cert_der.clone(),
      key_der,
      issued_at: SystemTime::now(),
    })
  }

  /// Root certificate in PEM, for installing into client trust stores.
  pub fn ca_cert_pem(&self) -> &str {
    &self.ca_cert_pem
  }

  /// Root certificate in DER.
  pub fn ca_cert_der(&self) -> &[u8] {
    self.ca_cert_der.as_ref()
  }

  /// Where the root PEM lives on disk, unless ephemeral.
  pub fn ca_cert_path(&self) -> Option<PathBuf> {
    self.storage_path.as_ref().map(|p| p.join(CA_CERT_FILE))
  }
}

/// Issues and caches one leaf per hostname.
///
/// Concurrent requests for the same hostname share a single signing
/// operation; different hostnames never wait on each other.
pub struct CertificateManager {
  ca: CertificateAuthority,
  cert_cache: Cache<String, Arc<LeafCertificate>>,
  issued: AtomicUsize,
}

impl std::fmt::Debug for CertificateManager {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CertificateManager")
      .field("ca", &self.ca)
      .field("issued", &self.issued)
      .finish_non_exhaustive()
  }
}

impl CertificateManager {
  /// Wrap an existing root.
  pub fn new(ca: CertificateAuthority) -> Self {
    Self {
      ca,
      cert_cache: Cache::builder().build(),
      issued: AtomicUsize::new(0),
    }
  }

  /// Load or create the root at `storage_path`.
  pub async fn load_or_generate(storage_path: impl AsRef<Path>) -> Result<Self> {
    Ok(Self::new(CertificateAuthority::load_or_generate(storage_path).await?))
  }

  /// A manager over an in-memory root.
  pub fn ephemeral() -> Result<Self> {
    Ok(Self::new(CertificateAuthority::ephemeral()?))
  }

  /// The leaf for `hostname`, signing it on first use.
  ///
  /// Hostnames are compared case-insensitively with any trailing dot
  /// ignored. Signing failures surface as [`Error::TlsHandshake`] and are
  /// not cached, so a later call retries.
  pub async fn get_leaf_certificate(&self, hostname: &str) -> Result<Arc<LeafCertificate>> {
    let key = normalize_hostname(hostname);
    if key.is_empty() {
      return Err(Error::tls_handshake("cannot issue a certificate for an empty hostname"));
    }
    self
      .cert_cache
      .try_get_with(key.clone(), async {
        let leaf = self.ca.sign_leaf(&key)?;
        self.issued.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("[ca] issued leaf for {}", key);
        Ok::<_, Error>(Arc::new(leaf))
      })
      .await
      .map_err(|e| Error::tls_handshake(format!("no certificate for {}: {}", key, e)))
  }

  /// How many leaves have been signed so far.
  pub fn issued_count(&self) -> usize {
    self.issued.load(Ordering::SeqCst)
  }

  /// The root behind this manager.
  pub fn authority(&self) -> &CertificateAuthority {
    &self.ca
  }

  /// Root certificate in PEM.
  pub fn ca_cert_pem(&self) -> &str {
    self.ca.ca_cert_pem()
  }
}

pub(crate) fn normalize_hostname(hostname: &str) -> String {
  hostname
    .trim()
    .trim_start_matches('[')
    .trim_end_matches(']')
    .trim_end_matches('.')
    .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn same_hostname_returns_cached_leaf() {
    let manager = CertificateManager::ephemeral().unwrap();
    let first = manager.get_leaf_certificate("Example.COM.").await.unwrap();
    let second = manager.get_leaf_certificate("example.com").await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.cert_der(), second.cert_der());
    assert_eq!(first.hostname(), "example.com");
    assert_eq!(manager.issued_count(), 1);
  }

  #[tokio::test]
  async fn ip_literals_get_leaves() {
    let manager = CertificateManager::ephemeral().unwrap();
    let leaf = manager.get_leaf_certificate("127.0.0.1").await.unwrap();
    assert_eq!(leaf.chain().len(), 2);
    assert_eq!(leaf.chain()[1].as_ref(), manager.authority().ca_cert_der());
  }

  #[test]
  fn debug_output_omits_key_material() {
    let manager = CertificateManager::ephemeral().unwrap();
    let out = format!("{:?}", manager);
    assert!(out.starts_with("CertificateManager"));
    assert!(out.contains("CertificateAuthority"));
    assert!(!out.contains("PRIVATE KEY"));
  }

  #[tokio::test]
  async fn empty_hostname_is_refused() {
    let manager = CertificateManager::ephemeral().unwrap();
    let err = manager.get_leaf_certificate(" . ").await.unwrap_err();
    assert!(matches!(err, Error::TlsHandshake(_)), "{:?}", err);
    assert_eq!(manager.issued_count(), 0);
  }

  #[test]
  fn ephemeral_root_has_no_path() {
    let ca = CertificateAuthority::ephemeral().unwrap();
    assert!(ca.ca_cert_path().is_none());
    assert!(ca.ca_cert_pem().starts_with("-----BEGIN CERTIFICATE-----"));
  }
}
