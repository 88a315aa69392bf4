//! TLS configuration for both sides of an intercepted connection
//!
use std::io::{BufRead, Cursor};
use std::sync::Arc;

use tokio_rustls::rustls;
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{
  client::danger::HandshakeSignatureValid, client::danger::ServerCertVerified,
  client::danger::ServerCertVerifier, ClientConfig, DigitallySignedStruct, Error as TLSError,
  RootCertStore, ServerConfig, SignatureScheme,
};

use crate::ca::LeafCertificate;
use crate::errors::{Error, Result};

/// A trusted root added on top of the platform store for origin connections.
#[derive(Clone, Debug)]
pub struct Certificate {
  der: Vec<u8>,
}

impl Certificate {
  /// Create a `Certificate` from a binary DER encoded certificate
  pub fn from_der(der: &[u8]) -> Certificate {
    Certificate { der: der.to_owned() }
  }

  /// Create every `Certificate` in a PEM bundle.
  /// Example byte sources may be `.crt`, `.cer` or `.pem` files.
  pub fn from_pem_bundle(pem_bundle: &[u8]) -> Result<Vec<Certificate>> {
    Self::read_pem_certs(&mut Cursor::new(pem_bundle))
      .map(|certs| certs.into_iter().map(|der| Certificate { der }).collect())
  }

  fn add_to_tls(&self, root_cert_store: &mut RootCertStore) -> Result<()> {
    root_cert_store
      .add(CertificateDer::from(self.der.clone()))
      .map_err(|e| Error::certificate(format!("invalid root certificate: {}", e)))
  }

  fn read_pem_certs(reader: &mut impl BufRead) -> Result<Vec<Vec<u8>>> {
    rustls_pemfile::certs(reader)
      .map(|result| match result {
        Ok(cert) => Ok(cert.as_ref().to_vec()),
        Err(_) => Err(Error::certificate("invalid certificate encoding")),
      })
      .collect()
  }
}

fn provider() -> Arc<CryptoProvider> {
  CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// Client-side TLS config used when the proxy connects to a real origin.
///
/// The platform roots are always loaded; `extra_roots` are trusted in addition.
/// With `certs_verification` off any origin certificate is accepted.
pub(crate) fn client_config(
  certs_verification: bool,
  extra_roots: &[Certificate],
) -> Result<Arc<ClientConfig>> {
  let builder = ClientConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::tls_handshake(format!("invalid TLS versions: {}", e)))?;
  let config = if certs_verification {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for error in native.errors.iter() {
      tracing::debug!("[tls] skipping native root: {}", error);
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    tracing::debug!("[tls] loaded {} native roots ({} ignored)", added, ignored);
    for cert in extra_roots {
      cert.add_to_tls(&mut roots)?;
    }
    builder.with_root_certificates(roots).with_no_client_auth()
  } else {
    builder
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(NoVerifier))
      .with_no_client_auth()
  };
  Ok(Arc::new(config))
}

/// Server-side TLS config presenting `leaf` to an intercepted client.
///
/// Only HTTP/1.1 is offered over ALPN.
pub(crate) fn server_config(leaf: &LeafCertificate) -> Result<Arc<ServerConfig>> {
  let mut config = ServerConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::tls_handshake(format!("invalid TLS versions: {}", e)))?
    .with_no_client_auth()
    .with_single_cert(leaf.chain(), leaf.private_key())
    .map_err(|e| Error::tls_handshake(format!("unusable leaf for {}: {}", leaf.hostname(), e)))?;
  config.alpn_protocols = vec![b"http/1.1".to_vec()];
  Ok(Arc::new(config))
}

#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, TLSError> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::RSA_PKCS1_SHA1,
      SignatureScheme::ECDSA_SHA1_Legacy,
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
      SignatureScheme::ED448,
    ]
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn pem_bundles_split_into_certificates() {
    let ca = crate::ca::CertificateAuthority::ephemeral().unwrap();
    let bundle = format!("{}{}", ca.ca_cert_pem(), ca.ca_cert_pem());
    let certs = Certificate::from_pem_bundle(bundle.as_bytes()).unwrap();
    assert_eq!(certs.len(), 2);
    let mut roots = RootCertStore::empty();
    certs[0].add_to_tls(&mut roots).unwrap();
    assert_eq!(roots.len(), 1);
  }

  #[tokio::test]
  async fn server_config_accepts_issued_leaf() {
    let manager = crate::ca::CertificateManager::ephemeral().unwrap();
    let leaf = manager.get_leaf_certificate("example.com").await.unwrap();
    let config = server_config(&leaf).unwrap();
    assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
  }
}
