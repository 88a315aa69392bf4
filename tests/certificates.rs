//! Integration tests for the certificate authority

use std::sync::Arc;

use volley::{CertificateAuthority, CertificateManager};

#[tokio::test]
async fn root_is_persisted_and_reloaded() {
  let dir = tempfile::tempdir().unwrap();
  let first = CertificateManager::load_or_generate(dir.path()).await.unwrap();
  let pem = first.ca_cert_pem().to_string();
  assert!(pem.contains("BEGIN CERTIFICATE"));
  assert!(dir.path().join("ca_cert.pem").exists());
  assert!(dir.path().join("ca_key.pem").exists());
  assert_eq!(
    first.authority().ca_cert_path(),
    Some(dir.path().join("ca_cert.pem"))
  );

  let second = CertificateManager::load_or_generate(dir.path()).await.unwrap();
  assert_eq!(second.ca_cert_pem(), pem);
  assert_eq!(second.authority().ca_cert_der(), first.authority().ca_cert_der());
}

#[tokio::test]
async fn half_present_root_is_rejected() {
  let dir = tempfile::tempdir().unwrap();
  CertificateAuthority::load_or_generate(dir.path()).await.unwrap();
  std::fs::remove_file(dir.path().join("ca_key.pem")).unwrap();
  let err = CertificateAuthority::load_or_generate(dir.path())
    .await
    .unwrap_err();
  assert!(matches!(err, volley::Error::Certificate(_)));
}

#[tokio::test]
async fn leaf_is_cached_per_hostname() {
  let manager = CertificateManager::ephemeral().unwrap();
  let a = manager.get_leaf_certificate("example.com").await.unwrap();
  let b = manager.get_leaf_certificate("EXAMPLE.com.").await.unwrap();
  assert!(Arc::ptr_eq(&a, &b));
  assert_eq!(a.cert_der(), b.cert_der());
  assert_eq!(a.hostname(), "example.com");
  assert_eq!(a.chain().len(), 2);
  assert_eq!(a.chain()[1].as_ref(), manager.authority().ca_cert_der());
  assert_eq!(manager.issued_count(), 1);

  let other = manager.get_leaf_certificate("api.example.com").await.unwrap();
  assert_ne!(other.cert_der(), a.cert_der());
  assert_eq!(manager.issued_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_sign_each_host_once() {
  let manager = Arc::new(CertificateManager::ephemeral().unwrap());
  let hosts = ["a.test", "b.test", "c.test", "127.0.0.1"];
  let mut tasks = Vec::new();
  for round in 0..8 {
    for host in hosts {
      let manager = manager.clone();
      tasks.push(tokio::spawn(async move {
        let leaf = manager.get_leaf_certificate(host).await.unwrap();
        (round, host, leaf)
      }));
    }
  }
  let mut leaves = Vec::new();
  for task in tasks {
    leaves.push(task.await.unwrap());
  }
  assert_eq!(manager.issued_count(), hosts.len());
  for host in hosts {
    let mut same_host = leaves.iter().filter(|(_, h, _)| *h == host);
    let (_, _, first) = same_host.next().unwrap();
    assert!(same_host.all(|(_, _, leaf)| leaf.cert_der() == first.cert_der()));
  }
}

#[tokio::test]
async fn empty_hostname_is_refused() {
  let manager = CertificateManager::ephemeral().unwrap();
  let err = manager.get_leaf_certificate(" ").await.unwrap_err();
  assert!(matches!(err, volley::Error::TlsHandshake(_)));
  assert_eq!(manager.issued_count(), 0);
}
