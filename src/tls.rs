//! TLS configuration for both sides of an intercepted connection.
//!
//! Towards the client the proxy presents an identity chosen by a
//! [`ContextSelector`]; towards the server it is an ordinary client whose
//! trust policy is an [`UpstreamTrust`].
use crate::ca::{CertificateAuthority, KeyEntry};
use crate::errors::{Error, Result};
use crate::target::TargetAddr;
use async_trait::async_trait;
use moka::future::Cache;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_rustls::rustls;
use tokio_rustls::rustls::client::danger::{
  HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::server::{ClientHello, ResolvesServerCert};
use tokio_rustls::rustls::sign::CertifiedKey;
use tokio_rustls::rustls::{
  ClientConfig, DigitallySignedStruct, Error as TLSError, RootCertStore, ServerConfig,
  SignatureScheme, SignatureAlgorithm,
};

pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
  CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// Parse a PEM certificate chain and private key into an identity.
pub fn load_identity_pem(alias: &str, pem: &[u8]) -> Result<KeyEntry> {
  use rustls_pemfile::Item;

  let mut reader = pem;
  let mut keys = Vec::<PrivateKeyDer<'static>>::new();
  let mut certs = Vec::<CertificateDer<'static>>::new();
  for item in rustls_pemfile::read_all(&mut reader) {
    match item {
      Ok(Item::X509Certificate(cert)) => certs.push(cert),
      Ok(Item::Pkcs1Key(key)) => keys.push(key.into()),
      Ok(Item::Pkcs8Key(key)) => keys.push(key.into()),
      Ok(Item::Sec1Key(key)) => keys.push(key.into()),
      Ok(_) => {}
      Err(_) => return Err(Error::signing("invalid identity PEM")),
    }
  }
  match (keys.pop(), certs.is_empty()) {
    (Some(key), false) => Ok(KeyEntry::new(alias, key, certs)),
    _ => Err(Error::signing("private key or certificate not found")),
  }
}

/// Serves exactly one identity, whatever the client asks for.
pub struct KeyManager {
  entry: KeyEntry,
  certified: Arc<CertifiedKey>,
}

impl fmt::Debug for KeyManager {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("KeyManager")
      .field("alias", &self.entry.alias())
      .finish()
  }
}

impl KeyManager {
  /// Manager for `entry`.
  pub fn new(entry: KeyEntry) -> Result<Self> {
    let signing_key = crypto_provider()
      .key_provider
      .load_private_key(entry.key().clone_key())?;
    let certified = Arc::new(CertifiedKey::new(entry.chain().to_vec(), signing_key));
    Ok(Self { entry, certified })
  }
  /// The only alias, returned for any key type and issuer list.
  pub fn choose_server_alias(
    &self,
    _key_type: Option<SignatureAlgorithm>,
    _issuers: &[&[u8]],
  ) -> Option<&str> {
    Some(self.entry.alias())
  }
  /// Client authentication is never offered.
  pub fn choose_client_alias(&self, _issuers: &[&[u8]]) -> Result<&str> {
    Err(Error::unsupported("client certificates"))
  }
  /// A copy of the identity for `alias`.
  pub fn entry(&self, alias: &str) -> Option<KeyEntry> {
    (alias == self.entry.alias()).then(|| self.entry.clone())
  }
  /// Certificate chain for `alias`.
  pub fn certificate_chain(&self, alias: &str) -> Option<Vec<CertificateDer<'static>>> {
    self.entry(alias).map(|e| e.chain().to_vec())
  }
  /// Private key for `alias`.
  pub fn private_key(&self, alias: &str) -> Option<PrivateKeyDer<'static>> {
    self.entry(alias).map(|e| e.key().clone_key())
  }
}

impl ResolvesServerCert for KeyManager {
  fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
    Some(self.certified.clone())
  }
}

/// Server side TLS configuration presenting `manager`'s identity.
pub fn server_config(manager: KeyManager) -> Result<Arc<ServerConfig>> {
  let mut config = ServerConfig::builder_with_provider(crypto_provider())
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_cert_resolver(Arc::new(manager));
  config.alpn_protocols = vec![b"http/1.1".to_vec()];
  Ok(Arc::new(config))
}

/// Picks the server TLS configuration for an intercepted target.
#[async_trait]
pub trait ContextSelector: Send + Sync {
  /// Configuration used to terminate TLS for `target`.
  async fn select(&self, target: &TargetAddr) -> Result<Arc<ServerConfig>>;
}

/// One identity for every target.
pub struct StaticContextSelector {
  config: Arc<ServerConfig>,
}

impl StaticContextSelector {
  /// Selector presenting `entry`.
  pub fn new(entry: KeyEntry) -> Result<Self> {
    Ok(Self {
      config: server_config(KeyManager::new(entry)?)?,
    })
  }
  /// Selector presenting the identity in a PEM bundle.
  pub fn from_pem(pem: &[u8]) -> Result<Self> {
    Self::new(load_identity_pem("server", pem)?)
  }
}

#[async_trait]
impl ContextSelector for StaticContextSelector {
  async fn select(&self, _target: &TargetAddr) -> Result<Arc<ServerConfig>> {
    Ok(self.config.clone())
  }
}

/// Mints one certificate per host, signed by the local CA, and keeps it for
/// the life of the process.
pub struct AutoGeneratingContextSelector {
  ca: Arc<CertificateAuthority>,
  cache: Cache<String, Arc<ServerConfig>>,
  issued: Arc<AtomicU64>,
}

impl AutoGeneratingContextSelector {
  /// Selector signing with `ca`.
  pub fn new(ca: Arc<CertificateAuthority>) -> Self {
    Self {
      ca,
      cache: Cache::builder().build(),
      issued: Arc::new(AtomicU64::new(0)),
    }
  }
  /// The signing CA.
  pub fn ca(&self) -> &Arc<CertificateAuthority> {
    &self.ca
  }
  /// How many certificates were signed so far.
  pub fn issued(&self) -> u64 {
    self.issued.load(Ordering::Relaxed)
  }
}

#[async_trait]
impl ContextSelector for AutoGeneratingContextSelector {
  async fn select(&self, target: &TargetAddr) -> Result<Arc<ServerConfig>> {
    let host = target.host().to_ascii_lowercase();
    let ca = self.ca.clone();
    let issued = self.issued.clone();
    let init = async move {
      let entry = tokio::task::spawn_blocking(move || ca.issue(&host))
        .await
        .map_err(|e| Error::signing(format!("signing task failed: {}", e)))??;
      issued.fetch_add(1, Ordering::Relaxed);
      server_config(KeyManager::new(entry)?)
    };
    self
      .cache
      .try_get_with(target.host().to_ascii_lowercase(), init)
      .await
      .map_err(|e| Error::signing(e.to_string()))
  }
}

/// How upstream server certificates are checked.
#[derive(Clone, Debug, Default)]
pub enum UpstreamTrust {
  /// Accept any certificate
  #[default]
  Any,
  /// Verify against these roots
  Roots(Vec<CertificateDer<'static>>),
}

impl UpstreamTrust {
  /// Trust the certificates in a PEM bundle.
  pub fn from_pem(pem: &[u8]) -> Result<Self> {
    let mut reader = pem;
    let roots = rustls_pemfile::certs(&mut reader)
      .collect::<std::result::Result<Vec<_>, _>>()
      .map_err(|e| Error::signing(format!("invalid root certificate: {}", e)))?;
    Ok(UpstreamTrust::Roots(roots))
  }
  /// Client side TLS configuration for this policy.
  pub fn client_config(&self) -> Result<Arc<ClientConfig>> {
    let builder = ClientConfig::builder_with_provider(crypto_provider())
      .with_safe_default_protocol_versions()?;
    let mut config = match self {
      UpstreamTrust::Any => builder
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth(),
      UpstreamTrust::Roots(certs) => {
        let mut roots = RootCertStore::empty();
        for cert in certs {
          roots.add(cert.clone())?;
        }
        builder.with_root_certificates(roots).with_no_client_auth()
      }
    };
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
  }
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
