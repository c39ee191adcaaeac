//! Local certificate authority.
//!
//! The CA certificate and key live in a storage directory as
//! `ca_cert.pem`/`ca_key.pem`; they are generated on first start. Leaf
//! certificates for intercepted hosts are signed here.
use crate::errors::{Error, Result};
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use x509_parser::extensions::GeneralName;
use x509_parser::parse_x509_certificate;

/// Leaf validity (1 year)
const LEAF_TTL_DAYS: i64 = 365;
/// CA validity (10 years)
const CA_TTL_DAYS: i64 = 3650;
/// not_before is backdated to tolerate clock skew
const NOT_BEFORE_OFFSET: i64 = 60;

const CA_CERT_FILE: &str = "ca_cert.pem";
const CA_KEY_FILE: &str = "ca_key.pem";

/// An identity: alias, private key and certificate chain (leaf first).
pub struct KeyEntry {
  alias: String,
  key: PrivateKeyDer<'static>,
  chain: Vec<CertificateDer<'static>>,
}

impl KeyEntry {
  /// Bundle an identity.
  pub fn new(
    alias: impl Into<String>,
    key: PrivateKeyDer<'static>,
    chain: Vec<CertificateDer<'static>>,
  ) -> Self {
    Self {
      alias: alias.into(),
      key,
      chain,
    }
  }
  /// alias
  pub fn alias(&self) -> &str {
    &self.alias
  }
  /// private key
  pub fn key(&self) -> &PrivateKeyDer<'static> {
    &self.key
  }
  /// certificate chain, leaf first
  pub fn chain(&self) -> &[CertificateDer<'static>] {
    &self.chain
  }
}

impl Clone for KeyEntry {
  fn clone(&self) -> Self {
    Self {
      alias: self.alias.clone(),
      key: self.key.clone_key(),
      chain: self.chain.clone(),
    }
  }
}

impl fmt::Debug for KeyEntry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("KeyEntry")
      .field("alias", &self.alias)
      .field("chain", &self.chain.len())
      .finish_non_exhaustive()
  }
}

/// Everything needed to sign one certificate.
pub struct SigningRequest<'a> {
  /// subject common name; also the SAN unless a template provides SANs
  pub subject: String,
  /// key pair whose public half is certified
  pub public_key: &'a KeyPair,
  /// start of validity
  pub not_before: OffsetDateTime,
  /// end of validity
  pub not_after: OffsetDateTime,
  /// serial number
  pub serial: u64,
  /// certificate whose subject alt names, key usages, extended key usages
  /// and basic constraints are copied
  pub template: Option<CertificateDer<'a>>,
}

/// Certificate authority that signs leaf certificates.
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_der: CertificateDer<'static>,
  ca_cert_pem: String,
  serial: AtomicU64,
}

impl fmt::Debug for CertificateAuthority {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CertificateAuthority")
      .field("serial", &self.serial)
      .finish_non_exhaustive()
  }
}

impl CertificateAuthority {
  /// Load the CA from `storage_path`, generating and saving one when none
  /// exists yet.
  pub async fn load_or_generate(storage_path: impl AsRef<Path>) -> Result<Self> {
    let storage_path = storage_path.as_ref();
    if !storage_path.exists() {
      fs::create_dir_all(storage_path).await?;
    }
    let cert_path = storage_path.join(CA_CERT_FILE);
    let key_path = storage_path.join(CA_KEY_FILE);
    if cert_path.exists() && key_path.exists() {
      let cert_pem = fs::read_to_string(&cert_path).await?;
      let key_pem = fs::read_to_string(&key_path).await?;
      tracing::debug!("loaded CA from {}", storage_path.display());
      return Self::from_pem(&cert_pem, &key_pem);
    }
    let (cert_pem, key_pem) = Self::generate_pem()?;
    fs::write(&cert_path, cert_pem.as_bytes()).await?;
    fs::write(&key_path, key_pem.as_bytes()).await?;
    tracing::info!("generated new CA in {}", storage_path.display());
    Self::from_pem(&cert_pem, &key_pem)
  }

  /// CA from PEM encoded certificate and PKCS#8 key.
  pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
    let key_pair = KeyPair::from_pem(key_pem)
      .map_err(|e| Error::signing(format!("failed to parse CA key: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
      .map_err(|e| Error::signing(format!("failed to create issuer from CA cert: {}", e)))?;
    let ca_cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::signing("no certificate found in CA PEM"))?
      .map_err(|e| Error::signing(format!("failed to parse CA PEM: {}", e)))?;
    Ok(Self {
      issuer,
      ca_cert_der,
      ca_cert_pem: cert_pem.to_string(),
      serial: AtomicU64::new(initial_serial()),
    })
  }

  /// A fresh self-signed CA in memory, as `(cert_pem, key_pem)`.
  pub fn generate_pem() -> Result<(String, String)> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "tapwire interception CA");
    dn.push(DnType::OrganizationName, "tapwire");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::days(CA_TTL_DAYS);
    let key_pair = KeyPair::generate()
      .map_err(|e| Error::signing(format!("failed to generate key pair: {}", e)))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::signing(format!("failed to generate CA: {}", e)))?;
    Ok((cert.pem(), key_pair.serialize_pem()))
  }

  /// Next serial number. Monotonic, never reused while this CA lives.
  pub fn next_serial(&self) -> u64 {
    self.serial.fetch_add(1, Ordering::Relaxed)
  }

  /// Sign `request` with the CA key.
  pub fn sign(&self, request: &SigningRequest<'_>) -> Result<CertificateDer<'static>> {
    let mut params = match &request.template {
      Some(template) => template_params(template)?,
      None => {
        let mut params = CertificateParams::default();
        params.subject_alt_names = subject_alt_names(&request.subject)?;
        params.is_ca = IsCa::NoCa;
        params
      }
    };
    if params.subject_alt_names.is_empty() {
      params.subject_alt_names = subject_alt_names(&request.subject)?;
    }
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, request.subject.as_str());
    params.distinguished_name = dn;
    params.not_before = request.not_before;
    params.not_after = request.not_after;
    params.serial_number = Some(SerialNumber::from(request.serial));
    let cert = params
      .signed_by(request.public_key, &self.issuer)
      .map_err(|e| Error::signing(format!("failed to sign {}: {}", request.subject, e)))?;
    Ok(cert.der().clone())
  }

  /// Mint a key pair and leaf certificate for `host`. Blocking; the chain
  /// is `[leaf, ca]`.
  pub fn issue(&self, host: &str) -> Result<KeyEntry> {
    let key_pair = KeyPair::generate()
      .map_err(|e| Error::signing(format!("failed to generate key pair: {}", e)))?;
    let now = OffsetDateTime::now_utc();
    let request = SigningRequest {
      subject: host.to_string(),
      public_key: &key_pair,
      not_before: now - Duration::seconds(NOT_BEFORE_OFFSET),
      not_after: now + Duration::days(LEAF_TTL_DAYS),
      serial: self.next_serial(),
      template: None,
    };
    let leaf = self.sign(&request)?;
    let key = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::signing("failed to serialize leaf key"))?;
    tracing::debug!("issued certificate for {} (serial {})", host, request.serial);
    Ok(KeyEntry::new(
      host,
      key,
      vec![leaf, self.ca_cert_der.clone()],
    ))
  }

  /// CA certificate in PEM, for installation into clients.
  pub fn ca_cert_pem(&self) -> &str {
    &self.ca_cert_pem
  }
  /// CA certificate in DER.
  pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
    &self.ca_cert_der
  }
  /// Where `load_or_generate` keeps the CA certificate.
  pub fn ca_cert_path(storage_path: impl AsRef<Path>) -> PathBuf {
    storage_path.as_ref().join(CA_CERT_FILE)
  }
}

fn initial_serial() -> u64 {
  // random high bits, low bits left for the counter
  (((rand::thread_rng().gen::<u32>() & 0x7fff_ffff) as u64) << 24) | 1
}

/// Leaf parameters carrying the template's subject alt names, key usages,
/// extended key usages and basic constraints.
fn template_params(template: &CertificateDer<'_>) -> Result<CertificateParams> {
  let unusable = |e: &dyn fmt::Display| Error::signing(format!("unusable template certificate: {}", e));
  let (_, cert) = parse_x509_certificate(template.as_ref()).map_err(|e| unusable(&e))?;
  let mut params = CertificateParams::default();
  if let Some(san) = cert.subject_alternative_name().map_err(|e| unusable(&e))? {
    for name in &san.value.general_names {
      let san = match name {
        GeneralName::DNSName(name) => name.to_string().try_into().map(SanType::DnsName),
        GeneralName::RFC822Name(name) => name.to_string().try_into().map(SanType::Rfc822Name),
        GeneralName::URI(uri) => uri.to_string().try_into().map(SanType::URI),
        GeneralName::IPAddress(bytes) => match ip_from_bytes(bytes) {
          Some(ip) => Ok(SanType::IpAddress(ip)),
          None => continue,
        },
        _ => continue,
      };
      params
        .subject_alt_names
        .push(san.map_err(|e| unusable(&e))?);
    }
  }
  if let Some(usage) = cert.key_usage().map_err(|e| unusable(&e))? {
    let usage = usage.value;
    let flags = [
      (usage.digital_signature(), KeyUsagePurpose::DigitalSignature),
      (usage.non_repudiation(), KeyUsagePurpose::ContentCommitment),
      (usage.key_encipherment(), KeyUsagePurpose::KeyEncipherment),
      (usage.data_encipherment(), KeyUsagePurpose::DataEncipherment),
      (usage.key_agreement(), KeyUsagePurpose::KeyAgreement),
      (usage.key_cert_sign(), KeyUsagePurpose::KeyCertSign),
      (usage.crl_sign(), KeyUsagePurpose::CrlSign),
      (usage.encipher_only(), KeyUsagePurpose::EncipherOnly),
      (usage.decipher_only(), KeyUsagePurpose::DecipherOnly),
    ];
    params.key_usages = flags
      .into_iter()
      .filter_map(|(set, purpose)| set.then_some(purpose))
      .collect();
  }
  if let Some(usage) = cert.extended_key_usage().map_err(|e| unusable(&e))? {
    let usage = usage.value;
    let flags = [
      (usage.any, ExtendedKeyUsagePurpose::Any),
      (usage.server_auth, ExtendedKeyUsagePurpose::ServerAuth),
      (usage.client_auth, ExtendedKeyUsagePurpose::ClientAuth),
      (usage.code_signing, ExtendedKeyUsagePurpose::CodeSigning),
      (usage.email_protection, ExtendedKeyUsagePurpose::EmailProtection),
      (usage.time_stamping, ExtendedKeyUsagePurpose::TimeStamping),
      (usage.ocsp_signing, ExtendedKeyUsagePurpose::OcspSigning),
    ];
    params.extended_key_usages = flags
      .into_iter()
      .filter_map(|(set, purpose)| set.then_some(purpose))
      .collect();
    for oid in &usage.other {
      if let Some(arcs) = oid.iter() {
        params
          .extended_key_usages
          .push(ExtendedKeyUsagePurpose::Other(arcs.collect()));
      }
    }
  }
  params.is_ca = match cert.basic_constraints().map_err(|e| unusable(&e))? {
    Some(constraints) if constraints.value.ca => match constraints.value.path_len_constraint {
      Some(len) => IsCa::Ca(BasicConstraints::Constrained(len.min(u8::MAX as u32) as u8)),
      None => IsCa::Ca(BasicConstraints::Unconstrained),
    },
    Some(_) => IsCa::ExplicitNoCa,
    None => IsCa::NoCa,
  };
  Ok(params)
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
  match bytes.len() {
    4 => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
    16 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
    _ => None,
  }
}

fn subject_alt_names(host: &str) -> Result<Vec<SanType>> {
  if let Ok(ip) = host.parse::<IpAddr>() {
    return Ok(vec![SanType::IpAddress(ip)]);
  }
  let name = host
    .try_into()
    .map_err(|_| Error::signing(format!("invalid host name: {}", host)))?;
  Ok(vec![SanType::DnsName(name)])
}

#[cfg(test)]
mod tests {
  use super::*;

  fn ca() -> CertificateAuthority {
    let (cert, key) = CertificateAuthority::generate_pem().unwrap();
    CertificateAuthority::from_pem(&cert, &key).unwrap()
  }

  #[test]
  fn test_serials_are_monotonic() {
    let ca = ca();
    let first = ca.next_serial();
    let second = ca.next_serial();
    assert!(second > first);
    assert_ne!(first, 0);
  }

  #[test]
  fn test_issue_chain() {
    let ca = ca();
    let entry = ca.issue("example.com").unwrap();
    assert_eq!(entry.alias(), "example.com");
    assert_eq!(entry.chain().len(), 2);
    assert_eq!(&entry.chain()[1], ca.ca_cert_der());
    let ip = ca.issue("127.0.0.1").unwrap();
    assert_ne!(ip.chain()[0], entry.chain()[0]);
  }

  #[test]
  fn test_sign_with_template_copies_extensions() {
    let ca = ca();
    let mut template = CertificateParams::new(vec![
      "template.example".to_string(),
      "127.0.0.1".to_string(),
    ])
    .unwrap();
    template.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
    ];
    template.extended_key_usages = vec![
      ExtendedKeyUsagePurpose::ServerAuth,
      ExtendedKeyUsagePurpose::ClientAuth,
    ];
    template.is_ca = IsCa::ExplicitNoCa;
    let template_key = KeyPair::generate().unwrap();
    let template = template.self_signed(&template_key).unwrap();

    let key = KeyPair::generate().unwrap();
    let now = OffsetDateTime::now_utc();
    let request = SigningRequest {
      subject: "copy.example".to_string(),
      public_key: &key,
      not_before: now,
      not_after: now + Duration::days(1),
      serial: ca.next_serial(),
      template: Some(template.der().clone()),
    };
    let signed = ca.sign(&request).unwrap();
    let (_, cert) = parse_x509_certificate(signed.as_ref()).unwrap();

    let cn = cert.subject().iter_common_name().next().unwrap();
    assert_eq!(cn.as_str().unwrap(), "copy.example");
    let san = cert.subject_alternative_name().unwrap().unwrap();
    let names = &san.value.general_names;
    assert!(names
      .iter()
      .any(|name| matches!(name, GeneralName::DNSName(value) if *value == "template.example")));
    assert!(names
      .iter()
      .any(|name| matches!(name, GeneralName::IPAddress(value) if *value == [127, 0, 0, 1])));
    let usage = cert.key_usage().unwrap().unwrap().value;
    assert!(usage.digital_signature());
    assert!(usage.key_encipherment());
    assert!(!usage.key_cert_sign());
    let extended = cert.extended_key_usage().unwrap().unwrap().value;
    assert!(extended.server_auth);
    assert!(extended.client_auth);
    let constraints = cert.basic_constraints().unwrap().unwrap().value;
    assert!(!constraints.ca);
  }

  #[test]
  fn test_sign_without_template_uses_subject_as_san() {
    let ca = ca();
    let key = KeyPair::generate().unwrap();
    let now = OffsetDateTime::now_utc();
    let request = SigningRequest {
      subject: "plain.example".to_string(),
      public_key: &key,
      not_before: now,
      not_after: now + Duration::days(1),
      serial: ca.next_serial(),
      template: None,
    };
    let signed = ca.sign(&request).unwrap();
    let (_, cert) = parse_x509_certificate(signed.as_ref()).unwrap();
    let san = cert.subject_alternative_name().unwrap().unwrap();
    assert!(san
      .value
      .general_names
      .iter()
      .any(|name| matches!(name, GeneralName::DNSName(value) if *value == "plain.example")));
    assert!(cert.basic_constraints().unwrap().is_none());
  }

  #[tokio::test]
  async fn test_load_or_generate_persists() {
    let dir = std::env::temp_dir().join(format!("tapwire-ca-{}", rand::random::<u64>()));
    let first = CertificateAuthority::load_or_generate(&dir).await.unwrap();
    let second = CertificateAuthority::load_or_generate(&dir).await.unwrap();
    assert_eq!(first.ca_cert_pem(), second.ca_cert_pem());
    assert!(CertificateAuthority::ca_cert_path(&dir).exists());
    let _ = std::fs::remove_dir_all(&dir);
  }
}
