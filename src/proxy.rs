//! Proxy configuration and the shared per-proxy context.
use crate::ca::CertificateAuthority;
use crate::client::UpstreamClient;
use crate::connector::{Connector, ConnectorBuilder};
use crate::errors::Result;
use crate::handler::{LoopGuard, Pipeline};
use crate::body::MAX_BODY_SIZE;
use crate::io::chunked::DEFAULT_MAX_CHUNK_SIZE;
use crate::message::MAX_HEADER_SIZE;
use crate::monitor::{GuardedMonitor, NoopMonitor, ProxyMonitor};
use crate::server::ProxyServer;
use crate::socks::{Authenticator, NoAuthentication, SocksServer};
use crate::tls::{AutoGeneratingContextSelector, ContextSelector, UpstreamTrust};
use crate::upstream::{Upstream, UpstreamSelector};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for the proxy
#[derive(Clone, Debug)]
pub struct ProxyConfig {
  /// Directory holding `ca_cert.pem` and `ca_key.pem`
  pub ca_storage_path: PathBuf,
  /// Terminate client TLS and look inside
  pub enable_interception: bool,
  /// Serve SOCKS4/5 clients on the same port
  pub enable_socks: bool,
  /// Maximum concurrent connections
  pub max_connections: usize,
  /// Upstream connect timeout
  pub connect_timeout: Option<Duration>,
  /// Read timeout on every socket
  pub read_timeout: Option<Duration>,
  /// Write timeout on every socket
  pub write_timeout: Option<Duration>,
  /// How long to wait for the client's first byte before tunneling blind
  pub sniff_timeout: Duration,
  /// Largest accepted message header
  pub max_header_size: usize,
  /// Largest body buffered in memory, request or response
  pub max_body_size: usize,
  /// Largest chunk written when re-chunking a body
  pub max_chunk_size: usize,
  /// Which upstream TLS certificates to accept
  pub upstream_trust: UpstreamTrust,
  /// How long a stopped listener waits for running connections
  pub shutdown_grace: Duration,
  /// Let a wildcard listener also match loopback targets in the loop guard
  pub loop_guard_all_interfaces: bool,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      ca_storage_path: PathBuf::from(".tapwire"),
      enable_interception: true,
      enable_socks: true,
      max_connections: 1000,
      connect_timeout: Some(Duration::from_secs(10)),
      read_timeout: Some(Duration::from_secs(30)),
      write_timeout: Some(Duration::from_secs(30)),
      sniff_timeout: Duration::from_millis(500),
      max_header_size: MAX_HEADER_SIZE,
      max_body_size: MAX_BODY_SIZE,
      max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
      upstream_trust: UpstreamTrust::default(),
      shutdown_grace: Duration::from_secs(5),
      loop_guard_all_interfaces: false,
    }
  }
}

/// Everything a connection needs from its proxy.
pub struct ProxyContext {
  config: ProxyConfig,
  context_selector: Option<Arc<dyn ContextSelector>>,
  monitor: GuardedMonitor,
  upstream_selector: Arc<dyn UpstreamSelector>,
  connector: Arc<Connector>,
  loop_guard: Arc<LoopGuard>,
  socks_server: SocksServer,
  ca: Option<Arc<CertificateAuthority>>,
  next_connection_id: AtomicU64,
}

impl ProxyContext {
  /// The configuration
  pub fn config(&self) -> &ProxyConfig {
    &self.config
  }
  /// Source of server certificates, when interception is possible
  pub fn context_selector(&self) -> Option<&Arc<dyn ContextSelector>> {
    self.context_selector.as_ref()
  }
  /// The local CA, when one was loaded
  pub fn ca(&self) -> Option<&Arc<CertificateAuthority>> {
    self.ca.as_ref()
  }
  pub(crate) fn monitor(&self) -> &GuardedMonitor {
    &self.monitor
  }
  /// Route for outbound connections
  pub fn upstream_selector(&self) -> &Arc<dyn UpstreamSelector> {
    &self.upstream_selector
  }
  /// Opens upstream connections
  pub fn connector(&self) -> &Arc<Connector> {
    &self.connector
  }
  /// Our own listening addresses
  pub fn loop_guard(&self) -> &Arc<LoopGuard> {
    &self.loop_guard
  }
  /// SOCKS handshake settings
  pub fn socks_server(&self) -> &SocksServer {
    &self.socks_server
  }
  /// Allocate a connection id
  pub fn next_connection_id(&self) -> u64 {
    self.next_connection_id.fetch_add(1, Ordering::Relaxed)
  }
  /// A fresh upstream client for one client connection
  pub fn upstream_client(&self) -> UpstreamClient {
    UpstreamClient::new(
      self.connector.clone(),
      self.upstream_selector.clone(),
      self.config.max_header_size,
    )
  }
}

/// Assembles a [`ProxyContext`] and a [`ProxyServer`] from their parts.
///
/// ```no_run
/// # async fn run() -> tapwire::Result<()> {
/// use std::sync::Arc;
/// use tapwire::{LoggingMonitor, ProxyBuilder, ProxyConfig};
///
/// let server = ProxyBuilder::new(ProxyConfig::default())
///   .monitor(Arc::new(LoggingMonitor))
///   .build()
///   .await?;
/// server.run("127.0.0.1:8008").await
/// # }
/// ```
pub struct ProxyBuilder {
  config: ProxyConfig,
  context_selector: Option<Arc<dyn ContextSelector>>,
  monitor: Arc<dyn ProxyMonitor>,
  upstream_selector: Arc<dyn UpstreamSelector>,
  authenticator: Arc<dyn Authenticator>,
}

impl Default for ProxyBuilder {
  fn default() -> Self {
    Self::new(ProxyConfig::default())
  }
}

impl ProxyBuilder {
  /// Builder with `config` and default collaborators: certificates from the
  /// CA in `ca_storage_path`, no monitoring, direct connections, no SOCKS
  /// authentication.
  pub fn new(config: ProxyConfig) -> Self {
    Self {
      config,
      context_selector: None,
      monitor: Arc::new(NoopMonitor),
      upstream_selector: Arc::new(Upstream::Direct),
      authenticator: Arc::new(NoAuthentication),
    }
  }
  /// Replace the configuration
  pub fn config(mut self, config: ProxyConfig) -> Self {
    self.config = config;
    self
  }
  /// Use `selector` instead of generating certificates from the local CA
  pub fn context_selector(mut self, selector: Arc<dyn ContextSelector>) -> Self {
    self.context_selector = Some(selector);
    self
  }
  /// Observe and rewrite traffic with `monitor`
  pub fn monitor(mut self, monitor: Arc<dyn ProxyMonitor>) -> Self {
    self.monitor = monitor;
    self
  }
  /// Route outbound connections with `selector`
  pub fn upstream_selector(mut self, selector: Arc<dyn UpstreamSelector>) -> Self {
    self.upstream_selector = selector;
    self
  }
  /// Authenticate SOCKS clients with `authenticator`
  pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
    self.authenticator = authenticator;
    self
  }

  /// Build the shared context. With interception on and no selector set,
  /// the CA is loaded from (or generated into) `ca_storage_path`.
  pub async fn build_context(self) -> Result<Arc<ProxyContext>> {
    let config = self.config;
    let mut ca = None;
    let context_selector = match self.context_selector {
      Some(selector) => Some(selector),
      None if config.enable_interception => {
        let authority = Arc::new(CertificateAuthority::load_or_generate(&config.ca_storage_path).await?);
        tracing::info!(
          "CA certificate at {}",
          CertificateAuthority::ca_cert_path(&config.ca_storage_path).display()
        );
        ca = Some(authority.clone());
        Some(Arc::new(AutoGeneratingContextSelector::new(authority)) as Arc<dyn ContextSelector>)
      }
      None => None,
    };
    let connector = ConnectorBuilder::default()
      .connect_timeout(config.connect_timeout)
      .read_timeout(config.read_timeout)
      .write_timeout(config.write_timeout)
      .trust(config.upstream_trust.clone())
      .build()?;
    Ok(Arc::new(ProxyContext {
      loop_guard: Arc::new(LoopGuard::new(config.loop_guard_all_interfaces)),
      config,
      context_selector,
      monitor: GuardedMonitor::new(self.monitor),
      upstream_selector: self.upstream_selector,
      connector: Arc::new(connector),
      socks_server: SocksServer::new(self.authenticator),
      ca,
      next_connection_id: AtomicU64::new(1),
    }))
  }

  /// Build a server running the standard pipeline.
  pub async fn build(self) -> Result<ProxyServer> {
    let ctx = self.build_context().await?;
    let pipeline = Pipeline::standard(ctx.clone());
    Ok(ProxyServer::new(ctx, pipeline))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_build_without_interception() {
    let config = ProxyConfig {
      enable_interception: false,
      enable_socks: false,
      ..Default::default()
    };
    let ctx = ProxyBuilder::new(config).build_context().await.unwrap();
    assert!(ctx.context_selector().is_none());
    assert!(ctx.ca().is_none());
    assert_eq!(ctx.next_connection_id(), 1);
    assert_eq!(ctx.next_connection_id(), 2);
    let pipeline = Pipeline::standard(ctx);
    assert_eq!(
      pipeline.stage_names(),
      vec!["connect", "loop-guard", "tls", "http"]
    );
  }

  #[tokio::test]
  async fn test_build_loads_ca() {
    let dir = std::env::temp_dir().join(format!("tapwire-proxy-{}", std::process::id()));
    let config = ProxyConfig {
      ca_storage_path: dir.clone(),
      ..Default::default()
    };
    let ctx = ProxyBuilder::new(config).build_context().await.unwrap();
    assert!(ctx.context_selector().is_some());
    assert!(ctx.ca().unwrap().ca_cert_pem().contains("BEGIN CERTIFICATE"));
    assert!(CertificateAuthority::ca_cert_path(&dir).exists());
    let _ = std::fs::remove_dir_all(dir);
  }
}
