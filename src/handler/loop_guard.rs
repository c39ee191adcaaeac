use super::{Connection, Outcome, Stage};
use crate::errors::{Error, Result};
use crate::proxy::ProxyContext;
use crate::target::TargetAddr;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

/// The proxy's own listening addresses, so that it never connects to
/// itself.
///
/// Matching is exact by default. With `all_interfaces`, a listener bound to
/// an unspecified address also matches loopback and unspecified targets on
/// the same port.
#[derive(Debug, Default)]
pub struct LoopGuard {
  listening: RwLock<HashSet<SocketAddr>>,
  all_interfaces: bool,
}

impl LoopGuard {
  /// Empty guard.
  pub fn new(all_interfaces: bool) -> Self {
    Self {
      listening: RwLock::new(HashSet::new()),
      all_interfaces,
    }
  }
  /// A listener started on `addr`.
  pub async fn register(&self, addr: SocketAddr) {
    self.listening.write().await.insert(addr);
  }
  /// The listener on `addr` stopped.
  pub async fn unregister(&self, addr: SocketAddr) {
    self.listening.write().await.remove(&addr);
  }
  /// Whether connecting to `addr` would reach one of our listeners.
  pub async fn is_listening(&self, addr: SocketAddr) -> bool {
    let listening = self.listening.read().await;
    listening.contains(&addr)
      || (self.all_interfaces
        && listening.iter().any(|l| {
          l.port() == addr.port()
            && l.ip().is_unspecified()
            && (addr.ip().is_loopback() || addr.ip().is_unspecified())
        }))
  }
  /// Fail with [`Error::LoopDetected`] when `target` resolves to one of
  /// our listeners. Targets that do not resolve pass.
  pub async fn check(&self, target: &TargetAddr) -> Result<()> {
    let Ok(addrs) = target.resolve().await else {
      return Ok(());
    };
    for addr in addrs {
      if self.is_listening(addr).await {
        tracing::warn!("refusing to connect to {} ({}): proxy loop", target, addr);
        return Err(Error::LoopDetected(target.to_string()));
      }
    }
    Ok(())
  }
}

/// Closes connections whose target is the proxy itself.
pub struct LoopGuardStage {
  ctx: Arc<ProxyContext>,
}

impl LoopGuardStage {
  /// new LoopGuardStage
  pub fn new(ctx: Arc<ProxyContext>) -> Self {
    Self { ctx }
  }
}

#[async_trait::async_trait]
impl Stage for LoopGuardStage {
  fn name(&self) -> &'static str {
    "loop-guard"
  }

  async fn handle(&self, connection: Connection) -> Result<Outcome> {
    if let Some(target) = connection.target() {
      if self.ctx.loop_guard().check(target).await.is_err() {
        return Ok(Outcome::Done);
      }
    }
    Ok(Outcome::Continue(connection))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_exact_match() {
    let guard = LoopGuard::new(false);
    let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
    guard.register(addr).await;
    assert!(guard.check(&TargetAddr::Ip(addr)).await.is_err());
    assert!(guard
      .check(&"127.0.0.1:8081".parse().unwrap())
      .await
      .is_ok());
    guard.unregister(addr).await;
    assert!(guard.check(&TargetAddr::Ip(addr)).await.is_ok());
  }

  #[tokio::test]
  async fn test_all_interfaces() {
    let any: SocketAddr = "0.0.0.0:8080".parse().unwrap();
    let loopback: SocketAddr = "127.0.0.1:8080".parse().unwrap();
    let exact = LoopGuard::new(false);
    exact.register(any).await;
    assert!(!exact.is_listening(loopback).await);
    let broad = LoopGuard::new(true);
    broad.register(any).await;
    assert!(broad.is_listening(loopback).await);
    assert!(!broad.is_listening("10.1.2.3:8080".parse().unwrap()).await);
  }

  #[tokio::test]
  async fn test_unresolvable_passes() {
    let guard = LoopGuard::new(true);
    let target = TargetAddr::Domain("does-not-exist.invalid".to_string(), 80);
    assert!(guard.check(&target).await.is_ok());
  }
}
