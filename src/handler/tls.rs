use super::{pass_through, Connection, Outcome, Protocol, Stage};
use crate::errors::Result;
use crate::proxy::ProxyContext;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Terminates client TLS with a certificate for the target host, or tunnels
/// the encrypted bytes when interception is off.
pub struct TlsStage {
  ctx: Arc<ProxyContext>,
}

impl TlsStage {
  /// new TlsStage
  pub fn new(ctx: Arc<ProxyContext>) -> Self {
    Self { ctx }
  }
}

#[async_trait::async_trait]
impl Stage for TlsStage {
  fn name(&self) -> &'static str {
    "tls"
  }

  async fn handle(&self, mut connection: Connection) -> Result<Outcome> {
    if connection.sniff(self.ctx.config().sniff_timeout).await? != Protocol::Tls {
      return Ok(Outcome::Continue(connection));
    }
    let selector = match self.ctx.context_selector() {
      Some(selector) if self.ctx.config().enable_interception => selector,
      _ => return pass_through(&self.ctx, connection).await,
    };
    let Some(target) = connection.target().cloned() else {
      tracing::debug!(
        connection = connection.id(),
        "tls without a known target, closing"
      );
      return Ok(Outcome::Done);
    };
    let config = selector.select(&target).await?;
    let (info, stream) = connection.disassemble();
    match TlsAcceptor::from(config).accept(stream).await {
      Ok(tls) => {
        tracing::debug!(connection = info.id, "intercepting tls for {}", target);
        Ok(Outcome::Continue(Connection::reassemble(
          info,
          Box::new(tls),
          true,
        )))
      }
      Err(e) => {
        // clients that do not trust the CA abort here
        tracing::debug!(connection = info.id, "tls handshake with client for {} failed: {}", target, e);
        Ok(Outcome::Done)
      }
    }
  }
}
