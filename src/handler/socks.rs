use super::{Connection, Outcome, Stage};
use crate::errors::Result;
use crate::proxy::ProxyContext;
use crate::socks::consts::{SOCKS4_VERSION, SOCKS5_VERSION};
use std::sync::Arc;

/// Serves SOCKS4, SOCKS4a and SOCKS5 clients on the shared port. Anything
/// else passes through untouched.
pub struct SocksStage {
  ctx: Arc<ProxyContext>,
}

impl SocksStage {
  /// new SocksStage
  pub fn new(ctx: Arc<ProxyContext>) -> Self {
    Self { ctx }
  }
}

#[async_trait::async_trait]
impl Stage for SocksStage {
  fn name(&self) -> &'static str {
    "socks"
  }

  async fn handle(&self, mut connection: Connection) -> Result<Outcome> {
    if connection.target().is_some() {
      return Ok(Outcome::Continue(connection));
    }
    let sniff_timeout = self.ctx.config().sniff_timeout;
    match connection.peek_byte(sniff_timeout).await? {
      Some(SOCKS4_VERSION | SOCKS5_VERSION) => {}
      _ => return Ok(Outcome::Continue(connection)),
    }
    let id = connection.id();
    let server = self.ctx.socks_server();
    let mut handshake = server.handshake(connection.stream_mut());
    let message = match handshake.read_request().await {
      Ok(message) => message,
      Err(e) => {
        tracing::debug!(connection = id, "socks handshake failed: {}", e);
        return Ok(Outcome::Done);
      }
    };
    let target = message.target();
    if let Err(e) = self.ctx.loop_guard().check(&target).await {
      let _ = handshake.reply_error(&e).await;
      return Ok(Outcome::Done);
    }
    handshake.reply_success(None).await?;
    tracing::debug!(
      connection = id,
      "socks{} connect to {}",
      message.version(),
      target
    );
    connection.reset_protocol();
    connection.set_target(Some(target));
    Ok(Outcome::Continue(connection))
  }
}
