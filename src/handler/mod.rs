//! The per-connection pipeline.
//!
//! A [`Connection`] is handed from [`Stage`] to [`Stage`]. Each stage either
//! passes it on, possibly transformed (a SOCKS handshake sets the target,
//! TLS termination swaps the stream), or takes it over for good.
use crate::errors::Result;
use crate::io::PeekableStream;
use crate::proxy::ProxyContext;
use crate::socket::BoxedIo;
use crate::target::TargetAddr;
use crate::tunnel::spawn_tunnel;
use crate::upstream::target_uri;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

mod connect;
mod http;
mod loop_guard;
mod socks;
mod tls;

pub use connect::ConnectStage;
pub use http::HttpStage;
pub use loop_guard::{LoopGuard, LoopGuardStage};
pub use socks::SocksStage;
pub use tls::TlsStage;

/// TLS record type of a handshake message.
const TLS_HANDSHAKE: u8 = 0x16;

/// What the client seems to speak, judged from its first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
  /// A TLS handshake record
  Tls,
  /// Something starting like an HTTP request line
  Http,
  /// Anything else
  Unknown,
  /// Nothing arrived within the sniff timeout
  Silent,
  /// The client closed without sending anything
  Closed,
}

/// Everything about a connection except its stream.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionInfo {
  pub(crate) id: u64,
  pub(crate) peer: SocketAddr,
  pub(crate) local: SocketAddr,
  pub(crate) target: Option<TargetAddr>,
}

/// A client connection travelling through the pipeline.
pub struct Connection {
  id: u64,
  peer: SocketAddr,
  local: SocketAddr,
  stream: PeekableStream<BoxedIo>,
  target: Option<TargetAddr>,
  ssl: bool,
  protocol: Option<Protocol>,
}

impl fmt::Debug for Connection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Connection")
      .field("id", &self.id)
      .field("peer", &self.peer)
      .field("target", &self.target)
      .field("ssl", &self.ssl)
      .finish_non_exhaustive()
  }
}

impl Connection {
  /// A freshly accepted connection.
  pub fn new(id: u64, peer: SocketAddr, local: SocketAddr, stream: BoxedIo) -> Self {
    Self {
      id,
      peer,
      local,
      stream: PeekableStream::new(stream),
      target: None,
      ssl: false,
      protocol: None,
    }
  }
  /// Connection id, unique within a proxy.
  pub fn id(&self) -> u64 {
    self.id
  }
  /// Client address.
  pub fn peer(&self) -> SocketAddr {
    self.peer
  }
  /// Listening address the client connected to.
  pub fn local(&self) -> SocketAddr {
    self.local
  }
  /// Where the client wants to go, once known.
  pub fn target(&self) -> Option<&TargetAddr> {
    self.target.as_ref()
  }
  /// Record the target.
  pub fn set_target(&mut self, target: Option<TargetAddr>) {
    self.target = target;
  }
  /// `true` once TLS was terminated on this connection.
  pub fn is_ssl(&self) -> bool {
    self.ssl
  }
  /// The client stream.
  pub fn stream_mut(&mut self) -> &mut PeekableStream<BoxedIo> {
    &mut self.stream
  }
  /// Give up the client stream.
  pub fn into_stream(self) -> PeekableStream<BoxedIo> {
    self.stream
  }
  /// Take the stream out, e.g. to layer a TLS session over it; put the
  /// result back with [`Connection::reassemble`].
  pub(crate) fn disassemble(self) -> (ConnectionInfo, PeekableStream<BoxedIo>) {
    let info = ConnectionInfo {
      id: self.id,
      peer: self.peer,
      local: self.local,
      target: self.target,
    };
    (info, self.stream)
  }
  /// Rebuild a connection on a new stream. Sniff results are forgotten.
  pub(crate) fn reassemble(info: ConnectionInfo, stream: BoxedIo, ssl: bool) -> Self {
    Self {
      id: info.id,
      peer: info.peer,
      local: info.local,
      stream: PeekableStream::new(stream),
      target: info.target,
      ssl,
      protocol: None,
    }
  }
  /// Forget the cached sniff result after bytes were consumed.
  pub(crate) fn reset_protocol(&mut self) {
    self.protocol = None;
  }
  /// Guess the protocol from the first byte, waiting at most `timeout`.
  /// The result is cached until the stream changes.
  pub async fn sniff(&mut self, timeout: Duration) -> Result<Protocol> {
    if let Some(protocol) = self.protocol {
      return Ok(protocol);
    }
    let protocol = match tokio::time::timeout(timeout, self.stream.peek(1)).await {
      Err(_) => Protocol::Silent,
      Ok(peeked) => match peeked?.first() {
        None => Protocol::Closed,
        Some(&TLS_HANDSHAKE) => Protocol::Tls,
        Some(b) if b.is_ascii_uppercase() => Protocol::Http,
        Some(_) => Protocol::Unknown,
      },
    };
    tracing::trace!(connection = self.id, "sniffed {:?}", protocol);
    self.protocol = Some(protocol);
    Ok(protocol)
  }
  /// First byte, without waiting longer than `timeout`; `None` when nothing
  /// arrived.
  pub(crate) async fn peek_byte(&mut self, timeout: Duration) -> Result<Option<u8>> {
    match tokio::time::timeout(timeout, self.stream.peek(1)).await {
      Err(_) => Ok(None),
      Ok(peeked) => Ok(peeked?.first().copied()),
    }
  }
}

/// Result of one stage.
#[derive(Debug)]
pub enum Outcome {
  /// Hand the connection to the next stage
  Continue(Connection),
  /// The stage consumed the connection
  Done,
}

/// One step of connection handling.
#[async_trait::async_trait]
pub trait Stage: Send + Sync {
  /// Short name for logs.
  fn name(&self) -> &'static str;
  /// Handle `connection`.
  async fn handle(&self, connection: Connection) -> Result<Outcome>;
}

/// Ordered list of stages.
#[derive(Clone, Default)]
pub struct Pipeline {
  stages: Vec<Arc<dyn Stage>>,
}

impl Pipeline {
  /// Empty pipeline.
  pub fn new() -> Self {
    Self::default()
  }
  /// Append a stage.
  pub fn with(mut self, stage: Arc<dyn Stage>) -> Self {
    self.stages.push(stage);
    self
  }
  /// The standard chain: SOCKS (when enabled), CONNECT, loop guard, TLS,
  /// HTTP.
  pub fn standard(ctx: Arc<ProxyContext>) -> Self {
    let mut pipeline = Pipeline::new();
    if ctx.config().enable_socks {
      pipeline = pipeline.with(Arc::new(SocksStage::new(ctx.clone())));
    }
    pipeline
      .with(Arc::new(ConnectStage::new(ctx.clone())))
      .with(Arc::new(LoopGuardStage::new(ctx.clone())))
      .with(Arc::new(TlsStage::new(ctx.clone())))
      .with(Arc::new(HttpStage::new(ctx)))
  }
  /// Names of the stages, in order.
  pub fn stage_names(&self) -> Vec<&'static str> {
    self.stages.iter().map(|s| s.name()).collect()
  }
  /// Run `connection` through the stages.
  pub async fn run(&self, mut connection: Connection) -> Result<()> {
    let id = connection.id();
    for stage in &self.stages {
      match stage.handle(connection).await {
        Ok(Outcome::Continue(next)) => connection = next,
        Ok(Outcome::Done) => return Ok(()),
        Err(e) => {
          tracing::debug!(connection = id, "{} stage failed: {}", stage.name(), e);
          return Err(e);
        }
      }
    }
    tracing::debug!(connection = id, "no stage took the connection");
    Ok(())
  }
}

/// Connect to the connection's target and pump bytes untouched.
pub(crate) async fn pass_through(ctx: &ProxyContext, connection: Connection) -> Result<Outcome> {
  let Some(target) = connection.target().cloned() else {
    tracing::debug!(
      connection = connection.id(),
      "unknown protocol and no target, closing"
    );
    return Ok(Outcome::Done);
  };
  let upstream = ctx.upstream_selector().select(&target_uri(&target, false)?);
  let server = ctx.connector().connect(&upstream, &target).await?;
  tracing::debug!(connection = connection.id(), "tunneling to {}", target);
  spawn_tunnel(connection.id(), connection.into_stream(), server);
  Ok(Outcome::Done)
}
