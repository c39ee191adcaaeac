use super::{Connection, Outcome, Protocol, Stage};
use crate::errors::{Error, Result};
use crate::message::read_header;
use crate::proxy::ProxyContext;
use crate::request::Request;
use crate::response::Response;
use crate::target::TargetAddr;
use http::StatusCode;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};

const CONNECT_PREFIX: &[u8] = b"CONNECT ";
const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// Answers `CONNECT host:port` and records the target. A target that is
/// the proxy itself gets `508 Loop Detected`.
pub struct ConnectStage {
  ctx: Arc<ProxyContext>,
}

impl ConnectStage {
  /// new ConnectStage
  pub fn new(ctx: Arc<ProxyContext>) -> Self {
    Self { ctx }
  }
}

#[async_trait::async_trait]
impl Stage for ConnectStage {
  fn name(&self) -> &'static str {
    "connect"
  }

  async fn handle(&self, mut connection: Connection) -> Result<Outcome> {
    if connection.target().is_some() {
      return Ok(Outcome::Continue(connection));
    }
    if connection.sniff(self.ctx.config().sniff_timeout).await? != Protocol::Http {
      return Ok(Outcome::Continue(connection));
    }
    let peeked = connection.stream_mut().peek(CONNECT_PREFIX.len()).await?;
    if peeked.len() < CONNECT_PREFIX.len()
      || !peeked[..CONNECT_PREFIX.len()].eq_ignore_ascii_case(CONNECT_PREFIX)
    {
      return Ok(Outcome::Continue(connection));
    }

    let id = connection.id();
    let max_header_size = self.ctx.config().max_header_size;
    let stream = connection.stream_mut();
    let (header, leftover) = {
      let mut reader = BufReader::new(&mut *stream);
      let header = read_header(&mut reader, max_header_size).await;
      (header, reader.buffer().to_vec())
    };
    stream.unread(&leftover);
    let target = header.and_then(|header| {
      let header = header.ok_or_else(|| Error::protocol_violation("closed during CONNECT"))?;
      let request = Request::from_header(header)?;
      TargetAddr::parse_authority(&request.resource(), Some(443))
    });
    let target = match target {
      Ok(target) => self.ctx.loop_guard().check(&target).await.map(|_| target),
      Err(e) => Err(e),
    };
    match target {
      Ok(target) => {
        stream.write_all(ESTABLISHED).await?;
        stream.flush().await?;
        tracing::debug!(connection = id, "CONNECT {}", target);
        connection.reset_protocol();
        connection.set_target(Some(target));
        Ok(Outcome::Continue(connection))
      }
      Err(e) => {
        tracing::debug!(connection = id, "refusing CONNECT: {}", e);
        let status = match e {
          Error::LoopDetected(_) => StatusCode::LOOP_DETECTED,
          _ => StatusCode::BAD_REQUEST,
        };
        let response = Response::error(status);
        let _ = stream.write_all(&response.to_bytes()).await;
        let _ = stream.shutdown().await;
        Ok(Outcome::Done)
      }
    }
  }
}
