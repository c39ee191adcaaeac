//! The upstream side of an HTTP exchange.
//!
//! One [`UpstreamClient`] serves one client connection and keeps at most one
//! upstream connection, reused while target, TLS flag and route stay the
//! same and the previous exchange left it persistent.
use crate::connector::Connector;
use crate::errors::{Error, Result};
use crate::message::read_header;
use crate::request::Request;
use crate::response::Response;
use crate::socket::BoxedIo;
use crate::target::TargetAddr;
use crate::upstream::{Upstream, UpstreamSelector};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};

struct UpstreamConnection {
  target: TargetAddr,
  ssl: bool,
  upstream: Upstream,
  reader: BufReader<BoxedIo>,
  idle: bool,
}

/// Sends requests upstream and reads the responses back.
pub struct UpstreamClient {
  connector: Arc<Connector>,
  selector: Arc<dyn UpstreamSelector>,
  max_header_size: usize,
  current: Option<UpstreamConnection>,
}

impl UpstreamClient {
  /// Client opening connections with `connector`, routed by `selector`.
  pub fn new(
    connector: Arc<Connector>,
    selector: Arc<dyn UpstreamSelector>,
    max_header_size: usize,
  ) -> Self {
    Self {
      connector,
      selector,
      max_header_size,
      current: None,
    }
  }

  /// Whether an idle upstream connection is held.
  pub fn is_connected(&self) -> bool {
    self.current.as_ref().is_some_and(|c| c.idle)
  }

  /// Send `request` (header and buffered body) and return the final
  /// response header. Interim `1xx` responses other than `101` are skipped.
  pub async fn send(&mut self, request: &Request) -> Result<Response> {
    let target = request
      .target()
      .cloned()
      .ok_or_else(|| Error::message_format("request has no target"))?;
    let reused = self.prepare(&target, request).await?;
    match self.exchange(request).await {
      Ok(Some(response)) => Ok(response),
      Ok(None) if reused => {
        tracing::debug!("reused connection to {} was closed, reconnecting", target);
        self.current = None;
        self.prepare(&target, request).await?;
        self.exchange(request).await?.ok_or_else(upstream_closed)
      }
      Ok(None) => {
        self.current = None;
        Err(upstream_closed())
      }
      Err(e) => {
        self.current = None;
        Err(e)
      }
    }
  }

  /// The upstream stream positioned at the response body.
  pub fn body_reader(&mut self) -> Result<&mut BufReader<BoxedIo>> {
    self
      .current
      .as_mut()
      .map(|c| &mut c.reader)
      .ok_or_else(|| Error::protocol_violation("no upstream connection"))
  }

  /// Finish the current exchange, keeping the connection when `reusable`.
  pub fn release(&mut self, reusable: bool) {
    match &mut self.current {
      Some(connection) if reusable => connection.idle = true,
      _ => self.current = None,
    }
  }

  /// Drop the upstream connection.
  pub fn close(&mut self) {
    self.current = None;
  }

  /// Take the upstream stream out, e.g. after `101 Switching Protocols`,
  /// with whatever was already read from it past the response header.
  pub fn take_stream(&mut self) -> Option<(BoxedIo, Vec<u8>)> {
    self.current.take().map(|connection| {
      let buffered = connection.reader.buffer().to_vec();
      (connection.reader.into_inner(), buffered)
    })
  }

  async fn prepare(&mut self, target: &TargetAddr, request: &Request) -> Result<bool> {
    let uri = request.uri()?;
    let ssl = request.is_ssl();
    if let Some(connection) = &self.current {
      if connection.idle && connection.target == *target && connection.ssl == ssl {
        let upstream = self.selector.select(&uri);
        if upstream == connection.upstream {
          if let Some(connection) = &mut self.current {
            connection.idle = false;
          }
          return Ok(true);
        }
      }
    }
    self.current = None;
    let upstream = self.selector.select(&uri);
    let stream = match (&upstream, ssl) {
      // plain HTTP through an HTTP proxy goes to the proxy itself
      (Upstream::Http { addr, .. }, false) => {
        Box::new(self.connector.connect_tcp(addr).await?) as BoxedIo
      }
      _ => self.connector.connect(&upstream, target).await?,
    };
    let stream = if ssl {
      self.connector.upgrade_to_tls(stream, &target.host()).await?
    } else {
      stream
    };
    tracing::debug!("opened upstream connection to {} via {}", target, upstream);
    self.current = Some(UpstreamConnection {
      target: target.clone(),
      ssl,
      upstream,
      reader: BufReader::new(stream),
      idle: false,
    });
    Ok(false)
  }

  async fn exchange(&mut self, request: &Request) -> Result<Option<Response>> {
    let max_header_size = self.max_header_size;
    let connection = self
      .current
      .as_mut()
      .ok_or_else(|| Error::protocol_violation("no upstream connection"))?;
    let wire = match (&connection.upstream, connection.ssl) {
      (Upstream::Http { auth, .. }, false) => {
        let mut request = request.clone();
        request.set_resource(&request.uri()?.to_string())?;
        if let Some(auth) = auth {
          request.set_header_value("Proxy-Authorization", &auth.basic_auth())?;
        }
        request.to_bytes()
      }
      _ => request.to_bytes(),
    };
    let stream = connection.reader.get_mut();
    if let Err(e) = stream.write_all(&wire).await {
      tracing::debug!("writing request upstream failed: {}", e);
      return Ok(None);
    }
    stream.flush().await?;
    loop {
      let Some(header) = read_header(&mut connection.reader, max_header_size).await? else {
        return Ok(None);
      };
      let response = Response::from_header(header)?;
      if response.is_interim() && response.status()? != 101 {
        tracing::trace!("skipping interim response {}", response.start_line());
        continue;
      }
      return Ok(Some(response));
    }
  }
}

fn upstream_closed() -> Error {
  Error::protocol_violation("upstream closed before sending a response")
}
