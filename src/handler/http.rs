use super::{pass_through, Connection, Outcome, Protocol, Stage};
use crate::body::{read_body, stream_body, CopyError};
use crate::client::UpstreamClient;
use crate::conversation::Conversation;
use crate::errors::{Error, Result};
use crate::io::chunked;
use crate::message::{read_header, Framing};
use crate::proxy::ProxyContext;
use crate::request::Request;
use crate::response::Response;
use crate::socket::BoxedIo;
use crate::target::TargetAddr;
use crate::tunnel::spawn_tunnel;
use bytes::Bytes;
use http::StatusCode;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader};

const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// What happens to the client connection after one exchange.
enum Next {
  KeepAlive,
  Close,
  /// `101 Switching Protocols`: pump raw bytes from now on
  Upgrade(BoxedIo, Vec<u8>),
}

/// Proxies HTTP/1.x requests, plain or on an intercepted TLS session, with
/// the monitor hooks in between.
pub struct HttpStage {
  ctx: Arc<ProxyContext>,
}

impl HttpStage {
  /// new HttpStage
  pub fn new(ctx: Arc<ProxyContext>) -> Self {
    Self { ctx }
  }

  async fn serve(&self, mut connection: Connection) -> Result<Outcome> {
    let id = connection.id();
    let ssl = connection.is_ssl();
    let default_target = connection.target().cloned();
    let mut upstream = self.ctx.upstream_client();
    let mut client = BufReader::new(connection.stream_mut());
    let next = loop {
      match self
        .exchange(id, ssl, default_target.as_ref(), &mut client, &mut upstream)
        .await
      {
        Ok(Next::KeepAlive) => continue,
        Ok(next) => break next,
        Err(e) => {
          tracing::debug!(connection = id, "http exchange failed: {}", e);
          break Next::Close;
        }
      }
    };
    match next {
      Next::Upgrade(server, buffered) => {
        let leftover = client.buffer().to_vec();
        drop(client);
        let mut stream = connection.into_stream();
        stream.unread(&leftover);
        if !buffered.is_empty() {
          stream.write_all(&buffered).await?;
        }
        tracing::debug!(connection = id, "protocol switched, tunneling");
        spawn_tunnel(id, stream, server);
      }
      _ => {
        let _ = client.shutdown().await;
      }
    }
    Ok(Outcome::Done)
  }

  /// One request and its response.
  async fn exchange<C>(
    &self,
    id: u64,
    ssl: bool,
    default_target: Option<&TargetAddr>,
    client: &mut C,
    upstream: &mut UpstreamClient,
  ) -> Result<Next>
  where
    C: AsyncBufRead + AsyncWrite + Unpin + Send,
  {
    let monitor = self.ctx.monitor();
    let header = match read_header(client, self.ctx.config().max_header_size).await {
      Ok(Some(header)) => header,
      Ok(None) => return Ok(Next::Close),
      Err(e) => return self.reject(client, None, e).await,
    };
    let mut request = match Request::from_header(header) {
      Ok(request) => request,
      Err(e) => return self.reject(client, None, e).await,
    };
    request.set_ssl(ssl);
    request.set_target(default_target.cloned());
    if let Err(e) = resolve_target(&mut request) {
      return self.reject(client, Some(&request), e).await;
    }
    if request.is_connect() {
      let e = Error::protocol_violation("CONNECT inside an established connection");
      return self.reject(client, Some(&request), e).await;
    }
    if request.target() != default_target {
      if let Some(target) = request.target() {
        if self.ctx.loop_guard().check(target).await.is_err() {
          write_response(client, &Response::error(StatusCode::LOOP_DETECTED)).await?;
          return Ok(Next::Close);
        }
      }
    }

    let expects_continue = request
      .header_value("Expect")
      .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"));
    if expects_continue {
      request.delete_header("Expect")?;
      client.write_all(CONTINUE).await?;
      client.flush().await?;
    }
    let body = match request.framing() {
      Ok(framing) => read_body(client, framing, self.ctx.config().max_body_size).await,
      Err(e) => Err(e),
    };
    match body {
      Ok(content) => request.set_content(content),
      Err(e) => return self.reject(client, Some(&request), e).await,
    }

    let client_persistent = request.is_persistent();
    tracing::debug!(
      connection = id,
      "{} {}",
      request.method(),
      request.uri().map(|u| u.to_string()).unwrap_or_default()
    );
    let mut conversation = Conversation::new(id, request);
    if let Some(response) = monitor.request_received(&mut conversation).await {
      let persistent = client_persistent && response.is_persistent();
      conversation.set_response(response);
      conversation.mark_response_content();
      return self.deliver(client, &mut conversation, persistent).await;
    }

    conversation.mark_request_sent();
    let response = match upstream.send(conversation.request()).await {
      Ok(response) => response,
      Err(e) => return self.upstream_failed(client, upstream, &conversation, e).await,
    };
    let method = conversation.request().method();
    if response.status()? == 101 {
      write_header(client, &response).await?;
      conversation.set_response(response);
      monitor.wrote_response_to_client(&conversation).await;
      return Ok(match upstream.take_stream() {
        Some((server, buffered)) => Next::Upgrade(server, buffered),
        None => Next::Close,
      });
    }
    let framing = match response.framing(&method) {
      Ok(framing) => framing,
      Err(e) => return self.upstream_failed(client, upstream, &conversation, e).await,
    };
    let reusable = response.is_persistent() && framing != Framing::UntilClose;
    let persistent = client_persistent && reusable;
    conversation.set_response(response);

    if monitor.response_header_received(&mut conversation).await {
      self
        .stream(client, upstream, &mut conversation, framing, reusable, persistent)
        .await
    } else {
      let body = match upstream.body_reader() {
        Ok(reader) => read_body(reader, framing, self.ctx.config().max_body_size).await,
        Err(e) => Err(e),
      };
      match body {
        Ok(content) => {
          upstream.release(reusable);
          if let Some(response) = conversation.response_mut() {
            response.set_content(content);
          }
          conversation.mark_response_content();
          monitor
            .response_content_received(&mut conversation, false)
            .await;
          let mut persistent = persistent;
          if framing == Framing::UntilClose && client_persistent {
            if let Some(response) = conversation.response_mut() {
              persistent = rechunk(response, self.ctx.config().max_chunk_size).await?;
            }
          }
          self.deliver(client, &mut conversation, persistent).await
        }
        Err(e) => {
          upstream.close();
          let response = monitor
            .error_fetching_response_content(&conversation, &e)
            .await
            .unwrap_or_else(|| Response::error(StatusCode::BAD_GATEWAY));
          conversation.set_response(response);
          self.deliver(client, &mut conversation, false).await
        }
      }
    }
  }

  /// Copy the response to the client as it arrives.
  async fn stream<C>(
    &self,
    client: &mut C,
    upstream: &mut UpstreamClient,
    conversation: &mut Conversation,
    framing: Framing,
    reusable: bool,
    persistent: bool,
  ) -> Result<Next>
  where
    C: AsyncBufRead + AsyncWrite + Unpin + Send,
  {
    let monitor = self.ctx.monitor();
    let header = match conversation.response() {
      Some(response) => response.header().clone(),
      None => return Ok(Next::Close),
    };
    if let Err(e) = client.write_all(&header).await {
      upstream.close();
      monitor
        .error_writing_response_to_client(conversation, &e.into())
        .await;
      return Ok(Next::Close);
    }
    let copied = stream_body(upstream.body_reader()?, framing, client).await;
    match copied {
      Ok(content) => {
        upstream.release(reusable);
        if let Some(response) = conversation.response_mut() {
          response.set_content((framing != Framing::Empty).then_some(content));
        }
        conversation.mark_response_content();
        monitor.response_content_received(conversation, true).await;
        monitor.wrote_response_to_client(conversation).await;
        Ok(if persistent { Next::KeepAlive } else { Next::Close })
      }
      Err(CopyError::Read(e)) => {
        upstream.close();
        // the header is already out, a substitute cannot be sent
        let _ = monitor.error_fetching_response_content(conversation, &e).await;
        Ok(Next::Close)
      }
      Err(CopyError::Write(e)) => {
        upstream.close();
        monitor.error_writing_response_to_client(conversation, &e).await;
        Ok(Next::Close)
      }
    }
  }

  /// Write the conversation's response in one piece.
  async fn deliver<C>(
    &self,
    client: &mut C,
    conversation: &mut Conversation,
    persistent: bool,
  ) -> Result<Next>
  where
    C: AsyncWrite + Unpin + Send,
  {
    let monitor = self.ctx.monitor();
    let method = conversation.request().method();
    let Some(response) = conversation.response_mut() else {
      return Ok(Next::Close);
    };
    drop_forbidden_content(response, &method)?;
    match write_response(client, response).await {
      Ok(()) => {
        monitor.wrote_response_to_client(conversation).await;
        Ok(if persistent { Next::KeepAlive } else { Next::Close })
      }
      Err(e) => {
        monitor.error_writing_response_to_client(conversation, &e).await;
        Ok(Next::Close)
      }
    }
  }

  async fn upstream_failed<C>(
    &self,
    client: &mut C,
    upstream: &mut UpstreamClient,
    conversation: &Conversation,
    error: Error,
  ) -> Result<Next>
  where
    C: AsyncWrite + Unpin + Send,
  {
    upstream.close();
    let mut response = self
      .ctx
      .monitor()
      .error_fetching_response_header(conversation, &error)
      .await
      .unwrap_or_else(|| Response::error(StatusCode::BAD_GATEWAY));
    drop_forbidden_content(&mut response, &conversation.request().method())?;
    let _ = write_response(client, &response).await;
    Ok(Next::Close)
  }

  /// Answer a request that could not be read, then close.
  async fn reject<C>(&self, client: &mut C, request: Option<&Request>, error: Error) -> Result<Next>
  where
    C: AsyncWrite + Unpin + Send,
  {
    let response = self
      .ctx
      .monitor()
      .error_reading_request(request, &error)
      .await
      .unwrap_or_else(|| Response::error(StatusCode::BAD_REQUEST));
    let _ = write_response(client, &response).await;
    Ok(Next::Close)
  }
}

#[async_trait::async_trait]
impl Stage for HttpStage {
  fn name(&self) -> &'static str {
    "http"
  }

  async fn handle(&self, mut connection: Connection) -> Result<Outcome> {
    match connection.sniff(self.ctx.config().sniff_timeout).await? {
      Protocol::Http => self.serve(connection).await,
      Protocol::Closed => Ok(Outcome::Done),
      _ => pass_through(&self.ctx, connection).await,
    }
  }
}

/// Settle target and SSL flag: an absolute URI wins, then the connection's
/// target, then the `Host` header.
fn resolve_target(request: &mut Request) -> Result<()> {
  if request.normalize_absolute()? || request.target().is_some() {
    return Ok(());
  }
  match request.host_target()? {
    Some(target) => {
      request.set_target(Some(target));
      Ok(())
    }
    None => Err(Error::message_format("request names no host")),
  }
}

/// Give a close-delimited body chunked framing, so the client connection
/// can outlive it. Returns whether the response was reframed.
/// Substitutes and rewritten responses may carry a body where the request
/// method or status rules one out; it must not reach the client.
fn drop_forbidden_content(response: &mut Response, request_method: &str) -> Result<()> {
  if response.has_content(request_method) {
    return Ok(());
  }
  let status = response.status()?;
  if response.content().is_some_and(|c| !c.is_empty()) {
    tracing::debug!("dropping body of a {} response to {}", status, request_method);
  }
  response.set_content(None);
  // HEAD and 304 may describe the body they omit
  if status == 204 || (100..200).contains(&status) {
    response.delete_header("Content-Length")?;
    response.delete_header("Transfer-Encoding")?;
  }
  Ok(())
}

async fn rechunk(response: &mut Response, max_chunk_size: usize) -> Result<bool> {
  if !response.is_persistent()
    || !response.version().eq_ignore_ascii_case("HTTP/1.1")
    || response.content_length()?.is_some()
  {
    return Ok(false);
  }
  let content = response.take_content().unwrap_or_default();
  let encoded = chunked::encode(&content, max_chunk_size).await?;
  response.set_header_value("Transfer-Encoding", "chunked")?;
  response.set_content(Some(Bytes::from(encoded)));
  Ok(true)
}

async fn write_header<W: AsyncWrite + Unpin>(writer: &mut W, response: &Response) -> Result<()> {
  writer.write_all(response.header()).await?;
  writer.flush().await?;
  Ok(())
}

async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, response: &Response) -> Result<()> {
  writer.write_all(&response.to_bytes()).await?;
  writer.flush().await?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::message::NamedValue;

  #[test]
  fn test_resolve_target() {
    let mut request =
      Request::from_header(&b"GET http://example.com:8080/a HTTP/1.1\r\n\r\n"[..]).unwrap();
    resolve_target(&mut request).unwrap();
    assert_eq!(request.target().unwrap().to_string(), "example.com:8080");
    assert_eq!(request.resource(), "/a");

    let mut request =
      Request::from_header(&b"GET /b HTTP/1.1\r\nHost: example.org\r\n\r\n"[..]).unwrap();
    resolve_target(&mut request).unwrap();
    assert_eq!(request.target().unwrap().port(), 80);

    let mut request = Request::from_header(&b"GET /b HTTP/1.1\r\nHost: example.org\r\n\r\n"[..]).unwrap();
    request.set_ssl(true);
    resolve_target(&mut request).unwrap();
    assert_eq!(request.target().unwrap().port(), 443);

    let mut request = Request::from_header(&b"GET /c HTTP/1.0\r\n\r\n"[..]).unwrap();
    assert!(resolve_target(&mut request).is_err());
  }

  #[test]
  fn test_drop_forbidden_content() {
    let body = Some(Bytes::from_static(b"stray"));
    let mut no_content = Response::build(
      StatusCode::NO_CONTENT,
      &[NamedValue::header("Content-Length", "5")],
      body.clone(),
    );
    drop_forbidden_content(&mut no_content, "GET").unwrap();
    assert!(no_content.content().is_none());
    assert!(no_content.header_value("Content-Length").is_none());

    let mut head = Response::build(StatusCode::OK, &[NamedValue::header("Content-Length", "5")], body.clone());
    drop_forbidden_content(&mut head, "HEAD").unwrap();
    assert!(head.content().is_none());
    assert_eq!(head.header_value("Content-Length").as_deref(), Some("5"));

    let mut ok = Response::build(StatusCode::OK, &[NamedValue::header("Content-Length", "5")], body);
    drop_forbidden_content(&mut ok, "GET").unwrap();
    assert_eq!(ok.content().unwrap().as_ref(), b"stray");
  }

  #[tokio::test]
  async fn test_rechunk_close_delimited() {
    let mut response = Response::from_header(&b"HTTP/1.1 200 OK\r\n\r\n"[..]).unwrap();
    response.set_content(Some(Bytes::from_static(b"hello world")));
    assert!(rechunk(&mut response, 4).await.unwrap());
    assert!(response.is_chunked());
    assert_eq!(
      response.content().unwrap().as_ref(),
      b"4\r\nhell\r\n4\r\no wo\r\n3\r\nrld\r\n0\r\n\r\n"
    );
    assert_eq!(
      response.decoded_content().await.unwrap().unwrap().as_ref(),
      b"hello world"
    );

    let mut closing =
      Response::from_header(&b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n"[..]).unwrap();
    closing.set_content(Some(Bytes::from_static(b"x")));
    assert!(!rechunk(&mut closing, 4).await.unwrap());
    assert_eq!(closing.content().unwrap().as_ref(), b"x");
  }
}
