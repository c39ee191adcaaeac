//! End-to-end tests: a real listener, loopback upstream servers and raw
//! client sockets.
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tapwire::body::{read_body, MAX_BODY_SIZE};
use tapwire::io::chunked;
use tapwire::message::{read_header, MAX_HEADER_SIZE};
use tapwire::tls::{server_config, KeyManager};
use tapwire::{
  AutoGeneratingContextSelector, CertificateAuthority, Conversation, ConversationRecorder, Error,
  Listener, MonitorSet, NamedValue, ProxyBuilder, ProxyConfig, ProxyMonitor, Request, Response,
  StatusCode,
};
use tokio::io::{AsyncBufRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::{TlsAcceptor, TlsConnector};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn plain_config() -> ProxyConfig {
  ProxyConfig {
    enable_interception: false,
    sniff_timeout: Duration::from_millis(200),
    ..Default::default()
  }
}

async fn start_proxy(builder: ProxyBuilder) -> Listener {
  let server = builder.build().await.unwrap();
  server.listen("127.0.0.1:0").await.unwrap()
}

async fn read_request<R: AsyncBufRead + Unpin>(reader: &mut R) -> Option<Request> {
  let header = read_header(reader, MAX_HEADER_SIZE).await.ok()??;
  let mut request = Request::from_header(header).ok()?;
  let body = read_body(reader, request.framing().ok()?, MAX_BODY_SIZE).await.ok()?;
  request.set_content(body);
  Some(request)
}

async fn read_response<R: AsyncBufRead + Unpin>(reader: &mut R, method: &str) -> Response {
  let header = read_header(reader, MAX_HEADER_SIZE).await.unwrap().unwrap();
  let mut response = Response::from_header(header).unwrap();
  let body = read_body(reader, response.framing(method).unwrap(), MAX_BODY_SIZE)
    .await
    .unwrap();
  response.set_content(body);
  response
}

fn text_response(status: StatusCode, body: &str) -> Response {
  Response::build(
    status,
    &[NamedValue::header("Content-Length", body.len().to_string())],
    Some(Bytes::from(body.to_string())),
  )
}

/// Plain HTTP server answering every request on a connection with
/// `handler`.
async fn spawn_upstream<F>(handler: F) -> SocketAddr
where
  F: Fn(Request) -> Response + Send + Sync + 'static,
{
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let handler = Arc::new(handler);
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      let handler = handler.clone();
      tokio::spawn(async move {
        let mut stream = BufReader::new(stream);
        while let Some(request) = read_request(&mut stream).await {
          let response = handler(request);
          if stream.get_mut().write_all(&response.to_bytes()).await.is_err() {
            return;
          }
        }
      });
    }
  });
  addr
}

#[tokio::test]
async fn test_socks4_chunked_echo() {
  let upstream = spawn_upstream(|request| {
    Response::build(
      StatusCode::OK,
      &[NamedValue::header("Transfer-Encoding", "chunked")],
      request.content().cloned(),
    )
  })
  .await;
  let listener = start_proxy(ProxyBuilder::new(plain_config())).await;
  let SocketAddr::V4(target) = upstream else {
    panic!("expected an IPv4 upstream");
  };

  let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
  let mut hello = vec![0x04, 0x01];
  hello.extend_from_slice(&target.port().to_be_bytes());
  hello.extend_from_slice(&target.ip().octets());
  hello.extend_from_slice(b"tester\0");
  client.write_all(&hello).await.unwrap();
  let mut reply = [0u8; 8];
  client.read_exact(&mut reply).await.unwrap();
  assert_eq!(reply[..2], [0x00, 0x5A]);
  assert_eq!(reply[2..4], target.port().to_be_bytes());
  assert_eq!(reply[4..], target.ip().octets());

  let body: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
  let mut request = b"POST /echo HTTP/1.1\r\nHost: echo\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
  request.extend_from_slice(&chunked::encode(&body, 777).await.unwrap());
  client.write_all(&request).await.unwrap();

  let mut reader = BufReader::new(client);
  let response = tokio::time::timeout(TEST_TIMEOUT, read_response(&mut reader, "POST"))
    .await
    .unwrap();
  assert_eq!(response.status().unwrap(), 200);
  assert!(response.is_chunked());
  let echoed = response.decoded_content().await.unwrap().unwrap();
  assert_eq!(echoed.as_ref(), &body[..]);
  listener.stop().await;
}

#[tokio::test]
async fn test_socks5_origin_echoes_request_bytes() {
  // the origin answers with the exact bytes it received, chunked
  let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let SocketAddr::V4(target) = origin.local_addr().unwrap() else {
    panic!("expected an IPv4 origin");
  };
  let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();
  tokio::spawn(async move {
    let (stream, _) = origin.accept().await.unwrap();
    let mut stream = BufReader::new(stream);
    let received = read_header(&mut stream, MAX_HEADER_SIZE).await.unwrap().unwrap();
    let body = chunked::encode(&received, 8).await.unwrap();
    let response = Response::build(
      StatusCode::OK,
      &[NamedValue::header("Transfer-Encoding", "chunked")],
      Some(Bytes::from(body)),
    );
    stream.get_mut().write_all(&response.to_bytes()).await.unwrap();
    let _ = seen_tx.send(received);
  });
  let listener = start_proxy(ProxyBuilder::new(plain_config())).await;

  let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
  client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
  let mut method = [0u8; 2];
  client.read_exact(&mut method).await.unwrap();
  assert_eq!(method, [0x05, 0x00]);
  let mut connect = vec![0x05, 0x01, 0x00, 0x01];
  connect.extend_from_slice(&target.ip().octets());
  connect.extend_from_slice(&target.port().to_be_bytes());
  client.write_all(&connect).await.unwrap();
  let mut reply = [0u8; 10];
  client.read_exact(&mut reply).await.unwrap();
  assert_eq!(reply[..2], [0x05, 0x00]);

  let sent = b"GET / HTTP/1.0\r\nHost: example\r\n\r\n";
  client.write_all(sent).await.unwrap();
  let mut reader = BufReader::new(client);
  let response = tokio::time::timeout(TEST_TIMEOUT, read_response(&mut reader, "GET"))
    .await
    .unwrap();
  assert_eq!(response.status().unwrap(), 200);
  let received = tokio::time::timeout(TEST_TIMEOUT, seen_rx).await.unwrap().unwrap();
  let decoded = response.decoded_content().await.unwrap().unwrap();
  assert_eq!(decoded, received);
  assert_eq!(decoded.as_ref(), &sent[..]);
  listener.stop().await;
}

#[tokio::test]
async fn test_intercepted_tls_reuses_host_certificate() {
  // upstream TLS server, with a certificate from an unrelated CA
  let (cert_pem, key_pem) = CertificateAuthority::generate_pem().unwrap();
  let upstream_ca = CertificateAuthority::from_pem(&cert_pem, &key_pem).unwrap();
  let upstream_tls = server_config(KeyManager::new(upstream_ca.issue("localhost").unwrap()).unwrap()).unwrap();
  let acceptor = TlsAcceptor::from(upstream_tls);
  let tls_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let port = tls_listener.local_addr().unwrap().port();
  tokio::spawn(async move {
    while let Ok((stream, _)) = tls_listener.accept().await {
      let acceptor = acceptor.clone();
      tokio::spawn(async move {
        let Ok(tls) = acceptor.accept(stream).await else {
          return;
        };
        let mut tls = BufReader::new(tls);
        while let Some(request) = read_request(&mut tls).await {
          let response = text_response(StatusCode::OK, &format!("secret for {}", request.resource()));
          if tls.get_mut().write_all(&response.to_bytes()).await.is_err() {
            return;
          }
        }
      });
    }
  });

  let (cert_pem, key_pem) = CertificateAuthority::generate_pem().unwrap();
  let ca = Arc::new(CertificateAuthority::from_pem(&cert_pem, &key_pem).unwrap());
  let selector = Arc::new(AutoGeneratingContextSelector::new(ca.clone()));
  let config = ProxyConfig {
    enable_socks: false,
    sniff_timeout: Duration::from_millis(200),
    ..Default::default()
  };
  let listener = start_proxy(ProxyBuilder::new(config).context_selector(selector.clone())).await;

  let mut roots = RootCertStore::empty();
  roots.add(ca.ca_cert_der().clone()).unwrap();
  let connector = TlsConnector::from(Arc::new(
    ClientConfig::builder()
      .with_root_certificates(roots)
      .with_no_client_auth(),
  ));
  for path in ["/first", "/second"] {
    let mut stream = TcpStream::connect(listener.local_addr()).await.unwrap();
    let connect = format!("CONNECT localhost:{port} HTTP/1.1\r\nHost: localhost:{port}\r\n\r\n");
    stream.write_all(connect.as_bytes()).await.unwrap();
    let mut reader = BufReader::new(stream);
    let header = read_header(&mut reader, MAX_HEADER_SIZE).await.unwrap().unwrap();
    assert_eq!(Response::from_header(header).unwrap().status().unwrap(), 200);
    assert!(reader.buffer().is_empty());

    let name = ServerName::try_from("localhost").unwrap();
    let mut tls = connector.connect(name, reader.into_inner()).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    tls.write_all(request.as_bytes()).await.unwrap();
    let mut reader = BufReader::new(tls);
    let response = tokio::time::timeout(TEST_TIMEOUT, read_response(&mut reader, "GET"))
      .await
      .unwrap();
    assert_eq!(response.status().unwrap(), 200);
    assert_eq!(
      response.content().unwrap().as_ref(),
      format!("secret for {path}").as_bytes()
    );
  }
  assert_eq!(selector.issued(), 1);
  listener.stop().await;
}

#[tokio::test]
async fn test_refuses_to_connect_to_itself() {
  let listener = start_proxy(ProxyBuilder::new(plain_config())).await;
  let own = listener.local_addr();

  let mut stream = TcpStream::connect(own).await.unwrap();
  stream
    .write_all(format!("CONNECT {own} HTTP/1.1\r\nHost: {own}\r\n\r\n").as_bytes())
    .await
    .unwrap();
  let response = read_response(&mut BufReader::new(stream), "CONNECT").await;
  assert_eq!(response.status().unwrap(), 508);

  let mut stream = TcpStream::connect(own).await.unwrap();
  stream
    .write_all(format!("GET http://{own}/ HTTP/1.1\r\nHost: {own}\r\n\r\n").as_bytes())
    .await
    .unwrap();
  let response = read_response(&mut BufReader::new(stream), "GET").await;
  assert_eq!(response.status().unwrap(), 508);

  let SocketAddr::V4(own_v4) = own else {
    panic!("expected an IPv4 listener");
  };
  let mut stream = TcpStream::connect(own).await.unwrap();
  stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
  let mut selected = [0u8; 2];
  stream.read_exact(&mut selected).await.unwrap();
  assert_eq!(selected, [0x05, 0x00]);
  let mut request = vec![0x05, 0x01, 0x00, 0x01];
  request.extend_from_slice(&own_v4.ip().octets());
  request.extend_from_slice(&own_v4.port().to_be_bytes());
  stream.write_all(&request).await.unwrap();
  let mut reply = [0u8; 2];
  stream.read_exact(&mut reply).await.unwrap();
  assert_eq!(reply, [0x05, 0x02]);
  listener.stop().await;
}

#[tokio::test]
async fn test_no_body_responses_keep_connection_usable() {
  let upstream = spawn_upstream(|request| match request.resource().as_str() {
    // lying Content-Length headers; no body follows
    "/empty" => Response::from_header(&b"HTTP/1.1 204 No Content\r\nContent-Length: 5\r\n\r\n"[..]).unwrap(),
    "/head" => Response::from_header(&b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n"[..]).unwrap(),
    _ => text_response(StatusCode::OK, "ok"),
  })
  .await;
  let listener = start_proxy(ProxyBuilder::new(plain_config())).await;
  let stream = TcpStream::connect(listener.local_addr()).await.unwrap();
  let mut client = BufReader::new(stream);

  let exchanges = [("GET", "/empty", 204), ("HEAD", "/head", 200), ("GET", "/next", 200)];
  for (method, path, status) in exchanges {
    let request = format!("{method} http://{upstream}{path} HTTP/1.1\r\nHost: {upstream}\r\n\r\n");
    client.get_mut().write_all(request.as_bytes()).await.unwrap();
    let response = tokio::time::timeout(TEST_TIMEOUT, read_response(&mut client, method))
      .await
      .unwrap();
    assert_eq!(response.status().unwrap(), status);
    if path == "/next" {
      assert_eq!(response.content().unwrap().as_ref(), b"ok");
    } else {
      assert!(response.content().is_none());
    }
  }
  listener.stop().await;
}

/// Answers `/blocked` itself and upper-cases every other body.
struct Rewriter;

#[async_trait::async_trait]
impl ProxyMonitor for Rewriter {
  async fn on_request_received(&self, conversation: &mut Conversation) -> tapwire::Result<Option<Response>> {
    if conversation.request().resource().starts_with("/blocked") {
      return Ok(Some(text_response(StatusCode::FORBIDDEN, "blocked")));
    }
    Ok(None)
  }
  async fn on_response_header_received(&self, _conversation: &mut Conversation) -> tapwire::Result<bool> {
    Ok(false)
  }
  async fn on_response_content_received(
    &self,
    conversation: &mut Conversation,
    _streamed: bool,
  ) -> tapwire::Result<()> {
    if let Some(response) = conversation.response_mut() {
      let content = response.decoded_content().await?.unwrap_or_default();
      response
        .set_decoded_content(Bytes::from(content.to_ascii_uppercase()))
        .await?;
    }
    Ok(())
  }
}

/// Every hook fails one way or another.
struct Broken;

#[async_trait::async_trait]
impl ProxyMonitor for Broken {
  async fn on_request_received(&self, _conversation: &mut Conversation) -> tapwire::Result<Option<Response>> {
    Err(Error::Other("broken monitor".to_string()))
  }
  async fn on_response_header_received(&self, _conversation: &mut Conversation) -> tapwire::Result<bool> {
    panic!("monitor panicked");
  }
}

#[tokio::test]
async fn test_monitors_substitute_and_rewrite() {
  let upstream = spawn_upstream(|_| text_response(StatusCode::OK, "hello from upstream")).await;
  let recorder = Arc::new(ConversationRecorder::default());
  let monitor = MonitorSet::new()
    .with(Arc::new(Broken))
    .with(Arc::new(Rewriter))
    .with(recorder.clone());
  let listener = start_proxy(ProxyBuilder::new(plain_config()).monitor(Arc::new(monitor))).await;
  let stream = TcpStream::connect(listener.local_addr()).await.unwrap();
  let mut client = BufReader::new(stream);

  let request = format!("GET http://{upstream}/blocked HTTP/1.1\r\nHost: {upstream}\r\n\r\n");
  client.get_mut().write_all(request.as_bytes()).await.unwrap();
  let response = read_response(&mut client, "GET").await;
  assert_eq!(response.status().unwrap(), 403);
  assert_eq!(response.content().unwrap().as_ref(), b"blocked");

  let request = format!("GET http://{upstream}/page HTTP/1.1\r\nHost: {upstream}\r\n\r\n");
  client.get_mut().write_all(request.as_bytes()).await.unwrap();
  let response = tokio::time::timeout(TEST_TIMEOUT, read_response(&mut client, "GET"))
    .await
    .unwrap();
  assert_eq!(response.status().unwrap(), 200);
  assert_eq!(response.content().unwrap().as_ref(), b"HELLO FROM UPSTREAM");

  // recorded after the write, so it may trail the client slightly
  let conversations = tokio::time::timeout(TEST_TIMEOUT, async {
    loop {
      let conversations = recorder.conversations().await;
      if conversations.len() == 2 {
        return conversations;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
  })
  .await
  .unwrap();
  assert_eq!(conversations[0].request().resource(), "/blocked");
  assert!(conversations[0].request_time().is_none());
  let page = &conversations[1];
  assert_eq!(page.request().resource(), "/page");
  assert!(page.request_time().is_some());
  assert!(page.response_content_time().is_some());
  assert_eq!(
    page.response().unwrap().content().unwrap().as_ref(),
    b"HELLO FROM UPSTREAM"
  );
  listener.stop().await;
}

/// Substitutes responses whose bodies the client must never see.
struct BodyOnNoContent;

#[async_trait::async_trait]
impl ProxyMonitor for BodyOnNoContent {
  async fn on_request_received(&self, conversation: &mut Conversation) -> tapwire::Result<Option<Response>> {
    let request = conversation.request();
    if request.method() == "HEAD" {
      return Ok(Some(text_response(StatusCode::OK, "not for HEAD")));
    }
    if request.resource() == "/nothing" {
      return Ok(Some(Response::build(
        StatusCode::NO_CONTENT,
        &[NamedValue::header("Content-Length", "5")],
        Some(Bytes::from_static(b"stray")),
      )));
    }
    Ok(None)
  }
}

#[tokio::test]
async fn test_substitute_bodies_follow_no_body_rule() {
  let upstream = spawn_upstream(|_| text_response(StatusCode::OK, "ok")).await;
  let builder = ProxyBuilder::new(plain_config()).monitor(Arc::new(BodyOnNoContent));
  let listener = start_proxy(builder).await;
  let stream = TcpStream::connect(listener.local_addr()).await.unwrap();
  let mut client = BufReader::new(stream);

  let exchanges = [("GET", "/nothing", 204), ("HEAD", "/page", 200), ("GET", "/page", 200)];
  for (method, path, status) in exchanges {
    let request = format!("{method} http://{upstream}{path} HTTP/1.1\r\nHost: {upstream}\r\n\r\n");
    client.get_mut().write_all(request.as_bytes()).await.unwrap();
    let response = tokio::time::timeout(TEST_TIMEOUT, read_response(&mut client, method))
      .await
      .unwrap();
    assert_eq!(response.status().unwrap(), status);
    if method == "GET" && status == 200 {
      assert_eq!(response.content().unwrap().as_ref(), b"ok");
    } else {
      assert!(response.content().is_none());
    }
  }
  assert!(client.buffer().is_empty());
  listener.stop().await;
}

#[tokio::test]
async fn test_unreachable_upstream_gets_bad_gateway() {
  // bind and drop to find a port nobody listens on
  let closed = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
  let listener = start_proxy(ProxyBuilder::new(plain_config())).await;
  let mut stream = TcpStream::connect(listener.local_addr()).await.unwrap();
  stream
    .write_all(format!("GET http://{closed}/ HTTP/1.1\r\nHost: {closed}\r\n\r\n").as_bytes())
    .await
    .unwrap();
  let response = read_response(&mut BufReader::new(stream), "GET").await;
  assert_eq!(response.status().unwrap(), 502);
  listener.stop().await;
}
