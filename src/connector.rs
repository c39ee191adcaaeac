//! Outbound connections: plain TCP, through HTTP or SOCKS5 upstream proxies,
//! optionally wrapped in TLS.
use crate::errors::{Error, ReplyError, Result};
use crate::io::PeekableStream;
use crate::message::{read_header, MAX_HEADER_SIZE};
use crate::response::Response;
use crate::socket::{BoxedIo, Socket};
use crate::socks::consts;
use crate::target::TargetAddr;
use crate::tls::UpstreamTrust;
use crate::upstream::{Credentials, Upstream};
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

/// ConnectorBuilder
#[derive(Clone, Debug)]
pub struct ConnectorBuilder {
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  connect_timeout: Option<Duration>,
  nodelay: bool,
  trust: UpstreamTrust,
}

impl Default for ConnectorBuilder {
  fn default() -> Self {
    Self {
      read_timeout: Some(Duration::from_secs(30)),
      write_timeout: Some(Duration::from_secs(30)),
      connect_timeout: Some(Duration::from_secs(10)),
      nodelay: true,
      trust: UpstreamTrust::Any,
    }
  }
}

impl ConnectorBuilder {
  /// Per read timeout on upstream sockets.
  ///
  /// Default is 30 seconds.
  pub fn read_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.read_timeout = timeout;
    self
  }
  /// Per write timeout on upstream sockets.
  ///
  /// Default is 30 seconds.
  pub fn write_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.write_timeout = timeout;
    self
  }
  /// Timeout for the TCP connect phase.
  ///
  /// Default is 10 seconds.
  pub fn connect_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.connect_timeout = timeout;
    self
  }
  /// Set `SO_NODELAY` on upstream sockets.
  ///
  /// Default is `true`.
  pub fn nodelay(mut self, value: bool) -> ConnectorBuilder {
    self.nodelay = value;
    self
  }
  /// How upstream server certificates are checked.
  ///
  /// Default is [`UpstreamTrust::Any`].
  pub fn trust(mut self, trust: UpstreamTrust) -> ConnectorBuilder {
    self.trust = trust;
    self
  }
  /// Build the connector.
  pub fn build(&self) -> Result<Connector> {
    Ok(Connector {
      connect_timeout: self.connect_timeout,
      read_timeout: self.read_timeout,
      write_timeout: self.write_timeout,
      nodelay: self.nodelay,
      tls: TlsConnector::from(self.trust.client_config()?),
    })
  }
}

/// Opens upstream connections.
#[derive(Clone)]
pub struct Connector {
  connect_timeout: Option<Duration>,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  nodelay: bool,
  tls: TlsConnector,
}

impl Connector {
  /// Connect to one socket address.
  pub async fn connect_with_addr(&self, addr: SocketAddr) -> std::io::Result<Socket<TcpStream>> {
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    if self.nodelay {
      socket.set_nodelay(true)?;
    }
    let stream = match self.connect_timeout {
      None => socket.connect(addr).await?,
      Some(timeout) => tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??,
    };
    Ok(Socket::new(stream, self.read_timeout, self.write_timeout))
  }

  /// Resolve `target` and connect to the first address that answers.
  pub async fn connect_tcp(&self, target: &TargetAddr) -> Result<Socket<TcpStream>> {
    let addrs = target.resolve().await.map_err(|e| match e {
      Error::IO(source) => Error::upstream_connect(target.to_host_port(), source),
      other => other,
    })?;
    let mut last_error = None;
    for addr in addrs {
      match self.connect_with_addr(addr).await {
        Ok(socket) => {
          tracing::debug!("connected to {} ({})", target, addr);
          return Ok(socket);
        }
        Err(e) => last_error = Some(e),
      }
    }
    let source = last_error.unwrap_or_else(|| {
      std::io::Error::new(std::io::ErrorKind::NotFound, "no address to connect to")
    });
    Err(Error::upstream_connect(target.to_host_port(), source))
  }

  /// Open a byte stream to `target`, through `upstream` when it is a proxy.
  pub async fn connect(&self, upstream: &Upstream, target: &TargetAddr) -> Result<BoxedIo> {
    match upstream {
      Upstream::Direct => Ok(Box::new(self.connect_tcp(target).await?)),
      Upstream::Http { addr, auth } => {
        let socket = self.connect_tcp(addr).await?;
        http_connect(socket, target, auth.as_ref()).await
      }
      Upstream::Socks { addr, auth } => {
        let mut socket = self.connect_tcp(addr).await?;
        socks5_connect(&mut socket, target, auth.as_ref()).await?;
        Ok(Box::new(socket))
      }
    }
  }

  /// Start a TLS session on `stream`, sending `host` as SNI when it is a
  /// name.
  pub async fn upgrade_to_tls(&self, stream: BoxedIo, host: &str) -> Result<BoxedIo> {
    let name = ServerName::try_from(host.to_owned())
      .map_err(|e| Error::tls_handshake(format!("invalid server name {}: {}", host, e)))?;
    let tls = self
      .tls
      .connect(name, stream)
      .await
      .map_err(|e| Error::tls_handshake(format!("upstream {}: {}", host, e)))?;
    Ok(Box::new(tls))
  }
}

/// Open a CONNECT tunnel through an HTTP proxy.
async fn http_connect<S>(stream: S, target: &TargetAddr, auth: Option<&Credentials>) -> Result<BoxedIo>
where
  S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
  let host_port = target.to_host_port();
  let mut raw = format!(
    "CONNECT {} HTTP/1.1\r\nHost: {}\r\nProxy-Connection: Keep-Alive\r\n",
    host_port, host_port
  );
  if let Some(auth) = auth {
    raw.push_str(&format!("Proxy-Authorization: {}\r\n", auth.basic_auth()));
  }
  raw.push_str("\r\n");
  let mut reader = BufReader::new(stream);
  reader.get_mut().write_all(raw.as_bytes()).await?;
  reader.get_mut().flush().await?;
  let header = read_header(&mut reader, MAX_HEADER_SIZE)
    .await?
    .ok_or_else(|| Error::protocol_violation("upstream proxy closed during CONNECT"))?;
  let response = Response::from_header(header)?;
  let status = response.status()?;
  if !(200..300).contains(&status) {
    return Err(Error::upstream_connect(
      host_port,
      std::io::Error::new(
        std::io::ErrorKind::ConnectionRefused,
        format!("upstream proxy answered {} {}", status, response.reason()),
      ),
    ));
  }
  let leftover = reader.buffer().to_vec();
  let mut stream = PeekableStream::new(reader.into_inner());
  stream.unread(&leftover);
  Ok(Box::new(stream))
}

/// SOCKS5 client handshake for a CONNECT to `target`.
async fn socks5_connect<S>(stream: &mut S, target: &TargetAddr, auth: Option<&Credentials>) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  if let Some(auth) = auth {
    if auth.username.len() > u8::MAX as usize || auth.password.len() > u8::MAX as usize {
      return Err(Error::protocol_violation(
        "socks5 username and password are limited to 255 bytes",
      ));
    }
  }
  let mut methods = vec![consts::SOCKS5_AUTH_METHOD_NONE];
  if auth.is_some() {
    methods.push(consts::SOCKS5_AUTH_METHOD_PASSWORD);
  }
  let mut packet = vec![consts::SOCKS5_VERSION, methods.len() as u8];
  packet.extend(methods);
  stream.write_all(&packet).await?;
  stream.flush().await?;

  let mut buf = [0u8; 2];
  stream.read_exact(&mut buf).await?;
  let [version, method] = buf;
  if version != consts::SOCKS5_VERSION {
    return Err(Error::protocol_violation(format!(
      "upstream socks version {}",
      version
    )));
  }
  match (method, auth) {
    (consts::SOCKS5_AUTH_METHOD_NONE, _) => {}
    (consts::SOCKS5_AUTH_METHOD_PASSWORD, Some(auth)) => {
      let user = auth.username.as_bytes();
      let pass = auth.password.as_bytes();
      let mut packet = vec![consts::SOCKS5_AUTH_PASSWORD_VERSION, user.len() as u8];
      packet.extend(user);
      packet.push(pass.len() as u8);
      packet.extend(pass);
      stream.write_all(&packet).await?;
      stream.flush().await?;
      let mut buf = [0u8; 2];
      stream.read_exact(&mut buf).await?;
      if buf[1] != 0x00 {
        return Err(Error::ReplyError(ReplyError::ConnectionNotAllowed));
      }
    }
    _ => {
      return Err(Error::protocol_violation(
        "no acceptable auth method at upstream socks proxy",
      ))
    }
  }

  let mut packet = vec![
    consts::SOCKS5_VERSION,
    consts::SOCKS_CMD_TCP_CONNECT,
    0x00,
  ];
  match target {
    TargetAddr::Ip(SocketAddr::V4(addr)) => {
      packet.push(consts::SOCKS5_ADDR_TYPE_IPV4);
      packet.extend(addr.ip().octets());
    }
    TargetAddr::Ip(SocketAddr::V6(addr)) => {
      packet.push(consts::SOCKS5_ADDR_TYPE_IPV6);
      packet.extend(addr.ip().octets());
    }
    TargetAddr::Domain(domain, _) => {
      let domain = domain.as_bytes();
      if domain.len() > u8::MAX as usize {
        return Err(Error::message_format("domain too long for socks5"));
      }
      packet.push(consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME);
      packet.push(domain.len() as u8);
      packet.extend(domain);
    }
  }
  packet.extend(target.port().to_be_bytes());
  stream.write_all(&packet).await?;
  stream.flush().await?;

  let mut buf = [0u8; 4];
  stream.read_exact(&mut buf).await?;
  let [version, reply, _rsv, address_type] = buf;
  if version != consts::SOCKS5_VERSION {
    return Err(Error::protocol_violation(format!(
      "upstream socks reply version {}",
      version
    )));
  }
  if reply != ReplyError::Succeeded.code() {
    return Err(Error::ReplyError(ReplyError::from(reply)));
  }
  let skip = match address_type {
    consts::SOCKS5_ADDR_TYPE_IPV4 => 4,
    consts::SOCKS5_ADDR_TYPE_IPV6 => 16,
    consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME => stream.read_u8().await? as usize,
    other => {
      return Err(Error::protocol_violation(format!(
        "upstream socks address type {}",
        other
      )))
    }
  };
  let mut bound = vec![0u8; skip + 2];
  stream.read_exact(&mut bound).await?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::socks::SocksServer;

  #[tokio::test]
  async fn test_socks5_client_against_server() {
    let (mut client, mut server) = tokio::io::duplex(1024);
    let target = TargetAddr::Domain("example.com".to_string(), 443);
    let expected = target.clone();
    let handle = tokio::spawn(async move {
      SocksServer::default().accept(&mut server).await.unwrap()
    });
    socks5_connect(&mut client, &target, None).await.unwrap();
    assert_eq!(handle.await.unwrap().target(), expected);
  }

  #[tokio::test]
  async fn test_socks5_rejects_oversized_credentials() {
    let (mut client, mut server) = tokio::io::duplex(1024);
    let target = TargetAddr::Domain("example.com".to_string(), 443);
    let credentials = Credentials {
      username: "u".repeat(256),
      password: "p".to_string(),
    };
    let result = socks5_connect(&mut client, &target, Some(&credentials)).await;
    assert!(matches!(result, Err(Error::ProtocolViolation(_))));
    drop(client);
    // nothing reached the wire
    let mut sent = Vec::new();
    server.read_to_end(&mut sent).await.unwrap();
    assert!(sent.is_empty());
  }

  #[tokio::test]
  async fn test_http_connect_keeps_early_bytes() {
    let (client, mut server) = tokio::io::duplex(1024);
    let target = TargetAddr::Domain("example.com".to_string(), 443);
    let handle = tokio::spawn(async move {
      let mut buf = vec![0u8; 1024];
      let n = server.read(&mut buf).await.unwrap();
      server
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\nEARLY")
        .await
        .unwrap();
      String::from_utf8_lossy(&buf[..n]).to_string()
    });
    let credentials = Credentials {
      username: "u".to_string(),
      password: "p".to_string(),
    };
    let mut stream = http_connect(client, &target, Some(&credentials)).await.unwrap();
    let request = handle.await.unwrap();
    assert!(request.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
    assert!(request.contains("Proxy-Authorization: Basic dTpw\r\n"));
    let mut early = [0u8; 5];
    stream.read_exact(&mut early).await.unwrap();
    assert_eq!(&early, b"EARLY");
  }

  #[tokio::test]
  async fn test_http_connect_refused() {
    let (client, mut server) = tokio::io::duplex(1024);
    tokio::spawn(async move {
      let mut buf = vec![0u8; 1024];
      let _ = server.read(&mut buf).await;
      let _ = server
        .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
        .await;
    });
    let target = TargetAddr::Domain("example.com".to_string(), 443);
    let err = http_connect(client, &target, None).await.err().unwrap();
    assert!(matches!(err, Error::UpstreamConnect { .. }));
  }

  #[tokio::test]
  async fn test_connect_refused_maps_to_reply() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let connector = ConnectorBuilder::default().build().unwrap();
    let err = connector
      .connect(&Upstream::Direct, &TargetAddr::Ip(addr))
      .await
      .err()
      .unwrap();
    assert_eq!(ReplyError::from_error(&err), ReplyError::ConnectionRefused);
  }
}
