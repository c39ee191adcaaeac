//! SOCKS4, SOCKS4a and SOCKS5 server side handshake.
//!
//! A [`Handshake`] walks one client through
//! `Idle -> AuthNegotiating -> RequestRead -> Replied`. Only `CONNECT` is
//! served; other commands are answered with "command not supported".
use crate::errors::{Error, ReplyError, Result};
use crate::socket::AsyncIo;
use crate::target::TargetAddr;
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Wire constants
#[rustfmt::skip]
#[allow(missing_docs)]
pub mod consts {
  pub const SOCKS4_VERSION: u8 = 0x04;
  pub const SOCKS4_REPLY_VERSION: u8 = 0x00;
  pub const SOCKS4_REPLY_GRANTED: u8 = 0x5A;
  pub const SOCKS4_REPLY_REJECTED: u8 = 0x5B;

  pub const SOCKS5_VERSION: u8 = 0x05;

  pub const SOCKS5_AUTH_METHOD_NONE: u8 = 0x00;
  pub const SOCKS5_AUTH_METHOD_PASSWORD: u8 = 0x02;
  pub const SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE: u8 = 0xff;
  pub const SOCKS5_AUTH_PASSWORD_VERSION: u8 = 0x01;

  pub const SOCKS_CMD_TCP_CONNECT: u8 = 0x01;
  pub const SOCKS_CMD_TCP_BIND: u8 = 0x02;
  pub const SOCKS_CMD_UDP_ASSOCIATE: u8 = 0x03;

  pub const SOCKS5_ADDR_TYPE_IPV4: u8 = 0x01;
  pub const SOCKS5_ADDR_TYPE_DOMAIN_NAME: u8 = 0x03;
  pub const SOCKS5_ADDR_TYPE_IPV6: u8 = 0x04;

  pub const MAX_USER_ID_LEN: usize = 255;
}

/// SOCKS request command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
  /// CONNECT 代理 TCP 流量
  Connect,
  /// BIND 代理开启监听端口，接收目标地址的连接
  Bind,
  /// UDP ASSOCIATE 代理 UDP 数据转发
  UdpAssociate,
  /// anything else
  Unknown(u8),
}

impl From<u8> for Command {
  fn from(value: u8) -> Self {
    match value {
      consts::SOCKS_CMD_TCP_CONNECT => Command::Connect,
      consts::SOCKS_CMD_TCP_BIND => Command::Bind,
      consts::SOCKS_CMD_UDP_ASSOCIATE => Command::UdpAssociate,
      other => Command::Unknown(other),
    }
  }
}

/// A parsed SOCKS request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyMessage {
  /// SOCKS4, or SOCKS4a when `host` is present
  V4 {
    /// requested command
    command: Command,
    /// DSTPORT
    port: u16,
    /// DSTIP; `0.0.0.x` for SOCKS4a
    address: Ipv4Addr,
    /// USERID
    user_id: String,
    /// SOCKS4a host name
    host: Option<String>,
  },
  /// SOCKS5
  V5 {
    /// requested command
    command: Command,
    /// DST.ADDR and DST.PORT
    target: TargetAddr,
    /// method chosen during negotiation
    auth_method: u8,
  },
}

impl ProxyMessage {
  /// Protocol version, 4 or 5.
  pub fn version(&self) -> u8 {
    match self {
      ProxyMessage::V4 { .. } => consts::SOCKS4_VERSION,
      ProxyMessage::V5 { .. } => consts::SOCKS5_VERSION,
    }
  }
  /// Requested command.
  pub fn command(&self) -> Command {
    match self {
      ProxyMessage::V4 { command, .. } | ProxyMessage::V5 { command, .. } => *command,
    }
  }
  /// Where the client wants to go.
  pub fn target(&self) -> TargetAddr {
    match self {
      ProxyMessage::V4 {
        port,
        address,
        host,
        ..
      } => match host {
        Some(host) => TargetAddr::new(host, *port),
        None => TargetAddr::Ip(SocketAddr::new(IpAddr::V4(*address), *port)),
      },
      ProxyMessage::V5 { target, .. } => target.clone(),
    }
  }
  /// Reply granting the request. SOCKS4 echoes the requested port and
  /// address; SOCKS5 reports `bound` (or `0.0.0.0:0`).
  pub fn success_reply(&self, bound: Option<SocketAddr>) -> Vec<u8> {
    match self {
      ProxyMessage::V4 { port, address, .. } => {
        v4_reply(consts::SOCKS4_REPLY_GRANTED, *port, *address)
      }
      ProxyMessage::V5 { .. } => v5_reply(ReplyError::Succeeded, bound),
    }
  }
  /// Reply rejecting the request with `code`.
  pub fn error_reply(&self, code: ReplyError) -> Vec<u8> {
    match self {
      ProxyMessage::V4 { port, address, .. } => {
        v4_reply(consts::SOCKS4_REPLY_REJECTED, *port, *address)
      }
      ProxyMessage::V5 { .. } => v5_reply(code, None),
    }
  }
}

fn v4_reply(status: u8, port: u16, address: Ipv4Addr) -> Vec<u8> {
  let mut packet = vec![consts::SOCKS4_REPLY_VERSION, status];
  packet.extend_from_slice(&port.to_be_bytes());
  packet.extend_from_slice(&address.octets());
  packet
}

fn v5_reply(code: ReplyError, bound: Option<SocketAddr>) -> Vec<u8> {
  let bound = bound.unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
  let mut packet = vec![consts::SOCKS5_VERSION, code.code(), 0x00];
  match bound {
    SocketAddr::V4(addr) => {
      packet.push(consts::SOCKS5_ADDR_TYPE_IPV4);
      packet.extend_from_slice(&addr.ip().octets());
    }
    SocketAddr::V6(addr) => {
      packet.push(consts::SOCKS5_ADDR_TYPE_IPV6);
      packet.extend_from_slice(&addr.ip().octets());
    }
  }
  packet.extend_from_slice(&bound.port().to_be_bytes());
  packet
}

/// Chooses and runs SOCKS5 authentication; also vets SOCKS4 user ids.
#[async_trait]
pub trait Authenticator: Send + Sync {
  /// Pick one of the methods the client offered, `None` if none is
  /// acceptable.
  fn select_method(&self, offered: &[u8]) -> Option<u8>;
  /// Run the sub-negotiation for `method` on the raw stream.
  async fn authenticate(&self, method: u8, stream: &mut dyn AsyncIo) -> Result<()>;
  /// Whether a SOCKS4 request carrying `user_id` is allowed.
  fn accept_user_id(&self, _user_id: &str) -> bool {
    true
  }
}

/// Accepts everybody.
#[derive(Debug, Default, Clone)]
pub struct NoAuthentication;

#[async_trait]
impl Authenticator for NoAuthentication {
  fn select_method(&self, offered: &[u8]) -> Option<u8> {
    offered
      .contains(&consts::SOCKS5_AUTH_METHOD_NONE)
      .then_some(consts::SOCKS5_AUTH_METHOD_NONE)
  }
  async fn authenticate(&self, _method: u8, _stream: &mut dyn AsyncIo) -> Result<()> {
    Ok(())
  }
}

/// RFC 1929 username/password. SOCKS4 clients are refused since they cannot
/// present a password.
#[derive(Debug, Clone)]
pub struct PasswordAuthentication {
  username: String,
  password: String,
}

impl PasswordAuthentication {
  /// Require these credentials.
  pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
    Self {
      username: username.into(),
      password: password.into(),
    }
  }
}

#[async_trait]
impl Authenticator for PasswordAuthentication {
  fn select_method(&self, offered: &[u8]) -> Option<u8> {
    offered
      .contains(&consts::SOCKS5_AUTH_METHOD_PASSWORD)
      .then_some(consts::SOCKS5_AUTH_METHOD_PASSWORD)
  }
  async fn authenticate(&self, _method: u8, stream: &mut dyn AsyncIo) -> Result<()> {
    let version = stream.read_u8().await?;
    if version != consts::SOCKS5_AUTH_PASSWORD_VERSION {
      return Err(Error::protocol_violation(format!(
        "unsupported password auth version {}",
        version
      )));
    }
    let username = read_length_prefixed(stream).await?;
    let password = read_length_prefixed(stream).await?;
    let granted = username == self.username.as_bytes() && password == self.password.as_bytes();
    stream
      .write_all(&[consts::SOCKS5_AUTH_PASSWORD_VERSION, if granted { 0x00 } else { 0x01 }])
      .await?;
    stream.flush().await?;
    if !granted {
      tracing::warn!(
        "socks5 authentication rejected for user {:?}",
        String::from_utf8_lossy(&username)
      );
      return Err(Error::ReplyError(ReplyError::ConnectionNotAllowed));
    }
    Ok(())
  }
  fn accept_user_id(&self, _user_id: &str) -> bool {
    false
  }
}

async fn read_length_prefixed<R: AsyncRead + Unpin + ?Sized>(stream: &mut R) -> Result<Vec<u8>> {
  let len = stream.read_u8().await?;
  let mut buf = vec![0u8; len as usize];
  stream.read_exact(&mut buf).await?;
  Ok(buf)
}

async fn read_null_terminated<R: AsyncRead + Unpin>(stream: &mut R) -> Result<String> {
  let mut buf = Vec::new();
  loop {
    let b = stream.read_u8().await?;
    if b == 0 {
      break;
    }
    if buf.len() >= consts::MAX_USER_ID_LEN {
      return Err(Error::protocol_violation("socks4 string too long"));
    }
    buf.push(b);
  }
  Ok(String::from_utf8_lossy(&buf).to_string())
}

/// Progress of one handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
  /// nothing read yet
  Idle,
  /// SOCKS5 method negotiation and authentication running
  AuthNegotiating,
  /// request parsed, no reply written yet
  RequestRead,
  /// reply written; `Succeeded` for success
  Replied(ReplyError),
}

/// SOCKS server configuration shared by every connection.
#[derive(Clone)]
pub struct SocksServer {
  authenticator: Arc<dyn Authenticator>,
}

impl Default for SocksServer {
  fn default() -> Self {
    Self::new(Arc::new(NoAuthentication))
  }
}

impl SocksServer {
  /// Server using `authenticator`.
  pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
    Self { authenticator }
  }
  /// Start a handshake on `stream`.
  pub fn handshake<'a, S>(&'a self, stream: &'a mut S) -> Handshake<'a, S>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send,
  {
    Handshake {
      authenticator: self.authenticator.as_ref(),
      stream,
      state: HandshakeState::Idle,
      message: None,
    }
  }
  /// Read the request and grant it straight away.
  pub async fn accept<S>(&self, stream: &mut S) -> Result<ProxyMessage>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send,
  {
    let mut handshake = self.handshake(stream);
    let message = handshake.read_request().await?;
    handshake.reply_success(None).await?;
    Ok(message)
  }
}

/// One client's way through the SOCKS handshake.
pub struct Handshake<'a, S> {
  authenticator: &'a dyn Authenticator,
  stream: &'a mut S,
  state: HandshakeState,
  message: Option<ProxyMessage>,
}

impl<S> Handshake<'_, S>
where
  S: AsyncRead + AsyncWrite + Unpin + Send,
{
  /// Current state.
  pub fn state(&self) -> HandshakeState {
    self.state
  }
  /// The request, once read.
  pub fn message(&self) -> Option<&ProxyMessage> {
    self.message.as_ref()
  }

  /// Negotiate and read the request. Requests that can be parsed but not
  /// served are rejected on the wire before the error is returned; when the
  /// request itself cannot be read nothing is written.
  pub async fn read_request(&mut self) -> Result<ProxyMessage> {
    if self.state != HandshakeState::Idle {
      return Err(Error::protocol_violation("socks request already read"));
    }
    let version = self.stream.read_u8().await?;
    let message = match version {
      consts::SOCKS4_VERSION => self.read_v4().await?,
      consts::SOCKS5_VERSION => match self.read_v5().await? {
        Some(message) => message,
        None => return Err(Error::ReplyError(ReplyError::AddressTypeNotSupported)),
      },
      other => {
        return Err(Error::protocol_violation(format!(
          "unknown socks version {:#04x}",
          other
        )))
      }
    };
    self.state = HandshakeState::RequestRead;
    self.message = Some(message.clone());
    if let ProxyMessage::V4 { user_id, .. } = &message {
      if !self.authenticator.accept_user_id(user_id) {
        self.reply(ReplyError::ConnectionNotAllowed).await?;
        return Err(Error::ReplyError(ReplyError::ConnectionNotAllowed));
      }
    }
    if message.command() != Command::Connect {
      tracing::debug!("socks command {:?} not supported", message.command());
      self.reply(ReplyError::CommandNotSupported).await?;
      return Err(Error::ReplyError(ReplyError::CommandNotSupported));
    }
    Ok(message)
  }

  async fn read_v4(&mut self) -> Result<ProxyMessage> {
    let command = Command::from(self.stream.read_u8().await?);
    let port = self.stream.read_u16().await?;
    let address = Ipv4Addr::from(self.stream.read_u32().await?);
    let user_id = read_null_terminated(self.stream).await?;
    let octets = address.octets();
    // SOCKS4a: 0.0.0.x with x != 0 announces a host name
    let host = if octets[..3] == [0, 0, 0] && octets[3] != 0 {
      let host = read_null_terminated(self.stream).await?;
      if host.is_empty() {
        return Err(Error::protocol_violation("socks4a request without host name"));
      }
      Some(host)
    } else {
      None
    };
    Ok(ProxyMessage::V4 {
      command,
      port,
      address,
      user_id,
      host,
    })
  }

  async fn read_v5(&mut self) -> Result<Option<ProxyMessage>> {
    self.state = HandshakeState::AuthNegotiating;
    let offered = read_length_prefixed(self.stream).await?;
    let Some(method) = self.authenticator.select_method(&offered) else {
      self
        .stream
        .write_all(&[
          consts::SOCKS5_VERSION,
          consts::SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE,
        ])
        .await?;
      self.stream.flush().await?;
      return Err(Error::protocol_violation(format!(
        "no acceptable auth method in {:?}",
        offered
      )));
    };
    self
      .stream
      .write_all(&[consts::SOCKS5_VERSION, method])
      .await?;
    self.stream.flush().await?;
    self.authenticator.authenticate(method, self.stream).await?;

    let mut header = [0u8; 4];
    self.stream.read_exact(&mut header).await?;
    let [version, command, _rsv, address_type] = header;
    if version != consts::SOCKS5_VERSION {
      return Err(Error::protocol_violation(format!(
        "invalid socks5 request version {}",
        version
      )));
    }
    let target = match address_type {
      consts::SOCKS5_ADDR_TYPE_IPV4 => {
        let ip = Ipv4Addr::from(self.stream.read_u32().await?);
        TargetAddr::Ip(SocketAddr::new(IpAddr::V4(ip), self.stream.read_u16().await?))
      }
      consts::SOCKS5_ADDR_TYPE_IPV6 => {
        let mut ip = [0u8; 16];
        self.stream.read_exact(&mut ip).await?;
        TargetAddr::Ip(SocketAddr::new(IpAddr::from(ip), self.stream.read_u16().await?))
      }
      consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME => {
        let domain = read_length_prefixed(self.stream).await?;
        let port = self.stream.read_u16().await?;
        TargetAddr::Domain(String::from_utf8_lossy(&domain).to_string(), port)
      }
      other => {
        tracing::debug!("socks5 address type {:#04x} not supported", other);
        let reply = v5_reply(ReplyError::AddressTypeNotSupported, None);
        self.stream.write_all(&reply).await?;
        self.stream.flush().await?;
        self.state = HandshakeState::Replied(ReplyError::AddressTypeNotSupported);
        return Ok(None);
      }
    };
    Ok(Some(ProxyMessage::V5 {
      command: Command::from(command),
      target,
      auth_method: method,
    }))
  }

  async fn reply(&mut self, code: ReplyError) -> Result<()> {
    let Some(message) = &self.message else {
      return Err(Error::protocol_violation("no socks request to reply to"));
    };
    if self.state != HandshakeState::RequestRead {
      return Err(Error::protocol_violation("socks reply already written"));
    }
    let packet = match code {
      ReplyError::Succeeded => message.success_reply(None),
      code => message.error_reply(code),
    };
    self.stream.write_all(&packet).await?;
    self.stream.flush().await?;
    self.state = HandshakeState::Replied(code);
    Ok(())
  }

  /// Grant the request, reporting `bound` to SOCKS5 clients.
  pub async fn reply_success(&mut self, bound: Option<SocketAddr>) -> Result<()> {
    let Some(message) = &self.message else {
      return Err(Error::protocol_violation("no socks request to reply to"));
    };
    if self.state != HandshakeState::RequestRead {
      return Err(Error::protocol_violation("socks reply already written"));
    }
    let packet = message.success_reply(bound);
    self.stream.write_all(&packet).await?;
    self.stream.flush().await?;
    self.state = HandshakeState::Replied(ReplyError::Succeeded);
    Ok(())
  }

  /// Reject the request with the reply code matching `error`.
  pub async fn reply_error(&mut self, error: &Error) -> Result<()> {
    let code = match ReplyError::from_error(error) {
      ReplyError::Succeeded => ReplyError::GeneralFailure,
      code => code,
    };
    self.reply(code).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::DuplexStream;

  async fn client_with(bytes: &[u8]) -> (DuplexStream, DuplexStream) {
    let (mut client, server) = tokio::io::duplex(1024);
    client.write_all(bytes).await.unwrap();
    (client, server)
  }

  #[tokio::test]
  async fn test_socks4_connect() {
    let (mut client, mut server) =
      client_with(&[0x04, 0x01, 0x27, 0x0F, 127, 0, 0, 1, b'u', 0x00]).await;
    let message = SocksServer::default().accept(&mut server).await.unwrap();
    assert_eq!(message.target(), "127.0.0.1:9999".parse::<TargetAddr>().unwrap());
    let mut reply = [0u8; 8];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x00, 0x5A, 0x27, 0x0F, 127, 0, 0, 1]);
  }

  #[tokio::test]
  async fn test_socks4a_host_name() {
    let mut request = vec![0x04, 0x01, 0x00, 0x50, 0, 0, 0, 1, 0x00];
    request.extend_from_slice(b"example.com\0");
    let (_client, mut server) = client_with(&request).await;
    let message = SocksServer::default().accept(&mut server).await.unwrap();
    assert_eq!(message.target(), TargetAddr::Domain("example.com".to_string(), 80));
  }

  #[tokio::test]
  async fn test_socks5_bind_not_supported() {
    let (mut client, mut server) = client_with(&[
      0x05, 0x01, 0x00, // greeting
      0x05, 0x02, 0x00, 0x01, 10, 0, 0, 1, 0x00, 0x50, // BIND
    ])
    .await;
    let socks = SocksServer::default();
    let mut handshake = socks.handshake(&mut server);
    let err = handshake.read_request().await.unwrap_err();
    assert!(matches!(err, Error::ReplyError(ReplyError::CommandNotSupported)));
    assert_eq!(
      handshake.state(),
      HandshakeState::Replied(ReplyError::CommandNotSupported)
    );
    let mut reply = [0u8; 12];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..2], &[0x05, 0x00]);
    assert_eq!(reply[2], 0x05);
    assert_eq!(reply[3], 0x07);
  }

  #[tokio::test]
  async fn test_socks5_udp_not_supported() {
    let (mut client, mut server) = client_with(&[
      0x05, 0x01, 0x00, 0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0,
    ])
    .await;
    assert!(SocksServer::default().accept(&mut server).await.is_err());
    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[3], 0x07);
  }

  #[tokio::test]
  async fn test_socks5_domain_connect_and_failure_mapping() {
    let mut request = vec![0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x03, 11];
    request.extend_from_slice(b"example.com");
    request.extend_from_slice(&443u16.to_be_bytes());
    let (mut client, mut server) = client_with(&request).await;
    let socks = SocksServer::default();
    let mut handshake = socks.handshake(&mut server);
    let message = handshake.read_request().await.unwrap();
    assert_eq!(message.target(), TargetAddr::Domain("example.com".to_string(), 443));
    assert_eq!(handshake.state(), HandshakeState::RequestRead);
    let refused = Error::IO(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
    handshake.reply_error(&refused).await.unwrap();
    assert!(handshake.reply_success(None).await.is_err());
    let mut reply = [0u8; 12];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[3], 0x05);
  }

  #[tokio::test]
  async fn test_unknown_address_type() {
    let (mut client, mut server) =
      client_with(&[0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x09]).await;
    assert!(SocksServer::default().accept(&mut server).await.is_err());
    let mut reply = [0u8; 12];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[3], 0x08);
  }

  #[tokio::test]
  async fn test_password_authentication() {
    let mut request = vec![0x05, 0x01, 0x02, 0x01, 4];
    request.extend_from_slice(b"user");
    request.push(4);
    request.extend_from_slice(b"pass");
    request.extend_from_slice(&[0x05, 0x01, 0x00, 0x01, 1, 2, 3, 4, 0, 80]);
    let (mut client, mut server) = client_with(&request).await;
    let socks = SocksServer::new(Arc::new(PasswordAuthentication::new("user", "pass")));
    let message = socks.accept(&mut server).await.unwrap();
    assert_eq!(message.target(), "1.2.3.4:80".parse::<TargetAddr>().unwrap());
    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x02, 0x01, 0x00]);

    let mut request = vec![0x05, 0x01, 0x02, 0x01, 4];
    request.extend_from_slice(b"user");
    request.push(5);
    request.extend_from_slice(b"wrong");
    let (mut client, mut server) = client_with(&request).await;
    assert!(socks.accept(&mut server).await.is_err());
    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x02, 0x01, 0x01]);
  }

  #[tokio::test]
  async fn test_truncated_request_gets_no_reply() {
    let (mut client, mut server) = client_with(&[0x05, 0x01]).await;
    client.shutdown().await.unwrap();
    assert!(SocksServer::default().accept(&mut server).await.is_err());
    drop(server);
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
  }
}
