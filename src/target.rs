use crate::errors::{new_io_error, Error, Result};
use std::fmt::{Display, Formatter};
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Where a connection ultimately wants to go.
///
/// Domain names are kept unresolved so the upstream side (or an upstream
/// proxy) decides when and where to resolve them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
  /// IPV4 IPV6
  Ip(SocketAddr),
  /// 域名
  Domain(String, u16),
}

impl TargetAddr {
  /// Build from a host string, which may be an IP literal (bracketed or not).
  pub fn new(host: &str, port: u16) -> Self {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    match IpAddr::from_str(bare) {
      Ok(ip) => TargetAddr::Ip(SocketAddr::new(ip, port)),
      Err(_) => TargetAddr::Domain(host.to_string(), port),
    }
  }
  /// Parse `host[:port]`, using `default_port` when the port is absent.
  pub fn parse_authority(authority: &str, default_port: Option<u16>) -> Result<Self> {
    let authority = http::uri::Authority::from_str(authority.trim())?;
    let port = authority
      .port_u16()
      .or(default_port)
      .ok_or_else(|| Error::message_format(format!("missing port in {}", authority)))?;
    Ok(Self::new(authority.host(), port))
  }
  /// Host part, without brackets.
  pub fn host(&self) -> String {
    match self {
      TargetAddr::Ip(addr) => addr.ip().to_string(),
      TargetAddr::Domain(host, _) => host.clone(),
    }
  }
  /// Port part.
  pub fn port(&self) -> u16 {
    match self {
      TargetAddr::Ip(addr) => addr.port(),
      TargetAddr::Domain(_, port) => *port,
    }
  }
  /// `host:port`, with IPv6 hosts bracketed.
  pub fn to_host_port(&self) -> String {
    self.to_string()
  }
  /// Resolve to socket addresses.
  pub async fn resolve(&self) -> Result<Vec<SocketAddr>> {
    match self {
      TargetAddr::Ip(addr) => Ok(vec![*addr]),
      TargetAddr::Domain(host, port) => {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), *port))
          .await?
          .collect();
        if addrs.is_empty() {
          return Err(new_io_error(
            ErrorKind::NotFound,
            &format!("{} did not resolve", host),
          ));
        }
        Ok(addrs)
      }
    }
  }
}

impl Display for TargetAddr {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      TargetAddr::Ip(addr) => write!(f, "{}", addr),
      TargetAddr::Domain(host, port) => write!(f, "{}:{}", host, port),
    }
  }
}

impl FromStr for TargetAddr {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    Self::parse_authority(s, None)
  }
}

impl From<SocketAddr> for TargetAddr {
  fn from(value: SocketAddr) -> Self {
    TargetAddr::Ip(value)
  }
}
