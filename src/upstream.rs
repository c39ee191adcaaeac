//! Upstream routing: how a connection reaches its target.
use crate::errors::{Error, Result};
use crate::target::TargetAddr;
use percent_encoding::percent_decode_str;
use std::fmt;
use std::io::Write;
use std::str::FromStr;

/// Credentials for an upstream proxy.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
  /// user name
  pub username: String,
  /// password
  pub password: String,
}

impl fmt::Debug for Credentials {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Credentials")
      .field("username", &self.username)
      .finish_non_exhaustive()
  }
}

impl Credentials {
  /// `Basic` authorization value for these credentials.
  pub fn basic_auth(&self) -> String {
    encode_basic_auth(&self.username, &self.password)
  }
}

/// Where to send a connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Upstream {
  /// Connect to the target itself
  #[default]
  Direct,
  /// Through an HTTP proxy (CONNECT tunnels, absolute-form requests)
  Http {
    /// proxy address
    addr: TargetAddr,
    /// sent as `Proxy-Authorization: Basic`
    auth: Option<Credentials>,
  },
  /// Through a SOCKS5 proxy
  Socks {
    /// proxy address
    addr: TargetAddr,
    /// RFC 1929 credentials
    auth: Option<Credentials>,
  },
}

impl Upstream {
  /// `true` for [`Upstream::Direct`].
  pub fn is_direct(&self) -> bool {
    matches!(self, Upstream::Direct)
  }
}

impl fmt::Display for Upstream {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Upstream::Direct => f.write_str("DIRECT"),
      Upstream::Http { addr, .. } => write!(f, "PROXY {}", addr),
      Upstream::Socks { addr, .. } => write!(f, "SOCKS {}", addr),
    }
  }
}

/// Parses `DIRECT`, `PROXY [user:pass@]host:port` or
/// `SOCKS [user:pass@]host:port`. In a `;` separated list only the first
/// entry counts.
impl FromStr for Upstream {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    let first = s.split(';').next().unwrap_or_default().trim();
    if first.eq_ignore_ascii_case("DIRECT") {
      return Ok(Upstream::Direct);
    }
    let (kind, rest) = first
      .split_once(char::is_whitespace)
      .ok_or_else(|| Error::message_format(format!("invalid upstream {:?}", s)))?;
    let (auth, host_port) = match rest.trim().rsplit_once('@') {
      Some((userinfo, host_port)) => (Some(parse_credentials(userinfo)?), host_port),
      None => (None, rest.trim()),
    };
    let addr = TargetAddr::from_str(host_port)?;
    match kind.to_ascii_uppercase().as_str() {
      "PROXY" | "HTTP" => Ok(Upstream::Http { addr, auth }),
      "SOCKS" | "SOCKS5" => Ok(Upstream::Socks { addr, auth }),
      _ => Err(Error::message_format(format!("unknown upstream type {:?}", kind))),
    }
  }
}

fn parse_credentials(userinfo: &str) -> Result<Credentials> {
  let (username, password) = userinfo.split_once(':').unwrap_or((userinfo, ""));
  let decode = |s: &str| {
    percent_decode_str(s)
      .decode_utf8()
      .map(|s| s.to_string())
      .map_err(|e| Error::message_format(format!("invalid credentials: {}", e)))
  };
  Ok(Credentials {
    username: decode(username)?,
    password: decode(password)?,
  })
}

/// `Basic` authorization value for `username:password`.
pub fn encode_basic_auth(username: &str, password: &str) -> String {
  use base64::prelude::BASE64_STANDARD;
  use base64::write::EncoderWriter;

  let mut buf = b"Basic ".to_vec();
  {
    let mut encoder = EncoderWriter::new(&mut buf, &BASE64_STANDARD);
    let _ = write!(encoder, "{}:{}", username, password);
    let _ = encoder.finish();
  }
  String::from_utf8_lossy(&buf).to_string()
}

/// Chooses the upstream for each outbound connection attempt.
pub trait UpstreamSelector: Send + Sync {
  /// Upstream for a connection to `uri`.
  fn select(&self, uri: &http::Uri) -> Upstream;
}

impl UpstreamSelector for Upstream {
  fn select(&self, _uri: &http::Uri) -> Upstream {
    self.clone()
  }
}

impl<F> UpstreamSelector for F
where
  F: Fn(&http::Uri) -> Upstream + Send + Sync,
{
  fn select(&self, uri: &http::Uri) -> Upstream {
    self(uri)
  }
}

/// The URI handed to an [`UpstreamSelector`] for a connection to `target`.
pub fn target_uri(target: &TargetAddr, ssl: bool) -> Result<http::Uri> {
  let scheme = if ssl { "https" } else { "http" };
  Ok(format!("{}://{}/", scheme, target.to_host_port()).parse()?)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_instructions() {
    assert_eq!("DIRECT".parse::<Upstream>().unwrap(), Upstream::Direct);
    assert_eq!(
      "PROXY proxy.local:3128; DIRECT".parse::<Upstream>().unwrap(),
      Upstream::Http {
        addr: TargetAddr::Domain("proxy.local".to_string(), 3128),
        auth: None
      }
    );
    assert_eq!(
      "SOCKS 10.0.0.1:1080".parse::<Upstream>().unwrap(),
      Upstream::Socks {
        addr: "10.0.0.1:1080".parse().unwrap(),
        auth: None
      }
    );
    assert!("PROXY proxy.local".parse::<Upstream>().is_err());
    assert!("FTP a:1".parse::<Upstream>().is_err());
  }

  #[test]
  fn test_credentials() {
    let upstream = "PROXY us%40er:p%3Ass@proxy:8080".parse::<Upstream>().unwrap();
    let Upstream::Http { auth: Some(auth), .. } = upstream else {
      panic!("expected credentials");
    };
    assert_eq!(auth.username, "us@er");
    assert_eq!(auth.password, "p:ss");
    assert_eq!(
      encode_basic_auth("Aladdin", "open sesame"),
      "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ=="
    );
  }

  #[test]
  fn test_closure_selector() {
    let selector = |uri: &http::Uri| {
      if uri.scheme_str() == Some("https") {
        Upstream::Direct
      } else {
        "PROXY p:1".parse().unwrap_or_default()
      }
    };
    let target = TargetAddr::Domain("a".to_string(), 443);
    assert!(selector.select(&target_uri(&target, true).unwrap()).is_direct());
    assert!(!selector.select(&target_uri(&target, false).unwrap()).is_direct());
  }
}
