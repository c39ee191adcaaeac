use crate::errors::{Error, Result};
use crate::message::{Framing, Message, NamedValue};
use crate::target::TargetAddr;
use bytes::Bytes;
use std::ops::{Deref, DerefMut};

/// An HTTP request as seen by the proxy.
///
/// Besides the message itself a request knows where it is going: the target
/// and whether the upstream connection must use TLS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  message: Message,
  target: Option<TargetAddr>,
  ssl: bool,
}

impl Request {
  /// Wrap a message whose start line is `METHOD resource VERSION`.
  pub fn from_message(message: Message) -> Result<Self> {
    let parts = message.start_parts();
    if parts.len() != 3 || !parts[2].starts_with("HTTP/") {
      return Err(Error::message_format(format!(
        "invalid request line {:?}",
        message.start_line()
      )));
    }
    Ok(Self {
      message,
      target: None,
      ssl: false,
    })
  }
  /// Parse raw header bytes.
  pub fn from_header(header: impl Into<Bytes>) -> Result<Self> {
    Self::from_message(Message::new(header)?)
  }
  /// Build a request from its parts.
  pub fn build(method: &str, resource: &str, headers: &[NamedValue]) -> Self {
    Self {
      message: Message::from_parts(&format!("{} {} HTTP/1.1", method, resource), headers, None),
      target: None,
      ssl: false,
    }
  }
  /// method
  pub fn method(&self) -> String {
    self.part(0)
  }
  /// Replace the method.
  pub fn set_method(&mut self, method: &str) -> Result<()> {
    self.message.set_start_part(0, method)
  }
  /// Request target as written on the request line.
  pub fn resource(&self) -> String {
    self.part(1)
  }
  /// Replace the request target.
  pub fn set_resource(&mut self, resource: &str) -> Result<()> {
    self.message.set_start_part(1, resource)
  }
  /// HTTP version string, e.g. `HTTP/1.1`.
  pub fn version(&self) -> String {
    self.part(2)
  }
  /// Replace the version.
  pub fn set_version(&mut self, version: &str) -> Result<()> {
    self.message.set_start_part(2, version)
  }
  fn part(&self, index: usize) -> String {
    self
      .message
      .start_parts()
      .into_iter()
      .nth(index)
      .unwrap_or_default()
  }
  /// Where the request is sent.
  pub fn target(&self) -> Option<&TargetAddr> {
    self.target.as_ref()
  }
  /// Set where the request is sent.
  pub fn set_target(&mut self, target: Option<TargetAddr>) {
    self.target = target;
  }
  /// `true` when the upstream connection uses TLS.
  pub fn is_ssl(&self) -> bool {
    self.ssl
  }
  /// Choose TLS for the upstream connection.
  pub fn set_ssl(&mut self, ssl: bool) {
    self.ssl = ssl;
  }
  /// `CONNECT host:port`
  pub fn is_connect(&self) -> bool {
    self.method().eq_ignore_ascii_case("CONNECT")
  }
  /// Absolute URI of the request, built from target and SSL flag when the
  /// resource is in origin form.
  pub fn uri(&self) -> Result<http::Uri> {
    let resource = self.resource();
    if is_absolute(&resource) {
      return Ok(resource.parse()?);
    }
    let scheme = if self.ssl { "https" } else { "http" };
    let authority = match &self.target {
      Some(target) => target.to_host_port(),
      None => self
        .header_value("Host")
        .ok_or_else(|| Error::message_format("request has neither target nor Host"))?,
    };
    Ok(format!("{}://{}{}", scheme, authority, resource).parse()?)
  }
  /// For an absolute-form request line, take target and scheme from it and
  /// rewrite the line to origin form. Returns `false` when nothing changed.
  pub fn normalize_absolute(&mut self) -> Result<bool> {
    let resource = self.resource();
    if !is_absolute(&resource) {
      return Ok(false);
    }
    let uri: http::Uri = resource.parse()?;
    let ssl = uri.scheme() == Some(&http::uri::Scheme::HTTPS);
    let host = uri
      .host()
      .ok_or_else(|| Error::message_format(format!("no host in {}", resource)))?;
    let port = uri.port_u16().unwrap_or(if ssl { 443 } else { 80 });
    let origin = uri
      .path_and_query()
      .map(|p| p.as_str().to_string())
      .unwrap_or_else(|| "/".to_string());
    self.target = Some(TargetAddr::new(host, port));
    self.ssl = ssl;
    self.set_resource(&origin)?;
    Ok(true)
  }
  /// Target taken from the `Host` header.
  pub fn host_target(&self) -> Result<Option<TargetAddr>> {
    match self.header_value("Host") {
      None => Ok(None),
      Some(host) => {
        let port = if self.ssl { 443 } else { 80 };
        Ok(Some(TargetAddr::parse_authority(&host, Some(port))?))
      }
    }
  }
  /// Body framing: chunked, `Content-Length`, or no body.
  pub fn framing(&self) -> Result<Framing> {
    Ok(self.declared_framing()?.unwrap_or(Framing::Empty))
  }
  /// Whether the client connection stays open after this exchange.
  pub fn is_persistent(&self) -> bool {
    self.persistent_for(&self.version())
  }
  /// Unwrap the message.
  pub fn into_message(self) -> Message {
    self.message
  }
}

fn is_absolute(resource: &str) -> bool {
  let lower = resource.get(..8).unwrap_or(resource).to_ascii_lowercase();
  lower.starts_with("http://") || lower.starts_with("https://")
}

impl Deref for Request {
  type Target = Message;

  fn deref(&self) -> &Self::Target {
    &self.message
  }
}

impl DerefMut for Request {
  fn deref_mut(&mut self) -> &mut Self::Target {
    &mut self.message
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_request_line_parts() {
    let mut request = Request::from_header(&b"GET /index HTTP/1.1\r\nHost: a\r\n\r\n"[..]).unwrap();
    assert_eq!(request.method(), "GET");
    assert_eq!(request.resource(), "/index");
    request.set_method("HEAD").unwrap();
    assert_eq!(request.header().as_ref(), b"HEAD /index HTTP/1.1\r\nHost: a\r\n\r\n");
    assert!(Request::from_header(&b"HTTP/1.1 200 OK\r\n\r\n"[..]).is_err());
  }

  #[test]
  fn test_absolute_form_normalised() {
    let mut request =
      Request::from_header(&b"GET https://example.com:8443/a?b=1 HTTP/1.1\r\n\r\n"[..]).unwrap();
    assert!(request.normalize_absolute().unwrap());
    assert_eq!(request.resource(), "/a?b=1");
    assert!(request.is_ssl());
    assert_eq!(
      request.target(),
      Some(&TargetAddr::Domain("example.com".to_string(), 8443))
    );
    assert_eq!(request.uri().unwrap().to_string(), "https://example.com:8443/a?b=1");
  }

  #[test]
  fn test_persistence() {
    let request = Request::from_header(&b"GET / HTTP/1.0\r\n\r\n"[..]).unwrap();
    assert!(!request.is_persistent());
    let request =
      Request::from_header(&b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n"[..]).unwrap();
    assert!(request.is_persistent());
    let request = Request::from_header(&b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n"[..]).unwrap();
    assert!(!request.is_persistent());
  }
}
