use crate::errors::{Error, Result};
use crate::message::{Framing, Message, NamedValue};
use bytes::Bytes;
use http::StatusCode;
use std::ops::{Deref, DerefMut};

/// An HTTP response as seen by the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  message: Message,
}

impl Response {
  /// Wrap a message whose start line is `VERSION status [reason]`.
  pub fn from_message(message: Message) -> Result<Self> {
    let parts = message.start_parts();
    let valid = parts.len() >= 2
      && parts[0].starts_with("HTTP/")
      && parts[1].len() == 3
      && parts[1].bytes().all(|b| b.is_ascii_digit());
    if !valid {
      return Err(Error::message_format(format!(
        "invalid status line {:?}",
        message.start_line()
      )));
    }
    Ok(Self { message })
  }
  /// Parse raw header bytes.
  pub fn from_header(header: impl Into<Bytes>) -> Result<Self> {
    Self::from_message(Message::new(header)?)
  }
  /// Build a response with the canonical reason phrase for `status`.
  pub fn build(status: StatusCode, headers: &[NamedValue], content: Option<Bytes>) -> Self {
    let start_line = format!(
      "HTTP/1.1 {} {}",
      status.as_u16(),
      status.canonical_reason().unwrap_or("Unknown")
    );
    Self {
      message: Message::from_parts(&start_line, headers, content),
    }
  }
  /// The response the proxy sends when it has to give up on a request:
  /// no body and the connection is closed afterwards.
  pub fn error(status: StatusCode) -> Self {
    Self::build(
      status,
      &[
        NamedValue::header("Content-Length", "0"),
        NamedValue::header("Connection", "close"),
      ],
      None,
    )
  }
  /// HTTP version string.
  pub fn version(&self) -> String {
    self.part(0)
  }
  /// Replace the version.
  pub fn set_version(&mut self, version: &str) -> Result<()> {
    self.message.set_start_part(0, version)
  }
  /// Numeric status code.
  pub fn status(&self) -> Result<u16> {
    Ok(self.part(1).parse::<u16>()?)
  }
  /// Replace the status code.
  pub fn set_status(&mut self, status: u16) -> Result<()> {
    self.message.set_start_part(1, &status.to_string())
  }
  /// Reason phrase, possibly empty.
  pub fn reason(&self) -> String {
    self.part(2)
  }
  /// Replace the reason phrase.
  pub fn set_reason(&mut self, reason: &str) -> Result<()> {
    self.message.set_start_part(2, reason)
  }
  fn part(&self, index: usize) -> String {
    self
      .message
      .start_parts()
      .into_iter()
      .nth(index)
      .unwrap_or_default()
  }
  /// `1xx` responses precede the final one.
  pub fn is_interim(&self) -> bool {
    self.status().is_ok_and(|s| (100..200).contains(&s))
  }
  /// Whether a body follows this header, given the request method.
  ///
  /// Responses to `HEAD`, `204`, `304` and interim responses never carry
  /// one, whatever their headers claim.
  pub fn has_content(&self, request_method: &str) -> bool {
    if request_method.eq_ignore_ascii_case("HEAD") {
      return false;
    }
    match self.status() {
      Ok(204 | 304) => false,
      Ok(s) if (100..200).contains(&s) => false,
      _ => true,
    }
  }
  /// Body framing for a response to `request_method`.
  pub fn framing(&self, request_method: &str) -> Result<Framing> {
    if !self.has_content(request_method) {
      return Ok(Framing::Empty);
    }
    Ok(self.declared_framing()?.unwrap_or(Framing::UntilClose))
  }
  /// Whether the upstream connection may carry another request.
  pub fn is_persistent(&self) -> bool {
    self.persistent_for(&self.version())
  }
  /// Unwrap the message.
  pub fn into_message(self) -> Message {
    self.message
  }
}

impl Deref for Response {
  type Target = Message;

  fn deref(&self) -> &Self::Target {
    &self.message
  }
}

impl DerefMut for Response {
  fn deref_mut(&mut self) -> &mut Self::Target {
    &mut self.message
  }
}
