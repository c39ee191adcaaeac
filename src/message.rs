//! The raw HTTP message model.
//!
//! A [`Message`] keeps its header exactly as received (start line, header
//! lines, blank line) and its content exactly as it travels on the wire.
//! Everything else is derived on demand, so a message that nobody edits is
//! forwarded byte for byte.
use crate::errors::{Error, Result};
use crate::{COLON_SPACE, CR_LF};
use bytes::Bytes;
use std::fmt::{Display, Formatter};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Default upper bound for a message header.
pub const MAX_HEADER_SIZE: usize = 64 * 1024;

/// Header bytes are ISO-8859-1: every byte maps to exactly one char.
pub(crate) fn latin1_decode(bytes: &[u8]) -> String {
  bytes.iter().map(|b| *b as char).collect()
}

pub(crate) fn latin1_encode(text: &str) -> Vec<u8> {
  text
    .chars()
    .map(|c| if (c as u32) < 256 { c as u8 } else { b'?' })
    .collect()
}

/// A name, the separator that followed it and the value, as written.
///
/// Keeping the separator verbatim (`:`, `: `, `:\t` ...) lets a parsed
/// header block be joined back into the same bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedValue {
  name: String,
  separator: String,
  value: String,
}

impl NamedValue {
  /// A named value with an explicit separator.
  pub fn new(name: impl Into<String>, separator: impl Into<String>, value: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      separator: separator.into(),
      value: value.into(),
    }
  }
  /// A header line written as `name: value`.
  pub fn header(name: impl Into<String>, value: impl Into<String>) -> Self {
    Self::new(name, COLON_SPACE, value)
  }
  /// Split `line` at the first `separator`; whitespace following the
  /// separator is kept as part of it.
  pub fn parse(line: &str, separator: char) -> Result<Self> {
    let index = line
      .find(separator)
      .ok_or_else(|| Error::message_format(format!("no {:?} in {:?}", separator, line)))?;
    let name = &line[..index];
    if name.is_empty() {
      return Err(Error::message_format(format!("empty name in {:?}", line)));
    }
    let rest = &line[index + separator.len_utf8()..];
    let value = rest.trim_start_matches([' ', '\t']);
    let separator_end = index + separator.len_utf8() + (rest.len() - value.len());
    Ok(Self {
      name: name.to_string(),
      separator: line[index..separator_end].to_string(),
      value: value.to_string(),
    })
  }
  /// Parse a block of `line_separator` terminated lines.
  pub fn parse_all(block: &str, line_separator: &str, separator: char) -> Result<Vec<Self>> {
    let mut lines: Vec<&str> = block.split(line_separator).collect();
    if lines.last() == Some(&"") {
      lines.pop();
    }
    lines
      .into_iter()
      .map(|line| Self::parse(line, separator))
      .collect()
  }
  /// Inverse of [`NamedValue::parse_all`]: every value is followed by
  /// `line_separator`.
  pub fn join_all(values: &[Self], line_separator: &str) -> String {
    let mut out = String::new();
    for value in values {
      out.push_str(&value.to_string());
      out.push_str(line_separator);
    }
    out
  }
  /// First value whose name matches case-insensitively.
  pub fn find<'a>(values: &'a [Self], name: &str) -> Option<&'a Self> {
    values.iter().find(|v| v.name.eq_ignore_ascii_case(name))
  }
  /// name
  pub fn name(&self) -> &str {
    &self.name
  }
  /// separator, as written
  pub fn separator(&self) -> &str {
    &self.separator
  }
  /// value
  pub fn value(&self) -> &str {
    &self.value
  }
  /// Replace the value, keeping name and separator.
  pub fn set_value(&mut self, value: impl Into<String>) {
    self.value = value.into();
  }
}

impl Display for NamedValue {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}{}{}", self.name, self.separator, self.value)
  }
}

/// How a message body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
  /// No body at all
  Empty,
  /// `Content-Length` bytes
  Length(u64),
  /// `Transfer-Encoding: chunked`
  Chunked,
  /// Everything until the connection closes
  UntilClose,
}

/// Header plus optional content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
  header: Bytes,
  content: Option<Bytes>,
}

impl Message {
  /// Create from raw header bytes, which must end with an empty line.
  pub fn new(header: impl Into<Bytes>) -> Result<Self> {
    let header = header.into();
    check_header(&header)?;
    Ok(Self {
      header,
      content: None,
    })
  }
  /// Assemble a message from a start line and header lines.
  pub fn from_parts(start_line: &str, headers: &[NamedValue], content: Option<Bytes>) -> Self {
    Self {
      header: build_header(start_line, headers),
      content,
    }
  }
  /// Raw header bytes, blank line included.
  pub fn header(&self) -> &Bytes {
    &self.header
  }
  /// Replace the raw header.
  pub fn set_header(&mut self, header: impl Into<Bytes>) -> Result<()> {
    let header = header.into();
    check_header(&header)?;
    self.header = header;
    Ok(())
  }
  fn header_text(&self) -> String {
    latin1_decode(&self.header)
  }
  /// First line of the header.
  pub fn start_line(&self) -> String {
    let text = self.header_text();
    match text.find(CR_LF) {
      Some(i) => text[..i].to_string(),
      None => text,
    }
  }
  /// Start line split on whitespace into at most three parts; the third
  /// part keeps its inner spaces (response reason phrases).
  pub fn start_parts(&self) -> Vec<String> {
    split_start_line(&self.start_line())
  }
  /// Replace the start line, keeping header lines.
  pub fn set_start_line(&mut self, start_line: &str) -> Result<()> {
    let headers = self.headers()?;
    self.header = build_header(start_line, &headers);
    Ok(())
  }
  pub(crate) fn set_start_part(&mut self, index: usize, value: &str) -> Result<()> {
    let mut parts = self.start_parts();
    while parts.len() <= index {
      parts.push(String::new());
    }
    parts[index] = value.to_string();
    while parts.last().is_some_and(|p| p.is_empty()) {
      parts.pop();
    }
    self.set_start_line(&parts.join(" "))
  }
  /// Header lines, start line and blank line excluded.
  pub fn headers(&self) -> Result<Vec<NamedValue>> {
    let text = self.header_text();
    let body = match text.find(CR_LF) {
      Some(i) => &text[i + CR_LF.len()..],
      None => "",
    };
    let body = body.strip_suffix(CR_LF).unwrap_or(body);
    NamedValue::parse_all(body, CR_LF, ':')
  }
  /// Replace every header line.
  pub fn set_headers(&mut self, headers: &[NamedValue]) {
    self.header = build_header(&self.start_line(), headers);
  }
  /// First value of `name`, compared case-insensitively.
  pub fn header_value(&self, name: &str) -> Option<String> {
    let headers = self.headers().ok()?;
    NamedValue::find(&headers, name).map(|h| h.value().to_string())
  }
  /// Every value of `name`, in order.
  pub fn header_values(&self, name: &str) -> Vec<String> {
    self
      .headers()
      .unwrap_or_default()
      .into_iter()
      .filter(|h| h.name().eq_ignore_ascii_case(name))
      .map(|h| h.value().to_string())
      .collect()
  }
  /// Set `name` to `value`: the first occurrence keeps its spelling and
  /// separator, later occurrences are removed, a missing header is appended.
  pub fn set_header_value(&mut self, name: &str, value: &str) -> Result<()> {
    let mut headers = self.headers()?;
    let mut seen = false;
    headers.retain_mut(|h| {
      if !h.name().eq_ignore_ascii_case(name) {
        return true;
      }
      if seen {
        return false;
      }
      seen = true;
      h.set_value(value);
      true
    });
    if !seen {
      headers.push(NamedValue::header(name, value));
    }
    self.set_headers(&headers);
    Ok(())
  }
  /// Append a header line.
  pub fn add_header(&mut self, name: &str, value: &str) -> Result<()> {
    let mut headers = self.headers()?;
    headers.push(NamedValue::header(name, value));
    self.set_headers(&headers);
    Ok(())
  }
  /// Remove every `name` line, returning the removed values.
  pub fn delete_header(&mut self, name: &str) -> Result<Vec<String>> {
    let (removed, kept): (Vec<NamedValue>, Vec<NamedValue>) = self
      .headers()?
      .into_iter()
      .partition(|h| h.name().eq_ignore_ascii_case(name));
    if !removed.is_empty() {
      self.set_headers(&kept);
    }
    Ok(removed.into_iter().map(|h| h.value().to_string()).collect())
  }
  /// Content exactly as it travels on the wire.
  pub fn content(&self) -> Option<&Bytes> {
    self.content.as_ref()
  }
  /// Replace the wire content.
  pub fn set_content(&mut self, content: Option<Bytes>) {
    self.content = content;
  }
  /// Take the wire content out of the message.
  pub fn take_content(&mut self) -> Option<Bytes> {
    self.content.take()
  }
  /// `true` when the final transfer coding is `chunked`.
  pub fn is_chunked(&self) -> bool {
    self
      .header_values("Transfer-Encoding")
      .iter()
      .flat_map(|v| v.split(','))
      .map(|v| v.trim())
      .filter(|v| !v.is_empty())
      .last()
      .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
  }
  /// Declared `Content-Length`; conflicting or unparsable values are errors.
  pub fn content_length(&self) -> Result<Option<u64>> {
    let mut length = None;
    for value in self.header_values("Content-Length") {
      for part in value.split(',') {
        let parsed = part
          .trim()
          .parse::<u64>()
          .map_err(|_| Error::message_format(format!("invalid Content-Length {:?}", value)))?;
        if length.is_some_and(|l| l != parsed) {
          return Err(Error::message_format("conflicting Content-Length values"));
        }
        length = Some(parsed);
      }
    }
    Ok(length)
  }
  /// Body framing declared by the header, if any.
  pub(crate) fn declared_framing(&self) -> Result<Option<Framing>> {
    if self.is_chunked() {
      return Ok(Some(Framing::Chunked));
    }
    Ok(self.content_length()?.map(Framing::Length))
  }
  /// `Connection` tokens, lower-cased.
  pub(crate) fn connection_tokens(&self) -> Vec<String> {
    self
      .header_values("Connection")
      .iter()
      .flat_map(|v| v.split(','))
      .map(|v| v.trim().to_ascii_lowercase())
      .collect()
  }
  /// Persistence of the connection after this message for `version`.
  pub(crate) fn persistent_for(&self, version: &str) -> bool {
    let tokens = self.connection_tokens();
    if tokens.iter().any(|t| t == "close") {
      return false;
    }
    if version.eq_ignore_ascii_case("HTTP/1.0") {
      return tokens.iter().any(|t| t == "keep-alive");
    }
    true
  }
  /// Content with chunking and any gzip content coding removed.
  pub async fn decoded_content(&self) -> Result<Option<Bytes>> {
    let Some(content) = &self.content else {
      return Ok(None);
    };
    let mut data = if self.is_chunked() {
      crate::io::chunked::decode(content).await?
    } else {
      content.to_vec()
    };
    #[cfg(feature = "gzip")]
    if self
      .header_value("Content-Encoding")
      .is_some_and(|v| v.trim().eq_ignore_ascii_case("gzip"))
    {
      data = crate::io::gzip::gunzip(&data)?;
    }
    Ok(Some(Bytes::from(data)))
  }
  /// Store `content` re-applying the codings the header declares, and keep
  /// `Content-Length` in step for non-chunked messages.
  pub async fn set_decoded_content(&mut self, content: Bytes) -> Result<()> {
    let mut data = content.to_vec();
    #[cfg(feature = "gzip")]
    if self
      .header_value("Content-Encoding")
      .is_some_and(|v| v.trim().eq_ignore_ascii_case("gzip"))
    {
      data = crate::io::gzip::gzip(&data)?;
    }
    if self.is_chunked() {
      data = crate::io::chunked::encode(&data, crate::io::chunked::DEFAULT_MAX_CHUNK_SIZE).await?;
    } else {
      self.set_header_value("Content-Length", &data.len().to_string())?;
    }
    self.content = Some(Bytes::from(data));
    Ok(())
  }
  /// Header followed by content.
  pub fn to_bytes(&self) -> Bytes {
    match &self.content {
      None => self.header.clone(),
      Some(content) => {
        let mut raw = Vec::with_capacity(self.header.len() + content.len());
        raw.extend_from_slice(&self.header);
        raw.extend_from_slice(content);
        Bytes::from(raw)
      }
    }
  }
}

fn check_header(header: &[u8]) -> Result<()> {
  if !header.ends_with(b"\r\n\r\n") {
    return Err(Error::message_format("header must end with an empty line"));
  }
  if header.starts_with(CR_LF.as_bytes()) {
    return Err(Error::message_format("header has no start line"));
  }
  Ok(())
}

fn build_header(start_line: &str, headers: &[NamedValue]) -> Bytes {
  let mut text = String::from(start_line);
  text.push_str(CR_LF);
  text.push_str(&NamedValue::join_all(headers, CR_LF));
  text.push_str(CR_LF);
  Bytes::from(latin1_encode(&text))
}

fn split_start_line(line: &str) -> Vec<String> {
  let mut parts = Vec::with_capacity(3);
  let mut rest = line.trim_start();
  while !rest.is_empty() && parts.len() < 2 {
    let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
    parts.push(rest[..end].to_string());
    rest = rest[end..].trim_start();
  }
  if !rest.is_empty() {
    parts.push(rest.to_string());
  }
  parts
}

/// Read one message header: the start line, header lines and the blank
/// line. Bare `LF` line endings are normalised to `CRLF`; empty lines before
/// the start line are skipped.
///
/// `Ok(None)` means the peer closed cleanly before sending anything.
pub async fn read_header<R>(reader: &mut R, max_size: usize) -> Result<Option<Bytes>>
where
  R: AsyncBufRead + Unpin,
{
  let mut header: Vec<u8> = Vec::new();
  let mut line = Vec::new();
  loop {
    line.clear();
    let budget = (max_size.saturating_sub(header.len()) + CR_LF.len()) as u64;
    let n = (&mut *reader).take(budget).read_until(b'\n', &mut line).await?;
    if n == 0 {
      if header.is_empty() {
        return Ok(None);
      }
      return Err(Error::protocol_violation("connection closed inside message header"));
    }
    if !line.ends_with(b"\n") {
      if n as u64 >= budget {
        return Err(Error::message_format("message header too large"));
      }
      return Err(Error::protocol_violation("connection closed inside message header"));
    }
    while matches!(line.last(), Some(b'\n' | b'\r')) {
      line.pop();
    }
    if line.is_empty() {
      if header.is_empty() {
        continue;
      }
      header.extend_from_slice(CR_LF.as_bytes());
      return Ok(Some(Bytes::from(header)));
    }
    header.extend_from_slice(&line);
    header.extend_from_slice(CR_LF.as_bytes());
    if header.len() > max_size {
      return Err(Error::message_format("message header too large"));
    }
  }
}
