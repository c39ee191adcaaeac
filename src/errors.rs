//! proxy error
use std::io::ErrorKind;
use std::num::ParseIntError;
use thiserror::Error as ThisError;
/// A `Result` alias where the `Err` case is `tapwire::Error`.
pub type Result<T> = std::result::Result<T, Error>;
/// The Errors that may occur while proxying a connection.
#[derive(ThisError, Debug)]
pub enum Error {
  /// tls Error
  #[error(transparent)]
  Tls(#[from] tokio_rustls::rustls::Error),
  /// Error
  #[error(transparent)]
  IO(#[from] std::io::Error),
  /// http::Error
  #[error(transparent)]
  Http(#[from] http::Error),
  /// ParseIntError
  #[error(transparent)]
  IntError(#[from] ParseIntError),
  /// SOCKS reply code carried as an error
  #[error(transparent)]
  ReplyError(#[from] ReplyError),
  /// The peer sent bytes that do not follow the expected protocol
  #[error("protocol violation: {0}")]
  ProtocolViolation(String),
  /// The upstream connection could not be opened
  #[error("upstream connect to {target} failed: {source}")]
  UpstreamConnect {
    /// `host:port` that was dialed
    target: String,
    /// underlying error
    #[source]
    source: std::io::Error,
  },
  /// TLS handshake with client or upstream failed
  #[error("tls handshake failed: {0}")]
  TlsHandshake(String),
  /// A message header or body could not be parsed
  #[error("malformed message: {0}")]
  MessageFormat(String),
  /// Certificate generation or loading failed
  #[error("certificate error: {0}")]
  Signing(String),
  /// The target resolves to one of the proxy's own listening addresses
  #[error("proxy loop detected for {0}")]
  LoopDetected(String),
  /// An operation this proxy deliberately does not implement
  #[error("unsupported: {0}")]
  Unsupported(String),
  /// Unknown Error
  #[error("{0}")]
  Other(String),
}

/// SOCKS5 reply codes, also used for SOCKS4 failure classification.
#[derive(ThisError, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyError {
  /// 0x00
  #[error("Succeeded")]
  Succeeded = 0x00,
  /// 0x01
  #[error("General failure")]
  GeneralFailure = 0x01,
  /// 0x02
  #[error("Connection not allowed by ruleset")]
  ConnectionNotAllowed = 0x02,
  /// 0x03
  #[error("Network unreachable")]
  NetworkUnreachable = 0x03,
  /// 0x04
  #[error("Host unreachable")]
  HostUnreachable = 0x04,
  /// 0x05
  #[error("Connection refused")]
  ConnectionRefused = 0x05,
  /// 0x06
  #[error("TTL expired")]
  TtlExpired = 0x06,
  /// 0x07
  #[error("Command not supported")]
  CommandNotSupported = 0x07,
  /// 0x08
  #[error("Address type not supported")]
  AddressTypeNotSupported = 0x08,
}

impl From<u8> for ReplyError {
  /// Codes outside `0x00..=0x08` collapse to a general failure.
  fn from(value: u8) -> Self {
    match value {
      0x00 => ReplyError::Succeeded,
      0x02 => ReplyError::ConnectionNotAllowed,
      0x03 => ReplyError::NetworkUnreachable,
      0x04 => ReplyError::HostUnreachable,
      0x05 => ReplyError::ConnectionRefused,
      0x06 => ReplyError::TtlExpired,
      0x07 => ReplyError::CommandNotSupported,
      0x08 => ReplyError::AddressTypeNotSupported,
      _ => ReplyError::GeneralFailure,
    }
  }
}

impl ReplyError {
  /// Wire value of the reply code.
  pub fn code(self) -> u8 {
    self as u8
  }
  /// Classify a failure into the reply code a SOCKS client should see.
  pub fn from_error(error: &Error) -> Self {
    match error {
      Error::ReplyError(reply) => *reply,
      Error::LoopDetected(_) => ReplyError::ConnectionNotAllowed,
      Error::UpstreamConnect { source, .. } | Error::IO(source) => Self::from_io_kind(source.kind()),
      _ => ReplyError::GeneralFailure,
    }
  }
  fn from_io_kind(kind: ErrorKind) -> Self {
    match kind {
      ErrorKind::ConnectionRefused => ReplyError::ConnectionRefused,
      ErrorKind::HostUnreachable => ReplyError::HostUnreachable,
      ErrorKind::NetworkUnreachable => ReplyError::HostUnreachable,
      ErrorKind::Interrupted | ErrorKind::TimedOut => ReplyError::TtlExpired,
      _ => ReplyError::GeneralFailure,
    }
  }
}

impl Error {
  /// Create a protocol violation and log it
  pub fn protocol_violation(msg: impl Into<String>) -> Self {
    let error = Error::ProtocolViolation(msg.into());
    tracing::debug!("{}", error);
    error
  }
  /// Create a malformed message error and log it
  pub fn message_format(msg: impl Into<String>) -> Self {
    let error = Error::MessageFormat(msg.into());
    tracing::debug!("{}", error);
    error
  }
  /// Create a certificate error and log it
  pub fn signing(msg: impl Into<String>) -> Self {
    let error = Error::Signing(msg.into());
    tracing::error!("{}", error);
    error
  }
  /// Create a TLS handshake error and log it
  pub fn tls_handshake(msg: impl Into<String>) -> Self {
    let error = Error::TlsHandshake(msg.into());
    tracing::warn!("{}", error);
    error
  }
  /// Create an upstream connect error and log it
  pub fn upstream_connect(target: impl Into<String>, source: std::io::Error) -> Self {
    let error = Error::UpstreamConnect {
      target: target.into(),
      source,
    };
    tracing::warn!("{}", error);
    error
  }
  /// Create an unsupported-operation error and log it
  pub fn unsupported(msg: impl Into<String>) -> Self {
    let error = Error::Unsupported(msg.into());
    tracing::error!("{}", error);
    error
  }
}

impl From<http::uri::InvalidUri> for Error {
  fn from(value: http::uri::InvalidUri) -> Self {
    Error::Http(http::Error::from(value))
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::IO(std::io::Error::new(error_kind, msg))
}
