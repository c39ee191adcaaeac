use std::future::Future;
use std::io::{Error, ErrorKind};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

/// Anything the proxy can read from and write to: plain TCP, either side of
/// a TLS session, or a wrapper around those.
pub trait AsyncIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncIo for T {}

/// Type erased stream handed from stage to stage.
pub type BoxedIo = Box<dyn AsyncIo>;

/// Socket
///
/// Adds per-operation read and write timeouts to a stream. A timer starts
/// when an operation first has to wait and is cleared once it makes
/// progress, so a slow but live peer is never cut off while a silent one is.
pub struct Socket<S> {
  inner: S,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  read_timer: Option<Pin<Box<Sleep>>>,
  write_timer: Option<Pin<Box<Sleep>>>,
}

impl<S> Socket<S> {
  /// Wrap a stream.
  pub fn new(inner: S, read_timeout: Option<Duration>, write_timeout: Option<Duration>) -> Self {
    Self {
      inner,
      read_timeout,
      write_timeout,
      read_timer: None,
      write_timer: None,
    }
  }
  /// Get a reference to the underlying stream.
  pub fn get_ref(&self) -> &S {
    &self.inner
  }
  /// Get a mutable reference to the underlying stream.
  pub fn get_mut(&mut self) -> &mut S {
    &mut self.inner
  }
  /// Unwrap the underlying stream.
  pub fn into_inner(self) -> S {
    self.inner
  }
}

fn poll_timer(
  timer: &mut Option<Pin<Box<Sleep>>>,
  timeout: Option<Duration>,
  cx: &mut Context<'_>,
  what: &str,
) -> Poll<Error> {
  let Some(timeout) = timeout else {
    return Poll::Pending;
  };
  let sleep = timer.get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
  match sleep.as_mut().poll(cx) {
    Poll::Ready(()) => {
      *timer = None;
      Poll::Ready(Error::new(
        ErrorKind::TimedOut,
        format!("{} timed out after {:?}", what, timeout),
      ))
    }
    Poll::Pending => Poll::Pending,
  }
}

// 实现socket的读写
impl<S: AsyncRead + Unpin> AsyncRead for Socket<S> {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    let this = self.get_mut();
    match Pin::new(&mut this.inner).poll_read(cx, buf) {
      Poll::Ready(result) => {
        this.read_timer = None;
        Poll::Ready(result)
      }
      Poll::Pending => match poll_timer(&mut this.read_timer, this.read_timeout, cx, "read") {
        Poll::Ready(e) => Poll::Ready(Err(e)),
        Poll::Pending => Poll::Pending,
      },
    }
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Socket<S> {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    let this = self.get_mut();
    match Pin::new(&mut this.inner).poll_write(cx, buf) {
      Poll::Ready(result) => {
        this.write_timer = None;
        Poll::Ready(result)
      }
      Poll::Pending => match poll_timer(&mut this.write_timer, this.write_timeout, cx, "write") {
        Poll::Ready(e) => Poll::Ready(Err(e)),
        Poll::Pending => Poll::Pending,
      },
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    let this = self.get_mut();
    match Pin::new(&mut this.inner).poll_flush(cx) {
      Poll::Ready(result) => {
        this.write_timer = None;
        Poll::Ready(result)
      }
      Poll::Pending => match poll_timer(&mut this.write_timer, this.write_timeout, cx, "flush") {
        Poll::Ready(e) => Poll::Ready(Err(e)),
        Poll::Pending => Poll::Pending,
      },
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  #[tokio::test]
  async fn test_read_timeout_fires_on_silent_peer() {
    let (_client, server) = tokio::io::duplex(64);
    let mut socket = Socket::new(server, Some(Duration::from_millis(50)), None);
    let mut buf = [0u8; 8];
    let err = socket.read(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TimedOut);
  }

  #[tokio::test]
  async fn test_live_peer_is_not_cut_off() {
    let (mut client, server) = tokio::io::duplex(64);
    let mut socket = Socket::new(server, Some(Duration::from_millis(200)), None);
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    socket.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
  }
}
