use super::ring::RingBuffer;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::sync::watch;

/// How many bytes can be peeked ahead of the reader.
pub const PEEK_CAPACITY: usize = 4096;

/// A stream whose leading bytes can be inspected without consuming them.
///
/// Bytes returned by [`PeekableStream::peek`] stay buffered and are the
/// first ones handed out by `poll_read`, so protocol sniffing never loses
/// input.
#[derive(Debug)]
pub struct PeekableStream<S> {
  inner: S,
  pushback: RingBuffer,
}

impl<S> PeekableStream<S> {
  /// Wrap a stream.
  pub fn new(inner: S) -> Self {
    Self {
      inner,
      pushback: RingBuffer::with_capacity(PEEK_CAPACITY),
    }
  }
  /// Put bytes back in front of the stream. Nothing is dropped; the buffer
  /// grows past [`PEEK_CAPACITY`] when needed.
  pub fn unread(&mut self, data: &[u8]) {
    self.pushback.unread(data)
  }
  /// Number of bytes buffered ahead of the inner stream.
  pub fn buffered(&self) -> usize {
    self.pushback.len()
  }
  /// Get a reference to the underlying stream.
  pub fn get_ref(&self) -> &S {
    &self.inner
  }
  /// Get a mutable reference to the underlying stream.
  pub fn get_mut(&mut self) -> &mut S {
    &mut self.inner
  }
  /// Split into the inner stream and the bytes that were peeked but not read.
  pub fn into_parts(self) -> (S, Vec<u8>) {
    let buffered = self.pushback.to_vec();
    (self.inner, buffered)
  }
}

impl<S: AsyncRead + Unpin> PeekableStream<S> {
  /// Read until at least `min` bytes are buffered (or EOF) and return a copy
  /// of everything buffered.
  ///
  /// An empty result means the peer closed without sending anything.
  pub async fn peek(&mut self, min: usize) -> io::Result<Vec<u8>> {
    let min = min.min(self.pushback.capacity());
    while self.pushback.len() < min {
      let mut buf = vec![0u8; self.pushback.remaining()];
      let n = self.inner.read(&mut buf).await?;
      if n == 0 {
        break;
      }
      self.pushback.write(&buf[..n]);
    }
    Ok(self.pushback.to_vec())
  }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekableStream<S> {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    let this = self.get_mut();
    if !this.pushback.is_empty() {
      let mut tmp = vec![0u8; buf.remaining().min(this.pushback.len())];
      let n = this.pushback.read(&mut tmp);
      buf.put_slice(&tmp[..n]);
      return Poll::Ready(Ok(()));
    }
    Pin::new(&mut this.inner).poll_read(cx, buf)
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekableStream<S> {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<io::Result<usize>> {
    Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
  }
}

/// Counts the bytes read through it.
#[derive(Debug)]
pub struct CountingReader<R> {
  inner: R,
  count: u64,
}

impl<R> CountingReader<R> {
  /// Wrap a reader.
  pub fn new(inner: R) -> Self {
    Self { inner, count: 0 }
  }
  /// Bytes read so far.
  pub fn count(&self) -> u64 {
    self.count
  }
  /// Unwrap the underlying reader.
  pub fn into_inner(self) -> R {
    self.inner
  }
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    let this = self.get_mut();
    let before = buf.filled().len();
    ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
    this.count += (buf.filled().len() - before) as u64;
    Poll::Ready(Ok(()))
  }
}

/// Forwards writes and keeps a copy of every byte the inner writer accepted.
#[derive(Debug)]
pub struct TeeWriter<W> {
  inner: W,
  copy: Vec<u8>,
}

impl<W> TeeWriter<W> {
  /// Wrap a writer.
  pub fn new(inner: W) -> Self {
    Self {
      inner,
      copy: Vec::new(),
    }
  }
  /// Bytes written so far.
  pub fn copy(&self) -> &[u8] {
    &self.copy
  }
  /// Take the copied bytes, leaving the copy empty.
  pub fn take_copy(&mut self) -> Vec<u8> {
    std::mem::take(&mut self.copy)
  }
  /// Get a mutable reference to the underlying writer.
  pub fn get_mut(&mut self) -> &mut W {
    &mut self.inner
  }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for TeeWriter<W> {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<io::Result<usize>> {
    let this = self.get_mut();
    let n = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
    this.copy.extend_from_slice(&buf[..n]);
    Poll::Ready(Ok(n))
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
  }
}

/// Raises a shared flag the first time the inner reader hits EOF or fails.
#[derive(Debug)]
pub struct EofNotify<R> {
  inner: R,
  done: Option<Arc<watch::Sender<bool>>>,
}

impl<R> EofNotify<R> {
  /// Wrap a reader, signalling `done` at end of stream.
  pub fn new(inner: R, done: Arc<watch::Sender<bool>>) -> Self {
    Self {
      inner,
      done: Some(done),
    }
  }
  /// Get a mutable reference to the underlying reader.
  pub fn get_mut(&mut self) -> &mut R {
    &mut self.inner
  }
  fn fire(&mut self) {
    if let Some(done) = self.done.take() {
      done.send_replace(true);
    }
  }
}

impl<R: AsyncRead + Unpin> AsyncRead for EofNotify<R> {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    let this = self.get_mut();
    let before = buf.filled().len();
    let wanted = buf.remaining() > 0;
    let result = ready!(Pin::new(&mut this.inner).poll_read(cx, buf));
    match &result {
      Ok(()) if wanted && buf.filled().len() == before => this.fire(),
      Err(_) => this.fire(),
      _ => {}
    }
    Poll::Ready(result)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::AsyncWriteExt;

  #[tokio::test]
  async fn test_peek_does_not_consume() {
    let (mut client, server) = tokio::io::duplex(64);
    client.write_all(b"\x05\x01\x00").await.unwrap();
    let mut stream = PeekableStream::new(server);
    let peeked = stream.peek(1).await.unwrap();
    assert_eq!(peeked[0], 0x05);
    let mut all = [0u8; 3];
    stream.read_exact(&mut all).await.unwrap();
    assert_eq!(&all, b"\x05\x01\x00");
  }

  #[tokio::test]
  async fn test_unread_more_than_peek_capacity() {
    let (mut client, server) = tokio::io::duplex(64);
    client.write_all(b"tail").await.unwrap();
    drop(client);
    let mut stream = PeekableStream::new(server);
    let pushed: Vec<u8> = (0..5000).map(|i| (i % 256) as u8).collect();
    stream.unread(&pushed);
    assert_eq!(stream.buffered(), 5000);
    let mut all = Vec::new();
    stream.read_to_end(&mut all).await.unwrap();
    assert_eq!(all.len(), 5004);
    assert_eq!(&all[..5000], pushed.as_slice());
    assert_eq!(&all[5000..], b"tail");
  }

  #[tokio::test]
  async fn test_counting_and_tee() {
    let mut reader = CountingReader::new(&b"0123456789"[..]);
    let mut tee = TeeWriter::new(Vec::new());
    tokio::io::copy(&mut reader, &mut tee).await.unwrap();
    assert_eq!(reader.count(), 10);
    assert_eq!(tee.copy(), b"0123456789");
    assert_eq!(tee.get_mut().as_slice(), b"0123456789");
  }

  #[tokio::test]
  async fn test_eof_raises_flag() {
    let (tx, rx) = watch::channel(false);
    let mut reader = EofNotify::new(&b"abc"[..], Arc::new(tx));
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    assert!(*rx.borrow());
  }
}
