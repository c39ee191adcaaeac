//! `Transfer-Encoding: chunked` framing.
//!
//! Both halves are poll based so they can sit between a socket and
//! `tokio::io::copy` without buffering a whole body.
use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Largest payload a single chunk carries unless configured otherwise.
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 8192;
const MAX_LINE_LEN: usize = 4096;
const TERMINATOR: &[u8] = b"0\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
  Size,
  Data(u64),
  DataEnd,
  Trailer,
  Done,
}

/// Reads a chunked body and yields the de-chunked payload.
///
/// End of stream is reported after the zero chunk and its trailers have been
/// consumed; the underlying reader is left positioned on the next message.
/// Running out of input before that is an [`io::ErrorKind::UnexpectedEof`].
#[derive(Debug)]
pub struct ChunkedDecoder<R> {
  inner: R,
  state: DecodeState,
  line: Vec<u8>,
  raw: Option<Vec<u8>>,
}

impl<R: AsyncBufRead + Unpin> ChunkedDecoder<R> {
  /// Wrap a buffered reader positioned at the first chunk-size line.
  pub fn new(inner: R) -> Self {
    Self {
      inner,
      state: DecodeState::Size,
      line: Vec::new(),
      raw: None,
    }
  }
  /// Like [`ChunkedDecoder::new`], additionally keeping a copy of every wire
  /// byte consumed, framing included.
  pub fn capturing(inner: R) -> Self {
    let mut decoder = Self::new(inner);
    decoder.raw = Some(Vec::new());
    decoder
  }
  /// Wire bytes captured so far.
  pub fn take_raw(&mut self) -> Vec<u8> {
    self.raw.as_mut().map(std::mem::take).unwrap_or_default()
  }
  /// `true` once the terminating chunk and trailers were consumed.
  pub fn is_done(&self) -> bool {
    self.state == DecodeState::Done
  }
  /// Get a mutable reference to the underlying reader.
  pub fn get_mut(&mut self) -> &mut R {
    &mut self.inner
  }
  /// Unwrap the underlying reader.
  pub fn into_inner(self) -> R {
    self.inner
  }

  fn poll_line(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<Vec<u8>>> {
    loop {
      let available = ready!(Pin::new(&mut self.inner).poll_fill_buf(cx))?;
      if available.is_empty() {
        return Poll::Ready(Err(io::Error::new(
          io::ErrorKind::UnexpectedEof,
          "chunked body truncated",
        )));
      }
      let (used, complete) = match available.iter().position(|b| *b == b'\n') {
        Some(i) => (i + 1, true),
        None => (available.len(), false),
      };
      self.line.extend_from_slice(&available[..used]);
      if let Some(raw) = self.raw.as_mut() {
        raw.extend_from_slice(&available[..used]);
      }
      Pin::new(&mut self.inner).consume(used);
      if complete {
        let mut line = std::mem::take(&mut self.line);
        while matches!(line.last(), Some(b'\n' | b'\r')) {
          line.pop();
        }
        return Poll::Ready(Ok(line));
      }
      if self.line.len() > MAX_LINE_LEN {
        return Poll::Ready(Err(io::Error::new(
          io::ErrorKind::InvalidData,
          "chunk line too long",
        )));
      }
    }
  }
}

fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
  let size = match line.iter().position(|b| *b == b';') {
    Some(i) => &line[..i],
    None => line,
  };
  let size = std::str::from_utf8(size)
    .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "chunk size is not ascii"))?
    .trim();
  u64::from_str_radix(size, 16).map_err(|_| {
    io::Error::new(
      io::ErrorKind::InvalidData,
      format!("invalid chunk size {:?}", size),
    )
  })
}

impl<R: AsyncBufRead + Unpin> AsyncRead for ChunkedDecoder<R> {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    let this = self.get_mut();
    loop {
      match this.state {
        DecodeState::Size => {
          let line = ready!(this.poll_line(cx))?;
          this.state = match parse_chunk_size(&line)? {
            0 => DecodeState::Trailer,
            size => DecodeState::Data(size),
          };
        }
        DecodeState::Data(remaining) => {
          if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
          }
          let available = ready!(Pin::new(&mut this.inner).poll_fill_buf(cx))?;
          if available.is_empty() {
            return Poll::Ready(Err(io::Error::new(
              io::ErrorKind::UnexpectedEof,
              "chunk payload truncated",
            )));
          }
          let n = (remaining.min(available.len() as u64) as usize).min(buf.remaining());
          buf.put_slice(&available[..n]);
          if let Some(raw) = this.raw.as_mut() {
            raw.extend_from_slice(&available[..n]);
          }
          Pin::new(&mut this.inner).consume(n);
          let remaining = remaining - n as u64;
          this.state = if remaining == 0 {
            DecodeState::DataEnd
          } else {
            DecodeState::Data(remaining)
          };
          return Poll::Ready(Ok(()));
        }
        DecodeState::DataEnd => {
          let line = ready!(this.poll_line(cx))?;
          if !line.is_empty() {
            return Poll::Ready(Err(io::Error::new(
              io::ErrorKind::InvalidData,
              "missing CRLF after chunk payload",
            )));
          }
          this.state = DecodeState::Size;
        }
        DecodeState::Trailer => {
          // trailers are read and dropped
          let line = ready!(this.poll_line(cx))?;
          if line.is_empty() {
            this.state = DecodeState::Done;
          }
        }
        DecodeState::Done => return Poll::Ready(Ok(())),
      }
    }
  }
}

/// Writes everything it is given as chunks of at most `max_chunk_size` bytes.
///
/// [`ChunkedEncoder::finish`] (or `shutdown`) emits the terminating zero
/// chunk exactly once; `finish` leaves the inner writer open so a keep-alive
/// connection can carry the next message.
#[derive(Debug)]
pub struct ChunkedEncoder<W> {
  inner: W,
  max_chunk_size: usize,
  pending: Vec<u8>,
  written: usize,
  finished: bool,
}

impl<W: AsyncWrite + Unpin> ChunkedEncoder<W> {
  /// Encoder with [`DEFAULT_MAX_CHUNK_SIZE`].
  pub fn new(inner: W) -> Self {
    Self::with_max_chunk_size(inner, DEFAULT_MAX_CHUNK_SIZE)
  }
  /// Encoder producing chunks no larger than `max_chunk_size`.
  pub fn with_max_chunk_size(inner: W, max_chunk_size: usize) -> Self {
    Self {
      inner,
      max_chunk_size: max_chunk_size.max(1),
      pending: Vec::new(),
      written: 0,
      finished: false,
    }
  }
  /// Write the terminating chunk (once) and flush.
  pub async fn finish(&mut self) -> io::Result<()> {
    poll_fn(|cx| self.poll_finish(cx)).await
  }
  /// `true` once the terminating chunk was queued.
  pub fn is_finished(&self) -> bool {
    self.finished
  }
  /// Get a mutable reference to the underlying writer.
  pub fn get_mut(&mut self) -> &mut W {
    &mut self.inner
  }
  /// Unwrap the underlying writer. Bytes not yet drained are lost.
  pub fn into_inner(self) -> W {
    self.inner
  }

  fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    while self.written < self.pending.len() {
      let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.written..]))?;
      if n == 0 {
        return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
      }
      self.written += n;
    }
    self.pending.clear();
    self.written = 0;
    Poll::Ready(Ok(()))
  }

  fn poll_finish(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    if !self.finished {
      self.pending.extend_from_slice(TERMINATOR);
      self.finished = true;
    }
    ready!(self.poll_drain(cx))?;
    Pin::new(&mut self.inner).poll_flush(cx)
  }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ChunkedEncoder<W> {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<io::Result<usize>> {
    let this = self.get_mut();
    if this.finished {
      return Poll::Ready(Err(io::Error::new(
        io::ErrorKind::BrokenPipe,
        "chunked body already finished",
      )));
    }
    ready!(this.poll_drain(cx))?;
    // an empty chunk would end the body
    if buf.is_empty() {
      return Poll::Ready(Ok(0));
    }
    let n = buf.len().min(this.max_chunk_size);
    this
      .pending
      .extend_from_slice(format!("{:x}\r\n", n).as_bytes());
    this.pending.extend_from_slice(&buf[..n]);
    this.pending.extend_from_slice(b"\r\n");
    if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
      return Poll::Ready(Err(e));
    }
    Poll::Ready(Ok(n))
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    let this = self.get_mut();
    ready!(this.poll_drain(cx))?;
    Pin::new(&mut this.inner).poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    let this = self.get_mut();
    ready!(this.poll_finish(cx))?;
    Pin::new(&mut this.inner).poll_shutdown(cx)
  }
}

/// Chunk-encode an in-memory body.
pub async fn encode(data: &[u8], max_chunk_size: usize) -> io::Result<Vec<u8>> {
  let mut encoder = ChunkedEncoder::with_max_chunk_size(Vec::new(), max_chunk_size);
  encoder.write_all(data).await?;
  encoder.finish().await?;
  Ok(encoder.into_inner())
}

/// Decode an in-memory chunked body.
pub async fn decode(data: &[u8]) -> io::Result<Vec<u8>> {
  let mut decoder = ChunkedDecoder::new(data);
  let mut out = Vec::new();
  decoder.read_to_end(&mut out).await?;
  Ok(out)
}
