//! Moving message bodies between connections.
//!
//! Bodies are always carried in wire form: a chunked body keeps its chunk
//! framing and trailers, so what the client receives is what the server
//! sent unless a monitor rewrote it.
use crate::errors::{new_io_error, Error, Result};
use crate::io::{ChunkedDecoder, TeeWriter};
use crate::message::Framing;
use bytes::Bytes;
use std::io::ErrorKind;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Default cap on a body buffered in memory.
pub const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

/// Which side of a streamed copy failed.
#[derive(Debug)]
pub enum CopyError {
  /// Reading from the source failed or it ended early
  Read(Error),
  /// Writing to the sink failed
  Write(Error),
}

/// Read a whole body, returning its wire bytes.
///
/// Bodies larger than `max_size` wire bytes are refused, and nothing past
/// the limit is read.
pub async fn read_body<R>(reader: &mut R, framing: Framing, max_size: usize) -> Result<Option<Bytes>>
where
  R: AsyncBufRead + Unpin,
{
  let limit = max_size as u64;
  match framing {
    Framing::Empty => Ok(None),
    Framing::Length(len) => {
      if len > limit {
        return Err(too_large(max_size));
      }
      let mut body = Vec::new();
      let n = (&mut *reader).take(len).read_to_end(&mut body).await?;
      if (n as u64) < len {
        return Err(new_io_error(
          ErrorKind::UnexpectedEof,
          &format!("body ended after {} of {} bytes", n, len),
        ));
      }
      Ok(Some(Bytes::from(body)))
    }
    Framing::Chunked => {
      let mut decoder = ChunkedDecoder::capturing(&mut *reader);
      let mut raw = Vec::new();
      let mut buf = vec![0u8; COPY_BUFFER_SIZE];
      loop {
        let n = decoder.read(&mut buf).await?;
        raw.extend_from_slice(&decoder.take_raw());
        if raw.len() > max_size {
          return Err(too_large(max_size));
        }
        if n == 0 && decoder.is_done() {
          break;
        }
      }
      Ok(Some(Bytes::from(raw)))
    }
    Framing::UntilClose => {
      let mut body = Vec::new();
      (&mut *reader).take(limit + 1).read_to_end(&mut body).await?;
      if body.len() > max_size {
        return Err(too_large(max_size));
      }
      Ok(Some(Bytes::from(body)))
    }
  }
}

fn too_large(max_size: usize) -> Error {
  Error::message_format(format!("body exceeds {} bytes", max_size))
}

/// Copy a body from `reader` to `writer` as it arrives, returning a copy of
/// the bytes written.
pub async fn stream_body<R, W>(
  reader: &mut R,
  framing: Framing,
  writer: &mut W,
) -> std::result::Result<Bytes, CopyError>
where
  R: AsyncBufRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut sink = TeeWriter::new(&mut *writer);
  match framing {
    Framing::Empty => {}
    Framing::Length(len) => {
      let mut source = (&mut *reader).take(len);
      let copied = pump(&mut source, &mut sink).await?;
      if copied < len {
        return Err(CopyError::Read(new_io_error(
          ErrorKind::UnexpectedEof,
          &format!("body ended after {} of {} bytes", copied, len),
        )));
      }
    }
    Framing::Chunked => {
      let mut decoder = ChunkedDecoder::capturing(&mut *reader);
      let mut buf = vec![0u8; COPY_BUFFER_SIZE];
      loop {
        let n = decoder
          .read(&mut buf)
          .await
          .map_err(|e| CopyError::Read(e.into()))?;
        let raw = decoder.take_raw();
        sink
          .write_all(&raw)
          .await
          .map_err(|e| CopyError::Write(e.into()))?;
        if n == 0 && decoder.is_done() {
          break;
        }
      }
    }
    Framing::UntilClose => {
      pump(reader, &mut sink).await?;
    }
  }
  sink.flush().await.map_err(|e| CopyError::Write(e.into()))?;
  Ok(Bytes::from(sink.take_copy()))
}

async fn pump<R, W>(source: &mut R, sink: &mut W) -> std::result::Result<u64, CopyError>
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut buf = vec![0u8; COPY_BUFFER_SIZE];
  let mut total = 0u64;
  loop {
    let n = source
      .read(&mut buf)
      .await
      .map_err(|e| CopyError::Read(e.into()))?;
    if n == 0 {
      return Ok(total);
    }
    sink
      .write_all(&buf[..n])
      .await
      .map_err(|e| CopyError::Write(e.into()))?;
    total += n as u64;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_read_chunked_keeps_wire_form() {
    let mut input: &[u8] = b"4\r\nWiki\r\n0\r\n\r\nNEXT";
    let body = read_body(&mut input, Framing::Chunked, MAX_BODY_SIZE).await.unwrap().unwrap();
    assert_eq!(body.as_ref(), b"4\r\nWiki\r\n0\r\n\r\n");
    assert_eq!(input, b"NEXT");
  }

  #[tokio::test]
  async fn test_short_length_body_fails() {
    let mut input: &[u8] = b"abc";
    assert!(read_body(&mut input, Framing::Length(5), MAX_BODY_SIZE).await.is_err());
    let mut input: &[u8] = b"abc";
    let mut out = Vec::new();
    let err = stream_body(&mut input, Framing::Length(5), &mut out)
      .await
      .unwrap_err();
    assert!(matches!(err, CopyError::Read(_)));
  }

  #[tokio::test]
  async fn test_body_size_limit() {
    let mut input: &[u8] = b"0123456789";
    assert!(read_body(&mut input, Framing::Length(10), 4).await.is_err());
    assert_eq!(input.len(), 10);

    let mut input: &[u8] = b"0123456789";
    assert!(read_body(&mut input, Framing::UntilClose, 4).await.is_err());
    let mut input: &[u8] = b"0123";
    let body = read_body(&mut input, Framing::UntilClose, 4).await.unwrap();
    assert_eq!(body.unwrap().as_ref(), b"0123");

    let mut input: &[u8] = b"a\r\n0123456789\r\n0\r\n\r\n";
    assert!(read_body(&mut input, Framing::Chunked, 8).await.is_err());
    let mut input: &[u8] = b"a\r\n0123456789\r\n0\r\n\r\n";
    let body = read_body(&mut input, Framing::Chunked, 64).await.unwrap();
    assert_eq!(body.unwrap().len(), 20);
  }

  #[tokio::test]
  async fn test_stream_forwards_and_copies() {
    let mut input: &[u8] = b"5\r\nhello\r\n0\r\n\r\n";
    let mut out = Vec::new();
    let copy = stream_body(&mut input, Framing::Chunked, &mut out)
      .await
      .unwrap();
    assert_eq!(out, b"5\r\nhello\r\n0\r\n\r\n");
    assert_eq!(copy.as_ref(), out.as_slice());
  }
}
