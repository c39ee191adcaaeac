//! gzip content coding
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Compress `data` into a gzip member.
pub fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
  let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
  encoder.write_all(data)?;
  encoder.finish()
}

/// Decompress a gzip body, concatenated members included.
pub fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
  let mut decoder = MultiGzDecoder::new(data);
  let mut out = Vec::new();
  decoder.read_to_end(&mut out)?;
  Ok(out)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_gzip_members_concatenate() {
    let mut wire = gzip(b"hello ").unwrap();
    wire.extend(gzip(b"world").unwrap());
    assert_eq!(gunzip(&wire).unwrap(), b"hello world");
    assert!(gunzip(b"not gzip").is_err());
  }
}
