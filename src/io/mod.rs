//! Byte level framing and stream helpers shared by the proxy stages.
pub mod chunked;
#[cfg(feature = "gzip")]
pub mod gzip;
/// Circular byte buffer
pub mod ring;
/// Stream adapters
pub mod stream;

pub use chunked::{ChunkedDecoder, ChunkedEncoder};
pub use ring::RingBuffer;
pub use stream::{CountingReader, EofNotify, PeekableStream, TeeWriter};
