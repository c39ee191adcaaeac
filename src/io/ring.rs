/// Circular byte buffer.
///
/// Bytes are appended at the tail with [`RingBuffer::write`] and consumed
/// from the head with [`RingBuffer::read`]; writes never grow the buffer.
/// [`RingBuffer::unread`] puts bytes back in front of the head, which is what
/// sniffing a stream needs, and grows the buffer when they do not fit.
#[derive(Debug, Clone)]
pub struct RingBuffer {
  buf: Box<[u8]>,
  head: usize,
  len: usize,
}

impl RingBuffer {
  /// Create a buffer holding at most `capacity` bytes.
  pub fn with_capacity(capacity: usize) -> Self {
    Self {
      buf: vec![0u8; capacity.max(1)].into_boxed_slice(),
      head: 0,
      len: 0,
    }
  }
  /// Total number of bytes the buffer can hold.
  pub fn capacity(&self) -> usize {
    self.buf.len()
  }
  /// Number of readable bytes.
  pub fn len(&self) -> usize {
    self.len
  }
  /// `true` when no bytes are buffered.
  pub fn is_empty(&self) -> bool {
    self.len == 0
  }
  /// Free space left.
  pub fn remaining(&self) -> usize {
    self.capacity() - self.len
  }
  /// Append as many bytes of `data` as fit, returning how many were taken.
  pub fn write(&mut self, data: &[u8]) -> usize {
    let n = data.len().min(self.remaining());
    let cap = self.capacity();
    for (i, b) in data[..n].iter().enumerate() {
      self.buf[(self.head + self.len + i) % cap] = *b;
    }
    self.len += n;
    n
  }
  /// Push bytes back in front of the head so they are read next.
  pub fn unread(&mut self, data: &[u8]) {
    if data.len() > self.remaining() {
      self.grow(data.len());
    }
    let n = data.len();
    let cap = self.capacity();
    self.head = (self.head + cap - n) % cap;
    for (i, b) in data.iter().enumerate() {
      self.buf[(self.head + i) % cap] = *b;
    }
    self.len += n;
  }
  // room for `additional` more bytes; buffered bytes move to the front
  fn grow(&mut self, additional: usize) {
    let capacity = (self.len + additional).next_power_of_two();
    let mut buf = self.to_vec();
    buf.resize(capacity.max(self.capacity()), 0);
    self.buf = buf.into_boxed_slice();
    self.head = 0;
  }
  /// Copy buffered bytes into `out` without consuming them.
  pub fn peek(&self, out: &mut [u8]) -> usize {
    let n = out.len().min(self.len);
    let cap = self.capacity();
    for (i, slot) in out[..n].iter_mut().enumerate() {
      *slot = self.buf[(self.head + i) % cap];
    }
    n
  }
  /// Move buffered bytes into `out`.
  pub fn read(&mut self, out: &mut [u8]) -> usize {
    let n = self.peek(out);
    self.head = (self.head + n) % self.capacity();
    self.len -= n;
    if self.len == 0 {
      self.head = 0;
    }
    n
  }
  /// Copy of every buffered byte, head first.
  pub fn to_vec(&self) -> Vec<u8> {
    let mut out = vec![0u8; self.len];
    self.peek(&mut out);
    out
  }
  /// Drop everything.
  pub fn clear(&mut self) {
    self.head = 0;
    self.len = 0;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_wraps_around() {
    let mut ring = RingBuffer::with_capacity(4);
    assert_eq!(ring.write(b"abc"), 3);
    let mut out = [0u8; 2];
    assert_eq!(ring.read(&mut out), 2);
    assert_eq!(&out, b"ab");
    assert_eq!(ring.write(b"defg"), 3);
    assert_eq!(ring.to_vec(), b"cdef");
    assert_eq!(ring.remaining(), 0);
  }

  #[test]
  fn test_unread_goes_first() {
    let mut ring = RingBuffer::with_capacity(8);
    ring.write(b"world");
    ring.unread(b"hi ");
    assert_eq!(ring.to_vec(), b"hi world");
    let mut out = [0u8; 8];
    assert_eq!(ring.read(&mut out), 8);
    assert!(ring.is_empty());
  }

  #[test]
  fn test_unread_beyond_capacity_keeps_everything() {
    let mut ring = RingBuffer::with_capacity(4);
    ring.write(b"xyz");
    let mut out = [0u8; 2];
    ring.read(&mut out);
    ring.unread(b"0123456789");
    assert_eq!(ring.to_vec(), b"0123456789z");
    assert!(ring.capacity() >= 11);
    let mut out = vec![0u8; 11];
    assert_eq!(ring.read(&mut out), 11);
    assert_eq!(out, b"0123456789z");
  }
}
