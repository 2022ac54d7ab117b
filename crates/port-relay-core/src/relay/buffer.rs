//! Fixed-capacity relay buffer.

use std::io::{self, Read, Write};

/// Capacity of one direction's buffer. Intake stops rather than grow past it.
pub const BUFFER_SIZE: usize = 2048;

/// Bytes read from a source and not yet written to its destination.
///
/// `data[head..tail]` holds the undelivered bytes.
pub struct RelayBuffer {
    data: Box<[u8; BUFFER_SIZE]>,
    head: usize,
    tail: usize,
}

impl RelayBuffer {
    pub fn new() -> Self {
        Self {
            data: Box::new([0u8; BUFFER_SIZE]),
            head: 0,
            tail: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    /// Read once from `source` into the free space.
    ///
    /// `Ok(0)` means end of stream, unless the buffer was already full.
    pub fn read_from<R: Read>(&mut self, mut source: R) -> io::Result<usize> {
        if self.is_empty() {
            self.clear();
        }
        loop {
            match source.read(&mut self.data[self.tail..]) {
                Ok(n) => {
                    self.tail += n;
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Write buffered bytes to `destination` until empty or it would block.
    ///
    /// Returns `Ok(true)` once everything was written and the buffer is cleared,
    /// `Ok(false)` when the destination stopped accepting bytes.
    pub fn write_to<W: Write>(&mut self, mut destination: W) -> io::Result<bool> {
        while !self.is_empty() {
            match destination.write(&self.data[self.head..self.tail]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.head += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.clear();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Accepts at most `budget` bytes, then reports `WouldBlock`.
    struct Throttled {
        written: Vec<u8>,
        budget: usize,
    }

    impl Write for Throttled {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.budget);
            self.budget -= n;
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn read_is_capped_at_capacity() {
        let source = vec![7u8; BUFFER_SIZE * 3];
        let mut buffer = RelayBuffer::new();

        let n = buffer.read_from(&source[..]).unwrap();
        assert_eq!(n, BUFFER_SIZE);
        assert_eq!(buffer.len(), BUFFER_SIZE);

        // A full buffer takes nothing more.
        assert_eq!(buffer.read_from(&source[..]).unwrap(), 0);
        assert_eq!(buffer.len(), BUFFER_SIZE);
    }

    #[test]
    fn empty_source_reads_zero() {
        let mut buffer = RelayBuffer::new();
        assert_eq!(buffer.read_from(io::empty()).unwrap(), 0);
        assert!(buffer.is_empty());
    }

    #[test]
    fn full_write_clears_buffer() {
        let mut buffer = RelayBuffer::new();
        buffer.read_from(&b"hello"[..]).unwrap();

        let mut sink = Vec::new();
        assert!(buffer.write_to(&mut sink).unwrap());
        assert_eq!(sink, b"hello");
        assert!(buffer.is_empty());
    }

    #[test]
    fn partial_write_keeps_remainder_in_order() {
        let payload: Vec<u8> = (0..100u8).collect();
        let mut buffer = RelayBuffer::new();
        buffer.read_from(&payload[..]).unwrap();

        let mut dest = Throttled {
            written: Vec::new(),
            budget: 30,
        };
        assert!(!buffer.write_to(&mut dest).unwrap());
        assert_eq!(buffer.len(), 70);

        dest.budget = 1000;
        assert!(buffer.write_to(&mut dest).unwrap());
        assert_eq!(dest.written, payload);
    }

    #[test]
    fn drained_buffer_reuses_full_capacity() {
        let mut buffer = RelayBuffer::new();
        buffer.read_from(&[1u8; BUFFER_SIZE][..]).unwrap();
        let mut dest = Throttled {
            written: Vec::new(),
            budget: BUFFER_SIZE - 1,
        };
        assert!(!buffer.write_to(&mut dest).unwrap());
        dest.budget = 1;
        assert!(buffer.write_to(&mut dest).unwrap());

        assert_eq!(
            buffer.read_from(&[2u8; BUFFER_SIZE][..]).unwrap(),
            BUFFER_SIZE
        );
    }

    #[test]
    fn zero_length_write_is_an_error() {
        struct Closed;
        impl Write for Closed {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut buffer = RelayBuffer::new();
        buffer.read_from(&b"x"[..]).unwrap();
        let err = buffer.write_to(Closed).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }
}
