//! Directional relay state.

use std::io::{self, Read, Write};

use mio::Token;

use super::buffer::RelayBuffer;

/// Outcome of pumping a source into its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// The source has nothing more to read right now; everything read was delivered.
    Drained,
    /// The destination stopped accepting bytes; the remainder is buffered.
    Stalled,
    /// The source reached end of stream; everything read was delivered.
    Finished,
}

/// Forwarding context for one direction of one connection pair.
///
/// Owns the buffer only. `source` and `destination` name channels owned by the
/// instance.
pub struct RelayState {
    buffer: RelayBuffer,
    pub(crate) source: Token,
    pub(crate) destination: Token,
}

impl RelayState {
    pub fn new(source: Token, destination: Token) -> Self {
        Self {
            buffer: RelayBuffer::new(),
            source,
            destination,
        }
    }

    pub fn source(&self) -> Token {
        self.source
    }

    pub fn destination(&self) -> Token {
        self.destination
    }

    /// Bytes read from the source and not yet delivered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Read from `source` and forward to `destination` until one of them
    /// cannot make progress.
    pub fn pump<R, W>(&mut self, mut source: R, mut destination: W) -> io::Result<Flow>
    where
        R: Read,
        W: Write,
    {
        debug_assert!(self.buffer.is_empty());
        loop {
            match self.buffer.read_from(&mut source) {
                Ok(0) => return Ok(Flow::Finished),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flow::Drained),
                Err(e) => return Err(e),
            }
            if !self.buffer.write_to(&mut destination)? {
                return Ok(Flow::Stalled);
            }
        }
    }

    /// Retry delivering the buffered remainder. `Ok(true)` once empty.
    pub fn flush<W: Write>(&mut self, destination: W) -> io::Result<bool> {
        self.buffer.write_to(destination)
    }
}
