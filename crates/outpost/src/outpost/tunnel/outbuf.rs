use std::io;

use bytes::{Buf, BytesMut};

/// FIFO of bytes waiting for the transport to become writable.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    buf: BytesMut,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn has_pending_output(&self) -> bool {
        !self.buf.is_empty()
    }

    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    /// Offers the whole pending queue to `write` once and drops whatever it accepted.
    ///
    /// `write` has the contract of [`io::Write::write`]; errors (including `WouldBlock`)
    /// are returned untouched and leave the queue as it was.
    pub fn drain<F>(&mut self, write: F) -> io::Result<usize>
    where
        F: FnOnce(&[u8]) -> io::Result<usize>,
    {
        if self.buf.is_empty() {
            return Ok(0);
        }
        let n = write(&self.buf)?.min(self.buf.len());
        self.buf.advance(n);
        Ok(n)
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
