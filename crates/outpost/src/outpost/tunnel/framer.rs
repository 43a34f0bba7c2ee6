use bytes::{Bytes, BytesMut};

pub const LINE_DELIMITER: u8 = b'\n';

/// Incremental delimiter framer over a byte stream.
///
/// Chunks are appended with [`LineFramer::feed`]; complete lines are handed out lazily
/// with the delimiter stripped. Anything after the last delimiter stays buffered until
/// a later chunk terminates it.
#[derive(Debug)]
pub struct LineFramer {
    delimiter: u8,
    buf: BytesMut,
    // Bytes of `buf` already known to contain no delimiter.
    scanned: usize,
}

impl LineFramer {
    pub fn new(delimiter: u8) -> Self {
        Self {
            delimiter,
            buf: BytesMut::new(),
            scanned: 0,
        }
    }

    /// Appends `chunk` and returns an iterator over the lines it completes.
    ///
    /// Dropping the iterator early loses nothing: unconsumed lines are returned by
    /// the next call to `feed` (or `next_line`).
    pub fn feed(&mut self, chunk: &[u8]) -> Lines<'_> {
        self.buf.extend_from_slice(chunk);
        Lines { framer: self }
    }

    pub fn next_line(&mut self) -> Option<Bytes> {
        let pos = self.buf[self.scanned..]
            .iter()
            .position(|b| *b == self.delimiter);
        match pos {
            Some(i) => {
                let mut line = self.buf.split_to(self.scanned + i + 1);
                line.truncate(line.len() - 1);
                self.scanned = 0;
                Some(line.freeze())
            }
            None => {
                self.scanned = self.buf.len();
                None
            }
        }
    }

    /// Bytes of the trailing, not yet terminated line.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(LINE_DELIMITER)
    }
}

pub struct Lines<'a> {
    framer: &'a mut LineFramer,
}

impl Iterator for Lines<'_> {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        self.framer.next_line()
    }
}
