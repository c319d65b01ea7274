//! Per-socket byte reservoir.
//!
//! Non-blocking reads land here in whatever pieces the kernel hands out.
//! The parser pulls complete CRLF lines or raw byte runs off the front; the
//! reservoir knows nothing about HTTP.

use std::io::{self, Read};

/// What a drain of the socket produced.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes were appended (possibly zero) and the socket would block.
    Drained(usize),
    /// Peer closed its write side. Bytes read before EOF are kept.
    Closed(usize),
    /// Stopped early because the reservoir reached its cap.
    Full(usize),
}

#[derive(Debug, Default)]
pub struct ByteReader {
    buf: Vec<u8>,
}

impl ByteReader {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(8192),
        }
    }

    /// Reads from `src` until it would block, hits EOF or the reservoir holds
    /// at least `cap` bytes.
    pub fn fill_from<R: Read>(&mut self, src: &mut R, cap: usize) -> io::Result<ReadOutcome> {
        let mut chunk = [0u8; 16384];
        let mut total = 0;
        loop {
            if self.buf.len() >= cap {
                return Ok(ReadOutcome::Full(total));
            }
            match src.read(&mut chunk) {
                Ok(0) => return Ok(ReadOutcome::Closed(total)),
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    total += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::Drained(total));
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Removes and returns the next line without its CRLF terminator, or
    /// `None` if no complete line is buffered yet.
    pub fn take_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.buf.windows(2).position(|w| w == b"\r\n")?;
        let mut line: Vec<u8> = self.buf.drain(..pos + 2).collect();
        line.truncate(pos);
        Some(line)
    }

    /// Removes and returns up to `max` bytes from the front.
    pub fn take_bytes(&mut self, max: usize) -> Vec<u8> {
        let n = max.min(self.buf.len());
        self.buf.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
