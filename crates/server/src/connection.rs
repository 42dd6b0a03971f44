//! Request framing for one client connection

use std::net::SocketAddr;
use tokio::net::TcpStream;

/// Result of feeding a chunk of bytes into a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Fewer lines than expected so far
    Pending,
    /// The expected number of lines was collected; later bytes are ignored
    Complete,
    /// A line reached the length cap and was cut off there
    Overflow,
}

/// Line framer
///
/// Collects newline-terminated lines until `expected` of them are
/// available. A single line never grows beyond `max_line_len` bytes.
#[derive(Debug)]
pub struct Framer {
    expected: usize,
    max_line_len: usize,
    lines: Vec<String>,
    partial: Vec<u8>,
}

impl Framer {
    pub fn new(expected: usize, max_line_len: usize) -> Self {
        Self {
            expected,
            max_line_len,
            lines: Vec::with_capacity(expected),
            partial: Vec::new(),
        }
    }

    /// How many bytes the next read may return without overrunning the cap
    pub fn read_limit(&self) -> usize {
        self.max_line_len.saturating_sub(self.partial.len()).max(1)
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Progress {
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.partial.extend_from_slice(&rest[..pos]);
            self.push_partial();
            if self.is_complete() {
                return Progress::Complete;
            }
            rest = &rest[pos + 1..];
        }

        self.partial.extend_from_slice(rest);
        if self.partial.len() >= self.max_line_len {
            self.partial.truncate(self.max_line_len);
            self.push_partial();
            return Progress::Overflow;
        }
        Progress::Pending
    }

    /// Peer closed its side; an unterminated line still counts
    pub fn finish(&mut self) {
        if !self.partial.is_empty() && !self.is_complete() {
            self.push_partial();
        }
    }

    /// Exactly the expected number of lines were collected
    pub fn is_complete(&self) -> bool {
        self.lines.len() == self.expected
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }

    fn push_partial(&mut self) {
        let line = String::from_utf8_lossy(&self.partial).into_owned();
        self.partial.clear();
        self.lines.push(line);
    }
}

/// An accepted client and the request read from it so far
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub framer: Framer,
}
