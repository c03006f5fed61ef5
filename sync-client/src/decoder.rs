//! Newline-delimited watch event decoding.
//!
//! HTTP bodies arrive in chunks that do not line up with events: a chunk may
//! hold several events, or end halfway through one. [`LineDecoder`] buffers
//! the partial tail until its newline arrives.
//!
//! A line that outgrows the limit is reported once; the rest of it, up to
//! and including its newline, is skipped.

use crate::error::ClientError;
use sync_types::WatchEvent;

/// Splits a byte stream into [`WatchEvent`]s, one per line.
#[derive(Debug)]
pub struct LineDecoder {
    buf: Vec<u8>,
    max_line: usize,
    /// Prefix of `buf` already known to hold no newline.
    scanned: usize,
    /// Inside an oversized line that was already reported.
    discarding: bool,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl LineDecoder {
    /// Largest line accepted by [`LineDecoder::new`].
    pub const DEFAULT_MAX_LINE: usize = 16 * 1024 * 1024;

    /// Create a decoder with the default line limit.
    pub fn new() -> Self {
        Self::with_max_line(Self::DEFAULT_MAX_LINE)
    }

    /// Create a decoder that rejects lines longer than `max_line` bytes.
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_line,
            scanned: 0,
            discarding: false,
        }
    }

    /// Append a chunk of the body.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes buffered but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decode the next complete line, skipping blank ones.
    ///
    /// Returns `None` until a newline is buffered.
    pub fn next_event(&mut self) -> Option<Result<WatchEvent, ClientError>> {
        loop {
            let newline = self.buf[self.scanned..].iter().position(|b| *b == b'\n');
            let Some(offset) = newline else {
                self.scanned = self.buf.len();
                if self.discarding {
                    self.clear();
                } else if self.buf.len() > self.max_line {
                    let len = self.buf.len();
                    self.clear();
                    self.discarding = true;
                    return Some(Err(ClientError::LineTooLong(len)));
                }
                return None;
            };
            let line: Vec<u8> = self.buf.drain(..=self.scanned + offset).collect();
            self.scanned = 0;
            if std::mem::take(&mut self.discarding) {
                continue;
            }
            if line.len() > self.max_line + 1 {
                return Some(Err(ClientError::LineTooLong(line.len())));
            }
            if is_blank(&line) {
                continue;
            }
            return Some(WatchEvent::from_line(&line).map_err(ClientError::from));
        }
    }

    /// Decode whatever is left once the body has ended.
    ///
    /// A final event without a trailing newline is still delivered.
    pub fn finish(&mut self) -> Option<Result<WatchEvent, ClientError>> {
        if let Some(event) = self.next_event() {
            return Some(event);
        }
        self.scanned = 0;
        let rest = std::mem::take(&mut self.buf);
        if std::mem::take(&mut self.discarding) || is_blank(&rest) {
            return None;
        }
        Some(WatchEvent::from_line(&rest).map_err(ClientError::from))
    }

    fn clear(&mut self) {
        self.buf.clear();
        self.scanned = 0;
    }
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}
