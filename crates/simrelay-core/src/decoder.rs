//! Line decoder for raw process output.
//!
//! Implements tolerant reader pattern: bytes arrive in arbitrary chunks, are
//! split on `\n`, and every complete line becomes at most one [`Event`].
//! A line that fails to decode is forwarded as a log line, never dropped.

use serde_json::Value;

use crate::event::{Channel, Event};

/// Default upper bound for a single buffered line (1 MiB).
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// Incremental decoder for one output stream of one session.
#[derive(Debug)]
pub struct LineDecoder {
    channel: Channel,
    /// Unterminated bytes; never contains `\n` between calls.
    pending: Vec<u8>,
    max_line_bytes: usize,
    /// Dropping the rest of a line that was flushed for exceeding the limit.
    discarding: bool,
}

impl LineDecoder {
    pub fn new(channel: Channel) -> Self {
        Self::with_max_line_bytes(channel, DEFAULT_MAX_LINE_BYTES)
    }

    pub fn with_max_line_bytes(channel: Channel, max_line_bytes: usize) -> Self {
        Self {
            channel,
            pending: Vec::new(),
            max_line_bytes: max_line_bytes.max(1),
            discarding: false,
        }
    }

    pub const fn channel(&self) -> Channel {
        self.channel
    }

    /// Bytes currently held back waiting for a line terminator.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Feed a chunk and return the events for every line it completed.
    ///
    /// Unterminated trailing bytes stay buffered until a later chunk (or
    /// [`finish`](Self::finish)) completes them. A line that grows past
    /// `max_line_bytes` is emitted truncated and the rest of it, up to the
    /// next `\n`, is discarded.
    pub fn push(&mut self, mut chunk: &[u8]) -> Vec<Event> {
        if self.discarding {
            let Some(end) = chunk.iter().position(|&b| b == b'\n') else {
                return Vec::new();
            };
            self.discarding = false;
            chunk = &chunk[end + 1..];
        }

        // Earlier bytes hold no terminator, so only the new ones are scanned.
        let mut scan = self.pending.len();
        self.pending.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[scan..].iter().position(|&b| b == b'\n') {
            let end = scan + offset;
            if let Some(event) = self.classify(&self.pending[start..end]) {
                events.push(event);
            }
            start = end + 1;
            scan = start;
        }
        self.pending.drain(..start);

        if self.pending.len() > self.max_line_bytes {
            tracing::warn!(
                channel = %self.channel,
                bytes = self.pending.len(),
                limit = self.max_line_bytes,
                "Unterminated line exceeds limit, truncating"
            );
            let truncated = std::mem::take(&mut self.pending);
            events.extend(self.classify(&truncated));
            self.discarding = true;
        }

        events
    }

    /// Flush the buffered remainder as a final line. Call once the stream
    /// has reached EOF.
    pub fn finish(&mut self) -> Option<Event> {
        self.discarding = false;
        let rest = std::mem::take(&mut self.pending);
        self.classify(&rest)
    }

    fn classify(&self, raw: &[u8]) -> Option<Event> {
        let text = String::from_utf8_lossy(raw);
        let line = text.strip_suffix('\r').unwrap_or(&text[..]);
        if line.trim().is_empty() {
            return None;
        }

        match self.channel {
            Channel::Stdout => Some(match serde_json::from_str::<Value>(line) {
                Ok(payload) => Event::Data(payload),
                Err(e) => {
                    tracing::debug!(error = %e, "Non-JSON stdout line");
                    Event::log(Channel::Stdout, line)
                }
            }),
            Channel::Stderr => Some(Event::log(Channel::Stderr, line)),
        }
    }
}
