//! Bounded capture of console output.
//!
//! [`OutputBuffer`] holds an ordered sequence of stdout/stderr chunks under a
//! fixed byte budget. The first half of the budget is a pinned head: the
//! earliest output is never evicted. Once the budget is exceeded the oldest
//! chunks after the head are evicted first, so the most recent output also
//! survives. Rendering inserts [`TRUNCATION_MARKER`] once at the eviction
//! point. When both streams are rendered separately, only the stream that lost
//! the first evicted bytes carries the marker.
//!
//! Held bytes never exceed `max_bytes`; rendered text, both streams together,
//! never exceeds `max_bytes + TRUNCATION_MARKER.len()`.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Synthetic chunk rendered where output was evicted.
pub const TRUNCATION_MARKER: &str = "\n...[output truncated]...\n";

/// Which console stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    /// `console.log`, `console.info`, `console.debug`.
    Stdout,
    /// `console.warn`, `console.error`.
    Stderr,
}

impl OutputStream {
    fn index(self) -> usize {
        match self {
            Self::Stdout => 0,
            Self::Stderr => 1,
        }
    }
}

/// A single captured write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    /// Originating stream.
    pub stream: OutputStream,
    /// The written text.
    pub text: String,
}

/// Rendered stdout/stderr of one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    /// Rendered stdout.
    pub stdout: String,
    /// Rendered stderr.
    pub stderr: String,
    /// Whether anything was evicted.
    pub truncated: bool,
}

/// Byte-bounded, head-preserving output buffer.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    max_bytes: usize,
    head: Vec<OutputChunk>,
    head_bytes: usize,
    head_sealed: bool,
    tail: VecDeque<OutputChunk>,
    tail_bytes: usize,
    dropped: [usize; 2],
    first_evicted: Option<OutputStream>,
}

impl OutputBuffer {
    /// Create an empty buffer holding at most `max_bytes` of output.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            head: Vec::new(),
            head_bytes: 0,
            head_sealed: false,
            tail: VecDeque::new(),
            tail_bytes: 0,
            dropped: [0, 0],
            first_evicted: None,
        }
    }

    /// Account `text` against the budget and append it, evicting as needed.
    pub fn push(&mut self, stream: OutputStream, text: &str) {
        if text.is_empty() {
            return;
        }
        let len = text.len();
        if self.max_bytes == 0 {
            self.drop_bytes(stream, len);
            return;
        }

        if !self.head_sealed {
            if self.head_bytes + len <= self.max_bytes / 2 {
                self.head.push(OutputChunk {
                    stream,
                    text: text.to_string(),
                });
                self.head_bytes += len;
                return;
            }
            // Head closes at the first chunk that does not fit, keeping order.
            self.head_sealed = true;
        }

        self.tail.push_back(OutputChunk {
            stream,
            text: text.to_string(),
        });
        self.tail_bytes += len;
        self.evict();
    }

    fn evict(&mut self) {
        while self.head_bytes + self.tail_bytes > self.max_bytes {
            if self.tail.len() > 1 {
                if let Some(old) = self.tail.pop_front() {
                    self.tail_bytes -= old.text.len();
                    self.drop_bytes(old.stream, old.text.len());
                }
                continue;
            }

            // A single chunk larger than the room left: keep its end.
            let room = self.max_bytes - self.head_bytes;
            let mut trimmed = None;
            if let Some(only) = self.tail.front_mut() {
                let excess = only.text.len().saturating_sub(room);
                let cut = (excess..=only.text.len())
                    .find(|&i| only.text.is_char_boundary(i))
                    .unwrap_or(only.text.len());
                only.text.drain(..cut);
                trimmed = Some((only.stream, cut, only.text.is_empty()));
            }
            if let Some((stream, cut, emptied)) = trimmed {
                self.tail_bytes -= cut;
                self.drop_bytes(stream, cut);
                if emptied {
                    self.tail.clear();
                }
            }
            break;
        }
    }

    fn drop_bytes(&mut self, stream: OutputStream, len: usize) {
        if len == 0 {
            return;
        }
        self.dropped[stream.index()] += len;
        self.first_evicted.get_or_insert(stream);
    }

    /// Bytes currently held, excluding the marker.
    pub fn retained_bytes(&self) -> usize {
        self.head_bytes + self.tail_bytes
    }

    /// Bytes evicted so far across both streams.
    pub fn dropped_bytes(&self) -> usize {
        self.dropped[0] + self.dropped[1]
    }

    /// Whether any output has been evicted.
    pub fn truncated(&self) -> bool {
        self.dropped_bytes() > 0
    }

    /// The configured budget.
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Render one stream, or both interleaved in capture order when `None`.
    ///
    /// A single stream carries the marker only if it lost the first evicted
    /// bytes, so rendering stdout and stderr separately yields one marker.
    pub fn render(&self, stream: Option<OutputStream>) -> String {
        let wanted = |chunk: &&OutputChunk| stream.is_none_or(|s| chunk.stream == s);
        let lost = match stream {
            Some(s) => self.first_evicted == Some(s),
            None => self.truncated(),
        };

        let mut out = String::new();
        for chunk in self.head.iter().filter(wanted) {
            out.push_str(&chunk.text);
        }
        if lost {
            out.push_str(TRUNCATION_MARKER);
        }
        for chunk in self.tail.iter().filter(wanted) {
            out.push_str(&chunk.text);
        }
        out
    }

    /// Rendered stdout.
    pub fn stdout(&self) -> String {
        self.render(Some(OutputStream::Stdout))
    }

    /// Rendered stderr.
    pub fn stderr(&self) -> String {
        self.render(Some(OutputStream::Stderr))
    }

    /// Render both streams for hand-off to the truncator.
    pub fn snapshot(&self) -> CapturedOutput {
        CapturedOutput {
            stdout: self.stdout(),
            stderr: self.stderr(),
            truncated: self.truncated(),
        }
    }
}
