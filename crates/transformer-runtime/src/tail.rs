//! Tailing of container output streams.

use std::collections::VecDeque;
use std::fmt;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{error, info, warn};
use transformer_core::RunId;

/// Number of lines kept per stream.
pub const TAIL_LINES: usize = 10;

/// Which container stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// Bounded ring buffer holding the last lines of a stream.
#[derive(Debug, Clone)]
pub struct LogTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl Default for LogTail {
    fn default() -> Self {
        Self::new(TAIL_LINES)
    }
}

impl LogTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a line, evicting the oldest once full.
    pub fn push(&mut self, line: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// The retained lines joined with newlines.
    pub fn joined(&self) -> String {
        self.lines().collect::<Vec<_>>().join("\n")
    }
}

/// Tails of both container streams.
#[derive(Debug, Clone, Default)]
pub struct CapturedLogs {
    pub stdout: LogTail,
    pub stderr: LogTail,
}

/// Read `reader` to EOF, logging every line and keeping the last
/// [`TAIL_LINES`] of them.
///
/// A read error ends the stream; whatever was tailed so far is kept.
pub async fn tail_stream<R>(reader: R, kind: StreamKind, run_id: &RunId) -> LogTail
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut tail = LogTail::default();
    let mut buf = Vec::new();
    let mut line_count = 0u64;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                info!(run_id = %run_id, stream = %kind, lines = line_count, "Transformer stream closed (EOF)");
                break;
            }
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                line_count += 1;
                match kind {
                    StreamKind::Stdout => info!(run_id = %run_id, stream = %kind, "{}", line),
                    StreamKind::Stderr => warn!(run_id = %run_id, stream = %kind, "{}", line),
                }
                tail.push(line);
            }
            Err(e) => {
                error!(run_id = %run_id, stream = %kind, error = %e, "Error reading transformer output");
                break;
            }
        }
    }

    tail
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_keeps_last_lines() {
        let mut tail = LogTail::default();
        for i in 0..25 {
            tail.push(format!("line {}", i));
        }

        assert_eq!(tail.len(), TAIL_LINES);
        assert_eq!(tail.lines().next(), Some("line 15"));
        assert!(tail.joined().ends_with("line 24"));
    }

    #[test]
    fn test_zero_capacity_tail() {
        let mut tail = LogTail::new(0);
        tail.push("ignored");
        assert!(tail.is_empty());
    }

    #[tokio::test]
    async fn test_tail_stream_splits_lines() {
        let input: &[u8] = b"one\r\ntwo\nthree without newline";
        let tail = tail_stream(input, StreamKind::Stdout, &RunId::new("r")).await;

        assert_eq!(
            tail.lines().collect::<Vec<_>>(),
            vec!["one", "two", "three without newline"]
        );
    }

    #[tokio::test]
    async fn test_tail_stream_tolerates_invalid_utf8() {
        let input: &[u8] = b"ok\n\xff\xfe bad\n";
        let tail = tail_stream(input, StreamKind::Stderr, &RunId::new("r")).await;

        assert_eq!(tail.len(), 2);
        assert!(tail.joined().contains("bad"));
    }
}
