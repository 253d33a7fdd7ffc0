//! Draining of child process output streams
//!
//! Each stdout/stderr pipe of a supervised child gets its own task that reads
//! it line by line until end-of-stream. Every line goes to a sink (normally
//! the log), and the last few lines are kept so that a [`DrainReport`] can
//! say what the child printed right before its stream closed.

use crate::process::ChildName;
use std::collections::VecDeque;
use std::fmt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Number of trailing lines kept for the error digest
pub const DIGEST_LINES: usize = 3;

/// Longest line kept in memory; the rest of a longer line is discarded
pub const MAX_LINE_BYTES: usize = 8 * 1024;

/// `read_error` of a report for a drain that was cut off after its child exited
pub const ABANDONED: &str = "abandoned: stream still open after the child exited";

/// Which output stream of a child is being drained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Stdout => f.write_str("stdout"),
            StreamKind::Stderr => f.write_str("stderr"),
        }
    }
}

/// Fixed-capacity window of the most recently read lines
#[derive(Debug, Clone)]
pub struct RecentLines {
    lines: VecDeque<String>,
    capacity: usize,
}

impl RecentLines {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record a line, evicting the oldest one when full
    pub fn push(&mut self, line: String) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Non-blank lines in the window, oldest first
    pub fn digest(&self) -> Vec<String> {
        self.lines
            .iter()
            .filter(|line| !line.trim().is_empty())
            .cloned()
            .collect()
    }
}

impl Default for RecentLines {
    fn default() -> Self {
        Self::new(DIGEST_LINES)
    }
}

/// Sent exactly once per drained stream, when the stream closes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub child: ChildName,
    pub stream: StreamKind,
    /// Up to [`DIGEST_LINES`] non-blank lines read last, oldest first
    pub lines: Vec<String>,
    /// Total number of lines read from the stream
    pub lines_read: u64,
    /// Set when the stream ended with a read error instead of end-of-stream
    pub read_error: Option<String>,
}

impl DrainReport {
    /// Report for a stream whose drain task had to be aborted
    pub fn abandoned(child: ChildName, stream: StreamKind) -> Self {
        Self {
            child,
            stream,
            lines: Vec::new(),
            lines_read: 0,
            read_error: Some(ABANDONED.to_string()),
        }
    }

    /// True when there is nothing worth reporting
    pub fn is_clean(&self) -> bool {
        self.lines.is_empty() && self.read_error.is_none()
    }
}

/// Sink that logs every line, tagged with the child and stream it came from
pub fn log_lines(child: ChildName, stream: StreamKind) -> impl FnMut(&str) + Send + 'static {
    move |line| debug!(target: "abcored::child", child = %child, stream = %stream, "{}", line)
}

/// Start draining `reader` on its own task.
///
/// Every line is handed to `sink`. When the stream ends (or fails), a
/// [`DrainReport`] is sent on `reports` if one was given. The reader is
/// dropped when the task finishes.
pub fn attach<R, S>(
    reader: R,
    child: ChildName,
    stream: StreamKind,
    mut sink: S,
    reports: Option<mpsc::UnboundedSender<DrainReport>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    S: FnMut(&str) + Send + 'static,
{
    tokio::spawn(async move {
        let report = drain(reader, child, stream, &mut sink).await;

        if let Some(reports) = reports {
            // Receiver gone means nobody is interested any more
            let _ = reports.send(report);
        }
    })
}

async fn drain<R, S>(reader: R, child: ChildName, stream: StreamKind, sink: &mut S) -> DrainReport
where
    R: AsyncRead + Unpin,
    S: FnMut(&str),
{
    let mut reader = BufReader::new(reader);
    let mut window = RecentLines::default();
    let mut buf = Vec::new();
    let mut lines_read = 0;
    let mut read_error = None;

    loop {
        buf.clear();
        match read_line_capped(&mut reader, &mut buf, MAX_LINE_BYTES).await {
            Ok(0) => break,
            Ok(consumed) => {
                if consumed > buf.len() {
                    debug!(child = %child, stream = %stream, consumed, "Truncated overlong line");
                }
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(&['\n', '\r'][..]);
                sink(line);
                window.push(line.to_string());
                lines_read += 1;
            }
            Err(e) => {
                warn!(child = %child, stream = %stream, "Error reading child output: {}", e);
                read_error = Some(e.to_string());
                break;
            }
        }
    }

    debug!(child = %child, stream = %stream, lines_read, "Stream closed");

    DrainReport {
        child,
        stream,
        lines: window.digest(),
        lines_read,
        read_error,
    }
}

/// Read up to and including the next newline, keeping at most `max` bytes
/// of it in `buf`. Returns the number of bytes consumed from `reader`, which
/// is 0 only at end-of-stream.
async fn read_line_capped<R>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut consumed = 0;

    loop {
        let (used, done) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(consumed);
            }
            let (chunk, done) = match available.iter().position(|b| *b == b'\n') {
                Some(pos) => (&available[..=pos], true),
                None => (available, false),
            };
            let room = max.saturating_sub(buf.len());
            buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
            (chunk.len(), done)
        };

        reader.consume(used);
        consumed += used;
        if done {
            return Ok(consumed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    fn collecting_sink() -> (Arc<Mutex<Vec<String>>>, impl FnMut(&str) + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        (seen, move |line: &str| sink_seen.lock().unwrap().push(line.to_string()))
    }

    #[test]
    fn test_recent_lines_keeps_last_three() {
        let mut window = RecentLines::default();
        for i in 0..5 {
            window.push(format!("line {}", i));
        }

        assert_eq!(window.len(), 3);
        assert_eq!(window.digest(), vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn test_recent_lines_digest_skips_blank() {
        let mut window = RecentLines::default();
        window.push("fatal: bad config".to_string());
        window.push("".to_string());
        window.push("   ".to_string());

        assert_eq!(window.len(), 3);
        assert_eq!(window.digest(), vec!["fatal: bad config"]);
    }

    #[tokio::test]
    async fn test_drain_forwards_every_line_in_order() {
        let (seen, sink) = collecting_sink();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let input: &'static [u8] = b"one\ntwo\r\nthree\nfour\nfive";

        attach(input, ChildName::Tor, StreamKind::Stdout, sink, Some(tx))
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["one", "two", "three", "four", "five"]);

        let report = rx.recv().await.unwrap();
        assert_eq!(report.child, ChildName::Tor);
        assert_eq!(report.stream, StreamKind::Stdout);
        assert_eq!(report.lines, vec!["three", "four", "five"]);
        assert_eq!(report.lines_read, 5);
        assert!(report.read_error.is_none());
        assert!(rx.recv().await.is_none(), "exactly one report per stream");
    }

    #[tokio::test]
    async fn test_drain_reports_empty_stream_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let input: &'static [u8] = b"";

        attach(input, ChildName::Node, StreamKind::Stderr, |_: &str| {}, Some(tx))
            .await
            .unwrap();

        let report = rx.recv().await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.lines_read, 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_drain_without_report_channel() {
        let (seen, sink) = collecting_sink();
        let input: &'static [u8] = b"only line\n";

        attach(input, ChildName::Node, StreamKind::Stdout, sink, None)
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["only line"]);
    }

    #[tokio::test]
    async fn test_drain_tolerates_invalid_utf8() {
        let (seen, sink) = collecting_sink();
        let input: &'static [u8] = b"ok\n\xff\xfe bytes\n";

        attach(input, ChildName::Tor, StreamKind::Stderr, sink, None)
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[1].ends_with(" bytes"));
    }

    struct FailingReader {
        sent: bool,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.sent {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "pipe broke")))
            } else {
                self.sent = true;
                buf.put_slice(b"last words\n");
                Poll::Ready(Ok(()))
            }
        }
    }

    #[tokio::test]
    async fn test_drain_read_error_still_reports() {
        let (tx, mut rx) = mpsc::unbounded_channel();

        attach(
            FailingReader { sent: false },
            ChildName::Tor,
            StreamKind::Stderr,
            |_: &str| {},
            Some(tx),
        )
        .await
        .unwrap();

        let report = rx.recv().await.unwrap();
        assert_eq!(report.lines, vec!["last words"]);
        assert!(report.read_error.unwrap().contains("pipe broke"));
        assert!(!rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_drain_truncates_overlong_lines() {
        let (seen, sink) = collecting_sink();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut input = vec![b'x'; MAX_LINE_BYTES * 4];
        input.extend_from_slice(b"\nafter\n");
        input.extend(std::iter::repeat(b'y').take(MAX_LINE_BYTES + 10));

        attach(io::Cursor::new(input), ChildName::Node, StreamKind::Stdout, sink, Some(tx))
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].len(), MAX_LINE_BYTES);
        assert!(seen[0].bytes().all(|b| b == b'x'));
        assert_eq!(seen[1], "after");
        assert_eq!(seen[2].len(), MAX_LINE_BYTES);

        let report = rx.recv().await.unwrap();
        assert_eq!(report.lines_read, 3);
        assert!(report.read_error.is_none());
    }

    #[test]
    fn test_abandoned_report_is_not_clean() {
        let report = DrainReport::abandoned(ChildName::Tor, StreamKind::Stdout);

        assert!(report.lines.is_empty());
        assert_eq!(report.read_error.as_deref(), Some(ABANDONED));
        assert!(!report.is_clean());
    }
}
