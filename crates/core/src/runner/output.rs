//! Line streams over subprocess output.

use regex::Regex;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tokio_stream::{Stream, StreamExt};

/// Longest line emitted as one item; longer runs are split.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Split a reader into text lines.
///
/// Invalid UTF-8 is replaced rather than rejected, and carriage returns are
/// treated as line breaks so that progress bars redrawing a single line
/// still produce one item per update. Empty segments are skipped. A line
/// longer than [`MAX_LINE_BYTES`] is emitted in pieces of at most that size.
pub fn output_lines<R>(reader: R) -> Pin<Box<dyn Stream<Item = io::Result<String>> + Send>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();

        loop {
            let available = match reader.fill_buf().await {
                Ok(available) => available,
                Err(e) => {
                    yield Err(e);
                    break;
                }
            };
            if available.is_empty() {
                if let Some(line) = take_segment(&mut buf) {
                    yield Ok(line);
                }
                break;
            }

            let room = MAX_LINE_BYTES - buf.len();
            let window = &available[..available.len().min(room)];
            let (used, complete) = match window.iter().position(|b| matches!(b, b'\n' | b'\r')) {
                Some(end) => {
                    buf.extend_from_slice(&window[..end]);
                    (end + 1, true)
                }
                None => {
                    buf.extend_from_slice(window);
                    (window.len(), buf.len() >= MAX_LINE_BYTES)
                }
            };
            reader.consume(used);

            if complete {
                if let Some(line) = take_segment(&mut buf) {
                    yield Ok(line);
                }
            }
        }
    };

    Box::pin(stream)
}

fn take_segment(buf: &mut Vec<u8>) -> Option<String> {
    let text = String::from_utf8_lossy(buf).into_owned();
    buf.clear();
    (!text.trim().is_empty()).then_some(text)
}

/// Collect the last `capacity` lines of a reader on a background task.
pub fn collect_tail<R>(reader: R, capacity: usize) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut tail = VecDeque::with_capacity(capacity);
        let mut lines = output_lines(reader);
        while let Some(Ok(line)) = lines.next().await {
            if capacity == 0 {
                continue;
            }
            if tail.len() == capacity {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        Vec::from(tail).join("\n")
    })
}

/// Wait for a tail collector, giving up after `limit`.
///
/// A grandchild that inherited the pipe can keep it open after the main
/// process exited, so the wait must be bounded.
pub async fn finish_tail(handle: JoinHandle<String>, limit: Duration) -> String {
    match tokio::time::timeout(limit, handle).await {
        Ok(Ok(tail)) => tail,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "stderr collector panicked");
            String::new()
        }
        Err(_) => {
            tracing::warn!("stderr still open after process exit, tail truncated");
            String::new()
        }
    }
}

/// Extracts stage-local progress from output lines.
#[derive(Debug, Clone)]
pub struct ProgressParser {
    regex: Regex,
    max: f64,
}

impl ProgressParser {
    /// `pattern` must contain one capture group holding a number; `max` is
    /// the value that corresponds to 100%.
    pub fn new(pattern: &str, max: f64) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(pattern)?,
            max,
        })
    }

    /// Local percentage carried by `line`, if any.
    pub fn parse(&self, line: &str) -> Option<f64> {
        let captures = self.regex.captures(line)?;
        let value: f64 = captures.get(1)?.as_str().trim().parse().ok()?;
        if self.max <= 0.0 {
            return None;
        }
        Some(value / self.max * 100.0)
    }
}
