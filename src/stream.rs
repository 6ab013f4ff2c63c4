//! Line reassembly for a worker's stdout and stderr.
//!
//! Each stream gets its own [`LineBuffer`] and reader task; both readers feed
//! one channel. Lines of one stream arrive in order, lines of different
//! streams interleave in whatever order the readers happen to run.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

const READ_CHUNK_SIZE: usize = 8 * 1024;
const LINE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
  Stdout,
  Stderr,
}

impl StreamKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      StreamKind::Stdout => "stdout",
      StreamKind::Stderr => "stderr",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamLine {
  pub stream: StreamKind,
  pub text: String,
}

/// Partial-line buffer for one byte stream.
#[derive(Debug, Default)]
pub struct LineBuffer {
  partial: Vec<u8>,
}

impl LineBuffer {
  pub fn new() -> Self {
    Self::default()
  }

  /// Appends a chunk and returns every line it completed.
  pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
    let mut lines = Vec::new();
    let mut rest = chunk;
    while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
      self.partial.extend_from_slice(&rest[..pos]);
      lines.push(take_line(&mut self.partial));
      rest = &rest[pos + 1..];
    }
    self.partial.extend_from_slice(rest);
    lines
  }

  /// Flushes an unterminated trailing line once the stream has closed.
  pub fn finish(&mut self) -> Option<String> {
    if self.partial.is_empty() {
      return None;
    }
    Some(take_line(&mut self.partial))
  }
}

fn take_line(buf: &mut Vec<u8>) -> String {
  if buf.last() == Some(&b'\r') {
    buf.pop();
  }
  let line = String::from_utf8_lossy(buf).into_owned();
  buf.clear();
  line
}

/// Most recent non-empty chunk read from stderr.
#[derive(Debug, Clone, Default)]
pub struct StderrTail {
  last: Arc<Mutex<Option<String>>>,
}

impl StderrTail {
  fn record(&self, chunk: &[u8]) {
    let text = String::from_utf8_lossy(chunk);
    let text = text.trim();
    if text.is_empty() {
      return;
    }
    let mut last = self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    *last = Some(text.to_string());
  }

  pub fn last(&self) -> Option<String> {
    self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
  }
}

pub struct StreamMultiplexer {
  lines: mpsc::Receiver<StreamLine>,
  readers: Vec<JoinHandle<()>>,
  stderr_tail: StderrTail,
}

impl StreamMultiplexer {
  pub fn spawn<O, E>(stdout: O, stderr: E) -> Self
  where
    O: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
  {
    let (tx, lines) = mpsc::channel(LINE_CHANNEL_CAPACITY);
    let stderr_tail = StderrTail::default();
    let readers = vec![
      tokio::spawn(read_lines(stdout, StreamKind::Stdout, tx.clone(), None)),
      tokio::spawn(read_lines(stderr, StreamKind::Stderr, tx, Some(stderr_tail.clone()))),
    ];
    Self { lines, readers, stderr_tail }
  }

  /// Next line from either stream, or `None` once both streams are closed.
  pub async fn next_line(&mut self) -> Option<StreamLine> {
    self.lines.recv().await
  }

  pub fn stderr_tail(&self) -> StderrTail {
    self.stderr_tail.clone()
  }

  pub async fn join(self) {
    for reader in self.readers {
      if let Err(e) = reader.await {
        error!("Stream reader task failed: {:?}", e);
      }
    }
  }
}

async fn read_lines<R>(mut reader: R, stream: StreamKind, tx: mpsc::Sender<StreamLine>, tail: Option<StderrTail>)
where
  R: AsyncRead + Unpin,
{
  let mut buffer = LineBuffer::new();
  let mut chunk = vec![0u8; READ_CHUNK_SIZE];
  loop {
    let n = match reader.read(&mut chunk).await {
      Ok(0) => break,
      Ok(n) => n,
      Err(e) => {
        warn!(stream = stream.as_str(), "Failed to read worker output: {}", e);
        break;
      }
    };
    if let Some(tail) = &tail {
      tail.record(&chunk[..n]);
    }
    for text in buffer.push(&chunk[..n]) {
      if tx.send(StreamLine { stream, text }).await.is_err() {
        return;
      }
    }
  }
  if let Some(text) = buffer.finish() {
    let _ = tx.send(StreamLine { stream, text }).await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio_test::io::Builder;

  fn split_all(chunks: &[&[u8]]) -> Vec<String> {
    let mut buffer = LineBuffer::new();
    let mut lines: Vec<String> = chunks.iter().flat_map(|c| buffer.push(c)).collect();
    lines.extend(buffer.finish());
    lines
  }

  #[test]
  fn chunk_boundaries_do_not_change_lines() {
    let raw = "{\"type\":\"log\"}\r\nplain text\n\nünïcode line\ntrailing".as_bytes();
    let expected = split_all(&[raw]);
    assert_eq!(expected, vec!["{\"type\":\"log\"}", "plain text", "", "ünïcode line", "trailing"]);

    for size in 1..raw.len() {
      let chunks: Vec<&[u8]> = raw.chunks(size).collect();
      assert_eq!(split_all(&chunks), expected, "chunk size {}", size);
    }
    for cut in 1..raw.len() {
      assert_eq!(split_all(&[&raw[..cut], &raw[cut..]]), expected, "cut at {}", cut);
    }
  }

  #[test]
  fn chunk_may_hold_many_or_no_lines() {
    let mut buffer = LineBuffer::new();
    assert!(buffer.push(b"par").is_empty());
    assert_eq!(buffer.push(b"tial\nsecond\nthird\n"), vec!["partial", "second", "third"]);
    assert_eq!(buffer.finish(), None);
  }

  #[tokio::test]
  async fn multiplexer_keeps_per_stream_order() {
    let stdout = Builder::new()
      .read(b"one\ntw")
      .read(b"o\nthree")
      .build();
    let stderr = Builder::new()
      .read(b"Traceback (most recent call last):\n")
      .read(b"ValueError: inputFile is required\n")
      .build();

    let mut mux = StreamMultiplexer::spawn(stdout, stderr);
    let tail = mux.stderr_tail();
    let mut out = Vec::new();
    let mut err = Vec::new();
    while let Some(line) = mux.next_line().await {
      match line.stream {
        StreamKind::Stdout => out.push(line.text),
        StreamKind::Stderr => err.push(line.text),
      }
    }
    mux.join().await;

    assert_eq!(out, vec!["one", "two", "three"]);
    assert_eq!(err, vec!["Traceback (most recent call last):", "ValueError: inputFile is required"]);
    assert_eq!(tail.last().as_deref(), Some("ValueError: inputFile is required"));
  }
}
