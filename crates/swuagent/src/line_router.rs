//! Line Router - splits a byte stream into lines for the log
//!
//! Bytes accumulate in a bounded buffer. Every complete line is forwarded to a
//! [`LogSink`] at the router's level; a trailing partial line waits for the
//! next call or for [`LineRouter::flush`]. A line longer than the buffer is
//! emitted early in capacity-sized pieces so nothing is dropped.

use std::io::{self, Read};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn, Level};

/// Destination for routed lines
pub trait LogSink: Send + Sync {
    fn log(&self, level: Level, line: &str);
}

/// Forwards lines to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, level: Level, line: &str) {
        match level {
            Level::TRACE => trace!("{}", line),
            Level::DEBUG => debug!("{}", line),
            Level::INFO => info!("{}", line),
            Level::WARN => warn!("{}", line),
            Level::ERROR => error!("{}", line),
        }
    }
}

/// Read size for a single drain of a descriptor
const READ_CHUNK: usize = 4096;

/// Incremental line splitter bound to one stream
pub struct LineRouter {
    buf: Vec<u8>,
    capacity: usize,
    level: Level,
    sink: Arc<dyn LogSink>,
    /// Part of the current line was already emitted because of overflow
    overflowed: bool,
}

impl LineRouter {
    pub fn new(capacity: usize, level: Level, sink: Arc<dyn LogSink>) -> Self {
        let capacity = capacity.max(1);
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
            level,
            sink,
            overflowed: false,
        }
    }

    /// Consume `bytes`, emitting every completed line. Returns the number of
    /// bytes consumed, which is always all of them.
    pub fn feed(&mut self, mut bytes: &[u8]) -> usize {
        let total = bytes.len();

        while !bytes.is_empty() {
            let (mut segment, terminated) = match bytes.iter().position(|&b| b == b'\n') {
                Some(pos) => (&bytes[..pos], true),
                None => (bytes, false),
            };
            bytes = &bytes[segment.len() + usize::from(terminated)..];

            while !segment.is_empty() {
                if self.buf.len() == self.capacity {
                    self.emit();
                    self.overflowed = true;
                }
                let take = (self.capacity - self.buf.len()).min(segment.len());
                self.buf.extend_from_slice(&segment[..take]);
                segment = &segment[take..];
            }

            if terminated {
                // the newline only closes a line already emitted by overflow
                if !(self.buf.is_empty() && self.overflowed) {
                    self.emit();
                }
                self.overflowed = false;
            }
        }

        total
    }

    /// Perform one read on `reader` and route what it returned.
    /// Returns the byte count; 0 means end of stream.
    pub fn read_from<R: Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = reader.read(&mut chunk)?;
        self.feed(&chunk[..n]);
        Ok(n)
    }

    /// Emit a buffered partial line, if any
    pub fn flush(&mut self) {
        if !self.buf.is_empty() {
            self.emit();
        }
        self.overflowed = false;
    }

    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    fn emit(&mut self) {
        let mut line = &self.buf[..];
        if let Some(stripped) = line.strip_suffix(b"\r") {
            line = stripped;
        }
        self.sink.log(self.level, &String::from_utf8_lossy(line));
        self.buf.clear();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Sink that records everything it is given
    #[derive(Default)]
    pub(crate) struct CollectSink {
        pub(crate) lines: Mutex<Vec<(Level, String)>>,
    }

    impl CollectSink {
        pub(crate) fn lines_at(&self, level: Level) -> Vec<String> {
            self.lines
                .lock()
                .unwrap()
                .iter()
                .filter(|(l, _)| *l == level)
                .map(|(_, s)| s.clone())
                .collect()
        }
    }

    impl LogSink for CollectSink {
        fn log(&self, level: Level, line: &str) {
            self.lines.lock().unwrap().push((level, line.to_string()));
        }
    }

    fn router(capacity: usize) -> (LineRouter, Arc<CollectSink>) {
        let sink = Arc::new(CollectSink::default());
        (LineRouter::new(capacity, Level::TRACE, sink.clone()), sink)
    }

    #[test]
    fn test_line_split_across_feeds() {
        let (mut router, sink) = router(256);
        assert_eq!(router.feed(b"abc"), 3);
        assert!(sink.lines_at(Level::TRACE).is_empty());
        assert_eq!(router.feed(b"def\n"), 4);
        assert_eq!(sink.lines_at(Level::TRACE), vec!["abcdef"]);
        assert!(!router.has_partial());
    }

    #[test]
    fn test_flush_emits_partial_once() {
        let (mut router, sink) = router(256);
        router.feed(b"one\ntwo");
        router.flush();
        router.flush();
        assert_eq!(sink.lines_at(Level::TRACE), vec!["one", "two"]);
    }

    #[test]
    fn test_multiple_lines_in_one_feed() {
        let (mut router, sink) = router(256);
        router.feed(b"a\nb\r\n\nc");
        assert_eq!(sink.lines_at(Level::TRACE), vec!["a", "b", ""]);
        assert!(router.has_partial());
    }

    #[test]
    fn test_overflow_emits_early_without_loss() {
        let (mut router, sink) = router(4);
        router.feed(b"abcdefghij\nxy\n");
        assert_eq!(
            sink.lines_at(Level::TRACE),
            vec!["abcd", "efgh", "ij", "xy"]
        );
    }

    #[test]
    fn test_line_exactly_capacity() {
        let (mut router, sink) = router(4);
        router.feed(b"abcd");
        router.feed(b"\nef\n");
        assert_eq!(sink.lines_at(Level::TRACE), vec!["abcd", "ef"]);
    }

    #[test]
    fn test_overflow_then_newline_no_empty_line() {
        let (mut router, sink) = router(4);
        router.feed(b"abcdefgh");
        router.feed(b"\n");
        assert_eq!(sink.lines_at(Level::TRACE), vec!["abcd", "efgh"]);
    }

    #[test]
    fn test_level_is_preserved() {
        let sink = Arc::new(CollectSink::default());
        let mut router = LineRouter::new(64, Level::ERROR, sink.clone());
        router.feed(b"boom\n");
        assert_eq!(sink.lines_at(Level::ERROR), vec!["boom"]);
        assert!(sink.lines_at(Level::TRACE).is_empty());
    }

    #[test]
    fn test_read_from_reader() {
        let (mut router, sink) = router(64);
        let mut input: &[u8] = b"hello\nwor";
        assert_eq!(router.read_from(&mut input).unwrap(), 9);
        assert_eq!(router.read_from(&mut input).unwrap(), 0);
        router.flush();
        assert_eq!(sink.lines_at(Level::TRACE), vec!["hello", "wor"]);
    }
}
