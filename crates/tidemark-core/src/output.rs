//! The output seam.
//!
//! Plugins write user-facing text through a sink the host provides; nothing
//! below the CLI touches stdout directly.

use parking_lot::Mutex;

/// Destination for user-facing output lines.
pub trait OutputSink: Send + Sync {
    /// Print one line.
    fn print(&self, line: &str);
}

/// Sink that writes to stdout. Used by the CLI.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl OutputSink for StdoutSink {
    fn print(&self, line: &str) {
        println!("{}", line);
    }
}

/// Sink that buffers lines in memory. Used by tests.
#[derive(Debug, Default)]
pub struct BufferSink {
    lines: Mutex<Vec<String>>,
}

impl BufferSink {
    /// Create an empty buffer sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything printed so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

impl OutputSink for BufferSink {
    fn print(&self, line: &str) {
        self.lines.lock().push(line.to_string());
    }
}
