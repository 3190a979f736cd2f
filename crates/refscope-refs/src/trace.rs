//! Destinations for the ref trace stream.
//!
//! A [`TraceSink`] receives the trace lines emitted by
//! [`TracedRefStore`](crate::traced::TracedRefStore), one call per line.
//! Sinks never report failure: a trace that cannot be written is dropped.

use std::io::Write;
use std::sync::Mutex;

use refscope_types::ObjectId;

/// Target used by [`LogSink`] for trace events.
pub const TRACE_TARGET: &str = "refscope::trace";

/// A line-oriented output channel for trace records.
pub trait TraceSink: Send + Sync {
    /// Append one line (without trailing newline).
    fn append_line(&self, line: &str);

    /// Append several lines that belong to one event.
    fn append_block(&self, lines: &[String]) {
        for line in lines {
            self.append_line(line);
        }
    }
}

/// Writes trace lines to the process's standard output.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl TraceSink for StdoutSink {
    fn append_line(&self, line: &str) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{line}");
    }

    fn append_block(&self, lines: &[String]) {
        let mut out = std::io::stdout().lock();
        for line in lines {
            let _ = writeln!(out, "{line}");
        }
    }
}

/// Collects trace lines in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of every line appended so far.
    pub fn lines(&self) -> Vec<String> {
        match self.lines.lock() {
            Ok(lines) => lines.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Remove and return every line appended so far.
    pub fn take(&self) -> Vec<String> {
        match self.lines.lock() {
            Ok(mut lines) => std::mem::take(&mut *lines),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

impl TraceSink for MemorySink {
    fn append_line(&self, line: &str) {
        match self.lines.lock() {
            Ok(mut lines) => lines.push(line.to_string()),
            Err(poisoned) => poisoned.into_inner().push(line.to_string()),
        }
    }

    fn append_block(&self, block: &[String]) {
        match self.lines.lock() {
            Ok(mut lines) => lines.extend_from_slice(block),
            Err(poisoned) => poisoned.into_inner().extend_from_slice(block),
        }
    }
}

/// Forwards trace lines to `tracing` as `DEBUG` events on [`TRACE_TARGET`].
#[derive(Debug, Default)]
pub struct LogSink;

impl TraceSink for LogSink {
    fn append_line(&self, line: &str) {
        tracing::debug!(target: TRACE_TARGET, "{line}");
    }
}

/// Render an identifier slot: full hex, or `null` when the slot is empty or
/// holds the null sentinel.
pub fn hex_or_null(oid: Option<&ObjectId>) -> String {
    match oid {
        Some(oid) if !oid.is_null() => oid.to_hex(),
        _ => "null".to_string(),
    }
}
