//! Incremental GoogleTest output scanner.
//!
//! A worker's merged stdout/stderr arrives in chunks of arbitrary size. The
//! [`OutputParser`] consumes those chunks, cuts them into test *snippets*
//! delimited by bracketed marker lines, turns each concluded snippet into a
//! [`TestResultRecord`] and copies the complete stream into the trace file.
//!
//! Only complete lines are interpreted. Everything after the last newline
//! is kept back until the next chunk arrives, so a marker split across two
//! reads is matched exactly as if it had arrived in one piece.
//!
//! # Markers
//!
//! ```text
//! [ RUN      ] Suite.Name                 starts a snippet
//! [       OK ] Suite.Name (5 ms)          concludes it as Pass
//! [  FAILED  ] Suite.Name (5 ms)          concludes it as Fail
//! [  SKIPPED ] Suite.Name (0 ms)          concludes it as Skipped
//! [----------] ...                        suite separator, starts a trailer
//! [==========] ...                        run separator, starts a trailer
//! ```
//!
//! Concluding markers seen inside a trailer (the summary list printed at the
//! end of a run) are plain trace content. The trailer ends at the next
//! `[ RUN ]` marker.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::Utc;
use regex::bytes::Regex;

use crate::results::{Provenance, TestResultRecord, Verdict};

static FAILURE_LOCATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m-u)^(.*):([0-9]+): Failure").expect("failure location pattern is valid")
});

/// Kind of a marker line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    Run,
    Ok,
    Failed,
    Skipped,
    Crashed,
    SuiteSeparator,
    RunSeparator,
}

impl MarkerKind {
    /// Verdict of a concluding marker.
    pub fn verdict(self) -> Option<Verdict> {
        match self {
            MarkerKind::Ok => Some(Verdict::Pass),
            MarkerKind::Failed => Some(Verdict::Fail),
            MarkerKind::Skipped => Some(Verdict::Skipped),
            MarkerKind::Crashed => Some(Verdict::Crash),
            _ => None,
        }
    }
}

/// A parsed marker line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker<'a> {
    pub kind: MarkerKind,
    pub name: &'a [u8],
    pub duration_ms: Option<u64>,
}

const LABELS: &[(&[u8], MarkerKind)] = &[
    (b"RUN", MarkerKind::Run),
    (b"OK", MarkerKind::Ok),
    (b"FAILED", MarkerKind::Failed),
    (b"SKIPPED", MarkerKind::Skipped),
    (b"CRASHED", MarkerKind::Crashed),
];

/// Parses one line (with or without line terminator) as a marker.
///
/// Word labels must be padded by at least one space on each side. The
/// label must be followed by spaces and a non-blank test identifier.
pub fn parse_marker(line: &[u8]) -> Option<Marker<'_>> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);

    let rest = line.strip_prefix(b"[")?;
    let close = rest.iter().position(|&b| b == b']')?;
    let label = &rest[..close];

    let kind = match label {
        b"----------" => MarkerKind::SuiteSeparator,
        b"==========" => MarkerKind::RunSeparator,
        _ => {
            if label.first() != Some(&b' ') || label.last() != Some(&b' ') {
                return None;
            }
            let word = label.trim_ascii();
            LABELS.iter().find(|(text, _)| *text == word)?.1
        }
    };

    let rest = &rest[close + 1..];
    if rest.first() != Some(&b' ') {
        return None;
    }
    let rest = rest.trim_ascii_start();
    let name_len = rest
        .iter()
        .position(|b| b.is_ascii_whitespace())
        .unwrap_or(rest.len());
    if name_len == 0 {
        return None;
    }
    let (name, tail) = rest.split_at(name_len);

    Some(Marker {
        kind,
        name: name.strip_suffix(b",").unwrap_or(name),
        duration_ms: parse_duration(tail),
    })
}

/// Parses a duration of the form `<ws>(N ms)` directly after the name.
fn parse_duration(tail: &[u8]) -> Option<u64> {
    if !tail.first()?.is_ascii_whitespace() {
        return None;
    }
    let tail = tail.trim_ascii_start().strip_prefix(b"(")?;
    let digits = tail.iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    let unit = tail[digits..].trim_ascii_start();
    if !unit.starts_with(b"ms)") {
        return None;
    }
    std::str::from_utf8(&tail[..digits]).ok()?.parse().ok()
}

/// First `<path>:<line>: Failure` location in a snippet.
///
/// Returns the base name of the path and the line number.
pub fn failure_location(snippet: &[u8]) -> Option<(String, u32)> {
    let caps = FAILURE_LOCATION.captures(snippet)?;
    let path = String::from_utf8_lossy(caps.get(1)?.as_bytes()).into_owned();
    let line = std::str::from_utf8(caps.get(2)?.as_bytes()).ok()?.parse().ok()?;
    let file = Path::new(&path)
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or(path);
    Some((file, line))
}

/// First capture group of the seed pattern, or empty.
pub fn extract_seed(pattern: Option<&Regex>, snippet: &[u8]) -> String {
    pattern
        .and_then(|re| re.captures(snippet))
        .and_then(|caps| caps.get(1))
        .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
        .unwrap_or_default()
}

/// Static attributes copied into every record a worker produces.
#[derive(Debug, Clone)]
pub struct RecordContext {
    pub trace_file: PathBuf,
    pub executable: Option<PathBuf>,
    pub executable_timestamp: u64,
    pub under_tool: bool,
    pub seed_pattern: Option<Regex>,
}

/// Append-only trace sink that tracks its position.
///
/// The first write error is retained and later writes are dropped.
#[derive(Debug)]
pub struct TraceWriter<W: Write> {
    sink: Option<W>,
    position: u64,
    error: Option<String>,
}

impl<W: Write> TraceWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink: Some(sink),
            position: 0,
            error: None,
        }
    }

    pub fn write(&mut self, data: &[u8]) {
        if data.is_empty() || self.error.is_some() {
            return;
        }
        if let Some(sink) = self.sink.as_mut() {
            match sink.write_all(data) {
                Ok(()) => self.position += data.len() as u64,
                Err(e) => self.error = Some(format!("Error writing trace output to file: {}", e)),
            }
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn get_ref(&self) -> Option<&W> {
        self.sink.as_ref()
    }

    /// Flushes and drops the sink. Further writes are ignored.
    pub fn close(&mut self) -> Option<W> {
        let mut sink = self.sink.take()?;
        let _ = sink.flush();
        Some(sink)
    }

    pub fn is_closed(&self) -> bool {
        self.sink.is_none()
    }

    pub fn take_error(&mut self) -> Option<String> {
        self.error.take()
    }
}

/// Incremental snippet parser for one worker.
#[derive(Debug)]
pub struct OutputParser<W: Write> {
    context: RecordContext,
    trace: TraceWriter<W>,
    pending: Vec<u8>,
    snippet: Vec<u8>,
    snippet_name: Vec<u8>,
    trailer: bool,
    clean_passed: bool,
    keep_trace: bool,
    failures: u64,
    results: u64,
    bytes_read: u64,
}

impl<W: Write> OutputParser<W> {
    /// Creates a parser writing to `sink`.
    ///
    /// With `clean_passed`, the output of passed tests is not kept in the
    /// trace file.
    pub fn new(context: RecordContext, sink: W, clean_passed: bool) -> Self {
        Self {
            context,
            trace: TraceWriter::new(sink),
            pending: Vec::new(),
            snippet: Vec::new(),
            snippet_name: Vec::new(),
            trailer: false,
            clean_passed,
            keep_trace: false,
            failures: 0,
            results: 0,
            bytes_read: 0,
        }
    }

    /// Consumes a chunk of output, returning the results it concluded.
    pub fn feed(&mut self, data: &[u8]) -> Vec<TestResultRecord> {
        self.bytes_read += data.len() as u64;
        self.pending.extend_from_slice(data);

        let Some(last_nl) = self.pending.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };
        let rest = self.pending.split_off(last_nl + 1);
        let buf = std::mem::replace(&mut self.pending, rest);

        let mut records = Vec::new();
        let mut done = 0;
        let mut off = 0;
        while off < buf.len() {
            let line_end = buf[off..]
                .iter()
                .position(|&b| b == b'\n')
                .map_or(buf.len(), |p| off + p + 1);
            let line = &buf[off..line_end];

            if let Some(marker) = parse_marker(line).filter(|m| m.kind != MarkerKind::Crashed) {
                match (marker.kind, marker.kind.verdict()) {
                    (MarkerKind::Run, _) => {
                        self.trace.write(&self.snippet);
                        self.trace.write(&buf[done..off]);
                        self.snippet = line.to_vec();
                        self.snippet_name = marker.name.to_vec();
                        self.trailer = false;
                    }
                    (_, Some(verdict)) if !self.trailer => {
                        self.snippet.extend_from_slice(&buf[done..line_end]);
                        let name = marker.name.to_vec();
                        records.push(self.finalize(&name, verdict, marker.duration_ms, None));
                        self.snippet.clear();
                        self.snippet_name.clear();
                    }
                    _ => {
                        self.trace.write(&self.snippet);
                        self.trace.write(&buf[done..line_end]);
                        self.snippet.clear();
                        self.snippet_name.clear();
                        self.trailer = true;
                    }
                }
                done = line_end;
            }
            off = line_end;
        }

        if self.snippet.is_empty() {
            self.trace.write(&buf[done..]);
        } else {
            self.snippet.extend_from_slice(&buf[done..]);
        }

        records
    }

    /// Concludes the open snippet as a crash after an abnormal exit.
    ///
    /// Without an open snippet the crash is reported for test `unknown`,
    /// carrying whatever output was not yet assigned to a test.
    pub fn finish_crash(
        &mut self,
        exit_code: Option<i32>,
        core_file: Option<PathBuf>,
    ) -> TestResultRecord {
        let code = exit_code.map_or_else(|| "unknown".to_string(), |c| c.to_string());
        let pending = std::mem::take(&mut self.pending);
        self.snippet.extend_from_slice(&pending);

        let name = if self.snippet_name.is_empty() {
            self.snippet
                .extend_from_slice(format!("\n[----------] Exit code: {}\n", code).as_bytes());
            b"unknown".to_vec()
        } else {
            let name = std::mem::take(&mut self.snippet_name);
            self.snippet.extend_from_slice(b"\n[  CRASHED ] ");
            self.snippet.extend_from_slice(&name);
            self.snippet
                .extend_from_slice(format!("\n[----------] Exit code: {}\n", code).as_bytes());
            name
        };

        let record = self.finalize(&name, Verdict::Crash, None, core_file);
        self.snippet.clear();
        record
    }

    /// Reports an error of the wrapping diagnostic tool.
    ///
    /// The failing test cannot be identified, so the record covers the
    /// whole trace file.
    pub fn finish_tool_error(&mut self) -> TestResultRecord {
        let pending = std::mem::take(&mut self.pending);
        self.snippet.extend_from_slice(&pending);
        let record = self.finalize(b"", Verdict::ToolMetaError, None, None);
        self.snippet.clear();
        self.snippet_name.clear();
        record
    }

    /// Reports an unexplained worker error, appending `note` to the trace.
    pub fn finish_error(&mut self, note: &str) -> TestResultRecord {
        let pending = std::mem::take(&mut self.pending);
        self.snippet.extend_from_slice(&pending);
        self.snippet
            .extend_from_slice(format!("\n[----------] {}\n", note).as_bytes());
        let record = self.finalize(b"", Verdict::OtherError, None, None);
        self.snippet.clear();
        self.snippet_name.clear();
        record
    }

    /// Writes all remaining output to the trace file without a result.
    pub fn finish_clean(&mut self) {
        self.trace.write(&self.snippet);
        self.trace.write(&self.pending);
        self.snippet.clear();
        self.snippet_name.clear();
        self.pending.clear();
    }

    fn finalize(
        &mut self,
        name: &[u8],
        verdict: Verdict,
        duration_ms: Option<u64>,
        core_file: Option<PathBuf>,
    ) -> TestResultRecord {
        let (failure_file, failure_line) = if verdict.is_failure() {
            self.failures += 1;
            failure_location(&self.snippet).unwrap_or_default()
        } else {
            (String::new(), 0)
        };
        let seed = extract_seed(self.context.seed_pattern.as_ref(), &self.snippet);

        let mut trace_offset = self.trace.position();
        let mut trace_length = self.snippet.len() as u64;
        let stored = verdict != Verdict::Pass || !self.clean_passed;
        if stored {
            self.keep_trace = true;
            self.trace.write(&self.snippet);
        }
        if verdict >= Verdict::ToolMetaError {
            trace_offset = 0;
            trace_length = self.trace.position();
        }
        self.results += 1;

        TestResultRecord {
            test_case: String::from_utf8_lossy(name).into_owned(),
            executable: self.context.executable.clone(),
            executable_timestamp: self.context.executable_timestamp,
            verdict,
            trace_file: stored.then(|| self.context.trace_file.clone()),
            trace_offset,
            trace_length,
            core_file,
            failure_file,
            failure_line,
            duration_ms: duration_ms.unwrap_or(0),
            completed_at: Utc::now(),
            under_tool: self.context.under_tool,
            seed,
            provenance: Provenance::Live,
        }
    }

    pub fn set_clean_passed(&mut self, clean_passed: bool) {
        self.clean_passed = clean_passed;
    }

    /// Whether the trace file holds output referenced by a result.
    pub fn keep_trace(&self) -> bool {
        self.keep_trace && self.results > 0
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn results(&self) -> u64 {
        self.results
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Name of the test whose snippet is currently open.
    pub fn current_test(&self) -> String {
        String::from_utf8_lossy(&self.snippet_name).into_owned()
    }

    pub fn trace(&self) -> Option<&W> {
        self.trace.get_ref()
    }

    pub fn trace_position(&self) -> u64 {
        self.trace.position()
    }

    /// Closes the trace sink. Returns true if the file should be kept.
    pub fn close_trace(&mut self) -> bool {
        self.trace.close();
        self.keep_trace()
    }

    pub fn is_trace_closed(&self) -> bool {
        self.trace.is_closed()
    }

    pub fn take_write_error(&mut self) -> Option<String> {
        self.trace.take_error()
    }
}
