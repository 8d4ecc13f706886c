//! Re-import of results from stored trace files.
//!
//! A trace file written by a worker holds the complete output of that
//! worker, including the `[  CRASHED ]` lines added for crashed tests.
//! Importing scans it line by line with the same marker grammar as the live
//! parser and produces records whose byte ranges point into the file.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use regex::bytes::Regex;
use tracing::{debug, info};

use crate::artifacts::{CORE_PREFIX, core_file_path};
use crate::job::parser::{MarkerKind, extract_seed, failure_location, parse_marker};
use crate::results::{Provenance, TestResultRecord, Verdict};

const READ_BUFFER: usize = 256 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("Failed to read trace file {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
}

/// Snippet of the test currently open while scanning.
struct OpenSnippet {
    name: Vec<u8>,
    offset: u64,
    data: Vec<u8>,
}

/// Imports all concluded test results of a trace file.
///
/// Records get the file's modification time as completion time. A crashed
/// test references the core file stored next to the trace, if any.
/// Output of a test that never concluded is ignored.
pub fn import_trace_file(
    path: &Path,
    provenance: Provenance,
    tool_core_prefix: &str,
    seed_pattern: Option<&Regex>,
) -> Result<Vec<TestResultRecord>, ImportError> {
    let read_err = |source| ImportError::Read {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(read_err)?;
    let completed_at: DateTime<Utc> = file
        .metadata()
        .and_then(|m| m.modified())
        .map_err(read_err)?
        .into();
    let core_file = [CORE_PREFIX, tool_core_prefix]
        .iter()
        .map(|prefix| core_file_path(path, prefix))
        .find(|core| core.is_file());

    let mut reader = BufReader::with_capacity(READ_BUFFER, file);
    let mut line = Vec::new();
    let mut offset = 0u64;
    let mut snippet: Option<OpenSnippet> = None;
    let mut trailer = false;
    let mut records = Vec::new();

    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).map_err(read_err)?;
        if n == 0 {
            break;
        }
        let line_offset = offset;
        offset += n as u64;

        let Some(marker) = parse_marker(&line) else {
            if let Some(open) = snippet.as_mut() {
                open.data.extend_from_slice(&line);
            }
            continue;
        };

        match (marker.kind, marker.kind.verdict()) {
            (MarkerKind::Run, _) => {
                snippet = Some(OpenSnippet {
                    name: marker.name.to_vec(),
                    offset: line_offset,
                    data: line.clone(),
                });
                trailer = false;
            }
            (_, Some(verdict)) if !trailer => {
                let mut open = snippet.take().unwrap_or_else(|| OpenSnippet {
                    name: marker.name.to_vec(),
                    offset: line_offset,
                    data: Vec::new(),
                });
                open.data.extend_from_slice(&line);

                let (failure_file, failure_line) = if verdict.is_failure() {
                    failure_location(&open.data).unwrap_or_default()
                } else {
                    (String::new(), 0)
                };
                records.push(TestResultRecord {
                    test_case: String::from_utf8_lossy(&open.name).into_owned(),
                    executable: None,
                    executable_timestamp: 0,
                    verdict,
                    trace_file: Some(path.to_path_buf()),
                    trace_offset: open.offset,
                    trace_length: open.data.len() as u64,
                    core_file: core_file.clone().filter(|_| verdict == Verdict::Crash),
                    failure_file,
                    failure_line,
                    duration_ms: marker.duration_ms.unwrap_or(0),
                    completed_at,
                    under_tool: false,
                    seed: extract_seed(seed_pattern, &open.data),
                    provenance,
                });
            }
            _ => {
                snippet = None;
                trailer = true;
            }
        }
    }

    if let Some(open) = snippet {
        debug!(
            "Ignoring unfinished test {} in {}",
            String::from_utf8_lossy(&open.name),
            path.display()
        );
    }
    info!("Imported {} results from {}", records.len(), path.display());
    Ok(records)
}
