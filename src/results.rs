//! Test result records and the test database seam.
//!
//! Every test execution observed by a worker ends up as one
//! [`TestResultRecord`]. Records flow from the worker parser through the
//! orchestrator's result queue into a [`TestDatabase`] implementation, which
//! owns them from then on.
//!
//! # Verdicts
//!
//! | Verdict | Source | Counts as |
//! |---------|--------|-----------|
//! | [`Verdict::Pass`] | `[       OK ]` | passed |
//! | [`Verdict::Skipped`] | `[  SKIPPED ]` | skipped |
//! | [`Verdict::Fail`] | `[  FAILED  ]` | failed |
//! | [`Verdict::Crash`] | abnormal exit inside a test | failed |
//! | [`Verdict::ToolMetaError`] | diagnostic tool error exit code | meta error |
//! | [`Verdict::OtherError`] | unexplained exit code, I/O error | meta error |

pub mod log;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use log::{ListenerId, LogEvent, ResultLog, TestCaseStats};

/// Outcome of one test execution.
///
/// Variants are ordered by severity; everything from [`Verdict::Fail`] on
/// counts against the failure budget of a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Skipped,
    Fail,
    Crash,
    ToolMetaError,
    OtherError,
}

impl Verdict {
    /// Whether this verdict counts as a failure for stopping policies.
    pub fn is_failure(self) -> bool {
        self >= Verdict::Fail
    }

    /// Whether this verdict is attributable to a test case.
    ///
    /// Meta errors are not, and do not count towards campaign completion.
    pub fn is_test_result(self) -> bool {
        self <= Verdict::Crash
    }

    /// Short label used in logs and console output.
    pub fn label(self) -> &'static str {
        match self {
            Verdict::Pass => "passed",
            Verdict::Skipped => "skipped",
            Verdict::Fail => "failed",
            Verdict::Crash => "crashed",
            Verdict::ToolMetaError => "tool error",
            Verdict::OtherError => "error",
        }
    }
}

/// Where a result record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Produced by a running worker.
    #[default]
    Live,

    /// Re-read from the trace directory tree.
    AutoImport,

    /// Re-read from a trace file named explicitly by the user.
    ManualImport,
}

/// One test execution result.
///
/// The byte range `trace_offset..trace_offset + trace_length` of
/// `trace_file` holds the worker output belonging to this execution. For
/// live results it is valid at the moment the record is emitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResultRecord {
    /// Full `Suite.Test` name, or empty for results not attributable to a test.
    pub test_case: String,

    /// Executable that produced the result, `None` when imported.
    pub executable: Option<PathBuf>,

    /// Modification time of the executable in seconds since the epoch, 0 when imported.
    pub executable_timestamp: u64,

    pub verdict: Verdict,

    /// Trace file holding the output, `None` if the output was discarded.
    pub trace_file: Option<PathBuf>,
    pub trace_offset: u64,
    pub trace_length: u64,

    /// Renamed core dump belonging to a crash.
    pub core_file: Option<PathBuf>,

    /// Source file (base name) of the first reported failure.
    pub failure_file: String,

    /// Source line of the first reported failure, 0 if unknown.
    pub failure_line: u32,

    /// Duration reported by the test framework.
    pub duration_ms: u64,

    pub completed_at: DateTime<Utc>,

    /// Worker ran under a wrapping diagnostic tool.
    pub under_tool: bool,

    /// Seed extracted from the test output, empty if none.
    pub seed: String,

    pub provenance: Provenance,
}

/// Campaign level statistics.
///
/// Owned by the orchestrator and only modified while it drains the result
/// queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CampaignCounters {
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,

    /// Number of worker processes still running.
    pub running: usize,

    /// Number of results the campaign is expected to produce.
    pub expected: u64,

    /// Results received from non-background workers, excluding meta errors.
    pub completed: u64,

    pub meta_errors: u64,

    pub started_at: Option<DateTime<Utc>>,
}

impl CampaignCounters {
    /// Resets the counters for a new campaign expecting `expected` results.
    ///
    /// A resumed campaign keeps its completed count and adds it to the
    /// expectation, so progress continues where the previous run stopped.
    pub fn reset(&mut self, expected: u64, is_resume: bool) {
        if is_resume {
            self.expected = expected + self.completed;
        } else {
            *self = CampaignCounters {
                expected,
                ..Default::default()
            };
        }
    }

    /// Accounts for one result.
    pub fn record(&mut self, verdict: Verdict, background: bool) {
        match verdict {
            Verdict::Pass => self.passed += 1,
            Verdict::Skipped => self.skipped += 1,
            Verdict::Fail | Verdict::Crash => self.failed += 1,
            Verdict::ToolMetaError | Verdict::OtherError => self.meta_errors += 1,
        }
        if !background && verdict.is_test_result() {
            self.completed += 1;
        }
    }

    /// Whether the campaign saw any failing or erroneous result.
    pub fn has_failures(&self) -> bool {
        self.failed > 0 || self.meta_errors > 0
    }
}

/// Message sent from the I/O task to the orchestrator.
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// A worker produced a result.
    Result {
        record: TestResultRecord,
        background: bool,
    },

    /// A worker process exited and its trace file is closed.
    Exited { pid: u32 },
}

/// Consumer of campaign results.
///
/// The orchestrator calls these methods only from the thread that drains
/// the result queue.
pub trait TestDatabase {
    /// Stores a result produced by a worker.
    fn append_result(&mut self, record: TestResultRecord, background: bool);

    /// Called when a campaign starts.
    fn reset_campaign_stats(&mut self, expected: u64, is_resume: bool);

    /// Called whenever the number of running workers changes.
    fn set_job_count(&mut self, count: usize);

    /// Called after the orchestrator updated its counters.
    fn campaign_stats_updated(&mut self, _counters: &CampaignCounters) {}
}
