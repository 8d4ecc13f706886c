//! Configuration schema definitions for gtrun.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── CampaignConfig     - Worker count, repetitions, filter, gtest flags, cleanup
//! ├── ToolConfig         - Optional wrapping diagnostic tool (valgrind, ...)
//! ├── ArtifactsConfig    - Trace and core dump locations
//! └── RunnerConfig       - I/O and drain timing
//! ```
//!
//! Every section is optional; an empty file is a valid configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration structure for gtrun.
///
/// # TOML Structure
///
/// ```toml
/// [campaign]
/// executable = "build/unit_test"
/// jobs = 8
/// repetitions = 10
/// filter = "Codec.*"
///
/// [tool]
/// command = "valgrind --leak-check=full"
///
/// [artifacts]
/// trace_dir = "~/gtest-traces"
/// ```
///
/// # Example
///
/// ```
/// use gtrun::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [campaign]
///     jobs = 2
/// "#).unwrap();
/// assert_eq!(config.campaign.jobs, 2);
/// assert!(config.tool.is_none());
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub campaign: CampaignConfig,

    /// Wrapping diagnostic tool. Workers run without a tool if absent.
    pub tool: Option<ToolConfig>,

    #[serde(default)]
    pub artifacts: ArtifactsConfig,

    #[serde(default)]
    pub runner: RunnerConfig,
}

/// Campaign settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `jobs` | number of CPUs |
/// | `background_jobs` | 0 |
/// | `repetitions` | 1 |
/// | `max_failures` | 0 (unlimited) |
/// | `clean_trace` | true |
/// | `clean_core` | false |
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CampaignConfig {
    /// Test executable. Can be overridden on the command line.
    pub executable: Option<PathBuf>,

    /// Total number of worker processes.
    #[serde(default = "default_jobs")]
    pub jobs: usize,

    /// Workers running the complete unfiltered suite alongside the others.
    ///
    /// They are stopped as soon as all other workers are done.
    #[serde(default)]
    pub background_jobs: usize,

    #[serde(default = "default_repetitions")]
    pub repetitions: u32,

    /// GoogleTest filter expression, empty to run all tests.
    #[serde(default)]
    pub filter: String,

    #[serde(default)]
    pub run_disabled: bool,

    #[serde(default)]
    pub shuffle: bool,

    #[serde(default)]
    pub break_on_failure: bool,

    /// Disable catching of exceptions, so they abort the worker.
    #[serde(default)]
    pub break_on_exception: bool,

    /// Stop the campaign after this many failed results.
    #[serde(default)]
    pub max_failures: u64,

    /// Drop the trace output of passed tests.
    #[serde(default = "default_true")]
    pub clean_trace: bool,

    /// Delete core dumps instead of keeping them next to the trace.
    #[serde(default)]
    pub clean_core: bool,

    /// Regular expression whose first capture group is recorded as the seed.
    pub seed_regexp: Option<String>,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            executable: None,
            jobs: default_jobs(),
            background_jobs: 0,
            repetitions: default_repetitions(),
            filter: String::new(),
            run_disabled: false,
            shuffle: false,
            break_on_failure: false,
            break_on_exception: false,
            max_failures: 0,
            clean_trace: true,
            clean_core: false,
            seed_regexp: None,
        }
    }
}

fn default_jobs() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

fn default_repetitions() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

/// Wrapping diagnostic tool.
///
/// # Example
///
/// ```toml
/// [tool]
/// command = "valgrind --leak-check=full --num-callers=30"
/// error_exit_code = 125
/// core_prefix = "vgcore"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ToolConfig {
    /// Tool command line, split with shell quoting rules.
    pub command: String,

    /// Exit code the tool uses for errors it detected.
    ///
    /// Passed as `--error-exitcode=N`. Default: 125
    #[serde(default = "default_error_exit_code")]
    pub error_exit_code: i32,

    /// Set to false to not pass an error exit code to the tool.
    #[serde(default = "default_true")]
    pub detect_errors: bool,

    /// Name prefix of core files written by the tool. Default: `vgcore`
    #[serde(default = "default_core_prefix")]
    pub core_prefix: String,
}

fn default_error_exit_code() -> i32 {
    125
}

pub fn default_core_prefix() -> String {
    "vgcore".to_string()
}

/// Trace and core file locations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ArtifactsConfig {
    /// Root of the trace directory tree. `~` and `$VAR` are expanded.
    #[serde(default = "default_dir")]
    pub trace_dir: String,

    /// Directory where the OS writes `core.<pid>` files.
    #[serde(default = "default_dir")]
    pub core_dir: String,

    /// Run workers from a hardlink of the executable inside the trace
    /// directory, so core dumps stay debuggable after a rebuild.
    #[serde(default = "default_true")]
    pub copy_executable: bool,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            trace_dir: default_dir(),
            core_dir: default_dir(),
            copy_executable: true,
        }
    }
}

fn default_dir() -> String {
    ".".to_string()
}

/// Timing of the result pipeline.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    /// Minimum spacing between two I/O passes in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Period of result queue draining in milliseconds.
    #[serde(default = "default_drain_interval")]
    pub drain_interval_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            drain_interval_ms: default_drain_interval(),
        }
    }
}

fn default_poll_interval() -> u64 {
    150
}

fn default_drain_interval() -> u64 {
    250
}
