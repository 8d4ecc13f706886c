//! Worker command line and environment.
//!
//! Translates the logical options of one worker into the GoogleTest
//! command line flags and environment variables understood by the test
//! executable, optionally wrapped by a diagnostic tool such as valgrind.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

/// Inherited variables that would override the worker's flags.
pub const SCRUBBED_ENV: &[&str] = &[
    "GTEST_FILTER",
    "GTEST_FAIL_FAST",
    "GTEST_ALSO_RUN_DISABLED_TESTS",
    "GTEST_BREAK_ON_FAILURE",
    "GTEST_CATCH_EXCEPTIONS",
    "GTEST_REPEAT",
    "GTEST_SHUFFLE",
    "GTEST_PRINT_TIME",
    "GTEST_OUTPUT",
];

/// Command line of one worker process.
///
/// # Example
///
/// ```
/// use gtrun::job::command::WorkerCommand;
///
/// let cmd = WorkerCommand::new("./unit_test")
///     .repeat(3)
///     .filter("Suite.A")
///     .sharding(4, 1);
/// assert_eq!(
///     cmd.to_shell_string(),
///     "./unit_test --gtest_repeat=3 --gtest_filter=Suite.A"
/// );
/// assert!(cmd.env.contains(&("GTEST_SHARD_INDEX".to_string(), "1".to_string())));
/// ```
#[derive(Debug, Clone, Default)]
pub struct WorkerCommand {
    /// Wrapping tool command line, empty if none.
    pub tool: Vec<String>,

    /// Exit code the tool uses to report its own errors.
    pub tool_error_exit_code: Option<i32>,

    pub executable: PathBuf,

    /// GoogleTest flags, in command line order.
    pub args: Vec<String>,

    /// Variables set for the worker.
    pub env: Vec<(String, String)>,

    /// Variables removed from the inherited environment.
    pub env_remove: Vec<String>,
}

impl WorkerCommand {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            env_remove: SCRUBBED_ENV.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    /// Runs the executable under the given tool command line.
    ///
    /// With an error exit code, `--error-exitcode=N` is passed to the tool.
    pub fn tool(mut self, words: Vec<String>, error_exit_code: Option<i32>) -> Self {
        if words.is_empty() {
            return self;
        }
        self.tool = words;
        self.tool_error_exit_code = error_exit_code;
        if let Some(code) = error_exit_code {
            self.tool.push(format!("--error-exitcode={}", code));
        }
        self
    }

    /// Number of repetitions. The flag is omitted for a single run.
    pub fn repeat(mut self, repetitions: u32) -> Self {
        if repetitions != 1 {
            self.args.push(format!("--gtest_repeat={}", repetitions));
        }
        self
    }

    pub fn filter(mut self, filter: &str) -> Self {
        if !filter.is_empty() {
            self.args.push(format!("--gtest_filter={}", filter));
        }
        self
    }

    pub fn run_disabled(self, enable: bool) -> Self {
        self.flag(enable, "--gtest_also_run_disabled_tests")
    }

    pub fn shuffle(self, enable: bool) -> Self {
        self.flag(enable, "--gtest_shuffle")
    }

    pub fn break_on_failure(self, enable: bool) -> Self {
        self.flag(enable, "--gtest_break_on_failure")
    }

    /// Lets exceptions escape the test body so they terminate the process.
    pub fn break_on_exception(self, enable: bool) -> Self {
        self.flag(enable, "--gtest_catch_exceptions=0")
    }

    fn flag(mut self, enable: bool, flag: &str) -> Self {
        if enable {
            self.args.push(flag.to_string());
        }
        self
    }

    /// Native sharding parameters. A single shard clears them.
    pub fn sharding(mut self, count: u32, index: u32) -> Self {
        const SHARD_VARS: [&str; 2] = ["GTEST_TOTAL_SHARDS", "GTEST_SHARD_INDEX"];

        self.env.retain(|(k, _)| !SHARD_VARS.contains(&k.as_str()));
        self.env_remove.retain(|k| !SHARD_VARS.contains(&k.as_str()));
        if count > 1 {
            self.env.push((SHARD_VARS[0].to_string(), count.to_string()));
            self.env.push((SHARD_VARS[1].to_string(), index.to_string()));
        } else {
            self.env_remove.extend(SHARD_VARS.iter().map(|s| s.to_string()));
        }
        self
    }

    /// File the test executable creates at start and deletes on clean exit.
    pub fn premature_exit_file(mut self, path: &Path) -> Self {
        self.env.push((
            "TEST_PREMATURE_EXIT_FILE".to_string(),
            path.to_string_lossy().into_owned(),
        ));
        self
    }

    pub fn under_tool(&self) -> bool {
        !self.tool.is_empty()
    }

    /// Full argument vector, program first.
    pub fn argv(&self) -> Vec<OsString> {
        self.tool
            .iter()
            .map(OsString::from)
            .chain(std::iter::once(self.executable.clone().into_os_string()))
            .chain(self.args.iter().map(OsString::from))
            .collect()
    }

    /// Builds the process command with stdin detached.
    ///
    /// Output redirection is left to the caller.
    pub fn to_command(&self) -> tokio::process::Command {
        let argv = self.argv();
        let mut cmd = tokio::process::Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        for key in &self.env_remove {
            cmd.env_remove(key);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::null());
        cmd
    }

    /// Command line as it would be typed into a shell.
    pub fn to_shell_string(&self) -> String {
        let argv: Vec<String> = self
            .argv()
            .iter()
            .map(|s| s.to_string_lossy().into_owned())
            .collect();
        shell_words::join(argv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_of(cmd: &WorkerCommand) -> Vec<String> {
        cmd.argv()
            .iter()
            .map(|s| s.to_string_lossy().into_owned())
            .collect()
    }

    fn env_value<'a>(cmd: &'a WorkerCommand, key: &str) -> Option<&'a str> {
        cmd.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_minimal_command() {
        let cmd = WorkerCommand::new("/opt/unit_test").repeat(1).filter("").sharding(1, 0);

        assert_eq!(args_of(&cmd), vec!["/opt/unit_test"]);
        assert!(cmd.env.is_empty());
        assert!(cmd.env_remove.contains(&"GTEST_TOTAL_SHARDS".to_string()));
        assert!(cmd.env_remove.contains(&"GTEST_FILTER".to_string()));
        assert!(!cmd.under_tool());
    }

    #[test]
    fn test_all_flags_in_order() {
        let cmd = WorkerCommand::new("t")
            .repeat(7)
            .filter("A.*:B.*-B.slow")
            .run_disabled(true)
            .shuffle(true)
            .break_on_failure(true)
            .break_on_exception(true);

        assert_eq!(
            args_of(&cmd),
            vec![
                "t",
                "--gtest_repeat=7",
                "--gtest_filter=A.*:B.*-B.slow",
                "--gtest_also_run_disabled_tests",
                "--gtest_shuffle",
                "--gtest_break_on_failure",
                "--gtest_catch_exceptions=0",
            ]
        );
    }

    #[test]
    fn test_tool_prefix_and_error_code() {
        let words = shell_words::split("valgrind --leak-check=full").unwrap();
        let cmd = WorkerCommand::new("t").tool(words, Some(125));

        assert_eq!(
            args_of(&cmd),
            vec!["valgrind", "--leak-check=full", "--error-exitcode=125", "t"]
        );
        assert!(cmd.under_tool());
        assert_eq!(cmd.tool_error_exit_code, Some(125));

        let cmd = WorkerCommand::new("t").tool(Vec::new(), Some(125));
        assert!(!cmd.under_tool());
        assert_eq!(cmd.tool_error_exit_code, None);
    }

    #[test]
    fn test_sharding_env() {
        let cmd = WorkerCommand::new("t")
            .sharding(3, 2)
            .premature_exit_file(Path::new("/tmp/trace.4.running"));

        assert_eq!(env_value(&cmd, "GTEST_TOTAL_SHARDS"), Some("3"));
        assert_eq!(env_value(&cmd, "GTEST_SHARD_INDEX"), Some("2"));
        assert_eq!(
            env_value(&cmd, "TEST_PREMATURE_EXIT_FILE"),
            Some("/tmp/trace.4.running")
        );
        assert!(!cmd.env_remove.contains(&"GTEST_SHARD_INDEX".to_string()));
    }
}
